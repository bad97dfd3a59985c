//! In-memory reference store
//!
//! Serves a small Redis command set for the fake session of a script. Every
//! reply is written as RESP bytes, exactly what a real store would hand back
//! to the bridge.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::IteratorRandom;

use crate::error::CommandError;
use crate::protocol::{serialize_to_vec, RespFrame};
use crate::scripting::session::FakeSession;

use super::{CommandDescriptor, CommandExecutor, DatabaseIndex, Key};

/// Stored value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String value (bytes)
    String(Vec<u8>),

    /// Set value (unordered unique collection)
    Set(HashSet<Vec<u8>>),
}

type Database = HashMap<Key, Value>;
type CommandResult = Result<RespFrame, CommandError>;

/// Multi-database in-memory store
pub struct MemoryStore {
    databases: Vec<RwLock<Database>>,
    requires_auth: bool,
}

impl MemoryStore {
    /// Store with `databases` logical databases
    pub fn new(databases: usize) -> Self {
        MemoryStore {
            databases: (0..databases.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            requires_auth: false,
        }
    }

    /// Reject commands from unauthenticated sessions with NOAUTH
    pub fn with_required_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn database_count(&self) -> usize {
        self.databases.len()
    }

    /// Read a string value directly, bypassing the command path
    pub fn get_string(&self, db: DatabaseIndex, key: &[u8]) -> Option<Vec<u8>> {
        let db = self.read(db).ok()?;
        match db.get(key) {
            Some(Value::String(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Write a string value directly, bypassing the command path
    pub fn set_string(&self, db: DatabaseIndex, key: &[u8], value: &[u8]) -> Result<(), CommandError> {
        self.write(db)?.insert(key.to_vec(), Value::String(value.to_vec()));
        Ok(())
    }

    fn read(&self, db: DatabaseIndex) -> Result<RwLockReadGuard<'_, Database>, CommandError> {
        self.databases
            .get(db)
            .ok_or_else(|| CommandError::Generic("DB index is out of range".into()))?
            .read()
            .map_err(|_| CommandError::Generic("database lock poisoned".into()))
    }

    fn write(&self, db: DatabaseIndex) -> Result<RwLockWriteGuard<'_, Database>, CommandError> {
        self.databases
            .get(db)
            .ok_or_else(|| CommandError::Generic("DB index is out of range".into()))?
            .write()
            .map_err(|_| CommandError::Generic("database lock poisoned".into()))
    }

    fn dispatch(&self, db: DatabaseIndex, name: &str, args: &[Vec<u8>]) -> CommandResult {
        match name {
            "get" => self.get(db, &args[1]),
            "set" => self.set(db, &args[1], &args[2]),
            "del" => self.del(db, &args[1..]),
            "exists" => self.exists(db, &args[1..]),
            "incr" => self.incr_by(db, &args[1], 1),
            "incrby" => self.incr_by(db, &args[1], parse_integer(&args[2])?),
            "append" => self.append(db, &args[1], &args[2]),
            "keys" => self.keys(db, &args[1]),
            "sadd" => self.sadd(db, &args[1], &args[2..]),
            "srem" => self.srem(db, &args[1], &args[2..]),
            "smembers" => self.smembers(db, &args[1]),
            "randomkey" => self.randomkey(db),
            "dbsize" => Ok(RespFrame::Integer(self.read(db)?.len() as i64)),
            "time" => Ok(time_reply()),
            "ping" => Ok(match args.get(1) {
                Some(msg) => RespFrame::bulk_string(msg),
                None => RespFrame::simple_string("PONG"),
            }),
            "echo" => Ok(RespFrame::bulk_string(&args[1])),
            "select" => {
                let index = parse_integer(&args[1])?;
                if index < 0 || index as usize >= self.database_count() {
                    return Err(CommandError::Generic("DB index is out of range".into()));
                }
                Ok(RespFrame::ok())
            }
            "multi" => Ok(RespFrame::ok()),
            other => Err(CommandError::Generic(format!(
                "'{}' is not supported by the in-memory store",
                other
            ))),
        }
    }

    fn get(&self, db: DatabaseIndex, key: &[u8]) -> CommandResult {
        match self.read(db)?.get(key) {
            Some(Value::String(v)) => Ok(RespFrame::bulk_string(v)),
            Some(_) => Err(CommandError::WrongType),
            None => Ok(RespFrame::null_bulk()),
        }
    }

    fn set(&self, db: DatabaseIndex, key: &[u8], value: &[u8]) -> CommandResult {
        self.write(db)?.insert(key.to_vec(), Value::String(value.to_vec()));
        Ok(RespFrame::ok())
    }

    fn del(&self, db: DatabaseIndex, keys: &[Vec<u8>]) -> CommandResult {
        let mut db = self.write(db)?;
        let removed = keys.iter().filter(|k| db.remove(k.as_slice()).is_some()).count();
        Ok(RespFrame::Integer(removed as i64))
    }

    fn exists(&self, db: DatabaseIndex, keys: &[Vec<u8>]) -> CommandResult {
        let db = self.read(db)?;
        let found = keys.iter().filter(|k| db.contains_key(k.as_slice())).count();
        Ok(RespFrame::Integer(found as i64))
    }

    fn incr_by(&self, db: DatabaseIndex, key: &[u8], delta: i64) -> CommandResult {
        let mut db = self.write(db)?;
        let current = match db.get(key) {
            Some(Value::String(v)) => parse_integer(v)?,
            Some(_) => return Err(CommandError::WrongType),
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| CommandError::Generic("increment or decrement would overflow".into()))?;
        db.insert(key.to_vec(), Value::String(next.to_string().into_bytes()));
        Ok(RespFrame::Integer(next))
    }

    fn append(&self, db: DatabaseIndex, key: &[u8], suffix: &[u8]) -> CommandResult {
        let mut db = self.write(db)?;
        let entry = db.entry(key.to_vec()).or_insert_with(|| Value::String(Vec::new()));
        match entry {
            Value::String(v) => {
                v.extend_from_slice(suffix);
                Ok(RespFrame::Integer(v.len() as i64))
            }
            _ => Err(CommandError::WrongType),
        }
    }

    fn keys(&self, db: DatabaseIndex, pattern: &[u8]) -> CommandResult {
        let db = self.read(db)?;
        let frames = db
            .keys()
            .filter(|k| glob_match(pattern, k))
            .map(RespFrame::bulk_string)
            .collect();
        Ok(RespFrame::Array(Some(frames)))
    }

    fn sadd(&self, db: DatabaseIndex, key: &[u8], members: &[Vec<u8>]) -> CommandResult {
        let mut db = self.write(db)?;
        let entry = db.entry(key.to_vec()).or_insert_with(|| Value::Set(HashSet::new()));
        match entry {
            Value::Set(set) => {
                let added = members.iter().filter(|m| set.insert(m.to_vec())).count();
                Ok(RespFrame::Integer(added as i64))
            }
            _ => Err(CommandError::WrongType),
        }
    }

    fn srem(&self, db: DatabaseIndex, key: &[u8], members: &[Vec<u8>]) -> CommandResult {
        let mut db = self.write(db)?;
        let (removed, now_empty) = match db.get_mut(key) {
            Some(Value::Set(set)) => {
                let removed = members.iter().filter(|m| set.remove(m.as_slice())).count();
                (removed, set.is_empty())
            }
            Some(_) => return Err(CommandError::WrongType),
            None => (0, false),
        };
        if now_empty {
            db.remove(key);
        }
        Ok(RespFrame::Integer(removed as i64))
    }

    fn smembers(&self, db: DatabaseIndex, key: &[u8]) -> CommandResult {
        match self.read(db)?.get(key) {
            Some(Value::Set(set)) => Ok(RespFrame::Array(Some(
                set.iter().map(RespFrame::bulk_string).collect(),
            ))),
            Some(_) => Err(CommandError::WrongType),
            None => Ok(RespFrame::Array(Some(Vec::new()))),
        }
    }

    fn randomkey(&self, db: DatabaseIndex) -> CommandResult {
        let db = self.read(db)?;
        let mut rng = rand::thread_rng();
        Ok(match db.keys().choose(&mut rng) {
            Some(key) => RespFrame::bulk_string(key),
            None => RespFrame::null_bulk(),
        })
    }
}

impl CommandExecutor for MemoryStore {
    fn execute(&self, session: &FakeSession, command: &CommandDescriptor) -> Result<Vec<u8>, CommandError> {
        if self.requires_auth && !session.is_authenticated() {
            return Err(CommandError::NoAuth);
        }
        let args = session.args();
        if !command.accepts_arity(args.len()) {
            return Err(CommandError::WrongNumberOfArgs(command.name.clone()));
        }
        let reply = self.dispatch(session.db(), &command.name, args)?;
        Ok(serialize_to_vec(&reply))
    }
}

fn parse_integer(bytes: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CommandError::NotInteger)
}

fn time_reply() -> RespFrame {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    RespFrame::array(vec![
        RespFrame::bulk_string(now.as_secs().to_string()),
        RespFrame::bulk_string(now.subsec_micros().to_string()),
    ])
}

/// Glob matching with `*` and `?`
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
