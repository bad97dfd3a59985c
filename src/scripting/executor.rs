//! Script execution on one interpreter slot
//!
//! A [`ScriptRunner`] owns one sandboxed interpreter. EVAL compiles the body
//! into a global function named `f_<sha1>` the first time the slot sees it;
//! EVALSHA runs a registered script, compiling it from the shared registry
//! when this slot has not seen it yet. Each invocation locks its declared
//! keys, binds `KEYS` / `ARGV`, and runs under an instruction-count hook
//! that watches for slow scripts, SCRIPT KILL and server shutdown.
//!
//! Interpreters are not `Send`: create one runner per worker thread.

use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use mlua::{Function, HookTriggers, Lua, Value, VmState};

use crate::error::{Result, ScriptError};
use crate::protocol::RespFrame;

use super::bridge;
use super::codec;
use super::registry::ScriptEntry;
use super::sandbox::{self, SCRIPT_CHUNK_NAME};
use super::server::{ScriptServer, SlotId};
use super::session::ClientSession;
use super::state::{self, slot_context, InvocationOutcome, SlotContext};

/// One interpreter slot
pub struct ScriptRunner {
    lua: Lua,
    context: Rc<SlotContext>,
    compiled: HashSet<String>,
    registry_generation: u64,
    last_outcome: InvocationOutcome,
}

impl ScriptRunner {
    /// Build a sandboxed interpreter for `slot`
    pub fn new(server: Arc<ScriptServer>, slot: SlotId) -> Result<Self> {
        let lua = sandbox::open_interpreter()?;
        bridge::install(&lua)?;
        sandbox::seal(&lua)?;

        let registry_generation = server.registry().generation();
        let context = Rc::new(SlotContext::new(server, slot));
        state::attach(&lua, Rc::clone(&context));
        tracing::debug!(slot, "script interpreter ready");

        Ok(ScriptRunner {
            lua,
            context,
            compiled: HashSet::new(),
            registry_generation,
            last_outcome: InvocationOutcome::default(),
        })
    }

    pub fn slot(&self) -> SlotId {
        self.context.slot
    }

    pub fn server(&self) -> &Arc<ScriptServer> {
        &self.context.server
    }

    /// Dirty and timeout flags of the most recent invocation
    pub fn last_outcome(&self) -> InvocationOutcome {
        self.last_outcome
    }

    /// Run `body` with the first `numkeys` of `params` as KEYS, the rest as ARGV
    pub fn eval(
        &mut self,
        caller: &ClientSession,
        body: &[u8],
        numkeys: &[u8],
        params: &[Vec<u8>],
    ) -> Result<RespFrame> {
        let split = parse_numkeys(numkeys, params.len())?;
        self.forget_flushed()?;

        let entry = ScriptEntry::new(body);
        if !self.compiled.contains(entry.generated_name()) {
            self.compile(&entry)?;
        }
        let entry = self.context.server.registry().register(entry);
        let (keys, argv) = params.split_at(split);
        self.run(caller, entry.generated_name(), keys, argv)
    }

    /// Run a registered script by its content hash
    pub fn evalsha(
        &mut self,
        caller: &ClientSession,
        digest: &str,
        numkeys: &[u8],
        params: &[Vec<u8>],
    ) -> Result<RespFrame> {
        let split = parse_numkeys(numkeys, params.len())?;
        self.forget_flushed()?;

        let entry = self
            .context
            .server
            .registry()
            .get(&digest.to_ascii_lowercase())
            .ok_or(ScriptError::NoScript)?;
        if !self.compiled.contains(entry.generated_name()) {
            self.compile(&entry)?;
        }
        let (keys, argv) = params.split_at(split);
        self.run(caller, entry.generated_name(), keys, argv)
    }

    /// Define the script's function in this interpreter
    fn compile(&mut self, entry: &ScriptEntry) -> Result<()> {
        let name = entry.generated_name();
        sandbox::compile_check(&self.lua, entry.body()).map_err(|message| {
            tracing::debug!(function = name, error = %message, "script failed to compile");
            ScriptError::Compile(message)
        })?;

        let mut source = Vec::with_capacity(entry.body().len() + name.len() + 16);
        source.extend_from_slice(b"function ");
        source.extend_from_slice(name.as_bytes());
        source.extend_from_slice(b"() ");
        source.extend_from_slice(entry.body());
        source.extend_from_slice(b"\nend");
        self.lua
            .load(source)
            .set_name(SCRIPT_CHUNK_NAME)
            .exec()
            .map_err(|e| ScriptError::Compile(error_message(&e)))?;

        self.compiled.insert(name.to_string());
        Ok(())
    }

    /// Drop functions compiled before the last SCRIPT FLUSH
    fn forget_flushed(&mut self) -> Result<()> {
        let generation = self.context.server.registry().generation();
        if generation == self.registry_generation {
            return Ok(());
        }
        let globals = self.lua.globals();
        for name in self.compiled.drain() {
            globals.raw_set(name, Value::Nil)?;
        }
        self.registry_generation = generation;
        Ok(())
    }

    fn bind_arguments(&self, keys: &[Vec<u8>], argv: &[Vec<u8>]) -> Result<()> {
        let globals = self.lua.globals();
        for (name, values) in [("KEYS", keys), ("ARGV", argv)] {
            let table = self.lua.create_table_with_capacity(values.len(), 0)?;
            for (i, value) in values.iter().enumerate() {
                table.raw_set(i + 1, self.lua.create_string(value)?)?;
            }
            globals.raw_set(name, table)?;
        }
        Ok(())
    }

    fn run(
        &mut self,
        caller: &ClientSession,
        function_name: &str,
        keys: &[Vec<u8>],
        argv: &[Vec<u8>],
    ) -> Result<RespFrame> {
        let function: Function = self.lua.globals().raw_get(function_name)?;
        self.bind_arguments(keys, argv)?;

        let server = Arc::clone(&self.context.server);
        let config = server.config();
        let _locks = server
            .locker()
            .lock_keys(caller.db, keys, config.lock_timeout())
            .map_err(|e| {
                tracing::warn!(function = function_name, error = %e, "could not lock script keys");
                ScriptError::Lock(e.to_string())
            })?;

        let single_command = config.always_replicate_commands;
        let seed = if single_command { rand::random::<i32>() } else { 0 };
        let running = server.begin_script(self.context.slot, function_name);
        self.context
            .state
            .borrow_mut()
            .begin(caller.clone(), single_command, seed, running);

        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(config.hook_interval.max(1)),
            |lua, _debug| check_cancellation(lua),
        );
        // the reply is converted while the script still counts as running
        let result = function
            .call::<Value>(())
            .and_then(|value| codec::lua_to_frame(&value));
        self.lua.remove_hook();
        server.end_script(self.context.slot);

        let abort = self.context.state.borrow_mut().abort.take();
        let reply = match (abort, result) {
            (Some(err), _) => Err(err),
            (None, Ok(frame)) => Ok(frame),
            (None, Err(e)) => Err(runtime_error(function_name, &e)),
        };

        self.last_outcome = self.context.state.borrow_mut().finish();
        if self.last_outcome.timed_out {
            tracing::warn!(function = function_name, "slow script finished");
        }
        if let Err(err) = &reply {
            tracing::debug!(function = function_name, error = %err, "script failed");
        }
        reply
    }
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("slot", &self.context.slot)
            .field("compiled", &self.compiled.len())
            .finish()
    }
}

/// Hook body: slow-script report, SCRIPT KILL and server shutdown
fn check_cancellation(lua: &Lua) -> mlua::Result<VmState> {
    let context = slot_context(lua)?;
    let mut state = context.state.borrow_mut();

    if let Some(abort) = &state.abort {
        return Err(mlua::Error::RuntimeError(abort.to_string()));
    }
    let running = match &state.running {
        Some(running) => Arc::clone(running),
        None => return Ok(VmState::Continue),
    };

    if let Some(limit) = context.server.config().time_limit() {
        let elapsed = running.elapsed();
        if elapsed >= limit && !state.timed_out {
            tracing::warn!(
                "Lua slow script detected: still in execution after {} milliseconds. \
                 You can try killing the script using the SCRIPT KILL command.",
                elapsed.as_millis()
            );
            state.timed_out = true;
        }
    }

    let abort = if running.kill_requested() {
        tracing::warn!(function = running.function(), "Lua script killed by user with SCRIPT KILL.");
        ScriptError::Killed {
            function: running.function().to_string(),
        }
    } else if context.server.is_stopped() {
        tracing::warn!(function = running.function(), "server stopped, Lua script need quit.");
        ScriptError::ServerStopped {
            function: running.function().to_string(),
        }
    } else {
        return Ok(VmState::Continue);
    };
    let message = abort.to_string();
    state.abort = Some(abort);
    Err(mlua::Error::RuntimeError(message))
}

fn runtime_error(function: &str, err: &mlua::Error) -> ScriptError {
    ScriptError::Runtime {
        function: function.to_string(),
        message: error_message(err),
    }
}

/// Innermost message of an interpreter error
fn error_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => error_message(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Validate the key count of EVAL / EVALSHA against the parameters given
fn parse_numkeys(numkeys: &[u8], available: usize) -> Result<usize> {
    let count = std::str::from_utf8(numkeys)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ScriptError::Argument("value is not an integer or out of range".into()))?;
    if count > available as i64 {
        return Err(ScriptError::Argument(
            "Number of keys can't be greater than number of args".into(),
        ));
    }
    if count < 0 {
        return Err(ScriptError::Argument("Number of keys can't be negative".into()));
    }
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptingConfig;
    use crate::storage::{CommandRegistry, KeyLockTable, MemoryStore};

    fn runner_with(config: ScriptingConfig) -> (ScriptRunner, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(16));
        let server = ScriptServer::new(
            config,
            Arc::new(CommandRegistry::standard()),
            Arc::clone(&store) as Arc<dyn crate::storage::CommandExecutor>,
            Arc::new(KeyLockTable::new()),
        );
        (ScriptRunner::new(server, 0).unwrap(), store)
    }

    fn runner() -> ScriptRunner {
        runner_with(ScriptingConfig::default()).0
    }

    fn eval(runner: &mut ScriptRunner, body: &str, numkeys: usize, params: &[&str]) -> Result<RespFrame> {
        let params: Vec<Vec<u8>> = params.iter().map(|p| p.as_bytes().to_vec()).collect();
        runner.eval(
            &ClientSession::new(),
            body.as_bytes(),
            numkeys.to_string().as_bytes(),
            &params,
        )
    }

    #[test]
    fn test_parse_numkeys() {
        assert_eq!(parse_numkeys(b"0", 0).unwrap(), 0);
        assert_eq!(parse_numkeys(b"2", 3).unwrap(), 2);
        assert_eq!(
            parse_numkeys(b"4", 3).unwrap_err().to_string(),
            "ERR Number of keys can't be greater than number of args"
        );
        assert_eq!(
            parse_numkeys(b"-1", 3).unwrap_err().to_string(),
            "ERR Number of keys can't be negative"
        );
        assert_eq!(
            parse_numkeys(b"x", 3).unwrap_err().to_string(),
            "ERR value is not an integer or out of range"
        );
    }

    #[test]
    fn test_keys_and_argv() {
        let mut runner = runner();
        let reply = eval(&mut runner, "return {KEYS[1], KEYS[2], ARGV[1]}", 2, &["a", "b", "c"]).unwrap();
        assert_eq!(
            reply,
            RespFrame::array(vec![
                RespFrame::bulk_string("a"),
                RespFrame::bulk_string("b"),
                RespFrame::bulk_string("c"),
            ])
        );
        let reply = eval(&mut runner, "return #KEYS + #ARGV", 0, &[]).unwrap();
        assert_eq!(reply, RespFrame::Integer(0));
    }

    #[test]
    fn test_function_naming() {
        let mut runner = runner();
        eval(&mut runner, "return 1", 0, &[]).unwrap();
        let name = "f_e0e1f9fabfc9d4800c877a703b823ac0578ff8db";
        assert!(runner.compiled.contains(name));
        let f: Value = runner.lua.globals().raw_get(name).unwrap();
        assert!(matches!(f, Value::Function(_)));
    }

    #[test]
    fn test_compile_error() {
        let mut runner = runner();
        let err = eval(&mut runner, "return +", 0, &[]).unwrap_err();
        assert!(matches!(err, ScriptError::Compile(_)));
        assert!(err.to_string().starts_with("ERR Error compiling script"));
        assert!(runner.server().registry().is_empty());
    }

    #[test]
    fn test_runtime_error_names_function() {
        let mut runner = runner();
        let err = eval(&mut runner, "error('boom')", 0, &[]).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("ERR Error running script (call to f_"), "{text}");
        assert!(text.ends_with("user_script:1: boom"), "{text}");
    }

    #[test]
    fn test_evalsha_after_flush_is_noscript() {
        let mut runner = runner();
        eval(&mut runner, "return 'cached'", 0, &[]).unwrap();
        let digest = crate::scripting::registry::sha1hex(b"return 'cached'");

        let reply = runner
            .evalsha(&ClientSession::new(), &digest.to_uppercase(), b"0", &[])
            .unwrap();
        assert_eq!(reply, RespFrame::bulk_string("cached"));

        runner.server().script_flush();
        let err = runner.evalsha(&ClientSession::new(), &digest, b"0", &[]).unwrap_err();
        assert!(matches!(err, ScriptError::NoScript));
        assert!(runner.compiled.is_empty());
    }

    #[test]
    fn test_rng_reseeded_each_invocation() {
        let mut runner = runner();
        let body = "return {math.random(1000), math.random(1000), math.random(1000)}";
        let first = eval(&mut runner, body, 0, &[]).unwrap();
        let second = eval(&mut runner, body, 0, &[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_outcome_flags() {
        let (mut runner, store) = runner_with(ScriptingConfig::default());
        eval(&mut runner, "return redis.call('get', KEYS[1])", 1, &["k"]).unwrap();
        assert_eq!(runner.last_outcome(), InvocationOutcome::default());

        eval(&mut runner, "return redis.call('set', KEYS[1], 'v')", 1, &["k"]).unwrap();
        assert!(runner.last_outcome().write_dirty);
        assert!(!runner.last_outcome().random_dirty);
        assert_eq!(store.get_string(0, b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_returned_metatable_is_not_consulted() {
        let (mut runner, store) = runner_with(ScriptingConfig::default());
        let body = "return setmetatable({}, {__index = function() redis.call('set', 'sneaky', 'x') return 1 end})";
        let reply = eval(&mut runner, body, 0, &[]).unwrap();
        assert_eq!(reply, RespFrame::array(vec![]));
        assert!(!runner.last_outcome().write_dirty);
        assert_eq!(store.get_string(0, b"sneaky"), None);

        let body = "return setmetatable({'a'}, {__index = function() while true do end end})";
        let reply = eval(&mut runner, body, 0, &[]).unwrap();
        assert_eq!(reply, RespFrame::array(vec![RespFrame::bulk_string("a")]));
        assert_eq!(runner.server().running_scripts(), 0);
    }

    #[test]
    fn test_nested_bridge_call_is_refused() {
        let (runner, store) = runner_with(ScriptingConfig::default());
        let _busy = runner.context.enter_bridge().unwrap();

        let err = runner
            .lua
            .load("return redis.pcall('set', 'k', 'v')")
            .eval::<Value>()
            .unwrap_err();
        assert!(err.to_string().contains("recursive call detected"), "{err}");

        // a script-level pcall sees the failure but the command still never runs
        let caught: String = runner
            .lua
            .load("local ok, e = pcall(redis.call, 'set', 'k', 'v') return tostring(ok) .. ' ' .. tostring(e)")
            .eval()
            .unwrap();
        assert!(caught.starts_with("false "), "{caught}");
        assert!(caught.contains("recursive call detected"), "{caught}");
        assert_eq!(store.get_string(0, b"k"), None);
    }

    #[test]
    fn test_server_stop_aborts_script() {
        let config = ScriptingConfig {
            hook_interval: 10,
            ..ScriptingConfig::default()
        };
        let (mut runner, _) = runner_with(config);
        runner.server().stop();
        let err = eval(&mut runner, "while true do end", 0, &[]).unwrap_err();
        assert!(matches!(err, ScriptError::ServerStopped { .. }), "{err}");
        assert_eq!(runner.server().running_scripts(), 0);
    }

    #[test]
    fn test_cancellation_survives_script_pcall() {
        let config = ScriptingConfig {
            hook_interval: 10,
            ..ScriptingConfig::default()
        };
        let (mut runner, _) = runner_with(config);
        runner.server().stop();
        let body = "while true do pcall(function() for i = 1, 100 do end end) end";
        let err = eval(&mut runner, body, 0, &[]).unwrap_err();
        assert!(matches!(err, ScriptError::ServerStopped { .. }), "{err}");
    }

    #[test]
    fn test_slow_script_flag() {
        let config = ScriptingConfig {
            time_limit_ms: 1,
            hook_interval: 100,
            ..ScriptingConfig::default()
        };
        let (mut runner, _) = runner_with(config);
        let body = "local t = redis.call('time') local n = 0 for i = 1, 3000000 do n = n + i end return 1";
        eval(&mut runner, body, 0, &[]).unwrap();
        assert!(runner.last_outcome().timed_out);
        assert!(runner.last_outcome().random_dirty);
    }
}
