//! Client sessions as seen by the scripting bridge
//!
//! [`ClientSession`] is a snapshot of the real connection that invoked a
//! script. [`FakeSession`] is the long-lived pseudo-client every `redis.call`
//! runs on; before each call it is brought in line with the caller.

use crate::storage::DatabaseIndex;

/// Session is in read-only cluster mode
pub const CLIENT_READONLY: u32 = 1 << 0;
/// Session sent ASKING for the next command
pub const CLIENT_ASKING: u32 = 1 << 1;
/// Session is inside MULTI
pub const CLIENT_MULTI: u32 = 1 << 2;
/// Session is the replication link from our master
pub const CLIENT_MASTER: u32 = 1 << 3;
/// Session is the scripting pseudo-client
pub const CLIENT_SCRIPT: u32 = 1 << 4;

/// Caller state a script invocation runs on behalf of
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSession {
    /// Connection has authenticated
    pub authenticated: bool,
    /// Selected database
    pub db: DatabaseIndex,
    /// `CLIENT_*` flags
    pub flags: u32,
}

impl ClientSession {
    /// Authenticated session on database 0
    pub fn new() -> Self {
        ClientSession {
            authenticated: true,
            db: 0,
            flags: 0,
        }
    }

    pub fn with_db(mut self, db: DatabaseIndex) -> Self {
        self.db = db;
        self
    }

    pub fn with_authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn in_multi(&self) -> bool {
        self.has_flag(CLIENT_MULTI)
    }
}

/// Pseudo-client used to run commands issued by scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeSession {
    authenticated: bool,
    db: DatabaseIndex,
    flags: u32,
    args: Vec<Vec<u8>>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSession {
    /// Unauthenticated session on database 0
    pub fn new() -> Self {
        FakeSession {
            authenticated: false,
            db: 0,
            flags: CLIENT_SCRIPT,
            args: Vec::new(),
        }
    }

    /// Align authentication, database and MULTI state with the caller
    ///
    /// Authentication is only ever granted, never revoked: once a caller has
    /// authenticated the fake session, it stays authenticated.
    pub fn sync_from(&mut self, caller: &ClientSession) {
        if !self.authenticated && caller.authenticated {
            self.authenticated = true;
        }
        if self.db != caller.db {
            self.db = caller.db;
        }
        if caller.in_multi() {
            self.flags |= CLIENT_MULTI;
        } else {
            self.flags &= !CLIENT_MULTI;
        }
    }

    /// Copy the caller's cluster routing flags for the next command
    pub fn inherit_cluster_flags(&mut self, caller: &ClientSession) {
        self.flags &= !(CLIENT_READONLY | CLIENT_ASKING);
        self.flags |= caller.flags & (CLIENT_READONLY | CLIENT_ASKING);
    }

    /// Replace the argument vector of the next command
    pub fn set_args(&mut self, args: Vec<Vec<u8>>) {
        self.args = args;
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    pub fn db(&self) -> DatabaseIndex {
        self.db
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}
