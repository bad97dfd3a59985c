//! Store collaborators used by the scripting bridge
//!
//! The bridge never touches data directly. It looks commands up in a
//! [`CommandTable`], runs them through a [`CommandExecutor`] on behalf of the
//! script's fake session, and serialises scripts that share keys through a
//! [`KeyLocker`]. This module defines those seams plus in-memory
//! implementations used by the CLI and the tests.

pub mod commands;
pub mod locks;
pub mod memory;

use std::time::Duration;

use crate::error::CommandError;
use crate::scripting::session::FakeSession;

pub use commands::{CommandDescriptor, CommandRegistry};
pub use locks::{KeyLockGuard, KeyLockTable, LockError};
pub use memory::MemoryStore;

/// Database index type
pub type DatabaseIndex = usize;

/// Key type for storage
pub type Key = Vec<u8>;

/// Command lookup by name
pub trait CommandTable: Send + Sync {
    /// Find a command by name, ignoring ASCII case
    fn lookup(&self, name: &[u8]) -> Option<CommandDescriptor>;
}

/// Runs one command for a session and returns the reply it wrote
pub trait CommandExecutor: Send + Sync {
    /// Execute `command` with the arguments held by `session`
    ///
    /// On success the returned bytes are exactly one RESP reply. Failures the
    /// command itself reports come back as `Err` and are turned into an error
    /// reply by the caller.
    fn execute(&self, session: &FakeSession, command: &CommandDescriptor) -> Result<Vec<u8>, CommandError>;
}

/// Per-key locking for script isolation
pub trait KeyLocker: Send + Sync {
    /// Lock every key in `keys` for database `db`, all or nothing
    ///
    /// The returned guard releases the keys when dropped. `timeout` bounds
    /// the wait; `None` waits until the keys are free.
    fn lock_keys(
        &self,
        db: DatabaseIndex,
        keys: &[Key],
        timeout: Option<Duration>,
    ) -> Result<KeyLockGuard, LockError>;
}
