//! Ferrous scripting library
//!
//! Sandboxed Lua script execution for a Redis-compatible store: the
//! interpreter bridge, the script registry and the EVAL / EVALSHA / SCRIPT
//! command handlers, plus a small in-memory store to run scripts against.

pub mod config;
pub mod error;
pub mod protocol;
pub mod scripting;
pub mod storage;

// Re-export commonly used types
pub use config::ScriptingConfig;
pub use error::{CommandError, ScriptError};
pub use protocol::RespFrame;
pub use scripting::{ClientSession, ScriptRunner, ScriptServer};
pub use storage::commands::lua::handle_lua_command;
pub use storage::{CommandRegistry, KeyLockTable, MemoryStore};
