//! Error types for the scripting subsystem
//!
//! Every error renders as the text of a Redis error reply, so the execution
//! controller can turn any failure into a single `-...` wire reply.

use crate::protocol::RespFrame;

/// Errors produced by one script invocation or by script management
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// Script body failed to compile; the script is never registered
    #[error("ERR Error compiling script (new function): {0}")]
    Compile(String),

    /// EVALSHA referenced a digest nobody registered
    #[error("NOSCRIPT No matching script. Please use EVAL.")]
    NoScript,

    /// Malformed EVAL/EVALSHA arguments (numkeys and friends)
    #[error("ERR {0}")]
    Argument(String),

    /// Key locks could not be acquired before the script started
    #[error("ERR failed to lock script keys: {0}")]
    Lock(String),

    /// Script cancelled through SCRIPT KILL
    #[error("ERR Error running script (call to {function}): Script killed by user with SCRIPT KILL...")]
    Killed {
        /// Generated function name of the cancelled script
        function: String,
    },

    /// Script cancelled because the server is stopping
    #[error("ERR Error running script (call to {function}): server stopped, script aborted")]
    ServerStopped {
        /// Generated function name of the cancelled script
        function: String,
    },

    /// Any runtime failure raised while the script body was running
    #[error("ERR Error running script (call to {function}): {message}")]
    Runtime {
        /// Generated function name of the failing script
        function: String,
        /// Message with source/line context when available
        message: String,
    },

    /// A store command produced a reply the codec could not decode
    #[error("ERR malformed reply from store: {0}")]
    MalformedReply(String),

    /// Interpreter setup or bookkeeping failure
    #[error("ERR {0}")]
    Interpreter(String),

    /// SCRIPT KILL with nothing running
    #[error("NOTBUSY No scripts in execution right now.")]
    NotBusy,

    /// SCRIPT KILL against a script that already wrote
    #[error("UNKILLABLE Sorry the script already executed write commands against the dataset. You can either wait the script termination or kill the server in a hard way using the SHUTDOWN NOSAVE command.")]
    Unkillable,
}

/// Errors reported by the store collaborators (command table, executor)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// Unknown command
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    /// Wrong number of arguments for command
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongNumberOfArgs(String),

    /// Operation against wrong type
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// Value is not an integer or out of range
    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    /// Session must authenticate first
    #[error("NOAUTH Authentication required.")]
    NoAuth,

    /// Generic command error with message
    #[error("ERR {0}")]
    Generic(String),
}

/// Wire reply that could not be decoded
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Protocol error: {0}")]
pub struct ProtocolError(pub String);

/// Type alias for Results throughout the scripting subsystem
pub type Result<T> = std::result::Result<T, ScriptError>;

impl ScriptError {
    /// Render this error as the wire reply sent back to the client
    pub fn to_frame(&self) -> RespFrame {
        // error replies are single-line
        RespFrame::error(self.to_string().replace(['\r', '\n'], " "))
    }
}

impl From<mlua::Error> for ScriptError {
    fn from(err: mlua::Error) -> Self {
        ScriptError::Interpreter(err.to_string())
    }
}

impl From<CommandError> for RespFrame {
    fn from(err: CommandError) -> Self {
        RespFrame::error(err.to_string())
    }
}
