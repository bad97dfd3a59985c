//! Lua scripting bridge
//!
//! Scripts run inside per-slot sandboxed Lua 5.1 interpreters and reach the
//! store only through `redis.call` / `redis.pcall`, which impersonate a
//! client through a fake session. Replies cross the boundary through the
//! codec in both directions.

pub mod bridge;
pub mod codec;
pub mod executor;
mod packing;
pub mod rand;
pub mod registry;
pub mod sandbox;
pub mod server;
pub mod session;
mod state;

pub use executor::ScriptRunner;
pub use rand::Lrand48;
pub use registry::{ScriptEntry, ScriptRegistry};
pub use server::{RunningScript, ScriptServer, SlotId};
pub use session::{ClientSession, FakeSession};
pub use state::InvocationOutcome;
