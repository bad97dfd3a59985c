//! Per-slot execution state reachable from bridge callbacks
//!
//! The interpreter stores an `Rc<SlotContext>` as typed app data; callbacks
//! and the cancellation hook fetch it back from the `Lua` handle they are
//! given, so the owning slot is found without any global lookup.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use mlua::Lua;

use crate::error::ScriptError;

use super::rand::Lrand48;
use super::server::{RunningScript, ScriptServer, SlotId};
use super::session::{ClientSession, FakeSession};

/// Outcome flags of the last invocation on a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationOutcome {
    /// The script issued at least one write command
    pub write_dirty: bool,
    /// The script issued at least one non-deterministic command
    pub random_dirty: bool,
    /// The script ran past the slow-script threshold
    pub timed_out: bool,
}

/// Mutable state of the invocation in progress
#[derive(Debug, Default)]
pub(crate) struct ExecutionState {
    pub caller: Option<ClientSession>,
    pub rng: Lrand48,
    pub random_dirty: bool,
    pub write_dirty: bool,
    pub single_command_replication: bool,
    pub timed_out: bool,
    /// Set when the invocation must fail no matter what the script does
    pub abort: Option<ScriptError>,
    pub running: Option<Arc<RunningScript>>,
}

impl ExecutionState {
    /// Reset for a new invocation
    pub fn begin(
        &mut self,
        caller: ClientSession,
        single_command_replication: bool,
        seed: i32,
        running: Arc<RunningScript>,
    ) {
        self.caller = Some(caller);
        self.rng.seed(seed);
        self.random_dirty = false;
        self.write_dirty = false;
        self.single_command_replication = single_command_replication;
        self.timed_out = false;
        self.abort = None;
        self.running = Some(running);
    }

    /// Drop the per-invocation references, keeping the outcome flags
    pub fn finish(&mut self) -> InvocationOutcome {
        self.caller = None;
        self.running = None;
        self.outcome()
    }

    pub fn outcome(&self) -> InvocationOutcome {
        InvocationOutcome {
            write_dirty: self.write_dirty,
            random_dirty: self.random_dirty,
            timed_out: self.timed_out,
        }
    }
}

/// Everything a callback needs to know about its slot
pub(crate) struct SlotContext {
    pub server: Arc<ScriptServer>,
    pub slot: SlotId,
    busy: Cell<bool>,
    pub state: RefCell<ExecutionState>,
    pub fake: RefCell<Option<FakeSession>>,
}

impl SlotContext {
    pub fn new(server: Arc<ScriptServer>, slot: SlotId) -> Self {
        SlotContext {
            server,
            slot,
            busy: Cell::new(false),
            state: RefCell::new(ExecutionState::default()),
            fake: RefCell::new(None),
        }
    }

    /// Mark the bridge busy; `None` when a bridge call is already running
    pub fn enter_bridge(&self) -> Option<BusyGuard<'_>> {
        if self.busy.replace(true) {
            None
        } else {
            Some(BusyGuard { flag: &self.busy })
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }
}

/// Clears the bridge busy flag when dropped
pub(crate) struct BusyGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

struct SlotHandle(Rc<SlotContext>);

/// Bind `context` to the interpreter
pub(crate) fn attach(lua: &Lua, context: Rc<SlotContext>) {
    lua.set_app_data(SlotHandle(context));
}

/// Slot the interpreter belongs to
pub(crate) fn slot_context(lua: &Lua) -> mlua::Result<Rc<SlotContext>> {
    lua.app_data_ref::<SlotHandle>()
        .map(|handle| Rc::clone(&handle.0))
        .ok_or_else(|| mlua::Error::RuntimeError("interpreter is not bound to a script slot".into()))
}
