//! Script server: state shared by every interpreter slot
//!
//! Holds the collaborators the bridge dispatches through, the script
//! registry, the server lifecycle flags and the table of scripts currently
//! running so SCRIPT KILL can reach them from another connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::ScriptingConfig;
use crate::error::{Result, ScriptError};
use crate::storage::{CommandExecutor, CommandTable, KeyLocker};

use super::registry::{ScriptEntry, ScriptRegistry};
use super::sandbox;

/// Identifier of one interpreter slot
pub type SlotId = u32;

/// Bookkeeping for a script that is currently executing
#[derive(Debug)]
pub struct RunningScript {
    slot: SlotId,
    function: String,
    started: Instant,
    kill_requested: AtomicBool,
    wrote: AtomicBool,
}

impl RunningScript {
    fn new(slot: SlotId, function: &str) -> Self {
        RunningScript {
            slot,
            function: function.to_string(),
            started: Instant::now(),
            kill_requested: AtomicBool::new(false),
            wrote: AtomicBool::new(false),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Generated function name of the script
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::Acquire)
    }

    pub fn has_written(&self) -> bool {
        self.wrote.load(Ordering::Acquire)
    }

    pub(crate) fn mark_written(&self) {
        self.wrote.store(true, Ordering::Release);
    }
}

/// Shared scripting state of one server
pub struct ScriptServer {
    config: ScriptingConfig,
    registry: ScriptRegistry,
    commands: Arc<dyn CommandTable>,
    executor: Arc<dyn CommandExecutor>,
    locker: Arc<dyn KeyLocker>,
    serving: AtomicBool,
    stopped: AtomicBool,
    active: Mutex<HashMap<SlotId, Arc<RunningScript>>>,
}

impl ScriptServer {
    /// Create a server over the given store collaborators
    pub fn new(
        config: ScriptingConfig,
        commands: Arc<dyn CommandTable>,
        executor: Arc<dyn CommandExecutor>,
        locker: Arc<dyn KeyLocker>,
    ) -> Arc<Self> {
        Arc::new(ScriptServer {
            config,
            registry: ScriptRegistry::new(),
            commands,
            executor,
            locker,
            serving: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ScriptingConfig {
        &self.config
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    pub fn commands(&self) -> &dyn CommandTable {
        self.commands.as_ref()
    }

    pub fn executor(&self) -> &dyn CommandExecutor {
        self.executor.as_ref()
    }

    pub fn locker(&self) -> &dyn KeyLocker {
        self.locker.as_ref()
    }

    pub fn is_cluster_enabled(&self) -> bool {
        self.config.cluster_enabled
    }

    /// Server finished startup and is serving requests
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }

    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::Release);
    }

    /// Ask every running script to abort at its next hook check
    pub fn stop(&self) {
        tracing::info!("scripting server stopping");
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Compile-check and register a script without running it
    pub fn script_load(&self, body: &[u8]) -> Result<String> {
        sandbox::check_syntax(body).map_err(ScriptError::Compile)?;
        let entry = self.registry.register(ScriptEntry::new(body));
        Ok(entry.content_hash().to_string())
    }

    /// Registration status of each digest, matched case-insensitively
    pub fn script_exists(&self, digests: &[String]) -> Vec<bool> {
        digests
            .iter()
            .map(|d| self.registry.contains(&d.to_ascii_lowercase()))
            .collect()
    }

    /// Forget every registered script
    pub fn script_flush(&self) {
        self.registry.flush();
        tracing::debug!("script registry flushed");
    }

    /// Flag running scripts for cancellation
    ///
    /// Scripts that already issued a write are left alone. Fails with
    /// `NotBusy` when nothing runs and `Unkillable` when every running script
    /// has written.
    pub fn script_kill(&self) -> Result<()> {
        let active = self.active();
        if active.is_empty() {
            return Err(ScriptError::NotBusy);
        }
        let mut killed = 0;
        for script in active.values().filter(|s| !s.has_written()) {
            script.kill_requested.store(true, Ordering::Release);
            killed += 1;
        }
        if killed == 0 {
            return Err(ScriptError::Unkillable);
        }
        tracing::warn!(scripts = killed, "SCRIPT KILL requested");
        Ok(())
    }

    /// Number of scripts currently executing
    pub fn running_scripts(&self) -> usize {
        self.active().len()
    }

    /// Record that `slot` started running `function`
    pub(crate) fn begin_script(&self, slot: SlotId, function: &str) -> Arc<RunningScript> {
        let script = Arc::new(RunningScript::new(slot, function));
        self.active().insert(slot, Arc::clone(&script));
        script
    }

    pub(crate) fn end_script(&self, slot: SlotId) {
        self.active().remove(&slot);
    }

    fn active(&self) -> MutexGuard<'_, HashMap<SlotId, Arc<RunningScript>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ScriptServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptServer")
            .field("config", &self.config)
            .field("scripts", &self.registry.len())
            .field("serving", &self.is_serving())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CommandRegistry, KeyLockTable, MemoryStore};

    fn server() -> Arc<ScriptServer> {
        ScriptServer::new(
            ScriptingConfig::default(),
            Arc::new(CommandRegistry::standard()),
            Arc::new(MemoryStore::new(16)),
            Arc::new(KeyLockTable::new()),
        )
    }

    #[test]
    fn test_script_load_and_exists() {
        let server = server();
        let digest = server.script_load(b"return 1").unwrap();
        assert_eq!(digest, "e0e1f9fabfc9d4800c877a703b823ac0578ff8db");

        let exists = server.script_exists(&[digest.to_uppercase(), "ffff".to_string()]);
        assert_eq!(exists, vec![true, false]);

        server.script_flush();
        assert_eq!(server.script_exists(&[digest]), vec![false]);
    }

    #[test]
    fn test_script_load_rejects_bad_syntax() {
        let server = server();
        let err = server.script_load(b"return +").unwrap_err();
        assert!(matches!(err, ScriptError::Compile(_)));
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_script_kill_states() {
        let server = server();
        assert!(matches!(server.script_kill(), Err(ScriptError::NotBusy)));

        let writer = server.begin_script(1, "f_writer");
        writer.mark_written();
        assert!(matches!(server.script_kill(), Err(ScriptError::Unkillable)));

        let reader = server.begin_script(2, "f_reader");
        server.script_kill().unwrap();
        assert!(reader.kill_requested());
        assert!(!writer.kill_requested());

        server.end_script(1);
        server.end_script(2);
        assert_eq!(server.running_scripts(), 0);
    }

    #[test]
    fn test_stop_flag() {
        let server = server();
        assert!(!server.is_stopped());
        server.stop();
        assert!(server.is_stopped());
    }
}
