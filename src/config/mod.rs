//! Configuration for the scripting subsystem
//!
//! Settings are plain data with Redis-compatible defaults and can be loaded
//! from a Redis-style configuration file.

mod parser;

pub use parser::{parse_config_file, parse_config_str, ConfigParseError};

use std::path::Path;
use std::time::Duration;

/// Scripting configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptingConfig {
    /// Milliseconds a script may run before it is reported as slow (0 = never)
    pub time_limit_ms: u64,

    /// Instructions between two runs of the cancellation hook
    pub hook_interval: u32,

    /// Replicate the commands a script issues instead of the script itself
    pub always_replicate_commands: bool,

    /// Node is part of a cluster
    pub cluster_enabled: bool,

    /// Milliseconds to wait for script key locks (0 = wait forever)
    pub lock_timeout_ms: u64,
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        ScriptingConfig {
            time_limit_ms: 5000,
            hook_interval: 100_000,
            always_replicate_commands: false,
            cluster_enabled: false,
            lock_timeout_ms: 0,
        }
    }
}

impl ScriptingConfig {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigParseError> {
        parse_config_file(path.as_ref())
    }

    /// Slow-script threshold, if enabled
    pub fn time_limit(&self) -> Option<Duration> {
        (self.time_limit_ms > 0).then(|| Duration::from_millis(self.time_limit_ms))
    }

    /// Key lock acquisition timeout, if bounded
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }

    /// Get a configuration parameter by name
    pub fn get(&self, param: &str) -> Option<String> {
        let yes_no = |b: bool| if b { "yes" } else { "no" }.to_string();
        match param {
            "lua-time-limit" => Some(self.time_limit_ms.to_string()),
            "lua-hook-interval" => Some(self.hook_interval.to_string()),
            "lua-replicate-commands" => Some(yes_no(self.always_replicate_commands)),
            "cluster-enabled" => Some(yes_no(self.cluster_enabled)),
            "lua-lock-timeout" => Some(self.lock_timeout_ms.to_string()),
            _ => None,
        }
    }
}
