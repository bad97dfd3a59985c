//! Configuration file parser
//!
//! Parses the scripting-related parameters of a Redis-compatible
//! configuration file.

use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use super::ScriptingConfig;

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid line format
    #[error("Invalid line format at line {0}: {1}")]
    Format(usize, String),

    /// Invalid parameter value
    #[error("Invalid value for parameter '{0}' at line {1}: {2}")]
    Value(String, usize, String),

    /// Unknown parameter
    #[error("Unknown parameter '{0}' at line {1}")]
    UnknownParam(String, usize),
}

/// Parse a Redis-compatible configuration file
pub fn parse_config_file(path: &Path) -> Result<ScriptingConfig, ConfigParseError> {
    let text = fs::read_to_string(path)?;
    parse_config_str(&text)
}

/// Parse configuration text
pub fn parse_config_str(text: &str) -> Result<ScriptingConfig, ConfigParseError> {
    let mut config = ScriptingConfig::default();

    for (line_num, line) in text.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(2, char::is_whitespace);
        let param = parts.next().unwrap_or_default().to_lowercase();
        let value = match parts.next() {
            Some(value) if !value.trim().is_empty() => value.trim(),
            _ => return Err(ConfigParseError::Format(line_num + 1, line.to_string())),
        };

        apply_config_param(&mut config, &param, value, line_num + 1)?;
    }

    Ok(config)
}

/// Apply a configuration parameter to the config
fn apply_config_param(
    config: &mut ScriptingConfig,
    param: &str,
    value: &str,
    line_num: usize,
) -> Result<(), ConfigParseError> {
    match param {
        "lua-time-limit" => {
            config.time_limit_ms = parse_value(param, value, line_num)?;
        }
        "lua-hook-interval" => {
            let interval: u32 = parse_value(param, value, line_num)?;
            if interval == 0 {
                return Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string()));
            }
            config.hook_interval = interval;
        }
        "lua-replicate-commands" => {
            config.always_replicate_commands = parse_yes_no(param, value, line_num)?;
        }
        "cluster-enabled" => {
            config.cluster_enabled = parse_yes_no(param, value, line_num)?;
        }
        "lua-lock-timeout" => {
            config.lock_timeout_ms = parse_value(param, value, line_num)?;
        }
        _ => return Err(ConfigParseError::UnknownParam(param.to_string(), line_num)),
    }

    Ok(())
}

/// Parse a value that implements FromStr
fn parse_value<T: FromStr>(param: &str, value: &str, line_num: usize) -> Result<T, ConfigParseError> {
    value.parse::<T>()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))
}

/// Parse a yes/no value
fn parse_yes_no(param: &str, value: &str, line_num: usize) -> Result<bool, ConfigParseError> {
    match value.to_lowercase().as_str() {
        "yes" | "1" => Ok(true),
        "no" | "0" => Ok(false),
        _ => Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string())),
    }
}
