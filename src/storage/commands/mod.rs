//! Command descriptors and the command table
//!
//! A descriptor carries the flags the script bridge enforces: write commands
//! are gated by determinism, random commands taint the invocation, commands
//! flagged `NOSCRIPT` are refused and `SORT_FOR_SCRIPT` replies are sorted.

pub mod lua;

use std::collections::HashMap;

use super::CommandTable;

/// Command may modify the dataset
pub const CMD_WRITE: u32 = 1 << 0;
/// Command never modifies the dataset
pub const CMD_READONLY: u32 = 1 << 1;
/// Command output is not deterministic
pub const CMD_RANDOM: u32 = 1 << 2;
/// Command is not allowed from scripts
pub const CMD_NOSCRIPT: u32 = 1 << 3;
/// Reply must be sorted when called from a replicated script
pub const CMD_SORT_FOR_SCRIPT: u32 = 1 << 4;

/// Static description of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Lowercase command name
    pub name: String,
    /// Redis-style arity: positive is exact, negative is a minimum
    pub arity: i32,
    /// `CMD_*` flags
    pub flags: u32,
}

impl CommandDescriptor {
    /// Create a descriptor
    pub fn new(name: &str, arity: i32, flags: u32) -> Self {
        CommandDescriptor {
            name: name.to_ascii_lowercase(),
            arity,
            flags,
        }
    }

    /// Check a flag
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn is_write(&self) -> bool {
        self.has_flag(CMD_WRITE)
    }

    pub fn is_random(&self) -> bool {
        self.has_flag(CMD_RANDOM)
    }

    /// Check an argument count (command name included) against the arity
    pub fn accepts_arity(&self, argc: usize) -> bool {
        let argc = argc as i64;
        let arity = self.arity as i64;
        if arity >= 0 {
            argc == arity
        } else {
            argc >= -arity
        }
    }
}

/// Name-indexed command table
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandDescriptor>,
}

impl CommandRegistry {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table of the commands served by [`crate::storage::MemoryStore`]
    pub fn standard() -> Self {
        let mut table = Self::new();
        for (name, arity, flags) in [
            ("get", 2, CMD_READONLY),
            ("set", -3, CMD_WRITE),
            ("del", -2, CMD_WRITE),
            ("exists", -2, CMD_READONLY),
            ("incr", 2, CMD_WRITE),
            ("incrby", 3, CMD_WRITE),
            ("append", 3, CMD_WRITE),
            ("keys", 2, CMD_READONLY | CMD_SORT_FOR_SCRIPT),
            ("sadd", -3, CMD_WRITE),
            ("srem", -3, CMD_WRITE),
            ("smembers", 2, CMD_READONLY | CMD_SORT_FOR_SCRIPT),
            ("randomkey", 1, CMD_READONLY | CMD_RANDOM),
            ("time", 1, CMD_RANDOM),
            ("dbsize", 1, CMD_READONLY),
            ("ping", -1, 0),
            ("echo", 2, 0),
            ("select", 2, CMD_NOSCRIPT),
            ("multi", 1, CMD_NOSCRIPT),
            ("eval", -3, CMD_NOSCRIPT),
            ("evalsha", -3, CMD_NOSCRIPT),
            ("script", -2, CMD_NOSCRIPT),
        ] {
            table.register(CommandDescriptor::new(name, arity, flags));
        }
        table
    }

    /// Add or replace a command
    pub fn register(&mut self, descriptor: CommandDescriptor) {
        self.commands.insert(descriptor.name.clone(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandTable for CommandRegistry {
    fn lookup(&self, name: &[u8]) -> Option<CommandDescriptor> {
        let name = std::str::from_utf8(name).ok()?.to_ascii_lowercase();
        self.commands.get(&name).cloned()
    }
}
