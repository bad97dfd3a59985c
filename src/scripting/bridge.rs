//! Functions scripts use to reach the store
//!
//! Installs the `redis` table (`call`, `pcall`, `log`, `sha1hex`,
//! `error_reply`, `status_reply`, `replicate_commands` and the `LOG_*`
//! levels) and replaces `math.random` / `math.randomseed` with the
//! per-slot deterministic generator.

use std::sync::Arc;

use mlua::{Lua, MultiValue, Table, Value};

use crate::error::{CommandError, ScriptError};
use crate::protocol::{decode_reply, RespFrame};
use crate::storage::commands::{CMD_NOSCRIPT, CMD_SORT_FOR_SCRIPT};

use super::codec::{self, format_number};
use super::registry;
use super::session::{FakeSession, CLIENT_MASTER};
use super::state::slot_context;

const RECURSION_ERROR: &str =
    "redis.call() recursive call detected. Are you doing funny stuff with Lua debug hooks?";
const NO_ARGUMENTS_ERROR: &str = "Please specify at least one argument for redis.call()";
const ARGUMENT_TYPE_ERROR: &str = "Lua redis() command arguments must be strings or integers";
const NOSCRIPT_ERROR: &str = "This Redis command is not allowed from scripts";
const DETERMINISM_ERROR: &str = "Write commands not allowed after non deterministic commands. \
    Call redis.replicate_commands() at the start of your script in order to switch to \
    single commands replication mode.";

pub const LOG_DEBUG: i64 = 0;
pub const LOG_VERBOSE: i64 = 1;
pub const LOG_NOTICE: i64 = 2;
pub const LOG_WARNING: i64 = 3;

/// Install the `redis` table and the deterministic `math.random`
pub(crate) fn install(lua: &Lua) -> mlua::Result<()> {
    let redis = lua.create_table()?;
    redis.raw_set(
        "call",
        lua.create_function(|lua, args: MultiValue| generic_command(lua, args, true))?,
    )?;
    redis.raw_set(
        "pcall",
        lua.create_function(|lua, args: MultiValue| generic_command(lua, args, false))?,
    )?;
    redis.raw_set("log", lua.create_function(log)?)?;
    redis.raw_set("LOG_DEBUG", LOG_DEBUG)?;
    redis.raw_set("LOG_VERBOSE", LOG_VERBOSE)?;
    redis.raw_set("LOG_NOTICE", LOG_NOTICE)?;
    redis.raw_set("LOG_WARNING", LOG_WARNING)?;
    redis.raw_set("sha1hex", lua.create_function(sha1hex)?)?;
    redis.raw_set(
        "error_reply",
        lua.create_function(|lua, args: MultiValue| single_field_table(lua, args, "err"))?,
    )?;
    redis.raw_set(
        "status_reply",
        lua.create_function(|lua, args: MultiValue| single_field_table(lua, args, "ok"))?,
    )?;
    redis.raw_set("replicate_commands", lua.create_function(replicate_commands)?)?;
    lua.globals().raw_set("redis", redis)?;

    let math: Table = lua.globals().raw_get("math")?;
    math.raw_set("random", lua.create_function(math_random)?)?;
    math.raw_set("randomseed", lua.create_function(math_randomseed)?)?;

    guard_protected_calls(lua)
}

const PROTECTED_CALL_GUARD: &str = r#"
local check = ...
local raw_pcall, raw_xpcall = pcall, xpcall
local function pass(...) check() return ... end
pcall = function(...) return pass(raw_pcall(...)) end
xpcall = function(...) return pass(raw_xpcall(...)) end
if coroutine then
    local raw_resume = coroutine.resume
    coroutine.resume = function(...) return pass(raw_resume(...)) end
end
"#;

/// Re-raise a pending abort as soon as a protected call returns
///
/// The cancellation hook fires on an instruction count, so it can keep
/// landing inside a `pcall` the script loops on. Checking again when the
/// protected call returns puts the error outside every catch.
fn guard_protected_calls(lua: &Lua) -> mlua::Result<()> {
    let check = lua.create_function(|lua, ()| {
        let slot = slot_context(lua)?;
        let state = slot.state.borrow();
        match &state.abort {
            Some(abort) => Err(mlua::Error::RuntimeError(abort.to_string())),
            None => Ok(()),
        }
    })?;
    lua.load(PROTECTED_CALL_GUARD)
        .set_name("=protected_calls")
        .call::<()>(check)
}

/// Shared body of `redis.call` (`raise_error`) and `redis.pcall`
fn generic_command(lua: &Lua, args: MultiValue, raise_error: bool) -> mlua::Result<Value> {
    let slot = slot_context(lua)?;
    let _busy = match slot.enter_bridge() {
        Some(guard) => guard,
        None => {
            tracing::warn!(slot = slot.slot, "{}", RECURSION_ERROR);
            return Err(mlua::Error::RuntimeError(located_message(lua, RECURSION_ERROR)));
        }
    };

    if args.is_empty() {
        return push_error(lua, NO_ARGUMENTS_ERROR, raise_error);
    }
    let argv = match marshal_arguments(&args) {
        Some(argv) => argv,
        None => return push_error(lua, ARGUMENT_TYPE_ERROR, raise_error),
    };

    let server = Arc::clone(&slot.server);
    let descriptor = match server.commands().lookup(&argv[0]) {
        Some(descriptor) => descriptor,
        None => {
            let name = String::from_utf8_lossy(&argv[0]).into_owned();
            return shape_reply(lua, CommandError::UnknownCommand(name).into(), raise_error);
        }
    };
    if descriptor.has_flag(CMD_NOSCRIPT) {
        tracing::debug!(command = %descriptor.name, "refused command flagged noscript");
        return push_error(lua, NOSCRIPT_ERROR, raise_error);
    }

    let (caller, single_command, conflict) = {
        let mut state = slot.state.borrow_mut();
        let conflict =
            descriptor.is_write() && state.random_dirty && !state.single_command_replication;
        if !conflict {
            if descriptor.is_random() {
                state.random_dirty = true;
            }
            if descriptor.is_write() {
                state.write_dirty = true;
                if let Some(running) = &state.running {
                    running.mark_written();
                }
            }
        }
        (state.caller.clone(), state.single_command_replication, conflict)
    };
    if conflict {
        tracing::warn!(command = %descriptor.name, "write after non deterministic command");
        return Err(mlua::Error::RuntimeError(located_message(lua, DETERMINISM_ERROR)));
    }
    let caller = caller.ok_or_else(|| {
        mlua::Error::RuntimeError("redis.call() used outside of a script invocation".into())
    })?;

    let outcome = {
        let mut fake_slot = slot.fake.borrow_mut();
        let fake = fake_slot.get_or_insert_with(FakeSession::new);
        fake.sync_from(&caller);
        if server.is_cluster_enabled() && server.is_serving() && !caller.has_flag(CLIENT_MASTER) {
            fake.inherit_cluster_flags(&caller);
        }
        fake.set_args(argv);
        server.executor().execute(fake, &descriptor)
    };

    let mut reply = match outcome {
        Ok(bytes) => match decode_reply(&bytes) {
            Ok((frame, _)) => frame,
            Err(err) => {
                tracing::warn!(command = %descriptor.name, error = %err, "malformed reply from store");
                let fatal = ScriptError::MalformedReply(err.to_string());
                let message = fatal.to_string();
                slot.state.borrow_mut().abort = Some(fatal);
                return Err(mlua::Error::RuntimeError(message));
            }
        },
        Err(err) => err.into(),
    };

    if descriptor.has_flag(CMD_SORT_FOR_SCRIPT) && !single_command {
        if let RespFrame::Array(Some(items)) = &mut reply {
            codec::sort_for_script(items);
        }
    }
    shape_reply(lua, reply, raise_error)
}

/// Turn a command reply into the script's return value
///
/// Only error replies abort the script, and only for `redis.call`.
fn shape_reply(lua: &Lua, reply: RespFrame, raise_error: bool) -> mlua::Result<Value> {
    match reply {
        RespFrame::Error(message) if raise_error => Err(mlua::Error::RuntimeError(
            String::from_utf8_lossy(&message).into_owned(),
        )),
        other => codec::frame_to_lua(lua, &other),
    }
}

/// Raise `message`, or return it as an `{err = ...}` table under pcall
fn push_error(lua: &Lua, message: &str, raise_error: bool) -> mlua::Result<Value> {
    let message = located_message(lua, message);
    if raise_error {
        Err(mlua::Error::RuntimeError(message))
    } else {
        Ok(Value::Table(codec::error_table(lua, message)?))
    }
}

/// Prefix `message` with the chunk and line of the calling script code
fn located_message(lua: &Lua, message: &str) -> String {
    lua.inspect_stack(1)
        .map(|frame| {
            let source = frame.source();
            format!(
                "{}: {}: {}",
                source.source.as_deref().unwrap_or("?"),
                frame.curr_line(),
                message
            )
        })
        .unwrap_or_else(|| message.to_string())
}

/// Command arguments as byte strings; `None` if any is not a string or number
fn marshal_arguments(args: &MultiValue) -> Option<Vec<Vec<u8>>> {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => Some(s.as_bytes().to_vec()),
            Value::Integer(n) => Some(format_number(*n as f64, 17).into_bytes()),
            Value::Number(n) => Some(format_number(*n, 17).into_bytes()),
            _ => None,
        })
        .collect()
}

/// Numeric value the way `lua_tonumber` sees it
fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(n) => Some(*n as f64),
        Value::Number(n) => Some(*n),
        Value::String(s) => s.to_str().ok().and_then(|s| s.trim().parse::<f64>().ok()),
        _ => None,
    }
}

/// String value the way `lua_tolstring` sees it
fn to_text(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Integer(n) => Some(format_number(*n as f64, 14).into_bytes()),
        Value::Number(n) => Some(format_number(*n, 14).into_bytes()),
        _ => None,
    }
}

fn log(_lua: &Lua, args: MultiValue) -> mlua::Result<()> {
    if args.len() < 2 {
        return Err(mlua::Error::RuntimeError("redis.log() requires two arguments or more.".into()));
    }
    let level = args
        .front()
        .and_then(to_number)
        .ok_or_else(|| mlua::Error::RuntimeError("First argument must be a number (log level).".into()))?
        as i64;
    if !(LOG_DEBUG..=LOG_WARNING).contains(&level) {
        return Err(mlua::Error::RuntimeError("Invalid debug level.".into()));
    }

    let parts: Vec<String> = args
        .iter()
        .skip(1)
        .filter_map(to_text)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .collect();
    let line = parts.join(" ");
    match level {
        LOG_DEBUG => tracing::trace!(target: "script", "{}", line),
        LOG_VERBOSE => tracing::debug!(target: "script", "{}", line),
        LOG_NOTICE => tracing::info!(target: "script", "{}", line),
        _ => tracing::warn!(target: "script", "{}", line),
    }
    Ok(())
}

fn sha1hex(_lua: &Lua, args: MultiValue) -> mlua::Result<String> {
    if args.len() != 1 {
        return Err(mlua::Error::RuntimeError("wrong number of arguments".into()));
    }
    let data = args
        .front()
        .and_then(to_text)
        .ok_or_else(|| mlua::Error::RuntimeError("wrong number or type of arguments".into()))?;
    Ok(registry::sha1hex(&data))
}

fn single_field_table(lua: &Lua, args: MultiValue, field: &str) -> mlua::Result<Table> {
    match (args.len(), args.front()) {
        (1, Some(Value::String(text))) => {
            let table = lua.create_table()?;
            table.raw_set(field, text.clone())?;
            Ok(table)
        }
        _ => codec::error_table(lua, located_message(lua, "wrong number or type of arguments")),
    }
}

/// Switch this invocation to single-command replication
///
/// Returns false once the script has written, since the writes so far were
/// made under whole-script replication.
fn replicate_commands(lua: &Lua, _: ()) -> mlua::Result<bool> {
    let slot = slot_context(lua)?;
    let mut state = slot.state.borrow_mut();
    if state.write_dirty {
        return Ok(false);
    }
    if !state.single_command_replication {
        state.single_command_replication = true;
        state.rng.seed(rand::random::<i32>());
    }
    Ok(true)
}

fn bad_argument(position: usize, function: &str, detail: &str) -> mlua::Error {
    mlua::Error::RuntimeError(format!(
        "bad argument #{} to '{}' ({})",
        position, function, detail
    ))
}

/// `luaL_checkint` equivalent
fn check_int(args: &MultiValue, index: usize, function: &str) -> mlua::Result<i32> {
    match args.get(index) {
        Some(value) => to_number(value).map(|n| n as i32).ok_or_else(|| {
            bad_argument(index + 1, function, &format!("number expected, got {}", value.type_name()))
        }),
        None => Err(bad_argument(index + 1, function, "number expected, got no value")),
    }
}

fn math_random(lua: &Lua, args: MultiValue) -> mlua::Result<f64> {
    let slot = slot_context(lua)?;
    let mut state = slot.state.borrow_mut();
    match args.len() {
        0 => Ok(state.rng.next_unit()),
        1 => {
            let upper = check_int(&args, 0, "random")?;
            state
                .rng
                .next_upto(upper)
                .map_err(|e| bad_argument(e.argument, "random", &e.to_string()))
        }
        2 => {
            let lower = check_int(&args, 0, "random")?;
            let upper = check_int(&args, 1, "random")?;
            state
                .rng
                .next_between(lower, upper)
                .map_err(|e| bad_argument(e.argument, "random", &e.to_string()))
        }
        _ => Err(mlua::Error::RuntimeError("wrong number of arguments".into())),
    }
}

fn math_randomseed(lua: &Lua, args: MultiValue) -> mlua::Result<()> {
    let seed = check_int(&args, 0, "randomseed")?;
    let slot = slot_context(lua)?;
    slot.state.borrow_mut().rng.seed(seed);
    Ok(())
}
