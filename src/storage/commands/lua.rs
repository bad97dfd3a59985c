//! EVAL, EVALSHA and SCRIPT command handlers
//!
//! Entry points the connection layer calls with the raw command frames.
//! Every failure comes back as an error frame, never as a Rust error.

use std::str;

use crate::error::ScriptError;
use crate::protocol::{extract_bytes, RespFrame};
use crate::scripting::{ClientSession, ScriptRunner};

/// Dispatch a scripting command
///
/// `parts` holds the whole command including its name.
pub fn handle_lua_command(
    runner: &mut ScriptRunner,
    session: &ClientSession,
    name: &str,
    parts: &[RespFrame],
) -> RespFrame {
    match name.to_ascii_lowercase().as_str() {
        "eval" => handle_eval(runner, session, parts),
        "evalsha" => handle_evalsha(runner, session, parts),
        "script" => handle_script(runner, parts),
        other => RespFrame::error(format!("ERR unknown command '{}'", other)),
    }
}

/// Collect command arguments as bytes, failing on nested or null frames
fn arguments(parts: &[RespFrame]) -> Option<Vec<Vec<u8>>> {
    parts.iter().map(extract_bytes).collect()
}

fn wrong_arity(command: &str) -> RespFrame {
    RespFrame::error(format!("ERR wrong number of arguments for '{}' command", command))
}

fn reply(result: Result<RespFrame, ScriptError>) -> RespFrame {
    result.unwrap_or_else(|err| err.to_frame())
}

/// EVAL script numkeys [key ...] [arg ...]
pub fn handle_eval(runner: &mut ScriptRunner, session: &ClientSession, parts: &[RespFrame]) -> RespFrame {
    if parts.len() < 3 {
        return wrong_arity("eval");
    }
    let args = match arguments(&parts[1..]) {
        Some(args) => args,
        None => return RespFrame::error("ERR Protocol error: invalid argument"),
    };
    reply(runner.eval(session, &args[0], &args[1], &args[2..]))
}

/// EVALSHA sha1 numkeys [key ...] [arg ...]
pub fn handle_evalsha(runner: &mut ScriptRunner, session: &ClientSession, parts: &[RespFrame]) -> RespFrame {
    if parts.len() < 3 {
        return wrong_arity("evalsha");
    }
    let args = match arguments(&parts[1..]) {
        Some(args) => args,
        None => return RespFrame::error("ERR Protocol error: invalid argument"),
    };
    // a digest that is not text can never match a registered script
    let digest = match str::from_utf8(&args[0]) {
        Ok(digest) => digest,
        Err(_) => return ScriptError::NoScript.to_frame(),
    };
    reply(runner.evalsha(session, digest, &args[1], &args[2..]))
}

/// SCRIPT LOAD | EXISTS | FLUSH | KILL
pub fn handle_script(runner: &ScriptRunner, parts: &[RespFrame]) -> RespFrame {
    if parts.len() < 2 {
        return wrong_arity("script");
    }
    let args = match arguments(&parts[1..]) {
        Some(args) => args,
        None => return RespFrame::error("ERR Protocol error: invalid argument"),
    };
    let subcommand = String::from_utf8_lossy(&args[0]).to_ascii_lowercase();
    let server = runner.server();

    match (subcommand.as_str(), args.len()) {
        ("load", 2) => match server.script_load(&args[1]) {
            Ok(digest) => RespFrame::bulk_string(digest),
            Err(err) => err.to_frame(),
        },
        ("exists", n) if n >= 2 => {
            let digests: Vec<String> = args[1..]
                .iter()
                .map(|d| String::from_utf8_lossy(d).into_owned())
                .collect();
            RespFrame::array(
                server
                    .script_exists(&digests)
                    .into_iter()
                    .map(|found| RespFrame::Integer(found as i64))
                    .collect(),
            )
        }
        ("flush", 1) => {
            server.script_flush();
            RespFrame::ok()
        }
        ("kill", 1) => match server.script_kill() {
            Ok(()) => RespFrame::ok(),
            Err(err) => err.to_frame(),
        },
        ("load" | "exists" | "flush" | "kill", _) => {
            RespFrame::error(format!("ERR Unknown SCRIPT subcommand or wrong # of args for '{}'", subcommand))
        }
        _ => RespFrame::error(format!("ERR Unknown SCRIPT subcommand '{}'", subcommand)),
    }
}
