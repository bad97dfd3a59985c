//! Conversion between store replies and Lua values
//!
//! | reply                 | Lua value          |
//! |-----------------------|--------------------|
//! | integer               | number             |
//! | bulk string           | string             |
//! | null bulk / null array| `false`            |
//! | status line           | `{ok = <text>}`    |
//! | error                 | `{err = <text>}`   |
//! | array                 | sequence table     |
//!
//! The reverse direction reads a table as an error when it has a string
//! `err` field, otherwise as a status when it has a string `ok` field,
//! otherwise as an array of its `1..n` prefix.

use std::cmp::Ordering;

use mlua::{Lua, Table, Value};

use crate::protocol::RespFrame;

/// Nesting depth past which a returned table is rejected
const MAX_NESTING: usize = 1000;

/// Convert a store reply into the Lua value a script sees
pub fn frame_to_lua(lua: &Lua, frame: &RespFrame) -> mlua::Result<Value> {
    Ok(match frame {
        RespFrame::Integer(n) => Value::Number(*n as mlua::Number),
        RespFrame::BulkString(Some(bytes)) => Value::String(lua.create_string(bytes.as_slice())?),
        RespFrame::BulkString(None) | RespFrame::Array(None) => Value::Boolean(false),
        RespFrame::SimpleString(text) => Value::Table(status_table(lua, text.as_slice())?),
        RespFrame::Error(text) => Value::Table(error_table(lua, text.as_slice())?),
        RespFrame::Array(Some(items)) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, frame_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
    })
}

/// Convert a value returned by a script into a reply
pub fn lua_to_frame(value: &Value) -> mlua::Result<RespFrame> {
    lua_to_frame_at(value, 0)
}

fn lua_to_frame_at(value: &Value, depth: usize) -> mlua::Result<RespFrame> {
    if depth > MAX_NESTING {
        return Err(mlua::Error::RuntimeError("reached lua stack limit".into()));
    }
    Ok(match value {
        Value::String(s) => RespFrame::bulk_string(&*s.as_bytes()),
        Value::Boolean(true) => RespFrame::Integer(1),
        Value::Integer(n) => RespFrame::Integer(*n as i64),
        Value::Number(n) => RespFrame::Integer(*n as i64),
        Value::Table(table) => table_to_frame(table, depth)?,
        _ => RespFrame::null_bulk(),
    })
}

/// Raw lookups only: a returned table's metamethods never run
fn table_to_frame(table: &Table, depth: usize) -> mlua::Result<RespFrame> {
    if let Value::String(err) = table.raw_get::<Value>("err")? {
        return Ok(RespFrame::error(single_line(&*err.as_bytes())));
    }
    if let Value::String(ok) = table.raw_get::<Value>("ok")? {
        return Ok(RespFrame::simple_string(single_line(&*ok.as_bytes())));
    }

    let mut items = Vec::new();
    for index in 1.. {
        let item = table.raw_get::<Value>(index)?;
        if item.is_nil() {
            break;
        }
        items.push(lua_to_frame_at(&item, depth + 1)?);
    }
    Ok(RespFrame::Array(Some(items)))
}

fn single_line(text: &[u8]) -> Vec<u8> {
    text.iter()
        .map(|&b| if b == b'\r' || b == b'\n' { b' ' } else { b })
        .collect()
}

/// `{err = message}`
pub fn error_table(lua: &Lua, message: impl AsRef<[u8]>) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.raw_set("err", lua.create_string(message.as_ref())?)?;
    Ok(table)
}

/// `{ok = message}`
pub fn status_table(lua: &Lua, message: impl AsRef<[u8]>) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.raw_set("ok", lua.create_string(message.as_ref())?)?;
    Ok(table)
}

/// Sort a multi-bulk reply into a replica-stable order
///
/// Elements compare as byte strings; integers compare by their decimal
/// text and nil elements as the empty string.
pub fn sort_for_script(items: &mut [RespFrame]) {
    items.sort_by(|a, b| compare_elements(a, b));
}

fn compare_elements(a: &RespFrame, b: &RespFrame) -> Ordering {
    sort_key(a).cmp(&sort_key(b))
}

fn sort_key(frame: &RespFrame) -> Vec<u8> {
    match frame {
        RespFrame::BulkString(Some(bytes)) | RespFrame::SimpleString(bytes) | RespFrame::Error(bytes) => {
            bytes.to_vec()
        }
        RespFrame::Integer(n) => n.to_string().into_bytes(),
        _ => Vec::new(),
    }
}

/// Format a number like C's `%.{precision}g`
///
/// Command arguments use 17 significant digits so doubles survive the trip
/// to the store; log output uses Lua's own 14.
pub fn format_number(n: f64, precision: usize) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, n);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some(parts) => parts,
        None => return scientific,
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= precision as i32 {
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            if exponent < 0 { '-' } else { '+' },
            exponent.unsigned_abs()
        )
    } else {
        let decimals = (precision as i32 - 1 - exponent) as usize;
        trim_fraction(&format!("{:.*}", decimals, n)).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}
