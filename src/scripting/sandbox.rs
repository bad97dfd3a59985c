//! Interpreter construction and lockdown
//!
//! A slot interpreter gets the base, table, string and math libraries, the
//! `cjson`, `cmsgpack`, `struct` and `bit` helpers, and nothing that reaches the filesystem or the
//! process. The debug library is loaded only long enough to be hidden, and
//! global protection is installed last so setup code can still define
//! globals freely.

use std::borrow::Cow;

use mlua::{Lua, LuaOptions, LuaSerdeExt, MultiValue, SerializeOptions, StdLib, Table, Value, Variadic};

use super::codec::format_number;
use super::packing::install_struct;

/// Chunk name scripts are compiled under; error messages show `user_script`
pub const SCRIPT_CHUNK_NAME: &str = "@user_script";

/// Open a fresh interpreter with the sandboxed library set
pub fn open_interpreter() -> mlua::Result<Lua> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::DEBUG;
    // SAFETY: the debug library is removed by `seal` before any script runs
    let lua = unsafe { Lua::unsafe_new_with(libs, LuaOptions::new()) };

    let globals = lua.globals();
    for name in ["loadfile", "dofile"] {
        globals.raw_set(name, Value::Nil)?;
    }
    install_cjson(&lua)?;
    install_cmsgpack(&lua)?;
    install_struct(&lua)?;
    install_bit(&lua)?;
    Ok(lua)
}

/// Hide the debug library and forbid new globals
///
/// Must run after every library and bridge function is installed.
pub fn seal(lua: &Lua) -> mlua::Result<()> {
    lua.globals().raw_set("debug", Value::Nil)?;
    protect_globals(lua)
}

/// Check that `body` compiles as a standalone chunk
pub fn check_syntax(body: &[u8]) -> Result<(), String> {
    let lua = Lua::new_with(StdLib::NONE, LuaOptions::new()).map_err(|e| e.to_string())?;
    compile_check(&lua, body)
}

/// Check that `body` compiles, using an existing interpreter
pub fn compile_check(lua: &Lua, body: &[u8]) -> Result<(), String> {
    lua.load(body)
        .set_name(SCRIPT_CHUNK_NAME)
        .into_function()
        .map(|_| ())
        .map_err(|e| match e {
            mlua::Error::SyntaxError { message, .. } => message,
            other => other.to_string(),
        })
}

/// `"short_src:line: "` for the Lua function `level` frames up, if any
pub(crate) fn location(lua: &Lua, level: usize) -> String {
    lua.inspect_stack(level)
        .and_then(|frame| {
            let line = frame.curr_line();
            let source = frame.source();
            let short_src = source.short_src.as_deref()?;
            (line > 0).then(|| format!("{}:{}: ", short_src, line))
        })
        .unwrap_or_default()
}

/// Kind of the function `level` frames up: `"Lua"`, `"C"`, `"main"` or `"tail"`
fn caller_kind(lua: &Lua, level: usize) -> Option<&'static str> {
    lua.inspect_stack(level).map(|frame| frame.source().what)
}

fn describe_key(key: &Value) -> Cow<'static, str> {
    match key {
        Value::String(s) => Cow::Owned(s.to_string_lossy().to_string()),
        Value::Integer(n) => Cow::Owned(format_number(*n as f64, 14)),
        Value::Number(n) => Cow::Owned(format_number(*n, 14)),
        Value::Boolean(b) => Cow::Owned(b.to_string()),
        other => Cow::Borrowed(other.type_name()),
    }
}

fn protect_globals(lua: &Lua) -> mlua::Result<()> {
    let metatable = lua.create_table()?;

    metatable.raw_set(
        "__newindex",
        lua.create_function(|lua, (globals, key, value): (Table, Value, Value)| {
            if let Some(kind) = caller_kind(lua, 1) {
                if kind != "main" && kind != "C" {
                    return Err(mlua::Error::RuntimeError(format!(
                        "{}Script attempted to create global variable '{}'",
                        location(lua, 1),
                        describe_key(&key)
                    )));
                }
            }
            globals.raw_set(key, value)
        })?,
    )?;

    metatable.raw_set(
        "__index",
        lua.create_function(|lua, (globals, key): (Table, Value)| {
            if let Some(kind) = caller_kind(lua, 1) {
                if kind != "C" {
                    return Err(mlua::Error::RuntimeError(format!(
                        "{}Script attempted to access nonexistent global variable '{}'",
                        location(lua, 1),
                        describe_key(&key)
                    )));
                }
            }
            globals.raw_get::<Value>(key)
        })?,
    )?;

    lua.globals().set_metatable(Some(metatable));
    Ok(())
}

fn install_cjson(lua: &Lua) -> mlua::Result<()> {
    let cjson = lua.create_table()?;
    cjson.raw_set(
        "encode",
        lua.create_function(|lua, value: Value| {
            let json: serde_json::Value = lua.from_value(value)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?,
    )?;
    cjson.raw_set(
        "decode",
        lua.create_function(|lua, text: mlua::String| {
            let json: serde_json::Value =
                serde_json::from_slice(&text.as_bytes()).map_err(mlua::Error::external)?;
            lua.to_value(&json)
        })?,
    )?;
    cjson.raw_set("null", Value::NULL)?;
    lua.globals().raw_set("cjson", cjson)
}

/// `pack` concatenates one MessagePack object per argument; `unpack`
/// returns every object in the input
fn install_cmsgpack(lua: &Lua) -> mlua::Result<()> {
    let cmsgpack = lua.create_table()?;
    cmsgpack.raw_set(
        "pack",
        lua.create_function(|lua, values: Variadic<Value>| {
            let mut packed = Vec::new();
            for value in values {
                let value: rmpv::Value = lua.from_value(value)?;
                packed.extend(rmp_serde::to_vec(&value).map_err(mlua::Error::external)?);
            }
            lua.create_string(&packed)
        })?,
    )?;
    cmsgpack.raw_set(
        "unpack",
        lua.create_function(|lua, packed: mlua::String| {
            let packed = packed.as_bytes();
            let mut input: &[u8] = &packed;
            let mut values = Vec::new();
            while !input.is_empty() {
                let value = rmpv::decode::read_value(&mut input).map_err(mlua::Error::external)?;
                let options = SerializeOptions::new()
                    .serialize_none_to_null(false)
                    .serialize_unit_to_null(false);
                values.push(lua.to_value_with(&value, options)?);
            }
            Ok(MultiValue::from_vec(values))
        })?,
    )?;
    lua.globals().raw_set("cmsgpack", cmsgpack)
}

/// Normalise a Lua number to a 32-bit two's complement integer
fn tobit(n: f64) -> i32 {
    (n.round() as i64 % (1_i64 << 32)) as i32
}

fn install_bit(lua: &Lua) -> mlua::Result<()> {
    let bit = lua.create_table()?;

    bit.raw_set("tobit", lua.create_function(|_, n: f64| Ok(tobit(n)))?)?;
    bit.raw_set("bnot", lua.create_function(|_, n: f64| Ok(!tobit(n)))?)?;
    bit.raw_set(
        "band",
        lua.create_function(|_, args: Variadic<f64>| Ok(args.iter().fold(-1, |acc, &n| acc & tobit(n))))?,
    )?;
    bit.raw_set(
        "bor",
        lua.create_function(|_, args: Variadic<f64>| Ok(args.iter().fold(0, |acc, &n| acc | tobit(n))))?,
    )?;
    bit.raw_set(
        "bxor",
        lua.create_function(|_, args: Variadic<f64>| Ok(args.iter().fold(0, |acc, &n| acc ^ tobit(n))))?,
    )?;
    bit.raw_set(
        "lshift",
        lua.create_function(|_, (n, s): (f64, f64)| Ok(tobit(n).wrapping_shl(tobit(s) as u32 & 31)))?,
    )?;
    bit.raw_set(
        "rshift",
        lua.create_function(|_, (n, s): (f64, f64)| {
            Ok(((tobit(n) as u32) >> (tobit(s) as u32 & 31)) as i32)
        })?,
    )?;
    bit.raw_set(
        "arshift",
        lua.create_function(|_, (n, s): (f64, f64)| Ok(tobit(n) >> (tobit(s) as u32 & 31)))?,
    )?;
    bit.raw_set(
        "tohex",
        lua.create_function(|_, (n, digits): (f64, Option<f64>)| {
            let digits = digits.map(tobit).unwrap_or(8);
            let width = (digits.unsigned_abs() as usize).min(8);
            let value = tobit(n) as u32;
            let full = if digits < 0 {
                format!("{:08X}", value)
            } else {
                format!("{:08x}", value)
            };
            Ok(full[8 - width..].to_string())
        })?,
    )?;

    lua.globals().raw_set("bit", bit)
}
