//! The `struct` library: C-struct style binary packing for scripts
//!
//! A format string is a sequence of options. Byte order and alignment
//! controls (`<`, `>`, `=`, `!n`) apply to the items that follow them.
//!
//! | option      | item                                        |
//! |-------------|---------------------------------------------|
//! | `b` / `B`   | signed / unsigned 1-byte integer            |
//! | `h` / `H`   | signed / unsigned 2-byte integer            |
//! | `l` / `L`   | signed / unsigned 8-byte integer            |
//! | `T`         | 8-byte size                                 |
//! | `i[n]`      | signed `n`-byte integer, default 4          |
//! | `I[n]`      | unsigned `n`-byte integer, default 4        |
//! | `f` / `d`   | float / double                              |
//! | `s`         | zero-terminated string                      |
//! | `c[n]`      | fixed string, `c0` takes its length from data |
//! | `x`         | one byte of padding                         |

use mlua::{IntoLua, Lua, MultiValue, Value, Variadic};

const MAX_INT_SIZE: usize = 32;
const MAX_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Item {
    Int { signed: bool },
    Float,
    Double,
    Chars,
    ZString,
    Padding,
}

struct Format<'a> {
    fmt: &'a [u8],
    pos: usize,
    little: bool,
    align: usize,
}

impl<'a> Format<'a> {
    fn new(fmt: &'a [u8]) -> Self {
        Format {
            fmt,
            pos: 0,
            little: true,
            align: 1,
        }
    }

    /// Next data item and its size; control options are applied on the way
    fn next_item(&mut self) -> mlua::Result<Option<(Item, usize)>> {
        while let Some(&opt) = self.fmt.get(self.pos) {
            self.pos += 1;
            let item = match opt {
                b'b' => (Item::Int { signed: true }, 1),
                b'B' => (Item::Int { signed: false }, 1),
                b'h' => (Item::Int { signed: true }, 2),
                b'H' => (Item::Int { signed: false }, 2),
                b'l' => (Item::Int { signed: true }, 8),
                b'L' | b'T' => (Item::Int { signed: false }, 8),
                b'i' | b'I' => {
                    let size = self.number(4)?;
                    if size > MAX_INT_SIZE {
                        return Err(struct_error(format!(
                            "integral size {} is larger than limit of {}",
                            size, MAX_INT_SIZE
                        )));
                    }
                    (Item::Int { signed: opt == b'i' }, size)
                }
                b'f' => (Item::Float, 4),
                b'd' => (Item::Double, 8),
                b'c' => (Item::Chars, self.number(1)?),
                b's' => (Item::ZString, 0),
                b'x' => (Item::Padding, 1),
                b' ' => continue,
                b'<' | b'=' => {
                    self.little = true;
                    continue;
                }
                b'>' => {
                    self.little = false;
                    continue;
                }
                b'!' => {
                    let align = self.number(MAX_ALIGN)?;
                    if !align.is_power_of_two() {
                        return Err(struct_error(format!("alignment {} is not a power of 2", align)));
                    }
                    self.align = align;
                    continue;
                }
                other => {
                    return Err(struct_error(format!("invalid format option '{}'", other as char)));
                }
            };
            return Ok(Some(item));
        }
        Ok(None)
    }

    fn number(&mut self, default: usize) -> mlua::Result<usize> {
        let start = self.pos;
        while self.fmt.get(self.pos).map_or(false, u8::is_ascii_digit) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(default);
        }
        std::str::from_utf8(&self.fmt[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| struct_error("integral size overflow"))
    }

    /// Padding needed before an item of `size` bytes placed at `offset`
    fn padding(&self, offset: usize, item: Item, size: usize) -> usize {
        if size == 0 || item == Item::Chars {
            return 0;
        }
        let align = size.min(self.align);
        (align - (offset & (align - 1))) & (align - 1)
    }

    fn order<const N: usize>(&self, mut bytes: [u8; N]) -> [u8; N] {
        if !self.little {
            bytes.reverse();
        }
        bytes
    }
}

fn struct_error(message: impl Into<String>) -> mlua::Error {
    mlua::Error::RuntimeError(message.into())
}

fn bad_argument(index: usize, function: &str, expected: &str) -> mlua::Error {
    struct_error(format!(
        "bad argument #{} to '{}' ({} expected)",
        index, function, expected
    ))
}

fn pack(lua: &Lua, fmt: &[u8], args: Variadic<Value>) -> mlua::Result<mlua::String> {
    let mut format = Format::new(fmt);
    let mut out = Vec::new();
    let mut args = args.into_iter();
    let mut index = 1;

    while let Some((item, size)) = format.next_item()? {
        let padding = format.padding(out.len(), item, size);
        out.resize(out.len() + padding, 0);

        match item {
            Item::Padding => {
                out.push(0);
                continue;
            }
            _ => index += 1,
        }
        let arg = args.next().unwrap_or(Value::Nil);
        match item {
            Item::Int { .. } => {
                let n = lua
                    .coerce_number(arg)?
                    .ok_or_else(|| bad_argument(index, "pack", "number"))?;
                let value = if n < 0.0 { n as i64 as u64 } else { n as u64 };
                let mut bytes: Vec<u8> = (0..size)
                    .map(|i| if i < 8 { (value >> (8 * i)) as u8 } else { 0 })
                    .collect();
                if !format.little {
                    bytes.reverse();
                }
                out.extend(bytes);
            }
            Item::Float | Item::Double => {
                let n = lua
                    .coerce_number(arg)?
                    .ok_or_else(|| bad_argument(index, "pack", "number"))?;
                if item == Item::Float {
                    out.extend(format.order((n as f32).to_le_bytes()));
                } else {
                    out.extend(format.order(n.to_le_bytes()));
                }
            }
            Item::Chars | Item::ZString => {
                let text = lua
                    .coerce_string(arg)?
                    .ok_or_else(|| bad_argument(index, "pack", "string"))?;
                let text = text.as_bytes();
                let len = if size == 0 { text.len() } else { size };
                if text.len() < len {
                    return Err(struct_error(format!(
                        "bad argument #{} to 'pack' (string too short)",
                        index
                    )));
                }
                out.extend_from_slice(&text[..len]);
                if item == Item::ZString {
                    out.push(0);
                }
            }
            Item::Padding => {}
        }
    }
    lua.create_string(&out)
}

fn read_int(bytes: &[u8], little: bool, signed: bool) -> Value {
    let mut value: u64 = 0;
    if little {
        for &b in bytes.iter().rev() {
            value = (value << 8) | u64::from(b);
        }
    } else {
        for &b in bytes {
            value = (value << 8) | u64::from(b);
        }
    }

    let size = bytes.len();
    if signed {
        if size > 0 && size < 8 && (value >> (size * 8 - 1)) & 1 == 1 {
            value |= u64::MAX << (size * 8);
        }
        Value::Integer(value as i64 as mlua::Integer)
    } else if value <= i64::MAX as u64 {
        Value::Integer(value as mlua::Integer)
    } else {
        Value::Number(value as f64)
    }
}

fn unpack(lua: &Lua, fmt: &[u8], data: &[u8], init: Option<i64>) -> mlua::Result<MultiValue> {
    let mut pos = match init {
        None => 0,
        Some(init) if init >= 1 && (init - 1) as usize <= data.len() => (init - 1) as usize,
        Some(_) => return Err(struct_error("bad argument #3 to 'unpack' (offset must be 1 or greater)")),
    };
    let too_short = || struct_error("bad argument #2 to 'unpack' (data string too short)");

    let mut format = Format::new(fmt);
    let mut results: Vec<Value> = Vec::new();
    while let Some((item, mut size)) = format.next_item()? {
        pos += format.padding(pos, item, size);
        if pos + size > data.len() {
            return Err(too_short());
        }
        let field = &data[pos..pos + size];

        match item {
            Item::Int { signed } => results.push(read_int(field, format.little, signed)),
            Item::Float => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(field);
                let n = f32::from_le_bytes(format.order(bytes));
                results.push(Value::Number(f64::from(n)));
            }
            Item::Double => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(field);
                results.push(Value::Number(f64::from_le_bytes(format.order(bytes))));
            }
            Item::Chars => {
                if size == 0 {
                    size = match results.pop() {
                        Some(Value::Integer(n)) if n >= 0 => n as usize,
                        Some(Value::Number(n)) if n >= 0.0 => n as usize,
                        _ => return Err(struct_error("format 'c0' needs a previous size")),
                    };
                    if pos + size > data.len() {
                        return Err(too_short());
                    }
                }
                results.push(Value::String(lua.create_string(&data[pos..pos + size])?));
            }
            Item::ZString => {
                let len = data[pos..]
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| struct_error("unfinished string in data"))?;
                results.push(Value::String(lua.create_string(&data[pos..pos + len])?));
                size = len + 1;
            }
            Item::Padding => {}
        }
        pos += size;
    }
    results.push((pos as i64 + 1).into_lua(lua)?);
    Ok(MultiValue::from_vec(results))
}

fn size(fmt: &[u8]) -> mlua::Result<usize> {
    let mut format = Format::new(fmt);
    let mut pos = 0;
    while let Some((item, size)) = format.next_item()? {
        pos += format.padding(pos, item, size);
        if item == Item::ZString || (item == Item::Chars && size == 0) {
            return Err(struct_error("options 'c0' - 's' not allowed in struct.size"));
        }
        pos += size;
    }
    Ok(pos)
}

pub(crate) fn install_struct(lua: &Lua) -> mlua::Result<()> {
    let table = lua.create_table()?;
    table.raw_set(
        "pack",
        lua.create_function(|lua, (fmt, args): (mlua::String, Variadic<Value>)| {
            pack(lua, &fmt.as_bytes(), args)
        })?,
    )?;
    table.raw_set(
        "unpack",
        lua.create_function(
            |lua, (fmt, data, init): (mlua::String, mlua::String, Option<i64>)| {
                unpack(lua, &fmt.as_bytes(), &data.as_bytes(), init)
            },
        )?,
    )?;
    table.raw_set(
        "size",
        lua.create_function(|_, fmt: mlua::String| size(&fmt.as_bytes()))?,
    )?;
    lua.globals().raw_set("struct", table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua() -> Lua {
        let lua = Lua::new();
        install_struct(&lua).unwrap();
        lua
    }

    fn bytes(lua: &Lua, code: &str) -> Vec<u8> {
        let packed: mlua::String = lua.load(code).eval().unwrap();
        packed.as_bytes().to_vec()
    }

    #[test]
    fn test_pack_integers() {
        let lua = lua();
        assert_eq!(bytes(&lua, "return struct.pack('>I2', 258)"), vec![1, 2]);
        assert_eq!(bytes(&lua, "return struct.pack('<I2', 258)"), vec![2, 1]);
        assert_eq!(bytes(&lua, "return struct.pack('<i', -2)"), vec![0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(bytes(&lua, "return struct.pack('bxB', -1, 7)"), vec![0xff, 0, 7]);
        // alignment pads the int to a 4-byte boundary
        assert_eq!(
            bytes(&lua, "return struct.pack('!4 B i', 1, 2)"),
            vec![1, 0, 0, 0, 2, 0, 0, 0]
        );
    }

    #[test]
    fn test_unpack_returns_values_and_next_position() {
        let lua = lua();
        let (a, b, next): (i64, i64, i64) = lua
            .load("return struct.unpack('<hB', '\\254\\255\\7')")
            .eval()
            .unwrap();
        assert_eq!((a, b, next), (-2, 7, 4));

        let (n, next): (i64, i64) = lua.load("return struct.unpack('>H', 'xx\\1\\2', 3)").eval().unwrap();
        assert_eq!((n, next), (258, 5));

        let (d, f): (f64, f64) = lua
            .load("return struct.unpack('>d', struct.pack('>d', 1.5)), struct.unpack('f', struct.pack('f', -0.25))")
            .eval()
            .unwrap();
        assert_eq!((d, f), (1.5, -0.25));
    }

    #[test]
    fn test_strings() {
        let lua = lua();
        assert_eq!(bytes(&lua, "return struct.pack('s', 'hi')"), b"hi\0".to_vec());
        assert_eq!(bytes(&lua, "return struct.pack('c3', 'abcdef')"), b"abc".to_vec());
        assert_eq!(bytes(&lua, "return struct.pack('Bc0', 3, 'abc')"), b"\x03abc".to_vec());

        let (s, n, next): (String, i64, i64) = lua
            .load("return struct.unpack('sB', 'hi\\0\\5')")
            .eval()
            .unwrap();
        assert_eq!((s.as_str(), n, next), ("hi", 5, 5));

        // c0 takes its length from the value before it
        let (s, next): (String, i64) = lua
            .load("return struct.unpack('Bc0', struct.pack('Bc0', 3, 'abc'))")
            .eval()
            .unwrap();
        assert_eq!((s.as_str(), next), ("abc", 5));
    }

    #[test]
    fn test_size() {
        let lua = lua();
        let check = |code: &str, expected: i64| {
            let got: i64 = lua.load(code).eval().unwrap();
            assert_eq!(got, expected, "{code}");
        };
        check("return struct.size('bhld')", 19);
        check("return struct.size('!4 b i')", 8);
        check("return struct.size('i8 c5 x')", 14);

        let err = lua.load("return struct.size('s')").exec().unwrap_err();
        assert!(err.to_string().contains("not allowed in struct.size"), "{err}");
    }

    #[test]
    fn test_errors() {
        let lua = lua();
        let err = |code: &str| lua.load(code).exec().unwrap_err().to_string();
        assert!(err("struct.unpack('i', 'ab')").contains("data string too short"));
        assert!(err("struct.pack('y', 1)").contains("invalid format option 'y'"));
        assert!(err("struct.pack('i40', 1)").contains("larger than limit"));
        assert!(err("struct.pack('!3 i', 1)").contains("not a power of 2"));
        assert!(err("struct.pack('c5', 'ab')").contains("string too short"));
        assert!(err("struct.unpack('s', 'abc')").contains("unfinished string"));
        assert!(err("struct.pack('i', {})").contains("number expected"));
    }
}
