//! RESP protocol serializer implementation

use std::io::{self, Write};
use super::resp::RespFrame;

/// Serialize a RESP frame to a writer
pub fn serialize_resp_frame<W: Write>(frame: &RespFrame, writer: &mut W) -> io::Result<()> {
    match frame {
        RespFrame::SimpleString(bytes) => {
            writer.write_all(b"+")?;
            writer.write_all(bytes)?;
            writer.write_all(b"\r\n")?;
        }

        RespFrame::Error(bytes) => {
            writer.write_all(b"-")?;
            writer.write_all(bytes)?;
            writer.write_all(b"\r\n")?;
        }

        RespFrame::Integer(n) => {
            write!(writer, ":{}\r\n", n)?;
        }

        RespFrame::BulkString(Some(bytes)) => {
            write!(writer, "${}\r\n", bytes.len())?;
            writer.write_all(bytes)?;
            writer.write_all(b"\r\n")?;
        }
        RespFrame::BulkString(None) => {
            writer.write_all(b"$-1\r\n")?;
        }

        RespFrame::Array(Some(frames)) => {
            write!(writer, "*{}\r\n", frames.len())?;
            for frame in frames {
                serialize_resp_frame(frame, writer)?;
            }
        }
        RespFrame::Array(None) => {
            writer.write_all(b"*-1\r\n")?;
        }
    }

    Ok(())
}

/// Serialize a RESP frame to a byte vector
pub fn serialize_to_vec(frame: &RespFrame) -> Vec<u8> {
    let mut buf = Vec::new();
    // writing into a Vec cannot fail
    let _ = serialize_resp_frame(frame, &mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_reply;

    #[test]
    fn test_serialize_shapes() {
        assert_eq!(serialize_to_vec(&RespFrame::ok()), b"+OK\r\n");
        assert_eq!(serialize_to_vec(&RespFrame::error("ERR x")), b"-ERR x\r\n");
        assert_eq!(serialize_to_vec(&RespFrame::Integer(-3)), b":-3\r\n");
        assert_eq!(serialize_to_vec(&RespFrame::bulk_string("hey")), b"$3\r\nhey\r\n");
        assert_eq!(serialize_to_vec(&RespFrame::null_bulk()), b"$-1\r\n");
        assert_eq!(serialize_to_vec(&RespFrame::null_array()), b"*-1\r\n");
    }

    #[test]
    fn test_decode_then_encode_is_identity() {
        let wire: &[&[u8]] = &[
            b":0\r\n",
            b"+PONG\r\n",
            b"-WRONGTYPE bad\r\n",
            b"$5\r\nhello\r\n",
            b"$-1\r\n",
            b"*-1\r\n",
            b"*3\r\n:1\r\n$2\r\nab\r\n*1\r\n+OK\r\n",
        ];
        for input in wire {
            let (frame, consumed) = decode_reply(input).unwrap();
            assert_eq!(consumed, input.len());
            assert_eq!(serialize_to_vec(&frame), input.to_vec());
        }
    }
}
