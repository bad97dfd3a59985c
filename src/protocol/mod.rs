//! RESP (REdis Serialization Protocol) implementation
//!
//! Only the RESP2 reply shapes a command can produce are modelled here:
//! integers, bulk strings, status lines, errors and arrays.

pub mod resp;
pub mod parser;
pub mod serializer;

pub use resp::{Bytes, RespFrame};
pub use parser::decode_reply;
pub use serializer::{serialize_resp_frame, serialize_to_vec};

/// Extract raw bytes from a RESP frame used as a command argument
pub fn extract_bytes(frame: &RespFrame) -> Option<Vec<u8>> {
    match frame {
        RespFrame::SimpleString(data) => Some(data.to_vec()),
        RespFrame::BulkString(Some(data)) => Some(data.to_vec()),
        RespFrame::Integer(n) => Some(n.to_string().into_bytes()),
        _ => None,
    }
}
