//! RESP (Redis Serialization Protocol) encoder and decoder
//!
//! Commands are encoded as arrays of bulk strings. Replies are decoded
//! from any buffered reader, one frame per call, so a caller can read
//! exactly as many replies as it sent commands.

use std::io::{self, BufRead, Read};

/// Largest bulk string accepted, matching the server's proto-max-bulk-len
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted in one reply
const MAX_NESTING: usize = 32;

/// Decoded reply frame
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string (+OK\r\n)
    Status(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:1000\r\n)
    Integer(i64),
    /// Bulk string ($6\r\nfoobar\r\n), `None` for $-1
    Bulk(Option<Vec<u8>>),
    /// Array (*2\r\n...), `None` for *-1
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Check if this is an error response
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Get as string (for status or UTF-8 bulk string)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::Status(s) => Some(s),
            RespValue::Bulk(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as bytes (for bulk string)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(Some(arr)) => Some(arr),
            _ => None,
        }
    }

    /// Short name of the frame type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            RespValue::Status(_) => "status",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::Bulk(Some(_)) => "bulk",
            RespValue::Bulk(None) => "nil bulk",
            RespValue::Array(Some(_)) => "array",
            RespValue::Array(None) => "nil array",
        }
    }
}

/// RESP encoder with pre-allocated buffer
pub struct RespEncoder {
    buf: Vec<u8>,
}

impl RespEncoder {
    /// Create new encoder with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Get encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take ownership of buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Encode a command name followed by its arguments as one RESP array
    pub fn encode(&mut self, name: &[u8], args: &[&[u8]]) {
        self.write_header(b'*', args.len() + 1);
        self.write_bulk(name);
        for arg in args {
            self.write_bulk(arg);
        }
    }

    #[inline]
    fn write_header(&mut self, marker: u8, len: usize) {
        self.buf.push(marker);
        let mut buffer = itoa::Buffer::new();
        self.buf.extend_from_slice(buffer.format(len).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    #[inline]
    fn write_bulk(&mut self, data: &[u8]) {
        self.write_header(b'$', data.len());
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
    }
}

/// Encode one command into a fresh buffer
pub fn encode(name: &[u8], args: &[&[u8]]) -> Vec<u8> {
    let payload: usize = args.iter().map(|a| a.len() + 16).sum();
    let mut encoder = RespEncoder::with_capacity(name.len() + payload + 16);
    encoder.encode(name, args);
    encoder.into_bytes()
}

/// RESP decoder for streaming reads
///
/// Malformed frames surface as `io::ErrorKind::InvalidData`; every other
/// error kind comes from the underlying reader.
pub struct RespDecoder<R> {
    reader: R,
    line_buf: String,
}

impl<R: BufRead> RespDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_buf: String::with_capacity(256),
        }
    }

    /// Decode next RESP value from stream
    pub fn decode(&mut self) -> io::Result<RespValue> {
        self.decode_nested(0)
    }

    fn decode_nested(&mut self, depth: usize) -> io::Result<RespValue> {
        if depth > MAX_NESTING {
            return Err(invalid_data("RESP arrays nested too deeply"));
        }

        self.line_buf.clear();
        let read = self.reader.read_line(&mut self.line_buf)?;

        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed",
            ));
        }

        let line = self
            .line_buf
            .strip_suffix("\r\n")
            .ok_or_else(|| invalid_data("RESP line not terminated by CRLF"))?;
        if line.is_empty() {
            return Err(invalid_data("Empty RESP line"));
        }

        let type_byte = line.as_bytes()[0];
        let content = &line[1..];

        match type_byte {
            b'+' => Ok(RespValue::Status(content.to_string())),
            b'-' => Ok(RespValue::Error(content.to_string())),
            b':' => {
                let value: i64 = content
                    .parse()
                    .map_err(|_| invalid_data("Invalid integer"))?;
                Ok(RespValue::Integer(value))
            }
            b'$' => {
                let len: i64 = content
                    .parse()
                    .map_err(|_| invalid_data("Invalid bulk string length"))?;

                if len < 0 {
                    return Ok(RespValue::Bulk(None));
                }

                let len = len as usize;
                if len > MAX_BULK_LEN {
                    return Err(invalid_data("Bulk string length exceeds limit"));
                }

                // Grow with the bytes actually received, not the declared length
                let mut data = Vec::with_capacity(len.min(64 * 1024));
                (&mut self.reader).take(len as u64).read_to_end(&mut data)?;
                if data.len() < len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Connection closed inside bulk string",
                    ));
                }

                let mut crlf = [0u8; 2];
                self.reader.read_exact(&mut crlf)?;
                if &crlf != b"\r\n" {
                    return Err(invalid_data("Bulk string not terminated by CRLF"));
                }

                Ok(RespValue::Bulk(Some(data)))
            }
            b'*' => {
                let count: i64 = content
                    .parse()
                    .map_err(|_| invalid_data("Invalid array length"))?;

                if count < 0 {
                    return Ok(RespValue::Array(None));
                }

                let mut elements = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    elements.push(self.decode_nested(depth + 1)?);
                }

                Ok(RespValue::Array(Some(elements)))
            }
            other => Err(invalid_data(&format!(
                "Invalid RESP type byte: {}",
                other as char
            ))),
        }
    }
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}
