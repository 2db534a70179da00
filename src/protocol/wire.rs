//! Wayland wire framing
//!
//! Every message starts with an 8-byte header: the 32-bit id of the target
//! object, followed by a 32-bit word whose upper half is the total message
//! size in bytes (header included) and whose lower half is the opcode.
//! Arguments follow, each padded to a 4-byte boundary. All words use the
//! host's native byte order.
//!
//! The codec knows nothing about what a message means. Decoding needs the
//! argument signature for `(object, opcode)`, which the caller supplies
//! through a lookup closure so that objects created by earlier messages in
//! the same buffer are resolved correctly.

use byteorder::{ByteOrder, NativeEndian};
use thiserror::Error;

/// Size of the message header in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest message accepted or produced, header included
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Argument types that can appear in a message signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Uint,
    Fixed,
    String,
    NullableString,
    Object,
    NullableObject,
    NewId,
    Array,
    /// File descriptor, carried out of band in `SCM_RIGHTS` ancillary data
    Fd,
}

/// 24.8 signed fixed-point number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fixed(pub i32);

impl Fixed {
    pub fn from_f64(value: f64) -> Self {
        Fixed((value * 256.0).round() as i32)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / 256.0
    }
}

/// A decoded argument value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    /// `None` is the null string (length 0 on the wire)
    Str(Option<String>),
    /// Object id, 0 meaning null
    Object(u32),
    NewId(u32),
    Array(Vec<u8>),
    /// Marks where a descriptor belongs; the descriptor itself travels
    /// beside the byte stream and occupies no bytes
    Fd,
}

impl Argument {
    /// Bytes this argument occupies on the wire, padding included
    fn wire_len(&self) -> usize {
        match self {
            Argument::Str(None) => 4,
            Argument::Str(Some(s)) => 4 + padded(s.len() + 1),
            Argument::Array(a) => 4 + padded(a.len()),
            Argument::Fd => 0,
            _ => 4,
        }
    }
}

/// Errors produced while framing or parsing messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message needs {needed} bytes but only {available} are available")]
    Truncated { needed: usize, available: usize },

    #[error("invalid message size {0}")]
    InvalidSize(usize),

    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    TooLarge(usize),

    #[error("unknown object {0}")]
    UnknownObject(u32),

    #[error("opcode {opcode} is not a request of {interface}@{object_id}")]
    UnknownOpcode {
        object_id: u32,
        interface: &'static str,
        opcode: u16,
    },

    #[error("argument {index} is invalid: {reason}")]
    BadArgument { index: usize, reason: &'static str },

    #[error("argument {index} should be {expected:?}")]
    ArgumentMismatch { index: usize, expected: ArgKind },

    #[error("{0} trailing bytes after the last argument")]
    TrailingBytes(usize),
}

/// The fixed-size prefix of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub object_id: u32,
    pub opcode: u16,
    pub size: u16,
}

impl MessageHeader {
    /// Parses and validates the header at the start of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        let object_id = NativeEndian::read_u32(&buf[0..4]);
        let word = NativeEndian::read_u32(&buf[4..8]);
        let size = (word >> 16) as u16;
        let opcode = (word & 0xffff) as u16;

        let len = size as usize;
        if len < HEADER_SIZE || len % 4 != 0 {
            return Err(CodecError::InvalidSize(len));
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge(len));
        }

        Ok(Self {
            object_id,
            opcode,
            size,
        })
    }

    /// Checks whether `buf` starts with a complete frame
    ///
    /// Returns `Ok(None)` while more bytes are needed, `Ok(Some(len))` once the
    /// whole frame is buffered, and an error if the header itself is invalid.
    pub fn peek(buf: &[u8]) -> Result<Option<usize>, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = Self::parse(buf)?;
        let len = header.size as usize;
        Ok((buf.len() >= len).then_some(len))
    }
}

/// A single request or event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub object_id: u32,
    pub opcode: u16,
    pub args: Vec<Argument>,
}

impl Message {
    pub fn new(object_id: u32, opcode: u16, args: Vec<Argument>) -> Self {
        Self {
            object_id,
            opcode,
            args,
        }
    }

    /// Total encoded size in bytes, header included
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.args.iter().map(Argument::wire_len).sum::<usize>()
    }

    /// Appends the wire form of this message to `buf`
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let len = self.encoded_len();
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge(len));
        }

        buf.reserve(len);
        put_u32(buf, self.object_id);
        put_u32(buf, ((len as u32) << 16) | self.opcode as u32);

        for arg in &self.args {
            match arg {
                Argument::Int(v) => put_u32(buf, *v as u32),
                Argument::Uint(v) => put_u32(buf, *v),
                Argument::Fixed(f) => put_u32(buf, f.0 as u32),
                Argument::Object(id) | Argument::NewId(id) => put_u32(buf, *id),
                Argument::Str(None) => put_u32(buf, 0),
                Argument::Str(Some(s)) => {
                    put_u32(buf, (s.len() + 1) as u32);
                    buf.extend_from_slice(s.as_bytes());
                    buf.push(0);
                    pad(buf, s.len() + 1);
                }
                Argument::Array(data) => {
                    put_u32(buf, data.len() as u32);
                    buf.extend_from_slice(data);
                    pad(buf, data.len());
                }
                Argument::Fd => {}
            }
        }
        Ok(())
    }

    /// Encodes into a fresh buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one message from the front of `buf`
    ///
    /// Returns the message and the number of bytes consumed.
    pub fn decode<F>(buf: &[u8], signature: F) -> Result<(Message, usize), CodecError>
    where
        F: FnOnce(u32, u16) -> Result<&'static [ArgKind], CodecError>,
    {
        let header = MessageHeader::parse(buf)?;
        let len = header.size as usize;
        if buf.len() < len {
            return Err(CodecError::Truncated {
                needed: len,
                available: buf.len(),
            });
        }

        let kinds = signature(header.object_id, header.opcode)?;
        let mut cursor = &buf[HEADER_SIZE..len];
        let mut args = Vec::with_capacity(kinds.len());

        for (index, kind) in kinds.iter().enumerate() {
            args.push(read_argument(&mut cursor, *kind, index)?);
        }
        if !cursor.is_empty() {
            return Err(CodecError::TrailingBytes(cursor.len()));
        }

        Ok((
            Message {
                object_id: header.object_id,
                opcode: header.opcode,
                args,
            },
            len,
        ))
    }

    // Typed argument accessors used by the request parsers

    pub fn int(&self, index: usize) -> Result<i32, CodecError> {
        match self.args.get(index) {
            Some(Argument::Int(v)) => Ok(*v),
            _ => Err(CodecError::ArgumentMismatch {
                index,
                expected: ArgKind::Int,
            }),
        }
    }

    pub fn uint(&self, index: usize) -> Result<u32, CodecError> {
        match self.args.get(index) {
            Some(Argument::Uint(v)) => Ok(*v),
            _ => Err(CodecError::ArgumentMismatch {
                index,
                expected: ArgKind::Uint,
            }),
        }
    }

    pub fn string(&self, index: usize) -> Result<Option<&str>, CodecError> {
        match self.args.get(index) {
            Some(Argument::Str(s)) => Ok(s.as_deref()),
            _ => Err(CodecError::ArgumentMismatch {
                index,
                expected: ArgKind::String,
            }),
        }
    }

    /// Object argument, `None` for the null object
    pub fn object(&self, index: usize) -> Result<Option<u32>, CodecError> {
        match self.args.get(index) {
            Some(Argument::Object(0)) => Ok(None),
            Some(Argument::Object(id)) => Ok(Some(*id)),
            _ => Err(CodecError::ArgumentMismatch {
                index,
                expected: ArgKind::Object,
            }),
        }
    }

    pub fn new_id(&self, index: usize) -> Result<u32, CodecError> {
        match self.args.get(index) {
            Some(Argument::NewId(id)) => Ok(*id),
            _ => Err(CodecError::ArgumentMismatch {
                index,
                expected: ArgKind::NewId,
            }),
        }
    }
}

/// Lazily decodes consecutive messages from a byte buffer
///
/// Signatures are resolved per message, right before it is decoded. After
/// the first error the reader yields nothing more.
pub struct MessageReader<'a, F> {
    buf: &'a [u8],
    offset: usize,
    signature: F,
    failed: bool,
}

impl<'a, F> MessageReader<'a, F>
where
    F: FnMut(u32, u16) -> Result<&'static [ArgKind], CodecError>,
{
    pub fn new(buf: &'a [u8], signature: F) -> Self {
        Self {
            buf,
            offset: 0,
            signature,
            failed: false,
        }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.offset
    }
}

impl<'a, F> Iterator for MessageReader<'a, F>
where
    F: FnMut(u32, u16) -> Result<&'static [ArgKind], CodecError>,
{
    type Item = Result<Message, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }
        let signature = &mut self.signature;
        match Message::decode(&self.buf[self.offset..], |id, op| signature(id, op)) {
            Ok((message, used)) => {
                self.offset += used;
                Some(Ok(message))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    let mut word = [0u8; 4];
    NativeEndian::write_u32(&mut word, value);
    buf.extend_from_slice(&word);
}

fn pad(buf: &mut Vec<u8>, len: usize) {
    buf.resize(buf.len() + padded(len) - len, 0);
}

fn read_u32(cursor: &mut &[u8], index: usize) -> Result<u32, CodecError> {
    if cursor.len() < 4 {
        return Err(CodecError::BadArgument {
            index,
            reason: "payload ends before the argument",
        });
    }
    let value = NativeEndian::read_u32(&cursor[..4]);
    *cursor = &cursor[4..];
    Ok(value)
}

fn read_blob<'b>(cursor: &mut &'b [u8], len: usize, index: usize) -> Result<&'b [u8], CodecError> {
    let total = padded(len);
    if cursor.len() < total {
        return Err(CodecError::BadArgument {
            index,
            reason: "length prefix exceeds the payload",
        });
    }
    let data = &cursor[..len];
    *cursor = &cursor[total..];
    Ok(data)
}

fn read_argument(cursor: &mut &[u8], kind: ArgKind, index: usize) -> Result<Argument, CodecError> {
    let arg = match kind {
        ArgKind::Int => Argument::Int(read_u32(cursor, index)? as i32),
        ArgKind::Uint => Argument::Uint(read_u32(cursor, index)?),
        ArgKind::Fixed => Argument::Fixed(Fixed(read_u32(cursor, index)? as i32)),
        ArgKind::Object | ArgKind::NullableObject => {
            let id = read_u32(cursor, index)?;
            if id == 0 && kind == ArgKind::Object {
                return Err(CodecError::BadArgument {
                    index,
                    reason: "null object where one is required",
                });
            }
            Argument::Object(id)
        }
        ArgKind::NewId => {
            let id = read_u32(cursor, index)?;
            if id == 0 {
                return Err(CodecError::BadArgument {
                    index,
                    reason: "new_id cannot be 0",
                });
            }
            Argument::NewId(id)
        }
        ArgKind::String | ArgKind::NullableString => {
            let len = read_u32(cursor, index)? as usize;
            if len == 0 {
                if kind == ArgKind::String {
                    return Err(CodecError::BadArgument {
                        index,
                        reason: "null string where one is required",
                    });
                }
                return Ok(Argument::Str(None));
            }
            let data = read_blob(cursor, len, index)?;
            let (nul, text) = data.split_last().ok_or(CodecError::BadArgument {
                index,
                reason: "empty string payload",
            })?;
            if *nul != 0 || text.contains(&0) {
                return Err(CodecError::BadArgument {
                    index,
                    reason: "string is not NUL terminated",
                });
            }
            let text = std::str::from_utf8(text).map_err(|_| CodecError::BadArgument {
                index,
                reason: "string is not valid UTF-8",
            })?;
            Argument::Str(Some(text.to_owned()))
        }
        ArgKind::Array => {
            let len = read_u32(cursor, index)? as usize;
            Argument::Array(read_blob(cursor, len, index)?.to_vec())
        }
        ArgKind::Fd => Argument::Fd,
    };
    Ok(arg)
}
