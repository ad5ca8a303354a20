//! PostgreSQL frontend/backend protocol (v3) framing.
//!
//! The proxy relays most traffic untouched, so only the messages it
//! inspects get real structure: `Q` (simple query), `P` (extended
//! parse), `p` (password) and `T` (row description). Everything else
//! moves through as an opaque [`Frame`].

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version number (v3.0) sent in a normal startup request.
pub const VERSION_V3: i32 = 0x30000;
/// Magic version number of a cancellation request.
pub const VERSION_CANCEL: i32 = (1234 << 16) ^ 5678;
/// Magic version number of an SSL negotiation request.
pub const VERSION_SSL: i32 = (1234 << 16) ^ 5679;

pub const MSG_QUERY: u8 = b'Q';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_PASSWORD: u8 = b'p';
pub const MSG_ROW_DESCRIPTION: u8 = b'T';

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidProtocolVersion(i32),
    #[error("invalid message length: {0}")]
    InvalidMsgLength(i32),
    #[error("missing null terminator")]
    MissingNullByte,
    #[error("truncated message payload")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One typed protocol message: a tag byte plus its payload, the length
/// word excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Read one complete frame, `None` on clean end of stream.
    pub async fn read<C>(conn: &mut C) -> Result<Option<Frame>, WireError>
    where
        C: AsyncRead + Unpin,
    {
        let msg_type = match conn.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let len = conn.read_i32().await?;
        if len < 4 {
            return Err(WireError::InvalidMsgLength(len));
        }
        let mut payload = vec![0u8; len as usize - 4];
        conn.read_exact(&mut payload).await?;
        Ok(Some(Frame { msg_type, payload }))
    }

    pub async fn write<C>(&self, conn: &mut C) -> Result<(), WireError>
    where
        C: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 5);
        buf.put_u8(self.msg_type);
        buf.put_i32(self.payload.len() as i32 + 4);
        buf.put_slice(&self.payload);
        conn.write_all(&buf).await?;
        Ok(())
    }
}

/// Startup traffic is unframed: a length word, a version, then the
/// version-specific remainder.
#[derive(Debug)]
pub enum StartupMessage {
    SslRequest,
    CancelRequest { raw: Vec<u8> },
    Startup {
        params: HashMap<String, String>,
        raw: Vec<u8>,
    },
}

impl StartupMessage {
    /// Re-encode for byte-identical relay to the upstream server.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            StartupMessage::SslRequest => encode_startup(VERSION_SSL, &[]),
            StartupMessage::CancelRequest { raw } => encode_startup(VERSION_CANCEL, raw),
            StartupMessage::Startup { raw, .. } => encode_startup(VERSION_V3, raw),
        }
    }
}

pub async fn read_startup<C>(conn: &mut C) -> Result<StartupMessage, WireError>
where
    C: AsyncRead + Unpin,
{
    let msg_len = conn.read_i32().await?;
    if msg_len < 8 {
        return Err(WireError::InvalidMsgLength(msg_len));
    }
    let version = conn.read_i32().await?;
    let mut raw = vec![0u8; msg_len as usize - 8];
    conn.read_exact(&mut raw).await?;
    match version {
        VERSION_SSL => Ok(StartupMessage::SslRequest),
        VERSION_CANCEL => Ok(StartupMessage::CancelRequest { raw }),
        VERSION_V3 => {
            let params = parse_startup_params(&raw)?;
            Ok(StartupMessage::Startup { params, raw })
        }
        other => Err(WireError::InvalidProtocolVersion(other)),
    }
}

pub fn encode_startup(version: i32, raw: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(raw.len() + 8);
    buf.put_i32(raw.len() as i32 + 8);
    buf.put_i32(version);
    buf.put_slice(raw);
    buf.to_vec()
}

fn parse_startup_params(mut buf: &[u8]) -> Result<HashMap<String, String>, WireError> {
    let mut params = HashMap::new();
    while buf.first().is_some_and(|b| *b != 0) {
        let key = take_cstring(&mut buf)?;
        let val = take_cstring(&mut buf)?;
        params.insert(key, val);
    }
    Ok(params)
}

fn take_cstring(buf: &mut &[u8]) -> Result<String, WireError> {
    let pos = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(WireError::MissingNullByte)?;
    let s = String::from_utf8_lossy(&buf[..pos]).into_owned();
    *buf = &buf[pos + 1..];
    Ok(s)
}

/// The query text of a simple query (`Q`) message.
pub fn query_text(frame: &Frame) -> Result<String, WireError> {
    let mut buf = frame.payload.as_slice();
    take_cstring(&mut buf)
}

/// Build a simple query (`Q`) frame around `sql`.
pub fn query_frame(sql: &str) -> Frame {
    let mut payload = Vec::with_capacity(sql.len() + 1);
    payload.extend_from_slice(sql.as_bytes());
    payload.push(0);
    Frame::new(MSG_QUERY, payload)
}

/// The password of a `p` (PasswordMessage) frame, plaintext or hashed.
pub fn password_text(frame: &Frame) -> Result<String, WireError> {
    let mut buf = frame.payload.as_slice();
    take_cstring(&mut buf)
}

/// Extended-protocol Parse (`P`): statement name, query text, then
/// parameter type data the proxy never touches.
#[derive(Debug)]
pub struct ParseMessage {
    pub name: String,
    pub sql: String,
    rest: Vec<u8>,
}

pub fn decode_parse(frame: &Frame) -> Result<ParseMessage, WireError> {
    let mut buf = frame.payload.as_slice();
    let name = take_cstring(&mut buf)?;
    let sql = take_cstring(&mut buf)?;
    Ok(ParseMessage {
        name,
        sql,
        rest: buf.to_vec(),
    })
}

impl ParseMessage {
    /// Rebuild the frame with `sql` in place of the original text.
    pub fn with_sql(&self, sql: &str) -> Frame {
        let mut payload =
            Vec::with_capacity(self.name.len() + sql.len() + self.rest.len() + 2);
        payload.extend_from_slice(self.name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(sql.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&self.rest);
        Frame::new(MSG_PARSE, payload)
    }
}

/// Row description (`T`): a field count, then per field a name and an
/// 18-byte tail (table oid, attnum, type oid, len, mod, format) kept
/// opaque.
#[derive(Debug)]
pub struct RowDescription {
    fields: Vec<(String, Vec<u8>)>,
}

pub fn decode_row_description(frame: &Frame) -> Result<RowDescription, WireError> {
    let mut buf = frame.payload.as_slice();
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    let count = buf.get_i16();
    let mut fields = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name = take_cstring(&mut buf)?;
        if buf.remaining() < 18 {
            return Err(WireError::Truncated);
        }
        let tail = buf[..18].to_vec();
        buf.advance(18);
        fields.push((name, tail));
    }
    Ok(RowDescription { fields })
}

impl RowDescription {
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Rename every field for which `rename` returns a new name.
    pub fn rename_fields(&mut self, rename: impl Fn(&str) -> Option<String>) {
        for (name, _) in &mut self.fields {
            if let Some(new_name) = rename(name) {
                *name = new_name;
            }
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut payload = BytesMut::new();
        payload.put_i16(self.fields.len() as i16);
        for (name, tail) in &self.fields {
            payload.put_slice(name.as_bytes());
            payload.put_u8(0);
            payload.put_slice(tail);
        }
        Frame::new(MSG_ROW_DESCRIPTION, payload.to_vec())
    }
}
