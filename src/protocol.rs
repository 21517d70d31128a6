//! Command channel protocol definitions.
//!
//! A unit of exchange is a *box*: an ordered mapping from ASCII field names to
//! byte-string values. Field names starting with `_` are reserved for the
//! protocol itself (command name, correlation tags, error descriptions).

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Reserved field carrying the command name on requests.
pub const COMMAND: &str = "_command";
/// Reserved field carrying the request correlation tag.
pub const ASK: &str = "_ask";
/// Reserved field echoing the correlation tag on successful responses.
pub const ANSWER: &str = "_answer";
/// Reserved field echoing the correlation tag on failed responses.
pub const ERROR: &str = "_error";
/// Reserved field carrying the failure kind.
pub const ERROR_CODE: &str = "_error_code";
/// Reserved field carrying the failure description.
pub const ERROR_DESCRIPTION: &str = "_error_description";

/// Prefix marking protocol-internal field names.
pub const INTERNAL_MARKER: char = '_';

/// Errors raised while parsing boxes or routing commands.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("request has no _command field")]
    MissingCommand,

    #[error("unhandled command: {0}")]
    UnknownCommand(String),

    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered field mapping; the body of one request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    entries: Vec<(String, Bytes)>,
}

impl Fields {
    /// Create an empty box.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field. An existing key keeps its position and gets the new value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style [`Fields::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.insert(key, value);
        self
    }

    /// Raw value of a field.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Value of a field decoded as UTF-8, if present and valid.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Remove a field and return its value.
    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Whether a field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Correlation tag of a request box. Non-UTF-8 bytes are replaced.
pub fn ask_tag(fields: &Fields) -> Option<String> {
    fields
        .get(ASK)
        .map(|v| String::from_utf8_lossy(v).into_owned())
}

impl<K, V> FromIterator<(K, V)> for Fields
where
    K: Into<String>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// A parsed inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Command name from the reserved command field.
    pub command: String,
    /// Correlation tag, echoed back on the response.
    pub ask: Option<String>,
    /// Handler-specific fields.
    pub fields: Fields,
}

impl CommandRequest {
    /// Create a request without a correlation tag.
    pub fn new(command: impl Into<String>, fields: Fields) -> Self {
        Self {
            command: command.into(),
            ask: None,
            fields,
        }
    }

    /// Attach a correlation tag.
    pub fn with_ask(mut self, ask: impl Into<String>) -> Self {
        self.ask = Some(ask.into());
        self
    }

    /// Split a received box into command name, tag and handler fields.
    pub fn from_box(mut fields: Fields) -> Result<Self, ProtocolError> {
        let command = fields.remove(COMMAND).ok_or(ProtocolError::MissingCommand)?;
        let command = String::from_utf8(command.to_vec())
            .map_err(|_| ProtocolError::Malformed("command name is not UTF-8".to_string()))?;
        let ask = ask_tag(&fields);
        fields.remove(ASK);
        Ok(Self {
            command,
            ask,
            fields,
        })
    }

    /// Build the wire box: command first, then tag, then handler fields.
    pub fn into_box(self) -> Fields {
        let mut out = Fields::new().with(COMMAND, self.command);
        if let Some(ask) = self.ask {
            out.insert(ASK, ask);
        }
        for (k, v) in self.fields.entries {
            out.insert(k, v);
        }
        out
    }
}

/// Kind of a structured failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed request or unknown command.
    Protocol,
    /// The handler reported a failure.
    Handler,
}

impl FailureKind {
    /// Wire code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            FailureKind::Protocol => "PROTOCOL_ERROR",
            FailureKind::Handler => "HANDLER_ERROR",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "PROTOCOL_ERROR" => Some(FailureKind::Protocol),
            "HANDLER_ERROR" => Some(FailureKind::Handler),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A structured failure: kind plus human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub description: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Success(Fields),
    Failure(Failure),
}

impl CommandResponse {
    /// Create a successful response.
    pub fn success(fields: Fields) -> Self {
        CommandResponse::Success(fields)
    }

    /// Create a failure response.
    pub fn failure(kind: FailureKind, description: impl Into<String>) -> Self {
        CommandResponse::Failure(Failure {
            kind,
            description: description.into(),
        })
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        matches!(self, CommandResponse::Success(_))
    }

    /// Response fields on success.
    #[cfg(test)]
    pub fn fields(&self) -> Option<&Fields> {
        match self {
            CommandResponse::Success(fields) => Some(fields),
            CommandResponse::Failure(_) => None,
        }
    }

    /// Build the wire box, echoing the request tag if there was one.
    pub fn into_box(self, ask: Option<&str>) -> Fields {
        match self {
            CommandResponse::Success(fields) => {
                let mut out = Fields::new();
                if let Some(ask) = ask {
                    out.insert(ANSWER, ask.to_string());
                }
                for (k, v) in fields.entries {
                    out.insert(k, v);
                }
                out
            }
            CommandResponse::Failure(failure) => {
                let mut out = Fields::new();
                if let Some(ask) = ask {
                    out.insert(ERROR, ask.to_string());
                }
                out.insert(ERROR_CODE, failure.kind.code());
                out.insert(ERROR_DESCRIPTION, failure.description);
                out
            }
        }
    }

    /// Parse a response box into its correlation tag and outcome.
    pub fn from_box(mut fields: Fields) -> Result<(Option<String>, Self), ProtocolError> {
        if let Some(code) = fields.remove(ERROR_CODE) {
            let code = String::from_utf8_lossy(&code).into_owned();
            let kind = FailureKind::from_code(&code)
                .ok_or_else(|| ProtocolError::Malformed(format!("unknown error code {code}")))?;
            let description = fields
                .remove(ERROR_DESCRIPTION)
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .unwrap_or_default();
            let tag = fields
                .remove(ERROR)
                .map(|v| String::from_utf8_lossy(&v).into_owned());
            return Ok((tag, CommandResponse::failure(kind, description)));
        }
        let tag = fields
            .remove(ANSWER)
            .map(|v| String::from_utf8_lossy(&v).into_owned());
        Ok((tag, CommandResponse::Success(fields)))
    }
}

/// Framing for boxes.
/// Format: 4 bytes (big-endian u32) frame length, then per field a
/// big-endian u16 key length, key bytes, big-endian u32 value length and
/// value bytes.
pub mod framing {
    use super::{Fields, ProtocolError};
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Largest accepted frame body.
    pub const MAX_FRAME_LEN: usize = 1024 * 1024;

    /// Serialize a box into a frame body.
    pub fn encode(fields: &Fields) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        for (key, value) in fields.iter() {
            let key_len = u16::try_from(key.len())
                .map_err(|_| ProtocolError::Malformed(format!("field name too long: {key}")))?;
            let value_len = u32::try_from(value.len())
                .map_err(|_| ProtocolError::FrameTooLarge(value.len()))?;
            buf.put_u16(key_len);
            buf.put_slice(key.as_bytes());
            buf.put_u32(value_len);
            buf.put_slice(value);
        }
        if buf.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(buf.len()));
        }
        Ok(buf.freeze())
    }

    /// Parse a frame body into a box.
    pub fn decode(mut body: Bytes) -> Result<Fields, ProtocolError> {
        let mut fields = Fields::new();
        while body.has_remaining() {
            if body.remaining() < 2 {
                return Err(ProtocolError::Malformed("truncated field name length".into()));
            }
            let key_len = body.get_u16() as usize;
            if key_len == 0 {
                return Err(ProtocolError::Malformed("empty field name".into()));
            }
            if body.remaining() < key_len {
                return Err(ProtocolError::Malformed("truncated field name".into()));
            }
            let key = body.split_to(key_len);
            if !key.is_ascii() {
                return Err(ProtocolError::Malformed("field name is not ASCII".into()));
            }
            // ASCII is valid UTF-8
            let key = String::from_utf8_lossy(&key).into_owned();
            if body.remaining() < 4 {
                return Err(ProtocolError::Malformed("truncated value length".into()));
            }
            let value_len = body.get_u32() as usize;
            if body.remaining() < value_len {
                return Err(ProtocolError::Malformed(format!("truncated value for {key}")));
            }
            let value = body.split_to(value_len);
            if fields.contains(&key) {
                return Err(ProtocolError::Malformed(format!("duplicate field {key}")));
            }
            fields.insert(key, value);
        }
        Ok(fields)
    }

    /// Write a length-prefixed box.
    pub async fn write_box<W>(writer: &mut W, fields: &Fields) -> Result<(), ProtocolError>
    where
        W: AsyncWriteExt + Unpin,
    {
        let body = encode(fields)?;
        writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a length-prefixed box. Returns `None` when the peer closed the
    /// stream before a new frame started.
    pub async fn read_box<R>(reader: &mut R) -> Result<Option<Fields>, ProtocolError>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        decode(Bytes::from(buf)).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_preserve_insertion_order() {
        let fields = Fields::new().with("b", "1").with("a", "2").with("c", "3");
        let keys: Vec<_> = fields.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_fields_insert_replaces_in_place() {
        let mut fields = Fields::new().with("a", "1").with("b", "2");
        fields.insert("a", "3");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.iter().next().map(|(k, _)| k), Some("a"));
        assert_eq!(fields.get_str("a"), Some("3"));
    }

    #[test]
    fn test_request_from_box() {
        let raw = Fields::new()
            .with("x", "hello")
            .with(COMMAND, "echo")
            .with(ASK, "17");
        let req = CommandRequest::from_box(raw).unwrap();
        assert_eq!(req.command, "echo");
        assert_eq!(req.ask.as_deref(), Some("17"));
        assert_eq!(req.fields, Fields::new().with("x", "hello"));
    }

    #[test]
    fn test_request_without_command() {
        let raw = Fields::new().with("x", "hello");
        assert!(matches!(
            CommandRequest::from_box(raw),
            Err(ProtocolError::MissingCommand)
        ));
    }

    #[test]
    fn test_failure_box() {
        let resp = CommandResponse::failure(FailureKind::Handler, "boom");
        let wire = resp.clone().into_box(Some("4"));
        assert_eq!(wire.get_str(ERROR), Some("4"));
        assert_eq!(wire.get_str(ERROR_CODE), Some("HANDLER_ERROR"));
        let (tag, parsed) = CommandResponse::from_box(wire).unwrap();
        assert_eq!(tag.as_deref(), Some("4"));
        assert_eq!(parsed, resp);
    }

    #[test]
    fn test_decode_rejects_truncated_value() {
        let body = framing::encode(&Fields::new().with("key", "value")).unwrap();
        let truncated = body.slice(..body.len() - 1);
        assert!(matches!(
            framing::decode(truncated),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_duplicate_field() {
        let mut raw = framing::encode(&Fields::new().with("k", "1")).unwrap().to_vec();
        raw.extend_from_within(..);
        assert!(matches!(
            framing::decode(Bytes::from(raw)),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_binary_values_survive_framing() {
        let fields = Fields::new().with("blob", vec![0u8, 0xff, 0xfe, b'\n']);
        let decoded = framing::decode(framing::encode(&fields).unwrap()).unwrap();
        assert_eq!(decoded, fields);
    }

    #[tokio::test]
    async fn test_read_box_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(framing::read_box(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_box_rejects_oversized_frame() {
        let header = ((framing::MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let mut reader: &[u8] = &header;
        assert!(matches!(
            framing::read_box(&mut reader).await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
