//! PostgreSQL wire protocol codec.
//!
//! Frontend frames are `[tag][i32 length incl. itself][payload]`; the startup
//! packet has no tag. `PgCodec` buffers partial frames across reads and only
//! yields complete messages. Every read is bounds-checked, so malformed input
//! becomes an error for the session instead of a panic.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196_608;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: i32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// `text` type oid; every column and parameter is described as text.
pub const TEXT_OID: i32 = 25;

const MIN_STARTUP_LEN: usize = 8;
const MAX_STARTUP_LEN: usize = 10_000;
const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A bound parameter value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindValue {
    Text(String),
    Null,
    /// Binary-format value, kept opaque.
    Binary(Vec<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

/// Client-to-server messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrontendMessage {
    SslRequest,
    GssEncRequest,
    CancelRequest,
    Startup {
        version: i32,
        params: BTreeMap<String, String>,
    },
    Query(String),
    Parse {
        name: String,
        query: String,
        param_types: Vec<i32>,
    },
    Bind {
        portal: String,
        statement: String,
        params: Vec<BindValue>,
    },
    Describe {
        target: DescribeTarget,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Close {
        target: DescribeTarget,
        name: String,
    },
    Sync,
    Flush,
    Terminate,
}

/// Server-to-client messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendMessage {
    /// Single untagged `N` byte refusing SSL/GSS encryption.
    EncryptionRefused,
    AuthenticationOk,
    ParameterStatus { name: String, value: String },
    /// Always reports an idle session.
    ReadyForQuery,
    RowDescription { columns: Vec<String> },
    DataRow { values: Vec<Option<String>> },
    CommandComplete { tag: String },
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    ParameterDescription { type_oids: Vec<i32> },
    EmptyQueryResponse,
    ErrorResponse {
        severity: String,
        code: String,
        message: String,
    },
}

impl BackendMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        BackendMessage::ErrorResponse {
            severity: "ERROR".to_string(),
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Append the encoded message to `buf`. Nothing is written when a count
    /// or length does not fit its wire field.
    pub fn encode(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            BackendMessage::EncryptionRefused => buf.put_u8(b'N'),
            BackendMessage::AuthenticationOk => {
                buf.put_u8(b'R');
                buf.put_i32(8);
                buf.put_i32(0);
            }
            BackendMessage::ParameterStatus { name, value } => {
                write_frame(buf, b'S', |body| {
                    write_cstring(body, name);
                    write_cstring(body, value);
                    Ok(())
                })?;
            }
            BackendMessage::ReadyForQuery => {
                buf.put_u8(b'Z');
                buf.put_i32(5);
                buf.put_u8(b'I');
            }
            BackendMessage::RowDescription { columns } => {
                write_frame(buf, b'T', |body| {
                    body.put_i16(wire_count(columns.len(), "row description columns")?);
                    for name in columns {
                        write_cstring(body, name);
                        body.put_i32(0); // table oid
                        body.put_i16(0); // column attribute number
                        body.put_i32(TEXT_OID);
                        body.put_i16(-1); // variable length
                        body.put_i32(0); // type modifier
                        body.put_i16(0); // text format
                    }
                    Ok(())
                })?;
            }
            BackendMessage::DataRow { values } => {
                write_frame(buf, b'D', |body| {
                    body.put_i16(wire_count(values.len(), "data row fields")?);
                    for value in values {
                        match value {
                            Some(text) => {
                                body.put_i32(wire_len(text.len(), "data row field")?);
                                body.put_slice(text.as_bytes());
                            }
                            None => body.put_i32(-1),
                        }
                    }
                    Ok(())
                })?;
            }
            BackendMessage::CommandComplete { tag } => {
                write_frame(buf, b'C', |body| {
                    write_cstring(body, tag);
                    Ok(())
                })?;
            }
            BackendMessage::ParseComplete => write_empty(buf, b'1'),
            BackendMessage::BindComplete => write_empty(buf, b'2'),
            BackendMessage::CloseComplete => write_empty(buf, b'3'),
            BackendMessage::NoData => write_empty(buf, b'n'),
            BackendMessage::EmptyQueryResponse => write_empty(buf, b'I'),
            BackendMessage::ParameterDescription { type_oids } => {
                write_frame(buf, b't', |body| {
                    body.put_i16(wire_count(type_oids.len(), "parameter types")?);
                    for oid in type_oids {
                        body.put_i32(*oid);
                    }
                    Ok(())
                })?;
            }
            BackendMessage::ErrorResponse {
                severity,
                code,
                message,
            } => {
                write_frame(buf, b'E', |body| {
                    body.put_u8(b'S');
                    write_cstring(body, severity);
                    body.put_u8(b'V');
                    write_cstring(body, severity);
                    body.put_u8(b'C');
                    write_cstring(body, code);
                    body.put_u8(b'M');
                    write_cstring(body, message);
                    body.put_u8(0);
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}

fn wire_count(n: usize, what: &str) -> anyhow::Result<i16> {
    i16::try_from(n).map_err(|_| anyhow::anyhow!("too many {what} for one message: {n}"))
}

fn wire_len(n: usize, what: &str) -> anyhow::Result<i32> {
    i32::try_from(n).map_err(|_| anyhow::anyhow!("{what} of {n} bytes is too long"))
}

fn write_frame(
    buf: &mut BytesMut,
    tag: u8,
    fill: impl FnOnce(&mut BytesMut) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let mut body = BytesMut::new();
    fill(&mut body)?;
    let len = wire_len(body.len() + 4, "message")?;
    buf.put_u8(tag);
    buf.put_i32(len);
    buf.extend_from_slice(&body);
    Ok(())
}

fn write_empty(buf: &mut BytesMut, tag: u8) {
    buf.put_u8(tag);
    buf.put_i32(4);
}

fn write_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Split a buffer of back-to-back tagged frames. Each slice keeps its tag
/// byte and length. A trailing partial frame is an error.
pub fn split_frames(mut buf: &[u8]) -> anyhow::Result<Vec<&[u8]>> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        anyhow::ensure!(buf.len() >= 5, "truncated frame header ({} bytes)", buf.len());
        let len = (&buf[1..5]).get_i32();
        anyhow::ensure!(len >= 4, "invalid frame length {len}");
        let total = 1 + len as usize;
        anyhow::ensure!(
            total <= buf.len(),
            "frame length {len} exceeds remaining {} bytes",
            buf.len() - 1
        );
        let (frame, rest) = buf.split_at(total);
        frames.push(frame);
        buf = rest;
    }
    Ok(frames)
}

/// Bounds-checked reader over one frame payload.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.buf.len() >= n,
            "truncated {what}: need {n} bytes, have {}",
            self.buf.len()
        );
        Ok(())
    }

    fn u8(&mut self, what: &str) -> anyhow::Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self, what: &str) -> anyhow::Result<i16> {
        self.need(2, what)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self, what: &str) -> anyhow::Result<i32> {
        self.need(4, what)?;
        Ok(self.buf.get_i32())
    }

    fn count(&mut self, what: &str) -> anyhow::Result<usize> {
        let n = self.i16(what)?;
        anyhow::ensure!(n >= 0, "negative {what}: {n}");
        Ok(n as usize)
    }

    fn bytes(&mut self, n: usize, what: &str) -> anyhow::Result<&'a [u8]> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn cstring(&mut self, what: &str) -> anyhow::Result<String> {
        let pos = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| anyhow::anyhow!("unterminated {what}"))?;
        let s = std::str::from_utf8(&self.buf[..pos])
            .map_err(|_| anyhow::anyhow!("invalid UTF-8 in {what}"))?
            .to_string();
        self.buf = &self.buf[pos + 1..];
        Ok(s)
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

fn describe_target(kind: u8) -> anyhow::Result<DescribeTarget> {
    match kind {
        b'S' => Ok(DescribeTarget::Statement),
        b'P' => Ok(DescribeTarget::Portal),
        other => anyhow::bail!("invalid describe target {:?}", other as char),
    }
}

/// Decode the startup-phase packet body (after its length field).
fn decode_startup(body: &[u8]) -> anyhow::Result<FrontendMessage> {
    let mut r = Reader::new(body);
    let version = r.i32("startup version")?;
    match version {
        SSL_REQUEST_CODE => return Ok(FrontendMessage::SslRequest),
        GSSENC_REQUEST_CODE => return Ok(FrontendMessage::GssEncRequest),
        CANCEL_REQUEST_CODE => return Ok(FrontendMessage::CancelRequest),
        _ => {}
    }
    anyhow::ensure!(
        version >> 16 == 3,
        "unsupported protocol version {}.{}",
        version >> 16,
        version & 0xffff
    );

    let mut params = BTreeMap::new();
    while r.remaining() > 0 {
        let key = r.cstring("startup parameter name")?;
        if key.is_empty() {
            break;
        }
        let value = r.cstring("startup parameter value")?;
        params.insert(key, value);
    }
    Ok(FrontendMessage::Startup { version, params })
}

/// Decode one complete tagged frame (tag and length included).
pub fn decode_frame(frame: &[u8]) -> anyhow::Result<FrontendMessage> {
    anyhow::ensure!(frame.len() >= 5, "truncated frame header");
    let tag = frame[0];
    let mut r = Reader::new(&frame[5..]);

    let msg = match tag {
        b'Q' => FrontendMessage::Query(r.cstring("query string")?),
        b'P' => {
            let name = r.cstring("statement name")?;
            let query = r.cstring("statement text")?;
            let n = r.count("parameter type count")?;
            let mut param_types = Vec::with_capacity(n);
            for _ in 0..n {
                param_types.push(r.i32("parameter type")?);
            }
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            }
        }
        b'B' => {
            let portal = r.cstring("portal name")?;
            let statement = r.cstring("statement name")?;
            let n_formats = r.count("parameter format count")?;
            let mut formats = Vec::with_capacity(n_formats);
            for _ in 0..n_formats {
                formats.push(r.i16("parameter format")?);
            }
            let n_params = r.count("parameter count")?;
            anyhow::ensure!(
                matches!(n_formats, 0 | 1) || n_formats == n_params,
                "bind has {n_formats} formats for {n_params} parameters"
            );
            let mut params = Vec::with_capacity(n_params);
            for idx in 0..n_params {
                let format = match n_formats {
                    0 => 0,
                    1 => formats[0],
                    _ => formats[idx],
                };
                let len = r.i32("parameter length")?;
                if len < 0 {
                    params.push(BindValue::Null);
                    continue;
                }
                let raw = r.bytes(len as usize, "parameter value")?;
                let value = if format == 0 {
                    let text = std::str::from_utf8(raw)
                        .map_err(|_| anyhow::anyhow!("invalid UTF-8 in text parameter {}", idx + 1))?;
                    BindValue::Text(text.to_string())
                } else {
                    BindValue::Binary(raw.to_vec())
                };
                params.push(value);
            }
            // Result-column format codes follow; every column is sent as text.
            FrontendMessage::Bind {
                portal,
                statement,
                params,
            }
        }
        b'D' => {
            let target = describe_target(r.u8("describe target")?)?;
            FrontendMessage::Describe {
                target,
                name: r.cstring("describe name")?,
            }
        }
        b'E' => {
            let portal = r.cstring("portal name")?;
            let max_rows = r.i32("row limit")?;
            FrontendMessage::Execute { portal, max_rows }
        }
        b'C' => {
            let target = describe_target(r.u8("close target")?)?;
            FrontendMessage::Close {
                target,
                name: r.cstring("close name")?,
            }
        }
        b'S' => FrontendMessage::Sync,
        b'H' => FrontendMessage::Flush,
        b'X' => FrontendMessage::Terminate,
        other => anyhow::bail!("unsupported frontend message {:?}", other as char),
    };
    Ok(msg)
}

/// Command tag for a statement, chosen from its leading keyword.
pub fn command_tag(sql: &str) -> String {
    let keyword: String = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    match keyword.to_ascii_uppercase().as_str() {
        "INSERT" => "INSERT 0 1",
        "UPDATE" => "UPDATE 1",
        "DELETE" => "DELETE 1",
        _ => "SELECT 1",
    }
    .to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Startup,
    Ready,
}

/// Stateful framing codec for one client connection.
#[derive(Debug)]
pub struct PgCodec {
    phase: Phase,
    max_frame_len: usize,
}

impl Default for PgCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PgCodec {
    pub fn new() -> Self {
        Self {
            phase: Phase::Startup,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len.max(5);
        self
    }
}

impl Decoder for PgCodec {
    type Item = FrontendMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.phase {
            Phase::Startup => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let len = (&src[0..4]).get_i32();
                anyhow::ensure!(
                    len >= MIN_STARTUP_LEN as i32 && len <= MAX_STARTUP_LEN as i32,
                    "invalid startup packet length {len}"
                );
                let len = len as usize;
                if src.len() < len {
                    src.reserve(len - src.len());
                    return Ok(None);
                }
                let packet = src.split_to(len);
                let msg = decode_startup(&packet[4..])?;
                if matches!(msg, FrontendMessage::Startup { .. }) {
                    self.phase = Phase::Ready;
                }
                Ok(Some(msg))
            }
            Phase::Ready => {
                if src.len() < 5 {
                    return Ok(None);
                }
                let len = (&src[1..5]).get_i32();
                anyhow::ensure!(len >= 4, "invalid frame length {len}");
                let total = 1 + len as usize;
                anyhow::ensure!(
                    total <= self.max_frame_len,
                    "frame of {total} bytes exceeds limit {}",
                    self.max_frame_len
                );
                if src.len() < total {
                    src.reserve(total - src.len());
                    return Ok(None);
                }
                let frame = src.split_to(total);
                decode_frame(&frame).map(Some)
            }
        }
    }
}

impl Encoder<BackendMessage> for PgCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: BackendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&(4 + body.len() as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn startup_packet(params: &[(&str, &str)]) -> Vec<u8> {
        let mut body = PROTOCOL_VERSION.to_be_bytes().to_vec();
        for (k, v) in params {
            body.extend_from_slice(k.as_bytes());
            body.push(0);
            body.extend_from_slice(v.as_bytes());
            body.push(0);
        }
        body.push(0);
        let mut out = (4 + body.len() as i32).to_be_bytes().to_vec();
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn response_sequence_splits_back_into_frames() {
        let messages = [
            BackendMessage::RowDescription {
                columns: vec!["id".into(), "name".into()],
            },
            BackendMessage::DataRow {
                values: vec![Some("1".into()), Some("Ada".into())],
            },
            BackendMessage::CommandComplete {
                tag: "SELECT 1".into(),
            },
            BackendMessage::ReadyForQuery,
        ];
        let mut buf = BytesMut::new();
        let mut expected = Vec::new();
        for msg in &messages {
            let mut one = BytesMut::new();
            msg.encode(&mut one).unwrap();
            expected.push(one.to_vec());
            msg.encode(&mut buf).unwrap();
        }

        let frames = split_frames(&buf).unwrap();
        let tags: Vec<u8> = frames.iter().map(|f| f[0]).collect();
        assert_eq!(tags, b"TDCZ");
        for (frame, expected) in frames.iter().zip(&expected) {
            assert_eq!(*frame, expected.as_slice());
            let len = i32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
            assert_eq!(len as usize, frame.len() - 1);
        }
    }

    #[test]
    fn row_description_describes_text_columns() {
        let mut buf = BytesMut::new();
        BackendMessage::RowDescription {
            columns: vec!["id".into()],
        }
        .encode(&mut buf)
        .unwrap();
        let body = &buf[5..];
        assert_eq!(&body[0..2], &1i16.to_be_bytes());
        assert_eq!(&body[2..5], b"id\0");
        let fields = &body[5..];
        assert_eq!(&fields[0..4], &0i32.to_be_bytes());
        assert_eq!(&fields[4..6], &0i16.to_be_bytes());
        assert_eq!(&fields[6..10], &25i32.to_be_bytes());
        assert_eq!(&fields[10..12], &(-1i16).to_be_bytes());
        assert_eq!(&fields[12..16], &0i32.to_be_bytes());
        assert_eq!(&fields[16..18], &0i16.to_be_bytes());
    }

    #[test]
    fn oversized_counts_are_rejected_without_writing() {
        let mut buf = BytesMut::new();
        let wide = BackendMessage::DataRow {
            values: vec![None; i16::MAX as usize + 1],
        };
        assert!(wide.encode(&mut buf).is_err());
        let columns = BackendMessage::RowDescription {
            columns: vec!["c".to_string(); 40_000],
        };
        assert!(columns.encode(&mut buf).is_err());
        let params = BackendMessage::ParameterDescription {
            type_oids: vec![TEXT_OID; 70_000],
        };
        assert!(params.encode(&mut buf).is_err());
        assert!(buf.is_empty());

        let mut codec = PgCodec::new();
        assert!(codec.encode(wide, &mut buf).is_err());
        assert!(buf.is_empty());

        // The largest count that fits still encodes.
        BackendMessage::DataRow {
            values: vec![None; i16::MAX as usize],
        }
        .encode(&mut buf)
        .unwrap();
        assert_eq!(&buf[5..7], &i16::MAX.to_be_bytes());
    }

    #[test]
    fn split_frames_rejects_overlong_length() {
        let mut buf = frame(b'Q', b"SELECT 1\0");
        buf[4] = 0x7f;
        assert!(split_frames(&buf).is_err());
        assert!(split_frames(&buf[..3]).is_err());
        assert!(split_frames(&[b'S', 0, 0, 0, 2]).is_err());
        assert!(split_frames(&[]).unwrap().is_empty());
    }

    #[test]
    fn decoder_buffers_partial_frames() {
        let mut codec = PgCodec::new();
        let mut bytes = startup_packet(&[("user", "app"), ("database", "db")]);
        bytes.extend(frame(b'Q', b"SELECT * FROM users\0"));
        bytes.extend(frame(b'X', b""));

        let mut src = BytesMut::new();
        let mut out = Vec::new();
        // Feed one byte at a time.
        for byte in bytes {
            src.put_u8(byte);
            while let Some(msg) = codec.decode(&mut src).unwrap() {
                out.push(msg);
            }
        }
        assert_eq!(out.len(), 3);
        match &out[0] {
            FrontendMessage::Startup { params, .. } => {
                assert_eq!(params.get("user").map(String::as_str), Some("app"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(out[1], FrontendMessage::Query("SELECT * FROM users".into()));
        assert_eq!(out[2], FrontendMessage::Terminate);
    }

    #[test]
    fn ssl_request_keeps_startup_phase() {
        let mut codec = PgCodec::new();
        let mut src = BytesMut::new();
        src.put_i32(8);
        src.put_i32(SSL_REQUEST_CODE);
        src.extend_from_slice(&startup_packet(&[("user", "app")]));
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(FrontendMessage::SslRequest)
        );
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(FrontendMessage::Startup { .. })
        ));
    }

    #[test]
    fn short_startup_packet_is_rejected() {
        let mut codec = PgCodec::new();
        let mut src = BytesMut::from(&[0u8, 0, 0, 6, 0, 3][..]);
        assert!(codec.decode(&mut src).is_err());
    }

    #[test]
    fn bind_decodes_text_null_and_binary() {
        let mut body = Vec::new();
        body.extend_from_slice(b"\0\0"); // portal, statement
        body.extend_from_slice(&3i16.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&1i16.to_be_bytes());
        body.extend_from_slice(&3i16.to_be_bytes());
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(b"42");
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&4i32.to_be_bytes());
        body.extend_from_slice(&[0, 0, 0, 7]);
        body.extend_from_slice(&0i16.to_be_bytes());

        let msg = decode_frame(&frame(b'B', &body)).unwrap();
        assert_eq!(
            msg,
            FrontendMessage::Bind {
                portal: String::new(),
                statement: String::new(),
                params: vec![
                    BindValue::Text("42".into()),
                    BindValue::Null,
                    BindValue::Binary(vec![0, 0, 0, 7]),
                ],
            }
        );
    }

    #[test]
    fn bind_with_truncated_value_is_an_error() {
        let mut body = Vec::new();
        body.extend_from_slice(b"\0\0");
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&1i16.to_be_bytes());
        body.extend_from_slice(&100i32.to_be_bytes());
        body.extend_from_slice(b"short");
        assert!(decode_frame(&frame(b'B', &body)).is_err());
    }

    #[test]
    fn parse_describe_execute_decode() {
        let msg = decode_frame(&frame(b'P', b"\0SELECT $1\0\0\0")).unwrap();
        assert_eq!(
            msg,
            FrontendMessage::Parse {
                name: String::new(),
                query: "SELECT $1".into(),
                param_types: vec![],
            }
        );
        assert_eq!(
            decode_frame(&frame(b'D', b"P\0")).unwrap(),
            FrontendMessage::Describe {
                target: DescribeTarget::Portal,
                name: String::new(),
            }
        );
        let mut exec = b"\0".to_vec();
        exec.extend_from_slice(&0i32.to_be_bytes());
        assert_eq!(
            decode_frame(&frame(b'E', &exec)).unwrap(),
            FrontendMessage::Execute {
                portal: String::new(),
                max_rows: 0,
            }
        );
        assert!(decode_frame(&frame(b'?', b"")).is_err());
    }

    #[test]
    fn command_tags_follow_leading_keyword() {
        assert_eq!(command_tag("select * from users"), "SELECT 1");
        assert_eq!(command_tag("  INSERT INTO users VALUES (1)"), "INSERT 0 1");
        assert_eq!(command_tag("Update users SET a = 1"), "UPDATE 1");
        assert_eq!(command_tag("delete from users"), "DELETE 1");
        assert_eq!(command_tag("CREATE TABLE t (a int)"), "SELECT 1");
        assert_eq!(command_tag(""), "SELECT 1");
    }
}
