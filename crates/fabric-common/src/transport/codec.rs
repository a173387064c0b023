use std::collections::{BTreeMap, HashMap};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{json, Value};

use crate::protocol::error::{FabricError, Result};
use crate::protocol::{Request, RequestMethod, Response};

/// Size of the fixed chunk header in bytes
pub const CHUNK_HEADER_SIZE: usize = 24;

/// Default maximum payload carried by one chunk
pub const DEFAULT_CHUNK_SIZE: usize = 30_000;

/// Maximum reassembled message size (100 MB)
pub const MAX_MESSAGE_SIZE: u64 = 100 * 1024 * 1024;

/// Protocol preamble written once at the start of every VST socket
pub const VST_HANDSHAKE: &[u8] = b"VST/1.1\r\n\r\n";

const MESSAGE_TYPE_REQUEST: u64 = 1;
const MESSAGE_TYPE_RESPONSE: u64 = 2;
const MESSAGE_TYPE_AUTH: u64 = 1000;

/// One wire frame of a VST message.
///
/// # Wire Format
///
/// All integers are little-endian:
///
/// ```text
/// [u32 chunk length incl. header] [u32 chunk_x] [u64 message id] [u64 message length] [payload]
/// ```
///
/// `chunk_x` is `count << 1 | 1` on the first chunk of a message and
/// `index << 1` on every following chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub message_id: u64,
    pub message_length: u64,
    pub chunk_x: u32,
    pub payload: Bytes,
}

impl Chunk {
    pub fn first(message_id: u64, message_length: u64, count: u32, payload: Bytes) -> Self {
        Chunk {
            message_id,
            message_length,
            chunk_x: (count << 1) | 1,
            payload,
        }
    }

    pub fn following(message_id: u64, message_length: u64, index: u32, payload: Bytes) -> Self {
        Chunk {
            message_id,
            message_length,
            chunk_x: index << 1,
            payload,
        }
    }

    pub fn is_first(&self) -> bool {
        self.chunk_x & 1 == 1
    }

    pub fn index(&self) -> u32 {
        if self.is_first() {
            0
        } else {
            self.chunk_x >> 1
        }
    }

    /// Total chunk count, only known from the first chunk.
    pub fn count(&self) -> Option<u32> {
        self.is_first().then_some(self.chunk_x >> 1)
    }

    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32_le(self.encoded_len() as u32);
        buf.put_u32_le(self.chunk_x);
        buf.put_u64_le(self.message_id);
        buf.put_u64_le(self.message_length);
        buf.put_slice(&self.payload);
    }

    /// Decodes a chunk header, returning it with the payload length still to read.
    pub fn decode_header(mut header: &[u8]) -> Result<(ChunkHeader, usize)> {
        if header.len() < CHUNK_HEADER_SIZE {
            return Err(FabricError::InvalidResponse(format!(
                "Chunk header too short: {} bytes",
                header.len()
            )));
        }
        let length = header.get_u32_le() as usize;
        let chunk_x = header.get_u32_le();
        let message_id = header.get_u64_le();
        let message_length = header.get_u64_le();

        if length < CHUNK_HEADER_SIZE {
            return Err(FabricError::InvalidResponse(format!(
                "Chunk length {} smaller than header",
                length
            )));
        }
        if message_length > MAX_MESSAGE_SIZE {
            tracing::warn!(message_id, message_length, "Rejecting oversized VST message");
            return Err(FabricError::InvalidResponse(format!(
                "Message too large: {} bytes (max {} bytes)",
                message_length, MAX_MESSAGE_SIZE
            )));
        }
        // The payload is read into memory before any other check can run
        let payload_len = length - CHUNK_HEADER_SIZE;
        if payload_len as u64 > message_length {
            tracing::warn!(message_id, payload_len, message_length, "Rejecting VST chunk larger than its message");
            return Err(FabricError::InvalidResponse(format!(
                "Chunk payload of {} bytes exceeds message length {}",
                payload_len, message_length
            )));
        }

        Ok((
            ChunkHeader {
                chunk_x,
                message_id,
                message_length,
            },
            payload_len,
        ))
    }
}

/// Decoded chunk header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_x: u32,
    pub message_id: u64,
    pub message_length: u64,
}

impl ChunkHeader {
    pub fn with_payload(self, payload: Bytes) -> Chunk {
        Chunk {
            message_id: self.message_id,
            message_length: self.message_length,
            chunk_x: self.chunk_x,
            payload,
        }
    }
}

/// Splits a message payload into chunks of at most `chunk_size` payload bytes.
///
/// An empty payload still produces one (empty) chunk.
pub fn split_message(message_id: u64, payload: &Bytes, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let message_length = payload.len() as u64;
    let count = payload.len().div_ceil(chunk_size).max(1) as u32;

    (0..count)
        .map(|index| {
            let start = (index as usize * chunk_size).min(payload.len());
            let end = (start + chunk_size).min(payload.len());
            let slice = payload.slice(start..end);
            if index == 0 {
                Chunk::first(message_id, message_length, count, slice)
            } else {
                Chunk::following(message_id, message_length, index, slice)
            }
        })
        .collect()
}

#[derive(Default)]
struct PartialMessage {
    expected: Option<u32>,
    message_length: u64,
    received: u64,
    chunks: BTreeMap<u32, Bytes>,
}

/// Reassembles chunks into complete messages, keyed by message id.
///
/// Chunks of different messages may interleave, and the chunks of one message
/// may arrive in any order.
#[derive(Default)]
pub struct ChunkAssembler {
    pending: HashMap<u64, PartialMessage>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chunk; returns the message id and payload once it is complete.
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<(u64, Bytes)>> {
        // Single-chunk messages skip the bookkeeping
        if chunk.count() == Some(1) && !self.pending.contains_key(&chunk.message_id) {
            Self::check_length(chunk.message_id, chunk.message_length, chunk.payload.len() as u64)?;
            return Ok(Some((chunk.message_id, chunk.payload)));
        }

        let partial = self.pending.entry(chunk.message_id).or_default();
        if let Some(count) = chunk.count() {
            partial.expected = Some(count);
        }
        partial.message_length = chunk.message_length;
        partial.received += chunk.payload.len() as u64;
        if partial.received > partial.message_length {
            self.pending.remove(&chunk.message_id);
            return Err(FabricError::InvalidResponse(format!(
                "Message {} overflows its declared length",
                chunk.message_id
            )));
        }
        let index = chunk.index();
        if partial.chunks.insert(index, chunk.payload).is_some() {
            self.pending.remove(&chunk.message_id);
            tracing::warn!(message_id = chunk.message_id, index, "Duplicate VST chunk");
            return Err(FabricError::InvalidResponse(format!(
                "Duplicate chunk {} for message {}",
                index, chunk.message_id
            )));
        }

        let complete = matches!(partial.expected, Some(count) if partial.chunks.len() as u32 == count);
        if !complete {
            return Ok(None);
        }

        let partial = match self.pending.remove(&chunk.message_id) {
            Some(partial) => partial,
            None => return Ok(None),
        };
        Self::check_length(chunk.message_id, partial.message_length, partial.received)?;

        let mut buf = BytesMut::with_capacity(partial.message_length as usize);
        for payload in partial.chunks.into_values() {
            buf.put_slice(&payload);
        }
        Ok(Some((chunk.message_id, buf.freeze())))
    }

    /// Number of messages with chunks still outstanding.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn check_length(message_id: u64, expected: u64, actual: u64) -> Result<()> {
        if expected != actual {
            return Err(FabricError::InvalidResponse(format!(
                "Message {} declared {} bytes but carried {}",
                message_id, expected, actual
            )));
        }
        Ok(())
    }
}

/// Codec for VST message payloads.
///
/// A payload is a JSON header followed by the opaque body:
///
/// ```text
/// [u32 header length, little-endian] [JSON header] [body]
/// ```
///
/// # Example
///
/// ```
/// use fabric_common::transport::VstCodec;
/// use fabric_common::{Request, RequestMethod};
///
/// let request = Request::new(RequestMethod::Post, "/_api/cursor")
///     .with_database("_system")
///     .with_body(r#"{"query":"RETURN 1"}"#);
///
/// let payload = VstCodec::encode_request(&request).unwrap();
/// let decoded = VstCodec::decode_request(payload).unwrap();
/// assert_eq!(decoded.path, "/_api/cursor");
/// assert_eq!(decoded.body, request.body);
/// ```
pub struct VstCodec;

impl VstCodec {
    pub fn encode_request(request: &Request) -> Result<Bytes> {
        let header = json!([
            1,
            MESSAGE_TYPE_REQUEST,
            request.database.as_deref().unwrap_or(""),
            request.method.code(),
            request.path,
            request.query_params,
            request.header_params,
            request.tenant.as_deref().unwrap_or(""),
        ]);
        Self::encode_payload(&header, request.body.as_ref())
    }

    pub fn decode_request(payload: Bytes) -> Result<Request> {
        let (header, body) = Self::decode_payload(payload)?;
        let fields = Self::header_fields(&header, MESSAGE_TYPE_REQUEST, 8)?;

        let code = fields[3]
            .as_u64()
            .and_then(|c| u8::try_from(c).ok())
            .and_then(RequestMethod::from_code)
            .ok_or_else(|| FabricError::InvalidRequest("Unknown request method".to_string()))?;
        let path = fields[4]
            .as_str()
            .ok_or_else(|| FabricError::InvalidRequest("Missing request path".to_string()))?;

        let mut request = Request::new(code, path);
        request.database = Self::non_empty(&fields[2]);
        request.query_params = serde_json::from_value(fields[5].clone())?;
        request.header_params = serde_json::from_value(fields[6].clone())?;
        request.tenant = Self::non_empty(&fields[7]);
        request.body = body;
        Ok(request)
    }

    pub fn encode_response(response: &Response) -> Result<Bytes> {
        let header = json!([1, MESSAGE_TYPE_RESPONSE, response.status_code, response.headers]);
        Self::encode_payload(&header, response.body.as_ref())
    }

    pub fn decode_response(payload: Bytes) -> Result<Response> {
        let (header, body) = Self::decode_payload(payload)?;
        let fields = Self::header_fields(&header, MESSAGE_TYPE_RESPONSE, 4)?;

        let status_code = fields[2]
            .as_u64()
            .and_then(|s| u16::try_from(s).ok())
            .ok_or_else(|| FabricError::InvalidResponse("Missing response status".to_string()))?;

        let mut response = Response::new(status_code);
        response.headers = serde_json::from_value(fields[3].clone())?;
        response.body = body;
        Ok(response)
    }

    /// Payload of the per-connection authentication message.
    pub fn encode_auth(header: &Value) -> Result<Bytes> {
        Self::encode_payload(header, None)
    }

    /// Returns true if the payload is an authentication message.
    pub fn is_auth_message(payload: &Bytes) -> bool {
        match Self::decode_payload(payload.clone()) {
            Ok((header, _)) => header.get(1).and_then(Value::as_u64) == Some(MESSAGE_TYPE_AUTH),
            Err(_) => false,
        }
    }

    fn encode_payload(header: &Value, body: Option<&Bytes>) -> Result<Bytes> {
        let header = serde_json::to_vec(header)?;
        let body_len = body.map(Bytes::len).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(4 + header.len() + body_len);
        buf.put_u32_le(header.len() as u32);
        buf.put_slice(&header);
        if let Some(body) = body {
            buf.put_slice(body);
        }
        Ok(buf.freeze())
    }

    fn decode_payload(mut payload: Bytes) -> Result<(Value, Option<Bytes>)> {
        if payload.len() < 4 {
            return Err(FabricError::InvalidResponse(
                "Message payload shorter than its header length".to_string(),
            ));
        }
        let header_len = payload.get_u32_le() as usize;
        if header_len > payload.len() {
            return Err(FabricError::InvalidResponse(format!(
                "Header length {} exceeds payload of {} bytes",
                header_len,
                payload.len()
            )));
        }
        let header_bytes = payload.split_to(header_len);
        let header: Value = serde_json::from_slice(&header_bytes)?;
        let body = (!payload.is_empty()).then_some(payload);
        Ok((header, body))
    }

    fn header_fields(header: &Value, message_type: u64, len: usize) -> Result<&Vec<Value>> {
        let fields = header
            .as_array()
            .filter(|f| f.len() >= len)
            .ok_or_else(|| FabricError::InvalidResponse("Malformed message header".to_string()))?;
        if fields[1].as_u64() != Some(message_type) {
            return Err(FabricError::InvalidResponse(format!(
                "Unexpected message type {}",
                fields[1]
            )));
        }
        Ok(fields)
    }

    fn non_empty(value: &Value) -> Option<String> {
        value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestMethod;

    #[test]
    fn test_chunk_header_layout() {
        let chunk = Chunk::first(7, 3, 1, Bytes::from_static(b"abc"));
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf);

        assert_eq!(buf.len(), CHUNK_HEADER_SIZE + 3);
        assert_eq!(&buf[0..4], &27u32.to_le_bytes());
        assert_eq!(&buf[4..8], &3u32.to_le_bytes());
        assert_eq!(&buf[8..16], &7u64.to_le_bytes());
        assert_eq!(&buf[16..24], &3u64.to_le_bytes());
        assert_eq!(&buf[24..], b"abc");

        let (header, remaining) = Chunk::decode_header(&buf[..CHUNK_HEADER_SIZE]).unwrap();
        assert_eq!(remaining, 3);
        let decoded = header.with_payload(Bytes::copy_from_slice(&buf[24..]));
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_split_message_chunk_numbering() {
        let payload = Bytes::from(vec![9u8; 25]);
        let chunks = split_message(42, &payload, 10);

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].is_first());
        assert_eq!(chunks[0].count(), Some(3));
        assert_eq!(chunks[1].index(), 1);
        assert_eq!(chunks[2].index(), 2);
        assert_eq!(chunks[2].payload.len(), 5);
        assert!(chunks.iter().all(|c| c.message_length == 25 && c.message_id == 42));
    }

    #[test]
    fn test_split_empty_message() {
        let chunks = split_message(1, &Bytes::new(), 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].count(), Some(1));
        assert!(chunks[0].payload.is_empty());
    }

    #[test]
    fn test_assembler_interleaved_out_of_order() {
        let a = Bytes::from((0u8..50).collect::<Vec<_>>());
        let b = Bytes::from((100u8..130).collect::<Vec<_>>());
        let mut chunks_a = split_message(1, &a, 16);
        let mut chunks_b = split_message(2, &b, 16);
        chunks_a.reverse();
        chunks_b.reverse();

        let mut assembler = ChunkAssembler::new();
        let mut done = Vec::new();
        let mut interleaved = Vec::new();
        while !chunks_a.is_empty() || !chunks_b.is_empty() {
            if let Some(c) = chunks_a.pop() {
                interleaved.push(c);
            }
            if let Some(c) = chunks_b.pop() {
                interleaved.push(c);
            }
        }
        // Deliver the first chunk of message 1 last
        let first_a = interleaved.remove(0);
        interleaved.push(first_a);

        for chunk in interleaved {
            if let Some(message) = assembler.push(chunk).unwrap() {
                done.push(message);
            }
        }

        assert_eq!(done.len(), 2);
        assert_eq!(done[0], (2, b));
        assert_eq!(done[1], (1, a));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_assembler_rejects_length_mismatch() {
        let mut assembler = ChunkAssembler::new();
        let chunk = Chunk::first(5, 10, 1, Bytes::from_static(b"short"));
        assert!(assembler.push(chunk).is_err());
    }

    #[test]
    fn test_decode_header_rejects_huge_messages() {
        let chunk = Chunk::first(1, MAX_MESSAGE_SIZE + 1, 1, Bytes::new());
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf);
        assert!(Chunk::decode_header(&buf).is_err());
    }

    #[test]
    fn test_decode_header_bounds_payload_by_message_length() {
        let mut header = BytesMut::new();
        header.put_u32_le(u32::MAX);
        header.put_u32_le(3);
        header.put_u64_le(1);
        header.put_u64_le(10);
        assert!(matches!(
            Chunk::decode_header(&header),
            Err(FabricError::InvalidResponse(_))
        ));

        let chunk = Chunk::first(1, 10, 1, Bytes::from_static(b"0123456789"));
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf);
        let (_, payload_len) = Chunk::decode_header(&buf).unwrap();
        assert_eq!(payload_len, 10);
    }

    #[test]
    fn test_request_codec_preserves_routing() {
        let request = Request::new(RequestMethod::Put, "/_api/document/c/1")
            .with_tenant("acme")
            .with_database("orders")
            .with_header("x-fabric-trx", "9")
            .with_query_param("returnNew", "true")
            .with_body(r#"{"a":1}"#);

        let decoded = VstCodec::decode_request(VstCodec::encode_request(&request).unwrap()).unwrap();
        assert_eq!(decoded.method, RequestMethod::Put);
        assert_eq!(decoded.tenant.as_deref(), Some("acme"));
        assert_eq!(decoded.database.as_deref(), Some("orders"));
        assert_eq!(decoded.header("x-fabric-trx"), Some("9"));
        assert_eq!(decoded.query_params.get("returnNew").map(String::as_str), Some("true"));
        assert_eq!(decoded.body, request.body);
    }

    #[test]
    fn test_response_codec_without_body() {
        let response = Response::new(204).with_header("x-fabric-endpoint", "tcp://a:1");
        let decoded =
            VstCodec::decode_response(VstCodec::encode_response(&response).unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_decode_response_rejects_request_payload() {
        let payload =
            VstCodec::encode_request(&Request::new(RequestMethod::Get, "/_api/version")).unwrap();
        assert!(VstCodec::decode_response(payload).is_err());
    }

    #[test]
    fn test_auth_message_detection() {
        let header = json!([1, 1000, "jwt", "token"]);
        let payload = VstCodec::encode_auth(&header).unwrap();
        assert!(VstCodec::is_auth_message(&payload));

        let payload =
            VstCodec::encode_request(&Request::new(RequestMethod::Get, "/_api/version")).unwrap();
        assert!(!VstCodec::is_auth_message(&payload));
    }
}
