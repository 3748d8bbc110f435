use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Fixed size of every frame header
pub const HEADER_LENGTH: usize = 120;
pub const MESSAGE_TYPE_LENGTH: usize = 32;
pub const MESSAGE_ID_LENGTH: usize = 16;
pub const PAYLOAD_DIGEST_LENGTH: usize = 32;

/// Protocol schema version stamped on every frame we build
pub const SCHEMA_VERSION: u32 = 1;

/// Message type used for terminal traffic in both directions
pub const MESSAGE_TYPE_OUTPUT_STREAM: &str = "output_stream_data";

/// Payload kinds carried in the `payload_type` header field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadType {
    Output = 1,
    Error = 2,
    Size = 3,
    Parameter = 4,
    HandshakeRequest = 5,
    HandshakeResponse = 6,
    HandshakeComplete = 7,
    ExitCode = 12,
}

impl PayloadType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Output),
            2 => Some(Self::Error),
            3 => Some(Self::Size),
            4 => Some(Self::Parameter),
            5 => Some(Self::HandshakeRequest),
            6 => Some(Self::HandshakeResponse),
            7 => Some(Self::HandshakeComplete),
            12 => Some(Self::ExitCode),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("message too short: {len} bytes, header needs {HEADER_LENGTH}")]
    TooShort { len: usize },
}

/// A decoded agent protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub header_length: u32,
    pub message_type: String,
    pub schema_version: u32,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub sequence_number: u64,
    pub flags: u64,
    pub message_id: [u8; MESSAGE_ID_LENGTH],
    pub payload_digest: [u8; PAYLOAD_DIGEST_LENGTH],
    /// Raw payload type; unknown values are kept so callers can ignore them
    pub payload_type: u32,
    pub payload_length: u32,
    /// Empty when the declared length does not fit in the received buffer
    pub payload: Vec<u8>,
}

impl AgentMessage {
    pub fn kind(&self) -> Option<PayloadType> {
        PayloadType::from_u32(self.payload_type)
    }

    pub fn is_output(&self) -> bool {
        self.kind() == Some(PayloadType::Output)
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.kind() == Some(PayloadType::HandshakeComplete)
    }

    pub fn is_exit_code(&self) -> bool {
        self.kind() == Some(PayloadType::ExitCode)
    }

    /// Recompute the payload hash and compare it with the header digest.
    ///
    /// Parsing never calls this; the terminal read pump only does when
    /// digest verification is switched on in the config.
    pub fn digest_matches(&self) -> bool {
        Sha256::digest(&self.payload).as_slice() == self.payload_digest
    }
}

/// Big-endian field reader over a header that is known to be long enough
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> &'a [u8] {
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        slice
    }

    fn u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4));
        u32::from_be_bytes(buf)
    }

    fn u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8));
        u64::from_be_bytes(buf)
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N));
        buf
    }
}

/// Decode a frame. The payload digest is not checked here.
pub fn parse_message(data: &[u8]) -> Result<AgentMessage, FrameError> {
    if data.len() < HEADER_LENGTH {
        return Err(FrameError::TooShort { len: data.len() });
    }

    let mut cursor = Cursor { data, offset: 0 };

    let header_length = cursor.u32();
    let message_type = trim_nulls(cursor.take(MESSAGE_TYPE_LENGTH));
    let schema_version = cursor.u32();
    let created_at = cursor.u64();
    let sequence_number = cursor.u64();
    let flags = cursor.u64();
    let message_id = cursor.array::<MESSAGE_ID_LENGTH>();
    let payload_digest = cursor.array::<PAYLOAD_DIGEST_LENGTH>();
    let payload_type = cursor.u32();
    let payload_length = cursor.u32();

    let rest = &data[cursor.offset..];
    let payload = match rest.get(..payload_length as usize) {
        Some(bytes) => bytes.to_vec(),
        None => Vec::new(),
    };

    Ok(AgentMessage {
        header_length,
        message_type,
        schema_version,
        created_at,
        sequence_number,
        flags,
        message_id,
        payload_digest,
        payload_type,
        payload_length,
        payload,
    })
}

fn trim_nulls(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Encode a frame: current timestamp, fresh random id, SHA-256 payload digest.
pub fn build_message(
    message_type: &str,
    payload_type: PayloadType,
    payload: &[u8],
    sequence_number: u64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LENGTH + payload.len());

    buf.extend_from_slice(&(HEADER_LENGTH as u32).to_be_bytes());

    let mut type_field = [0u8; MESSAGE_TYPE_LENGTH];
    let type_bytes = message_type.as_bytes();
    let n = type_bytes.len().min(MESSAGE_TYPE_LENGTH);
    type_field[..n].copy_from_slice(&type_bytes[..n]);
    buf.extend_from_slice(&type_field);

    buf.extend_from_slice(&SCHEMA_VERSION.to_be_bytes());
    buf.extend_from_slice(&now_millis().to_be_bytes());
    buf.extend_from_slice(&sequence_number.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes());

    let mut message_id = [0u8; MESSAGE_ID_LENGTH];
    rand::thread_rng().fill_bytes(&mut message_id);
    buf.extend_from_slice(&message_id);

    buf.extend_from_slice(&Sha256::digest(payload));
    buf.extend_from_slice(&(payload_type as u32).to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);

    buf
}

/// Keystrokes travel to the device as Output frames
pub fn build_input_message(input: &[u8], sequence_number: u64) -> Vec<u8> {
    build_message(
        MESSAGE_TYPE_OUTPUT_STREAM,
        PayloadType::Output,
        input,
        sequence_number,
    )
}

pub fn build_resize_message(cols: u16, rows: u16, sequence_number: u64) -> Vec<u8> {
    let payload = format!(r#"{{"cols":{cols},"rows":{rows}}}"#);
    build_message(
        MESSAGE_TYPE_OUTPUT_STREAM,
        PayloadType::Size,
        payload.as_bytes(),
        sequence_number,
    )
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_parse_roundtrip() {
        let payload = b"ls -la\r";
        let frame = build_message(MESSAGE_TYPE_OUTPUT_STREAM, PayloadType::Output, payload, 42);
        assert_eq!(frame.len(), HEADER_LENGTH + payload.len());

        let msg = parse_message(&frame).unwrap();
        assert_eq!(msg.header_length, HEADER_LENGTH as u32);
        assert_eq!(msg.message_type, MESSAGE_TYPE_OUTPUT_STREAM);
        assert_eq!(msg.schema_version, SCHEMA_VERSION);
        assert_eq!(msg.sequence_number, 42);
        assert_eq!(msg.flags, 0);
        assert_eq!(msg.kind(), Some(PayloadType::Output));
        assert_eq!(msg.payload_length, payload.len() as u32);
        assert_eq!(msg.payload, payload);
        assert!(msg.created_at > 0);
        assert!(msg.digest_matches());
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let frame = build_message("exit", PayloadType::ExitCode, &[], 7);
        let msg = parse_message(&frame).unwrap();
        assert!(msg.is_exit_code());
        assert_eq!(msg.payload_length, 0);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_too_short() {
        let err = parse_message(&[0u8; HEADER_LENGTH - 1]).unwrap_err();
        assert_eq!(err, FrameError::TooShort { len: HEADER_LENGTH - 1 });
    }

    #[test]
    fn test_truncated_payload_is_left_empty() {
        let mut frame = build_input_message(b"hello world", 1);
        frame.truncate(HEADER_LENGTH + 4);

        let msg = parse_message(&frame).unwrap();
        assert_eq!(msg.payload_length, 11);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_header_layout() {
        let frame = build_message("abc", PayloadType::Size, b"xy", 0x0102);
        assert_eq!(&frame[0..4], &120u32.to_be_bytes());
        assert_eq!(&frame[4..7], b"abc");
        assert!(frame[7..36].iter().all(|&b| b == 0));
        assert_eq!(&frame[36..40], &1u32.to_be_bytes());
        assert_eq!(&frame[48..56], &0x0102u64.to_be_bytes());
        assert_eq!(&frame[56..64], &[0u8; 8]);
        assert_eq!(&frame[80..112], Sha256::digest(b"xy").as_slice());
        assert_eq!(&frame[112..116], &3u32.to_be_bytes());
        assert_eq!(&frame[116..120], &2u32.to_be_bytes());
        assert_eq!(&frame[120..], b"xy");
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = parse_message(&build_input_message(b"x", 1)).unwrap();
        let b = parse_message(&build_input_message(b"x", 1)).unwrap();
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_long_message_type_is_truncated() {
        let long = "m".repeat(40);
        let msg = parse_message(&build_message(&long, PayloadType::Error, b"", 1)).unwrap();
        assert_eq!(msg.message_type.len(), MESSAGE_TYPE_LENGTH);
    }

    #[test]
    fn test_tampered_payload_still_parses() {
        let mut frame = build_input_message(b"data", 3);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let msg = parse_message(&frame).unwrap();
        assert_eq!(msg.payload.len(), 4);
        assert!(!msg.digest_matches());
    }

    #[test]
    fn test_resize_payload() {
        let msg = parse_message(&build_resize_message(120, 40, 9)).unwrap();
        assert_eq!(msg.kind(), Some(PayloadType::Size));
        assert_eq!(msg.payload, br#"{"cols":120,"rows":40}"#);
    }

    #[test]
    fn test_predicates() {
        let handshake = parse_message(&build_message(
            MESSAGE_TYPE_OUTPUT_STREAM,
            PayloadType::HandshakeComplete,
            b"{}",
            1,
        ))
        .unwrap();
        assert!(handshake.is_handshake_complete());
        assert!(!handshake.is_output());
        assert!(!handshake.is_exit_code());
        assert_eq!(PayloadType::from_u32(99), None);
    }
}
