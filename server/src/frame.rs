//! Minimal WebSocket frame codec: single, unfragmented text frames only.
//!
//! This is deliberately not a conformant WebSocket implementation. The
//! protocol between this server and its clients uses exactly one frame shape
//! (FIN + text opcode, one JSON object per frame), so continuation frames,
//! binary frames and the native close/ping/pong control opcodes are rejected.
//! Liveness runs at the JSON message layer instead. Keeping the subset behind
//! this module means a standard library could be swapped in later without
//! touching message dispatch.

use thiserror::Error;

/// Upper bound on a single frame payload. Anything larger is treated as a
/// protocol violation rather than buffered indefinitely.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const OPCODE_TEXT: u8 = 0x1;
const FIN_TEXT: u8 = 0x81;

/// Ways a client frame can be undecodable. All of these are handled as
/// no-op messages by the read loop: logged, skipped, connection kept open.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("fragmented frames are not supported")]
    Fragmented,
    #[error("unsupported opcode {0:#x}")]
    UnsupportedOpcode(u8),
    #[error("client frame is not masked")]
    Unmasked,
    #[error("frame payload of {0} bytes exceeds limit")]
    Oversized(u64),
    #[error("empty payload")]
    Empty,
    #[error("payload is not valid UTF-8")]
    Utf8,
}

/// One successfully decoded text frame plus the number of buffer bytes it
/// occupied, so the caller can drain its read buffer.
#[derive(Debug)]
pub struct DecodedFrame {
    pub payload: String,
    pub consumed: usize,
}

/// Wraps a JSON payload in a single server-to-client text frame.
///
/// Server frames are never masked; only client-to-server frames carry a
/// masking key, per the protocol's asymmetry.
pub fn encode_text(payload: &str) -> Vec<u8> {
    let data = payload.as_bytes();
    let mut frame = Vec::with_capacity(data.len() + 10);
    frame.push(FIN_TEXT);
    push_length(&mut frame, data.len(), 0);
    frame.extend_from_slice(data);
    frame
}

/// Builds a masked client-to-server text frame. The server never sends
/// these; this exists for test clients and tooling that speak to the server
/// over a raw socket.
pub fn encode_masked_text(payload: &str, mask: [u8; 4]) -> Vec<u8> {
    let data = payload.as_bytes();
    let mut frame = Vec::with_capacity(data.len() + 14);
    frame.push(FIN_TEXT);
    push_length(&mut frame, data.len(), 0x80);
    frame.extend_from_slice(&mask);
    frame.extend(
        data.iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4]),
    );
    frame
}

/// Encodes the three-tier length prefix: 7-bit inline, 16-bit extended, or
/// 64-bit extended. `mask_bit` is 0x80 for client frames, 0 for server ones.
fn push_length(frame: &mut Vec<u8>, len: usize, mask_bit: u8) {
    if len <= 125 {
        frame.push(mask_bit | len as u8);
    } else if len <= 65535 {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Attempts to decode one masked text frame from the front of `buf`.
///
/// Returns `Ok(None)` while the buffer does not yet hold a complete frame;
/// the caller should keep reading. Errors indicate a frame the server does
/// not speak; the caller logs and discards it.
pub fn decode_text(buf: &[u8]) -> Result<Option<DecodedFrame>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let fin = first & 0x80 != 0;
    let opcode = first & 0x0f;
    if !fin || opcode == 0x0 {
        return Err(FrameError::Fragmented);
    }
    if opcode != OPCODE_TEXT {
        return Err(FrameError::UnsupportedOpcode(opcode));
    }

    let second = buf[1];
    if second & 0x80 == 0 {
        return Err(FrameError::Unmasked);
    }

    // Three-tier payload length, mirroring the encoder.
    let (len, mask_start) = match second & 0x7f {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(bytes), 10)
        }
        inline => (inline as u64, 2),
    };

    if len > MAX_PAYLOAD_LEN as u64 {
        return Err(FrameError::Oversized(len));
    }
    if len == 0 {
        return Err(FrameError::Empty);
    }

    let len = len as usize;
    let payload_start = mask_start + 4;
    let total = payload_start + len;
    if buf.len() < total {
        return Ok(None);
    }

    let mask = [
        buf[mask_start],
        buf[mask_start + 1],
        buf[mask_start + 2],
        buf[mask_start + 3],
    ];
    let decoded: Vec<u8> = buf[payload_start..total]
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ mask[i % 4])
        .collect();

    let payload = String::from_utf8(decoded).map_err(|_| FrameError::Utf8)?;
    Ok(Some(DecodedFrame {
        payload,
        consumed: total,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    fn roundtrip(payload: &str) {
        let encoded = encode_masked_text(payload, MASK);
        let frame = decode_text(&encoded).unwrap().unwrap();
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.consumed, encoded.len());
    }

    #[test]
    fn test_roundtrip_inline_length() {
        // 10 bytes: 7-bit inline length tier.
        roundtrip(&"x".repeat(10));
    }

    #[test]
    fn test_roundtrip_extended_16() {
        // 200 bytes: 16-bit extended length tier.
        roundtrip(&"y".repeat(200));
    }

    #[test]
    fn test_roundtrip_extended_64() {
        // 100000 bytes: 64-bit extended length tier.
        roundtrip(&"z".repeat(100_000));
    }

    #[test]
    fn test_roundtrip_json_payload() {
        roundtrip(r#"{"type":"update_user_pos","lat":10.0,"lon":20.0,"alt":1.05}"#);
    }

    #[test]
    fn test_server_frame_header() {
        let frame = encode_text("hi");
        assert_eq!(frame[0], 0x81);
        // Server frames carry no mask bit.
        assert_eq!(frame[1], 2);
        assert_eq!(&frame[2..], b"hi");
    }

    #[test]
    fn test_length_tier_boundaries() {
        let frame = encode_text(&"a".repeat(125));
        assert_eq!(frame[1], 125);

        let frame = encode_text(&"a".repeat(126));
        assert_eq!(frame[1], 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 126);

        let frame = encode_text(&"a".repeat(65536));
        assert_eq!(frame[1], 127);
    }

    #[test]
    fn test_incomplete_frame_wants_more() {
        let encoded = encode_masked_text("hello world", MASK);
        for cut in 0..encoded.len() {
            assert!(decode_text(&encoded[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_unmasked_client_frame_rejected() {
        let frame = encode_text("hello");
        assert_eq!(decode_text(&frame).unwrap_err(), FrameError::Unmasked);
    }

    #[test]
    fn test_zero_length_payload_rejected() {
        let frame = [0x81, 0x80, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(decode_text(&frame).unwrap_err(), FrameError::Empty);
    }

    #[test]
    fn test_binary_opcode_rejected() {
        let mut frame = encode_masked_text("data", MASK);
        frame[0] = 0x82;
        assert_eq!(
            decode_text(&frame).unwrap_err(),
            FrameError::UnsupportedOpcode(0x2)
        );
    }

    #[test]
    fn test_continuation_frame_rejected() {
        let mut frame = encode_masked_text("data", MASK);
        frame[0] = 0x01; // FIN cleared
        assert_eq!(decode_text(&frame).unwrap_err(), FrameError::Fragmented);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = encode_masked_text("first", MASK);
        buf.extend(encode_masked_text("second", [9, 8, 7, 6]));

        let frame = decode_text(&buf).unwrap().unwrap();
        assert_eq!(frame.payload, "first");
        let rest = &buf[frame.consumed..];
        let frame = decode_text(rest).unwrap().unwrap();
        assert_eq!(frame.payload, "second");
    }
}
