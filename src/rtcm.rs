//! RTCM 3 frame reassembly.
//!
//! An RTCM frame on the wire is a single `0xD3` preamble byte, a two-byte
//! length field whose low 10 bits give the payload length (the top 6 bits
//! are reserved and must be masked off), the payload, and a 3-byte CRC.
//! The message type is the top 12 bits of the first two payload bytes.
//!
//! Socket reads split this framing arbitrarily: one read may carry zero,
//! one, or several frames, and a frame's tail may arrive reads later.
//! [`extract_frames`] consumes whatever complete frames the accumulation
//! buffer holds and leaves any partial frame in place for the next read.

use bytes::{Buf, Bytes, BytesMut};

/// Leading byte of every RTCM 3 frame.
pub const PREAMBLE: u8 = 0xD3;

/// Preamble + 2-byte length field.
const HEADER_LEN: usize = 3;

/// CRC-24Q trailer length.
const CRC_LEN: usize = 3;

/// One reassembled frame: the verbatim wire bytes
/// (preamble + length + payload + CRC) tagged with the message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u16,
    pub bytes: Bytes,
}

/// Extract every complete frame currently in `buf`.
///
/// Bytes preceding a preamble are discarded. A frame whose length field
/// or tail has not arrived yet is left untouched, preamble included, so a
/// later read can complete it. When no preamble remains the buffer is
/// emptied - a tail without `0xD3` can never start a frame.
pub fn extract_frames(buf: &mut BytesMut) -> Vec<Frame> {
    let mut frames = Vec::new();

    loop {
        match buf.iter().position(|&b| b == PREAMBLE) {
            Some(pos) => buf.advance(pos),
            None => {
                buf.clear();
                return frames;
            }
        }

        if buf.len() < HEADER_LEN {
            // Length field still in flight; wait for more bytes.
            return frames;
        }

        let payload_len = payload_length(buf[1], buf[2]);
        let total = HEADER_LEN + payload_len + CRC_LEN;
        if buf.len() < total {
            // Tail still in flight; do not consume, rewind to the preamble.
            return frames;
        }

        let bytes = buf.split_to(total).freeze();
        frames.push(Frame {
            message_type: message_type(&bytes[HEADER_LEN..HEADER_LEN + payload_len]),
            bytes,
        });
    }
}

/// Payload length from the two length-field bytes: the low 10 bits, with
/// the 6 reserved top bits masked off.
fn payload_length(hi: u8, lo: u8) -> usize {
    (((hi & 0x03) as usize) << 8) | lo as usize
}

/// Message type: top 12 bits of the first two payload bytes. Payloads too
/// short to carry a type yield 0.
fn message_type(payload: &[u8]) -> u16 {
    if payload.len() < 2 {
        return 0;
    }
    (((payload[0] as u16) << 8) | payload[1] as u16) >> 4
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a frame with the given message type and payload length.
    fn frame(message_type: u16, payload_len: usize) -> Vec<u8> {
        assert!(payload_len >= 2 && payload_len < 1024);
        let mut out = vec![
            PREAMBLE,
            (payload_len >> 8) as u8,
            (payload_len & 0xFF) as u8,
        ];
        let type_bits = message_type << 4;
        out.push((type_bits >> 8) as u8);
        out.push((type_bits & 0xFF) as u8);
        out.extend(std::iter::repeat(0xAB).take(payload_len - 2));
        out.extend_from_slice(&[0x01, 0x02, 0x03]); // CRC, carried verbatim
        out
    }

    #[test]
    fn test_single_frame_round_trip() {
        let wire = frame(1005, 19);
        let mut buf = BytesMut::from(&wire[..]);
        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type, 1005);
        assert_eq!(&frames[0].bytes[..], &wire[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_length_reserved_bits_masked() {
        // 0xC3 0x05 and 0x03 0x05 both decode to payload length 773.
        assert_eq!(payload_length(0xC3, 0x05), 773);
        assert_eq!(payload_length(0x03, 0x05), 773);

        // A full frame whose length field carries noise in the top 6 bits
        // parses identically to the clean encoding.
        let mut noisy = frame(1002, 773);
        noisy[1] |= 0xC0;
        let mut buf = BytesMut::from(&noisy[..]);
        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes.len(), noisy.len());
    }

    #[test]
    fn test_message_type_is_top_twelve_bits() {
        // 0x3EA0 = 0011 1110 1010 0000 -> shifted right 4 -> 0x3EA = 1002
        assert_eq!(message_type(&[0x3E, 0xA0]), 1002);
        assert_eq!(message_type(&[0x3E]), 0);
    }

    #[test]
    fn test_frame_split_across_three_reads() {
        let wire = frame(1074, 24);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&wire[..3]);
        assert!(extract_frames(&mut buf).is_empty());

        buf.extend_from_slice(&wire[3..5]);
        assert!(extract_frames(&mut buf).is_empty());

        buf.extend_from_slice(&wire[5..]);
        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].bytes[..], &wire[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_emitted_frames_reproduce_input_regardless_of_chunking() {
        let mut wire = Vec::new();
        for (ty, len) in [(1005u16, 19), (1077, 200), (1087, 150), (1230, 8)] {
            wire.extend(frame(ty, len));
        }

        // Feed the same stream at several chunk sizes; output must be
        // identical every time.
        for chunk in [1usize, 2, 3, 7, 64, 4096] {
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                frames.extend(extract_frames(&mut buf));
            }
            let types: Vec<u16> = frames.iter().map(|f| f.message_type).collect();
            assert_eq!(types, vec![1005, 1077, 1087, 1230], "chunk size {}", chunk);
            let rejoined: Vec<u8> = frames.iter().flat_map(|f| f.bytes.to_vec()).collect();
            assert_eq!(rejoined, wire, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_garbage_before_preamble_is_skipped() {
        let mut wire = vec![0x00, 0x7F, 0x42];
        wire.extend(frame(1006, 21));
        let mut buf = BytesMut::from(&wire[..]);
        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type, 1006);
    }

    #[test]
    fn test_buffer_without_preamble_is_dropped() {
        let mut buf = BytesMut::from(&[0x10u8, 0x20, 0x30][..]);
        assert!(extract_frames(&mut buf).is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_keeps_preamble_in_buffer() {
        let wire = frame(1019, 62);
        let mut buf = BytesMut::from(&wire[..10]);
        assert!(extract_frames(&mut buf).is_empty());
        assert_eq!(buf[0], PREAMBLE);
        assert_eq!(buf.len(), 10);
    }
}
