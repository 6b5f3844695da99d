//! HDLC-style asynchronous framing between raw serial bytes and PPP frames.
//!
//! Frames are delimited by the flag octet `0x7E`. Inside a frame, `0x7E` and
//! `0x7D` are transmitted as `0x7D` followed by the original byte XORed with
//! `0x20`. A single flag both closes one frame and opens the next, so
//! consecutive frames on the wire are separated by exactly one flag; the
//! decoder also tolerates peers that bracket every frame with its own pair.
//!
//! No frame check sequence is computed or validated; a peer that insists on
//! RFC 1662 FCS will see our frames as corrupt, and any FCS a peer appends
//! arrives here as trailing payload bytes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame delimiter.
pub const FLAG: u8 = 0x7E;
/// Escape introducer.
pub const ESCAPE: u8 = 0x7D;
/// XOR mask applied to escaped bytes.
const ESCAPE_MASK: u8 = 0x20;

/// Upper bound on an un-escaped frame. Anything longer is noise or a peer
/// with a wildly different MRU; the decoder drops it and resynchronises.
pub const MAX_FRAME: usize = 8 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// An escape introducer was immediately followed by a flag.
    #[error("malformed escape sequence")]
    BadEscape,
    /// The frame grew past [`MAX_FRAME`] without a closing flag.
    #[error("frame exceeds {MAX_FRAME} bytes")]
    Oversized,
}

/// Byte-at-a-time frame decoder.
///
/// Feed it arbitrary chunks of serial input; complete frames come out in
/// order. Framing errors drop the frame under construction and resynchronise
/// on the next flag, so one corrupt frame never poisons the stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    in_frame: bool,
    escaped: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk of serial input, appending complete frames to `frames`
    /// and any framing errors to `errors`.
    pub fn decode(&mut self, data: &[u8], frames: &mut Vec<Bytes>, errors: &mut Vec<FramingError>) {
        for &byte in data {
            if byte == FLAG {
                if self.escaped {
                    // 0x7D immediately before a flag cannot be decoded. Drop
                    // the frame and let the flag start a fresh one.
                    errors.push(FramingError::BadEscape);
                } else if self.in_frame && !self.buffer.is_empty() {
                    frames.push(self.buffer.split().freeze());
                }
                // The flag closes whatever came before and opens a new frame.
                self.in_frame = true;
                self.escaped = false;
                self.buffer.clear();
            } else if self.in_frame {
                let decoded = if self.escaped {
                    self.escaped = false;
                    byte ^ ESCAPE_MASK
                } else if byte == ESCAPE {
                    self.escaped = true;
                    continue;
                } else {
                    byte
                };
                if self.buffer.len() >= MAX_FRAME {
                    errors.push(FramingError::Oversized);
                    self.buffer.clear();
                    self.in_frame = false;
                    self.escaped = false;
                    continue;
                }
                self.buffer.put_u8(decoded);
            }
        }
    }
}

/// Frame encoder for one serial session.
///
/// Stateful so that consecutive frames share their delimiter: the first frame
/// gets an opening flag, every frame gets a closing flag, and the closing
/// flag of one frame serves as the opening flag of the next.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    at_boundary: bool,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Escape and delimit one payload for the wire.
    pub fn encode(&mut self, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(payload.len() + 2);
        if !self.at_boundary {
            out.put_u8(FLAG);
        }
        for &byte in payload {
            if byte == FLAG || byte == ESCAPE {
                out.put_u8(ESCAPE);
                out.put_u8(byte ^ ESCAPE_MASK);
            } else {
                out.put_u8(byte);
            }
        }
        out.put_u8(FLAG);
        self.at_boundary = true;
        out.freeze()
    }
}

/// Encode a single standalone frame with both delimiters.
pub fn encode(payload: &[u8]) -> Bytes {
    FrameEncoder::new().encode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, data: &[u8]) -> (Vec<Bytes>, Vec<FramingError>) {
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        decoder.decode(data, &mut frames, &mut errors);
        (frames, errors)
    }

    #[test]
    fn round_trip() {
        let payload = b"\xff\x03\xc0\x21hello";
        let wire = encode(payload);
        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decode_all(&mut decoder, &wire);
        assert!(errors.is_empty());
        assert_eq!(frames, vec![Bytes::copy_from_slice(payload)]);
    }

    #[test]
    fn escapes_flag_and_escape_bytes() {
        let payload = [0x00, 0x7e, 0x7d, 0x41];
        let wire = encode(&payload);
        assert_eq!(&wire[..], &[0x7e, 0x00, 0x7d, 0x5e, 0x7d, 0x5d, 0x41, 0x7e]);

        // Between the delimiters, neither special byte appears bare.
        assert!(!wire[1..wire.len() - 1].contains(&FLAG));
        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decode_all(&mut decoder, &wire);
        assert!(errors.is_empty());
        assert_eq!(&frames[0][..], &payload);
    }

    #[test]
    fn consecutive_frames_share_one_flag() {
        let mut encoder = FrameEncoder::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&encoder.encode(b"one"));
        wire.extend_from_slice(&encoder.encode(b"two"));
        // 7E one 7E two 7E: exactly one flag between the frames.
        assert_eq!(wire.iter().filter(|&&b| b == FLAG).count(), 3);

        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decode_all(&mut decoder, &wire);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"one");
        assert_eq!(&frames[1][..], b"two");
    }

    #[test]
    fn double_flag_between_frames_is_tolerated() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode(b"one"));
        wire.extend_from_slice(&encode(b"two"));
        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decode_all(&mut decoder, &wire);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"one");
        assert_eq!(&frames[1][..], b"two");
    }

    #[test]
    fn frames_split_across_reads() {
        let wire = encode(b"split me");
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.decode(chunk, &mut frames, &mut errors);
        }
        assert!(errors.is_empty());
        assert_eq!(&frames[0][..], b"split me");
    }

    #[test]
    fn malformed_escape_drops_frame_and_resyncs() {
        // 7E .. 7D 7E is a parse error; the trailing flag starts a new frame
        // which then decodes normally.
        let wire = [0x7e, 0x41, 0x7d, 0x7e, 0x42, 0x7e];
        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decode_all(&mut decoder, &wire);
        assert_eq!(errors, vec![FramingError::BadEscape]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"\x42");
    }

    #[test]
    fn oversized_frame_is_dropped() {
        let mut wire = vec![0x7e];
        wire.extend(std::iter::repeat(0x41).take(MAX_FRAME + 1));
        wire.push(0x7e);
        wire.extend_from_slice(&encode(b"after"));
        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decode_all(&mut decoder, &wire);
        assert_eq!(errors, vec![FramingError::Oversized]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"after");
    }

    #[test]
    fn bytes_outside_frames_are_ignored() {
        let mut wire = b"line noise".to_vec();
        wire.extend_from_slice(&encode(b"frame"));
        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decode_all(&mut decoder, &wire);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"frame");
    }

    #[test]
    fn escaped_byte_split_across_reads() {
        let wire = encode(&[0x7d]);
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        // Split right between 0x7D and the escaped byte.
        decoder.decode(&wire[..2], &mut frames, &mut errors);
        assert!(frames.is_empty());
        decoder.decode(&wire[2..], &mut frames, &mut errors);
        assert!(errors.is_empty());
        assert_eq!(&frames[0][..], &[0x7d]);
    }
}
