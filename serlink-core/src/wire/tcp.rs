//! TCP header parsing and construction.
//!
//! The checksum is computed over the pseudo-header `(src, dst, 0, 6, length)`
//! followed by the segment; a mismatch is a parse error that the caller drops
//! silently. Option bytes are carried verbatim on the header and interpreted
//! lazily by [`TcpOptions::parse`], which treats a malformed option list as
//! absent rather than poisoning the segment.

use super::checksum::Checksum;
use super::ipv4::PROTOCOL_TCP;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

const BASE_WORDS: u8 = 5;
const BASE_OCTETS: usize = BASE_WORDS as usize * 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TcpParseError {
    #[error("segment shorter than the TCP header")]
    SegmentTooShort,
    #[error("data offset {0} words is invalid for this segment")]
    InvalidDataOffset(u8),
    #[error("TCP checksum mismatch")]
    InvalidChecksum,
}

/// The control bits, kept in wire order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Control(u8);

impl Control {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn new(bits: u8) -> Self {
        Self(bits & 0x3f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn psh(self) -> bool {
        self.0 & Self::PSH != 0
    }

    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn urg(self) -> bool {
        self.0 & Self::URG != 0
    }

    pub fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bit, name) in [
            (Self::SYN, "SYN"),
            (Self::FIN, "FIN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
            (Self::ACK, "ACK"),
            (Self::URG, "URG"),
        ] {
            if self.0 & bit != 0 {
                write!(f, "{name}.")?;
            }
        }
        Ok(())
    }
}

/// A TCP header plus its verbatim option bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words, options included.
    pub data_offset: u8,
    pub ctl: Control,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: Bytes,
}

impl TcpHeader {
    /// Serialize the header and options. The stored checksum is written out
    /// as-is; it was computed when the header was built.
    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u16(self.src_port);
        out.put_u16(self.dst_port);
        out.put_u32(self.seq);
        out.put_u32(self.ack);
        out.put_u8(self.data_offset << 4);
        out.put_u8(self.ctl.bits());
        out.put_u16(self.window);
        out.put_u16(self.checksum);
        out.put_u16(self.urgent);
        out.put_slice(&self.options);
    }
}

/// Parse a TCP segment, verifying the checksum against the given addresses.
/// Returns the header and the payload.
pub fn parse(
    segment: &[u8],
    source: Ipv4Addr,
    destination: Ipv4Addr,
) -> Result<(TcpHeader, Bytes), TcpParseError> {
    if segment.len() < BASE_OCTETS {
        return Err(TcpParseError::SegmentTooShort);
    }
    let data_offset = segment[12] >> 4;
    let header_len = data_offset as usize * 4;
    if data_offset < BASE_WORDS || segment.len() < header_len {
        return Err(TcpParseError::InvalidDataOffset(data_offset));
    }

    let mut pseudo = Checksum::new();
    pseudo.add_addr(source);
    pseudo.add_addr(destination);
    pseudo.add_u16(PROTOCOL_TCP as u16);
    pseudo.add_u16(segment.len() as u16);
    pseudo.add_slice(segment);
    if pseudo.finish() != 0 {
        return Err(TcpParseError::InvalidChecksum);
    }

    let header = TcpHeader {
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
        data_offset,
        ctl: Control::new(segment[13]),
        window: u16::from_be_bytes([segment[14], segment[15]]),
        checksum: u16::from_be_bytes([segment[16], segment[17]]),
        urgent: u16::from_be_bytes([segment[18], segment[19]]),
        options: Bytes::copy_from_slice(&segment[BASE_OCTETS..header_len]),
    };
    Ok((header, Bytes::copy_from_slice(&segment[header_len..])))
}

/// Builder for egress headers, in the order fields are usually decided.
#[derive(Debug, Clone)]
pub struct TcpHeaderBuilder {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    ctl: Control,
    window: u16,
    options: BytesMut,
}

impl TcpHeaderBuilder {
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack: 0,
            ctl: Control::default(),
            window: 0,
            options: BytesMut::new(),
        }
    }

    pub fn syn(mut self) -> Self {
        self.ctl = self.ctl.with(Control::SYN);
        self
    }

    pub fn fin(mut self) -> Self {
        self.ctl = self.ctl.with(Control::FIN);
        self
    }

    pub fn rst(mut self) -> Self {
        self.ctl = self.ctl.with(Control::RST);
        self
    }

    pub fn psh(mut self) -> Self {
        self.ctl = self.ctl.with(Control::PSH);
        self
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self.ctl = self.ctl.with(Control::ACK);
        self
    }

    pub fn wnd(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    /// Append a Maximum Segment Size option.
    pub fn mss(mut self, mss: u16) -> Self {
        self.options.put_u8(option::MSS);
        self.options.put_u8(4);
        self.options.put_u16(mss);
        self
    }

    /// Finish the header, computing the checksum over the pseudo-header, the
    /// header itself, the NOP-padded options, and the payload.
    pub fn build(mut self, source: Ipv4Addr, destination: Ipv4Addr, payload: &[u8]) -> TcpHeader {
        while self.options.len() % 4 != 0 {
            self.options.put_u8(option::NOP);
        }
        let data_offset = BASE_WORDS + (self.options.len() / 4) as u8;
        let mut header = TcpHeader {
            src_port: self.src_port,
            dst_port: self.dst_port,
            seq: self.seq,
            ack: self.ack,
            data_offset,
            ctl: self.ctl,
            window: self.window,
            checksum: 0,
            urgent: 0,
            options: self.options.freeze(),
        };

        let segment_len = data_offset as usize * 4 + payload.len();
        let mut checksum = Checksum::new();
        checksum.add_addr(source);
        checksum.add_addr(destination);
        checksum.add_u16(PROTOCOL_TCP as u16);
        checksum.add_u16(segment_len as u16);
        let mut bytes = BytesMut::with_capacity(segment_len);
        header.write_to(&mut bytes);
        checksum.add_slice(&bytes);
        checksum.add_slice(payload);
        header.checksum = checksum.finish();
        header
    }
}

/// Serialize a built header and its payload into one segment.
pub fn serialize(header: &TcpHeader, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(header.data_offset as usize * 4 + payload.len());
    header.write_to(&mut out);
    out.put_slice(payload);
    out.freeze()
}

/// TCP option kinds this stack recognises.
pub mod option {
    pub const END: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const TIMESTAMP: u8 = 8;
}

/// The options this stack parses. Window scale, SACK-permitted, and
/// timestamps are recognised but not acted on beyond parsing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub timestamp: Option<(u32, u32)>,
}

impl TcpOptions {
    /// Parse an option list. A malformed list yields the empty set: the
    /// segment is then processed as if it carried no options.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut options = Self::default();
        let mut at = 0;
        while at < bytes.len() {
            match bytes[at] {
                option::END => break,
                option::NOP => {
                    at += 1;
                    continue;
                }
                kind => {
                    let Some(&len) = bytes.get(at + 1) else {
                        return Self::default();
                    };
                    let len = len as usize;
                    if len < 2 || at + len > bytes.len() {
                        return Self::default();
                    }
                    let value = &bytes[at + 2..at + len];
                    match (kind, value.len()) {
                        (option::MSS, 2) => {
                            options.mss = Some(u16::from_be_bytes([value[0], value[1]]));
                        }
                        (option::WINDOW_SCALE, 1) => {
                            options.window_scale = Some(value[0]);
                        }
                        (option::SACK_PERMITTED, 0) => {
                            options.sack_permitted = true;
                        }
                        (option::TIMESTAMP, 8) => {
                            options.timestamp = Some((
                                u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
                                u32::from_be_bytes([value[4], value[5], value[6], value[7]]),
                            ));
                        }
                        // Unknown but well-formed options are skipped.
                        _ => {}
                    }
                    at += len;
                }
            }
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[test]
    fn build_then_parse() {
        let payload = b"Hello, world!";
        let header = TcpHeaderBuilder::new(0xcafe, 0xbabe, 123_456_789)
            .ack(10)
            .psh()
            .wnd(1024)
            .build(SRC, DST, payload);
        let segment = serialize(&header, payload);
        let (parsed, text) = parse(&segment, SRC, DST).unwrap();
        assert_eq!(parsed.src_port, 0xcafe);
        assert_eq!(parsed.dst_port, 0xbabe);
        assert_eq!(parsed.seq, 123_456_789);
        assert_eq!(parsed.ack, 10);
        assert!(parsed.ctl.ack());
        assert!(parsed.ctl.psh());
        assert!(!parsed.ctl.syn());
        assert_eq!(parsed.window, 1024);
        assert_eq!(&text[..], payload);
    }

    #[test]
    fn checksum_matches_etherparse() {
        let payload = b"cross-check";
        let header = TcpHeaderBuilder::new(22, 40000, 1000)
            .ack(2000)
            .psh()
            .wnd(8192)
            .build(SRC, DST, payload);

        let mut reference = etherparse::TcpHeader::new(22, 40000, 1000, 8192);
        reference.acknowledgment_number = 2000;
        reference.ack = true;
        reference.psh = true;
        let reference_checksum = reference
            .calc_checksum_ipv4_raw(SRC.octets(), DST.octets(), payload)
            .unwrap();
        assert_eq!(header.checksum, reference_checksum);
    }

    #[test]
    fn corrupted_segment_fails_checksum() {
        let header = TcpHeaderBuilder::new(1, 2, 3).ack(4).wnd(5).build(SRC, DST, b"data");
        let segment = serialize(&header, b"data");
        let mut corrupt = segment.to_vec();
        *corrupt.last_mut().unwrap() ^= 0x01;
        assert_eq!(
            parse(&corrupt, SRC, DST),
            Err(TcpParseError::InvalidChecksum)
        );
    }

    #[test]
    fn mss_option_round_trips() {
        let header = TcpHeaderBuilder::new(1, 2, 0).syn().wnd(4096).mss(1460).build(SRC, DST, &[]);
        assert_eq!(header.data_offset, 6);
        let segment = serialize(&header, &[]);
        let (parsed, _) = parse(&segment, SRC, DST).unwrap();
        let options = TcpOptions::parse(&parsed.options);
        assert_eq!(options.mss, Some(1460));
    }

    #[test]
    fn option_parsing_is_lenient() {
        // NOP, NOP, MSS
        let options = TcpOptions::parse(&[1, 1, 2, 4, 0x05, 0xb4]);
        assert_eq!(options.mss, Some(1460));

        // Window scale and SACK-permitted together
        let options = TcpOptions::parse(&[3, 3, 7, 4, 2]);
        assert_eq!(options.window_scale, Some(7));
        assert!(options.sack_permitted);

        // END terminates the list before the garbage
        let options = TcpOptions::parse(&[2, 4, 0x05, 0xb4, 0, 0xff]);
        assert_eq!(options.mss, Some(1460));

        // Truncated MSS: the whole list is discarded
        let options = TcpOptions::parse(&[2, 4, 0x05]);
        assert_eq!(options, TcpOptions::default());

        // Zero length would loop forever; discarded instead
        let options = TcpOptions::parse(&[2, 0, 1, 1]);
        assert_eq!(options, TcpOptions::default());
    }

    #[test]
    fn unknown_options_are_skipped() {
        // Kind 254 (experimental), then MSS.
        let options = TcpOptions::parse(&[254, 4, 0xde, 0xad, 2, 4, 0x02, 0x18]);
        assert_eq!(options.mss, Some(536));
    }
}
