//! IPv4 header parsing and construction.
//!
//! Ingress accepts any header with IHL >= 5 and a valid checksum; options are
//! skipped, not interpreted. Egress always emits the 20-byte header with DF
//! set, TTL 64, and a monotonically incrementing identification.

use super::checksum::{self, Checksum};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Protocol number for TCP in the IPv4 header.
pub const PROTOCOL_TCP: u8 = 6;

/// Smallest legal header: five 32-bit words.
const BASE_WORDS: u8 = 5;
const BASE_OCTETS: usize = BASE_WORDS as usize * 4;

/// Time-to-live stamped on every egress packet.
const EGRESS_TTL: u8 = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Ipv4ParseError {
    #[error("packet shorter than the IPv4 header")]
    HeaderTooShort,
    #[error("expected version 4, got {0}")]
    WrongVersion(u8),
    #[error("header length {0} words is less than the minimum of 5")]
    InvalidHeaderLength(u8),
    #[error("packet shorter than its total length field claims")]
    Truncated,
    #[error("IPv4 header checksum mismatch")]
    InvalidChecksum,
}

/// The fields of an IPv4 header this stack cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub ihl: u8,
    pub total_length: u16,
    pub identification: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// In units of 8 bytes, as on the wire.
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Whether this packet is a fragment of a larger datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

/// Parse a packet into its header and payload. The header checksum is
/// verified; options are included in the checksum but otherwise skipped.
pub fn parse(packet: &[u8]) -> Result<(Ipv4Header, &[u8]), Ipv4ParseError> {
    if packet.len() < BASE_OCTETS {
        return Err(Ipv4ParseError::HeaderTooShort);
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return Err(Ipv4ParseError::WrongVersion(version));
    }
    let ihl = packet[0] & 0x0f;
    if ihl < BASE_WORDS {
        return Err(Ipv4ParseError::InvalidHeaderLength(ihl));
    }
    let header_len = ihl as usize * 4;
    if packet.len() < header_len {
        return Err(Ipv4ParseError::HeaderTooShort);
    }
    if !checksum::verifies(&packet[..header_len]) {
        return Err(Ipv4ParseError::InvalidChecksum);
    }

    let total_length = u16::from_be_bytes([packet[2], packet[3]]);
    if (total_length as usize) < header_len || packet.len() < total_length as usize {
        return Err(Ipv4ParseError::Truncated);
    }
    let flags_and_offset = u16::from_be_bytes([packet[6], packet[7]]);

    let header = Ipv4Header {
        ihl,
        total_length,
        identification: u16::from_be_bytes([packet[4], packet[5]]),
        dont_fragment: flags_and_offset & 0x4000 != 0,
        more_fragments: flags_and_offset & 0x2000 != 0,
        fragment_offset: flags_and_offset & 0x1fff,
        ttl: packet[8],
        protocol: packet[9],
        source: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
        destination: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
    };
    Ok((header, &packet[header_len..total_length as usize]))
}

/// Build an egress packet around a payload.
pub fn build(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    identification: u16,
    payload: &[u8],
) -> Bytes {
    let total_length = (BASE_OCTETS + payload.len()) as u16;
    let mut out = BytesMut::with_capacity(total_length as usize);
    out.put_u8((4 << 4) | BASE_WORDS);
    out.put_u8(0); // type of service
    out.put_u16(total_length);
    out.put_u16(identification);
    out.put_u16(0x4000); // don't fragment, offset zero
    out.put_u8(EGRESS_TTL);
    out.put_u8(protocol);
    out.put_u16(0); // checksum, filled in below
    out.put_slice(&source.octets());
    out.put_slice(&destination.octets());

    let mut header_checksum = Checksum::new();
    header_checksum.add_slice(&out);
    let header_checksum = header_checksum.finish();
    out[10..12].copy_from_slice(&header_checksum.to_be_bytes());

    out.put_slice(payload);
    out.freeze()
}
