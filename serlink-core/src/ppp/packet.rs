//! PPP control-packet and configuration-option encoding (RFC 1661).
//!
//! LCP and IPCP share one container: a PPP header `(0xFF, 0x03, protocol)`
//! around an inner packet `(code, identifier, length, data)`, where the data
//! of configure codes is a list of `(type, length, value)` options with
//! `length` counting the two-byte option header.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// All-stations address byte.
pub const ADDRESS: u8 = 0xff;
/// Unnumbered-information control byte.
pub const CONTROL: u8 = 0x03;

/// PPP protocol numbers.
pub mod proto {
    /// IPv4 datagrams.
    pub const IP: u16 = 0x0021;
    /// IP Control Protocol.
    pub const IPCP: u16 = 0x8021;
    /// Link Control Protocol.
    pub const LCP: u16 = 0xc021;
    /// Password Authentication Protocol. Not supported; rejected.
    pub const PAP: u16 = 0xc023;
    /// Challenge Handshake Authentication Protocol. Not supported; rejected.
    pub const CHAP: u16 = 0xc223;
}

/// LCP configuration option types.
pub mod lcp_opt {
    pub const MRU: u8 = 1;
    pub const AUTH_PROTOCOL: u8 = 3;
    pub const MAGIC_NUMBER: u8 = 5;
    pub const PROTOCOL_COMPRESSION: u8 = 7;
    pub const ADDRESS_CONTROL_COMPRESSION: u8 = 8;
}

/// IPCP configuration option types.
pub mod ipcp_opt {
    pub const IP_COMPRESSION: u8 = 2;
    pub const IP_ADDRESS: u8 = 3;
    pub const PRIMARY_DNS: u8 = 129;
    pub const SECONDARY_DNS: u8 = 131;
}

/// Control protocol codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    ConfigureRequest = 1,
    ConfigureAck = 2,
    ConfigureNak = 3,
    ConfigureReject = 4,
    TerminateRequest = 5,
    TerminateAck = 6,
    CodeReject = 7,
    ProtocolReject = 8,
    EchoRequest = 9,
    EchoReply = 10,
    DiscardRequest = 11,
}

impl TryFrom<u8> for Code {
    type Error = PppParseError;

    fn try_from(code: u8) -> Result<Self, PppParseError> {
        Ok(match code {
            1 => Self::ConfigureRequest,
            2 => Self::ConfigureAck,
            3 => Self::ConfigureNak,
            4 => Self::ConfigureReject,
            5 => Self::TerminateRequest,
            6 => Self::TerminateAck,
            7 => Self::CodeReject,
            8 => Self::ProtocolReject,
            9 => Self::EchoRequest,
            10 => Self::EchoReply,
            11 => Self::DiscardRequest,
            other => return Err(PppParseError::UnknownCode(other)),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PppParseError {
    #[error("frame too short for a PPP control packet")]
    TooShort,
    #[error("unexpected address/control bytes {0:#04x} {1:#04x}")]
    BadHeader(u8, u8),
    #[error("unknown control code {0}")]
    UnknownCode(u8),
    #[error("inner length {0} is inconsistent with the frame")]
    BadLength(u16),
    #[error("configuration option with invalid length")]
    BadOption,
}

/// The PPP protocol number of a decoded frame, if it has a well-formed
/// header.
pub fn frame_protocol(frame: &[u8]) -> Option<u16> {
    if frame.len() < 4 || frame[0] != ADDRESS || frame[1] != CONTROL {
        return None;
    }
    Some(u16::from_be_bytes([frame[2], frame[3]]))
}

/// Wrap an IPv4 packet in the PPP header for protocol 0x0021.
pub fn ip_frame(packet: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(packet.len() + 4);
    out.put_u8(ADDRESS);
    out.put_u8(CONTROL);
    out.put_u16(proto::IP);
    out.put_slice(packet);
    out.freeze()
}

/// One `(type, length, value)` configuration option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOption {
    pub kind: u8,
    pub data: Bytes,
}

impl ConfigOption {
    pub fn new(kind: u8, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn u16_value(kind: u8, value: u16) -> Self {
        Self::new(kind, value.to_be_bytes().to_vec())
    }

    pub fn u32_value(kind: u8, value: u32) -> Self {
        Self::new(kind, value.to_be_bytes().to_vec())
    }

    /// The option's value as a big-endian u16, if it is exactly two bytes.
    pub fn as_u16(&self) -> Option<u16> {
        <[u8; 2]>::try_from(&self.data[..]).ok().map(u16::from_be_bytes)
    }

    /// The option's value as a big-endian u32, if it is exactly four bytes.
    pub fn as_u32(&self) -> Option<u32> {
        <[u8; 4]>::try_from(&self.data[..]).ok().map(u32::from_be_bytes)
    }

    /// Parse a whole option list. An option whose length field is shorter
    /// than its own header or runs past the data invalidates the packet.
    pub fn parse_list(data: &[u8]) -> Result<Vec<Self>, PppParseError> {
        let mut options = Vec::new();
        let mut at = 0;
        while at + 2 <= data.len() {
            let kind = data[at];
            let length = data[at + 1] as usize;
            if length < 2 || at + length > data.len() {
                return Err(PppParseError::BadOption);
            }
            options.push(Self::new(kind, Bytes::copy_from_slice(&data[at + 2..at + length])));
            at += length;
        }
        if at != data.len() {
            return Err(PppParseError::BadOption);
        }
        Ok(options)
    }

    pub fn write_list(options: &[Self], out: &mut BytesMut) {
        for option in options {
            out.put_u8(option.kind);
            out.put_u8(2 + option.data.len() as u8);
            out.put_slice(&option.data);
        }
    }
}

/// The inner control packet, protocol-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub code: Code,
    pub identifier: u8,
    pub data: Bytes,
}

impl ControlPacket {
    pub fn new(code: Code, identifier: u8, data: impl Into<Bytes>) -> Self {
        Self {
            code,
            identifier,
            data: data.into(),
        }
    }

    pub fn with_options(code: Code, identifier: u8, options: &[ConfigOption]) -> Self {
        let mut data = BytesMut::new();
        ConfigOption::write_list(options, &mut data);
        Self::new(code, identifier, data.freeze())
    }

    /// Parse a complete PPP frame into its protocol number and the inner
    /// control packet.
    pub fn parse(frame: &[u8]) -> Result<(u16, Self), PppParseError> {
        if frame.len() < 8 {
            return Err(PppParseError::TooShort);
        }
        if frame[0] != ADDRESS || frame[1] != CONTROL {
            return Err(PppParseError::BadHeader(frame[0], frame[1]));
        }
        let protocol = u16::from_be_bytes([frame[2], frame[3]]);
        let inner = &frame[4..];
        let code = Code::try_from(inner[0])?;
        let identifier = inner[1];
        let length = u16::from_be_bytes([inner[2], inner[3]]);
        if (length as usize) < 4 || length as usize > inner.len() {
            return Err(PppParseError::BadLength(length));
        }
        Ok((
            protocol,
            Self {
                code,
                identifier,
                data: Bytes::copy_from_slice(&inner[4..length as usize]),
            },
        ))
    }

    /// Serialize with the PPP header for the given protocol. The result is
    /// ready for the framer.
    pub fn to_frame(&self, protocol: u16) -> Bytes {
        let mut out = BytesMut::with_capacity(8 + self.data.len());
        out.put_u8(ADDRESS);
        out.put_u8(CONTROL);
        out.put_u16(protocol);
        out.put_u8(self.code as u8);
        out.put_u8(self.identifier);
        out.put_u16(4 + self.data.len() as u16);
        out.put_slice(&self.data);
        out.freeze()
    }

    /// The packet's data parsed as a configuration option list.
    pub fn options(&self) -> Result<Vec<ConfigOption>, PppParseError> {
        ConfigOption::parse_list(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_packet_round_trip() {
        let options = [
            ConfigOption::u32_value(lcp_opt::MAGIC_NUMBER, 0xdeadbeef),
            ConfigOption::u16_value(lcp_opt::MRU, 1500),
        ];
        let packet = ControlPacket::with_options(Code::ConfigureRequest, 7, &options);
        let frame = packet.to_frame(proto::LCP);

        assert_eq!(frame_protocol(&frame), Some(proto::LCP));
        let (protocol, parsed) = ControlPacket::parse(&frame).unwrap();
        assert_eq!(protocol, proto::LCP);
        assert_eq!(parsed.code, Code::ConfigureRequest);
        assert_eq!(parsed.identifier, 7);
        let parsed_options = parsed.options().unwrap();
        assert_eq!(parsed_options.len(), 2);
        assert_eq!(parsed_options[0].as_u32(), Some(0xdeadbeef));
        assert_eq!(parsed_options[1].as_u16(), Some(1500));
    }

    #[test]
    fn trailing_bytes_beyond_length_are_ignored() {
        let packet = ControlPacket::new(Code::EchoRequest, 1, &b"\x01\x02\x03\x04"[..]);
        let mut frame = packet.to_frame(proto::LCP).to_vec();
        frame.extend_from_slice(&[0xaa, 0xbb]); // e.g. a peer's FCS
        let (_, parsed) = ControlPacket::parse(&frame).unwrap();
        assert_eq!(&parsed.data[..], b"\x01\x02\x03\x04");
    }

    #[test]
    fn bad_option_length_is_an_error() {
        assert_eq!(
            ConfigOption::parse_list(&[5, 1]),
            Err(PppParseError::BadOption)
        );
        assert_eq!(
            ConfigOption::parse_list(&[5, 6, 0, 0]),
            Err(PppParseError::BadOption)
        );
        // A dangling single byte cannot be an option header.
        assert_eq!(
            ConfigOption::parse_list(&[1, 2, 9]),
            Err(PppParseError::BadOption)
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(
            ControlPacket::parse(&[0xff, 0x03, 0xc0]),
            Err(PppParseError::TooShort)
        );
        assert_eq!(
            ControlPacket::parse(&[0x00, 0x03, 0xc0, 0x21, 1, 1, 0, 4]),
            Err(PppParseError::BadHeader(0x00, 0x03))
        );
        assert_eq!(
            ControlPacket::parse(&[0xff, 0x03, 0xc0, 0x21, 99, 1, 0, 4]),
            Err(PppParseError::UnknownCode(99))
        );
        assert_eq!(
            ControlPacket::parse(&[0xff, 0x03, 0xc0, 0x21, 1, 1, 0, 12]),
            Err(PppParseError::BadLength(12))
        );
    }
}
