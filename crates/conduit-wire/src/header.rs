use bitflags::bitflags;

use crate::codec::{self, Result};

/// Current header format version.
pub const HEADER_VERSION: u8 = 1;

/// Sub-protocol tag for frames that carry no protocol discriminator. The tag
/// is opaque to the comm layer; consumers define their own values.
pub const PROTOCOL_NONE: u8 = 0;

bitflags! {
    /// Frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        /// The frame is a request; a response may follow.
        const REQUEST = 0x01;
        /// The sender does not want the response delivered; no pending
        /// request is registered for such a frame.
        const IGNORE_RESPONSE = 0x02;
    }
}

/// Fixed wire header, little-endian on the wire:
///
/// ```text
/// offset  size  field
/// 0       1     version
/// 1       1     protocol
/// 2       1     flags
/// 3       1     header_len
/// 4       4     id
/// 8       4     group
/// 12      4     total_len
/// ```
///
/// `total_len` covers the header itself plus the primary and extended
/// payload segments. Responses echo the request's `id` and `group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub protocol: u8,
    pub flags: Flags,
    pub header_len: u8,
    pub id: u32,
    pub group: u32,
    pub total_len: u32,
}

impl Header {
    /// Encoded size of the header.
    pub const LEN: usize = 16;

    pub fn new(protocol: u8) -> Self {
        Self {
            version: HEADER_VERSION,
            protocol,
            flags: Flags::empty(),
            header_len: Self::LEN as u8,
            id: 0,
            group: 0,
            total_len: 0,
        }
    }

    /// Writes the header into the first [`Header::LEN`] bytes of `out`.
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0] = self.version;
        out[1] = self.protocol;
        out[2] = self.flags.bits();
        out[3] = self.header_len;
        out[4..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..12].copy_from_slice(&self.group.to_le_bytes());
        out[12..16].copy_from_slice(&self.total_len.to_le_bytes());
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.resize(start + Self::LEN, 0);
        self.encode_into(&mut buf[start..]);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let version = codec::decode_u8(buf)?;
        let protocol = codec::decode_u8(buf)?;
        let flags = Flags::from_bits_retain(codec::decode_u8(buf)?);
        let header_len = codec::decode_u8(buf)?;
        let id = codec::decode_u32(buf)?;
        let group = codec::decode_u32(buf)?;
        let total_len = codec::decode_u32(buf)?;
        Ok(Self { version, protocol, flags, header_len, id, group, total_len })
    }

    /// True when the header carries a plausible frame: known version, the
    /// documented header size, and a total length that covers the header.
    pub fn is_well_formed(&self) -> bool {
        self.version == HEADER_VERSION &&
            usize::from(self.header_len) == Self::LEN &&
            self.total_len as usize >= Self::LEN
    }

    /// Payload bytes following the header on the wire.
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(usize::from(self.header_len))
    }

    pub fn is_request(&self) -> bool {
        self.flags.contains(Flags::REQUEST)
    }

    pub fn ignores_response(&self) -> bool {
        self.flags.contains(Flags::IGNORE_RESPONSE)
    }
}

// Decode must be the strict inverse of encode. Round-trip lives here, the
// on-wire invariants (total_len accounting) are exercised in frame.rs.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;

    #[test]
    fn roundtrip() {
        let hdr = Header {
            version: HEADER_VERSION,
            protocol: 3,
            flags: Flags::REQUEST | Flags::IGNORE_RESPONSE,
            header_len: Header::LEN as u8,
            id: 0x1122_3344,
            group: 7,
            total_len: 1024,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), Header::LEN);

        let mut cur = buf.as_slice();
        let back = Header::decode(&mut cur).unwrap();
        assert!(cur.is_empty());
        assert_eq!(back, hdr);
        assert!(back.is_well_formed());
        assert_eq!(back.payload_len(), 1024 - Header::LEN);
    }

    #[test]
    fn wire_layout() {
        let mut hdr = Header::new(2);
        hdr.flags = Flags::REQUEST;
        hdr.id = 0x0403_0201;
        hdr.group = 0x0807_0605;
        hdr.total_len = 0x0c0b_0a09;
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        assert_eq!(buf, [1, 2, 1, 16, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn truncated_header_overruns() {
        let mut cur: &[u8] = &[1, 0, 0, 16, 0, 0];
        assert_eq!(Header::decode(&mut cur), Err(CodecError::InputOverrun));
    }

    #[test]
    fn malformed_headers_detected() {
        let mut hdr = Header::new(PROTOCOL_NONE);
        hdr.total_len = Header::LEN as u32;
        assert!(hdr.is_well_formed());

        hdr.version = 9;
        assert!(!hdr.is_well_formed());
        hdr.version = HEADER_VERSION;
        hdr.header_len = 12;
        assert!(!hdr.is_well_formed());
        hdr.header_len = Header::LEN as u8;
        hdr.total_len = 4;
        assert!(!hdr.is_well_formed());
    }
}
