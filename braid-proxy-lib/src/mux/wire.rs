#![forbid(unsafe_code)]

//! Serialization of the 16-byte block header.
//!
//! On the wire a block is the header followed by up to [`MAX_BLOCK`]
//! payload bytes, all fields in network byte order:
//!
//! ```text
//! bytes 0..8   circuit id (u64)
//! bytes 8..12  offset     (u32, modulo 2^32)
//! bytes 12..14 length     (u16, <= 32767)
//! bytes 14..16 flags      (u16)
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::{Buf, BufMut, BytesMut};

/// Size of the block header on the wire.
pub const HEADER_LEN: usize = 16;

/// Smallest unit the receive loop will look at: a header plus at least
/// a header's worth of payload.
pub const MIN_BLOCK: usize = 2 * HEADER_LEN;

/// Largest payload a single block may carry.
pub const MAX_BLOCK: usize = i16::MAX as usize;

/// Bit flags carried in a block header.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u16);

impl Flags {
    /// First block of the circuit's logical stream; offset must be zero.
    pub const SYN: Flags = Flags(0x0001);
    /// Last block of the circuit's logical stream.
    pub const FIN: Flags = Flags(0x0002);
    /// Payload is decoy traffic and is discarded on receive.
    pub const CHAFF: Flags = Flags(0x0004);

    const KNOWN: u16 = 0x0007;

    pub fn empty() -> Flags {
        Flags(0)
    }

    pub fn from_bits(bits: u16) -> Flags {
        Flags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    /// Bits outside the assigned set; must be zero on transmit.
    pub fn reserved_bits(self) -> u16 {
        self.0 & !Self::KNOWN
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("(none)");
        }
        let mut sep = "";
        for (bit, name) in [(Flags::SYN, "SYN"), (Flags::FIN, "FIN"), (Flags::CHAFF, "CHAFF")] {
            if self.contains(bit) {
                write!(f, "{sep}{name}")?;
                sep = "|";
            }
        }
        let reserved = self.reserved_bits();
        if reserved != 0 {
            write!(f, "{sep}{reserved:#06x}")?;
        }
        Ok(())
    }
}

/// Decoded form of the 16-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub circuit_id: u64,
    pub offset: u32,
    pub length: u16,
    pub flags: Flags,
}

impl BlockHeader {
    /// Append the wire encoding to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(HEADER_LEN);
        out.put_u64(self.circuit_id);
        out.put_u32(self.offset);
        out.put_u16(self.length);
        out.put_u16(self.flags.bits());
    }

    /// Decode the first [`HEADER_LEN`] bytes of `buf` without consuming
    /// them. Returns `None` when too few bytes are buffered; the caller
    /// waits for more input.
    pub fn peek(mut buf: &[u8]) -> Option<BlockHeader> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(BlockHeader {
            circuit_id: buf.get_u64(),
            offset: buf.get_u32(),
            length: buf.get_u16(),
            flags: Flags::from_bits(buf.get_u16()),
        })
    }

    /// Total on-wire size of the block this header describes.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = BlockHeader {
            circuit_id: 0x0123_4567_89ab_cdef,
            offset: 0xdead_beef,
            length: 0x7fff,
            flags: Flags::SYN | Flags::FIN | Flags::CHAFF,
        };
        let mut wire = BytesMut::new();
        hdr.encode(&mut wire);
        assert_eq!(wire.len(), HEADER_LEN);
        assert_eq!(BlockHeader::peek(&wire), Some(hdr));
    }

    #[test]
    fn encoding_is_network_byte_order() {
        let hdr = BlockHeader {
            circuit_id: 0x0102_0304_0506_0708,
            offset: 0x0a0b_0c0d,
            length: 0x0e0f,
            flags: Flags::from_bits(0x0003),
        };
        let mut wire = BytesMut::new();
        hdr.encode(&mut wire);
        assert_eq!(
            &wire[..],
            &[
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // circuit id
                0x0a, 0x0b, 0x0c, 0x0d, // offset
                0x0e, 0x0f, // length
                0x00, 0x03, // flags
            ]
        );
    }

    #[test]
    fn peek_needs_full_header() {
        assert_eq!(BlockHeader::peek(&[]), None);
        assert_eq!(BlockHeader::peek(&[0u8; HEADER_LEN - 1]), None);
        assert!(BlockHeader::peek(&[0u8; HEADER_LEN]).is_some());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut wire = BytesMut::new();
        let hdr = BlockHeader {
            circuit_id: 7,
            offset: 32,
            length: 4,
            flags: Flags::empty(),
        };
        hdr.encode(&mut wire);
        let before = wire.clone();
        let _ = BlockHeader::peek(&wire);
        assert_eq!(wire, before);
    }

    #[test]
    fn reserved_bits_are_visible() {
        let flags = Flags::from_bits(0x8003);
        assert!(flags.contains(Flags::SYN));
        assert_eq!(flags.reserved_bits(), 0x8000);
        assert_eq!(Flags::SYN.reserved_bits(), 0);
    }
}
