#![forbid(unsafe_code)]

//! The round-robin multiplexing transport: a circuit fans one upstream
//! byte stream out across several downstream connections as framed
//! blocks, and reassembles the peer's blocks back into a byte stream.

pub mod circuit;
pub mod reassembly;
pub mod registry;
pub mod wire;

use thiserror::Error;

/// Header, flag, or ordering violations on the receive path.
///
/// Policy: the offending downstream connection is closed and detached;
/// the circuit survives unless that was its last connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("SYN block at nonzero offset {0}")]
    SynOffset(u32),
    #[error("duplicate SYN block")]
    DuplicateSyn,
    #[error("SYN block conflicts with already queued data")]
    SynAfterQueued,
    #[error("duplicate FIN block")]
    DuplicateFin,
    #[error("FIN block precedes already queued data")]
    FinBeforeQueued,
    #[error("block at offset {offset} (length {length}) overlaps queued data")]
    Overlap { offset: u32, length: u16 },
    #[error("data block outside the SYN..FIN window")]
    OutsideWindow,
    #[error("block payload of {0} bytes exceeds the maximum")]
    OversizedBlock(u16),
    #[error("reserved flag bits set: {0:#06x}")]
    ReservedFlags(u16),
    #[error("block for circuit {got:#x} on a connection bound to circuit {bound:#x}")]
    CircuitMismatch { got: u64, bound: u64 },
}

/// True if `s` precedes `t` in modulo-2^32 sequence space.
///
/// Offsets are ordered within a 2 GiB window: `s < t` iff
/// `(t - s) mod 2^32` lies in `(0, 2^31)`.
pub(crate) fn seq_lt(s: u32, t: u32) -> bool {
    let d = t.wrapping_sub(s);
    d != 0 && d < 1 << 31
}

/// True if `s` precedes or equals `t` in modulo-2^32 sequence space.
pub(crate) fn seq_le(s: u32, t: u32) -> bool {
    t.wrapping_sub(s) < 1 << 31
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_order_is_modular() {
        assert!(seq_lt(0, 1));
        assert!(!seq_lt(1, 0));
        assert!(!seq_lt(7, 7));
        assert!(seq_le(7, 7));

        // Wraparound: u32::MAX precedes 0.
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_le(u32::MAX, 5));
        assert!(!seq_lt(5, u32::MAX));

        // The window is half the sequence space.
        assert!(seq_lt(0, (1 << 31) - 1));
        assert!(!seq_lt(0, 1 << 31));
        assert!(!seq_le(0, 1 << 31));
    }
}
