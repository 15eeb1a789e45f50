#![forbid(unsafe_code)]

//! The circuit: one logical bidirectional stream carried as framed
//! blocks across a set of downstream connections.
//!
//! The transmit side carves the pending upstream bytes into blocks of
//! random size and deals them out round-robin; the receive side feeds
//! arriving blocks through the reassembly queue and delivers contiguous
//! runs to the upstream sink. All state changes are synchronous with
//! the events that cause them; async plumbing lives in the writer and
//! reader tasks that drain the channels handed out here.

use bytes::{Buf, Bytes, BytesMut};
use rand::{Rng, RngCore};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::reassembly::ReassemblyQueue;
use super::wire::{BlockHeader, Flags, HEADER_LEN, MAX_BLOCK, MIN_BLOCK};
use super::ProtocolError;

/// Frame queued toward one downstream transport.
#[derive(Debug)]
pub enum DownstreamFrame {
    /// A fully framed block: 16-byte header plus payload.
    Block(Bytes),
    /// Flush and half-close the transport.
    Eof,
}

/// Event delivered to the upstream byte sink.
#[derive(Debug)]
pub enum UpstreamEvent {
    Data(Bytes),
    Eof,
}

/// Handle to one downstream connection's outbound queue.
#[derive(Debug, Clone)]
pub struct DownstreamLink {
    id: u64,
    tx: mpsc::UnboundedSender<DownstreamFrame>,
}

impl DownstreamLink {
    pub fn new(id: u64, tx: mpsc::UnboundedSender<DownstreamFrame>) -> DownstreamLink {
        DownstreamLink { id, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: DownstreamFrame) {
        // A closed receiver means the connection died with frames in
        // flight; those bytes are lost, like any already-flushed block
        // on a dropped connection.
        if self.tx.send(frame).is_err() {
            warn!(conn = self.id, "downstream gone, dropping frame");
        }
    }
}

/// Source of block sizes and chaff payloads.
///
/// The uniform distribution is the interoperability default; tests pin
/// sizes through this seam.
pub trait BlockPolicy: Send {
    /// Size of the next block to carve, in `[MIN_BLOCK, MAX_BLOCK)`.
    fn next_block_size(&mut self) -> u16;

    /// A chaff payload of exactly `len` bytes.
    fn chaff(&mut self, len: usize) -> Bytes;
}

/// Uniformly random block sizes and random chaff bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformBlocks;

impl BlockPolicy for UniformBlocks {
    fn next_block_size(&mut self) -> u16 {
        rand::rng().random_range(MIN_BLOCK as u16..MAX_BLOCK as u16)
    }

    fn chaff(&mut self, len: usize) -> Bytes {
        let mut buf = vec![0u8; len];
        rand::rng().fill_bytes(&mut buf);
        buf.into()
    }
}

/// What the caller must do after a downstream detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Other downstreams remain; nothing to do.
    Kept,
    /// Both FINs have passed and the last downstream is gone.
    CloseNow,
    /// The last downstream is gone mid-stream; arm the axe timer.
    ArmAxe,
}

/// A logical endpoint multiplexed over `downstreams`.
pub struct Circuit {
    circuit_id: u64,
    downstreams: Vec<DownstreamLink>,
    xmit_pending: BytesMut,
    reassembly: ReassemblyQueue,
    upstream: mpsc::UnboundedSender<UpstreamEvent>,
    policy: Box<dyn BlockPolicy>,
    send_offset: u32,
    recv_offset: u32,
    next_block_size: u16,
    next_down: usize,
    sent_syn: bool,
    sent_fin: bool,
    received_syn: bool,
    received_fin: bool,
}

impl Circuit {
    pub fn new(
        circuit_id: u64,
        upstream: mpsc::UnboundedSender<UpstreamEvent>,
        mut policy: Box<dyn BlockPolicy>,
    ) -> Circuit {
        let next_block_size = policy.next_block_size();
        Circuit {
            circuit_id,
            downstreams: Vec::new(),
            xmit_pending: BytesMut::new(),
            reassembly: ReassemblyQueue::new(),
            upstream,
            policy,
            send_offset: 0,
            recv_offset: 0,
            next_block_size,
            next_down: 0,
            sent_syn: false,
            sent_fin: false,
            received_syn: false,
            received_fin: false,
        }
    }

    pub fn circuit_id(&self) -> u64 {
        self.circuit_id
    }

    pub fn sent_fin(&self) -> bool {
        self.sent_fin
    }

    pub fn received_fin(&self) -> bool {
        self.received_fin
    }

    pub fn has_downstreams(&self) -> bool {
        !self.downstreams.is_empty()
    }

    pub fn downstream_count(&self) -> usize {
        self.downstreams.len()
    }

    /// Add a downstream in stable round-robin order. Any bytes stranded
    /// while the circuit had no members are flushed out immediately.
    pub fn attach_downstream(&mut self, link: DownstreamLink) {
        debug!(
            circuit = self.circuit_id,
            conn = link.id(),
            members = self.downstreams.len() + 1,
            "downstream attached"
        );
        self.downstreams.push(link);
        if !self.sent_fin && !self.xmit_pending.is_empty() {
            self.emit_blocks(false);
        }
    }

    /// Remove a downstream; unknown ids are ignored (detach is raced
    /// from both the reader and the writer side of a connection).
    pub fn detach_downstream(&mut self, conn_id: u64) -> DetachOutcome {
        let Some(pos) = self.downstreams.iter().position(|l| l.id() == conn_id) else {
            return DetachOutcome::Kept;
        };
        self.downstreams.remove(pos);
        debug!(
            circuit = self.circuit_id,
            conn = conn_id,
            members = self.downstreams.len(),
            "downstream detached"
        );

        // Keep the round-robin cursor on the member that was next.
        if self.next_down > pos {
            self.next_down -= 1;
        }
        if self.next_down >= self.downstreams.len() {
            self.next_down = 0;
        }

        if !self.downstreams.is_empty() {
            DetachOutcome::Kept
        } else if self.sent_fin && self.received_fin {
            DetachOutcome::CloseNow
        } else {
            DetachOutcome::ArmAxe
        }
    }

    /// Transmit-path entry: bytes read from the upstream endpoint.
    pub fn on_upstream_bytes(&mut self, data: &[u8]) {
        self.xmit_pending.extend_from_slice(data);
        self.emit_blocks(false);
    }

    /// Upstream hit end of stream: flush what is pending, emitting FIN
    /// on the final data block, or on a chaff block if nothing is left
    /// to carry it.
    pub fn on_upstream_eof(&mut self) {
        if self.downstreams.is_empty() {
            self.sent_fin = true;
            return;
        }

        if !self.xmit_pending.is_empty() {
            self.emit_blocks(true);
        } else {
            self.send_chaff_fin();
        }

        self.sent_fin = true;
        for link in &self.downstreams {
            link.send(DownstreamFrame::Eof);
        }
    }

    /// Carve as many full blocks as the pending buffer allows, dealing
    /// them out round-robin. At EOF the last short block shrinks to fit
    /// and carries FIN.
    fn emit_blocks(&mut self, at_eof: bool) {
        loop {
            if self.downstreams.is_empty() {
                // Bytes stay pending until a connection joins again.
                break;
            }

            let avail = self.xmit_pending.len();
            let mut flags = if self.sent_syn { Flags::empty() } else { Flags::SYN };

            if at_eof && avail > 0 && avail <= self.next_block_size as usize {
                self.next_block_size = avail as u16;
                flags |= Flags::FIN;
            } else if avail < self.next_block_size as usize {
                break;
            }

            let size = self.next_block_size as usize;
            let hdr = BlockHeader {
                circuit_id: self.circuit_id,
                offset: self.send_offset,
                length: size as u16,
                flags,
            };

            // Frame into a fresh buffer; the pending buffer is only
            // drained once the whole block has been handed off.
            let mut frame = BytesMut::with_capacity(HEADER_LEN + size);
            hdr.encode(&mut frame);
            frame.extend_from_slice(&self.xmit_pending[..size]);

            let target = &self.downstreams[self.next_down];
            trace!(
                circuit = self.circuit_id,
                conn = target.id(),
                offset = self.send_offset,
                len = size,
                flags = ?flags,
                "block queued"
            );
            target.send(DownstreamFrame::Block(frame.freeze()));
            self.xmit_pending.advance(size);

            self.next_down = (self.next_down + 1) % self.downstreams.len();
            self.send_offset = self.send_offset.wrapping_add(size as u32);
            self.next_block_size = self.policy.next_block_size();
            self.sent_syn = true;
        }
    }

    /// Send one chaff block to carry the FIN when no data is pending.
    fn send_chaff_fin(&mut self) {
        let size = self.next_block_size as usize;
        let hdr = BlockHeader {
            circuit_id: self.circuit_id,
            offset: self.send_offset,
            length: size as u16,
            flags: Flags::FIN | Flags::CHAFF,
        };
        let mut frame = BytesMut::with_capacity(HEADER_LEN + size);
        hdr.encode(&mut frame);
        frame.extend_from_slice(&self.policy.chaff(size));

        let target = &self.downstreams[self.next_down];
        debug!(
            circuit = self.circuit_id,
            conn = target.id(),
            offset = self.send_offset,
            len = size,
            "chaff FIN queued"
        );
        target.send(DownstreamFrame::Block(frame.freeze()));

        // Advance state as for a data block, so the offsets stay
        // consistent if anything else were ever to follow.
        self.next_down = (self.next_down + 1) % self.downstreams.len();
        self.send_offset = self.send_offset.wrapping_add(size as u32);
        self.next_block_size = self.policy.next_block_size();
    }

    /// Receive-path entry: consume as many whole blocks as `inbound`
    /// holds, then deliver whatever became contiguous.
    ///
    /// On error the caller closes and detaches the connection; bytes
    /// already consumed from `inbound` stay consumed.
    pub fn on_downstream_bytes(&mut self, inbound: &mut BytesMut) -> Result<(), ProtocolError> {
        self.process_blocks(inbound, MIN_BLOCK)?;
        self.deliver_ready();
        Ok(())
    }

    /// The connection hit end of stream: drain what it still buffers.
    ///
    /// The last block of a stream may be shorter than [`MIN_BLOCK`] on
    /// the wire (EOF shrinks the final data block to fit), so the drain
    /// only requires a complete header per block.
    pub fn on_downstream_eof(&mut self, inbound: &mut BytesMut) -> Result<(), ProtocolError> {
        self.process_blocks(inbound, HEADER_LEN)?;
        self.deliver_ready();
        Ok(())
    }

    fn process_blocks(&mut self, inbound: &mut BytesMut, min_avail: usize) -> Result<(), ProtocolError> {
        loop {
            if inbound.len() < min_avail {
                break;
            }
            let Some(hdr) = BlockHeader::peek(inbound) else {
                break;
            };

            let reserved = hdr.flags.reserved_bits();
            if reserved != 0 {
                return Err(ProtocolError::ReservedFlags(reserved));
            }
            if hdr.length as usize > MAX_BLOCK {
                return Err(ProtocolError::OversizedBlock(hdr.length));
            }
            if inbound.len() < hdr.wire_len() {
                break;
            }
            if hdr.circuit_id != self.circuit_id {
                return Err(ProtocolError::CircuitMismatch {
                    got: hdr.circuit_id,
                    bound: self.circuit_id,
                });
            }

            inbound.advance(HEADER_LEN);
            let payload = inbound.split_to(hdr.length as usize);
            trace!(
                circuit = self.circuit_id,
                offset = hdr.offset,
                len = hdr.length,
                flags = ?hdr.flags,
                "block received"
            );
            self.reassembly.insert(payload, &hdr)?;
        }
        Ok(())
    }

    /// Peel contiguous segments off the reassembly queue into the
    /// upstream sink; delivery starts only once SYN has been seen.
    fn deliver_ready(&mut self) {
        if self.received_fin {
            return;
        }
        while let Some(seg) = self.reassembly.pop_ready(self.recv_offset, self.received_syn) {
            if seg.flags().contains(Flags::SYN) {
                self.received_syn = true;
            }
            self.recv_offset = self.recv_offset.wrapping_add(seg.len());
            let fin = seg.flags().contains(Flags::FIN);

            let data = seg.into_data();
            if !data.is_empty() {
                let _ = self.upstream.send(UpstreamEvent::Data(data.freeze()));
            }

            if fin {
                debug_assert!(self.reassembly.is_empty());
                self.received_fin = true;
                let _ = self.upstream.send(UpstreamEvent::Eof);
                break;
            }
        }
    }

    /// Tear the circuit down: drop queued payloads, drain the pending
    /// buffer, and sever every remaining downstream.
    pub fn close(&mut self) {
        debug!(circuit = self.circuit_id, "circuit closed");
        self.reassembly.clear();
        self.xmit_pending.clear();
        for link in self.downstreams.drain(..) {
            link.send(DownstreamFrame::Eof);
        }
        if !self.received_fin {
            let _ = self.upstream.send(UpstreamEvent::Eof);
        }
    }
}
