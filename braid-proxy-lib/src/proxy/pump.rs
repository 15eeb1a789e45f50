#![forbid(unsafe_code)]

//! Reader and writer tasks that connect sockets to circuit state.
//!
//! Every state change happens synchronously inside the circuit lock;
//! these tasks only move bytes between the sockets and the channels
//! the circuit hands out.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::mux::circuit::{DownstreamFrame, UpstreamEvent};
use crate::mux::registry::{CircuitRef, Registry};

pub(crate) const READ_CHUNK: usize = 64 * 1024;

/// Drain framed blocks to a downstream socket; half-close on EOF.
///
/// When the writer is done (EOF frame, write failure, or the circuit
/// dropping its link) the connection can no longer carry blocks in
/// either logical direction that matter to the circuit, so it detaches
/// here. Detaching twice is harmless.
pub(crate) async fn downstream_writer(
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<DownstreamFrame>,
    ckt: CircuitRef,
    conn_id: u64,
    registry: Registry,
    metrics: Arc<Metrics>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            DownstreamFrame::Block(bytes) => {
                if let Err(e) = wr.write_all(&bytes).await {
                    warn!(conn = conn_id, error = %e, "downstream write failed");
                    break;
                }
                metrics.record_block();
            }
            DownstreamFrame::Eof => break,
        }
    }
    let _ = wr.shutdown().await;
    ckt.detach_downstream(conn_id, &registry);
}

/// Feed a downstream socket's bytes through the circuit receive path.
///
/// `inbound` may already hold whole blocks (the header that resolved
/// the circuit arrives together with data), so each pass processes the
/// buffer before waiting for more bytes. A connection EOF does not end
/// the circuit: the peer may still be receiving, so the link is only
/// dropped once our own FIN is out; the writer side handles the rest.
pub(crate) async fn downstream_reader(
    mut rd: OwnedReadHalf,
    mut inbound: BytesMut,
    ckt: CircuitRef,
    conn_id: u64,
    registry: Registry,
    metrics: Arc<Metrics>,
) {
    loop {
        if let Err(e) = ckt.with(|c| c.on_downstream_bytes(&mut inbound)) {
            warn!(conn = conn_id, error = %e, "protocol violation, dropping downstream");
            metrics.record_protocol_error();
            ckt.detach_downstream(conn_id, &registry);
            return;
        }
        match rd.read_buf(&mut inbound).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(conn = conn_id, error = %e, "downstream read failed");
                ckt.detach_downstream(conn_id, &registry);
                return;
            }
        }
    }

    debug!(conn = conn_id, "downstream connection closed by peer");
    if let Err(e) = ckt.with(|c| c.on_downstream_eof(&mut inbound)) {
        warn!(conn = conn_id, error = %e, "protocol violation in trailing bytes");
        metrics.record_protocol_error();
        ckt.detach_downstream(conn_id, &registry);
        return;
    }
    if ckt.with(|c| c.sent_fin()) {
        ckt.detach_downstream(conn_id, &registry);
    }
}

/// Read the upstream endpoint into the circuit transmit path.
pub(crate) async fn upstream_reader(mut rd: OwnedReadHalf, ckt: CircuitRef) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.clear();
        match rd.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => ckt.with(|c| c.on_upstream_bytes(&buf)),
            Err(e) => {
                debug!(error = %e, "upstream read failed, treating as eof");
                break;
            }
        }
    }
    ckt.with(|c| c.on_upstream_eof());
}

/// Drain delivered circuit bytes into the upstream endpoint.
pub(crate) async fn upstream_writer(
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<UpstreamEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            UpstreamEvent::Data(bytes) => {
                if let Err(e) = wr.write_all(&bytes).await {
                    warn!(error = %e, "upstream write failed");
                    break;
                }
            }
            UpstreamEvent::Eof => break,
        }
    }
    let _ = wr.shutdown().await;
}
