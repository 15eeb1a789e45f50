#![forbid(unsafe_code)]

//! Server role: accept downstream connections, resolve each one to a
//! circuit by its first block header, and bridge circuits to the
//! configured upstream target.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use crate::mux::circuit::{Circuit, DownstreamLink, UniformBlocks};
use crate::mux::registry::{CircuitRef, Registry};
use crate::mux::wire::{BlockHeader, MIN_BLOCK};
use crate::proxy::{next_conn_id, pump};

pub async fn run(
    cfg: Arc<Config>,
    registry: Registry,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(cfg.listen).await?;
    info!(addr = %cfg.listen, "downstream listener bound");

    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept downstream connection");
                    continue;
                }
            },
            res = shutdown.changed() => {
                if res.is_ok() {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                } else {
                    // sender dropped; treat as no shutdown signal
                    continue;
                }
            }
        };

        metrics.connections.increment();
        debug!(%peer, "downstream connection accepted");

        let cfg = cfg.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            handle_downstream(stream, peer, cfg, registry, metrics.clone()).await;
            metrics.connections.decrement();
        });
    }
    Ok(())
}

/// Buffer until the first block header names a circuit, then attach and
/// run the shared pumps.
async fn handle_downstream(
    stream: TcpStream,
    peer: SocketAddr,
    cfg: Arc<Config>,
    registry: Registry,
    metrics: Arc<Metrics>,
) {
    let (mut rd, wr) = stream.into_split();
    let conn_id = next_conn_id();
    let mut inbound = BytesMut::with_capacity(pump::READ_CHUNK);

    let ckt = loop {
        match rd.read_buf(&mut inbound).await {
            Ok(0) => {
                debug!(%peer, "downstream closed before the first block");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%peer, error = %e, "downstream read failed before the first block");
                metrics.connections.increment_errors();
                return;
            }
        }
        if inbound.len() < MIN_BLOCK {
            continue;
        }
        let Some(hdr) = BlockHeader::peek(&inbound) else {
            continue;
        };
        match find_or_create(&cfg, &registry, hdr.circuit_id).await {
            Ok(ckt) => break ckt,
            Err(e) => {
                warn!(%peer, circuit = hdr.circuit_id, error = %e, "failed to resolve circuit");
                metrics.connections.increment_errors();
                return;
            }
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    ckt.attach_downstream(DownstreamLink::new(conn_id, tx));
    tokio::spawn(pump::downstream_writer(
        wr,
        rx,
        ckt.clone(),
        conn_id,
        registry.clone(),
        metrics.clone(),
    ));
    pump::downstream_reader(rd, inbound, ckt, conn_id, registry, metrics).await;
}

/// Look the circuit up, or create it and open its upstream connection.
///
/// Two connections can race to create the same circuit; the loser's
/// upstream connection is dropped and the winner's circuit is used.
async fn find_or_create(cfg: &Config, registry: &Registry, circuit_id: u64) -> Result<CircuitRef> {
    if let Some(ckt) = registry.get(circuit_id) {
        return Ok(ckt);
    }

    let target = cfg.upstream.as_deref().ok_or(ProxyError::NoUpstream)?;
    let upstream = TcpStream::connect(target).await?;
    let (rd, wr) = upstream.into_split();

    let (utx, urx) = mpsc::unbounded_channel();
    let circuit = CircuitRef::new(Circuit::new(circuit_id, utx, Box::new(UniformBlocks)));

    match registry.try_insert(circuit) {
        Ok(ckt) => {
            info!(circuit = circuit_id, upstream = target, "circuit created");
            tokio::spawn(pump::upstream_writer(wr, urx));
            tokio::spawn(pump::upstream_reader(rd, ckt.clone()));
            Ok(ckt)
        }
        Err(existing) => {
            debug!(circuit = circuit_id, "lost creation race, using existing circuit");
            Ok(existing)
        }
    }
}
