#![forbid(unsafe_code)]

//! Client role: accept upstream streams on the front end, give each one
//! a circuit with a fresh random id, and dial every configured
//! downstream address as a member connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{Config, Frontend};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::mux::circuit::{Circuit, DownstreamLink, UniformBlocks};
use crate::mux::registry::{CircuitRef, Registry};
use crate::proxy::{next_conn_id, pump};
use crate::socks;

pub async fn run(
    cfg: Arc<Config>,
    registry: Registry,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(cfg.listen).await?;
    info!(addr = %cfg.listen, frontend = ?cfg.frontend, "front-end listener bound");

    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept front-end connection");
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
        debug!(%peer, "front-end connection accepted");

        let cfg = cfg.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            handle_upstream(stream, peer, cfg, registry, metrics.clone()).await;
            metrics.connections.decrement();
        });
    }
    Ok(())
}

async fn handle_upstream(
    mut stream: TcpStream,
    peer: SocketAddr,
    cfg: Arc<Config>,
    registry: Registry,
    metrics: Arc<Metrics>,
) {
    if cfg.frontend == Frontend::Socks5 {
        match socks::serve_handshake(&mut stream).await {
            Ok(target) => debug!(%peer, %target, "socks connect accepted"),
            Err(e) => {
                warn!(%peer, error = %e, "socks handshake failed");
                metrics.connections.increment_errors();
                return;
            }
        }
    }

    // The connecting party chooses circuit ids; zero means unassigned.
    let circuit_id = loop {
        let id: u64 = rand::rng().random();
        if id != 0 {
            break id;
        }
    };

    let (utx, urx) = mpsc::unbounded_channel();
    let ckt = match registry.try_insert(CircuitRef::new(Circuit::new(
        circuit_id,
        utx,
        Box::new(UniformBlocks),
    ))) {
        Ok(ckt) => ckt,
        Err(_) => {
            warn!(circuit = circuit_id, "circuit id collision, dropping connection");
            metrics.connections.increment_errors();
            return;
        }
    };
    info!(%peer, circuit = circuit_id, "circuit opened");

    let mut attached = 0;
    for d in &cfg.downstreams {
        match TcpStream::connect(&d.address).await {
            Ok(down) => {
                let conn_id = next_conn_id();
                let (rd, wr) = down.into_split();
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
                tokio::spawn(pump::downstream_reader(
                    rd,
                    BytesMut::with_capacity(pump::READ_CHUNK),
                    ckt.clone(),
                    conn_id,
                    registry.clone(),
                    metrics.clone(),
                ));
                attached += 1;
            }
            Err(e) => {
                warn!(address = %d.address, error = %e, "downstream dial failed");
                metrics.connections.increment_errors();
            }
        }
    }

    if attached == 0 {
        warn!(%peer, circuit = circuit_id, "no downstream connections could be established");
        ckt.close(&registry);
        return;
    }
    debug!(circuit = circuit_id, members = attached, "downstream connections established");

    let (rd, wr) = stream.into_split();
    tokio::spawn(pump::upstream_writer(wr, urx));
    pump::upstream_reader(rd, ckt).await;
}
