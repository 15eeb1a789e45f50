#![forbid(unsafe_code)]

//! Process counters and a plain-text Prometheus endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

#[derive(Debug, Default)]
pub struct ConnectionCount {
    current: AtomicUsize,
    total: AtomicUsize,
    errors: AtomicUsize,
}

impl ConnectionCount {
    pub fn increment(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .ok();
    }

    pub fn increment_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Counters for the multiplexing layer.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Downstream and front-end connections handled.
    pub connections: ConnectionCount,
    /// Live and lifetime circuits.
    pub circuits: ConnectionCount,
    blocks_forwarded: AtomicU64,
    protocol_errors: AtomicU64,
}

impl Metrics {
    pub fn record_block(&self) {
        self.blocks_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks_forwarded(&self) -> u64 {
        self.blocks_forwarded.load(Ordering::Relaxed)
    }

    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Render counters in Prometheus exposition text format.
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP braid_connections_active Active connections\n\
             # TYPE braid_connections_active gauge\n\
             braid_connections_active {}\n\
             # HELP braid_connections_total Total connections accepted\n\
             # TYPE braid_connections_total counter\n\
             braid_connections_total {}\n\
             # HELP braid_connection_errors_total Total connection errors\n\
             # TYPE braid_connection_errors_total counter\n\
             braid_connection_errors_total {}\n\
             # HELP braid_circuits_active Live circuits\n\
             # TYPE braid_circuits_active gauge\n\
             braid_circuits_active {}\n\
             # HELP braid_circuits_total Total circuits created\n\
             # TYPE braid_circuits_total counter\n\
             braid_circuits_total {}\n\
             # HELP braid_blocks_forwarded_total Blocks written to downstream connections\n\
             # TYPE braid_blocks_forwarded_total counter\n\
             braid_blocks_forwarded_total {}\n\
             # HELP braid_protocol_errors_total Connections dropped for protocol violations\n\
             # TYPE braid_protocol_errors_total counter\n\
             braid_protocol_errors_total {}\n",
            self.connections.current(),
            self.connections.total(),
            self.connections.errors(),
            self.circuits.current(),
            self.circuits.total(),
            self.blocks_forwarded(),
            self.protocol_errors(),
        )
    }
}

/// Serve the counters over plain HTTP, one response per connection.
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (mut stream, _peer) = listener.accept().await?;
        let body = metrics.to_prometheus();
        let resp = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain; version=0.0.4\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        tokio::spawn(async move {
            let _ = stream.write_all(resp.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_and_render() {
        let m = Metrics::default();
        m.connections.increment();
        m.connections.increment();
        m.connections.decrement();
        m.circuits.increment();
        m.record_block();
        m.record_block();
        m.record_protocol_error();

        assert_eq!(m.connections.current(), 1);
        assert_eq!(m.connections.total(), 2);
        assert_eq!(m.circuits.current(), 1);

        let text = m.to_prometheus();
        assert!(text.contains("braid_connections_active 1\n"));
        assert!(text.contains("braid_connections_total 2\n"));
        assert!(text.contains("braid_blocks_forwarded_total 2\n"));
        assert!(text.contains("braid_protocol_errors_total 1\n"));
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let m = Metrics::default();
        m.connections.decrement();
        assert_eq!(m.connections.current(), 0);
    }
}
