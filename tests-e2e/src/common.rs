//! Helpers for end-to-end tests: an echo backend plus a client/server
//! proxy pair running in-process over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use braid_proxy_lib::config::{CircuitConfig, Config, Downstream, Frontend, Mode};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Reserve a loopback address by binding an ephemeral port and letting
/// it go again.
pub async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

/// A TCP backend that echoes every byte back and half-closes after its
/// peer does.
pub async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind echo backend");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _peer)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    addr
}

/// A running client/server proxy pair; dropping the pair signals
/// shutdown to both accept loops.
pub struct ProxyPair {
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Drop for ProxyPair {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Start a server role forwarding to `backend` and a client role with
/// `n_downstreams` connections per circuit, all on loopback.
pub async fn spawn_pair(backend: SocketAddr, n_downstreams: usize, frontend: Frontend) -> ProxyPair {
    let server_addr = free_addr().await;
    let client_addr = free_addr().await;
    let (shutdown, rx) = watch::channel(false);

    let server_cfg = Arc::new(Config {
        mode: Mode::Server,
        listen: server_addr,
        downstreams: Vec::new(),
        upstream: Some(backend.to_string()),
        frontend: Frontend::Plain,
        circuit: CircuitConfig::default(),
        metrics: None,
    });
    tokio::spawn(braid_proxy_lib::run(server_cfg, rx.clone()));

    let client_cfg = Arc::new(Config {
        mode: Mode::Client,
        listen: client_addr,
        downstreams: (0..n_downstreams)
            .map(|_| Downstream { address: server_addr.to_string() })
            .collect(),
        upstream: None,
        frontend,
        circuit: CircuitConfig::default(),
        metrics: None,
    });
    tokio::spawn(braid_proxy_lib::run(client_cfg, rx));

    wait_for_listen(server_addr).await;
    wait_for_listen(client_addr).await;

    ProxyPair { client_addr, server_addr, shutdown }
}

/// Poll until something is accepting on `addr`.
pub async fn wait_for_listen(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("service at {addr} did not come up");
}
