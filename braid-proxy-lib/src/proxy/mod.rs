#![forbid(unsafe_code)]

//! Role dispatch and the glue shared by both roles.

pub mod client;
pub(crate) mod pump;
pub mod server;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::{Config, Mode};
use crate::error::Result;
use crate::metrics::{self, Metrics};
use crate::mux::registry::Registry;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a downstream connection.
pub(crate) fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Run the configured role until the shutdown signal flips.
pub async fn run(cfg: Arc<Config>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let metrics = Arc::new(Metrics::default());
    let registry = Registry::new(
        Duration::from_millis(cfg.circuit.axe_timeout_ms),
        metrics.clone(),
    );

    if let Some(addr) = cfg.metrics {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, metrics).await {
                tracing::warn!(error = %e, "metrics endpoint exited");
            }
        });
    }

    match cfg.mode {
        Mode::Client => client::run(cfg, registry, metrics, shutdown).await,
        Mode::Server => server::run(cfg, registry, metrics, shutdown).await,
    }
}
