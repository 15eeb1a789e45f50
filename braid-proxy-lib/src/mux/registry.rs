#![forbid(unsafe_code)]

//! Process-wide circuit registry and circuit lifetime plumbing.
//!
//! Incoming downstream connections resolve their first block header to
//! a circuit here; the entry is removed exactly when the circuit
//! closes. The registry also owns the axe timer policy: a circuit left
//! with no downstreams mid-stream gets a short grace period to pick up
//! a replacement connection before it is force-closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use super::circuit::{Circuit, DetachOutcome, DownstreamLink};
use crate::metrics::Metrics;

/// Cloneable handle to a live circuit.
///
/// Connection tasks hold one of these instead of owning the circuit;
/// all circuit state changes go through the lock, synchronously with
/// the I/O event that caused them.
#[derive(Clone)]
pub struct CircuitRef {
    id: u64,
    inner: Arc<Mutex<Circuit>>,
    axe: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for CircuitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitRef").field("id", &self.id).finish()
    }
}

impl CircuitRef {
    pub fn new(circuit: Circuit) -> CircuitRef {
        CircuitRef {
            id: circuit.circuit_id(),
            inner: Arc::new(Mutex::new(circuit)),
            axe: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run `f` against the circuit state under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut Circuit) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Attach a downstream and cancel any pending deferred close.
    pub fn attach_downstream(&self, link: DownstreamLink) {
        self.with(|c| c.attach_downstream(link));
        self.disarm_axe();
    }

    /// Detach a downstream, closing the circuit or arming the axe
    /// timer when it was the last one.
    pub fn detach_downstream(&self, conn_id: u64, registry: &Registry) {
        match self.with(|c| c.detach_downstream(conn_id)) {
            DetachOutcome::Kept => {}
            DetachOutcome::CloseNow => self.close(registry),
            DetachOutcome::ArmAxe => self.arm_axe(registry),
        }
    }

    /// Close the circuit and drop its registry entry.
    pub fn close(&self, registry: &Registry) {
        self.disarm_axe();
        self.with(|c| c.close());
        registry.remove(self.id);
    }

    /// Schedule a deferred close unless a new downstream joins in time.
    /// Arming again replaces (and thereby resets) a pending timer.
    fn arm_axe(&self, registry: &Registry) {
        let this = self.clone();
        let registry = registry.clone();
        let grace = registry.axe_timeout;
        debug!(circuit = self.id, grace_ms = grace.as_millis() as u64, "axe timer armed");
        let handle = tokio::spawn(async move {
            sleep(grace).await;
            if !this.with(|c| c.has_downstreams()) {
                info!(circuit = this.id, "axe timer fired, closing circuit");
                this.close(&registry);
            }
        });
        let old = self
            .axe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(old) = old {
            old.abort();
        }
    }

    fn disarm_axe(&self) {
        let old = self.axe.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(old) = old {
            old.abort();
        }
    }
}

/// Map of live circuits keyed by circuit id.
#[derive(Clone)]
pub struct Registry {
    circuits: Arc<Mutex<HashMap<u64, CircuitRef, ahash::RandomState>>>,
    axe_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Registry {
    pub fn new(axe_timeout: Duration, metrics: Arc<Metrics>) -> Registry {
        Registry {
            circuits: Arc::new(Mutex::new(HashMap::default())),
            axe_timeout,
            metrics,
        }
    }

    pub fn get(&self, id: u64) -> Option<CircuitRef> {
        self.circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Register a freshly created circuit. If another connection won
    /// the race for the same id, the existing circuit is returned and
    /// the new one is discarded.
    pub fn try_insert(&self, circuit: CircuitRef) -> Result<CircuitRef, CircuitRef> {
        let mut map = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        match map.entry(circuit.id()) {
            std::collections::hash_map::Entry::Occupied(e) => Err(e.get().clone()),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(circuit.clone());
                self.metrics.circuits.increment();
                Ok(circuit)
            }
        }
    }

    fn remove(&self, id: u64) {
        let removed = self
            .circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            self.metrics.circuits.decrement();
        }
    }

    pub fn len(&self) -> usize {
        self.circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::circuit::{BlockPolicy, UpstreamEvent};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct FixedBlocks(u16);

    impl BlockPolicy for FixedBlocks {
        fn next_block_size(&mut self) -> u16 {
            self.0
        }

        fn chaff(&mut self, len: usize) -> Bytes {
            vec![0; len].into()
        }
    }

    fn registry() -> Registry {
        Registry::new(Duration::from_millis(100), Arc::new(Metrics::default()))
    }

    fn circuit(id: u64) -> (CircuitRef, mpsc::UnboundedReceiver<UpstreamEvent>) {
        let (utx, urx) = mpsc::unbounded_channel();
        (CircuitRef::new(Circuit::new(id, utx, Box::new(FixedBlocks(32)))), urx)
    }

    #[tokio::test]
    async fn registry_resolves_and_races() {
        let reg = registry();
        let (first, _u1) = circuit(7);
        let first = reg.try_insert(first).expect("fresh id");
        assert_eq!(reg.get(7).map(|c| c.id()), Some(7));

        let (loser, _u2) = circuit(7);
        let resolved = match reg.try_insert(loser) {
            Ok(_) => panic!("second insert must lose"),
            Err(existing) => existing,
        };
        assert!(Arc::ptr_eq(&resolved.inner, &first.inner));

        first.close(&reg);
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn axe_timer_closes_an_abandoned_circuit() {
        let reg = registry();
        let (ckt, _urx) = circuit(9);
        let ckt = reg.try_insert(ckt).expect("fresh id");

        let (tx, _rx) = mpsc::unbounded_channel();
        ckt.attach_downstream(DownstreamLink::new(1, tx));
        ckt.detach_downstream(1, &reg);
        assert_eq!(reg.len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_downstream_disarms_the_axe() {
        let reg = registry();
        let (ckt, _urx) = circuit(9);
        let ckt = reg.try_insert(ckt).expect("fresh id");

        let (tx, _rx) = mpsc::unbounded_channel();
        ckt.attach_downstream(DownstreamLink::new(1, tx));
        ckt.detach_downstream(1, &reg);

        // A replacement connection arrives inside the grace period.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (tx2, _rx2) = mpsc::unbounded_channel();
        ckt.attach_downstream(DownstreamLink::new(2, tx2));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn finished_circuit_closes_on_last_detach() {
        let reg = registry();
        let (ckt, mut urx) = circuit(0x42);
        let ckt = reg.try_insert(ckt).expect("fresh id");

        let (tx, _rx) = mpsc::unbounded_channel();
        ckt.attach_downstream(DownstreamLink::new(1, tx));
        ckt.with(|c| c.on_upstream_eof());

        let mut inbound = bytes::BytesMut::new();
        crate::mux::wire::BlockHeader {
            circuit_id: 0x42,
            offset: 0,
            length: 32,
            flags: crate::mux::wire::Flags::SYN | crate::mux::wire::Flags::FIN,
        }
        .encode(&mut inbound);
        inbound.extend_from_slice(&[0x55; 32]);
        ckt.with(|c| c.on_downstream_bytes(&mut inbound)).expect("valid block");

        ckt.detach_downstream(1, &reg);
        assert!(reg.is_empty());
        assert!(matches!(urx.try_recv(), Ok(UpstreamEvent::Data(_))));
        assert!(matches!(urx.try_recv(), Ok(UpstreamEvent::Eof)));
    }
}
