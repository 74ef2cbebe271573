use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, watch};

use crate::{next_transport_id, BusError, BusResult, Transport, TransportId};

const LINK_CAPACITY: usize = 1024;

/// Probabilistic impairments applied to every frame sent over a [`LocalLink`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultPlan {
    pub drop_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
    pub seed: u64,
}

impl FaultPlan {
    pub fn reliable() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0,
        }
    }

    pub fn lossy(seed: u64) -> Self {
        Self {
            drop_rate: 0.2,
            duplicate_rate: 0.1,
            reorder_rate: 0.2,
            seed,
        }
    }
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self::reliable()
    }
}

struct FaultState {
    plan: FaultPlan,
    rng: StdRng,
    drop_next: usize,
    held: Option<Bytes>,
}

impl FaultState {
    fn new(plan: FaultPlan) -> Self {
        Self {
            plan,
            rng: StdRng::seed_from_u64(plan.seed),
            drop_next: 0,
            held: None,
        }
    }

    /// Frames that should actually reach the peer for one `send`.
    fn shape(&mut self, frame: Bytes) -> Vec<Bytes> {
        if self.drop_next > 0 {
            self.drop_next -= 1;
            return Vec::new();
        }
        if self.plan.drop_rate > 0.0 && self.rng.gen_bool(self.plan.drop_rate) {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(3);
        if self.plan.reorder_rate > 0.0
            && self.held.is_none()
            && self.rng.gen_bool(self.plan.reorder_rate)
        {
            self.held = Some(frame);
            return out;
        }
        out.push(frame.clone());
        if self.plan.duplicate_rate > 0.0 && self.rng.gen_bool(self.plan.duplicate_rate) {
            out.push(frame);
        }
        if let Some(held) = self.held.take() {
            out.push(held);
        }
        out
    }
}

struct Shared {
    connected: watch::Sender<bool>,
}

/// One end of an in-process duplex link with optional fault injection.
pub struct LocalLink {
    id: TransportId,
    inbound: broadcast::Sender<Bytes>,
    outbound: broadcast::Sender<Bytes>,
    faults: Mutex<FaultState>,
    shared: Arc<Shared>,
}

impl LocalLink {
    pub fn pair() -> (LocalLink, LocalLink) {
        Self::pair_with_faults(FaultPlan::reliable(), FaultPlan::reliable())
    }

    /// `a_to_b` impairs frames sent by the first end, `b_to_a` by the second.
    pub fn pair_with_faults(a_to_b: FaultPlan, b_to_a: FaultPlan) -> (LocalLink, LocalLink) {
        let (a_inbound, _) = broadcast::channel(LINK_CAPACITY);
        let (b_inbound, _) = broadcast::channel(LINK_CAPACITY);
        let (connected, _) = watch::channel(true);
        let shared = Arc::new(Shared { connected });
        let a = LocalLink {
            id: next_transport_id(),
            inbound: a_inbound.clone(),
            outbound: b_inbound.clone(),
            faults: Mutex::new(FaultState::new(a_to_b)),
            shared: Arc::clone(&shared),
        };
        let b = LocalLink {
            id: next_transport_id(),
            inbound: b_inbound,
            outbound: a_inbound,
            faults: Mutex::new(FaultState::new(b_to_a)),
            shared,
        };
        (a, b)
    }

    /// Flips the connection state of both ends.
    pub fn set_connected(&self, connected: bool) {
        self.shared.connected.send_replace(connected);
        if !connected {
            self.faults.lock().held = None;
        }
    }

    /// Silently loses the next `count` frames sent from this end.
    pub fn drop_next(&self, count: usize) {
        self.faults.lock().drop_next += count;
    }

    pub fn set_fault_plan(&self, plan: FaultPlan) {
        *self.faults.lock() = FaultState::new(plan);
    }
}

impl Transport for LocalLink {
    fn id(&self) -> TransportId {
        self.id
    }

    fn send(&self, frame: Bytes) -> BusResult<()> {
        if !*self.shared.connected.borrow() {
            return Err(BusError::Disconnected);
        }
        let frames = self.faults.lock().shape(frame);
        for frame in frames {
            // No subscriber on the far end is indistinguishable from loss.
            let _ = self.outbound.send(frame);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inbound.subscribe()
    }

    fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }
}
