use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, info};

use super::{Instant, ReliableConfig};
use crate::protocol::{Epoch, Sequence};

/// Replaced peer instances remembered so their late frames are not mistaken
/// for yet another restart.
const RETIRED_INSTANCES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<P = Bytes> {
    pub sequence: Sequence,
    pub payload: P,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ReceiveOutcome<P = Bytes> {
    /// In-order deliveries released by this arrival.
    pub delivered: Vec<Delivery<P>>,
    pub buffered: bool,
    pub duplicate: bool,
    /// The frame belongs to a sender epoch the peer has since replaced. It is
    /// neither delivered nor acknowledged.
    pub stale: bool,
    /// The peer is a new instance; local state was discarded first and the
    /// paired sender must reset.
    pub reset: bool,
    /// The peer reset its sender without restarting; only the receive side
    /// was discarded.
    pub resynced: bool,
}

impl<P> Default for ReceiveOutcome<P> {
    fn default() -> Self {
        Self {
            delivered: Vec::new(),
            buffered: false,
            duplicate: false,
            stale: false,
            reset: false,
            resynced: false,
        }
    }
}

#[derive(Debug)]
struct Buffered<P> {
    payload: P,
    received_at: Instant,
}

/// Inbound half of one reliable channel.
///
/// Delivery is strictly contiguous, so the set of delivered sequences is
/// exactly `1..next_expected` of the current peer epoch and needs no
/// separate storage.
pub struct ReliableReceiver<P = Bytes> {
    config: ReliableConfig,
    peer: Option<Epoch>,
    retired: VecDeque<u64>,
    next_expected: Sequence,
    buffer: BTreeMap<Sequence, Buffered<P>>,
}

impl<P> ReliableReceiver<P> {
    pub fn new(config: ReliableConfig) -> Self {
        Self {
            config,
            peer: None,
            retired: VecDeque::new(),
            next_expected: 1,
            buffer: BTreeMap::new(),
        }
    }

    pub fn receive(
        &mut self,
        epoch: Epoch,
        sequence: Sequence,
        payload: P,
        now: Instant,
    ) -> ReceiveOutcome<P> {
        let mut outcome = ReceiveOutcome::default();
        if sequence == 0 {
            outcome.duplicate = true;
            return outcome;
        }

        match self.peer {
            None => self.peer = Some(epoch),
            Some(current) if current == epoch => {}
            Some(current) if current.instance == epoch.instance => {
                if epoch.generation < current.generation {
                    outcome.stale = true;
                    return outcome;
                }
                debug!(
                    target = "relay.receiver",
                    generation = epoch.generation,
                    next_expected = self.next_expected,
                    "peer reset its sender; resynchronising"
                );
                self.clear(epoch);
                outcome.resynced = true;
            }
            Some(current) => {
                if self.retired.contains(&epoch.instance) {
                    outcome.stale = true;
                    return outcome;
                }
                info!(
                    target = "relay.receiver",
                    next_expected = self.next_expected,
                    buffered = self.buffer.len(),
                    "peer restarted; resetting receiver"
                );
                if self.retired.len() == RETIRED_INSTANCES {
                    self.retired.pop_front();
                }
                self.retired.push_back(current.instance);
                self.clear(epoch);
                outcome.reset = true;
            }
        }

        if sequence < self.next_expected {
            outcome.duplicate = true;
            return outcome;
        }

        if sequence > self.next_expected {
            if self.buffer.contains_key(&sequence) {
                outcome.duplicate = true;
            } else {
                self.buffer.insert(
                    sequence,
                    Buffered {
                        payload,
                        received_at: now,
                    },
                );
                outcome.buffered = true;
            }
            return outcome;
        }

        self.deliver(sequence, payload, &mut outcome);
        while let Some(entry) = self.buffer.remove(&self.next_expected) {
            self.deliver(self.next_expected, entry.payload, &mut outcome);
        }
        outcome
    }

    /// Evicts buffered arrivals older than the TTL. `next_expected` is left
    /// alone, so a missing predecessor keeps delivery stalled until it is
    /// retransmitted or the peer resets.
    pub fn cleanup_stale_buffer(&mut self, now: Instant) -> usize {
        let ttl = self.config.buffer_ttl;
        let before = self.buffer.len();
        self.buffer
            .retain(|_, entry| now.saturating_duration_since(entry.received_at) < ttl);
        let evicted = before - self.buffer.len();
        if evicted > 0 {
            debug!(
                target = "relay.receiver",
                evicted,
                next_expected = self.next_expected,
                "evicted stale out-of-order arrivals"
            );
        }
        evicted
    }

    /// Epoch of the peer sender currently being followed.
    pub fn peer(&self) -> Option<Epoch> {
        self.peer
    }

    pub fn next_expected(&self) -> Sequence {
        self.next_expected
    }

    pub fn has_delivered(&self, sequence: Sequence) -> bool {
        sequence > 0 && sequence < self.next_expected
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_buffered(&self, sequence: Sequence) -> bool {
        self.buffer.contains_key(&sequence)
    }

    fn deliver(&mut self, sequence: Sequence, payload: P, outcome: &mut ReceiveOutcome<P>) {
        self.next_expected = sequence + 1;
        outcome.delivered.push(Delivery { sequence, payload });
    }

    fn clear(&mut self, epoch: Epoch) {
        self.buffer.clear();
        self.next_expected = 1;
        self.peer = Some(epoch);
    }
}
