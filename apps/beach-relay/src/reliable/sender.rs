use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{Instant, ReliableConfig};
use crate::protocol::{Epoch, Sequence};

/// `base * 2^(attempt - 1)`, saturating at `cap`. Attempt 0 is treated as 1.
pub fn calculate_timeout(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage<P = Bytes> {
    pub sequence: Sequence,
    pub payload: P,
    /// `None` until the first transmission; messages sent while paused wait here.
    pub first_sent_at: Option<Instant>,
    pub last_sent_at: Option<Instant>,
    /// Number of transmissions so far, including the first.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit<P = Bytes> {
    pub epoch: Epoch,
    pub sequence: Sequence,
    pub payload: P,
    pub attempt: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TickOutcome<P = Bytes> {
    pub retransmits: Vec<Transmit<P>>,
    /// Sequences dropped after exhausting retransmits. Each is reported once.
    pub failed: Vec<Sequence>,
}

impl<P> Default for TickOutcome<P> {
    fn default() -> Self {
        Self {
            retransmits: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Outbound half of one reliable channel.
pub struct ReliableSender<P = Bytes> {
    config: ReliableConfig,
    epoch: Epoch,
    next_sequence: Sequence,
    pending: BTreeMap<Sequence, PendingMessage<P>>,
    paused_at: Option<Instant>,
}

impl<P: Clone> ReliableSender<P> {
    pub fn new(config: ReliableConfig) -> Self {
        Self {
            config,
            epoch: Epoch::fresh(),
            next_sequence: 1,
            pending: BTreeMap::new(),
            paused_at: None,
        }
    }

    /// Allocates the next sequence and returns the frame to put on the wire,
    /// or `None` when paused.
    pub fn send(&mut self, payload: P, now: Instant) -> (Sequence, Option<Transmit<P>>) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let mut entry = PendingMessage {
            sequence,
            payload,
            first_sent_at: None,
            last_sent_at: None,
            attempts: 0,
        };
        let transmit = if self.paused_at.is_none() {
            Some(mark_sent(self.epoch, &mut entry, now))
        } else {
            debug!(target = "relay.sender", sequence, "queued while paused");
            None
        };
        self.pending.insert(sequence, entry);
        (sequence, transmit)
    }

    /// Exact-match acknowledgement. Unknown and repeated acks are ignored.
    pub fn on_ack(&mut self, sequence: Sequence) -> bool {
        self.pending.remove(&sequence).is_some()
    }

    pub fn tick(&mut self, now: Instant) -> TickOutcome<P> {
        let mut outcome = TickOutcome::default();
        if self.paused_at.is_some() {
            return outcome;
        }

        let config = self.config;
        let epoch = self.epoch;
        self.pending.retain(|sequence, entry| {
            let Some(last_sent_at) = entry.last_sent_at else {
                return true;
            };
            let due = now.saturating_duration_since(last_sent_at)
                >= config.timeout_for(entry.attempts);
            if !due {
                return true;
            }
            if entry.attempts > config.max_retransmit_attempts {
                warn!(
                    target = "relay.sender",
                    sequence = *sequence,
                    attempts = entry.attempts,
                    "message permanently failed"
                );
                outcome.failed.push(*sequence);
                return false;
            }
            outcome.retransmits.push(mark_sent(epoch, entry, now));
            true
        });
        outcome
    }

    pub fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    /// Restarts transmission. Time spent paused does not count towards any
    /// retransmit timeout; messages queued while paused go out now.
    pub fn resume(&mut self, now: Instant) -> Vec<Transmit<P>> {
        let Some(paused_at) = self.paused_at.take() else {
            return Vec::new();
        };
        let paused_for = now.saturating_duration_since(paused_at);
        let mut flushed = Vec::new();
        for entry in self.pending.values_mut() {
            match entry.last_sent_at {
                Some(last_sent_at) => entry.last_sent_at = Some(last_sent_at + paused_for),
                None => flushed.push(mark_sent(self.epoch, entry, now)),
            }
        }
        flushed
    }

    /// Forgets every pending message and restarts sequencing at 1 under the
    /// next generation, so the peer can tell new frames from old ones.
    pub fn reset(&mut self) {
        debug!(
            target = "relay.sender",
            discarded = self.pending.len(),
            generation = self.epoch.generation,
            "sender reset"
        );
        self.pending.clear();
        self.next_sequence = 1;
        self.epoch = self.epoch.next_generation();
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn next_sequence(&self) -> Sequence {
        self.next_sequence
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, sequence: Sequence) -> Option<&PendingMessage<P>> {
        self.pending.get(&sequence)
    }
}

fn mark_sent<P: Clone>(epoch: Epoch, entry: &mut PendingMessage<P>, now: Instant) -> Transmit<P> {
    entry.first_sent_at.get_or_insert(now);
    entry.last_sent_at = Some(now);
    entry.attempts += 1;
    Transmit {
        epoch,
        sequence: entry.sequence,
        payload: entry.payload.clone(),
        attempt: entry.attempts,
    }
}
