use bytes::Bytes;

use super::{
    Instant, ReceiveOutcome, ReliableConfig, ReliableReceiver, ReliableSender, Transmit,
};
use crate::metrics;
use crate::protocol::{Epoch, Sequence};

/// Frames the channel wants put on the wire, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing<P = Bytes> {
    Data(Transmit<P>),
    /// Echoes the epoch of the frame being acknowledged.
    Ack { epoch: Epoch, sequence: Sequence },
}

/// Upward notifications for the channel's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent<P = Bytes> {
    Delivered { sequence: Sequence, payload: P },
    Reset,
    PermanentlyFailed(Sequence),
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelOutput<P = Bytes> {
    pub outgoing: Vec<Outgoing<P>>,
    pub events: Vec<ChannelEvent<P>>,
}

impl<P> Default for ChannelOutput<P> {
    fn default() -> Self {
        Self {
            outgoing: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl<P> ChannelOutput<P> {
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.events.is_empty()
    }
}

/// One sender and one receiver bound to the same stream.
///
/// A peer restart detected by the receiver resets the sender exactly once per
/// detection. A peer that merely reset its own sender only resynchronises the
/// receiver, so two ends never keep resetting each other.
pub struct ReliableChannel<P = Bytes> {
    sender: ReliableSender<P>,
    receiver: ReliableReceiver<P>,
    label: &'static str,
}

impl<P: Clone> ReliableChannel<P> {
    /// `label` tags the channel's metrics, usually the stream role.
    pub fn new(config: ReliableConfig, label: &'static str) -> Self {
        Self {
            sender: ReliableSender::new(config),
            receiver: ReliableReceiver::new(config),
            label,
        }
    }

    pub fn send(&mut self, payload: P, now: Instant) -> (Sequence, ChannelOutput<P>) {
        let (sequence, transmit) = self.sender.send(payload, now);
        let mut output = ChannelOutput::default();
        output.outgoing.extend(transmit.map(Outgoing::Data));
        (sequence, output)
    }

    /// Acks for an earlier epoch of this sender refer to messages that no
    /// longer exist and are ignored.
    pub fn on_ack(&mut self, epoch: Epoch, sequence: Sequence) -> bool {
        epoch == self.sender.epoch() && self.sender.on_ack(sequence)
    }

    /// Every current-epoch arrival is acknowledged, duplicates included,
    /// since the peer retransmits until an ack gets through.
    pub fn receive(
        &mut self,
        epoch: Epoch,
        sequence: Sequence,
        payload: P,
        now: Instant,
    ) -> ChannelOutput<P> {
        let ReceiveOutcome {
            delivered,
            buffered: _,
            duplicate,
            stale,
            reset,
            resynced: _,
        } = self.receiver.receive(epoch, sequence, payload, now);

        let mut output = ChannelOutput::default();
        if stale {
            metrics::STALE_FRAMES.with_label_values(&[self.label]).inc();
            return output;
        }
        output.outgoing.push(Outgoing::Ack { epoch, sequence });
        if duplicate {
            metrics::DUPLICATES_DROPPED.with_label_values(&[self.label]).inc();
        }
        if reset {
            self.sender.reset();
            metrics::SESSION_RESETS.with_label_values(&[self.label]).inc();
            output.events.push(ChannelEvent::Reset);
        }
        output
            .events
            .extend(delivered.into_iter().map(|delivery| ChannelEvent::Delivered {
                sequence: delivery.sequence,
                payload: delivery.payload,
            }));
        output
    }

    pub fn tick(&mut self, now: Instant) -> ChannelOutput<P> {
        let outcome = self.sender.tick(now);
        if !outcome.retransmits.is_empty() {
            metrics::RETRANSMITS
                .with_label_values(&[self.label])
                .inc_by(outcome.retransmits.len() as u64);
        }
        if !outcome.failed.is_empty() {
            metrics::PERMANENT_FAILURES
                .with_label_values(&[self.label])
                .inc_by(outcome.failed.len() as u64);
        }
        ChannelOutput {
            outgoing: outcome.retransmits.into_iter().map(Outgoing::Data).collect(),
            events: outcome
                .failed
                .into_iter()
                .map(ChannelEvent::PermanentlyFailed)
                .collect(),
        }
    }

    pub fn cleanup(&mut self, now: Instant) -> usize {
        let evicted = self.receiver.cleanup_stale_buffer(now);
        if evicted > 0 {
            metrics::BUFFER_EVICTIONS
                .with_label_values(&[self.label])
                .inc_by(evicted as u64);
        }
        evicted
    }

    pub fn pause(&mut self, now: Instant) {
        self.sender.pause(now);
    }

    pub fn resume(&mut self, now: Instant) -> ChannelOutput<P> {
        ChannelOutput {
            outgoing: self
                .sender
                .resume(now)
                .into_iter()
                .map(Outgoing::Data)
                .collect(),
            events: Vec::new(),
        }
    }

    pub fn sender(&self) -> &ReliableSender<P> {
        &self.sender
    }

    pub fn receiver(&self) -> &ReliableReceiver<P> {
        &self.receiver
    }
}
