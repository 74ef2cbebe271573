use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};
use transport_bus::{Transport, TransportId};
use uuid::Uuid;

use super::RouteError;
use crate::protocol::{Envelope, Epoch, Sequence, StreamKey, SubscriptionId};
use crate::queue::DurableRecord;
use crate::reliable::{ChannelEvent, ChannelOutput, Instant, Outgoing, ReliableChannel, ReliableConfig};

/// A durable record as seen by the receiving side of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedRecord {
    pub record_id: Uuid,
    /// Position in the record's scope; `None` for feed records.
    pub sequence: Option<Sequence>,
    pub event_type: String,
    pub payload: Bytes,
}

impl From<&DurableRecord> for ReplayedRecord {
    fn from(record: &DurableRecord) -> Self {
        Self {
            record_id: record.id,
            sequence: record.sequence,
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
        }
    }
}

/// What one slot of a stream's reliable channel carries. Live messages and
/// durable records share the channel, so both are retransmitted and
/// delivered in one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamPayload {
    Message(Bytes),
    Record(ReplayedRecord),
}

/// Events for a stream's consumer. Sequences are channel sequences, shared
/// by messages and records on the same stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delivered { sequence: Sequence, payload: Bytes },
    Replayed(ReplayedRecord),
    /// The peer restarted; anything in flight towards it was discarded.
    Reset,
    PermanentlyFailed(Sequence),
}

/// Stream-addressed frames arriving from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Data {
        epoch: Epoch,
        sequence: Sequence,
        payload: Bytes,
    },
    Record {
        epoch: Epoch,
        sequence: Sequence,
        record: ReplayedRecord,
    },
    Ack {
        epoch: Epoch,
        sequence: Sequence,
    },
}

impl StreamFrame {
    /// Splits a stream-addressed envelope into its subscription and frame.
    /// Anything else is handed back unchanged.
    pub fn from_envelope(envelope: Envelope) -> Result<(SubscriptionId, StreamFrame), Envelope> {
        match envelope {
            Envelope::Data {
                subscription_id,
                epoch,
                sequence,
                payload,
            } => Ok((
                subscription_id,
                StreamFrame::Data {
                    epoch,
                    sequence,
                    payload,
                },
            )),
            Envelope::Record {
                subscription_id,
                epoch,
                sequence,
                record_id,
                record_sequence,
                event_type,
                payload,
            } => Ok((
                subscription_id,
                StreamFrame::Record {
                    epoch,
                    sequence,
                    record: ReplayedRecord {
                        record_id,
                        sequence: record_sequence,
                        event_type,
                        payload,
                    },
                },
            )),
            Envelope::Ack {
                subscription_id,
                epoch,
                sequence,
            } => Ok((subscription_id, StreamFrame::Ack { epoch, sequence })),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Opened by this process; the peer is told about it.
    Local,
    /// Opened by a peer's subscribe.
    Remote,
}

pub(crate) enum StreamCommand {
    Send {
        payload: Bytes,
        reply: oneshot::Sender<Sequence>,
    },
    Inbound(StreamFrame),
    PushRecord(ReplayedRecord),
    Replay(Vec<ReplayedRecord>),
    AckRecord(Uuid),
    Close {
        notify_peer: bool,
    },
}

/// Cheap, cloneable reference to one live stream.
#[derive(Clone)]
pub struct StreamHandle {
    key: StreamKey,
    subscription_id: SubscriptionId,
    transport: TransportId,
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("key", &self.key)
            .field("subscription_id", &self.subscription_id)
            .field("transport", &self.transport)
            .finish()
    }
}

impl StreamHandle {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn subscription_id(&self) -> &SubscriptionId {
        &self.subscription_id
    }

    pub fn transport_id(&self) -> TransportId {
        self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Queues `payload` on this stream and returns its sequence.
    pub async fn send(&self, payload: Bytes) -> Result<Sequence, RouteError> {
        let (reply, sequence) = oneshot::channel();
        self.command(StreamCommand::Send { payload, reply })?;
        sequence
            .await
            .map_err(|_| RouteError::StreamClosed(self.key.clone()))
    }

    /// Forwards a live durable record on the stream's reliable channel. On a
    /// stream still waiting for its replay batch the record is held until
    /// that batch has gone out.
    pub fn push_record(&self, record: &DurableRecord) -> Result<(), RouteError> {
        self.command(StreamCommand::PushRecord(record.into()))
    }

    /// Queues a replay batch ahead of any held live records. Records already
    /// forwarded on this stream are skipped.
    pub fn replay(&self, records: &[DurableRecord]) -> Result<(), RouteError> {
        self.command(StreamCommand::Replay(
            records.iter().map(ReplayedRecord::from).collect(),
        ))
    }

    /// Tells the peer a replayed record has been handled.
    pub fn ack_record(&self, record_id: Uuid) -> Result<(), RouteError> {
        self.command(StreamCommand::AckRecord(record_id))
    }

    pub(crate) fn inbound(&self, frame: StreamFrame) -> Result<(), RouteError> {
        self.command(StreamCommand::Inbound(frame))
    }

    pub(crate) fn close(&self, notify_peer: bool) {
        let _ = self.commands.send(StreamCommand::Close { notify_peer });
    }

    fn command(&self, command: StreamCommand) -> Result<(), RouteError> {
        self.commands
            .send(command)
            .map_err(|_| RouteError::StreamClosed(self.key.clone()))
    }
}

/// Single writer for one stream's reliable channel.
pub(crate) struct StreamTask {
    key: StreamKey,
    subscription_id: SubscriptionId,
    origin: Origin,
    link: Arc<dyn Transport>,
    config: ReliableConfig,
    channel: ReliableChannel<StreamPayload>,
    commands: mpsc::UnboundedReceiver<StreamCommand>,
    events: mpsc::UnboundedSender<StreamEvent>,
    /// Inbound records already handed to the consumer.
    seen_records: HashSet<Uuid>,
    /// Outbound records put on the channel and not known to have failed.
    forwarded: HashSet<Uuid>,
    /// Channel sequence of each outbound record awaiting its ack.
    in_flight: HashMap<Sequence, Uuid>,
    /// Live records held back until the first replay batch arrives.
    held: Option<Vec<ReplayedRecord>>,
}

impl StreamTask {
    /// With `await_replay` set, live records wait for [`StreamHandle::replay`].
    pub(crate) fn new(
        key: StreamKey,
        subscription_id: SubscriptionId,
        origin: Origin,
        link: Arc<dyn Transport>,
        config: ReliableConfig,
        await_replay: bool,
    ) -> (Self, StreamHandle, mpsc::UnboundedReceiver<StreamEvent>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let handle = StreamHandle {
            key: key.clone(),
            subscription_id: subscription_id.clone(),
            transport: link.id(),
            commands: commands_tx,
        };
        let task = Self {
            channel: ReliableChannel::new(config, key.role.as_str()),
            key,
            subscription_id,
            origin,
            link,
            config,
            commands,
            events,
            seen_records: HashSet::new(),
            forwarded: HashSet::new(),
            in_flight: HashMap::new(),
            held: await_replay.then(Vec::new),
        };
        (task, handle, events_rx)
    }

    pub(crate) async fn run(mut self) {
        let mut tick = time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut connection = self.link.watch_connected();
        let mut watching = true;
        if *connection.borrow_and_update() {
            self.announce();
        } else {
            self.channel.pause(Instant::now());
        }
        debug!(
            target = "relay.router",
            stream = %self.key,
            subscription = %self.subscription_id,
            transport = %self.link.id(),
            "stream started"
        );

        let mut notify_peer = false;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(StreamCommand::Close { notify_peer: notify }) => {
                        notify_peer = notify;
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tick.tick() => {
                    let output = self.channel.tick(Instant::now());
                    self.dispatch(output);
                }
                _ = cleanup.tick() => {
                    self.channel.cleanup(Instant::now());
                }
                changed = connection.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let connected = *connection.borrow_and_update();
                    self.on_connection(connected);
                }
            }
        }

        if notify_peer && self.origin == Origin::Local {
            self.transmit(&Envelope::Unsubscribe {
                subscription_id: self.subscription_id.clone(),
            });
        }
        debug!(
            target = "relay.router",
            stream = %self.key,
            pending = self.channel.sender().pending_len(),
            "stream closed"
        );
    }

    fn handle(&mut self, command: StreamCommand) {
        let now = Instant::now();
        match command {
            StreamCommand::Send { payload, reply } => {
                let (sequence, output) = self.channel.send(StreamPayload::Message(payload), now);
                let _ = reply.send(sequence);
                self.dispatch(output);
            }
            StreamCommand::Inbound(StreamFrame::Data {
                epoch,
                sequence,
                payload,
            }) => {
                let output =
                    self.channel
                        .receive(epoch, sequence, StreamPayload::Message(payload), now);
                self.dispatch(output);
            }
            StreamCommand::Inbound(StreamFrame::Record {
                epoch,
                sequence,
                record,
            }) => {
                let output = self
                    .channel
                    .receive(epoch, sequence, StreamPayload::Record(record), now);
                self.dispatch(output);
            }
            StreamCommand::Inbound(StreamFrame::Ack { epoch, sequence }) => {
                if self.channel.on_ack(epoch, sequence) {
                    self.in_flight.remove(&sequence);
                } else {
                    trace!(target = "relay.router", stream = %self.key, sequence, "ignored ack");
                }
            }
            StreamCommand::PushRecord(record) => match self.held.as_mut() {
                Some(held) => held.push(record),
                None => self.forward_record(record, now),
            },
            StreamCommand::Replay(records) => {
                for record in records {
                    self.forward_record(record, now);
                }
                if let Some(held) = self.held.take() {
                    for record in held {
                        self.forward_record(record, now);
                    }
                }
            }
            StreamCommand::AckRecord(record_id) => {
                self.transmit(&Envelope::RecordAck { record_id });
            }
            StreamCommand::Close { .. } => {}
        }
    }

    fn forward_record(&mut self, record: ReplayedRecord, now: Instant) {
        let record_id = record.record_id;
        if !self.forwarded.insert(record_id) {
            trace!(
                target = "relay.router",
                stream = %self.key,
                record_id = %record_id,
                "record already forwarded"
            );
            return;
        }
        let (sequence, output) = self.channel.send(StreamPayload::Record(record), now);
        self.in_flight.insert(sequence, record_id);
        self.dispatch(output);
    }

    fn on_connection(&mut self, connected: bool) {
        let now = Instant::now();
        if connected {
            debug!(target = "relay.router", stream = %self.key, "transport reconnected; resuming");
            self.announce();
            let output = self.channel.resume(now);
            self.dispatch(output);
        } else {
            debug!(target = "relay.router", stream = %self.key, "transport disconnected; pausing");
            self.channel.pause(now);
        }
    }

    /// Locally opened streams (re)announce themselves to the peer. Remote
    /// subscribe handling is idempotent, so repeats are harmless.
    fn announce(&self) {
        if self.origin != Origin::Local {
            return;
        }
        self.transmit(&Envelope::Subscribe {
            subscription_id: self.subscription_id.clone(),
            scope: self.key.scope.clone(),
            recipient: self.key.recipient.clone(),
            replay_from: None,
        });
    }

    fn dispatch(&mut self, output: ChannelOutput<StreamPayload>) {
        for frame in output.outgoing {
            let subscription_id = self.subscription_id.clone();
            let envelope = match frame {
                Outgoing::Data(transmit) => match transmit.payload {
                    StreamPayload::Message(payload) => Envelope::Data {
                        subscription_id,
                        epoch: transmit.epoch,
                        sequence: transmit.sequence,
                        payload,
                    },
                    StreamPayload::Record(record) => Envelope::Record {
                        subscription_id,
                        epoch: transmit.epoch,
                        sequence: transmit.sequence,
                        record_id: record.record_id,
                        record_sequence: record.sequence,
                        event_type: record.event_type,
                        payload: record.payload,
                    },
                },
                Outgoing::Ack { epoch, sequence } => Envelope::Ack {
                    subscription_id,
                    epoch,
                    sequence,
                },
            };
            self.transmit(&envelope);
        }
        for event in output.events {
            self.on_channel_event(event);
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent<StreamPayload>) {
        let event = match event {
            ChannelEvent::Delivered {
                sequence,
                payload: StreamPayload::Message(payload),
            } => StreamEvent::Delivered { sequence, payload },
            ChannelEvent::Delivered {
                payload: StreamPayload::Record(record),
                ..
            } => {
                if !self.seen_records.insert(record.record_id) {
                    trace!(
                        target = "relay.router",
                        stream = %self.key,
                        record_id = %record.record_id,
                        "duplicate record"
                    );
                    return;
                }
                StreamEvent::Replayed(record)
            }
            ChannelEvent::Reset => {
                // The sender dropped everything in flight; a later replay
                // must be free to send those records again.
                self.forwarded.clear();
                self.in_flight.clear();
                StreamEvent::Reset
            }
            ChannelEvent::PermanentlyFailed(sequence) => {
                if let Some(record_id) = self.in_flight.remove(&sequence) {
                    self.forwarded.remove(&record_id);
                }
                StreamEvent::PermanentlyFailed(sequence)
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            trace!(target = "relay.router", stream = %self.key, "stream consumer gone");
        }
    }

    fn transmit(&self, envelope: &Envelope) {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target = "relay.router", stream = %self.key, error = %err, "failed to encode frame");
                return;
            }
        };
        // Retransmission covers anything lost here.
        if let Err(err) = self.link.send(frame) {
            debug!(
                target = "relay.router",
                stream = %self.key,
                kind = envelope.kind(),
                error = %err,
                "frame not sent"
            );
        }
    }
}
