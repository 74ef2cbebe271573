use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::{next_transport_id, BusError, BusResult, Transport, TransportId};

const INBOUND_CAPACITY: usize = 1024;

/// A [`Transport`] over one WebSocket connection. Every frame travels as a
/// binary message; text messages from the peer are accepted as their bytes.
///
/// The first call to [`Transport::subscribe`] sees every frame received
/// since the link was created, so a frame that lands before the reader
/// attaches is not lost.
pub struct WebSocketLink {
    id: TransportId,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: broadcast::Sender<Bytes>,
    first_subscriber: Mutex<Option<broadcast::Receiver<Bytes>>>,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl WebSocketLink {
    /// Completes the server handshake on an accepted TCP connection.
    pub async fn accept(stream: TcpStream) -> BusResult<Self> {
        let socket = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;
        Ok(Self::spawn(socket))
    }

    /// Dials `url` (`ws://host:port/...`) and completes the client handshake.
    pub async fn connect(url: &str) -> BusResult<Self> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;
        Ok(Self::spawn(socket))
    }

    /// Wraps an already negotiated socket and starts its I/O task.
    pub fn spawn<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, first) = broadcast::channel(INBOUND_CAPACITY);
        let (connected_tx, connected) = watch::channel(true);
        let task = tokio::spawn(run(socket, outbound_rx, inbound.clone(), connected_tx));
        Self {
            id: next_transport_id(),
            outbound,
            inbound,
            first_subscriber: Mutex::new(Some(first)),
            connected,
            task,
        }
    }
}

async fn run<S>(
    socket: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    inbound: broadcast::Sender<Bytes>,
    connected: watch::Sender<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Binary(frame.to_vec())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            message = source.next() => match message {
                // No subscriber yet is indistinguishable from loss.
                Some(Ok(Message::Binary(data))) => {
                    let _ = inbound.send(Bytes::from(data));
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(Bytes::from(text.into_bytes()));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    connected.send_replace(false);
}

impl Transport for WebSocketLink {
    fn id(&self) -> TransportId {
        self.id
    }

    fn send(&self, frame: Bytes) -> BusResult<()> {
        if !*self.connected.borrow() {
            return Err(BusError::Disconnected);
        }
        self.outbound.send(frame).map_err(|_| BusError::Closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.first_subscriber
            .lock()
            .take()
            .unwrap_or_else(|| self.inbound.subscribe())
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}
