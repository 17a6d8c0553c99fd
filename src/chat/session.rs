use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::chat::frame::{parse_frame, ClientFrame, FrameOutcome};
use crate::error::AppError;
use crate::models::chat::{ChatMessage, ChatState};
use crate::models::order::{OrderId, UserId};
use crate::observability::metrics::Metrics;

const EVENT_BUFFER: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message(ChatMessage),
    /// Emitted once, when the session reaches `Closed` for any reason.
    Closed { order_id: OrderId },
}

enum Outbound {
    Frame(String),
    Close,
}

/// State shared between the session handle and its socket task.
struct Shared {
    order_id: OrderId,
    state: watch::Sender<ChatState>,
    transcript: Mutex<Vec<ChatMessage>>,
    events: broadcast::Sender<ChatEvent>,
    metrics: Metrics,
}

impl Shared {
    fn transcript(&self) -> MutexGuard<'_, Vec<ChatMessage>> {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, message: ChatMessage) {
        self.transcript().push(message.clone());
        let _ = self.events.send(ChatEvent::Message(message));
    }

    fn receive(&self, text: &str) {
        match parse_frame(self.order_id, text) {
            FrameOutcome::Chat(message) => self.append(message),
            FrameOutcome::Drop(reason) => {
                self.metrics.chat_frames_dropped_total.inc();
                debug!(order_id = self.order_id, reason = %reason, "chat frame dropped");
            }
        }
    }

    /// Moves to `Closed`. Returns false when already closed, so the close
    /// notification fires once per session.
    fn mark_closed(&self) -> bool {
        let mut was_open = false;
        let changed = self.state.send_if_modified(|state| {
            if *state == ChatState::Closed {
                return false;
            }
            was_open = *state == ChatState::Open;
            *state = ChatState::Closed;
            true
        });

        if changed {
            if was_open {
                self.metrics.chat_sessions_open.dec();
            }
            let _ = self.events.send(ChatEvent::Closed {
                order_id: self.order_id,
            });
        }
        changed
    }
}

/// One live chat channel for one order.
///
/// `Disconnected -> Connecting -> Open -> Closed`, with `Closed` terminal.
/// Reconnecting means building a new session.
pub struct ChatSession {
    url: Url,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl ChatSession {
    pub fn new(order_id: OrderId, url: Url, connect_timeout: Duration, metrics: Metrics) -> Self {
        let (state, _state_rx) = watch::channel(ChatState::Disconnected);
        let (events, _events_rx) = broadcast::channel(EVENT_BUFFER);

        Self {
            url,
            connect_timeout,
            shared: Arc::new(Shared {
                order_id,
                state,
                transcript: Mutex::new(Vec::new()),
                events,
                metrics,
            }),
            outbound: Mutex::new(None),
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.shared.order_id
    }

    pub fn state(&self) -> ChatState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChatState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.shared.events.subscribe()
    }

    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.shared.transcript().clone()
    }

    /// Performs the handshake. A failed handshake closes the session for good.
    pub async fn open(&self, token: &str) -> Result<(), AppError> {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == ChatState::Disconnected {
                *state = ChatState::Connecting;
                true
            } else {
                false
            }
        });

        if !started {
            return match self.state() {
                ChatState::Closed => Err(AppError::ChannelClosed),
                _ => Ok(()),
            };
        }

        let order_id = self.order_id();
        let url = self.socket_url(token);

        let mut socket = match timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(err)) => {
                warn!(order_id, error = %err, "chat handshake failed");
                self.shared.mark_closed();
                return Err(AppError::ChannelClosed);
            }
            Err(_) => {
                warn!(order_id, "chat handshake timed out");
                self.shared.mark_closed();
                return Err(AppError::ChannelClosed);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.outbound() = Some(outbound_tx);

        let opened = self.shared.state.send_if_modified(|state| {
            if *state == ChatState::Connecting {
                *state = ChatState::Open;
                true
            } else {
                false
            }
        });

        if !opened {
            // closed while the handshake was in flight
            self.outbound().take();
            let _ = socket.close(None).await;
            return Err(AppError::ChannelClosed);
        }

        self.shared.metrics.chat_sessions_open.inc();
        info!(order_id, "chat session open");

        tokio::spawn(run_socket(self.shared.clone(), socket, outbound_rx));
        Ok(())
    }

    /// Queues a message and records it locally right away. Returns false,
    /// doing nothing, unless the session is open and `content` has text.
    pub fn send(&self, to_user: UserId, content: &str) -> bool {
        if content.trim().is_empty() || self.state() != ChatState::Open {
            return false;
        }

        let order_id = self.order_id();
        let frame = ClientFrame::ChatMessage {
            order_id,
            to_user_id: to_user,
            content: content.to_string(),
        };

        let json = match frame.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(order_id, error = %err, "failed to serialize chat frame");
                return false;
            }
        };

        {
            let outbound = self.outbound();
            let Some(tx) = outbound.as_ref() else {
                return false;
            };
            if tx.send(Outbound::Frame(json)).is_err() {
                return false;
            }
        }

        self.shared
            .append(ChatMessage::outgoing(order_id, to_user, content));
        true
    }

    /// Idempotent; only the first call notifies listeners.
    pub fn close(&self) {
        let outbound = self.outbound().take();

        if self.shared.mark_closed() {
            info!(order_id = self.order_id(), "chat session closed");
        }

        if let Some(tx) = outbound {
            let _ = tx.send(Outbound::Close);
        }
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn socket_url(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", token);
        url
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_socket(
    shared: Arc<Shared>,
    socket: Socket,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let order_id = shared.order_id;
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            command = outbound_rx.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!(order_id, error = %err, "chat send failed");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "order completed".into(),
                    };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    break;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.receive(&text),
                Some(Ok(Message::Binary(_))) => {
                    shared.metrics.chat_frames_dropped_total.inc();
                    debug!(order_id, "binary chat frame dropped");
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(order_id, "chat socket closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(order_id, error = %err, "chat socket failed");
                    break;
                }
            },
        }
    }

    shared.mark_closed();
}
