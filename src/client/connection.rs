//! Push channel lifecycle.
//!
//! [`ConnectionManager::connect`] spawns one link task per user. The task
//! owns the WebSocket: it registers the user on every (re)connect, pings on
//! a fixed interval, forwards queued outbound frames, decodes inbound frames
//! into the [`EventRouter`] and reconnects with capped exponential backoff
//! until it is cancelled or the server rejects the token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::config::ClientConfig;
use super::error::ClientError;
use super::reconciler::PushSink;
use super::router::EventRouter;
use crate::wire::{ClientFrame, RegisterPayload, ServerFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close codes after which reconnecting with the same token is pointless.
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub push_url: String,
    pub heartbeat_interval: Duration,
    pub max_missed_pongs: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &ClientConfig, token: &str) -> Result<Self, ClientError> {
        Ok(Self {
            push_url: config.push_url(token)?,
            heartbeat_interval: config.heartbeat_interval(),
            max_missed_pongs: config.max_missed_pongs.max(1),
            reconnect_base: config.reconnect_base(),
            reconnect_max: config.reconnect_max(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Closed,
}

/// Delay before reconnect attempt `attempt` (0-based): `base * 2^attempt`, capped at `max`.
pub fn reconnect_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

struct HandleInner {
    user_id: String,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    cancel: CancellationToken,
    state: watch::Receiver<LinkState>,
    connects: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap, cloneable handle to a running link.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Queue a frame for the server. Frames queued while the link is down
    /// go out after the next successful register.
    pub fn emit(&self, frame: ClientFrame) -> Result<(), ClientError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ClientError::NotConnected);
        }
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| ClientError::NotConnected)
    }

    pub fn state(&self) -> LinkState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.clone()
    }

    /// How many times the link has reached [`LinkState::Connected`]. Bumped
    /// before the state changes, so a watcher woken by the change sees it.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled() || *self.inner.state.borrow() == LinkState::Closed
    }

    fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    async fn join(&self) {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl PushSink for ConnectionHandle {
    fn emit(&self, frame: ClientFrame) -> Result<(), ClientError> {
        ConnectionHandle::emit(self, frame)
    }
}

/// Owns at most one live link at a time.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    router: EventRouter,
    active: Mutex<Option<ConnectionHandle>>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, router: EventRouter) -> Self {
        Self {
            settings,
            router,
            active: Mutex::new(None),
        }
    }

    /// Start the link for `user_id`, or return the live one if it already
    /// serves that user. A link for a different user is cancelled first.
    pub fn connect(&self, user_id: &str) -> ConnectionHandle {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(handle) = active.as_ref() {
            if handle.user_id() == user_id && !handle.is_closed() {
                return handle.clone();
            }
        }
        if let Some(previous) = active.take() {
            tracing::info!(user_id = %previous.user_id(), "Replacing push link");
            previous.cancel();
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let cancel = CancellationToken::new();
        let connects = Arc::new(AtomicU64::new(0));

        let link = Link {
            settings: self.settings.clone(),
            user_id: user_id.to_string(),
            router: self.router.clone(),
            outbound: outbound_rx,
            carry: None,
            cancel: cancel.clone(),
            state: state_tx,
            connects: Arc::clone(&connects),
        };
        let task = tokio::spawn(link.run());

        let handle = ConnectionHandle {
            inner: Arc::new(HandleInner {
                user_id: user_id.to_string(),
                outbound: outbound_tx,
                cancel,
                state: state_rx,
                connects,
                task: Mutex::new(Some(task)),
            }),
        };
        *active = Some(handle.clone());
        handle
    }

    /// Close the live link, if any, and wait for its task to finish.
    pub async fn disconnect(&self) {
        let handle = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.cancel();
            handle.join().await;
            tracing::info!(user_id = %handle.user_id(), "Push link closed");
        }
    }

    /// Cancel the live link without waiting for it to close.
    pub fn cancel_current(&self) {
        let handle = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    pub fn current(&self) -> Option<ConnectionHandle> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

enum LinkEnd {
    Cancelled,
    Rejected(u16),
    Dropped(ClientError),
}

struct Link {
    settings: ConnectionSettings,
    user_id: String,
    router: EventRouter,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
    /// Encoded frame whose write failed; resent after the next register.
    carry: Option<String>,
    cancel: CancellationToken,
    state: watch::Sender<LinkState>,
    connects: Arc<AtomicU64>,
}

impl Link {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if attempt == 0 {
                self.state.send_replace(LinkState::Connecting);
            }

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect_async(self.settings.push_url.as_str()) => result.map_err(ClientError::from),
            };

            match connected {
                Ok((socket, _response)) => {
                    tracing::info!(user_id = %self.user_id, "Push link connected");
                    attempt = 0;
                    self.connects.fetch_add(1, Ordering::SeqCst);
                    self.state.send_replace(LinkState::Connected);

                    match self.drive(socket).await {
                        LinkEnd::Cancelled => break,
                        LinkEnd::Rejected(code) => {
                            tracing::error!(
                                user_id = %self.user_id,
                                close_code = code,
                                "Push link rejected by server, not reconnecting"
                            );
                            break;
                        }
                        LinkEnd::Dropped(e) => {
                            tracing::warn!(user_id = %self.user_id, error = %e, "Push link dropped");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %self.user_id,
                        attempt,
                        error = %e,
                        "Push link connect failed"
                    );
                }
            }

            let delay = reconnect_delay(self.settings.reconnect_base, self.settings.reconnect_max, attempt);
            attempt = attempt.saturating_add(1);
            self.state.send_replace(LinkState::Reconnecting { attempt, delay });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(LinkState::Closed);
    }

    /// Run one connected session until it ends.
    async fn drive(&mut self, socket: Socket) -> LinkEnd {
        let (mut sink, mut source) = socket.split();

        let register = ClientFrame::Register(RegisterPayload {
            user_id: self.user_id.clone(),
        });
        let register = match register.encode() {
            Ok(text) => text,
            Err(e) => return LinkEnd::Dropped(e.into()),
        };
        if let Err(e) = sink.send(WsMessage::text(register)).await {
            return LinkEnd::Dropped(e.into());
        }
        if let Some(text) = self.carry.take() {
            if let Err(e) = sink.send(WsMessage::text(text.clone())).await {
                self.carry = Some(text);
                return LinkEnd::Dropped(e.into());
            }
        }

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first immediate tick
        heartbeat.tick().await;
        let mut missed_pongs: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return LinkEnd::Cancelled;
                }

                frame = self.outbound.recv() => {
                    // Every handle is gone; nobody can use this link anymore.
                    let Some(frame) = frame else {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return LinkEnd::Cancelled;
                    };
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping unencodable outbound frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::text(text.clone())).await {
                        self.carry = Some(text);
                        return LinkEnd::Dropped(e.into());
                    }
                }

                _ = heartbeat.tick() => {
                    if missed_pongs >= self.settings.max_missed_pongs {
                        return LinkEnd::Dropped(ClientError::LinkLost(format!(
                            "{missed_pongs} heartbeats unanswered"
                        )));
                    }
                    missed_pongs += 1;
                    if let Err(e) = sink.send(WsMessage::Ping(Vec::<u8>::new().into())).await {
                        return LinkEnd::Dropped(e.into());
                    }
                }

                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        missed_pongs = 0;
                        self.deliver(text.as_str());
                    }
                    // tungstenite answers pings itself.
                    Some(Ok(WsMessage::Pong(_))) => missed_pongs = 0,
                    Some(Ok(WsMessage::Close(frame))) => return close_outcome(frame),
                    Some(Ok(other)) => {
                        tracing::debug!(kind = ?other, "Ignoring non-text push frame");
                    }
                    Some(Err(e)) => return LinkEnd::Dropped(e.into()),
                    None => return LinkEnd::Dropped(ClientError::LinkLost("stream ended".to_string())),
                },
            }
        }
    }

    fn deliver(&self, text: &str) {
        let frame = match ServerFrame::decode(text).map_err(ClientError::from) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, error = %e, "Dropping malformed push frame");
                return;
            }
        };

        match &frame {
            ServerFrame::Registered(payload) => {
                tracing::debug!(user_id = %payload.user_id, "Push session registered");
            }
            ServerFrame::Error(payload) => {
                tracing::warn!(code = payload.code, message = %payload.message, "Server reported push error");
            }
            _ => {}
        }

        self.router.dispatch(&frame);
    }
}

fn close_outcome(frame: Option<CloseFrame>) -> LinkEnd {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            if code == CLOSE_TOKEN_EXPIRED || code == CLOSE_TOKEN_INVALID {
                LinkEnd::Rejected(code)
            } else {
                LinkEnd::Dropped(ClientError::LinkLost(format!(
                    "server closed ({code}: {})",
                    frame.reason.as_str()
                )))
            }
        }
        None => LinkEnd::Dropped(ClientError::LinkLost("server closed".to_string())),
    }
}
