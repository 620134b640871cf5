//! Owns the streaming socket of one lesson session.
//!
//! The [`ConnectionManager`] is a cheap handle onto an actor task. The actor
//! opens sockets through a [`Transport`], forwards inbound frames, and decides
//! after every closure whether to reconnect. Its state is published as a
//! [`ConnectionSnapshot`] on a watch channel.

mod bootstrap;
mod transport;

pub use bootstrap::{LessonRequest, SessionStarted, is_canonical_uuid, request_session};
pub use transport::{
    OutboundFrame, SocketChannels, Transport, TransportEvent, TungsteniteTransport,
};

use crate::{
    error::{BootstrapError, ConnectionError},
    protocol::{self, ClientEvent, InboundFrame, SessionId},
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use reqwest::Url;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, sleep_until},
};
use tracing::{debug, info, instrument, warn};

/// Normal closure. Terminal.
pub const CLOSE_NORMAL: u16 = 1000;
/// The backend does not know the session. Terminal.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4004;

/// Closures that must not be followed by a reconnect.
pub fn is_terminal_close(code: Option<u16>) -> bool {
    matches!(code, Some(CLOSE_NORMAL | CLOSE_SESSION_NOT_FOUND))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(3000),
        }
    }
}

/// Where the backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    api_base: Url,
}

impl Endpoints {
    /// Accepts an `http` or `https` base URL.
    pub fn parse(api_base: &str) -> Result<Self, BootstrapError> {
        let api_base =
            Url::parse(api_base).map_err(|_| BootstrapError::InvalidUrl(api_base.to_owned()))?;
        match api_base.scheme() {
            "http" | "https" => Ok(Self { api_base }),
            _ => Err(BootstrapError::InvalidUrl(api_base.to_string())),
        }
    }

    /// Appends each segment to the base path, percent-encoding any `/`
    /// inside a segment.
    fn join(&self, segments: &[&str]) -> Url {
        let mut url = self.api_base.clone();
        // http(s) URLs always have a path to extend.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub fn session_start_url(&self) -> Url {
        self.join(&["api", "v1", "learn", "session", "start"])
    }

    /// The socket URL for `session_id`: `https` becomes `wss`, `http`
    /// becomes `ws`.
    pub fn stream_url(&self, session_id: &SessionId) -> String {
        let mut url = self.join(&["api", "v1", "learn", "ws", session_id.as_str()]);
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // Both schemes are special, so the switch cannot fail.
        let _ = url.set_scheme(scheme);
        url.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub endpoints: Endpoints,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The backend ended the session. Only a new session leaves this state.
    SessionEnded,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub session_id: Option<SessionId>,
    pub reconnect_attempts: u32,
    pub is_reconnecting: bool,
    pub last_error: Option<ConnectionError>,
}

#[derive(Debug)]
enum Command {
    Connect(SessionId),
    Disconnect,
}

type Outlet = Option<mpsc::UnboundedSender<OutboundFrame>>;

/// Handle onto the connection actor. Clones share the same socket.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionSnapshot>,
    outlet: watch::Receiver<Outlet>,
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl ConnectionManager {
    /// Spawns the actor. Inbound frames of whatever session is bound arrive on
    /// the returned receiver.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<InboundFrame>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionSnapshot::default());
        let (outlet_tx, outlet_rx) = watch::channel(None);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            transport,
            endpoints: config.endpoints.clone(),
            policy: config.reconnect,
            state: state_tx,
            outlet: outlet_tx,
            frames: frames_tx,
            session: None,
            link: Link::Idle,
            reconnect_at: None,
        };
        tokio::spawn(actor.run(commands_rx));

        let manager = Self {
            commands: commands_tx,
            state: state_rx,
            outlet: outlet_rx,
            endpoints: config.endpoints,
            http: reqwest::Client::new(),
        };
        (manager, frames_rx)
    }

    /// Binds `session_id` and opens its socket. A no-op while a socket for the
    /// same id is open or opening.
    pub fn connect(&self, session_id: SessionId) {
        self.command(Command::Connect(session_id));
    }

    /// Closes the socket normally, cancels any pending reconnect and unbinds
    /// the session.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Connection actor is gone");
        }
    }

    /// Allocates a session over HTTP, then connects to it.
    pub async fn start_session(&self, request: &LessonRequest) -> Result<SessionId, BootstrapError> {
        let started = request_session(&self.http, &self.endpoints, request).await?;
        self.connect(started.session_id.clone());
        Ok(started.session_id)
    }

    /// Sends a client event. Returns `false`, without queueing anything, when
    /// no socket is open.
    pub fn send(&self, event: &ClientEvent) -> bool {
        let text = match protocol::encode_event(event) {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = event.kind(), error = %e, "Failed to encode client event");
                return false;
            }
        };
        self.send_frame(OutboundFrame::Text(text))
    }

    /// Sends an encoded audio chunk. Same contract as [`Self::send`].
    pub fn send_binary(&self, chunk: Bytes) -> bool {
        self.send_frame(OutboundFrame::Binary(chunk))
    }

    fn send_frame(&self, frame: OutboundFrame) -> bool {
        match &*self.outlet.borrow() {
            Some(outbound) => outbound.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.state.borrow().session_id.clone()
    }

    pub fn is_open(&self) -> bool {
        self.outlet.borrow().is_some()
    }
}

enum Link {
    Idle,
    Opening(BoxFuture<'static, Result<SocketChannels, ConnectionError>>),
    Open(SocketChannels),
}

enum Activity {
    Opened(Result<SocketChannels, ConnectionError>),
    Socket(Option<TransportEvent>),
}

/// Resolves with the next thing that happened on the link. Never resolves
/// while idle.
async fn next_activity(link: &mut Link) -> Activity {
    match link {
        Link::Idle => std::future::pending().await,
        Link::Opening(open) => Activity::Opened(open.await),
        Link::Open(channels) => Activity::Socket(channels.inbound.recv().await),
    }
}

struct Actor {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionSnapshot>,
    outlet: watch::Sender<Outlet>,
    frames: mpsc::UnboundedSender<InboundFrame>,
    session: Option<SessionId>,
    link: Link,
    reconnect_at: Option<Instant>,
}

impl Actor {
    #[instrument(name = "connection", skip_all)]
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect(session_id)) => self.connect(session_id),
                    Some(Command::Disconnect) => self.disconnect(),
                    None => break,
                },
                activity = next_activity(&mut self.link) => match activity {
                    Activity::Opened(Ok(channels)) => self.on_open(channels),
                    Activity::Opened(Err(e)) => {
                        warn!(error = %e, "Failed to open socket");
                        self.link = Link::Idle;
                        self.update(|s| s.last_error = Some(e));
                        self.on_closed(None, "open failed".into());
                    }
                    Activity::Socket(Some(TransportEvent::Frame(frame))) => {
                        let _ = self.frames.send(frame);
                    }
                    Activity::Socket(Some(TransportEvent::Error(message))) => {
                        warn!(%message, "Transport error");
                        self.update(|s| s.last_error = Some(ConnectionError::Transport(message)));
                    }
                    Activity::Socket(Some(TransportEvent::Closed { code, reason })) => {
                        self.drop_link();
                        self.on_closed(code, reason);
                    }
                    Activity::Socket(None) => {
                        self.drop_link();
                        self.on_closed(None, "transport dropped".into());
                    }
                },
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.open();
                }
            }
        }
        self.disconnect();
        debug!("Connection actor stopped");
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionSnapshot)) {
        self.state.send_modify(|snapshot| {
            f(snapshot);
            snapshot.session_id = self.session.clone();
        });
    }

    fn connect(&mut self, session_id: SessionId) {
        let active = !matches!(self.link, Link::Idle);
        if active && self.session.as_ref() == Some(&session_id) {
            debug!(%session_id, "Already connected or connecting");
            return;
        }
        if active {
            // Forget the old socket before closing it so its closure is not
            // mistaken for ours.
            info!(old = ?self.session, new = %session_id, "Switching session");
            self.close_link(CLOSE_NORMAL, "switching session");
        }
        self.reconnect_at = None;
        self.session = Some(session_id);
        self.update(|s| {
            s.reconnect_attempts = 0;
            s.is_reconnecting = false;
            s.last_error = None;
        });
        self.open();
    }

    fn open(&mut self) {
        let Some(session_id) = &self.session else {
            return;
        };
        let url = self.endpoints.stream_url(session_id);
        info!(%url, "Opening socket");
        let transport = self.transport.clone();
        self.link = Link::Opening(Box::pin(async move { transport.open(&url).await }));
        self.update(|s| {
            s.status = if s.is_reconnecting {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Connecting
            };
        });
    }

    fn on_open(&mut self, channels: SocketChannels) {
        self.outlet.send_replace(Some(channels.outbound.clone()));
        self.link = Link::Open(channels);
        info!(session_id = ?self.session, "Socket open");
        self.update(|s| {
            s.status = ConnectionStatus::Connected;
            s.reconnect_attempts = 0;
            s.is_reconnecting = false;
        });
    }

    fn on_closed(&mut self, code: Option<u16>, reason: String) {
        if is_terminal_close(code) {
            let session_id = self.session.take();
            let code = code.unwrap_or(CLOSE_NORMAL);
            info!(code, %reason, "Session ended by backend");
            self.reconnect_at = None;
            self.update(|s| {
                s.status = ConnectionStatus::SessionEnded;
                s.is_reconnecting = false;
                s.last_error = Some(ConnectionError::SessionTerminal {
                    session_id: session_id.map(|id| id.to_string()).unwrap_or_default(),
                    code,
                    reason,
                });
            });
            return;
        }

        if self.session.is_none() {
            self.update(|s| s.status = ConnectionStatus::Disconnected);
            return;
        }

        let attempts = self.state.borrow().reconnect_attempts;
        if attempts < self.policy.max_attempts {
            let attempt = attempts + 1;
            info!(
                ?code,
                %reason,
                attempt,
                max = self.policy.max_attempts,
                "Socket closed, scheduling reconnect"
            );
            self.reconnect_at = Some(Instant::now() + self.policy.delay);
            self.update(|s| {
                s.status = ConnectionStatus::Reconnecting;
                s.reconnect_attempts = attempt;
                s.is_reconnecting = true;
            });
        } else {
            warn!(attempts, "Reconnect attempts exhausted");
            self.update(|s| {
                s.status = ConnectionStatus::Disconnected;
                s.is_reconnecting = false;
            });
        }
    }

    fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.close_link(CLOSE_NORMAL, "client disconnect");
        if self.session.take().is_some() {
            info!("Disconnected");
        }
        self.update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.reconnect_attempts = 0;
            s.is_reconnecting = false;
        });
    }

    /// Closes the current socket without reacting to its closure.
    fn close_link(&mut self, code: u16, reason: &str) {
        if let Link::Open(channels) = &self.link {
            let _ = channels.outbound.send(OutboundFrame::Close {
                code,
                reason: reason.to_owned(),
            });
        }
        self.drop_link();
    }

    fn drop_link(&mut self) {
        self.link = Link::Idle;
        self.outlet.send_replace(None);
    }
}
