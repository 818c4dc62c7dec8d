// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Socket
//!
//! Multiplexes one [`Transport`] into many concurrent request/response
//! exchanges in both directions.
//!
//! The socket runs as a single task that owns the transport, the map of
//! pending requests and the queue of frames deferred while disconnected.
//! [`RelaySocket`] is a cheap handle that talks to that task over a channel.
//!
//! - Outgoing requests get a random 64-bit id, unique among those in flight.
//! - Server requests are handed to [`IncomingRequests`]; if nobody listens they
//!   are answered with 404.
//! - A keepalive GET is issued every 45 seconds. When enabled, a missing
//!   answer after 5 seconds closes the connection with code 3001.
//! - Reconnects are throttled only when the previous connection lived less
//!   than 10 seconds.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::error::NetworkError;
use super::protocol::{WireMessage, WireRequest, WireResponse};
use super::transport::{ConnectionState, Transport, TransportConfig};

/// Close code used when the keepalive probe goes unanswered.
pub const KEEPALIVE_CLOSE_CODE: u16 = 3001;

/// Close code used when the connection dropped without a close handshake.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Dead-peer detection settings.
#[derive(Debug, Clone)]
pub struct KeepaliveOptions {
    /// Path of the keepalive GET.
    pub path: String,
    pub interval: Duration,
    /// How long to wait for any frame after a probe.
    pub timeout: Duration,
    /// Close the connection when `timeout` elapses.
    pub disconnect: bool,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        KeepaliveOptions {
            path: "/".to_string(),
            interval: Duration::from_secs(45),
            timeout: Duration::from_secs(5),
            disconnect: true,
        }
    }
}

impl KeepaliveOptions {
    pub fn with_path(path: &str) -> Self {
        KeepaliveOptions {
            path: path.to_string(),
            ..Default::default()
        }
    }
}

/// Reconnect throttling.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Connections that lived shorter than this throttle the next attempt.
    pub min_lifetime: Duration,
    /// Lower bound of a throttled delay.
    pub min_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            min_lifetime: Duration::from_secs(10),
            min_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before connection attempt number `attempt`.
    ///
    /// `jitter` is a uniform sample in `[0, 1)`; the delay is
    /// `max(min_delay, jitter * attempt)` seconds. Returns `None` for the first
    /// connection and after connections that lived long enough.
    pub fn delay(&self, last_lifetime: Option<Duration>, attempt: u32, jitter: f64) -> Option<Duration> {
        match last_lifetime {
            Some(lifetime) if lifetime < self.min_lifetime => {
                let scaled = Duration::from_secs_f64((jitter * f64::from(attempt)).max(0.0));
                Some(scaled.max(self.min_delay))
            }
            _ => None,
        }
    }
}

/// Socket construction options.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    pub transport: TransportConfig,
    /// `None` disables the keepalive entirely.
    pub keepalive: Option<KeepaliveOptions>,
    pub reconnect: ReconnectPolicy,
}

impl SocketOptions {
    pub fn new(url: &str) -> Self {
        SocketOptions {
            transport: TransportConfig::new(url),
            keepalive: Some(KeepaliveOptions::default()),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Option<KeepaliveOptions>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// Lifecycle notifications broadcast by the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    Closed { code: u16, reason: String },
}

/// A request initiated by the server. Must be answered with [`respond`].
///
/// [`respond`]: IncomingRequest::respond
#[derive(Debug)]
pub struct IncomingRequest {
    pub id: u64,
    pub verb: String,
    pub path: String,
    pub body: Option<Vec<u8>>,
    responder: mpsc::UnboundedSender<WireResponse>,
}

impl IncomingRequest {
    /// Sends the response frame for this request.
    pub fn respond(self, status: u16, message: &str) {
        let response = WireResponse {
            id: self.id,
            status,
            message: message.to_string(),
            body: None,
        };
        if self.responder.send(response).is_err() {
            debug!("Socket gone before response to request {}", self.id);
        }
    }
}

/// Stream of server-initiated requests.
#[derive(Debug)]
pub struct IncomingRequests {
    rx: mpsc::UnboundedReceiver<IncomingRequest>,
}

impl IncomingRequests {
    pub async fn recv(&mut self) -> Option<IncomingRequest> {
        self.rx.recv().await
    }
}

type Reply<T> = oneshot::Sender<Result<T, NetworkError>>;

enum Command {
    Connect {
        reply: Reply<()>,
    },
    Request {
        verb: String,
        path: String,
        body: Option<Vec<u8>>,
        reply: Reply<WireResponse>,
    },
    Send {
        message: WireMessage,
    },
    Close {
        code: u16,
        reason: String,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running socket task.
#[derive(Clone)]
pub struct RelaySocket {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SocketEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for RelaySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySocket")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl RelaySocket {
    /// Spawns the socket task. Must be called inside a tokio runtime.
    ///
    /// The socket starts disconnected; call [`RelaySocket::connect`].
    pub fn new<T: Transport>(transport: T, options: SocketOptions) -> (RelaySocket, IncomingRequests) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = SocketActor {
            transport,
            options,
            commands: commands_rx,
            responses_tx,
            responses_rx,
            requests: requests_tx,
            events: events_tx.clone(),
            state: state_tx,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            connected: false,
            connect_count: 0,
            opened_at: None,
            last_lifetime: None,
            next_tickle: None,
            keepalive_deadline: None,
            keepalive_probe: None,
        };
        tokio::spawn(actor.run());

        let socket = RelaySocket {
            commands: commands_tx,
            events: events_tx,
            state: state_rx,
        };
        (socket, IncomingRequests { rx: requests_rx })
    }

    /// Opens the connection, closing any existing one first.
    ///
    /// Flushes frames queued while disconnected once open.
    pub async fn connect(&self) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { reply })?;
        rx.await.map_err(|_| NetworkError::Shutdown)?
    }

    /// Sends a request and waits for the matching response.
    ///
    /// Non-2xx responses resolve to [`NetworkError::RequestFailed`]. While
    /// disconnected the request is queued; if the connection drops after it
    /// was written it fails with [`NetworkError::ConnectionClosed`].
    pub async fn request(
        &self,
        verb: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<WireResponse, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Request {
            verb: verb.to_string(),
            path: path.to_string(),
            body,
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::Shutdown)?
    }

    /// Writes a raw frame, or queues it until the next connect.
    pub fn send(&self, message: WireMessage) -> Result<(), NetworkError> {
        self.command(Command::Send { message })
    }

    /// Closes the current connection. The socket may be connected again.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Close {
            code,
            reason: reason.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::Shutdown)
    }

    /// Closes the connection, fails everything pending and stops the task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    fn command(&self, command: Command) -> Result<(), NetworkError> {
        self.commands
            .send(command)
            .map_err(|_| NetworkError::Shutdown)
    }
}

struct Pending {
    reply: Reply<WireResponse>,
    /// Written to a connection that may still answer it.
    transmitted: bool,
}

enum Event {
    Command(Command),
    Respond(WireResponse),
    Frame(Result<Option<WireMessage>, NetworkError>),
    Tickle,
    KeepaliveExpired,
    Stop,
}

struct SocketActor<T: Transport> {
    transport: T,
    options: SocketOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    responses_tx: mpsc::UnboundedSender<WireResponse>,
    responses_rx: mpsc::UnboundedReceiver<WireResponse>,
    requests: mpsc::UnboundedSender<IncomingRequest>,
    events: broadcast::Sender<SocketEvent>,
    state: watch::Sender<ConnectionState>,
    pending: HashMap<u64, Pending>,
    queue: VecDeque<WireMessage>,
    connected: bool,
    connect_count: u32,
    opened_at: Option<Instant>,
    last_lifetime: Option<Duration>,
    next_tickle: Option<Instant>,
    keepalive_deadline: Option<Instant>,
    keepalive_probe: Option<u64>,
}

impl<T: Transport> SocketActor<T> {
    async fn run(mut self) {
        loop {
            let connected = self.connected;
            let tickle = self.next_tickle;
            let deadline = self.keepalive_deadline;
            let now = Instant::now();

            // Responses first: one queued before a shutdown must still go out.
            let event = tokio::select! {
                biased;
                Some(response) = self.responses_rx.recv() => Event::Respond(response),
                command = self.commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Stop,
                },
                frame = self.transport.receive(), if connected => Event::Frame(frame),
                _ = sleep_until(tickle.unwrap_or(now)), if connected && tickle.is_some() => Event::Tickle,
                _ = sleep_until(deadline.unwrap_or(now)), if connected && deadline.is_some() => {
                    Event::KeepaliveExpired
                }
            };

            match event {
                Event::Command(Command::Connect { reply }) => {
                    let result = self.connect().await;
                    let _ = reply.send(result);
                }
                Event::Command(Command::Request {
                    verb,
                    path,
                    body,
                    reply,
                }) => {
                    let id = self.next_id();
                    self.pending.insert(
                        id,
                        Pending {
                            reply,
                            transmitted: false,
                        },
                    );
                    let request = WireMessage::Request(WireRequest {
                        id,
                        verb,
                        path,
                        body,
                    });
                    self.transmit(request).await;
                }
                Event::Command(Command::Send { message }) => self.transmit(message).await,
                Event::Command(Command::Close {
                    code,
                    reason,
                    reply,
                }) => {
                    self.disconnect(code, &reason, true).await;
                    let _ = reply.send(());
                }
                Event::Command(Command::Shutdown { reply }) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                Event::Stop => {
                    self.shutdown().await;
                    return;
                }
                Event::Respond(response) => {
                    self.transmit(WireMessage::Response(response)).await;
                }
                Event::Frame(frame) => self.handle_frame(frame).await,
                Event::Tickle => self.send_keepalive().await,
                Event::KeepaliveExpired => {
                    info!("No response to keepalive request, closing");
                    self.disconnect(KEEPALIVE_CLOSE_CODE, "No response to keepalive request", true)
                        .await;
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn next_id(&self) -> u64 {
        loop {
            let id = rand::random::<u64>();
            if !self.pending.contains_key(&id) && self.keepalive_probe != Some(id) {
                return id;
            }
        }
    }

    async fn connect(&mut self) -> Result<(), NetworkError> {
        if self.connected {
            self.disconnect(1000, "Reconnecting", false).await;
        }
        self.connect_count += 1;

        let jitter = rand::random::<f64>();
        if let Some(delay) =
            self.options
                .reconnect
                .delay(self.last_lifetime, self.connect_count, jitter)
        {
            info!(
                "Throttling reconnect attempt {} by {:?}",
                self.connect_count, delay
            );
            self.set_state(ConnectionState::Reconnecting {
                attempt: self.connect_count,
            });
            sleep(delay).await;
        }

        if self.connect_count > 1 {
            self.set_state(ConnectionState::Reconnecting {
                attempt: self.connect_count,
            });
        } else {
            self.set_state(ConnectionState::Connecting);
        }

        let config = self.options.transport.clone();
        match self.transport.connect(&config).await {
            Ok(()) => {
                debug!("Socket connected");
                self.connected = true;
                self.opened_at = Some(Instant::now());
                self.set_state(ConnectionState::Connected);
                let _ = self.events.send(SocketEvent::Connected);
                self.reset_keepalive();
                self.flush_queue().await;
                Ok(())
            }
            Err(e) => {
                warn!("Socket connect failed: {}", e);
                // A refused connect counts as a zero-length lifetime.
                self.last_lifetime = Some(Duration::ZERO);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Drops the live connection and fails the requests written to it.
    async fn disconnect(&mut self, code: u16, reason: &str, notify: bool) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Err(e) = self.transport.disconnect(code, reason).await {
            debug!("Error while closing transport: {}", e);
        }
        self.last_lifetime = self.opened_at.take().map(|opened| opened.elapsed());
        self.next_tickle = None;
        self.keepalive_deadline = None;
        self.keepalive_probe = None;

        let lost: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.transmitted)
            .map(|(id, _)| *id)
            .collect();
        for id in lost {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(NetworkError::ConnectionClosed));
            }
        }

        self.set_state(ConnectionState::Disconnected);
        if notify {
            let _ = self.events.send(SocketEvent::Closed {
                code,
                reason: reason.to_string(),
            });
        }
    }

    async fn shutdown(&mut self) {
        self.disconnect(1000, "Shutdown", true).await;
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(NetworkError::Shutdown));
        }
        self.queue.clear();
        self.set_state(ConnectionState::Closed);
    }

    /// Writes a frame, or queues it while disconnected.
    async fn transmit(&mut self, message: WireMessage) {
        if !self.connected {
            self.queue.push_back(message);
            return;
        }
        if let Err(e) = self.write(message).await {
            if e.is_disconnect() {
                self.disconnect(ABNORMAL_CLOSE_CODE, &e.to_string(), true).await;
            }
        }
    }

    /// Writes one frame to the live connection. On a connection failure the
    /// frame is queued again for the next connect.
    async fn write(&mut self, message: WireMessage) -> Result<(), NetworkError> {
        match self.transport.send(&message).await {
            Ok(()) => {
                if let WireMessage::Request(request) = &message {
                    if let Some(pending) = self.pending.get_mut(&request.id) {
                        pending.transmitted = true;
                    }
                }
                Ok(())
            }
            Err(e) if e.is_disconnect() => {
                self.queue.push_front(message);
                Err(e)
            }
            Err(e) => {
                warn!("Dropping frame that could not be written: {}", e);
                if let WireMessage::Request(request) = &message {
                    if let Some(pending) = self.pending.remove(&request.id) {
                        let _ = pending.reply.send(Err(e.clone()));
                    }
                }
                Err(e)
            }
        }
    }

    async fn flush_queue(&mut self) {
        while self.connected {
            let Some(message) = self.queue.pop_front() else {
                break;
            };
            warn!("Dequeuing deferred {}", describe(&message));
            if let Err(e) = self.write(message).await {
                if e.is_disconnect() {
                    self.disconnect(ABNORMAL_CLOSE_CODE, &e.to_string(), true).await;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Result<Option<WireMessage>, NetworkError>) {
        match frame {
            Ok(Some(message)) => {
                self.reset_keepalive();
                match message {
                    WireMessage::Request(request) => self.dispatch_request(request),
                    WireMessage::Response(response) => self.dispatch_response(response),
                }
            }
            Ok(None) => {}
            Err(NetworkError::InvalidMessage(reason)) => {
                error!("Discarding invalid frame: {}", reason);
            }
            Err(e) => {
                info!("Socket connection lost: {}", e);
                self.disconnect(ABNORMAL_CLOSE_CODE, &e.to_string(), true).await;
            }
        }
    }

    fn dispatch_request(&self, request: WireRequest) {
        let incoming = IncomingRequest {
            id: request.id,
            verb: request.verb,
            path: request.path,
            body: request.body,
            responder: self.responses_tx.clone(),
        };
        if let Err(mpsc::error::SendError(unhandled)) = self.requests.send(incoming) {
            unhandled.respond(404, "Not found");
        }
    }

    fn dispatch_response(&mut self, response: WireResponse) {
        if self.keepalive_probe == Some(response.id) {
            self.keepalive_probe = None;
            if !response.is_success() {
                debug!("Keepalive answered with status {}", response.status);
            }
            return;
        }
        match self.pending.remove(&response.id) {
            Some(pending) => {
                let result = if response.is_success() {
                    Ok(response)
                } else {
                    Err(NetworkError::RequestFailed {
                        status: response.status,
                        message: response.message,
                    })
                };
                let _ = pending.reply.send(result);
            }
            None => error!("Unmatched response id: {}", response.id),
        }
    }

    fn reset_keepalive(&mut self) {
        self.keepalive_deadline = None;
        self.next_tickle = self
            .options
            .keepalive
            .as_ref()
            .map(|keepalive| Instant::now() + keepalive.interval);
    }

    async fn send_keepalive(&mut self) {
        let Some(keepalive) = self.options.keepalive.clone() else {
            self.next_tickle = None;
            return;
        };
        let id = self.next_id();
        self.keepalive_probe = Some(id);
        self.next_tickle = None;
        if keepalive.disconnect {
            self.keepalive_deadline = Some(Instant::now() + keepalive.timeout);
        }
        let probe = WireMessage::Request(WireRequest {
            id,
            verb: "GET".to_string(),
            path: keepalive.path,
            body: None,
        });
        self.transmit(probe).await;
    }
}

fn describe(message: &WireMessage) -> String {
    match message {
        WireMessage::Request(request) => format!("request {} {}", request.verb, request.path),
        WireMessage::Response(response) => format!("response {}", response.id),
    }
}
