// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Receiver
//!
//! Turns server-pushed requests (socket mode) or polled pages (polling mode)
//! into decrypted events. Envelope handling is serialized: one envelope is
//! fully processed before the next starts, whichever path delivered it.
//!
//! # Example
//!
//! ```ignore
//! let receiver = MessageReceiver::with_socket(ctx, identity, WebSocketTransport::new())?;
//! receiver.events().on(ReceiverEventKind::Message, |event| { /* ... */ });
//! receiver.connect().await?;
//! ```

mod activity;
mod events;

pub use activity::{Activity, ActivityState};
pub use events::{
    ErrorEvent, FetchedAttachment, MessageEvent, MessageOrigin, ReadEvent, ReceiverEvent,
    ReceiverEventKind,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::Address;
use crate::context::RelayContext;
use crate::crypto::{decrypt_attachment, SignalingKey};
use crate::error::{RelayError, RelayResult};
use crate::events::{EventBus, KeyChangeEvent};
use crate::message::{
    AttachmentPointer, Content, DataMessage, Envelope, EnvelopeType, SentTranscript, SyncKind,
    SyncMessage,
};
use crate::network::{IncomingRequest, IncomingRequests, RelaySocket, SocketEvent, Transport};
use crate::padding::unpad;
use crate::session::SessionError;
use crate::storage::{state_keys, ProtocolStore};

/// Path of server-pushed envelopes.
pub const MESSAGE_PATH: &str = "/api/v1/message";

/// Path the server hits once its queue for us is drained.
pub const QUEUE_EMPTY_PATH: &str = "/api/v1/queue/empty";

/// How envelopes reach the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverMode {
    /// Pushed over the message socket.
    Socket,
    /// Fetched on demand with [`MessageReceiver::drain`].
    Polling,
}

/// Who we receive as.
#[derive(Debug, Clone)]
pub struct ReceiverIdentity {
    pub addr: String,
    pub device_id: u32,
    pub signaling_key: SignalingKey,
}

impl ReceiverIdentity {
    /// Reads our registration out of the store.
    pub async fn load(store: &dyn ProtocolStore) -> RelayResult<Self> {
        let missing = |key: &str| RelayError::InvalidState(format!("not registered: no {key}"));
        let addr = store
            .get_state_string(state_keys::ADDR)
            .await?
            .ok_or_else(|| missing(state_keys::ADDR))?;
        let device_id = store
            .get_state_u32(state_keys::DEVICE_ID)
            .await?
            .ok_or_else(|| missing(state_keys::DEVICE_ID))?;
        let encoded = store
            .get_state_string(state_keys::SIGNALING_KEY)
            .await?
            .ok_or_else(|| missing(state_keys::SIGNALING_KEY))?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| RelayError::Decode(format!("signaling key: {e}")))?;
        Ok(ReceiverIdentity {
            addr,
            device_id,
            signaling_key: SignalingKey::from_bytes(&bytes)?,
        })
    }
}

struct Inner {
    ctx: RelayContext,
    identity: ReceiverIdentity,
    events: EventBus<ReceiverEvent>,
    activity: Activity,
    socket: Option<RelaySocket>,
    closing: AtomicBool,
    connecting: Mutex<()>,
    handling: Mutex<()>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Incoming envelope pipeline.
#[derive(Clone)]
pub struct MessageReceiver {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("addr", &self.inner.identity.addr)
            .field("device_id", &self.inner.identity.device_id)
            .field("mode", &self.mode())
            .finish()
    }
}

impl MessageReceiver {
    fn build(ctx: RelayContext, identity: ReceiverIdentity, socket: Option<RelaySocket>) -> Self {
        let activity = Activity::new(ctx.config.idle_debounce);
        MessageReceiver {
            inner: Arc::new(Inner {
                ctx,
                identity,
                events: EventBus::new(),
                activity,
                socket,
                closing: AtomicBool::new(false),
                connecting: Mutex::new(()),
                handling: Mutex::new(()),
                supervisor: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Receiver in socket mode. The socket is created here but not opened;
    /// call [`connect`](Self::connect).
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_socket<T: Transport>(
        ctx: RelayContext,
        identity: ReceiverIdentity,
        transport: T,
    ) -> RelayResult<Self> {
        let options = ctx.config.message_socket_options()?;
        let (socket, requests) = RelaySocket::new(transport, options);
        let closed = socket.subscribe();
        let receiver = Self::build(ctx, identity, Some(socket));

        tokio::spawn(receiver.clone().request_loop(requests));
        let supervisor = tokio::spawn(receiver.clone().supervise(closed));
        if let Ok(mut slot) = receiver.inner.supervisor.lock() {
            *slot = Some(supervisor);
        }
        Ok(receiver)
    }

    /// Receiver in polling mode; envelopes arrive through [`drain`](Self::drain).
    pub fn polling(ctx: RelayContext, identity: ReceiverIdentity) -> Self {
        Self::build(ctx, identity, None)
    }

    pub fn mode(&self) -> ReceiverMode {
        if self.inner.socket.is_some() {
            ReceiverMode::Socket
        } else {
            ReceiverMode::Polling
        }
    }

    pub fn events(&self) -> &EventBus<ReceiverEvent> {
        &self.inner.events
    }

    pub fn activity(&self) -> &Activity {
        &self.inner.activity
    }

    /// Resolves once no envelope has been handled for the idle debounce.
    pub async fn idle(&self) {
        self.inner.activity.idle().await
    }

    pub fn socket(&self) -> Option<&RelaySocket> {
        self.inner.socket.as_ref()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ReceiverEvent) {
        self.inner.events.emit(&event);
    }

    fn emit_error(&self, error: RelayError, envelope: Option<Envelope>) {
        self.emit(ReceiverEvent::Error(ErrorEvent {
            error: Arc::new(error),
            envelope,
        }));
    }

    // === Connection lifecycle ===

    /// Opens the message socket, retrying until it connects or the receiver
    /// is closed. Concurrent calls share the in-flight attempt.
    pub async fn connect(&self) -> RelayResult<()> {
        let socket = self.inner.socket.as_ref().ok_or_else(|| {
            RelayError::InvalidState("connect is invalid in polling mode".to_string())
        })?;
        if self.is_closing() {
            return Err(RelayError::InvalidState("receiver is closed".to_string()));
        }

        let _guard = match self.inner.connecting.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Duplicate connect detected");
                self.inner.connecting.lock().await
            }
        };
        if socket.is_connected() {
            return Ok(());
        }

        let mut attempts = 0u32;
        while !self.is_closing() {
            match socket.connect().await {
                Ok(()) => {
                    if attempts > 0 {
                        info!("Reconnected websocket after {} attempts", attempts);
                    }
                    return Ok(());
                }
                Err(e) if self.is_closing() => {
                    debug!("Connect abandoned while closing: {}", e);
                    break;
                }
                Err(e) => {
                    attempts += 1;
                    self.check_registration().await;
                    warn!("Connect problem ({} attempts): {}", attempts, e);
                }
            }
        }
        Err(RelayError::Cancelled)
    }

    /// Closes the socket for good. Pending connect loops stop.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        if let Some(socket) = &self.inner.socket {
            socket.shutdown().await;
        }
        let supervisor = self.inner.supervisor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = supervisor {
            handle.abort();
        }
    }

    /// Surfaces auth problems behind a failed or lost connection.
    /// Network errors are expected here and stay silent.
    pub async fn check_registration(&self) {
        match self.inner.ctx.server.get_devices().await {
            Ok(_) => {}
            Err(e) if e.is_network() => debug!("Registration check skipped: {}", e),
            Err(e) => {
                error!("Invalid network state: {}", e);
                self.emit_error(e, None);
            }
        }
    }

    async fn supervise(self, mut socket_events: broadcast::Receiver<SocketEvent>) {
        loop {
            match socket_events.recv().await {
                Ok(SocketEvent::Connected) => debug!("Message socket connected"),
                Ok(SocketEvent::Closed { code, reason }) => {
                    if self.is_closing() {
                        break;
                    }
                    warn!("Websocket closed: {} {}", code, reason);
                    self.check_registration().await;
                    if let Err(e) = self.connect().await {
                        debug!("Reconnect ended: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Missed {} socket events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn request_loop(self, mut requests: IncomingRequests) {
        while let Some(request) = requests.recv().await {
            if let Err(e) = self.handle_request(request).await {
                error!("Websocket request failed: {}", e);
            }
        }
        debug!("Message receiver request loop ended");
    }

    // === Socket requests ===

    async fn handle_request(&self, request: IncomingRequest) -> RelayResult<()> {
        if request.path == QUEUE_EMPTY_PATH && request.verb == "GET" {
            debug!("Websocket queue empty");
            request.respond(200, "OK");
            self.inner.activity.set_idle();
            return Ok(());
        }
        if request.path != MESSAGE_PATH || request.verb != "PUT" {
            error!("Invalid WebSocket resource received: {} {}", request.verb, request.path);
            let reason = format!("Invalid WebSocket resource received: {} {}", request.verb, request.path);
            request.respond(400, "Invalid Resource");
            self.emit_error(RelayError::ProtocolViolation(reason.clone()), None);
            return Err(RelayError::ProtocolViolation(reason));
        }

        self.inner.activity.set_busy();
        let result = self.handle_pushed(request).await;
        self.inner.activity.set_idle();
        result
    }

    async fn handle_pushed(&self, request: IncomingRequest) -> RelayResult<()> {
        let envelope = match self.open_pushed(request.body.as_deref()) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Error handling incoming message: {}", e);
                request.respond(500, "Bad encrypted websocket message");
                let err = RelayError::ProtocolViolation(format!("bad websocket message: {e}"));
                self.emit_error(e, None);
                return Err(err);
            }
        };

        if let EnvelopeType::Other(other) = envelope.envelope_type {
            request.respond(500, "Bad encrypted websocket message");
            self.emit_error(RelayError::UnknownEnvelopeType(other), Some(envelope));
            return Err(RelayError::UnknownEnvelopeType(other));
        }

        let result = self.handle_envelope(envelope).await;
        request.respond(200, "OK");
        result
    }

    fn open_pushed(&self, body: Option<&[u8]>) -> RelayResult<Envelope> {
        let body = body.ok_or_else(|| RelayError::Decode("message request without body".to_string()))?;
        let plaintext = self.inner.identity.signaling_key.decrypt(body)?;
        Envelope::decode(&plaintext)
    }

    // === Polling ===

    /// Fetches and handles queued envelopes until the server reports no
    /// more, deleting each after handling. Returns how many were handled.
    pub async fn drain(&self) -> RelayResult<usize> {
        if self.inner.socket.is_some() {
            return Err(RelayError::InvalidState(
                "drain is invalid when the message socket is in use".to_string(),
            ));
        }
        self.inner.activity.set_busy();
        let result = self.drain_pages().await;
        self.inner.activity.set_idle();
        result
    }

    async fn drain_pages(&self) -> RelayResult<usize> {
        let server = &self.inner.ctx.server;
        let mut handled = 0;
        loop {
            let page = server.get_messages().await?;
            let mut handled_keys = Vec::with_capacity(page.messages.len());
            for envelope in page.messages {
                handled_keys.push((envelope.source.clone(), envelope.timestamp));
                if let Err(e) = self.handle_envelope(envelope).await {
                    warn!("Dropping queued envelope: {}", e);
                }
            }
            handled += handled_keys.len();
            let deletes = handled_keys
                .iter()
                .map(|(source, timestamp)| server.delete_message(source, *timestamp));
            for result in join_all(deletes).await {
                result?;
            }
            if !page.more {
                break;
            }
        }
        Ok(handled)
    }

    // === Envelopes ===

    /// Runs one envelope through decryption and dispatch.
    ///
    /// Failures during dispatch become [`ReceiverEvent::Error`]; the returned
    /// error covers envelopes that could not be dispatched at all and
    /// declined key changes.
    pub async fn handle_envelope(&self, envelope: Envelope) -> RelayResult<()> {
        let _serial = self.inner.handling.lock().await;

        if self.inner.ctx.store.is_blocked(&envelope.source).await? {
            warn!("Dropping message from blocked address: {}", envelope.source);
            return Ok(());
        }
        if envelope.envelope_type != EnvelopeType::Receipt
            && envelope.content.is_none()
            && envelope.legacy_message.is_none()
        {
            return Err(RelayError::ProtocolViolation(
                "envelope has neither content nor legacy message".to_string(),
            ));
        }

        let mut key_change = false;
        loop {
            match self.dispatch(&envelope, key_change).await {
                Ok(()) => return Ok(()),
                Err(RelayError::Session(SessionError::MessageCounter(reason))) => {
                    warn!("Ignoring duplicate message: {}", reason);
                    return Ok(());
                }
                Err(RelayError::IncomingIdentityKey { addr, identity_key }) if !key_change => {
                    let event =
                        KeyChangeEvent::new(addr.clone(), identity_key.clone(), Some(envelope.clone()));
                    self.emit(ReceiverEvent::KeyChange(event.clone()));
                    if !event.is_accepted() {
                        info!("Identity change for {} not accepted", addr);
                        return Err(RelayError::IncomingIdentityKey { addr, identity_key });
                    }
                    self.inner.ctx.accept_identity(&addr, &identity_key).await?;
                    key_change = true;
                }
                Err(e) => {
                    error!("Envelope handling failed: {}", e);
                    self.emit_error(e, Some(envelope));
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&self, envelope: &Envelope, key_change: bool) -> RelayResult<()> {
        if envelope.envelope_type == EnvelopeType::Receipt {
            self.emit(ReceiverEvent::Receipt(envelope.clone()));
            return Ok(());
        }
        if let Some(ciphertext) = &envelope.content {
            let plaintext = self.decrypt(envelope, ciphertext).await?;
            let content = Content::decode(&plaintext)?;
            if let Some(sync) = content.sync_message {
                return self.handle_sync(envelope, sync, key_change).await;
            }
            if let Some(message) = content.data_message {
                return self.handle_data_message(envelope, message, key_change).await;
            }
            return Err(RelayError::ProtocolViolation("empty content".to_string()));
        }
        if let Some(ciphertext) = &envelope.legacy_message {
            let plaintext = self.decrypt(envelope, ciphertext).await?;
            let message = DataMessage::decode(&plaintext)?;
            return self.handle_data_message(envelope, message, key_change).await;
        }
        Err(RelayError::ProtocolViolation(
            "envelope has neither content nor legacy message".to_string(),
        ))
    }

    async fn decrypt(&self, envelope: &Envelope, ciphertext: &[u8]) -> RelayResult<Vec<u8>> {
        let sessions = &self.inner.ctx.sessions;
        let addr = envelope.source_address();
        let plaintext = match envelope.envelope_type {
            EnvelopeType::Ciphertext => sessions.decrypt_whisper(&addr, ciphertext).await,
            EnvelopeType::PrekeyBundle => sessions.decrypt_prekey_whisper(&addr, ciphertext).await,
            other => return Err(RelayError::UnknownEnvelopeType(other.into())),
        }
        .map_err(|e| match e {
            SessionError::UntrustedIdentity { addr, identity_key } => {
                RelayError::IncomingIdentityKey { addr, identity_key }
            }
            other => RelayError::Session(other),
        })?;
        Ok(unpad(&plaintext)?.to_vec())
    }

    // === Sync messages ===

    async fn handle_sync(
        &self,
        envelope: &Envelope,
        sync: SyncMessage,
        key_change: bool,
    ) -> RelayResult<()> {
        let identity = &self.inner.identity;
        if envelope.source != identity.addr {
            return Err(RelayError::ProtocolViolation(
                "Received sync message from another addr".to_string(),
            ));
        }
        if envelope.source_device == identity.device_id {
            return Err(RelayError::ProtocolViolation(
                "Received sync message from our own device".to_string(),
            ));
        }

        match sync.kind() {
            SyncKind::Sent(sent) => self.handle_sent(envelope, sent, key_change).await,
            SyncKind::Read(entries) => {
                for entry in entries {
                    self.emit(ReceiverEvent::Read(ReadEvent {
                        envelope_timestamp: envelope.timestamp,
                        timestamp: entry.timestamp,
                        sender: entry.sender.clone(),
                        source: envelope.source.clone(),
                        source_device: envelope.source_device,
                    }));
                }
                Ok(())
            }
            SyncKind::Deprecated(name) => {
                error!("Deprecated sync message: {}", name);
                Err(RelayError::DeprecatedFeature(format!("{name} sync message")))
            }
            SyncKind::Empty => {
                error!("Empty sync message");
                Ok(())
            }
        }
    }

    async fn handle_sent(
        &self,
        envelope: &Envelope,
        sent: &SentTranscript,
        key_change: bool,
    ) -> RelayResult<()> {
        if sent.message.is_end_session() {
            error!("Unsupported end-session sync from our own device");
            return Ok(());
        }
        check_group(&sent.message)?;
        let attachments = self.fetch_attachments(&sent.message.attachments).await;
        self.emit(ReceiverEvent::Message(MessageEvent {
            source: envelope.source.clone(),
            source_device: envelope.source_device,
            timestamp: sent.timestamp,
            message: sent.message.clone(),
            attachments,
            key_change,
            origin: MessageOrigin::SelfSent {
                destination: sent.destination.clone(),
                expiration_start_timestamp: sent.expiration_start_timestamp,
            },
        }));
        Ok(())
    }

    // === Data messages ===

    async fn handle_data_message(
        &self,
        envelope: &Envelope,
        message: DataMessage,
        key_change: bool,
    ) -> RelayResult<()> {
        if message.is_end_session() {
            self.handle_end_session(&envelope.source, Some(envelope.source_device))
                .await?;
        }
        check_group(&message)?;
        let attachments = self.fetch_attachments(&message.attachments).await;
        self.emit(ReceiverEvent::Message(MessageEvent {
            source: envelope.source.clone(),
            source_device: envelope.source_device,
            timestamp: envelope.timestamp,
            message,
            attachments,
            key_change,
            origin: MessageOrigin::Peer,
        }));
        Ok(())
    }

    /// Closes our sessions with `addr`: one device, or all of them.
    pub async fn handle_end_session(&self, addr: &str, device_id: Option<u32>) -> RelayResult<()> {
        let device_ids = match device_id {
            Some(id) => vec![id],
            None => self.inner.ctx.store.device_ids(addr).await?,
        };
        info!("Closing {} session(s) for {}", device_ids.len(), addr);
        for id in device_ids {
            self.inner
                .ctx
                .sessions
                .close_open_session(&Address::device(addr, id))
                .await?;
        }
        Ok(())
    }

    async fn fetch_attachments(&self, pointers: &[AttachmentPointer]) -> Vec<FetchedAttachment> {
        join_all(pointers.iter().map(|pointer| self.fetch_attachment(pointer))).await
    }

    async fn fetch_attachment(&self, pointer: &AttachmentPointer) -> FetchedAttachment {
        let fetched = async {
            let encrypted = self.inner.ctx.server.get_attachment(&pointer.id).await?;
            Ok::<_, RelayError>(decrypt_attachment(&encrypted, &pointer.key)?)
        }
        .await;
        match fetched {
            Ok(data) => FetchedAttachment::Ready {
                pointer: pointer.clone(),
                data,
            },
            Err(e) => {
                warn!("Attachment {} unavailable: {}", pointer.id, e);
                FetchedAttachment::Failed {
                    pointer: pointer.clone(),
                    error: e.to_string(),
                }
            }
        }
    }
}

fn check_group(message: &DataMessage) -> RelayResult<()> {
    if message.group.is_some() {
        return Err(RelayError::ProtocolViolation("Legacy group message".to_string()));
    }
    Ok(())
}
