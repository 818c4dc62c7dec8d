//! Message Sender
//!
//! Builds the content of a logical send, uploads its attachments and fans it
//! out to every addressed device. Jobs for the same address run one at a
//! time; different addresses proceed concurrently.
//!
//! When our own address is among the recipients, a sync copy goes to our
//! other devices and its outcome lands in the same [`OutgoingMessage`].

mod fanout;
mod lanes;
mod outgoing;

pub use outgoing::{ErrorEntry, OutgoingEvent, OutgoingEventKind, OutgoingMessage, SentEntry};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::context::RelayContext;
use crate::crypto::{encrypt_attachment, random_array, random_bytes, ATTACHMENT_KEY_LEN};
use crate::error::{RelayError, RelayResult};
use crate::events::{CallbackHandler, EventBus, EventKind, KeyChangeEvent};
use crate::message::{AttachmentPointer, Content, DataMessage, ReadEntry, SentTranscript, SyncMessage};
use crate::padding::pad;
use fanout::{AbortSignal, Fanout};
use lanes::Lanes;

/// Thread id carried by session-reset control messages.
const CONTROL_THREAD_ID: &str = "deadbeef-1111-2222-3333-000000000000";

/// Events emitted by [`MessageSender`].
#[derive(Debug, Clone)]
pub enum SenderEvent {
    /// A recipient's identity key changed while encrypting. Accept to retry.
    KeyChange(KeyChangeEvent),
    Sent(SentEntry),
    Error(ErrorEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderEventKind {
    KeyChange,
    Sent,
    Error,
}

impl EventKind for SenderEvent {
    type Kind = SenderEventKind;

    fn kind(&self) -> SenderEventKind {
        match self {
            SenderEvent::KeyChange(_) => SenderEventKind::KeyChange,
            SenderEvent::Sent(_) => SenderEventKind::Sent,
            SenderEvent::Error(_) => SenderEventKind::Error,
        }
    }
}

impl From<OutgoingEvent> for SenderEvent {
    fn from(event: OutgoingEvent) -> Self {
        match event {
            OutgoingEvent::Sent(entry) => SenderEvent::Sent(entry),
            OutgoingEvent::Error(entry) => SenderEvent::Error(entry),
        }
    }
}

/// An attachment to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingAttachment {
    /// Plaintext to encrypt and upload.
    Data {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    /// Already uploaded; the pointer is reused as is.
    Uploaded(AttachmentPointer),
}

/// A logical message to one thread.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub thread_id: String,
    /// Bare addresses (all devices) or `addr.deviceId` for one device.
    pub addrs: Vec<String>,
    pub timestamp: u64,
    /// Application payload, sent as its JSON text.
    pub body: Option<Value>,
    pub attachments: Vec<OutgoingAttachment>,
    pub flags: u32,
    /// Disappearing-message timer in seconds.
    pub expiration: Option<u32>,
}

impl SendRequest {
    pub fn new(thread_id: impl Into<String>, addrs: Vec<String>, timestamp: u64) -> Self {
        SendRequest {
            thread_id: thread_id.into(),
            addrs,
            timestamp,
            body: None,
            attachments: Vec::new(),
            flags: 0,
            expiration: None,
        }
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn attachment(mut self, attachment: OutgoingAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn expiration(mut self, seconds: u32) -> Self {
        self.expiration = Some(seconds);
        self
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.thread_id.is_empty() {
            return Err(RelayError::Validation("thread id required".to_string()));
        }
        if self.timestamp == 0 {
            return Err(RelayError::Validation("timestamp required".to_string()));
        }
        if self.addrs.is_empty() {
            return Err(RelayError::Validation("at least one addr required".to_string()));
        }
        for addr in &self.addrs {
            addr.parse::<Address>()?;
        }
        Ok(())
    }
}

struct Inner {
    ctx: RelayContext,
    events: Arc<EventBus<SenderEvent>>,
    lanes: Lanes,
}

/// Outgoing message pipeline.
#[derive(Clone)]
pub struct MessageSender {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender").finish_non_exhaustive()
    }
}

impl MessageSender {
    pub fn new(ctx: RelayContext) -> Self {
        MessageSender {
            inner: Arc::new(Inner {
                ctx,
                events: Arc::new(EventBus::new()),
                lanes: Lanes::default(),
            }),
        }
    }

    /// Key changes plus every sent/error entry of every job.
    pub fn events(&self) -> &EventBus<SenderEvent> {
        &self.inner.events
    }

    /// Sends `request` and resolves once every address has an outcome.
    ///
    /// Per-address failures are in the returned job's error log. An invalid
    /// request, an unusable registration or a 401/403 from the server fails
    /// the call.
    pub async fn send(&self, request: SendRequest) -> RelayResult<OutgoingMessage> {
        request.validate()?;
        let ctx = &self.inner.ctx;
        let our_addr = ctx.our_addr().await?;

        let message = self.build_data_message(&request).await?;
        let include_self = request.addrs.iter().any(|a| *a == our_addr);
        let addrs: Vec<String> = dedup(request.addrs.iter().filter(|a| **a != our_addr).cloned());

        let mut expected = addrs.clone();
        if include_self {
            expected.push(our_addr.clone());
        }
        let job = OutgoingMessage::new(request.timestamp, Content::data(message.clone()), expected);
        self.forward_events(&job);

        let mut targets = vec![(job.clone(), addrs)];
        if include_self {
            let transcript = SentTranscript {
                destination: Some(request.thread_id.clone()),
                timestamp: request.timestamp,
                message,
                expiration_start_timestamp: request.expiration.map(|_| now_millis()),
            };
            let sync = Content::sync(SyncMessage {
                sent: Some(transcript),
                ..SyncMessage::default()
            });
            let child = OutgoingMessage::child_of(&job, sync, [our_addr.clone()]);
            targets.push((child, vec![our_addr]));
        }

        self.run(targets).await?;
        Ok(job)
    }

    /// Sends a `SyncMessage.read` batch to our other devices.
    pub async fn sync_read_messages(&self, reads: Vec<ReadEntry>) -> RelayResult<Option<OutgoingMessage>> {
        if reads.is_empty() {
            warn!("No read receipts to sync");
            return Ok(None);
        }
        let our_addr = self.inner.ctx.our_addr().await?;
        let content = Content::sync(SyncMessage {
            read: reads,
            ..SyncMessage::default()
        });
        let job = OutgoingMessage::new(now_millis(), content, [our_addr.clone()]);
        self.forward_events(&job);
        self.run(vec![(job.clone(), vec![our_addr])]).await?;
        Ok(Some(job))
    }

    /// Asks `addr` to reset its sessions with us, then drops ours.
    ///
    /// Local sessions are closed before the END_SESSION message goes out and
    /// again once it has an outcome.
    pub async fn close_session(&self, addr: &str, retransmit: bool) -> RelayResult<OutgoingMessage> {
        info!("Closing sessions with {}", addr);
        let control = json!([{
            "version": 1,
            "messageType": "control",
            "messageId": CONTROL_THREAD_ID,
            "threadId": CONTROL_THREAD_ID,
            "data": {
                "control": "closeSession",
                "retransmit": retransmit,
            },
        }]);
        let message = DataMessage {
            body: Some(serde_json::to_string(&control)?),
            flags: DataMessage::END_SESSION,
            ..DataMessage::default()
        };

        self.close_all_sessions(addr).await?;
        let job = OutgoingMessage::new(now_millis(), Content::data(message), [addr.to_string()]);
        self.forward_events(&job);
        self.run(vec![(job.clone(), vec![addr.to_string()])]).await?;
        self.close_all_sessions(addr).await?;
        Ok(job)
    }

    async fn close_all_sessions(&self, addr: &str) -> RelayResult<()> {
        let ctx = &self.inner.ctx;
        for device_id in ctx.store.device_ids(addr).await? {
            ctx.sessions
                .close_open_session(&Address::device(addr, device_id))
                .await?;
        }
        Ok(())
    }

    async fn build_data_message(&self, request: &SendRequest) -> RelayResult<DataMessage> {
        let body = request
            .body
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let mut attachments = Vec::with_capacity(request.attachments.len());
        for attachment in &request.attachments {
            attachments.push(self.upload_attachment(attachment).await?);
        }
        Ok(DataMessage {
            body,
            attachments,
            flags: request.flags,
            expire_timer: request.expiration.unwrap_or(0),
            group: None,
        })
    }

    /// Encrypts an attachment under a fresh key and uploads it.
    pub async fn upload_attachment(&self, attachment: &OutgoingAttachment) -> RelayResult<AttachmentPointer> {
        let (data, content_type) = match attachment {
            OutgoingAttachment::Uploaded(pointer) => return Ok(pointer.clone()),
            OutgoingAttachment::Data { data, content_type } => (data, content_type),
        };
        let key = random_bytes(ATTACHMENT_KEY_LEN)?;
        let iv = random_array::<16>()?;
        let encrypted = encrypt_attachment(data, &key, &iv)?;
        let id = self.inner.ctx.server.put_attachment(&encrypted).await?;
        debug!("Uploaded attachment {} ({} bytes)", id, encrypted.len());
        Ok(AttachmentPointer {
            id,
            key,
            content_type: content_type.clone(),
        })
    }

    fn forward_events(&self, job: &OutgoingMessage) {
        let events = self.inner.events.clone();
        job.events()
            .subscribe_all(Arc::new(CallbackHandler::new(move |event: &OutgoingEvent| {
                events.emit(&SenderEvent::from(event.clone()));
            })));
    }

    /// Delivers each job to its addresses. A 401/403 anywhere stops every
    /// other delivery and fails the whole run.
    async fn run(&self, targets: Vec<(OutgoingMessage, Vec<String>)>) -> RelayResult<()> {
        let ctx = &self.inner.ctx;
        let our_addr = ctx.our_addr().await?;
        let our_device_id = ctx.our_device_id().await?;
        let fanout = Fanout {
            ctx,
            events: &self.inner.events,
            our_addr: &our_addr,
            our_device_id,
        };
        let abort = AbortSignal::default();

        let deliveries = targets.iter().flat_map(|(job, addrs)| {
            addrs
                .iter()
                .map(|addr| self.deliver_in_lane(&fanout, job, addr, &abort))
        });
        join_all(deliveries).await;

        match abort.into_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn deliver_in_lane(
        &self,
        fanout: &Fanout<'_>,
        job: &OutgoingMessage,
        addr: &str,
        abort: &AbortSignal,
    ) {
        let aborted = abort.notified();
        tokio::select! {
            biased;
            _ = aborted => {}
            _ = self.deliver(fanout, job, addr, abort) => return,
        }
        if let Some(cause) = abort.cause() {
            job.record_error(addr, "Send aborted", cause);
        }
    }

    async fn deliver(
        &self,
        fanout: &Fanout<'_>,
        job: &OutgoingMessage,
        addr: &str,
        abort: &AbortSignal,
    ) {
        let _lane = self.inner.lanes.acquire(addr).await;

        if let Some(cause) = abort.cause() {
            job.record_error(addr, "Send aborted", cause);
            return;
        }

        let padded = match job.content().encode() {
            Ok(plaintext) => pad(&plaintext),
            Err(e) => {
                job.record_error(addr, "Failed to encode message", Arc::new(e));
                return;
            }
        };
        if let Err(cause) = fanout.deliver(job, addr, &padded).await {
            warn!("Aborting send after auth failure: {}", cause);
            abort.raise(cause);
        }
    }
}

fn dedup(addrs: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for addr in addrs {
        if !seen.contains(&addr) {
            seen.push(addr);
        }
    }
    seen
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
