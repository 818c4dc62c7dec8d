//! Outgoing Message
//!
//! One logical send. Holds the immutable timestamp and content plus an
//! append-only delivery log with exactly one terminal entry per address.
//! A self-sync job is attached to its parent so both share one result.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::events::{EventBus, EventKind};
use crate::message::Content;

/// Successful delivery to one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEntry {
    pub addr: String,
    pub timestamp: u64,
}

/// Terminal failure for one address.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub addr: String,
    pub reason: String,
    pub error: Arc<RelayError>,
    pub timestamp: u64,
}

/// Entries appended to an [`OutgoingMessage`] log.
#[derive(Debug, Clone)]
pub enum OutgoingEvent {
    Sent(SentEntry),
    Error(ErrorEntry),
}

impl OutgoingEvent {
    pub fn addr(&self) -> &str {
        match self {
            OutgoingEvent::Sent(entry) => &entry.addr,
            OutgoingEvent::Error(entry) => &entry.addr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutgoingEventKind {
    Sent,
    Error,
}

impl EventKind for OutgoingEvent {
    type Kind = OutgoingEventKind;

    fn kind(&self) -> OutgoingEventKind {
        match self {
            OutgoingEvent::Sent(_) => OutgoingEventKind::Sent,
            OutgoingEvent::Error(_) => OutgoingEventKind::Error,
        }
    }
}

#[derive(Default)]
struct DeliveryLog {
    sent: Vec<SentEntry>,
    errors: Vec<ErrorEntry>,
    settled: BTreeSet<String>,
}

struct Inner {
    timestamp: u64,
    content: Content,
    expected: BTreeSet<String>,
    log: Mutex<DeliveryLog>,
    events: EventBus<OutgoingEvent>,
    parent: Option<OutgoingMessage>,
    complete: watch::Sender<bool>,
}

/// A send job and its delivery log.
#[derive(Clone)]
pub struct OutgoingMessage {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("timestamp", &self.inner.timestamp)
            .field("expected", &self.inner.expected)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl OutgoingMessage {
    /// Creates a job expecting one terminal entry for each of `addrs`.
    pub fn new(timestamp: u64, content: Content, addrs: impl IntoIterator<Item = String>) -> Self {
        Self::build(timestamp, content, addrs, None)
    }

    /// Creates a job whose entries are also appended to `parent`.
    pub fn child_of(
        parent: &OutgoingMessage,
        content: Content,
        addrs: impl IntoIterator<Item = String>,
    ) -> Self {
        Self::build(parent.timestamp(), content, addrs, Some(parent.clone()))
    }

    fn build(
        timestamp: u64,
        content: Content,
        addrs: impl IntoIterator<Item = String>,
        parent: Option<OutgoingMessage>,
    ) -> Self {
        let expected: BTreeSet<String> = addrs.into_iter().collect();
        let (complete, _) = watch::channel(expected.is_empty());
        OutgoingMessage {
            inner: Arc::new(Inner {
                timestamp,
                content,
                expected,
                log: Mutex::new(DeliveryLog::default()),
                events: EventBus::new(),
                parent,
                complete,
            }),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.inner.timestamp
    }

    pub fn content(&self) -> &Content {
        &self.inner.content
    }

    pub fn events(&self) -> &EventBus<OutgoingEvent> {
        &self.inner.events
    }

    /// Addresses this job expects an outcome for.
    pub fn addrs(&self) -> Vec<String> {
        self.inner.expected.iter().cloned().collect()
    }

    pub fn sent(&self) -> Vec<SentEntry> {
        self.inner
            .log
            .lock()
            .map(|log| log.sent.clone())
            .unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.inner
            .log
            .lock()
            .map(|log| log.errors.clone())
            .unwrap_or_default()
    }

    /// Expected addresses without a terminal entry yet.
    pub fn pending(&self) -> Vec<String> {
        match self.inner.log.lock() {
            Ok(log) => self
                .inner
                .expected
                .difference(&log.settled)
                .cloned()
                .collect(),
            Err(_) => self.addrs(),
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.complete.borrow()
    }

    /// Resolves once every expected address has a terminal entry.
    pub async fn wait(&self) {
        let mut rx = self.inner.complete.subscribe();
        let _ = rx.wait_for(|complete| *complete).await;
    }

    pub(crate) fn record_sent(&self, addr: &str) {
        let entry = SentEntry {
            addr: addr.to_string(),
            timestamp: self.inner.timestamp,
        };
        self.record(OutgoingEvent::Sent(entry));
    }

    pub(crate) fn record_error(&self, addr: &str, reason: &str, error: Arc<RelayError>) {
        warn!("Send to {} failed: {}: {}", addr, reason, error);
        let entry = ErrorEntry {
            addr: addr.to_string(),
            reason: reason.to_string(),
            error,
            timestamp: self.inner.timestamp,
        };
        self.record(OutgoingEvent::Error(entry));
    }

    fn record(&self, event: OutgoingEvent) {
        let complete = {
            let Ok(mut log) = self.inner.log.lock() else {
                return;
            };
            if !log.settled.insert(event.addr().to_string()) {
                debug!("Ignoring second outcome for {}", event.addr());
                return;
            }
            match &event {
                OutgoingEvent::Sent(entry) => log.sent.push(entry.clone()),
                OutgoingEvent::Error(entry) => log.errors.push(entry.clone()),
            }
            self.inner.expected.is_subset(&log.settled)
        };

        if let Some(parent) = &self.inner.parent {
            parent.record(event.clone());
        }
        self.inner.events.emit(&event);
        if complete {
            self.inner.complete.send_replace(true);
        }
    }
}
