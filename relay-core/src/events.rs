//! Event System
//!
//! Typed event buses for the receiver, sender and account manager. Each
//! component owns an [`EventBus`] over its own closed event enum; handlers
//! subscribe to one variant tag or to everything.
//!
//! Handlers run synchronously during `emit`, in subscription order. That is
//! what makes [`KeyChangeEvent::accept`] meaningful: the emitting component
//! checks for acceptance as soon as `emit` returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::error;

use crate::message::Envelope;

/// Implemented by event enums to expose their variant tag.
pub trait EventKind: Send + Sync + 'static {
    type Kind: Copy + Eq + std::fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Event handler trait.
pub trait EventHandler<E>: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &E);
}

/// Simple callback-based event handler.
pub struct CallbackHandler<F> {
    callback: F,
}

impl<F> CallbackHandler<F> {
    pub fn new(callback: F) -> Self {
        CallbackHandler { callback }
    }
}

impl<E, F> EventHandler<E> for CallbackHandler<F>
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.callback)(event);
    }
}

/// Token returned by [`EventBus::subscribe`]; pass it to
/// [`EventBus::unsubscribe`] to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

struct Registration<E: EventKind> {
    id: u64,
    kind: Option<E::Kind>,
    handler: Arc<dyn EventHandler<E>>,
}

/// Dispatches events of one type to registered handlers.
pub struct EventBus<E: EventKind> {
    handlers: RwLock<Vec<Registration<E>>>,
    next_id: AtomicU64,
}

impl<E: EventKind> Default for EventBus<E> {
    fn default() -> Self {
        EventBus {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E: EventKind> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, kind: Option<E::Kind>, handler: Arc<dyn EventHandler<E>>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(Registration { id, kind, handler }),
            Err(poisoned) => poisoned
                .into_inner()
                .push(Registration { id, kind, handler }),
        }
        Subscription(id)
    }

    /// Registers a handler for one event variant.
    pub fn subscribe(&self, kind: E::Kind, handler: Arc<dyn EventHandler<E>>) -> Subscription {
        self.register(Some(kind), handler)
    }

    /// Registers a handler for every event.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler<E>>) -> Subscription {
        self.register(None, handler)
    }

    /// Registers a closure for one event variant.
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(CallbackHandler::new(callback)))
    }

    /// Removes a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut handlers = match self.handlers.write() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = handlers.len();
        handlers.retain(|registration| registration.id != subscription.0);
        handlers.len() != before
    }

    /// Returns the number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    /// Dispatches an event to every matching handler and returns how many
    /// handlers saw it.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let matching: Vec<Arc<dyn EventHandler<E>>> = match self.handlers.read() {
            Ok(handlers) => handlers
                .iter()
                .filter(|r| r.kind.map_or(true, |k| k == kind))
                .map(|r| r.handler.clone())
                .collect(),
            Err(_) => {
                error!("Event handler list poisoned, dropping {:?} event", kind);
                return 0;
            }
        };
        for handler in &matching {
            handler.on_event(event);
        }
        matching.len()
    }
}

impl<E: EventKind + Clone> EventBus<E> {
    /// Forwards events into a channel, for async consumers.
    ///
    /// Events that need an answer during dispatch (key changes) cannot be
    /// accepted through a channel.
    pub fn channel(&self, kind: Option<E::Kind>) -> (Subscription, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = CallbackHandler::new(move |event: &E| {
            let _ = tx.send(event.clone());
        });
        (self.register(kind, Arc::new(handler)), rx)
    }
}

/// Raised when a peer's identity key no longer matches the trusted one.
///
/// A handler calls [`accept`](KeyChangeEvent::accept) to trust the new key;
/// the emitting component then stores it and retries exactly once.
#[derive(Debug, Clone)]
pub struct KeyChangeEvent {
    pub addr: String,
    pub identity_key: Vec<u8>,
    /// The inbound envelope that triggered the change, if any.
    pub envelope: Option<Envelope>,
    accepted: Arc<AtomicBool>,
}

impl KeyChangeEvent {
    pub fn new(addr: impl Into<String>, identity_key: Vec<u8>, envelope: Option<Envelope>) -> Self {
        KeyChangeEvent {
            addr: addr.into(),
            identity_key,
            envelope,
            accepted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn accept(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }
}

