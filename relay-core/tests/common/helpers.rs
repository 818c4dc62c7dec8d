//! Test Helpers

use std::sync::{Arc, Mutex};

use relay_core::{CallbackHandler, EventBus, EventKind};

/// Collects every event emitted on `bus`.
pub struct Recorder<E> {
    events: Arc<Mutex<Vec<E>>>,
}

impl<E: Clone> Recorder<E> {
    pub fn events(&self) -> Vec<E> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn record<E: EventKind + Clone>(bus: &EventBus<E>) -> Recorder<E> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.subscribe_all(Arc::new(CallbackHandler::new(move |event: &E| {
        sink.lock().unwrap().push(event.clone());
    })));
    Recorder { events }
}

/// Routes `tracing` output through the test harness. Safe to call twice.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
