//! Busy/Idle Tracking
//!
//! The receiver is busy while envelopes are being processed and becomes idle
//! a debounce interval after the last one finished. Callers await
//! [`Activity::idle`] to defer low-priority work during bursts.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receiver activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Idle,
    Busy,
}

/// Debounced busy/idle state machine.
#[derive(Debug)]
pub struct Activity {
    state: watch::Sender<ActivityState>,
    debounce: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Activity {
    /// Starts busy; the first idle signal settles it.
    pub fn new(debounce: Duration) -> Self {
        let (state, _) = watch::channel(ActivityState::Busy);
        Activity {
            state,
            debounce,
            timer: Mutex::new(None),
        }
    }

    fn cancel_timer(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }

    /// Marks the receiver busy and cancels any pending idle transition.
    pub fn set_busy(&self) {
        self.cancel_timer();
        self.state.send_if_modified(|state| {
            if *state == ActivityState::Busy {
                return false;
            }
            debug!("Message Receiver Busy");
            *state = ActivityState::Busy;
            true
        });
    }

    /// Schedules the idle transition after the debounce interval.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_idle(&self) {
        self.cancel_timer();
        if self.state() == ActivityState::Idle {
            return;
        }
        let state = self.state.clone();
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            debug!("Message Receiver Idle");
            state.send_replace(ActivityState::Idle);
        });
        if let Ok(mut timer) = self.timer.lock() {
            *timer = Some(handle);
        }
    }

    pub fn state(&self) -> ActivityState {
        *self.state.borrow()
    }

    /// Resolves once the receiver is idle.
    pub async fn idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ActivityState::Idle).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<ActivityState> {
        self.state.subscribe()
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
