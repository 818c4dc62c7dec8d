//! Per-address send lanes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes work per key while letting different keys run concurrently.
#[derive(Default)]
pub(crate) struct Lanes {
    lanes: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Lanes {
    /// Waits for the lane `key`; the lane is held until the guard drops.
    pub(crate) async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = match self.lanes.lock() {
                Ok(lanes) => lanes,
                Err(poisoned) => poisoned.into_inner(),
            };
            lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
            lanes
                .entry(format!("message-send-job-{key}"))
                .or_default()
                .clone()
        };
        lane.lock_owned().await
    }
}
