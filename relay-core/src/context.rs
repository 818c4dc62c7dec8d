//! Relay Context
//!
//! Handles to the collaborators every component needs. Built once by the
//! application and cloned into the receiver, sender and account manager.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::server::RelayServer;
use crate::session::SessionCipher;
use crate::storage::{state_keys, ProtocolStore};

/// Shared collaborators of the relay client.
#[derive(Clone)]
pub struct RelayContext {
    pub store: Arc<dyn ProtocolStore>,
    pub sessions: Arc<dyn SessionCipher>,
    pub server: Arc<dyn RelayServer>,
    pub config: Arc<RelayConfig>,
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("server_url", &self.config.server_url)
            .finish_non_exhaustive()
    }
}

impl RelayContext {
    pub fn new(
        store: Arc<dyn ProtocolStore>,
        sessions: Arc<dyn SessionCipher>,
        server: Arc<dyn RelayServer>,
        config: RelayConfig,
    ) -> Self {
        RelayContext {
            store,
            sessions,
            server,
            config: Arc::new(config),
        }
    }

    /// Our own address, as persisted at registration.
    pub async fn our_addr(&self) -> RelayResult<String> {
        self.store
            .get_state_string(state_keys::ADDR)
            .await?
            .ok_or_else(|| RelayError::InvalidState("not registered: no addr".to_string()))
    }

    /// Our own device id, as persisted at registration.
    pub async fn our_device_id(&self) -> RelayResult<u32> {
        self.store
            .get_state_u32(state_keys::DEVICE_ID)
            .await?
            .ok_or_else(|| RelayError::InvalidState("not registered: no deviceId".to_string()))
    }

    /// Trusts a changed identity key for `addr`.
    pub async fn accept_identity(&self, addr: &str, identity_key: &[u8]) -> RelayResult<()> {
        self.store.remove_identity(addr).await?;
        self.store.save_identity(addr, identity_key).await?;
        Ok(())
    }
}
