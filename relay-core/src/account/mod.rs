// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Account Manager
//!
//! Registration of a new account, linking of additional devices in both
//! directions, and the lifecycle of our published prekeys.
//!
//! Registration always ends in the same sequence: persist the device state
//! (which clears sessions and identities from any earlier registration),
//! populate the prekey pool, publish it, then emit
//! [`AccountEvent::Registration`].

mod pool;
mod provision;

pub use pool::KeyProgress;
pub use provision::{DeviceRegistration, ProvisionDelegate};

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{info, warn};

use crate::context::RelayContext;
use crate::crypto::{random_array, SignalingKey};
use crate::error::{RelayError, RelayResult};
use crate::events::{EventBus, EventKind};
use crate::keys::{generate_registration_id, IdentityKeyPair};
use crate::provisioning::{ProvisionMessage, ProvisioningCipher, ProvisioningUrl};
use crate::server::{DeviceInfo, NewDeviceInfo};
use crate::storage::DeviceState;

/// Device names at or above this length are shortened.
const MAX_DEVICE_NAME_LEN: usize = 50;

/// Events emitted by [`AccountManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    /// This device finished registering and published its keys.
    Registration { addr: String, device_id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountEventKind {
    Registration,
}

impl EventKind for AccountEvent {
    type Kind = AccountEventKind;

    fn kind(&self) -> AccountEventKind {
        match self {
            AccountEvent::Registration { .. } => AccountEventKind::Registration,
        }
    }
}

struct Inner {
    ctx: RelayContext,
    events: EventBus<AccountEvent>,
}

/// Account and key lifecycle.
#[derive(Clone)]
pub struct AccountManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager").finish_non_exhaustive()
    }
}

impl AccountManager {
    pub fn new(ctx: RelayContext) -> Self {
        AccountManager {
            inner: Arc::new(Inner {
                ctx,
                events: EventBus::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventBus<AccountEvent> {
        &self.inner.events
    }

    pub(crate) fn ctx(&self) -> &RelayContext {
        &self.inner.ctx
    }

    /// Creates a new account with this device as its first device.
    pub async fn register_account(&self, name: &str) -> RelayResult<DeviceState> {
        let ctx = self.ctx();
        let identity = IdentityKeyPair::generate()?;
        let info = new_device_info(name)?;
        let created = ctx.server.create_account(&info).await?;
        info!("Registered account {} as device {}", created.addr, created.device_id);

        let state = DeviceState {
            addr: created.addr,
            device_id: created.device_id,
            name: info.name,
            password: info.password,
            registration_id: info.registration_id,
            signaling_key: info.signaling_key,
            identity,
        };
        self.complete_registration(&state, None).await?;
        Ok(state)
    }

    /// Persists `state`, publishes a fresh prekey pool and announces the
    /// registration.
    pub(crate) async fn complete_registration(
        &self,
        state: &DeviceState,
        progress: Option<KeyProgress<'_>>,
    ) -> RelayResult<()> {
        let ctx = self.ctx();
        ctx.store.save_device_state(state).await?;
        let keys = self.generate_keys(progress).await?;
        ctx.server.register_keys(&keys).await?;
        self.inner.events.emit(&AccountEvent::Registration {
            addr: state.addr.clone(),
            device_id: state.device_id,
        });
        Ok(())
    }

    /// Sends our identity to a device waiting on provisioning channel `uuid`.
    ///
    /// Returns `false` when the channel was already serviced by another of
    /// our devices.
    pub async fn link_device(&self, uuid: &str, their_public_key: &[u8]) -> RelayResult<bool> {
        let ctx = self.ctx();
        let provisioning_code = ctx.server.get_link_device_verification_code().await?;
        let identity = ctx
            .store
            .get_our_identity()
            .await?
            .ok_or_else(|| RelayError::InvalidState("no identity key to link with".to_string()))?;
        let message = ProvisionMessage {
            identity_key_private: identity.private_key().to_vec(),
            addr: ctx.our_addr().await?,
            provisioning_code,
            user_agent: ctx.config.user_agent.clone(),
        };
        let envelope = ProvisioningCipher::encrypt(their_public_key, &message)?;

        match ctx.server.put_provisioning(uuid, &envelope).await {
            Ok(()) => {
                info!("Provisioned device on channel {}", uuid);
                Ok(true)
            }
            Err(e) if e.status() == Some(404) => {
                warn!("Provisioning channel {} already serviced", uuid);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// [`link_device`](Self::link_device) from a scanned provisioning link.
    pub async fn link_device_url(&self, link: &str) -> RelayResult<bool> {
        let url = ProvisioningUrl::parse(link)?;
        let public_key = url.public_key_bytes()?;
        self.link_device(&url.uuid, &public_key).await
    }

    pub async fn devices(&self) -> RelayResult<Vec<DeviceInfo>> {
        self.ctx().server.get_devices().await
    }

    pub async fn delete_device(&self, device_id: u32) -> RelayResult<()> {
        info!("Deleting device {}", device_id);
        self.ctx().server.delete_device(device_id).await
    }
}

/// Fresh credentials for a device about to register.
pub(crate) fn new_device_info(name: &str) -> RelayResult<NewDeviceInfo> {
    let mut password = BASE64.encode(random_array::<16>()?);
    password.truncate(password.len() - 2);
    Ok(NewDeviceInfo {
        name: make_device_name(name),
        registration_id: generate_registration_id()?,
        password,
        signaling_key: SignalingKey::generate()?,
    })
}

/// Shortens long device names to 45 characters followed by `...)`.
pub fn make_device_name(name: &str) -> String {
    if name.chars().count() < MAX_DEVICE_NAME_LEN {
        return name.to_string();
    }
    let mut short: String = name.chars().take(45).collect();
    short.push_str("...)");
    short
}
