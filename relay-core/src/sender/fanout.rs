// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-Address Fan-Out
//!
//! Encrypts one padded plaintext for every known device of an address,
//! submits the batch and reconciles the device list when the server
//! disagrees with it. Reconciliation runs at most once per address; a second
//! mismatch is terminal.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::outgoing::OutgoingMessage;
use super::SenderEvent;
use crate::address::Address;
use crate::context::RelayContext;
use crate::error::{RelayError, RelayResult};
use crate::events::{EventBus, KeyChangeEvent};
use crate::keys::PreKeyBundle;
use crate::message::OutgoingDeviceMessage;
use crate::server::{MismatchedDevices, StaleDevices};
use crate::session::SessionError;

/// Outcome that stops the whole send, not just one address.
pub(crate) type Abort = Arc<RelayError>;

/// First auth failure of a send, shared by all of its deliveries.
#[derive(Default)]
pub(crate) struct AbortSignal {
    cause: Mutex<Option<Abort>>,
    notify: Notify,
}

impl AbortSignal {
    pub(crate) fn cause(&self) -> Option<Abort> {
        self.cause.lock().ok().and_then(|cause| cause.clone())
    }

    /// Keeps the first cause and wakes every delivery still in flight.
    pub(crate) fn raise(&self, cause: Abort) {
        if let Ok(mut slot) = self.cause.lock() {
            slot.get_or_insert(cause);
        }
        self.notify.notify_waiters();
    }

    /// Resolves on the next [`raise`](Self::raise) after this call.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// The error handed back to the caller of the aborted send.
    pub(crate) fn into_error(self) -> Option<RelayError> {
        let cause = self.cause.into_inner().ok().flatten()?;
        Some(match Arc::try_unwrap(cause) {
            Ok(err) => err,
            Err(shared) => match &*shared {
                RelayError::Protocol {
                    code,
                    message,
                    response,
                } => RelayError::Protocol {
                    code: *code,
                    message: message.clone(),
                    response: response.clone(),
                },
                other => RelayError::InvalidState(format!("send aborted: {other}")),
            },
        })
    }
}

pub(crate) struct Fanout<'a> {
    pub ctx: &'a RelayContext,
    pub events: &'a EventBus<SenderEvent>,
    pub our_addr: &'a str,
    pub our_device_id: u32,
}

impl Fanout<'_> {
    fn is_self(&self, addr: &str) -> bool {
        addr == self.our_addr
    }

    /// Known devices of `addr`, never including this device.
    async fn device_ids(&self, addr: &str) -> RelayResult<Vec<u32>> {
        let mut ids = self.ctx.store.device_ids(addr).await?;
        if self.is_self(addr) {
            ids.retain(|id| *id != self.our_device_id);
        }
        Ok(ids)
    }

    /// Delivers to `target`, which is a bare address or one specific device.
    pub(crate) async fn deliver(
        &self,
        job: &OutgoingMessage,
        target: &str,
        padded: &[u8],
    ) -> Result<(), Abort> {
        let address: Address = match target.parse() {
            Ok(address) => address,
            Err(e) => {
                job.record_error(target, "Invalid address", Arc::new(RelayError::Address(e)));
                return Ok(());
            }
        };
        match address.device_id() {
            Some(device_id) => {
                self.send_to_device(job, target, address.user_id(), device_id, padded)
                    .await
            }
            None => self.send_to_addr(job, target, padded).await,
        }
    }

    async fn send_to_addr(
        &self,
        job: &OutgoingMessage,
        addr: &str,
        padded: &[u8],
    ) -> Result<(), Abort> {
        if let Err(e) = self.init_sessions(addr, None).await {
            return fail(job, addr, "Failed to retrieve new device keys", e);
        }

        let mut reconciled = false;
        loop {
            let device_ids = match self.device_ids(addr).await {
                Ok(ids) => ids,
                Err(e) => return fail(job, addr, "Failed to load device list", e),
            };
            let messages = match self.encrypt_all(addr, &device_ids, padded, job.timestamp()).await {
                Ok(messages) => messages,
                Err(e) => return fail(job, addr, "Failed to create message", e),
            };

            let err = match self
                .ctx
                .server
                .send_messages(addr, &messages, job.timestamp())
                .await
            {
                Ok(()) => {
                    job.record_sent(addr);
                    return Ok(());
                }
                Err(e) => e,
            };

            match err.status() {
                Some(404) => {
                    let unregistered = RelayError::UnregisteredUser {
                        addr: addr.to_string(),
                    };
                    return fail(job, addr, "Unregistered user", unregistered);
                }
                Some(409) | Some(410) if reconciled => {
                    let limit = RelayError::RetryLimit(
                        "Hit retry limit attempting to reload device list".to_string(),
                    );
                    return fail(job, addr, "Device list reconciliation failed", limit);
                }
                Some(409) | Some(410) => {
                    reconciled = true;
                    if let Err(e) = self.reconcile(addr, &err, messages.is_empty()).await {
                        return fail(job, addr, "Failed to reload device keys", e);
                    }
                }
                _ => return fail(job, addr, "Failed to send message", err),
            }
        }
    }

    async fn send_to_device(
        &self,
        job: &OutgoingMessage,
        target: &str,
        addr: &str,
        device_id: u32,
        padded: &[u8],
    ) -> Result<(), Abort> {
        if let Err(e) = self.init_sessions(addr, Some(device_id)).await {
            return fail(job, target, "Failed to retrieve new device keys", e);
        }

        let mut reconciled = false;
        loop {
            let message = match self
                .encrypt_for_device(addr, device_id, padded, job.timestamp())
                .await
            {
                Ok(message) => message,
                Err(e) => return fail(job, target, "Failed to create message", e),
            };

            let err = match self
                .ctx
                .server
                .send_messages(addr, std::slice::from_ref(&message), job.timestamp())
                .await
            {
                Ok(()) => {
                    job.record_sent(target);
                    return Ok(());
                }
                Err(e) => e,
            };

            match err.status() {
                Some(404) => {
                    let unregistered = RelayError::UnregisteredUser {
                        addr: target.to_string(),
                    };
                    return fail(job, target, "Unregistered user", unregistered);
                }
                Some(410) if !reconciled => {
                    reconciled = true;
                    let refreshed = async {
                        self.close_session(addr, device_id).await?;
                        self.get_keys_for_addr(addr, Some(vec![device_id])).await
                    }
                    .await;
                    if let Err(e) = refreshed {
                        return fail(job, target, "Failed to reload device keys", e);
                    }
                }
                _ => return fail(job, target, "Failed to send message", err),
            }
        }
    }

    /// Applies a 409 or 410 body to the local device list.
    async fn reconcile(&self, addr: &str, err: &RelayError, no_messages: bool) -> RelayResult<()> {
        let RelayError::Protocol { code, response, .. } = err else {
            return Ok(());
        };
        if *code == 409 {
            let mismatch: MismatchedDevices = serde_json::from_value(response.clone())?;
            info!(
                "Device list for {} drifted: extra {:?}, missing {:?}",
                addr, mismatch.extra_devices, mismatch.missing_devices
            );
            for device_id in &mismatch.extra_devices {
                self.ctx
                    .store
                    .remove_session(&Address::device(addr, *device_id))
                    .await?;
            }
            if !mismatch.missing_devices.is_empty() {
                self.get_keys_for_addr(addr, Some(mismatch.missing_devices))
                    .await?;
            }
        } else {
            let stale: StaleDevices = serde_json::from_value(response.clone())?;
            info!("Stale devices for {}: {:?}", addr, stale.stale_devices);
            for device_id in &stale.stale_devices {
                self.close_session(addr, *device_id).await?;
            }
            let devices = (!no_messages).then_some(stale.stale_devices);
            self.get_keys_for_addr(addr, devices).await?;
        }
        Ok(())
    }

    async fn close_session(&self, addr: &str, device_id: u32) -> RelayResult<()> {
        self.ctx
            .sessions
            .close_open_session(&Address::device(addr, device_id))
            .await?;
        Ok(())
    }

    /// Makes sure every known device of `addr` (or just `device_id`) has an
    /// open session, fetching bundles only where one is missing.
    pub(crate) async fn init_sessions(&self, addr: &str, device_id: Option<u32>) -> RelayResult<()> {
        let device_ids = match device_id {
            Some(id) => vec![id],
            None => self.device_ids(addr).await?,
        };
        if device_ids.is_empty() {
            debug!("First contact with {}, fetching all device keys", addr);
            return self.get_keys_for_addr(addr, None).await;
        }

        let mut stale = Vec::new();
        for id in &device_ids {
            let open = self
                .ctx
                .sessions
                .has_open_session(&Address::device(addr, *id))
                .await?;
            if !open {
                stale.push(*id);
            }
        }

        if stale.len() == device_ids.len() && device_id.is_none() {
            self.get_keys_for_addr(addr, None).await
        } else if !stale.is_empty() {
            self.get_keys_for_addr(addr, Some(stale)).await
        } else {
            Ok(())
        }
    }

    /// Fetches bundles for `devices` (all devices when `None`) and opens
    /// outgoing sessions from them. A 404 drops the matching sessions.
    pub(crate) async fn get_keys_for_addr(
        &self,
        addr: &str,
        devices: Option<Vec<u32>>,
    ) -> RelayResult<()> {
        let lookups: Vec<Option<u32>> = match devices {
            None => vec![None],
            Some(ids) => ids
                .into_iter()
                .filter(|id| !(self.is_self(addr) && *id == self.our_device_id))
                .map(Some)
                .collect(),
        };

        let fetched = join_all(lookups.iter().map(|device| async move {
            (*device, self.ctx.server.get_keys_for_addr(addr, *device).await)
        }))
        .await;

        for (device, result) in fetched {
            match result {
                Ok(response) => {
                    for bundle in response.into_bundles() {
                        if self.is_self(addr) && bundle.device.device_id == self.our_device_id {
                            continue;
                        }
                        self.init_outgoing(addr, &bundle).await?;
                    }
                }
                Err(e) if e.status() == Some(404) => match device {
                    Some(id) => {
                        warn!("Device {}.{} is gone, dropping its session", addr, id);
                        self.ctx.store.remove_session(&Address::device(addr, id)).await?;
                    }
                    None => {
                        warn!("No devices for {}, dropping all sessions", addr);
                        self.ctx.store.remove_all_sessions(addr).await?;
                    }
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn init_outgoing(&self, addr: &str, bundle: &PreKeyBundle) -> RelayResult<()> {
        let address = &Address::device(addr, bundle.device.device_id);
        self.with_key_change(move || self.ctx.sessions.init_outgoing(address, bundle))
            .await
    }

    async fn encrypt_all(
        &self,
        addr: &str,
        device_ids: &[u32],
        padded: &[u8],
        timestamp: u64,
    ) -> RelayResult<Vec<OutgoingDeviceMessage>> {
        join_all(
            device_ids
                .iter()
                .map(|id| self.encrypt_for_device(addr, *id, padded, timestamp)),
        )
        .await
        .into_iter()
        .collect()
    }

    async fn encrypt_for_device(
        &self,
        addr: &str,
        device_id: u32,
        padded: &[u8],
        timestamp: u64,
    ) -> RelayResult<OutgoingDeviceMessage> {
        let address = &Address::device(addr, device_id);
        let ciphertext = self
            .with_key_change(move || self.ctx.sessions.encrypt(address, padded))
            .await?;
        Ok(OutgoingDeviceMessage {
            message_type: ciphertext.message_type,
            destination_device_id: device_id,
            destination_registration_id: ciphertext.registration_id,
            content: ciphertext.body,
            timestamp,
        })
    }

    /// Runs a session operation, retrying it once if an identity change is
    /// raised and accepted. A second identity error is final.
    async fn with_key_change<T, F, Fut>(&self, mut op: F) -> RelayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let mut key_change = false;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(SessionError::UntrustedIdentity { addr, identity_key }) => {
                    if key_change || !self.key_change_accepted(&addr, &identity_key).await? {
                        return Err(RelayError::OutgoingIdentityKey { addr, identity_key });
                    }
                    key_change = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn key_change_accepted(&self, addr: &str, identity_key: &[u8]) -> RelayResult<bool> {
        let event = KeyChangeEvent::new(addr, identity_key.to_vec(), None);
        self.events.emit(&SenderEvent::KeyChange(event.clone()));
        if !event.is_accepted() {
            return Ok(false);
        }
        self.ctx.accept_identity(addr, identity_key).await?;
        Ok(true)
    }
}

/// Records a terminal error; auth failures abort the remaining addresses.
fn fail(job: &OutgoingMessage, addr: &str, reason: &str, err: RelayError) -> Result<(), Abort> {
    let abort = err.is_auth_failure();
    let err = Arc::new(err);
    job.record_error(addr, reason, err.clone());
    if abort {
        Err(err)
    } else {
        Ok(())
    }
}
