//! Device Provisioning (new-device side)
//!
//! The new device opens an unauthenticated provisioning socket. The server
//! assigns it a channel uuid, which the caller shows to the primary device
//! as a link or QR code. The primary device answers with an encrypted
//! [`ProvisionEnvelope`]; once decrypted, this device registers itself under
//! the provisioned account.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{new_device_info, AccountManager};
use crate::error::{RelayError, RelayResult};
use crate::network::{
    IncomingRequest, IncomingRequests, NetworkError, RelaySocket, SocketEvent, Transport,
};
use crate::provisioning::{
    ProvisionEnvelope, ProvisioningCipher, ProvisioningUrl, ProvisioningUuid,
};
use crate::storage::DeviceState;

/// Frame carrying our provisioning channel id.
pub const ADDRESS_PATH: &str = "/v1/address";

/// Frame carrying the encrypted provisioning message.
pub const PROVISION_MESSAGE_PATH: &str = "/v1/message";

/// Caller hooks for the provisioning handshake.
#[async_trait]
pub trait ProvisionDelegate: Send + Sync {
    /// The channel is ready; show `url` to the primary device.
    async fn on_provision_ready(&self, url: &ProvisioningUrl) -> RelayResult<()>;

    /// Confirms the account we were provisioned for. An error aborts.
    async fn confirm_address(&self, addr: &str) -> RelayResult<()>;

    fn on_key_progress(&self, _done: u32, _fraction: f64) {}
}

/// A device registration in progress.
#[derive(Debug)]
pub struct DeviceRegistration {
    socket: RelaySocket,
    task: JoinHandle<RelayResult<DeviceState>>,
}

impl DeviceRegistration {
    /// Waits for the registration to finish.
    pub async fn finish(self) -> RelayResult<DeviceState> {
        self.task
            .await
            .map_err(|e| RelayError::InvalidState(format!("registration task failed: {e}")))?
    }

    /// Abandons the registration. The resulting error is only logged.
    pub async fn cancel(self) {
        self.socket.shutdown().await;
        match self.finish().await {
            Ok(state) => debug!("Registration finished before cancel: {}", state.username()),
            Err(e) => warn!("Registration cancelled: {}", e),
        }
    }
}

impl AccountManager {
    /// Starts registering this device as a new device of an existing
    /// account, over a provisioning socket on `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_device<T: Transport>(
        &self,
        name: &str,
        delegate: Arc<dyn ProvisionDelegate>,
        transport: T,
    ) -> RelayResult<DeviceRegistration> {
        let cipher = ProvisioningCipher::new()?;
        let options = self.ctx().config.provisioning_socket_options();
        let (socket, requests) = RelaySocket::new(transport, options);

        let manager = self.clone();
        let name = name.to_string();
        let task_socket = socket.clone();
        let task = tokio::spawn(async move {
            manager
                .run_device_registration(&name, cipher, delegate, task_socket, requests)
                .await
        });
        Ok(DeviceRegistration { socket, task })
    }

    async fn run_device_registration(
        &self,
        name: &str,
        cipher: ProvisioningCipher,
        delegate: Arc<dyn ProvisionDelegate>,
        socket: RelaySocket,
        requests: IncomingRequests,
    ) -> RelayResult<DeviceState> {
        let socket_events = socket.subscribe();
        socket.connect().await?;
        let envelope = self
            .await_provisioning(&cipher, delegate.as_ref(), requests, socket_events)
            .await;
        socket.shutdown().await;
        let envelope = envelope?;

        let provisioned = cipher.decrypt(&envelope)?;
        delegate.confirm_address(&provisioned.addr).await?;

        let ctx = self.ctx();
        let info = new_device_info(name)?;
        let device_id = ctx
            .server
            .add_device(&provisioned.provisioning_code, &provisioned.addr, &info)
            .await?;
        info!("Linked as device {} of {}", device_id, provisioned.addr);

        let state = DeviceState {
            addr: provisioned.addr,
            device_id,
            name: info.name,
            password: info.password,
            registration_id: info.registration_id,
            signaling_key: info.signaling_key,
            identity: provisioned.identity_key_pair,
        };
        let progress = |done: u32, fraction: f64| delegate.on_key_progress(done, fraction);
        self.complete_registration(&state, Some(&progress)).await?;
        Ok(state)
    }

    async fn await_provisioning(
        &self,
        cipher: &ProvisioningCipher,
        delegate: &dyn ProvisionDelegate,
        mut requests: IncomingRequests,
        mut socket_events: broadcast::Receiver<SocketEvent>,
    ) -> RelayResult<ProvisionEnvelope> {
        loop {
            let request = tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => return Err(RelayError::Cancelled),
                },
                event = socket_events.recv() => match event {
                    Ok(SocketEvent::Closed { code, reason }) => {
                        debug!("Provisioning socket closed: {} {}", code, reason);
                        return Err(NetworkError::ConnectionClosed.into());
                    }
                    Ok(SocketEvent::Connected) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(RelayError::Cancelled),
                },
            };

            match (request.verb.as_str(), request.path.as_str()) {
                ("PUT", ADDRESS_PATH) => {
                    let uuid: ProvisioningUuid = accept_json(request)?;
                    let url = ProvisioningUrl::new(
                        &self.ctx().config.provisioning_scheme,
                        &uuid.uuid,
                        &cipher.public_key_base64(),
                    );
                    debug!("Provisioning channel ready: {}", uuid.uuid);
                    delegate.on_provision_ready(&url).await?;
                }
                ("PUT", PROVISION_MESSAGE_PATH) => return accept_json(request),
                (verb, path) => {
                    let err = RelayError::ProtocolViolation(format!(
                        "Unknown websocket message {verb} {path}"
                    ));
                    request.respond(400, "Invalid Resource");
                    return Err(err);
                }
            }
        }
    }
}

/// Acknowledges `request` and decodes its JSON body.
fn accept_json<T: serde::de::DeserializeOwned>(mut request: IncomingRequest) -> RelayResult<T> {
    let body = request.body.take();
    request.respond(200, "OK");
    let body = body.ok_or_else(|| RelayError::Decode("provisioning frame without body".to_string()))?;
    Ok(serde_json::from_slice(&body)?)
}
