//! HTTP relay server client.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use super::{AccountCreated, DeviceInfo, IncomingMessages, NewDeviceInfo, RelayServer};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::keys::{GeneratedKeys, KeysResponse};
use crate::message::OutgoingDeviceMessage;
use crate::network::NetworkError;
use crate::provisioning::ProvisionEnvelope;

const ACCOUNTS: &str = "v1/accounts";
const DEVICES: &str = "v1/devices";
const KEYS: &str = "v2/keys";
const MESSAGES: &str = "v1/messages";
const ATTACHMENTS: &str = "v1/attachments";
const PROVISIONING: &str = "v1/provisioning";
const PROVISION_ACCOUNT: &str = "v1/provision/account";

#[derive(Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<DeviceInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAdded {
    device_id: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationCode {
    verification_code: String,
}

#[derive(Deserialize)]
struct KeyCount {
    count: u32,
}

#[derive(Deserialize)]
struct AttachmentLocation {
    location: String,
    #[serde(default)]
    id: Option<Value>,
}

/// Relay server reached over HTTPS with basic auth.
pub struct HttpRelayServer {
    client: Client,
    base_url: String,
    credentials: RwLock<Option<(String, String)>>,
}

impl HttpRelayServer {
    /// Creates a client for `config.server_url`, using its credentials if set.
    pub fn new(config: &RelayConfig) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.connect_timeout_ms.max(1) * 3))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(http_error)?;
        Ok(Self::with_client(client, config))
    }

    /// Uses a preconfigured `reqwest` client.
    pub fn with_client(client: Client, config: &RelayConfig) -> Self {
        let credentials = config
            .credentials()
            .ok()
            .map(|(u, p)| (u.to_string(), p.to_string()));
        HttpRelayServer {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            credentials: RwLock::new(credentials),
        }
    }

    /// Replaces the credentials used for subsequent requests.
    pub fn set_credentials(&self, username: &str, password: &str) {
        let creds = Some((username.to_string(), password.to_string()));
        match self.credentials.write() {
            Ok(mut guard) => *guard = creds,
            Err(poisoned) => *poisoned.into_inner() = creds,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn current_credentials(&self) -> Option<(String, String)> {
        self.credentials.read().ok().and_then(|c| c.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Performs one API call and returns the raw response body.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        auth: Option<(String, String)>,
    ) -> RelayResult<Vec<u8>> {
        let mut request = self.client.request(method.clone(), self.url(path));
        if let Some((username, password)) = auth.or_else(|| self.current_credentials()) {
            request = request.basic_auth(username, Some(password));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        debug!("{} {}", method, path);
        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(http_error)?.to_vec();
        if status.is_success() {
            return Ok(bytes);
        }
        let content = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        Err(RelayError::protocol(i64::from(status.as_u16()), content))
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        auth: Option<(String, String)>,
    ) -> RelayResult<T> {
        let bytes = self.call(method, path, body, auth).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            RelayError::Decode(format!("invalid response from {path}: {e}"))
        })
    }

    fn device_json(info: &NewDeviceInfo) -> Value {
        json!({
            "signalingKey": BASE64.encode(info.signaling_key.as_bytes()),
            "supportsSms": false,
            "fetchesMessages": true,
            "registrationId": info.registration_id,
            "name": info.name,
        })
    }
}

fn http_error(err: reqwest::Error) -> RelayError {
    RelayError::Network(NetworkError::Http(err.to_string()))
}

/// Extracts the numeric attachment id from an upload location URL.
fn attachment_id_from_location(location: &str) -> Option<String> {
    let url = url::Url::parse(location).ok()?;
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    segment
        .chars()
        .all(|c| c.is_ascii_digit())
        .then(|| segment.to_string())
}

#[async_trait]
impl RelayServer for HttpRelayServer {
    async fn create_account(&self, info: &NewDeviceInfo) -> RelayResult<AccountCreated> {
        let mut body = Self::device_json(info);
        body["password"] = Value::from(info.password.clone());
        let created: AccountCreated = self
            .call_json(Method::PUT, PROVISION_ACCOUNT, Some(body), None)
            .await?;
        let username = format!("{}.{}", created.addr, created.device_id);
        self.set_credentials(&username, &info.password);
        info!("Created account device: {}", username);
        Ok(created)
    }

    async fn add_device(&self, code: &str, addr: &str, info: &NewDeviceInfo) -> RelayResult<u32> {
        info!("Adding device to: {}", addr);
        let added: DeviceAdded = self
            .call_json(
                Method::PUT,
                &format!("{DEVICES}/{code}"),
                Some(Self::device_json(info)),
                Some((addr.to_string(), info.password.clone())),
            )
            .await?;
        self.set_credentials(&format!("{}.{}", addr, added.device_id), &info.password);
        Ok(added.device_id)
    }

    async fn get_devices(&self) -> RelayResult<Vec<DeviceInfo>> {
        let response: DevicesResponse = self.call_json(Method::GET, DEVICES, None, None).await?;
        Ok(response.devices)
    }

    async fn delete_device(&self, device_id: u32) -> RelayResult<()> {
        self.call(Method::DELETE, &format!("{DEVICES}/{device_id}"), None, None)
            .await?;
        Ok(())
    }

    async fn get_link_device_verification_code(&self) -> RelayResult<String> {
        let code: VerificationCode = self
            .call_json(Method::GET, &format!("{DEVICES}/provisioning/code"), None, None)
            .await?;
        Ok(code.verification_code)
    }

    async fn update_push_registration(&self, registration_id: &str) -> RelayResult<()> {
        let body = json!({
            "gcmRegistrationId": registration_id,
            "webSocketChannel": true,
        });
        self.call(Method::PUT, &format!("{ACCOUNTS}/gcm"), Some(body), None)
            .await?;
        Ok(())
    }

    async fn register_keys(&self, keys: &GeneratedKeys) -> RelayResult<()> {
        let body = serde_json::to_value(keys)?;
        self.call(Method::PUT, KEYS, Some(body), None).await?;
        Ok(())
    }

    async fn get_my_key_count(&self) -> RelayResult<u32> {
        let count: KeyCount = self.call_json(Method::GET, KEYS, None, None).await?;
        Ok(count.count)
    }

    async fn get_keys_for_addr(
        &self,
        addr: &str,
        device_id: Option<u32>,
    ) -> RelayResult<KeysResponse> {
        let device = device_id.map_or_else(|| "*".to_string(), |id| id.to_string());
        self.call_json(Method::GET, &format!("{KEYS}/{addr}/{device}"), None, None)
            .await
    }

    async fn send_messages(
        &self,
        destination: &str,
        messages: &[OutgoingDeviceMessage],
        timestamp: u64,
    ) -> RelayResult<()> {
        let body = json!({
            "messages": messages,
            "timestamp": timestamp,
        });
        self.call(
            Method::PUT,
            &format!("{MESSAGES}/{destination}"),
            Some(body),
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_messages(&self) -> RelayResult<IncomingMessages> {
        self.call_json(Method::GET, MESSAGES, None, None).await
    }

    async fn delete_message(&self, source: &str, timestamp: u64) -> RelayResult<()> {
        self.call(
            Method::DELETE,
            &format!("{MESSAGES}/{source}/{timestamp}"),
            None,
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_attachment(&self, id: &str) -> RelayResult<Vec<u8>> {
        let pointer: AttachmentLocation = self
            .call_json(Method::GET, &format!("{ATTACHMENTS}/{id}"), None, None)
            .await?;
        let response = self
            .client
            .get(&pointer.location)
            .header("Content-Type", "application/octet-stream")
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(http_error)?;
        if !status.is_success() {
            error!("Download attachment error: {}", status);
            return Err(RelayError::protocol(
                i64::from(status.as_u16()),
                Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            ));
        }
        Ok(bytes.to_vec())
    }

    async fn put_attachment(&self, data: &[u8]) -> RelayResult<String> {
        let pointer: AttachmentLocation =
            self.call_json(Method::GET, ATTACHMENTS, None, None).await?;
        let id = match &pointer.id {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => attachment_id_from_location(&pointer.location),
        }
        .ok_or_else(|| {
            RelayError::Decode(format!("invalid attachment url: {}", pointer.location))
        })?;

        let response = self
            .client
            .put(&pointer.location)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            error!("Upload attachment error: {}", status);
            let text = response.text().await.unwrap_or_default();
            return Err(RelayError::protocol(
                i64::from(status.as_u16()),
                Value::String(text),
            ));
        }
        Ok(id)
    }

    async fn put_provisioning(&self, uuid: &str, envelope: &ProvisionEnvelope) -> RelayResult<()> {
        let encoded = serde_json::to_vec(envelope)?;
        let body = json!({ "body": BASE64.encode(encoded) });
        self.call(
            Method::PUT,
            &format!("{PROVISIONING}/{uuid}"),
            Some(body),
            None,
        )
        .await?;
        Ok(())
    }
}
