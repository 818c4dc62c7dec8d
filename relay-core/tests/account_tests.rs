// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tests for account
//! Extracted from account/mod.rs

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::fixtures::*;
use common::helpers::record;
use common::strategies::device_name_strategy;
use proptest::prelude::*;
use relay_core::account::make_device_name;
use relay_core::keys::LAST_RESORT_KEY_ID;
use relay_core::storage::state_keys;
use relay_core::{
    AccountEvent, AccountManager, IdentityKeyPair, MockTransport, ProtocolStore,
    ProvisionDelegate, ProvisionMessage, ProvisioningCipher, ProvisioningUrl, RelayConfig,
    RelayError, RelayResult,
};
use serde_json::json;
use tokio::sync::mpsc;

fn manager(h: &Harness) -> AccountManager {
    AccountManager::new(h.ctx.clone())
}

fn last_resort_config() -> RelayConfig {
    RelayConfig::builder()
        .server_url("https://relay.test")
        .credentials(format!("{OUR_ADDR}.{OUR_DEVICE}"), "secret")
        .pre_key_water_marks(2, 5)
        .last_resort_key(true)
        .build()
        .unwrap()
}

// ============================================================
// Registration
// ============================================================

#[tokio::test]
async fn test_register_account_persists_and_publishes() {
    let h = unregistered_harness();
    let manager = manager(&h);
    let events = record(manager.events());

    let state = manager.register_account("my phone").await.unwrap();

    assert_eq!(state.addr, OUR_ADDR);
    assert_eq!(state.device_id, OUR_DEVICE);
    assert_eq!(state.name, "my phone");
    assert_eq!(h.ctx.our_addr().await.unwrap(), OUR_ADDR);
    assert_eq!(h.ctx.our_device_id().await.unwrap(), OUR_DEVICE);
    let identity = h.store.get_our_identity().await.unwrap().unwrap();
    assert_eq!(identity.public_key(), state.identity.public_key());

    let server = h.server.state();
    assert_eq!(server.created.len(), 1);
    assert_eq!(server.created[0].registration_id, state.registration_id);
    assert_eq!(server.registered_keys.len(), 1);
    assert_eq!(server.registered_keys[0].pre_keys.len(), 5);
    assert_eq!(
        server.registered_keys[0].identity_key,
        state.identity.public_key().to_vec()
    );
    drop(server);

    assert_eq!(
        events.events(),
        vec![AccountEvent::Registration {
            addr: OUR_ADDR.to_string(),
            device_id: OUR_DEVICE,
        }]
    );
}

#[tokio::test]
async fn test_registration_password_shape() {
    let h = unregistered_harness();
    let state = manager(&h).register_account("phone").await.unwrap();
    // 16 random bytes in base64 without the trailing padding
    assert_eq!(state.password.len(), 22);
    assert!(!state.password.ends_with('='));
}

#[tokio::test]
async fn test_register_shortens_long_name() {
    let h = unregistered_harness();
    let name = "x".repeat(60);

    let state = manager(&h).register_account(&name).await.unwrap();

    assert_eq!(state.name, format!("{}...)", "x".repeat(45)));
    assert_eq!(h.server.state().created[0].name, state.name);
}

#[tokio::test]
async fn test_reregistration_clears_sessions() {
    let h = harness().await;
    h.sessions
        .open(&relay_core::Address::device(BOB, 1))
        .await;
    h.store.save_identity(BOB, &[1u8; 32]).await.unwrap();

    manager(&h).register_account("fresh").await.unwrap();

    assert!(h.store.device_ids(BOB).await.unwrap().is_empty());
}

// ============================================================
// Prekeys
// ============================================================

#[tokio::test]
async fn test_generate_keys_advances_ids() {
    let h = harness().await;
    let manager = manager(&h);

    let first = manager.generate_keys(None).await.unwrap();
    let second = manager.generate_keys(None).await.unwrap();

    let ids: Vec<u32> = first.pre_keys.iter().map(|k| k.key_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    let ids: Vec<u32> = second.pre_keys.iter().map(|k| k.key_id).collect();
    assert_eq!(ids, vec![6, 7, 8, 9, 10]);
    assert_eq!(first.signed_pre_key.key_id, 1);
    assert_eq!(second.signed_pre_key.key_id, 2);
    assert_eq!(
        h.store.get_state_u32(state_keys::MAX_PRE_KEY_ID).await.unwrap(),
        Some(11)
    );
    assert_eq!(
        h.store.get_state_u32(state_keys::SIGNED_KEY_ID).await.unwrap(),
        Some(3)
    );
    assert_eq!(h.store.pre_key_count().unwrap(), 10);
    assert!(first.last_resort_key.is_none());
}

#[tokio::test]
async fn test_signed_pre_key_is_signed_by_identity() {
    let h = harness().await;
    let keys = manager(&h).generate_keys(None).await.unwrap();
    assert!(IdentityKeyPair::verify(
        h.state.identity.public_key(),
        &keys.signed_pre_key.public_key,
        &keys.signed_pre_key.signature,
    ));
}

#[tokio::test]
async fn test_signed_pre_keys_keep_last_two() {
    let h = harness().await;
    let manager = manager(&h);

    for _ in 0..4 {
        manager.generate_keys(None).await.unwrap();
    }

    assert_eq!(h.store.signed_pre_key_ids().await.unwrap(), vec![3, 4]);
}

#[tokio::test]
async fn test_generate_keys_reports_progress() {
    let h = harness().await;
    let seen = Mutex::new(Vec::new());
    let progress = |done: u32, fraction: f64| seen.lock().unwrap().push((done, fraction));

    manager(&h).generate_keys(Some(&progress)).await.unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0], (1, 0.2));
    assert_eq!(seen[4], (5, 1.0));
}

#[tokio::test]
async fn test_generate_keys_requires_identity() {
    let h = unregistered_harness();
    assert!(matches!(
        manager(&h).generate_keys(None).await,
        Err(RelayError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_refresh_skipped_when_pool_healthy() {
    let h = unregistered_harness();
    let manager = manager(&h);
    manager.register_account("phone").await.unwrap();

    assert!(!manager.refresh_pre_keys().await.unwrap());
    assert_eq!(h.server.state().registered_keys.len(), 1);
}

#[tokio::test]
async fn test_refresh_when_server_runs_low() {
    let h = unregistered_harness();
    let manager = manager(&h);
    manager.register_account("phone").await.unwrap();
    h.server.state().key_count = 2;

    assert!(manager.refresh_pre_keys().await.unwrap());

    let server = h.server.state();
    assert_eq!(server.registered_keys.len(), 2);
    assert_eq!(server.registered_keys[1].pre_keys[0].key_id, 6);
    assert_eq!(server.registered_keys[1].signed_pre_key.key_id, 2);
}

#[tokio::test]
async fn test_refresh_when_signed_key_missing() {
    let h = unregistered_harness();
    let manager = manager(&h);
    manager.register_account("phone").await.unwrap();
    h.store.remove_signed_pre_key(1).await.unwrap();

    assert!(manager.refresh_pre_keys().await.unwrap());
}

#[tokio::test]
async fn test_last_resort_key_created_once() {
    let h = harness_with(last_resort_config()).await;
    let manager = manager(&h);

    let first = manager.generate_keys(None).await.unwrap();
    let second = manager.generate_keys(None).await.unwrap();

    let first = first.last_resort_key.unwrap();
    let second = second.last_resort_key.unwrap();
    assert_eq!(first.key_id, LAST_RESORT_KEY_ID);
    assert_eq!(first, second);
    assert!(h
        .store
        .load_pre_key(LAST_RESORT_KEY_ID)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_refresh_when_last_resort_key_missing() {
    let h = unregistered_harness_with(last_resort_config());
    let manager = manager(&h);
    manager.register_account("phone").await.unwrap();
    assert!(!manager.refresh_pre_keys().await.unwrap());

    h.store.remove_pre_key(LAST_RESORT_KEY_ID).await.unwrap();

    assert!(manager.refresh_pre_keys().await.unwrap());
    assert!(h
        .store
        .load_pre_key(LAST_RESORT_KEY_ID)
        .await
        .unwrap()
        .is_some());
}

// ============================================================
// Linking (primary side)
// ============================================================

#[tokio::test]
async fn test_link_device_sends_encrypted_identity() {
    let h = harness().await;
    let cipher = ProvisioningCipher::new().unwrap();

    let linked = manager(&h)
        .link_device("chan-1", cipher.public_key())
        .await
        .unwrap();

    assert!(linked);
    let (uuid, envelope) = h.server.state().provisioned[0].clone();
    assert_eq!(uuid, "chan-1");
    let provisioned = cipher.decrypt(&envelope).unwrap();
    assert_eq!(provisioned.addr, OUR_ADDR);
    assert_eq!(provisioned.provisioning_code, "123456");
    assert_eq!(
        provisioned.identity_key_pair.public_key(),
        h.state.identity.public_key()
    );
    assert_eq!(provisioned.user_agent, h.ctx.config.user_agent);
}

#[tokio::test]
async fn test_link_device_already_serviced() {
    let h = harness().await;
    h.server.state().provisioning_error = Some(404);
    let cipher = ProvisioningCipher::new().unwrap();

    let linked = manager(&h)
        .link_device("chan-1", cipher.public_key())
        .await
        .unwrap();

    assert!(!linked);
}

#[tokio::test]
async fn test_link_device_server_error() {
    let h = harness().await;
    h.server.state().provisioning_error = Some(500);
    let cipher = ProvisioningCipher::new().unwrap();

    let err = manager(&h)
        .link_device("chan-1", cipher.public_key())
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(500));
}

#[tokio::test]
async fn test_link_device_from_url() {
    let h = harness().await;
    let cipher = ProvisioningCipher::new().unwrap();
    let link = ProvisioningUrl::new("tsdevice", "chan-2", &cipher.public_key_base64()).to_string();

    assert!(manager(&h).link_device_url(&link).await.unwrap());

    let (uuid, envelope) = h.server.state().provisioned[0].clone();
    assert_eq!(uuid, "chan-2");
    assert!(cipher.decrypt(&envelope).is_ok());
}

#[tokio::test]
async fn test_link_device_url_malformed() {
    let h = harness().await;
    let result = manager(&h).link_device_url("tsdevice:/?uuid=only").await;
    assert!(matches!(result, Err(RelayError::Provisioning(_))));
}

#[tokio::test]
async fn test_devices_and_delete() {
    let h = harness().await;
    let manager = manager(&h);

    let devices = manager.devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, OUR_DEVICE);

    manager.delete_device(3).await.unwrap();
    assert_eq!(h.server.state().deleted_devices, vec![3]);
}

// ============================================================
// Provisioning (new-device side)
// ============================================================

struct RecordingDelegate {
    urls: mpsc::UnboundedSender<ProvisioningUrl>,
    confirmed: Mutex<Vec<String>>,
    progress: AtomicU32,
    reject: bool,
}

impl RecordingDelegate {
    fn new(reject: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<ProvisioningUrl>) {
        let (urls, rx) = mpsc::unbounded_channel();
        let delegate = RecordingDelegate {
            urls,
            confirmed: Mutex::new(Vec::new()),
            progress: AtomicU32::new(0),
            reject,
        };
        (Arc::new(delegate), rx)
    }
}

#[async_trait]
impl ProvisionDelegate for RecordingDelegate {
    async fn on_provision_ready(&self, url: &ProvisioningUrl) -> RelayResult<()> {
        let _ = self.urls.send(url.clone());
        Ok(())
    }

    async fn confirm_address(&self, addr: &str) -> RelayResult<()> {
        self.confirmed.lock().unwrap().push(addr.to_string());
        if self.reject {
            return Err(RelayError::Validation(format!("not linking to {addr}")));
        }
        Ok(())
    }

    fn on_key_progress(&self, done: u32, _fraction: f64) {
        self.progress.store(done, Ordering::SeqCst);
    }
}

fn provision_message(primary: &IdentityKeyPair) -> ProvisionMessage {
    ProvisionMessage {
        identity_key_private: primary.private_key().to_vec(),
        addr: OUR_ADDR.to_string(),
        provisioning_code: "123456".to_string(),
        user_agent: "primary".to_string(),
    }
}

fn json_body(value: &impl serde::Serialize) -> Option<Vec<u8>> {
    Some(serde_json::to_vec(value).unwrap())
}

#[tokio::test]
async fn test_register_device_over_provisioning_socket() {
    let h = unregistered_harness();
    let manager = manager(&h);
    let events = record(manager.events());
    let (transport, mut peer) = MockTransport::pair();
    let (delegate, mut urls) = RecordingDelegate::new(false);
    let primary = IdentityKeyPair::generate().unwrap();

    let registration = manager
        .register_device("laptop", delegate.clone(), transport)
        .unwrap();
    peer.wait_for_connects(1).await;
    assert!(peer.urls()[0].ends_with("/v1/websocket/provisioning/"));

    peer.send_request(1, "PUT", "/v1/address", json_body(&json!({ "uuid": "chan-9" })));
    assert_eq!(peer.recv_response().await.unwrap().status, 200);
    let url = urls.recv().await.unwrap();
    assert_eq!(url.uuid, "chan-9");
    assert_eq!(url.scheme, "tsdevice");

    let envelope =
        ProvisioningCipher::encrypt(&url.public_key_bytes().unwrap(), &provision_message(&primary))
            .unwrap();
    peer.send_request(2, "PUT", "/v1/message", json_body(&envelope));
    assert_eq!(peer.recv_response().await.unwrap().status, 200);

    let state = registration.finish().await.unwrap();

    assert_eq!(state.addr, OUR_ADDR);
    assert_eq!(state.device_id, 2);
    assert_eq!(state.name, "laptop");
    assert_eq!(state.identity.public_key(), primary.public_key());
    assert_eq!(*delegate.confirmed.lock().unwrap(), vec![OUR_ADDR.to_string()]);
    assert_eq!(delegate.progress.load(Ordering::SeqCst), 5);
    assert_eq!(
        h.server.state().added,
        vec![("123456".to_string(), OUR_ADDR.to_string())]
    );
    assert_eq!(h.ctx.our_device_id().await.unwrap(), 2);
    assert_eq!(
        events.events(),
        vec![AccountEvent::Registration {
            addr: OUR_ADDR.to_string(),
            device_id: 2,
        }]
    );
    assert!(!peer.is_connected());
}

#[tokio::test]
async fn test_register_device_rejected_address() {
    let h = unregistered_harness();
    let (transport, mut peer) = MockTransport::pair();
    let (delegate, mut urls) = RecordingDelegate::new(true);
    let primary = IdentityKeyPair::generate().unwrap();

    let registration = manager(&h)
        .register_device("laptop", delegate, transport)
        .unwrap();
    peer.wait_for_connects(1).await;
    peer.send_request(1, "PUT", "/v1/address", json_body(&json!({ "uuid": "chan-9" })));
    let url = urls.recv().await.unwrap();
    let envelope =
        ProvisioningCipher::encrypt(&url.public_key_bytes().unwrap(), &provision_message(&primary))
            .unwrap();
    peer.send_request(2, "PUT", "/v1/message", json_body(&envelope));

    let result = registration.finish().await;

    assert!(matches!(result, Err(RelayError::Validation(_))));
    assert!(h.server.state().added.is_empty());
    assert!(h.ctx.our_addr().await.is_err());
}

#[tokio::test]
async fn test_register_device_unknown_frame() {
    let h = unregistered_harness();
    let (transport, mut peer) = MockTransport::pair();
    let (delegate, _urls) = RecordingDelegate::new(false);

    let registration = manager(&h)
        .register_device("laptop", delegate, transport)
        .unwrap();
    peer.wait_for_connects(1).await;
    peer.send_request(1, "GET", "/v1/other", None);

    let response = peer.recv_response().await.unwrap();
    assert_eq!(response.status, 400);
    assert!(matches!(
        registration.finish().await,
        Err(RelayError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_register_device_cancel() {
    let h = unregistered_harness();
    let (transport, mut peer) = MockTransport::pair();
    let (delegate, _urls) = RecordingDelegate::new(false);

    let registration = manager(&h)
        .register_device("laptop", delegate, transport)
        .unwrap();
    peer.wait_for_connects(1).await;

    registration.cancel().await;

    assert!(!peer.is_connected());
    assert!(h.server.state().added.is_empty());
    assert!(h.ctx.our_addr().await.is_err());
}

// ============================================================
// Device names
// ============================================================

#[test]
fn test_make_device_name_boundary() {
    let short = "a".repeat(49);
    assert_eq!(make_device_name(&short), short);

    let long = "a".repeat(50);
    assert_eq!(make_device_name(&long), format!("{}...)", "a".repeat(45)));
}

proptest! {
    #[test]
    fn prop_device_name_bounded(name in device_name_strategy()) {
        let made = make_device_name(&name);
        prop_assert!(made.chars().count() < 50);
        if name.chars().count() < 50 {
            prop_assert_eq!(made, name);
        } else {
            prop_assert!(made.ends_with("...)"));
            prop_assert!(name.starts_with(made.trim_end_matches("...)")));
        }
    }
}
