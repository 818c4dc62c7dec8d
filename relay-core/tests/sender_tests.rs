//! Tests for sender
//! Extracted from sender/mod.rs

mod common;

use common::fakes::SentBatch;
use common::fixtures::*;
use common::helpers::record;
use relay_core::crypto::decrypt_attachment;
use relay_core::{
    unpad, Address, Content, DataMessage, MessageSender, OutgoingAttachment, ProtocolStore,
    ReadEntry, RelayError, SendRequest, SenderEvent, SenderEventKind, SessionCipher,
};
use serde_json::{json, Value};
use std::time::Duration;

const BOB_KEY: [u8; 32] = [1u8; 32];

fn sender(h: &Harness) -> MessageSender {
    MessageSender::new(h.ctx.clone())
}

fn request(addrs: &[&str]) -> SendRequest {
    SendRequest::new(
        "thread-1",
        addrs.iter().map(|a| a.to_string()).collect(),
        1_700_000_000_000,
    )
    .body(json!({ "text": "hello" }))
}

/// Plaintext content of one submitted device message.
fn content_of(batch: &SentBatch) -> Content {
    let padded = &batch.messages[0].content;
    Content::decode(unpad(padded).unwrap()).unwrap()
}

/// Sessions with `devices` of BOB already open under a trusted key.
async fn known_bob(h: &Harness, devices: &[u32]) {
    h.store.save_identity(BOB, &BOB_KEY).await.unwrap();
    for device in devices {
        h.sessions.open(&Address::device(BOB, *device)).await;
    }
}

fn accept_key_changes(sender: &MessageSender) {
    sender.events().on(SenderEventKind::KeyChange, |event| {
        if let SenderEvent::KeyChange(change) = event {
            change.accept();
        }
    });
}

// ============================================================
// Fan-out
// ============================================================

#[tokio::test]
async fn test_first_contact_fetches_all_devices() {
    let h = harness().await;
    h.server.publish_keys(BOB, &BOB_KEY, &[1, 2]);

    let job = sender(&h).send(request(&[BOB])).await.unwrap();

    assert_eq!(h.server.key_requests(), vec![(BOB.to_string(), None)]);
    let sends = h.server.sends_to(BOB);
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].device_ids(), vec![1, 2]);
    assert_eq!(sends[0].timestamp, 1_700_000_000_000);
    assert!(sends[0]
        .messages
        .iter()
        .all(|m| m.destination_registration_id == 100 + m.destination_device_id));

    assert!(job.is_complete());
    assert!(job.pending().is_empty());
    assert_eq!(job.sent().len(), 1);
    assert_eq!(job.sent()[0].addr, BOB);
    assert!(job.errors().is_empty());
}

#[tokio::test]
async fn test_body_sent_as_json_text() {
    let h = harness().await;
    h.server.publish_keys(BOB, &BOB_KEY, &[1]);

    sender(&h).send(request(&[BOB])).await.unwrap();

    let content = content_of(&h.server.sends_to(BOB)[0]);
    let message = content.data_message.unwrap();
    let body: Value = serde_json::from_str(message.body.as_deref().unwrap()).unwrap();
    assert_eq!(body, json!({ "text": "hello" }));
}

#[tokio::test]
async fn test_open_sessions_skip_key_fetch() {
    let h = harness().await;
    known_bob(&h, &[1, 2]).await;

    sender(&h).send(request(&[BOB])).await.unwrap();

    assert!(h.server.key_requests().is_empty());
    assert_eq!(h.server.sends_to(BOB)[0].device_ids(), vec![1, 2]);
}

#[tokio::test]
async fn test_partial_sessions_fetch_only_missing() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    h.sessions.open(&Address::device(BOB, 2)).await;
    h.sessions
        .close_open_session(&Address::device(BOB, 2))
        .await
        .unwrap();
    h.server.publish_keys(BOB, &BOB_KEY, &[1, 2]);

    sender(&h).send(request(&[BOB])).await.unwrap();

    assert_eq!(h.server.key_requests(), vec![(BOB.to_string(), Some(2))]);
    assert_eq!(h.server.sends_to(BOB)[0].device_ids(), vec![1, 2]);
}

#[tokio::test]
async fn test_mismatched_devices_reconciled_once() {
    let h = harness().await;
    known_bob(&h, &[1, 2]).await;
    h.server.publish_keys(BOB, &BOB_KEY, &[1, 2, 3]);
    h.server.script_sends(
        BOB,
        vec![Err((409, json!({ "extraDevices": [2], "missingDevices": [3] })))],
    );

    let job = sender(&h).send(request(&[BOB])).await.unwrap();

    assert_eq!(h.server.key_requests(), vec![(BOB.to_string(), Some(3))]);
    let sends = h.server.sends_to(BOB);
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0].device_ids(), vec![1, 2]);
    assert_eq!(sends[1].device_ids(), vec![1, 3]);
    assert_eq!(job.sent().len(), 1);
}

#[tokio::test]
async fn test_stale_devices_closed_before_refetch() {
    let h = harness().await;
    known_bob(&h, &[1, 2]).await;
    h.server.publish_keys(BOB, &BOB_KEY, &[1, 2]);
    h.server
        .script_sends(BOB, vec![Err((410, json!({ "staleDevices": [2] })))]);

    let job = sender(&h).send(request(&[BOB])).await.unwrap();

    assert_eq!(
        h.sessions.ops(),
        vec![
            "encrypt bob.1",
            "encrypt bob.2",
            "close bob.2",
            "init bob.2",
            "encrypt bob.1",
            "encrypt bob.2",
        ]
    );
    assert_eq!(h.server.key_requests(), vec![(BOB.to_string(), Some(2))]);
    assert_eq!(h.server.sends_to(BOB).len(), 2);
    assert_eq!(job.sent().len(), 1);
}

#[tokio::test]
async fn test_second_mismatch_hits_retry_limit() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    let mismatch = json!({ "extraDevices": [], "missingDevices": [] });
    h.server.script_sends(
        BOB,
        vec![Err((409, mismatch.clone())), Err((409, mismatch))],
    );

    let job = sender(&h).send(request(&[BOB])).await.unwrap();

    assert_eq!(h.server.sends_to(BOB).len(), 2);
    assert!(job.sent().is_empty());
    let errors = job.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].addr, BOB);
    assert_eq!(errors[0].reason, "Device list reconciliation failed");
    assert!(matches!(*errors[0].error, RelayError::RetryLimit(_)));
    assert!(job.is_complete());
}

#[tokio::test]
async fn test_unregistered_recipient() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    h.server.script_sends(BOB, vec![Err((404, Value::Null))]);

    let job = sender(&h).send(request(&[BOB])).await.unwrap();

    let errors = job.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].reason, "Unregistered user");
    assert!(matches!(&*errors[0].error, RelayError::UnregisteredUser { addr } if addr == BOB));
}

#[tokio::test]
async fn test_key_fetch_failure_recorded() {
    let h = harness().await;
    h.server.state().key_failures.insert(BOB.to_string(), 500);

    let job = sender(&h).send(request(&[BOB])).await.unwrap();

    let errors = job.errors();
    assert_eq!(errors[0].reason, "Failed to retrieve new device keys");
    assert_eq!(errors[0].error.status(), Some(500));
    assert!(h.server.sends_to(BOB).is_empty());
}

#[tokio::test]
async fn test_server_error_recorded() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    h.server.script_sends(BOB, vec![Err((500, Value::Null))]);

    let job = sender(&h).send(request(&[BOB])).await.unwrap();

    assert_eq!(job.errors()[0].reason, "Failed to send message");
    assert_eq!(job.errors()[0].error.status(), Some(500));
}

/// Error entries recorded for `addr` during a send.
fn errors_for(events: &[SenderEvent], addr: &str) -> Vec<(String, Option<i32>)> {
    events
        .iter()
        .filter_map(|e| match e {
            SenderEvent::Error(err) if err.addr == addr => {
                Some((err.reason.clone(), err.error.status()))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_auth_failure_aborts_remaining_addrs() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    h.server.publish_keys(CAROL, &[2u8; 32], &[1]);
    h.server.script_sends(BOB, vec![Err((401, Value::Null))]);
    let sender = sender(&h);
    let events = record(sender.events());

    let err = sender.send(request(&[BOB, CAROL])).await.unwrap_err();

    assert_eq!(err.status(), Some(401));
    let recorded = events.events();
    assert_eq!(
        errors_for(&recorded, BOB),
        vec![("Failed to send message".to_string(), Some(401))]
    );
    assert_eq!(
        errors_for(&recorded, CAROL),
        vec![("Send aborted".to_string(), Some(401))]
    );
    assert!(!recorded.iter().any(|e| matches!(e, SenderEvent::Sent(_))));
    assert!(h.server.sends_to(CAROL).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_stops_in_flight_delivery() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    h.server.publish_keys(CAROL, &[2u8; 32], &[1]);
    h.server.delay_sends(CAROL, Duration::from_secs(1));
    h.server.script_sends(BOB, vec![Err((403, Value::Null))]);
    let sender = sender(&h);
    let events = record(sender.events());

    // Carol goes first and is still waiting on the server when bob fails.
    let err = sender.send(request(&[CAROL, BOB])).await.unwrap_err();

    assert_eq!(err.status(), Some(403));
    assert_eq!(
        errors_for(&events.events(), CAROL),
        vec![("Send aborted".to_string(), Some(403))]
    );
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.server.sends_to(CAROL).is_empty());
}

#[tokio::test]
async fn test_auth_failure_fails_read_sync() {
    let h = harness().await;
    let our_key = h.state.identity.public_key().to_vec();
    h.server.publish_keys(OUR_ADDR, &our_key, &[OUR_DEVICE, 2]);
    h.server.script_sends(OUR_ADDR, vec![Err((401, Value::Null))]);
    let reads = vec![ReadEntry {
        timestamp: 1,
        sender: BOB.to_string(),
    }];

    let err = sender(&h).sync_read_messages(reads).await.unwrap_err();

    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn test_duplicate_addrs_sent_once() {
    let h = harness().await;
    known_bob(&h, &[1]).await;

    let job = sender(&h).send(request(&[BOB, BOB])).await.unwrap();

    assert_eq!(h.server.sends_to(BOB).len(), 1);
    assert_eq!(job.addrs(), vec![BOB.to_string()]);
}

// ============================================================
// Single-device targets
// ============================================================

#[tokio::test]
async fn test_single_device_target() {
    let h = harness().await;
    h.server.publish_keys(BOB, &BOB_KEY, &[1, 2]);

    let job = sender(&h).send(request(&["bob.2"])).await.unwrap();

    assert_eq!(h.server.key_requests(), vec![(BOB.to_string(), Some(2))]);
    let sends = h.server.sends_to(BOB);
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].device_ids(), vec![2]);
    assert_eq!(job.sent()[0].addr, "bob.2");
}

#[tokio::test]
async fn test_single_device_stale_retried_once() {
    let h = harness().await;
    known_bob(&h, &[2]).await;
    h.server.publish_keys(BOB, &BOB_KEY, &[2]);
    h.server.script_sends(
        BOB,
        vec![
            Err((410, json!({ "staleDevices": [2] }))),
            Err((410, json!({ "staleDevices": [2] }))),
        ],
    );

    let job = sender(&h).send(request(&["bob.2"])).await.unwrap();

    assert_eq!(h.server.sends_to(BOB).len(), 2);
    assert!(h.sessions.ops().contains(&"close bob.2".to_string()));
    let errors = job.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].addr, "bob.2");
    assert_eq!(errors[0].reason, "Failed to send message");
    assert_eq!(errors[0].error.status(), Some(410));
}

// ============================================================
// Identity changes
// ============================================================

#[tokio::test]
async fn test_accepted_key_change_on_encrypt() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    h.sessions.present_identity(BOB, &[9u8; 32]);
    let sender = sender(&h);
    accept_key_changes(&sender);
    let events = record(sender.events());

    let job = sender.send(request(&[BOB])).await.unwrap();

    assert_eq!(job.sent().len(), 1);
    assert_eq!(
        h.store.load_identity(BOB).await.unwrap(),
        Some(vec![9u8; 32])
    );
    let changes: Vec<_> = events
        .events()
        .into_iter()
        .filter(|e| matches!(e, SenderEvent::KeyChange(_)))
        .collect();
    assert_eq!(changes.len(), 1);
}

#[tokio::test]
async fn test_declined_key_change_fails_addr() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    h.sessions.present_identity(BOB, &[9u8; 32]);

    let job = sender(&h).send(request(&[BOB])).await.unwrap();

    let errors = job.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].reason, "Failed to create message");
    assert!(matches!(
        &*errors[0].error,
        RelayError::OutgoingIdentityKey { addr, identity_key } if addr == BOB && identity_key == &vec![9u8; 32]
    ));
    assert!(h.server.sends_to(BOB).is_empty());
    assert_eq!(h.store.load_identity(BOB).await.unwrap(), Some(BOB_KEY.to_vec()));
}

#[tokio::test]
async fn test_accepted_key_change_on_new_bundle() {
    let h = harness().await;
    h.store.save_identity(BOB, &BOB_KEY).await.unwrap();
    h.server.publish_keys(BOB, &[5u8; 32], &[1]);
    let sender = sender(&h);
    accept_key_changes(&sender);

    let job = sender.send(request(&[BOB])).await.unwrap();

    assert_eq!(job.sent().len(), 1);
    assert_eq!(
        h.store.load_identity(BOB).await.unwrap(),
        Some(vec![5u8; 32])
    );
}

// ============================================================
// Self sync
// ============================================================

#[tokio::test]
async fn test_self_recipient_gets_sync_transcript() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    let our_key = h.state.identity.public_key().to_vec();
    h.server.publish_keys(OUR_ADDR, &our_key, &[OUR_DEVICE, 2]);

    let job = sender(&h)
        .send(request(&[BOB, OUR_ADDR]).expiration(30))
        .await
        .unwrap();

    assert_eq!(job.addrs(), vec![OUR_ADDR.to_string(), BOB.to_string()]);
    assert!(job.is_complete());
    assert_eq!(job.sent().len(), 2);

    let ours = h.server.sends_to(OUR_ADDR);
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].device_ids(), vec![2]);
    let sync = content_of(&ours[0]).sync_message.unwrap();
    let transcript = sync.sent.unwrap();
    assert_eq!(transcript.destination.as_deref(), Some("thread-1"));
    assert_eq!(transcript.timestamp, 1_700_000_000_000);
    assert_eq!(transcript.message.expire_timer, 30);
    assert!(transcript.expiration_start_timestamp.is_some());

    let bobs = content_of(&h.server.sends_to(BOB)[0]);
    assert_eq!(bobs.data_message.unwrap().expire_timer, 30);
}

#[tokio::test]
async fn test_sync_read_messages() {
    let h = harness().await;
    let sender = sender(&h);
    assert!(sender.sync_read_messages(Vec::new()).await.unwrap().is_none());

    let our_key = h.state.identity.public_key().to_vec();
    h.server.publish_keys(OUR_ADDR, &our_key, &[OUR_DEVICE, 2]);
    let reads = vec![ReadEntry {
        sender: BOB.to_string(),
        timestamp: 10,
    }];

    let job = sender.sync_read_messages(reads.clone()).await.unwrap().unwrap();

    assert_eq!(job.sent().len(), 1);
    let ours = h.server.sends_to(OUR_ADDR);
    assert_eq!(ours[0].device_ids(), vec![2]);
    assert_eq!(content_of(&ours[0]).sync_message.unwrap().read, reads);
}

// ============================================================
// Session reset
// ============================================================

#[tokio::test]
async fn test_close_session_sends_end_session() {
    let h = harness().await;
    known_bob(&h, &[1, 2]).await;
    h.server.publish_keys(BOB, &BOB_KEY, &[1, 2]);

    let job = sender(&h).close_session(BOB, true).await.unwrap();

    assert_eq!(job.sent().len(), 1);
    assert_eq!(
        h.sessions.ops(),
        vec![
            "close bob.1",
            "close bob.2",
            "init bob.1",
            "init bob.2",
            "encrypt bob.1",
            "encrypt bob.2",
            "close bob.1",
            "close bob.2",
        ]
    );
    assert!(!h.sessions.is_open(&Address::device(BOB, 1)).await);
    assert!(!h.sessions.is_open(&Address::device(BOB, 2)).await);

    let message = content_of(&h.server.sends_to(BOB)[0]).data_message.unwrap();
    assert_eq!(message.flags, DataMessage::END_SESSION);
    let control: Value = serde_json::from_str(message.body.as_deref().unwrap()).unwrap();
    assert_eq!(control[0]["data"]["control"], "closeSession");
    assert_eq!(control[0]["data"]["retransmit"], true);
}

// ============================================================
// Attachments
// ============================================================

#[tokio::test]
async fn test_attachments_uploaded_encrypted() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    let request = request(&[BOB]).attachment(OutgoingAttachment::Data {
        data: b"cat picture".to_vec(),
        content_type: Some("image/png".to_string()),
    });

    sender(&h).send(request).await.unwrap();

    let message = content_of(&h.server.sends_to(BOB)[0]).data_message.unwrap();
    assert_eq!(message.attachments.len(), 1);
    let pointer = &message.attachments[0];
    assert_eq!(pointer.id, "att-1");
    assert_eq!(pointer.content_type.as_deref(), Some("image/png"));
    let stored = h.server.state().attachments["att-1"].clone();
    assert_ne!(stored, b"cat picture".to_vec());
    assert_eq!(decrypt_attachment(&stored, &pointer.key).unwrap(), b"cat picture");
}

// ============================================================
// Validation
// ============================================================

#[tokio::test]
async fn test_invalid_requests_rejected() {
    let h = harness().await;
    let sender = sender(&h);

    let no_thread = SendRequest::new("", vec![BOB.to_string()], 1);
    assert!(matches!(sender.send(no_thread).await, Err(RelayError::Validation(_))));

    let no_timestamp = SendRequest::new("t", vec![BOB.to_string()], 0);
    assert!(matches!(sender.send(no_timestamp).await, Err(RelayError::Validation(_))));

    let no_addrs = SendRequest::new("t", Vec::new(), 1);
    assert!(matches!(sender.send(no_addrs).await, Err(RelayError::Validation(_))));

    let bad_device = SendRequest::new("t", vec!["bob.x".to_string()], 1);
    assert!(matches!(sender.send(bad_device).await, Err(RelayError::Address(_))));

    assert!(h.server.state().sends.is_empty());
}

#[tokio::test]
async fn test_send_requires_registration() {
    let h = unregistered_harness();
    let result = sender(&h).send(request(&[BOB])).await;
    assert!(matches!(result, Err(RelayError::InvalidState(_))));
}

// ============================================================
// Events
// ============================================================

#[tokio::test]
async fn test_entries_forwarded_to_sender_events() {
    let h = harness().await;
    known_bob(&h, &[1]).await;
    h.server.script_sends(CAROL, vec![Err((404, Value::Null))]);
    h.server.publish_keys(CAROL, &[2u8; 32], &[1]);
    let sender = sender(&h);
    let events = record(sender.events());

    let job = sender.send(request(&[BOB, CAROL])).await.unwrap();
    job.wait().await;

    let recorded = events.events();
    assert_eq!(recorded.len(), 2);
    assert!(recorded
        .iter()
        .any(|e| matches!(e, SenderEvent::Sent(s) if s.addr == BOB)));
    assert!(recorded
        .iter()
        .any(|e| matches!(e, SenderEvent::Error(err) if err.addr == CAROL && err.reason == "Unregistered user")));
}
