// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end scenarios driving two cooperating coordinators against an
//! in-memory homeserver.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use matrix_crypto_coordinator::{
    store::MemoryStore, AnyToDeviceEvent, CryptoCoordinator, DeviceKeys, EncryptedEvent,
    HomeserverClient, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest, KeysQueryResponse,
    KeysUploadRequest, KeysUploadResponse, LocalTrust, MegolmError, OlmError, OneTimeKey,
    RoomContext, SyncChanges, ToDeviceRequest, TransportError,
};
use ruma::{
    room_id, user_id, DeviceId, EventEncryptionAlgorithm, OwnedDeviceId, OwnedDeviceKeyId,
    OwnedUserId, RoomId, UserId,
};
use serde_json::json;

/// The shared state of the in-memory homeserver.
#[derive(Debug, Default)]
struct HomeserverState {
    device_keys: Mutex<HashMap<OwnedUserId, HashMap<OwnedDeviceId, DeviceKeys>>>,
    one_time_keys:
        Mutex<HashMap<(OwnedUserId, OwnedDeviceId), BTreeMap<OwnedDeviceKeyId, OneTimeKey>>>,
    inboxes: Mutex<HashMap<(OwnedUserId, OwnedDeviceId), Vec<AnyToDeviceEvent>>>,
    device_key_uploads: Mutex<HashMap<OwnedDeviceId, usize>>,
    claim_calls: Mutex<usize>,
}

#[derive(Debug, Default)]
struct Homeserver {
    state: Arc<HomeserverState>,
}

impl Homeserver {
    fn new() -> Self {
        Self::default()
    }

    /// The transport handle of a single device.
    fn client(&self, user_id: &UserId, device_id: &DeviceId) -> Arc<DeviceClient> {
        Arc::new(DeviceClient {
            state: self.state.clone(),
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
        })
    }

    fn one_time_key_count(&self, user_id: &UserId, device_id: &DeviceId) -> usize {
        self.state
            .one_time_keys
            .lock()
            .unwrap()
            .get(&(user_id.to_owned(), device_id.to_owned()))
            .map(|k| k.len())
            .unwrap_or(0)
    }

    fn device_key_uploads(&self, device_id: &DeviceId) -> usize {
        self.state
            .device_key_uploads
            .lock()
            .unwrap()
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    fn claim_calls(&self) -> usize {
        *self.state.claim_calls.lock().unwrap()
    }

    /// Drain the to-device inbox of a device.
    fn take_inbox(&self, user_id: &UserId, device_id: &DeviceId) -> Vec<AnyToDeviceEvent> {
        self.state
            .inboxes
            .lock()
            .unwrap()
            .remove(&(user_id.to_owned(), device_id.to_owned()))
            .unwrap_or_default()
    }

    fn inbox_len(&self, user_id: &UserId, device_id: &DeviceId) -> usize {
        self.state
            .inboxes
            .lock()
            .unwrap()
            .get(&(user_id.to_owned(), device_id.to_owned()))
            .map(|i| i.len())
            .unwrap_or(0)
    }
}

#[derive(Debug)]
struct DeviceClient {
    state: Arc<HomeserverState>,
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
}

#[async_trait]
impl HomeserverClient for DeviceClient {
    async fn upload_keys(
        &self,
        request: KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError> {
        if let Some(device_keys) = request.device_keys {
            self.state
                .device_keys
                .lock()
                .unwrap()
                .entry(self.user_id.clone())
                .or_default()
                .insert(self.device_id.clone(), device_keys);

            *self
                .state
                .device_key_uploads
                .lock()
                .unwrap()
                .entry(self.device_id.clone())
                .or_insert(0) += 1;
        }

        let mut pool = self.state.one_time_keys.lock().unwrap();
        let entry = pool
            .entry((self.user_id.clone(), self.device_id.clone()))
            .or_default();

        if let Some(one_time_keys) = request.one_time_keys {
            entry.extend(one_time_keys);
        }

        let mut response = KeysUploadResponse::default();
        response
            .one_time_key_counts
            .insert("signed_curve25519".to_owned(), entry.len() as u64);

        Ok(response)
    }

    async fn claim_one_time_keys(
        &self,
        request: KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError> {
        *self.state.claim_calls.lock().unwrap() += 1;

        let mut pool = self.state.one_time_keys.lock().unwrap();
        let mut response = KeysClaimResponse::default();

        for (user_id, devices) in request.one_time_keys {
            for (device_id, _) in devices {
                if let Some(keys) = pool.get_mut(&(user_id.clone(), device_id.clone())) {
                    if let Some(key_id) = keys.keys().next().cloned() {
                        let key = keys.remove(&key_id).unwrap();

                        let mut claimed = BTreeMap::new();
                        claimed.insert(key_id, key);

                        response
                            .one_time_keys
                            .entry(user_id.clone())
                            .or_default()
                            .insert(device_id, claimed);
                    }
                }
            }
        }

        Ok(response)
    }

    async fn query_keys(
        &self,
        request: KeysQueryRequest,
    ) -> Result<KeysQueryResponse, TransportError> {
        let known = self.state.device_keys.lock().unwrap();
        let mut response = KeysQueryResponse::default();

        for user_id in request.device_keys.keys() {
            if let Some(devices) = known.get(user_id) {
                response.device_keys.insert(
                    user_id.clone(),
                    devices
                        .iter()
                        .map(|(id, keys)| (id.clone(), keys.clone()))
                        .collect(),
                );
            }
        }

        Ok(response)
    }

    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError> {
        let known = self.state.device_keys.lock().unwrap();
        let mut inboxes = self.state.inboxes.lock().unwrap();

        for (user_id, devices) in &request.messages {
            for (target, content) in devices {
                let event = AnyToDeviceEvent {
                    sender: self.user_id.clone(),
                    event_type: request.event_type.clone(),
                    content: content.clone(),
                };

                match target {
                    matrix_crypto_coordinator::DeviceIdOrAllDevices::DeviceId(device_id) => {
                        inboxes
                            .entry((user_id.clone(), device_id.clone()))
                            .or_default()
                            .push(event);
                    }
                    matrix_crypto_coordinator::DeviceIdOrAllDevices::AllDevices => {
                        if let Some(devices) = known.get(user_id) {
                            for device_id in devices.keys() {
                                inboxes
                                    .entry((user_id.clone(), device_id.clone()))
                                    .or_default()
                                    .push(event.clone());
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn alice_id() -> &'static UserId {
    user_id!("@alice:localhost")
}

fn bob_id() -> &'static UserId {
    user_id!("@bob:localhost")
}

fn test_room() -> &'static RoomId {
    room_id!("!room:localhost")
}

async fn coordinator(
    server: &Homeserver,
    user_id: &UserId,
    device_id: &DeviceId,
) -> CryptoCoordinator {
    CryptoCoordinator::new(
        user_id,
        Some(device_id),
        Arc::new(MemoryStore::new()),
        server.client(user_id, device_id),
    )
    .await
    .unwrap()
}

/// Deliver everything queued for the coordinator's device.
async fn sync(server: &Homeserver, coordinator: &CryptoCoordinator) {
    let events = server.take_inbox(coordinator.user_id(), coordinator.device_id());

    coordinator
        .on_sync_completed(
            SyncChanges {
                to_device_events: events,
                ..Default::default()
            },
            None,
            false,
        )
        .await
        .unwrap();
}

fn room_context(joined: Vec<OwnedUserId>) -> RoomContext {
    RoomContext {
        room_id: test_room().to_owned(),
        joined_members: joined,
        invited_members: Vec::new(),
        should_encrypt_for_invited_members: false,
    }
}

/// Encrypt a simple text message in the test room.
async fn encrypt_message(
    coordinator: &CryptoCoordinator,
    members: Vec<OwnedUserId>,
) -> EncryptedEvent {
    let content = coordinator
        .encrypt_event(
            json!({"body": "It's a secret to everybody", "msgtype": "m.text"}),
            "m.room.message",
            &room_context(members),
        )
        .await
        .unwrap();

    EncryptedEvent {
        sender: coordinator.user_id().to_owned(),
        event_id: Some("$event:localhost".to_owned()),
        room_id: Some(test_room().to_owned()),
        origin_server_ts: Some(1_600_000_000_000),
        content,
    }
}

#[tokio::test]
async fn cold_start_uploads_device_and_one_time_keys() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;

    alice.start(true).await.unwrap();
    assert!(alice.is_started());

    // Exactly one upload carried the device keys.
    assert_eq!(server.device_key_uploads("ALICEDEVICE".into()), 1);

    // The server-held one-time key pool was filled to half of libolm's pool
    // maximum.
    assert_eq!(
        server.one_time_key_count(alice_id(), "ALICEDEVICE".into()),
        50
    );

    // A second start is a no-op, no double upload.
    alice.start(false).await.unwrap();
    assert_eq!(server.device_key_uploads("ALICEDEVICE".into()), 1);
}

#[tokio::test]
async fn device_id_is_generated_and_stable() {
    let server = Homeserver::new();
    let store = Arc::new(MemoryStore::new());

    let alice = CryptoCoordinator::new(
        alice_id(),
        None,
        store.clone(),
        server.client(alice_id(), "IGNORED".into()),
    )
    .await
    .unwrap();

    let device_id = alice.device_id().to_owned();
    let identity_key = alice.identity_key().to_owned();
    assert!(!device_id.as_str().is_empty());

    alice.close();

    // A new coordinator over the preserved store resumes the same identity.
    let resumed = CryptoCoordinator::new(
        alice_id(),
        None,
        store,
        server.client(alice_id(), "IGNORED".into()),
    )
    .await
    .unwrap();

    assert_eq!(resumed.device_id(), device_id);
    assert_eq!(resumed.identity_key(), identity_key);
}

#[tokio::test]
async fn concurrent_starts_coalesce() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;

    let first = alice.start(false);
    let second = alice.start(false);

    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    assert_eq!(server.device_key_uploads("ALICEDEVICE".into()), 1);
}

#[tokio::test]
async fn olm_sessions_are_established_with_claimed_keys() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;
    let bob = coordinator(&server, bob_id(), "BOBDEVICE".into()).await;

    alice.start(true).await.unwrap();
    bob.start(true).await.unwrap();

    // Make Bob's device known to Alice.
    let check = alice.check_unknown_devices(vec![bob_id().to_owned()]).await;
    assert!(matches!(check, Err(OlmError::UnknownDevices(_))));

    let bob_devices = alice.get_user_devices(bob_id()).await.unwrap();
    let mut devices_by_user = BTreeMap::new();
    devices_by_user.insert(
        bob_id().to_owned(),
        bob_devices.devices().cloned().collect::<Vec<_>>(),
    );

    let bob_device: &DeviceId = "BOBDEVICE".into();

    let claims_before = server.claim_calls();
    let result = alice
        .ensure_olm_sessions_for_devices(devices_by_user.clone())
        .await
        .unwrap();

    assert_eq!(server.claim_calls(), claims_before + 1);
    let session_id = result[bob_id()][bob_device].session_id.clone();
    assert!(session_id.is_some());

    // A second call reuses the session instead of claiming again.
    let result = alice
        .ensure_olm_sessions_for_devices(devices_by_user)
        .await
        .unwrap();
    assert_eq!(server.claim_calls(), claims_before + 1);
    assert_eq!(result[bob_id()][bob_device].session_id, session_id);
}

#[tokio::test]
async fn megolm_message_round_trips_between_two_coordinators() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;
    let bob = coordinator(&server, bob_id(), "BOBDEVICE".into()).await;

    alice.start(true).await.unwrap();
    bob.start(true).await.unwrap();

    alice.set_warn_on_unknown_devices(false).await.unwrap();
    assert!(alice
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            false,
            vec![alice_id().to_owned(), bob_id().to_owned()],
        )
        .await
        .unwrap());

    let event = encrypt_message(&alice, vec![alice_id().to_owned(), bob_id().to_owned()]).await;

    // The room key reached Bob as an encrypted to-device event.
    sync(&server, &bob).await;

    let decrypted = bob.decrypt_event(&event, Some("tl1")).await.unwrap();

    assert_eq!(
        decrypted.clear_event["content"]["body"],
        "It's a secret to everybody"
    );
    assert_eq!(decrypted.clear_event["type"], "m.room.message");
    assert_eq!(decrypted.sender_curve25519_key, alice.identity_key());
    assert_eq!(
        decrypted.claimed_ed25519_key.as_deref(),
        Some(alice.fingerprint_key())
    );
}

#[tokio::test]
async fn replay_is_rejected_within_a_timeline_only() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;
    let bob = coordinator(&server, bob_id(), "BOBDEVICE".into()).await;

    alice.start(true).await.unwrap();
    bob.start(true).await.unwrap();

    alice.set_warn_on_unknown_devices(false).await.unwrap();
    alice
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            false,
            vec![alice_id().to_owned(), bob_id().to_owned()],
        )
        .await
        .unwrap();

    let event = encrypt_message(&alice, vec![alice_id().to_owned(), bob_id().to_owned()]).await;
    sync(&server, &bob).await;

    bob.decrypt_event(&event, Some("tl1")).await.unwrap();

    // Same timeline: replay.
    assert!(matches!(
        bob.decrypt_event(&event, Some("tl1")).await,
        Err(MegolmError::Replay)
    ));

    // Another timeline is back-pagination, not replay.
    bob.decrypt_event(&event, Some("tl2")).await.unwrap();

    // Resetting the timeline clears its replay records.
    bob.reset_replay_attack_check_in_timeline("tl1").await;
    bob.decrypt_event(&event, Some("tl1")).await.unwrap();
}

#[tokio::test]
async fn late_room_key_decrypts_after_notification() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;
    let bob = coordinator(&server, bob_id(), "BOBDEVICE".into()).await;

    alice.start(true).await.unwrap();
    bob.start(true).await.unwrap();

    alice.set_warn_on_unknown_devices(false).await.unwrap();
    alice
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            false,
            vec![alice_id().to_owned(), bob_id().to_owned()],
        )
        .await
        .unwrap();

    let event = encrypt_message(&alice, vec![alice_id().to_owned(), bob_id().to_owned()]).await;

    // The ciphertext arrives before the room key.
    assert!(matches!(
        bob.decrypt_event(&event, Some("tl1")).await,
        Err(MegolmError::MissingSession)
    ));

    let mut room_keys = bob.room_keys_received_stream();

    sync(&server, &bob).await;

    let info = room_keys.recv().await.unwrap();
    assert_eq!(info.room_id, test_room());
    assert_eq!(info.sender_key, alice.identity_key());

    // The retry now succeeds.
    let decrypted = bob.decrypt_event(&event, Some("tl1")).await.unwrap();
    assert_eq!(
        decrypted.clear_event["content"]["body"],
        "It's a secret to everybody"
    );
}

#[tokio::test]
async fn verified_own_device_is_served_a_requested_key() {
    let server = Homeserver::new();
    let first = coordinator(&server, alice_id(), "FIRSTDEVICE".into()).await;
    let second = coordinator(&server, alice_id(), "SECONDDEVICE".into()).await;

    first.start(true).await.unwrap();
    second.start(true).await.unwrap();

    first.set_warn_on_unknown_devices(false).await.unwrap();
    first
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            true,
            vec![alice_id().to_owned()],
        )
        .await
        .unwrap();

    // Encrypt before the first device knows about the second one: the room
    // key never reaches it.
    let event = encrypt_message(&first, vec![alice_id().to_owned()]).await;

    assert!(matches!(
        second.decrypt_event(&event, None).await,
        Err(MegolmError::MissingSession)
    ));

    // Let the first device discover and verify the second one.
    let _ = first.check_unknown_devices(vec![alice_id().to_owned()]).await;
    first
        .set_device_verification(LocalTrust::Verified, alice_id(), "SECONDDEVICE".into())
        .await
        .unwrap();

    // The second device asks its sibling devices for the key.
    second.re_request_room_key_for_event(&event).await.unwrap();

    // The request reaches the first device with the next sync; serving it is
    // automatic because the requester is verified.
    sync(&server, &first).await;
    assert!(first.pending_key_requests().await.unwrap().is_empty());

    // The forwarded key reaches the second device.
    sync(&server, &second).await;

    let decrypted = second.decrypt_event(&event, None).await.unwrap();
    assert_eq!(
        decrypted.clear_event["content"]["body"],
        "It's a secret to everybody"
    );
    // Forwarded keys carry the forwarder in the key chain.
    assert_eq!(
        decrypted.forwarding_curve25519_key_chain,
        vec![first.identity_key().to_owned()]
    );
}

#[tokio::test]
async fn unverified_requesting_device_needs_a_user_decision() {
    let server = Homeserver::new();
    let first = coordinator(&server, alice_id(), "FIRSTDEVICE".into()).await;
    let second = coordinator(&server, alice_id(), "SECONDDEVICE".into()).await;

    first.start(true).await.unwrap();
    second.start(true).await.unwrap();

    first.set_warn_on_unknown_devices(false).await.unwrap();
    first
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            true,
            vec![alice_id().to_owned()],
        )
        .await
        .unwrap();

    let event = encrypt_message(&first, vec![alice_id().to_owned()]).await;

    let _ = first.check_unknown_devices(vec![alice_id().to_owned()]).await;
    first
        .set_devices_known(
            first
                .get_user_devices(alice_id())
                .await
                .unwrap()
                .devices()
                .cloned()
                .collect(),
        )
        .await
        .unwrap();

    second.re_request_room_key_for_event(&event).await.unwrap();
    sync(&server, &first).await;

    // The unverified device didn't get the key automatically.
    let pending = first.pending_key_requests().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].device_id, "SECONDDEVICE");

    // Accepting is the terminal share action.
    first
        .accept_key_request(pending.into_iter().next().unwrap())
        .await
        .unwrap();
    assert!(first.pending_key_requests().await.unwrap().is_empty());

    sync(&server, &second).await;
    second.decrypt_event(&event, None).await.unwrap();
}

#[tokio::test]
async fn blacklisted_and_unverified_devices_receive_no_keys() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;
    let bob = coordinator(&server, bob_id(), "BOBDEVICE".into()).await;

    alice.start(true).await.unwrap();
    bob.start(true).await.unwrap();

    alice.set_warn_on_unknown_devices(false).await.unwrap();
    alice
        .set_global_blacklist_unverified_devices(true)
        .await
        .unwrap();
    assert!(alice.global_blacklist_unverified_devices().await);

    alice
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            false,
            vec![alice_id().to_owned(), bob_id().to_owned()],
        )
        .await
        .unwrap();

    let event = encrypt_message(&alice, vec![alice_id().to_owned(), bob_id().to_owned()]).await;

    // No room key went out to Bob's unverified device.
    assert_eq!(server.inbox_len(bob_id(), "BOBDEVICE".into()), 0);

    sync(&server, &bob).await;
    assert!(matches!(
        bob.decrypt_event(&event, None).await,
        Err(MegolmError::MissingSession)
    ));
}

#[tokio::test]
async fn room_algorithm_is_write_once() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;

    alice.start(true).await.unwrap();

    assert!(alice
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            true,
            vec![alice_id().to_owned()],
        )
        .await
        .unwrap());

    // A differing algorithm is ignored, the stored one wins.
    assert!(!alice
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            true,
            vec![alice_id().to_owned()],
        )
        .await
        .unwrap());

    // Re-configuring with the stored algorithm stays fine.
    assert!(alice
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            true,
            vec![alice_id().to_owned()],
        )
        .await
        .unwrap());
}

#[tokio::test]
async fn exported_keys_can_be_imported_elsewhere() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;
    let bob = coordinator(&server, bob_id(), "BOBDEVICE".into()).await;

    alice.start(true).await.unwrap();
    bob.start(true).await.unwrap();

    alice.set_warn_on_unknown_devices(false).await.unwrap();
    alice
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            true,
            vec![alice_id().to_owned()],
        )
        .await
        .unwrap();

    // Bob was never a recipient; he can only get the key via an export.
    let event = encrypt_message(&alice, vec![alice_id().to_owned()]).await;

    let export = alice
        .export_room_keys("passphrase".to_owned(), 10)
        .await
        .unwrap();

    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress_records = progress.clone();

    let result = bob
        .import_room_keys(export, "passphrase".to_owned(), move |done, total| {
            progress_records.lock().unwrap().push((done, total));
        })
        .await
        .unwrap();

    assert_eq!(result.imported_count, 1);
    assert_eq!(result.total_count, 1);
    assert_eq!(progress.lock().unwrap().last(), Some(&(1, 1)));

    let decrypted = bob.decrypt_event(&event, Some("tl1")).await.unwrap();
    assert_eq!(
        decrypted.clear_event["content"]["body"],
        "It's a secret to everybody"
    );

    // Importing the same export again isn't an improvement.
    let export = alice
        .export_room_keys("passphrase".to_owned(), 10)
        .await
        .unwrap();
    let result = bob
        .import_room_keys(export, "passphrase".to_owned(), |_, _| {})
        .await
        .unwrap();
    assert_eq!(result.imported_count, 0);
}

#[tokio::test]
async fn closed_coordinator_rejects_work() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;

    alice.start(true).await.unwrap();
    alice.close();

    assert!(matches!(
        alice.start(false).await,
        Err(OlmError::Closed)
    ));

    let result = alice
        .encrypt_event(
            json!({"body": "hello"}),
            "m.room.message",
            &room_context(vec![alice_id().to_owned()]),
        )
        .await;
    assert!(matches!(result, Err(OlmError::Closed)));
}

#[tokio::test]
async fn sender_binding_is_enforced_on_to_device_messages() {
    let server = Homeserver::new();
    let alice = coordinator(&server, alice_id(), "ALICEDEVICE".into()).await;
    let bob = coordinator(&server, bob_id(), "BOBDEVICE".into()).await;

    alice.start(true).await.unwrap();
    bob.start(true).await.unwrap();

    alice.set_warn_on_unknown_devices(false).await.unwrap();
    alice
        .set_encryption_in_room(
            test_room(),
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            false,
            vec![alice_id().to_owned(), bob_id().to_owned()],
        )
        .await
        .unwrap();

    let event = encrypt_message(&alice, vec![alice_id().to_owned(), bob_id().to_owned()]).await;

    // Tamper with the sender of the room key event before delivering it.
    let mut events = server.take_inbox(bob_id(), "BOBDEVICE".into());
    for event in &mut events {
        event.sender = user_id!("@eve:localhost").to_owned();
    }

    bob.on_sync_completed(
        SyncChanges {
            to_device_events: events,
            ..Default::default()
        },
        None,
        false,
    )
    .await
    .unwrap();

    // The tampered key was rejected, so the event stays undecryptable.
    assert!(matches!(
        bob.decrypt_event(&event, None).await,
        Err(MegolmError::MissingSession)
    ));
}
