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

//! The end-to-end encryption coordinator.
//!
//! Orchestrates device identity, Olm session establishment, per-room Megolm
//! encryption and decryption, room key distribution and the key request
//! protocol on top of the libolm primitive, a key store and the homeserver
//! client the host supplies.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use ruma::{
    DeviceId, EventEncryptionAlgorithm, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId,
};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    algorithms::{AlgorithmParts, AlgorithmRegistry, RoomDecryptor, RoomEncryptor},
    context::SerialContext,
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    file_encryption::{decrypt_key_export, encrypt_key_export},
    gossip::{
        IncomingKeyRequestQueue, IncomingRoomKeyRequest, KeyRequestNotification,
        OutgoingRequestManager,
    },
    identities::{DeviceIdentity, DeviceListTracker, LocalTrust},
    olm::{Account, EncryptionSettings, InboundGroupSession, ReplayLedger, Session},
    requests::{DeviceIdOrAllDevices, HomeserverClient, KeysUploadRequest},
    session_manager::{OlmSessionResult, SessionManager},
    store::{CryptoStore, CryptoStoreError, RoomSettings, Store, UserDevices},
    types::{
        AnyToDeviceEvent, DecryptionResult, EncryptedEvent, EncryptedEventContent,
        ForwardedRoomKeyContent, MembershipState, RequestedKeyInfo, RoomContext, RoomKeyContent,
        RoomKeyInfo, RoomKeyRequestContent, SyncChanges,
    },
};

/// How many one-time keys are generated per batch; generation is expensive
/// and batching bounds the stalls it causes.
const ONE_TIME_KEY_GENERATION_MAX_NUMBER: usize = 5;

/// Minimum interval between two one-time key replenishments.
const ONE_TIME_KEY_UPLOAD_PERIOD: Duration = Duration::from_secs(60);

/// Delay before a failed startup is retried.
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The store key the generated device id is persisted under.
const DEVICE_ID_KEY: &str = "device_id";

/// The result of a room key import.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of sessions that were imported.
    pub imported_count: usize,
    /// The total number of sessions in the export.
    pub total_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartPhase {
    Idle,
    Starting,
    Started,
}

struct StartState {
    phase: StartPhase,
    waiters: Vec<oneshot::Sender<Result<(), String>>>,
}

struct OtkState {
    check_in_progress: bool,
    last_check: Option<Instant>,
}

/// The end-to-end crypto coordinator of a Matrix client.
///
/// All state mutating work is funneled through two serial contexts, one for
/// the outbound (encrypt) side and one for the inbound (decrypt) side;
/// host-visible notifications are delivered through a third. The public
/// methods can be called from any task.
#[derive(Clone)]
pub struct CryptoCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for CryptoCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoCoordinator")
            .field("user_id", &self.inner.user_id)
            .field("device_id", &self.inner.device_id)
            .finish()
    }
}

struct CoordinatorInner {
    user_id: Arc<OwnedUserId>,
    device_id: Arc<OwnedDeviceId>,
    account: Account,
    store: Store,
    transport: Arc<dyn HomeserverClient>,

    encrypt_context: SerialContext,
    decrypt_context: SerialContext,
    callback_context: SerialContext,

    device_tracker: DeviceListTracker,
    session_manager: SessionManager,
    outgoing_requests: OutgoingRequestManager,
    incoming_requests: IncomingKeyRequestQueue,

    registry: AlgorithmRegistry,
    room_encryptors: DashMap<OwnedRoomId, Arc<dyn RoomEncryptor>>,
    room_decryptors: DashMap<OwnedRoomId, Arc<dyn RoomDecryptor>>,

    replay_ledger: Arc<ReplayLedger>,
    room_keys_sender: broadcast::Sender<RoomKeyInfo>,

    start_state: StdMutex<StartState>,
    otk_state: Mutex<OtkState>,
    connectivity: StdMutex<Option<watch::Receiver<bool>>>,
    encrypt_to_invited: AtomicBool,
    closed: AtomicBool,
}

impl CryptoCoordinator {
    /// Create a new coordinator, restoring a previously stored identity if
    /// the store holds one.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The id of the user that owns this device.
    ///
    /// * `device_id` - The device id the session was created with, if any.
    ///   When absent, a previously stored id is reused or a fresh UUID is
    ///   generated and persisted.
    ///
    /// * `store` - The key store persisting the cryptographic state.
    ///
    /// * `transport` - The homeserver client carrying our requests.
    pub async fn new(
        user_id: &UserId,
        device_id: Option<&DeviceId>,
        store: Arc<dyn CryptoStore>,
        transport: Arc<dyn HomeserverClient>,
    ) -> Result<Self, CryptoStoreError> {
        let store = Store::new(store);

        let account = match store.load_account().await? {
            Some(pickle) => {
                if pickle.user_id != user_id {
                    return Err(CryptoStoreError::MismatchedAccount);
                }

                if let Some(device_id) = device_id {
                    if pickle.device_id != device_id {
                        warn!(
                            stored = pickle.device_id.as_str(),
                            requested = device_id.as_str(),
                            "The store holds an account for another device id"
                        );
                        return Err(CryptoStoreError::MismatchedAccount);
                    }
                }

                let account = Account::from_pickle(pickle)?;
                debug!(
                    ed25519 = account.ed25519_key(),
                    curve25519 = account.curve25519_key(),
                    "Restored an Olm account"
                );
                account
            }
            None => {
                let device_id: OwnedDeviceId = match device_id {
                    Some(d) => d.to_owned(),
                    None => match store.get_object::<String>(DEVICE_ID_KEY).await? {
                        Some(stored) => stored.as_str().into(),
                        None => {
                            let generated: OwnedDeviceId =
                                Uuid::new_v4().to_string().as_str().into();
                            store
                                .save_object(DEVICE_ID_KEY, &generated.to_string())
                                .await?;
                            info!(device_id = generated.as_str(), "Generated a new device id");
                            generated
                        }
                    },
                };

                let account = Account::new(user_id, &device_id);
                store.save_account(account.pickle().await).await?;
                debug!(
                    ed25519 = account.ed25519_key(),
                    curve25519 = account.curve25519_key(),
                    "Created a new Olm account"
                );
                account
            }
        };

        let user_id = account.user_id.clone();
        let device_id = account.device_id.clone();

        // Our own device is part of the known devices of our user.
        let own_device = account.own_device().await;
        store.save_devices(&[own_device]).await?;
        store.update_tracked_user(&user_id, true).await?;

        let session_manager =
            SessionManager::new(account.clone(), store.clone(), transport.clone());
        let device_tracker = DeviceListTracker::new(
            user_id.clone(),
            device_id.clone(),
            store.clone(),
            transport.clone(),
        );
        let outgoing_requests =
            OutgoingRequestManager::new(device_id.clone(), store.clone(), transport.clone());

        let (notifications, _) = broadcast::channel(64);
        let incoming_requests = IncomingKeyRequestQueue::new(
            user_id.clone(),
            device_id.clone(),
            store.clone(),
            notifications,
        );

        let (room_keys_sender, _) = broadcast::channel(64);

        let inner = Arc::new(CoordinatorInner {
            user_id,
            device_id,
            account,
            store,
            transport,
            encrypt_context: SerialContext::new("encrypt"),
            decrypt_context: SerialContext::new("decrypt"),
            callback_context: SerialContext::new("callbacks"),
            device_tracker,
            session_manager,
            outgoing_requests,
            incoming_requests,
            registry: AlgorithmRegistry::default(),
            room_encryptors: DashMap::new(),
            room_decryptors: DashMap::new(),
            replay_ledger: Arc::new(ReplayLedger::new()),
            room_keys_sender,
            start_state: StdMutex::new(StartState {
                phase: StartPhase::Idle,
                waiters: Vec::new(),
            }),
            otk_state: Mutex::new(OtkState {
                check_in_progress: false,
                last_check: None,
            }),
            connectivity: StdMutex::new(None),
            encrypt_to_invited: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// The user this coordinator encrypts for.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// The id of our own device.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Our long lived curve25519 identity key.
    pub fn identity_key(&self) -> &str {
        self.inner.account.curve25519_key()
    }

    /// Our long lived ed25519 fingerprint key.
    pub fn fingerprint_key(&self) -> &str {
        self.inner.account.ed25519_key()
    }

    /// Attach a network connectivity observer.
    ///
    /// While the observer reports `false`, startup is deferred until
    /// connectivity returns.
    pub fn set_connectivity_observer(&self, observer: watch::Receiver<bool>) {
        *self.inner.connectivity.lock().expect("connectivity lock") = Some(observer);
    }

    /// Should room keys also be encrypted for invited members, where the
    /// room's join rules allow it.
    pub fn set_encrypt_to_invited_members(&self, enabled: bool) {
        self.inner
            .encrypt_to_invited
            .store(enabled, Ordering::Relaxed);
    }

    /// Has startup completed.
    pub fn is_started(&self) -> bool {
        self.inner.start_state.lock().expect("start lock").phase == StartPhase::Started
    }

    /// Start the coordinator: upload our device keys, replenish one-time
    /// keys and begin serving requests.
    ///
    /// Concurrent calls coalesce; only one startup sequence runs. Transport
    /// failures are retried once per second until startup succeeds.
    ///
    /// # Arguments
    ///
    /// * `is_initial_sync` - True when the client is doing its first sync:
    ///   every tracked device list is invalidated and refreshed instead of
    ///   trusting the stored state.
    pub async fn start(&self, is_initial_sync: bool) -> OlmResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        let (sender, receiver) = oneshot::channel();

        let launch = {
            let mut state = self.inner.start_state.lock().expect("start lock");

            match state.phase {
                StartPhase::Started => return Ok(()),
                StartPhase::Starting => {
                    state.waiters.push(sender);
                    false
                }
                StartPhase::Idle => {
                    state.waiters.push(sender);
                    state.phase = StartPhase::Starting;
                    true
                }
            }
        };

        if launch {
            CoordinatorInner::post_startup(self.inner.clone(), is_initial_sync);
        }

        match receiver.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(OlmError::Startup(e)),
            Err(_) => Err(OlmError::Closed),
        }
    }

    /// Feed the coordinator the relevant parts of a finished sync.
    ///
    /// To-device events are decrypted and dispatched, device list changes
    /// applied and, outside of catch-up, one-time keys replenished and the
    /// key request queues drained.
    pub async fn on_sync_completed(
        &self,
        sync: SyncChanges,
        from_token: Option<&str>,
        is_catching_up: bool,
    ) -> OlmResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        trace!(token = ?from_token, is_catching_up, "Processing a finished sync");

        let (encrypted_events, plain_events): (Vec<_>, Vec<_>) = sync
            .to_device_events
            .iter()
            .cloned()
            .partition(|e| e.event_type == "m.room.encrypted");

        // Inbound key material first, on the decrypt context.
        {
            let inner = self.inner.clone();
            self.inner
                .decrypt_context
                .run(async move {
                    for event in encrypted_events {
                        if let Err(e) =
                            CoordinatorInner::receive_encrypted_to_device(&inner, &event).await
                        {
                            warn!(error = ?e, "Failed to handle an encrypted to-device event");
                        }
                    }

                    for event in plain_events.iter().filter(|e| {
                        e.event_type == "m.room_key" || e.event_type == "m.forwarded_room_key"
                    }) {
                        if let Err(e) = inner.receive_plaintext_room_key(event).await {
                            warn!(error = ?e, "Failed to handle a room key event");
                        }
                    }
                })
                .await
                .map_err(|_| OlmError::Closed)?;
        }

        // Everything else on the encrypt context.
        let inner = self.inner.clone();
        let device_lists = sync.device_lists.clone();
        let otk_count = sync.signed_curve25519_count();
        let key_requests: Vec<(OwnedUserId, RoomKeyRequestContent)> = sync
            .to_device_events
            .iter()
            .filter(|e| e.event_type == "m.room_key_request")
            .filter_map(|e| {
                match serde_json::from_value::<RoomKeyRequestContent>(e.content.clone()) {
                    Ok(content) => Some((e.sender.clone(), content)),
                    Err(error) => {
                        warn!(?error, "Received a malformed room key request");
                        None
                    }
                }
            })
            .collect();

        self.inner
            .encrypt_context
            .run(async move {
                CoordinatorInner::encrypt_side_sync(
                    &inner,
                    device_lists,
                    otk_count,
                    key_requests,
                    is_catching_up,
                )
                .await
            })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Enable encryption in a room.
    ///
    /// Fails if the algorithm has no registered implementation. A differing
    /// algorithm for an already configured room is ignored with an error
    /// logged, the stored algorithm wins; `Ok(false)` reports that case.
    pub async fn set_encryption_in_room(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
        inhibit_device_query: bool,
        members: Vec<OwnedUserId>,
    ) -> OlmResult<bool> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        let inner = self.inner.clone();
        let room_id = room_id.to_owned();

        self.inner
            .encrypt_context
            .run(async move {
                inner
                    .set_encryption_in_room(&room_id, algorithm, inhibit_device_query, members)
                    .await
            })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Is encryption configured for the given room.
    pub async fn is_room_encrypted(&self, room_id: &RoomId) -> bool {
        matches!(self.inner.store.get_room_settings(room_id).await, Ok(Some(_)))
    }

    /// Encrypt an event for a room.
    ///
    /// Ensures the coordinator is started, resolves the recipient set from
    /// the room snapshot, distributes the room key and returns the encrypted
    /// content.
    pub async fn encrypt_event(
        &self,
        content: Value,
        event_type: &str,
        room: &RoomContext,
    ) -> OlmResult<EncryptedEventContent> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        if !self.is_started() {
            self.start(false).await?;
        }

        let users =
            room.recipients(self.inner.encrypt_to_invited.load(Ordering::Relaxed));

        let encryptor = self.inner.encryptor_for_room(&room.room_id).await?;

        let event_type = event_type.to_owned();
        self.inner
            .encrypt_context
            .run(async move { encryptor.encrypt(&event_type, content, &users).await })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Decrypt a room event.
    ///
    /// The timeline id scopes replay protection: the same Megolm message
    /// index may decrypt once per timeline.
    pub async fn decrypt_event(
        &self,
        event: &EncryptedEvent,
        timeline_id: Option<&str>,
    ) -> MegolmResult<DecryptionResult> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MegolmError::Closed);
        }

        let room_id = event
            .room_id
            .clone()
            .ok_or_else(|| EventError::MissingField("room_id".to_owned()))?;

        let decryptor = self
            .inner
            .decryptor_for_room(&room_id, &event.content.algorithm())
            .ok_or_else(|| MegolmError::EventError(EventError::UnsupportedAlgorithm))?;

        let event = event.clone();
        let timeline_id = timeline_id.map(|t| t.to_owned());

        self.inner
            .decrypt_context
            .run(async move { decryptor.decrypt_event(&event, timeline_id.as_deref()).await })
            .await
            .map_err(|_| MegolmError::Closed)?
    }

    /// Drop the replay protection records of a discarded timeline.
    pub async fn reset_replay_attack_check_in_timeline(&self, timeline_id: &str) {
        let inner = self.inner.clone();
        let timeline_id = timeline_id.to_owned();

        let _ = self
            .inner
            .decrypt_context
            .run(async move { inner.replay_ledger.reset_timeline(&timeline_id) })
            .await;
    }

    /// Make sure we share an Olm session with every given device.
    pub async fn ensure_olm_sessions_for_devices(
        &self,
        devices_by_user: BTreeMap<OwnedUserId, Vec<DeviceIdentity>>,
    ) -> OlmResult<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, OlmSessionResult>>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        let inner = self.inner.clone();

        self.inner
            .encrypt_context
            .run(async move { inner.session_manager.ensure_sessions(&devices_by_user).await })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Make sure we share an Olm session with every known device of the
    /// given users.
    pub async fn ensure_olm_sessions_for_users(
        &self,
        users: Vec<OwnedUserId>,
    ) -> OlmResult<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, OlmSessionResult>>> {
        let mut devices_by_user = BTreeMap::new();

        for user in users {
            let devices = self.inner.store.get_user_devices(&user).await?;
            devices_by_user.insert(
                user,
                devices
                    .devices()
                    .filter(|d| {
                        d.curve25519_key().map(|k| k.as_str())
                            != Some(self.inner.account.curve25519_key())
                    })
                    .cloned()
                    .collect(),
            );
        }

        self.ensure_olm_sessions_for_devices(devices_by_user).await
    }

    /// Get a stored device of a user.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Option<DeviceIdentity> {
        self.inner
            .store
            .get_device(user_id, device_id)
            .await
            .ok()
            .flatten()
    }

    /// Get all stored devices of a user.
    pub async fn get_user_devices(&self, user_id: &UserId) -> OlmResult<UserDevices> {
        Ok(self.inner.store.get_user_devices(user_id).await?)
    }

    /// Find the device of a user owning the given curve25519 identity key.
    pub async fn device_with_identity_key(
        &self,
        user_id: &UserId,
        identity_key: &str,
    ) -> Option<DeviceIdentity> {
        let devices = self.inner.store.get_user_devices(user_id).await.ok()?;

        let device = devices
            .devices()
            .find(|d| d.curve25519_key().map(|k| k.as_str()) == Some(identity_key))
            .cloned();
        device
    }

    /// Set the local verification state of a device.
    pub async fn set_device_verification(
        &self,
        trust: LocalTrust,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> OlmResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        let inner = self.inner.clone();
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();

        self.inner
            .encrypt_context
            .run(async move {
                let device = inner
                    .store
                    .get_device(&user_id, &device_id)
                    .await?
                    .ok_or(OlmError::MissingSession)?;

                device.set_trust_state(trust);
                inner.store.save_devices(&[device]).await?;

                Ok(())
            })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Mark the given devices as known: every device in UNKNOWN state moves
    /// to UNVERIFIED.
    ///
    /// This is a UX convenience for the unknown-device send gate; it
    /// implicitly waives the verification decision for those devices.
    pub async fn set_devices_known(&self, devices: Vec<DeviceIdentity>) -> OlmResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        let inner = self.inner.clone();

        self.inner
            .encrypt_context
            .run(async move {
                let mut updated = Vec::new();

                for device in devices {
                    if device.is_unknown() {
                        device.set_trust_state(LocalTrust::Unverified);
                        updated.push(device);
                    }
                }

                inner.store.save_devices(&updated).await?;
                Ok(())
            })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Check whether the given users own devices we never assessed.
    ///
    /// Downloads fresh device lists and fails with
    /// [`OlmError::UnknownDevices`] carrying the offending devices if any
    /// are found. Host UIs use this as the "new devices detected" gate
    /// before sending.
    pub async fn check_unknown_devices(&self, user_ids: Vec<OwnedUserId>) -> OlmResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        let inner = self.inner.clone();

        self.inner
            .encrypt_context
            .run(async move {
                inner
                    .device_tracker
                    .force_download_device_lists(&user_ids)
                    .await?;

                let mut unknown: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>> = BTreeMap::new();

                for user_id in &user_ids {
                    let devices = inner.store.get_user_devices(user_id).await?;

                    for device in devices.devices().filter(|d| d.is_unknown()) {
                        unknown
                            .entry(user_id.clone())
                            .or_insert_with(Vec::new)
                            .push(device.device_id().to_owned());
                    }
                }

                if unknown.is_empty() {
                    Ok(())
                } else {
                    Err(OlmError::UnknownDevices(unknown))
                }
            })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Export all inbound Megolm sessions as a passphrase protected blob.
    ///
    /// An iteration count of zero produces an unencrypted export.
    pub async fn export_room_keys(
        &self,
        passphrase: String,
        rounds: u32,
    ) -> MegolmResult<String> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MegolmError::Closed);
        }

        let inner = self.inner.clone();

        self.inner
            .decrypt_context
            .run(async move {
                let sessions = inner.store.get_inbound_group_sessions().await?;

                let mut exported = Vec::with_capacity(sessions.len());
                for session in sessions {
                    exported.push(session.export().await);
                }

                Ok(encrypt_key_export(&exported, &passphrase, rounds)?)
            })
            .await
            .map_err(|_| MegolmError::Closed)?
    }

    /// Import room keys from a previously exported blob.
    ///
    /// Outstanding key requests for imported sessions are cancelled and the
    /// matching decryptors notified so queued events can be retried.
    /// `progress` is reported as (processed, total).
    pub async fn import_room_keys(
        &self,
        blob: String,
        passphrase: String,
        progress: impl Fn(usize, usize) + Send + 'static,
    ) -> MegolmResult<RoomKeyImportResult> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MegolmError::Closed);
        }

        let inner = self.inner.clone();

        self.inner
            .decrypt_context
            .run(async move {
                let exported = decrypt_key_export(&blob, &passphrase)?;

                CoordinatorInner::import_exported_keys(&inner, exported, progress).await
            })
            .await
            .map_err(|_| MegolmError::Closed)?
    }

    /// Request a room key from the given devices.
    pub async fn request_room_key(
        &self,
        body: RequestedKeyInfo,
        recipients: Vec<(OwnedUserId, DeviceIdOrAllDevices)>,
    ) -> OlmResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        let inner = self.inner.clone();

        self.inner
            .encrypt_context
            .run(async move { inner.outgoing_requests.request_key(body, recipients).await })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Withdraw a previously issued room key request.
    pub async fn cancel_room_key_request(&self, body: RequestedKeyInfo) -> OlmResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        let inner = self.inner.clone();

        self.inner
            .encrypt_context
            .run(async move { inner.outgoing_requests.cancel_request(&body).await })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Cancel and re-issue the key request for an event that still fails to
    /// decrypt.
    pub async fn re_request_room_key_for_event(&self, event: &EncryptedEvent) -> OlmResult<()> {
        let room_id = match &event.room_id {
            Some(r) => r.clone(),
            None => return Err(EventError::MissingField("room_id".to_owned()).into()),
        };

        let (sender_key, session_id) = match &event.content {
            EncryptedEventContent::MegolmV1AesSha2 {
                sender_key,
                session_id,
                ..
            } => (sender_key.clone(), session_id.clone()),
            _ => return Err(EventError::UnsupportedAlgorithm.into()),
        };

        let body = RequestedKeyInfo {
            algorithm: event.content.algorithm(),
            room_id,
            sender_key,
            session_id,
        };

        let recipients = vec![(
            (*self.inner.user_id).clone(),
            DeviceIdOrAllDevices::AllDevices,
        )];

        let inner = self.inner.clone();

        self.inner
            .encrypt_context
            .run(async move {
                inner
                    .outgoing_requests
                    .resend_request(body, recipients)
                    .await
            })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Should unverified devices be excluded from key distribution globally.
    pub async fn global_blacklist_unverified_devices(&self) -> bool {
        self.inner
            .store
            .global_blacklist_unverified_devices()
            .await
            .unwrap_or(false)
    }

    /// Set the global unverified-device blacklist switch.
    pub async fn set_global_blacklist_unverified_devices(&self, blacklist: bool) -> OlmResult<()> {
        Ok(self
            .inner
            .store
            .set_global_blacklist_unverified_devices(blacklist)
            .await?)
    }

    /// Is the per-room unverified-device blacklist active for the room.
    pub async fn room_blacklist_unverified_devices(&self, room_id: &RoomId) -> bool {
        self.inner
            .store
            .get_room_settings(room_id)
            .await
            .ok()
            .flatten()
            .map(|s| s.blacklist_unverified_devices)
            .unwrap_or(false)
    }

    /// Toggle the per-room unverified-device blacklist.
    pub async fn set_room_blacklist_unverified_devices(
        &self,
        room_id: &RoomId,
        blacklist: bool,
    ) -> OlmResult<()> {
        if let Some(mut settings) = self.inner.store.get_room_settings(room_id).await? {
            settings.blacklist_unverified_devices = blacklist;
            self.inner
                .store
                .save_room_settings(room_id, &settings)
                .await?;
        }

        Ok(())
    }

    /// Should encryption fail while the room contains devices the user never
    /// assessed.
    pub async fn warn_on_unknown_devices(&self) -> bool {
        self.inner.store.warn_on_unknown_devices().await.unwrap_or(true)
    }

    /// Toggle the unknown-device warning.
    pub async fn set_warn_on_unknown_devices(&self, warn: bool) -> OlmResult<()> {
        Ok(self.inner.store.set_warn_on_unknown_devices(warn).await?)
    }

    /// Subscribe to incoming key request notifications.
    pub fn key_request_notifications(&self) -> broadcast::Receiver<KeyRequestNotification> {
        self.inner.incoming_requests.subscribe()
    }

    /// Subscribe to the stream of newly usable room keys.
    pub fn room_keys_received_stream(&self) -> broadcast::Receiver<RoomKeyInfo> {
        self.inner.room_keys_sender.subscribe()
    }

    /// The incoming key requests waiting for a user decision.
    pub async fn pending_key_requests(&self) -> OlmResult<Vec<IncomingRoomKeyRequest>> {
        self.inner.incoming_requests.pending_requests().await
    }

    /// Serve a pending key request: share the keys and delete the request.
    pub async fn accept_key_request(&self, request: IncomingRoomKeyRequest) -> OlmResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OlmError::Closed);
        }

        let inner = self.inner.clone();

        self.inner
            .encrypt_context
            .run(async move {
                let decryptor = inner
                    .decryptor_for_room(&request.body.room_id, &request.body.algorithm)
                    .ok_or_else(|| {
                        OlmError::EncryptionNotEnabled("no decryptor for the algorithm".to_owned())
                    })?;

                let device = inner
                    .store
                    .get_device(&request.user_id, &request.device_id)
                    .await?
                    .ok_or(OlmError::MissingSession)?;

                decryptor.share_keys_with_device(&device, &request.body).await?;
                inner.incoming_requests.remove_persisted(&request).await?;

                Ok(())
            })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Reject a pending key request: delete it without sharing anything.
    pub async fn ignore_key_request(&self, request: IncomingRoomKeyRequest) -> OlmResult<()> {
        let inner = self.inner.clone();

        self.inner
            .encrypt_context
            .run(async move { inner.incoming_requests.remove_persisted(&request).await })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// React to a membership change in an encryption-active room.
    ///
    /// Joining users become tracked; invited users too, when the invitee
    /// policy allows encrypting for them. A leaving member invalidates the
    /// room's outbound session so the next message rotates it.
    pub async fn on_room_member_event(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: MembershipState,
    ) -> OlmResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.inner.store.get_room_settings(room_id).await?.is_none() {
            return Ok(());
        }

        let inner = self.inner.clone();
        let room_id = room_id.to_owned();
        let user_id = user_id.to_owned();
        let encrypt_to_invited = self.inner.encrypt_to_invited.load(Ordering::Relaxed);

        self.inner
            .encrypt_context
            .run(async move {
                match membership {
                    MembershipState::Join => {
                        inner.device_tracker.start_tracking(&user_id).await?;
                    }
                    MembershipState::Invite if encrypt_to_invited => {
                        inner.device_tracker.start_tracking(&user_id).await?;
                    }
                    MembershipState::Leave | MembershipState::Ban => {
                        if let Some(encryptor) = inner.room_encryptors.get(&room_id) {
                            encryptor.invalidate_outbound_session();
                        }
                    }
                    _ => {}
                }

                Ok(())
            })
            .await
            .map_err(|_| OlmError::Closed)?
    }

    /// Shut the coordinator down.
    ///
    /// Stops the worker contexts and rejects further work. The stored
    /// identity is left untouched: a new coordinator over the same store
    /// resumes with the same keys.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing the crypto coordinator");

        self.inner.encrypt_context.close();
        self.inner.decrypt_context.close();
        self.inner.callback_context.close();

        let mut state = self.inner.start_state.lock().expect("start lock");
        state.phase = StartPhase::Idle;
        state.waiters.clear();
    }
}

impl CoordinatorInner {
    /// Queue the startup sequence on the encrypt context.
    fn post_startup(inner: Arc<Self>, is_initial_sync: bool) {
        let context = inner.encrypt_context.clone();
        let _ = context.post(async move {
            Self::run_startup(inner, is_initial_sync).await;
        });
    }

    async fn run_startup(inner: Arc<Self>, is_initial_sync: bool) {
        // Wait for connectivity before hitting the network.
        let observer = inner.connectivity.lock().expect("connectivity lock").clone();
        if let Some(mut observer) = observer {
            if !*observer.borrow() {
                debug!("Network is down, deferring startup until connectivity returns");
                let retry_inner = inner.clone();
                tokio::spawn(async move {
                    while !*observer.borrow() {
                        if observer.changed().await.is_err() {
                            return;
                        }
                    }
                    Self::post_startup(retry_inner, is_initial_sync);
                });
                return;
            }
        }

        match inner.startup_sequence().await {
            Ok(()) => {
                {
                    let mut state = inner.start_state.lock().expect("start lock");
                    state.phase = StartPhase::Started;
                }

                inner.flush_start_waiters(Ok(()));

                info!("Crypto coordinator started");

                if is_initial_sync {
                    if let Err(e) = inner.device_tracker.mark_all_tracked_as_stale().await {
                        warn!(error = ?e, "Failed to invalidate the tracked device lists");
                    }
                    if let Err(e) = inner.device_tracker.refresh_outdated_device_lists().await {
                        warn!(error = ?e, "Failed to refresh device lists after startup");
                    }
                } else if let Err(e) = Self::drain_incoming_key_requests(&inner).await {
                    warn!(error = ?e, "Failed to drain the incoming key request queue");
                }
            }
            Err(e) => {
                let retryable = match &e {
                    OlmError::Transport(t) => t.is_retryable(),
                    _ => false,
                };

                {
                    let mut state = inner.start_state.lock().expect("start lock");
                    state.phase = StartPhase::Idle;
                }

                if retryable {
                    warn!(error = ?e, "Startup failed, retrying in a second");
                    let retry_inner = inner.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(STARTUP_RETRY_DELAY).await;

                        if retry_inner.closed.load(Ordering::SeqCst) {
                            return;
                        }

                        let launch = {
                            let mut state =
                                retry_inner.start_state.lock().expect("start lock");
                            if state.phase == StartPhase::Idle {
                                state.phase = StartPhase::Starting;
                                true
                            } else {
                                false
                            }
                        };

                        if launch {
                            Self::post_startup(retry_inner, is_initial_sync);
                        }
                    });
                } else {
                    error!(error = ?e, "Startup failed");
                    inner.flush_start_waiters(Err(e.to_string()));
                }
            }
        }
    }

    /// The strictly ordered startup tasks: device key upload, then one-time
    /// key replenishment, then enabling the request manager.
    async fn startup_sequence(&self) -> OlmResult<()> {
        if !self.account.shared() {
            debug!("Uploading the device keys");

            let device_keys = self.account.device_keys().await;
            let response = self
                .transport
                .upload_keys(KeysUploadRequest {
                    device_keys: Some(device_keys),
                    one_time_keys: None,
                })
                .await?;

            self.account.mark_as_shared();
            self.account
                .update_uploaded_key_count(response.signed_curve25519_count());
            self.store.save_account(self.account.pickle().await).await?;
        }

        self.maintain_one_time_keys(true).await?;

        self.outgoing_requests.start().await?;

        Ok(())
    }

    fn flush_start_waiters(&self, result: Result<(), String>) {
        let waiters = {
            let mut state = self.start_state.lock().expect("start lock");
            std::mem::take(&mut state.waiters)
        };

        // Completions always cross onto the callback context.
        let _ = self.callback_context.post(async move {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
    }

    fn is_started(&self) -> bool {
        self.start_state.lock().expect("start lock").phase == StartPhase::Started
    }

    /// The encrypt-context half of sync processing.
    async fn encrypt_side_sync(
        inner: &Arc<Self>,
        device_lists: crate::types::DeviceLists,
        otk_count: Option<u64>,
        key_requests: Vec<(OwnedUserId, RoomKeyRequestContent)>,
        is_catching_up: bool,
    ) -> OlmResult<()> {
        for user in &device_lists.changed {
            if let Err(e) = inner.device_tracker.mark_user_as_changed(user).await {
                warn!(user = user.as_str(), error = ?e, "Failed to flag a changed user");
            }
        }

        for user in &device_lists.left {
            if let Err(e) = inner.device_tracker.stop_tracking(user).await {
                warn!(user = user.as_str(), error = ?e, "Failed to untrack a user");
            }
        }

        if let Some(count) = otk_count {
            inner.account.update_uploaded_key_count(count);
        }

        for (sender, content) in key_requests {
            inner.incoming_requests.receive(sender, content).await;
        }

        if !inner.is_started() {
            return Ok(());
        }

        if let Err(e) = inner.device_tracker.refresh_outdated_device_lists().await {
            warn!(error = ?e, "Failed to refresh outdated device lists");
        }

        if !is_catching_up {
            // Defer non-essential work during catch-up to avoid upload
            // storms.
            if let Err(e) = inner.maintain_one_time_keys(false).await {
                warn!(error = ?e, "Failed to replenish one-time keys");
            }

            if let Err(e) = inner.outgoing_requests.drain().await {
                warn!(error = ?e, "Failed to drain outgoing key requests");
            }

            if let Err(e) = Self::drain_incoming_key_requests(inner).await {
                warn!(error = ?e, "Failed to drain the incoming key request queue");
            }
        }

        Ok(())
    }

    /// Top the server-held one-time key pool up to half of the pool maximum.
    ///
    /// At most one replenishment runs at a time and, unless forced, at most
    /// one per upload period.
    async fn maintain_one_time_keys(&self, force: bool) -> OlmResult<()> {
        {
            let mut state = self.otk_state.lock().await;

            if state.check_in_progress {
                return Ok(());
            }

            if !force {
                if let Some(last) = state.last_check {
                    if last.elapsed() < ONE_TIME_KEY_UPLOAD_PERIOD {
                        return Ok(());
                    }
                }
            }

            state.check_in_progress = true;
        }

        let result = self.replenish_one_time_keys().await;

        {
            let mut state = self.otk_state.lock().await;
            state.check_in_progress = false;

            if result.is_ok() {
                state.last_check = Some(Instant::now());
            }
        }

        result
    }

    async fn replenish_one_time_keys(&self) -> OlmResult<()> {
        let max_keys = self.account.max_one_time_keys().await as u64;
        let target = max_keys / 2;

        let mut server_count = match self.account.uploaded_key_count() {
            Some(count) => count,
            None => {
                // An empty upload teaches us the current server count.
                let response = self.transport.upload_keys(KeysUploadRequest::default()).await?;
                let count = response.signed_curve25519_count();
                self.account.update_uploaded_key_count(count);
                count
            }
        };

        while server_count < target {
            let batch = std::cmp::min(
                ONE_TIME_KEY_GENERATION_MAX_NUMBER as u64,
                target - server_count,
            ) as usize;

            self.account.generate_one_time_keys(batch).await;
            let one_time_keys = self.account.signed_one_time_keys().await;

            let response = self
                .transport
                .upload_keys(KeysUploadRequest {
                    device_keys: None,
                    one_time_keys: Some(one_time_keys),
                })
                .await?;

            self.account.mark_keys_as_published().await;

            server_count = response.signed_curve25519_count();
            self.account.update_uploaded_key_count(server_count);
            self.store.save_account(self.account.pickle().await).await?;

            debug!(server_count, target, "Uploaded a batch of one-time keys");
        }

        Ok(())
    }

    /// Process every queued incoming key request.
    async fn drain_incoming_key_requests(inner: &Arc<Self>) -> OlmResult<()> {
        let this = inner.clone();

        inner
            .incoming_requests
            .process_queued_requests(&move |room_id: &RoomId,
                                            algorithm: &EventEncryptionAlgorithm| {
                this.decryptor_for_room(room_id, algorithm)
            })
            .await
    }

    /// Look up the room's encryptor, creating it from the persisted room
    /// configuration if needed.
    async fn encryptor_for_room(
        &self,
        room_id: &RoomId,
    ) -> OlmResult<Arc<dyn RoomEncryptor>> {
        if let Some(encryptor) = self.room_encryptors.get(room_id) {
            return Ok(encryptor.clone());
        }

        let settings = self
            .store
            .get_room_settings(room_id)
            .await?
            .ok_or_else(|| {
                OlmError::EncryptionNotEnabled(format!(
                    "encryption isn't configured for the room {}",
                    room_id
                ))
            })?;

        let encryption_settings = EncryptionSettings::from_room_state(
            settings.algorithm.clone(),
            settings.rotation_period_ms,
            settings.rotation_period_msgs,
        );

        let encryptor = self
            .registry
            .create_encryptor(
                &settings.algorithm,
                self.algorithm_parts(room_id),
                encryption_settings,
            )
            .ok_or_else(|| {
                OlmError::EncryptionNotEnabled(format!(
                    "no encryptor registered for {}",
                    settings.algorithm
                ))
            })?;

        self.room_encryptors
            .insert(room_id.to_owned(), encryptor.clone());

        Ok(encryptor)
    }

    /// Look up the room's decryptor, lazily instantiating it.
    fn decryptor_for_room(
        &self,
        room_id: &RoomId,
        algorithm: &EventEncryptionAlgorithm,
    ) -> Option<Arc<dyn RoomDecryptor>> {
        if let Some(decryptor) = self.room_decryptors.get(room_id) {
            return Some(decryptor.clone());
        }

        let decryptor = self
            .registry
            .create_decryptor(algorithm, self.algorithm_parts(room_id))?;

        self.room_decryptors
            .insert(room_id.to_owned(), decryptor.clone());

        Some(decryptor)
    }

    fn algorithm_parts(&self, room_id: &RoomId) -> AlgorithmParts {
        AlgorithmParts {
            room_id: room_id.to_owned(),
            account: self.account.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
            sessions: self.session_manager.clone(),
            replay_ledger: self.replay_ledger.clone(),
            room_keys_sender: self.room_keys_sender.clone(),
        }
    }

    async fn set_encryption_in_room(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
        inhibit_device_query: bool,
        members: Vec<OwnedUserId>,
    ) -> OlmResult<bool> {
        if let Some(existing) = self.store.get_room_settings(room_id).await? {
            if existing.algorithm != algorithm {
                // Algorithm downgrades/changes are not supported; the stored
                // one wins.
                error!(
                    room_id = room_id.as_str(),
                    stored = ?existing.algorithm,
                    requested = ?algorithm,
                    "Ignoring an algorithm change for an encrypted room"
                );
                return Ok(false);
            }

            return Ok(true);
        }

        if !self.registry.supports_encryption(&algorithm) {
            return Err(OlmError::EncryptionNotEnabled(format!(
                "no encryptor registered for {}",
                algorithm
            )));
        }

        self.store
            .save_room_settings(
                room_id,
                &RoomSettings {
                    algorithm: algorithm.clone(),
                    rotation_period_ms: None,
                    rotation_period_msgs: None,
                    blacklist_unverified_devices: false,
                },
            )
            .await?;

        info!(room_id = room_id.as_str(), algorithm = ?algorithm, "Enabled encryption in a room");

        for member in &members {
            self.device_tracker.start_tracking(member).await?;
        }

        if !inhibit_device_query {
            if let Err(e) = self.device_tracker.refresh_outdated_device_lists().await {
                warn!(error = ?e, "Failed to refresh device lists after enabling encryption");
            }
        }

        Ok(true)
    }

    /// Decrypt and dispatch an encrypted to-device event.
    async fn receive_encrypted_to_device(
        inner: &Arc<Self>,
        event: &AnyToDeviceEvent,
    ) -> OlmResult<()> {
        let content: EncryptedEventContent = serde_json::from_value(event.content.clone())?;

        let (ciphertexts, sender_key) = match &content {
            EncryptedEventContent::OlmV1Curve25519AesSha2 {
                ciphertext,
                sender_key,
            } => (ciphertext, sender_key.clone()),
            EncryptedEventContent::MegolmV1AesSha2 { .. } => {
                // Megolm has no business in the to-device channel.
                return Err(EventError::UnsupportedAlgorithm.into());
            }
        };

        let own_ciphertext = ciphertexts
            .get(inner.account.curve25519_key())
            .ok_or(EventError::MissingCiphertext)?;

        let plaintext = inner
            .decrypt_olm_message(&event.sender, &sender_key, own_ciphertext)
            .await?;

        let payload: Value = serde_json::from_str(&plaintext)?;

        inner.verify_olm_payload(&event.sender, &payload)?;

        let claimed_ed25519 = payload["keys"]["ed25519"]
            .as_str()
            .ok_or(EventError::MissingSigningKey)?
            .to_owned();

        let payload_type = payload["type"]
            .as_str()
            .ok_or_else(|| EventError::MissingField("type".to_owned()))?
            .to_owned();
        let payload_content = payload["content"].clone();

        Self::dispatch_room_key_payload(
            inner,
            &sender_key,
            &claimed_ed25519,
            &payload_type,
            payload_content,
        )
        .await
    }

    /// Route a decrypted room key payload to the room's decryptor.
    async fn dispatch_room_key_payload(
        inner: &Arc<Self>,
        sender_key: &str,
        claimed_ed25519: &str,
        payload_type: &str,
        content: Value,
    ) -> OlmResult<()> {
        match payload_type {
            "m.room_key" => {
                let content: RoomKeyContent = serde_json::from_value(content)?;
                let body = RequestedKeyInfo {
                    algorithm: content.algorithm.clone(),
                    room_id: content.room_id.clone(),
                    sender_key: sender_key.to_owned(),
                    session_id: content.session_id.clone(),
                };

                let decryptor = inner
                    .decryptor_for_room(&content.room_id, &content.algorithm)
                    .ok_or(EventError::UnsupportedAlgorithm)?;

                decryptor
                    .on_room_key_event(sender_key, claimed_ed25519, content)
                    .await
                    .map_err(megolm_to_olm)?;

                Self::cancel_key_request_in_background(inner, body);

                Ok(())
            }
            "m.forwarded_room_key" => {
                let content: ForwardedRoomKeyContent = serde_json::from_value(content)?;
                let body = RequestedKeyInfo {
                    algorithm: content.algorithm.clone(),
                    room_id: content.room_id.clone(),
                    sender_key: content.sender_key.clone(),
                    session_id: content.session_id.clone(),
                };

                let decryptor = inner
                    .decryptor_for_room(&content.room_id, &content.algorithm)
                    .ok_or(EventError::UnsupportedAlgorithm)?;

                decryptor
                    .on_forwarded_room_key_event(sender_key, content)
                    .await
                    .map_err(megolm_to_olm)?;

                Self::cancel_key_request_in_background(inner, body);

                Ok(())
            }
            other => {
                trace!(event_type = other, "Ignoring an unsupported to-device payload");
                Ok(())
            }
        }
    }

    /// Handle an unencrypted `m.room_key`/`m.forwarded_room_key` event.
    ///
    /// Key material is only accepted through the Olm channel; a plaintext
    /// key has no authenticated sender key.
    async fn receive_plaintext_room_key(&self, event: &AnyToDeviceEvent) -> OlmResult<()> {
        warn!(
            sender = event.sender.as_str(),
            event_type = event.event_type.as_str(),
            "Received an unencrypted room key event, dropping it"
        );

        Ok(())
    }

    /// Cancel the outgoing request for a key that just arrived.
    ///
    /// Runs on the encrypt context without blocking the caller; the decrypt
    /// side must not wait on encrypt-side state.
    fn cancel_key_request_in_background(inner: &Arc<Self>, body: RequestedKeyInfo) {
        let inner = inner.clone();
        let context = inner.encrypt_context.clone();
        let _ = context.post(async move {
            if let Err(e) = inner.outgoing_requests.cancel_request(&body).await {
                warn!(error = ?e, "Failed to cancel a fulfilled key request");
            }
        });
    }

    /// Decrypt an Olm ciphertext addressed to us.
    async fn decrypt_olm_message(
        &self,
        sender: &UserId,
        sender_key: &str,
        ciphertext: &crate::types::CiphertextInfo,
    ) -> OlmResult<String> {
        let message = olm_rs::session::OlmMessage::from_type_and_ciphertext(
            ciphertext.message_type as usize,
            ciphertext.body.clone(),
        )
        .map_err(|_| EventError::UnsupportedOlmType)?;

        let existing = self.store.get_sessions(sender_key).await?;

        match &message {
            olm_rs::session::OlmMessage::PreKey(prekey) => {
                if let Some(sessions) = &existing {
                    let sessions: Vec<Session> = sessions.lock().await.clone();
                    for mut session in sessions {
                        if session.matches(sender_key, prekey.clone()).await? {
                            let plaintext = session.decrypt(message.clone()).await?;
                            self.store.save_sessions(&[session]).await?;
                            return Ok(plaintext);
                        }
                    }
                }

                // No session matched, this pre-key message establishes a new
                // one.
                let mut session = self
                    .account
                    .create_inbound_session(sender_key, prekey.clone())
                    .await?;

                debug!(
                    sender = sender.as_str(),
                    sender_key,
                    session_id = session.session_id(),
                    "Created a new inbound Olm session"
                );

                let plaintext = session.decrypt(message.clone()).await?;

                // Creating the session removed a one-time key from the
                // account.
                self.store.save_account(self.account.pickle().await).await?;
                self.store.save_sessions(&[session]).await?;

                Ok(plaintext)
            }
            olm_rs::session::OlmMessage::Message(_) => {
                if let Some(sessions) = existing {
                    let sessions: Vec<Session> = sessions.lock().await.clone();
                    for mut session in sessions {
                        match session.decrypt(message.clone()).await {
                            Ok(plaintext) => {
                                self.store.save_sessions(&[session]).await?;
                                return Ok(plaintext);
                            }
                            Err(_) => continue,
                        }
                    }
                }

                warn!(
                    sender = sender.as_str(),
                    sender_key, "No Olm session could decrypt the message"
                );

                Err(OlmError::MissingSession)
            }
        }
    }

    /// Check the sender/recipient binding of a decrypted Olm payload.
    fn verify_olm_payload(&self, sender: &UserId, payload: &Value) -> OlmResult<()> {
        if payload["sender"].as_str() != Some(sender.as_str()) {
            return Err(EventError::MismatchedSender.into());
        }

        if payload["recipient"].as_str() != Some(self.user_id.as_str()) {
            return Err(EventError::MismatchedSender.into());
        }

        if payload["recipient_keys"]["ed25519"].as_str() != Some(self.account.ed25519_key()) {
            return Err(EventError::MismatchedKeys.into());
        }

        Ok(())
    }

    /// Import a list of exported sessions, cancelling fulfilled requests and
    /// notifying the decryptors.
    async fn import_exported_keys(
        inner: &Arc<Self>,
        exported: Vec<crate::types::ExportedRoomKey>,
        progress: impl Fn(usize, usize) + Send,
    ) -> MegolmResult<RoomKeyImportResult> {
        let total_count = exported.len();
        let mut imported = Vec::new();

        for (i, key) in exported.into_iter().enumerate() {
            match InboundGroupSession::from_export(&key) {
                Ok(session) => {
                    let existing = inner
                        .store
                        .get_inbound_group_session(
                            session.room_id(),
                            session.sender_key(),
                            session.session_id(),
                        )
                        .await?;

                    let better = match &existing {
                        Some(old) => {
                            old.first_known_index().await > session.first_known_index().await
                        }
                        None => true,
                    };

                    if better {
                        // No backup subsystem is attached; flag the session
                        // so nothing tries to upload it later.
                        session.mark_as_backed_up();
                        imported.push(session);
                    }
                }
                Err(e) => {
                    warn!(
                        room_id = key.room_id.as_str(),
                        session_id = key.session_id.as_str(),
                        error = ?e,
                        "Couldn't import a room key from the export"
                    );
                }
            }

            progress(i + 1, total_count);
        }

        inner.store.save_inbound_group_sessions(&imported).await?;

        for session in &imported {
            let body = RequestedKeyInfo {
                algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
                room_id: session.room_id().to_owned(),
                sender_key: session.sender_key().to_owned(),
                session_id: session.session_id().to_owned(),
            };

            Self::cancel_key_request_in_background(inner, body);

            if let Some(decryptor) = inner.decryptor_for_room(
                session.room_id(),
                &EventEncryptionAlgorithm::MegolmV1AesSha2,
            ) {
                decryptor
                    .on_new_session(session.sender_key(), session.session_id())
                    .await;
            }
        }

        info!(
            imported = imported.len(),
            total = total_count,
            "Imported room keys"
        );

        Ok(RoomKeyImportResult {
            imported_count: imported.len(),
            total_count,
        })
    }
}

fn megolm_to_olm(error: MegolmError) -> OlmError {
    match error {
        MegolmError::Store(e) => OlmError::Store(e),
        MegolmError::JsonError(e) => OlmError::JsonError(e),
        MegolmError::EventError(e) => OlmError::EventError(e),
        MegolmError::OlmGroupSession(e) => OlmError::OlmGroupSession(e),
        e => OlmError::EncryptionNotEnabled(e.to_string()),
    }
}
