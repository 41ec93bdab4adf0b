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

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashSet;
use olm_rs::outbound_group_session::OlmOutboundGroupSession;
use ruma::{EventEncryptionAlgorithm, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::super::IdentityKeys;
use crate::types::{EncryptedEventContent, RoomKeyContent};

const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
const ROTATION_MESSAGES: u64 = 100;

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session.
#[derive(Debug, Clone)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
        }
    }
}

impl EncryptionSettings {
    /// Build settings from the fields of an `m.room.encryption` state event
    /// content, falling back to the defaults for absent fields.
    pub fn from_room_state(
        algorithm: EventEncryptionAlgorithm,
        rotation_period_ms: Option<u64>,
        rotation_period_msgs: Option<u64>,
    ) -> Self {
        Self {
            algorithm,
            rotation_period: rotation_period_ms
                .map_or(ROTATION_PERIOD, Duration::from_millis),
            rotation_period_msgs: rotation_period_msgs.unwrap_or(ROTATION_MESSAGES),
        }
    }
}

/// Outbound group session.
///
/// Outbound group sessions are used to exchange room messages between a group
/// of participants. Outbound group sessions are used to encrypt the room
/// messages.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<OlmOutboundGroupSession>>,
    device_id: Arc<OwnedDeviceId>,
    account_identity_keys: Arc<IdentityKeys>,
    session_id: Arc<String>,
    room_id: Arc<OwnedRoomId>,
    pub(crate) creation_time: Arc<Instant>,
    message_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    /// The devices the session key was distributed to, as
    /// (user, device, curve25519 key) triples. A device that rotated its
    /// identity key counts as a new recipient.
    shared_with_set: Arc<DashSet<(OwnedUserId, OwnedDeviceId, String)>>,
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

impl OutboundGroupSession {
    /// Create a new outbound group session for the given room.
    ///
    /// Outbound group sessions are used to encrypt room messages.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The id of the device that created this session.
    ///
    /// * `identity_keys` - The identity keys of the account that created this
    ///   session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `settings` - The rotation policy of the session.
    pub fn new(
        device_id: Arc<OwnedDeviceId>,
        identity_keys: Arc<IdentityKeys>,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Self {
        let session = OlmOutboundGroupSession::new();
        let session_id = session.session_id();

        OutboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            device_id,
            account_identity_keys: identity_keys,
            session_id: Arc::new(session_id),
            room_id: Arc::new(room_id.to_owned()),
            creation_time: Arc::new(Instant::now()),
            message_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with_set: Arc::new(DashSet::new()),
        }
    }

    /// Encrypt the given plaintext with the session.
    ///
    /// Returns the encrypted ciphertext.
    pub(crate) async fn encrypt_helper(&self, plaintext: String) -> String {
        let session = self.inner.lock().await;
        self.message_count.fetch_add(1, Ordering::SeqCst);
        session.encrypt(&plaintext)
    }

    /// Encrypt a room message for the given room.
    ///
    /// Beware that a room key needs to be shared before this method can be
    /// called using the `share_keys()` method of the room encryptor.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The plaintext type of the event.
    ///
    /// * `content` - The plaintext content of the message that should be
    ///   encrypted.
    pub async fn encrypt(&self, event_type: &str, content: Value) -> EncryptedEventContent {
        let payload = json!({
            "room_id": &*self.room_id,
            "type": event_type,
            "content": content,
        });

        let payload_json = cjson::to_string(&payload)
            .unwrap_or_else(|_| panic!("Can't serialize {} to canonical JSON", payload));

        let ciphertext = self.encrypt_helper(payload_json).await;

        EncryptedEventContent::MegolmV1AesSha2 {
            ciphertext,
            sender_key: self.account_identity_keys.curve25519().to_owned(),
            session_id: self.session_id().to_owned(),
            device_id: (*self.device_id).clone(),
        }
    }

    /// Has the session expired under its rotation policy.
    ///
    /// An expired session must not encrypt any further messages and needs to
    /// be replaced by a fresh one.
    pub fn expired(&self) -> bool {
        let count = self.message_count.load(Ordering::SeqCst);

        count >= self.settings.rotation_period_msgs
            || self.creation_time.elapsed() >= self.settings.rotation_period
    }

    /// Mark the session as invalid, forcing a rotation before the next use.
    ///
    /// Done when a member or a device leaves the encrypted group.
    pub fn invalidate_session(&self) {
        self.invalidated.store(true, Ordering::Relaxed);
    }

    /// Was the session manually invalidated.
    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }

    /// Mark the session as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::Relaxed);
    }

    /// Has the session been shared with the recipients.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Record that the session key was sent to the given device.
    pub(crate) fn mark_shared_with(
        &self,
        user_id: &OwnedUserId,
        device_id: &OwnedDeviceId,
        identity_key: &str,
    ) {
        self.shared_with_set.insert((
            user_id.clone(),
            device_id.clone(),
            identity_key.to_owned(),
        ));
    }

    /// Was the session key already sent to the given device under the given
    /// identity key.
    pub(crate) fn is_shared_with(
        &self,
        user_id: &OwnedUserId,
        device_id: &OwnedDeviceId,
        identity_key: &str,
    ) -> bool {
        self.shared_with_set.contains(&(
            user_id.clone(),
            device_id.clone(),
            identity_key.to_owned(),
        ))
    }

    /// The users the session key was distributed to.
    pub(crate) fn shared_with_users(&self) -> Vec<OwnedUserId> {
        self.shared_with_set
            .iter()
            .map(|e| e.key().0.clone())
            .collect()
    }

    /// The devices of the given user the session key was distributed to.
    pub(crate) fn shared_with_devices(&self, user_id: &OwnedUserId) -> Vec<OwnedDeviceId> {
        self.shared_with_set
            .iter()
            .filter(|e| &e.key().0 == user_id)
            .map(|e| e.key().1.clone())
            .collect()
    }

    /// The current session key, exportable to recipients via `m.room_key`.
    pub async fn session_key(&self) -> String {
        let session = self.inner.lock().await;
        session.session_key()
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room the session encrypts messages for.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Get the current message index for this session.
    ///
    /// Each message is sent with an increasing index. This returns the
    /// message index that will be used for the next encrypted message.
    pub async fn message_index(&self) -> u32 {
        let session = self.inner.lock().await;
        session.session_message_index()
    }

    /// The `m.room_key` content distributing this session.
    pub(crate) async fn as_room_key_content(&self) -> RoomKeyContent {
        RoomKeyContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: (*self.room_id).clone(),
            session_id: self.session_id().to_owned(),
            session_key: self.session_key().await,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use ruma::{room_id, user_id, EventEncryptionAlgorithm};

    use super::EncryptionSettings;
    use crate::olm::Account;

    #[tokio::test]
    async fn expiration_by_message_count() {
        let settings = EncryptionSettings {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: Duration::from_millis(604800000),
            rotation_period_msgs: 1,
        };

        let account = Account::new(user_id!("@alice:example.org"), "DEVICEID".into());
        let (session, _) = account
            .create_group_session_pair(room_id!("!test:example.org"), settings)
            .await;

        assert!(!session.expired());
        session
            .encrypt("m.room.message", serde_json::json!({"body": "hello"}))
            .await;
        assert!(session.expired());
    }

    #[tokio::test]
    async fn expiration_by_age() {
        let settings = EncryptionSettings {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: Duration::from_millis(0),
            rotation_period_msgs: 100,
        };

        let account = Account::new(user_id!("@alice:example.org"), "DEVICEID".into());
        let (session, _) = account
            .create_group_session_pair(room_id!("!test:example.org"), settings)
            .await;

        assert!(session.expired());
    }

    #[tokio::test]
    async fn share_set_tracks_identity_keys() {
        let account = Account::new(user_id!("@alice:example.org"), "DEVICEID".into());
        let (session, _) = account
            .create_group_session_pair(room_id!("!test:example.org"), EncryptionSettings::default())
            .await;

        let user = user_id!("@bob:example.org").to_owned();
        let device = "BOBDEVICE".into();

        assert!(!session.is_shared_with(&user, &device, "abc"));
        session.mark_shared_with(&user, &device, "abc");
        assert!(session.is_shared_with(&user, &device, "abc"));

        // A rotated identity key means the key needs to go out again.
        assert!(!session.is_shared_with(&user, &device, "def"));
    }
}
