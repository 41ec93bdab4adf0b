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
    cmp::max,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use olm_rs::{errors::OlmGroupSessionError, inbound_group_session::OlmInboundGroupSession};
use ruma::{EventEncryptionAlgorithm, OwnedRoomId, RoomId};
use tokio::sync::Mutex;

use crate::types::{ExportedRoomKey, ForwardedRoomKeyContent};

/// Inbound group session.
///
/// Inbound group sessions are used to decrypt the room messages that a peer's
/// outbound group session encrypted.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<OlmInboundGroupSession>>,
    session_id: Arc<String>,
    /// The curve25519 key of the device that created the session.
    pub(crate) sender_key: Arc<String>,
    /// Keys the sender claimed to own when the session was distributed,
    /// usually only the ed25519 fingerprint. Unauthenticated for forwarded
    /// sessions.
    pub(crate) sender_claimed_keys: Arc<BTreeMap<String, String>>,
    /// The devices the session was forwarded through before reaching us.
    /// Empty for directly received sessions.
    pub(crate) forwarding_chains: Arc<Vec<String>>,
    pub(crate) room_id: Arc<OwnedRoomId>,
    backed_up: Arc<AtomicBool>,
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl InboundGroupSession {
    /// Create a new inbound group session from an exported session key.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The curve25519 key of the device that distributed the
    ///   session key.
    ///
    /// * `signing_key` - The ed25519 key the sender claims to own.
    ///
    /// * `room_id` - The room the session is used in.
    ///
    /// * `session_key` - The session key as carried by an `m.room_key` event.
    pub fn new(
        sender_key: &str,
        signing_key: &str,
        room_id: &RoomId,
        session_key: &str,
    ) -> Result<Self, OlmGroupSessionError> {
        let session = OlmInboundGroupSession::new(session_key)?;
        let session_id = session.session_id();

        let mut sender_claimed_keys = BTreeMap::new();
        sender_claimed_keys.insert("ed25519".to_owned(), signing_key.to_owned());

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: Arc::new(session_id),
            sender_key: Arc::new(sender_key.to_owned()),
            sender_claimed_keys: Arc::new(sender_claimed_keys),
            forwarding_chains: Arc::new(Vec::new()),
            room_id: Arc::new(room_id.to_owned()),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Restore a session from its exported form.
    pub fn from_export(export: &ExportedRoomKey) -> Result<Self, OlmGroupSessionError> {
        let session = OlmInboundGroupSession::import(&export.session_key)?;
        let session_id = session.session_id();

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: Arc::new(session_id),
            sender_key: Arc::new(export.sender_key.clone()),
            sender_claimed_keys: Arc::new(export.sender_claimed_keys.clone()),
            forwarding_chains: Arc::new(export.forwarding_curve25519_key_chain.clone()),
            room_id: Arc::new(export.room_id.clone()),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create a session from the content of an `m.forwarded_room_key` event.
    ///
    /// The forwarding device is appended to the key chain.
    pub fn from_forwarded_key(
        forwarder_key: &str,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Self, OlmGroupSessionError> {
        let session = OlmInboundGroupSession::import(&content.session_key)?;
        let session_id = session.session_id();

        let mut sender_claimed_keys = BTreeMap::new();
        sender_claimed_keys.insert(
            "ed25519".to_owned(),
            content.sender_claimed_ed25519_key.clone(),
        );

        let mut forwarding_chains = content.forwarding_curve25519_key_chain.clone();
        forwarding_chains.push(forwarder_key.to_owned());

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: Arc::new(session_id),
            sender_key: Arc::new(content.sender_key.clone()),
            sender_claimed_keys: Arc::new(sender_claimed_keys),
            forwarding_chains: Arc::new(forwarding_chains),
            room_id: Arc::new(content.room_id.clone()),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Decrypt a ciphertext with the session.
    ///
    /// Returns the plaintext and the message index the ciphertext was
    /// encrypted at.
    pub async fn decrypt_helper(
        &self,
        message: String,
    ) -> Result<(String, u32), OlmGroupSessionError> {
        self.inner.lock().await.decrypt(message)
    }

    /// The earliest message index we can decrypt.
    pub async fn first_known_index(&self) -> u32 {
        self.inner.lock().await.first_known_index()
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room the session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// The ed25519 key the sender claimed to own, if it was recorded.
    pub fn sender_claimed_ed25519_key(&self) -> Option<&str> {
        self.sender_claimed_keys.get("ed25519").map(|k| k.as_str())
    }

    /// Was the session already uploaded to a key backup.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(Ordering::Relaxed)
    }

    /// Mark the session as backed up so it won't be uploaded again.
    pub fn mark_as_backed_up(&self) {
        self.backed_up.store(true, Ordering::Relaxed);
    }

    /// Export the session at its earliest known message index.
    pub async fn export(&self) -> ExportedRoomKey {
        let index = self.first_known_index().await;
        self.export_at_index(index)
            .await
            .expect("can't export at the first known index")
    }

    /// Export the session at the given message index.
    ///
    /// The index is clamped to the earliest one we know; a session can't be
    /// exported further into its past.
    pub async fn export_at_index(
        &self,
        message_index: u32,
    ) -> Result<ExportedRoomKey, OlmGroupSessionError> {
        let session = self.inner.lock().await;
        let message_index = max(message_index, session.first_known_index());
        let session_key = session.export(message_index)?;

        Ok(ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: (*self.room_id).clone(),
            sender_key: (*self.sender_key).clone(),
            session_id: (*self.session_id).clone(),
            session_key,
            sender_claimed_keys: (*self.sender_claimed_keys).clone(),
            forwarding_curve25519_key_chain: (*self.forwarding_chains).clone(),
        })
    }

    /// The forwarded-key content sharing this session from the given index.
    pub(crate) async fn as_forwarded_key_content(
        &self,
        message_index: Option<u32>,
    ) -> Result<ForwardedRoomKeyContent, OlmGroupSessionError> {
        let index = match message_index {
            Some(i) => i,
            None => self.first_known_index().await,
        };

        let export = self.export_at_index(index).await?;

        Ok(ForwardedRoomKeyContent {
            algorithm: export.algorithm,
            room_id: export.room_id,
            sender_key: export.sender_key,
            session_id: export.session_id,
            session_key: export.session_key,
            sender_claimed_ed25519_key: self
                .sender_claimed_ed25519_key()
                .unwrap_or_default()
                .to_owned(),
            forwarding_curve25519_key_chain: export.forwarding_curve25519_key_chain,
        })
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

#[cfg(test)]
mod test {
    use ruma::{room_id, user_id};

    use super::InboundGroupSession;
    use crate::olm::Account;

    #[tokio::test]
    async fn session_can_be_exported_and_restored() {
        let account = Account::new(user_id!("@alice:example.org"), "DEVICEID".into());
        let room_id = room_id!("!test:localhost");

        let (_, inbound) = account.create_group_session_pair_with_defaults(room_id).await;

        let export = inbound.export().await;
        let imported = InboundGroupSession::from_export(&export).unwrap();

        assert_eq!(inbound.session_id(), imported.session_id());
        assert_eq!(
            inbound.first_known_index().await,
            imported.first_known_index().await
        );
    }

    #[tokio::test]
    async fn exporting_respects_the_first_known_index() {
        let account = Account::new(user_id!("@alice:example.org"), "DEVICEID".into());
        let room_id = room_id!("!test:localhost");

        let (outbound, _) = account.create_group_session_pair_with_defaults(room_id).await;

        for _ in 0..5 {
            outbound
                .encrypt("m.room.message", serde_json::json!({"body": "hi"}))
                .await;
        }

        let late_key = outbound.session_key().await;
        let inbound = InboundGroupSession::new(
            account.curve25519_key(),
            account.ed25519_key(),
            room_id,
            &late_key,
        )
        .unwrap();

        assert_eq!(inbound.first_known_index().await, 5);

        // Asking for an earlier index clamps instead of failing.
        let export = inbound.export_at_index(0).await.unwrap();
        let restored = InboundGroupSession::from_export(&export).unwrap();
        assert_eq!(restored.first_known_index().await, 5);
    }
}
