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

//! Per-room encryption and decryption behind two capability traits.
//!
//! The supported algorithms form a closed set; a small registry maps the
//! algorithm name to a factory for the matching encryptor or decryptor.

pub(crate) mod megolm;

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use ruma::{EventEncryptionAlgorithm, OwnedRoomId, OwnedUserId, RoomId};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    error::{MegolmResult, OlmResult},
    identities::DeviceIdentity,
    olm::{Account, EncryptionSettings, ReplayLedger},
    requests::HomeserverClient,
    session_manager::SessionManager,
    store::Store,
    types::{
        DecryptionResult, EncryptedEvent, EncryptedEventContent, ForwardedRoomKeyContent,
        RequestedKeyInfo, RoomKeyContent, RoomKeyInfo,
    },
};

/// Everything an algorithm implementation needs from the coordinator.
///
/// Handed out by value at construction so the implementations never hold a
/// reference back to the coordinator itself.
#[derive(Clone, Debug)]
pub(crate) struct AlgorithmParts {
    pub room_id: OwnedRoomId,
    pub account: Account,
    pub store: Store,
    pub transport: Arc<dyn HomeserverClient>,
    pub sessions: SessionManager,
    pub replay_ledger: Arc<ReplayLedger>,
    pub room_keys_sender: broadcast::Sender<RoomKeyInfo>,
}

/// A per-room encryptor: builds and rotates the room's outbound session and
/// distributes its key to the recipient devices.
#[async_trait]
pub(crate) trait RoomEncryptor: Send + Sync + Debug {
    /// The room this encryptor serves.
    fn room_id(&self) -> &RoomId;

    /// Encrypt the given event content for the room.
    ///
    /// Ensures an outbound session exists, shares it with every eligible
    /// device of the given users and returns the encrypted content.
    async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
        users: &[OwnedUserId],
    ) -> OlmResult<EncryptedEventContent>;

    /// Force a session rotation before the next encryption.
    fn invalidate_outbound_session(&self);
}

/// A per-room decryptor: consumes inbound sessions and decrypts room events.
#[async_trait]
pub(crate) trait RoomDecryptor: Send + Sync + Debug {
    /// Decrypt a room event.
    ///
    /// The timeline id scopes the replay protection; `None` skips the replay
    /// check (e.g. for one-off decryption outside any timeline).
    async fn decrypt_event(
        &self,
        event: &EncryptedEvent,
        timeline_id: Option<&str>,
    ) -> MegolmResult<DecryptionResult>;

    /// Handle a decrypted `m.room_key` event distributing a new session.
    ///
    /// `claimed_sender_key` is the ed25519 key carried inside the Olm
    /// envelope the room key arrived in.
    async fn on_room_key_event(
        &self,
        sender_key: &str,
        claimed_ed25519_key: &str,
        content: RoomKeyContent,
    ) -> MegolmResult<()>;

    /// Handle a decrypted `m.forwarded_room_key` event.
    async fn on_forwarded_room_key_event(
        &self,
        forwarder_key: &str,
        content: ForwardedRoomKeyContent,
    ) -> MegolmResult<()>;

    /// Do we hold the session a key request asks for.
    async fn has_keys_for_key_request(&self, body: &RequestedKeyInfo) -> MegolmResult<bool>;

    /// Send the requested session key to the given device over Olm.
    async fn share_keys_with_device(
        &self,
        device: &DeviceIdentity,
        body: &RequestedKeyInfo,
    ) -> OlmResult<()>;

    /// A session became usable outside the room-key path (e.g. through a key
    /// import); notify the host so queued events can be retried.
    async fn on_new_session(&self, sender_key: &str, session_id: &str);
}

type EncryptorFactory = fn(AlgorithmParts, EncryptionSettings) -> Arc<dyn RoomEncryptor>;
type DecryptorFactory = fn(AlgorithmParts) -> Arc<dyn RoomDecryptor>;

/// The closed set of supported algorithms and their factories.
#[derive(Debug)]
pub(crate) struct AlgorithmRegistry {
    encryptors: HashMap<EventEncryptionAlgorithm, EncryptorFactory>,
    decryptors: HashMap<EventEncryptionAlgorithm, DecryptorFactory>,
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        let mut encryptors: HashMap<EventEncryptionAlgorithm, EncryptorFactory> = HashMap::new();
        let mut decryptors: HashMap<EventEncryptionAlgorithm, DecryptorFactory> = HashMap::new();

        encryptors.insert(
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            |parts, settings| Arc::new(megolm::MegolmEncryptor::new(parts, settings)),
        );
        decryptors.insert(EventEncryptionAlgorithm::MegolmV1AesSha2, |parts| {
            Arc::new(megolm::MegolmDecryptor::new(parts))
        });

        Self {
            encryptors,
            decryptors,
        }
    }
}

impl AlgorithmRegistry {
    /// Can we encrypt rooms with the given algorithm.
    pub fn supports_encryption(&self, algorithm: &EventEncryptionAlgorithm) -> bool {
        self.encryptors.contains_key(algorithm)
    }

    /// Can we decrypt rooms encrypted with the given algorithm.
    pub fn supports_decryption(&self, algorithm: &EventEncryptionAlgorithm) -> bool {
        self.decryptors.contains_key(algorithm)
    }

    /// Instantiate an encryptor for the given algorithm.
    pub fn create_encryptor(
        &self,
        algorithm: &EventEncryptionAlgorithm,
        parts: AlgorithmParts,
        settings: EncryptionSettings,
    ) -> Option<Arc<dyn RoomEncryptor>> {
        self.encryptors
            .get(algorithm)
            .map(|factory| factory(parts, settings))
    }

    /// Instantiate a decryptor for the given algorithm.
    pub fn create_decryptor(
        &self,
        algorithm: &EventEncryptionAlgorithm,
        parts: AlgorithmParts,
    ) -> Option<Arc<dyn RoomDecryptor>> {
        self.decryptors
            .get(algorithm)
            .map(|factory| factory(parts))
    }
}

#[cfg(test)]
mod test {
    use ruma::EventEncryptionAlgorithm;

    use super::AlgorithmRegistry;

    #[test]
    fn the_algorithm_set_is_closed() {
        let registry = AlgorithmRegistry::default();

        assert!(registry.supports_encryption(&EventEncryptionAlgorithm::MegolmV1AesSha2));
        assert!(registry.supports_decryption(&EventEncryptionAlgorithm::MegolmV1AesSha2));

        assert!(!registry.supports_encryption(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2));
        assert!(!registry.supports_encryption(&EventEncryptionAlgorithm::from(
            "m.megolm.v2.aes-sha2"
        )));
    }
}
