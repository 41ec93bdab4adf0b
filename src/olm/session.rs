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

use std::{collections::BTreeMap, fmt, sync::Arc, time::Instant};

use olm_rs::{
    errors::OlmSessionError,
    session::{OlmMessage, OlmSession, PreKeyMessage},
};
use ruma::{OwnedDeviceId, OwnedUserId};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::IdentityKeys;
use crate::{
    error::{EventError, OlmResult},
    identities::DeviceIdentity,
    types::{CiphertextInfo, EncryptedEventContent},
};

/// Cryptographic session that enables secure communication between two
/// `Account`s.
#[derive(Clone)]
pub struct Session {
    pub(crate) user_id: Arc<OwnedUserId>,
    pub(crate) device_id: Arc<OwnedDeviceId>,
    pub(crate) our_identity_keys: Arc<IdentityKeys>,
    pub(crate) inner: Arc<Mutex<OlmSession>>,
    pub(crate) session_id: Arc<String>,
    pub(crate) sender_key: Arc<String>,
    pub(crate) creation_time: Arc<Instant>,
    pub(crate) last_use_time: Arc<Instant>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or an `OlmSessionError` if decryption
    /// failed.
    ///
    /// # Arguments
    ///
    /// * `message` - The Olm message that should be decrypted.
    pub async fn decrypt(&mut self, message: OlmMessage) -> Result<String, OlmSessionError> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        self.last_use_time = Arc::new(Instant::now());
        Ok(plaintext)
    }

    /// Encrypt the given plaintext as a OlmMessage.
    ///
    /// Returns the encrypted Olm message.
    ///
    /// # Arguments
    ///
    /// * `plaintext` - The plaintext that should be encrypted.
    pub(crate) async fn encrypt_helper(&mut self, plaintext: &str) -> OlmMessage {
        let message = self.inner.lock().await.encrypt(plaintext);
        self.last_use_time = Arc::new(Instant::now());
        message
    }

    /// Encrypt the given event content as an `m.room.encrypted` event
    /// content.
    ///
    /// The payload binds the ciphertext to the sending and the receiving
    /// device: it carries our user and device id, our ed25519 fingerprint,
    /// the recipient's user id and the recipient's ed25519 fingerprint, so a
    /// ciphertext can't be replayed into another recipient's session.
    ///
    /// # Arguments
    ///
    /// * `recipient_device` - The device for which this message is going to
    ///   be encrypted, this needs to be the device that was used to create
    ///   this session with.
    ///
    /// * `event_type` - The type of the event that is carried in the payload.
    ///
    /// * `content` - The content of the event.
    pub async fn encrypt(
        &mut self,
        recipient_device: &DeviceIdentity,
        event_type: &str,
        content: Value,
    ) -> OlmResult<EncryptedEventContent> {
        let recipient_signing_key = recipient_device
            .ed25519_key()
            .ok_or(EventError::MissingSigningKey)?;

        let payload = json!({
            "sender": self.user_id.as_str(),
            "sender_device": self.device_id.as_str(),
            "keys": {
                "ed25519": self.our_identity_keys.ed25519(),
            },
            "recipient": recipient_device.user_id(),
            "recipient_keys": {
                "ed25519": recipient_signing_key,
            },
            "type": event_type,
            "content": content,
        });

        let plaintext = cjson::to_string(&payload)
            .unwrap_or_else(|_| panic!("Can't serialize {} to canonical JSON", payload));

        let (message_type, ciphertext) = self.encrypt_helper(&plaintext).await.to_tuple();

        let ciphertext = CiphertextInfo {
            body: ciphertext,
            message_type: message_type as u8,
        };

        let mut content = BTreeMap::new();
        content.insert((*self.sender_key).clone(), ciphertext);

        Ok(EncryptedEventContent::OlmV1Curve25519AesSha2 {
            ciphertext: content,
            sender_key: self.our_identity_keys.curve25519().to_owned(),
        })
    }

    /// Check if a pre-key Olm message was encrypted for this session.
    ///
    /// Returns true if it matches, false if not and a OlmSessionError if
    /// there was an error checking if it matches.
    ///
    /// # Arguments
    ///
    /// * `their_identity_key` - The identity/curve25519 key of the account
    ///   that encrypted this Olm message.
    ///
    /// * `message` - The pre-key Olm message that should be checked.
    pub async fn matches(
        &self,
        their_identity_key: &str,
        message: PreKeyMessage,
    ) -> Result<bool, OlmSessionError> {
        self.inner
            .lock()
            .await
            .matches_inbound_session_from(their_identity_key, message)
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The curve25519 key of the peer this session talks to.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}
