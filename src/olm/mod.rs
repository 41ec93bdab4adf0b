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

//! Wrappers over the libolm primitive objects.
//!
//! Note: You'll only be interested in these if you are implementing a custom
//! `CryptoStore`.

mod account;
mod group_sessions;
mod replay;
mod session;
mod utility;

pub use account::{Account, IdentityKeys, PickledAccount};
pub use group_sessions::{EncryptionSettings, InboundGroupSession, OutboundGroupSession};
pub(crate) use replay::ReplayLedger;
pub use session::Session;
pub(crate) use utility::verify_json;

#[cfg(test)]
pub(crate) mod test {
    use std::collections::BTreeMap;

    use olm_rs::session::OlmMessage;
    use ruma::{user_id, DeviceId, UserId};

    use super::{Account, Session};

    fn alice_id() -> &'static UserId {
        user_id!("@alice:example.org")
    }

    fn alice_device_id() -> &'static DeviceId {
        "ALICEDEVICE".into()
    }

    fn bob_id() -> &'static UserId {
        user_id!("@bob:example.org")
    }

    fn bob_device_id() -> &'static DeviceId {
        "BOBDEVICE".into()
    }

    pub(crate) async fn get_account_and_session() -> (Account, Session) {
        let alice = Account::new(alice_id(), alice_device_id());
        let bob = Account::new(bob_id(), bob_device_id());

        bob.generate_one_time_keys(1).await;
        let one_time_key = bob
            .signed_one_time_keys()
            .await
            .values()
            .next()
            .cloned()
            .unwrap();
        let one_time_key = match one_time_key {
            crate::types::OneTimeKey::SignedKey(k) => k,
            _ => panic!("One-time key isn't signed"),
        };
        let sender_key = bob.curve25519_key().to_owned();
        let session = alice
            .create_outbound_session_helper(&sender_key, &one_time_key)
            .await
            .unwrap();

        (alice, session)
    }

    #[test]
    fn account_creation() {
        let account = Account::new(alice_id(), alice_device_id());
        let identity_keys = account.identity_keys();

        assert!(!account.shared());
        assert!(!identity_keys.ed25519().is_empty());
        assert!(!identity_keys.curve25519().is_empty());

        account.mark_as_shared();
        assert!(account.shared());
    }

    #[tokio::test]
    async fn one_time_keys_creation() {
        let account = Account::new(alice_id(), alice_device_id());

        assert!(account.signed_one_time_keys().await.is_empty());
        assert_ne!(account.max_one_time_keys().await, 0);

        account.generate_one_time_keys(10).await;
        let one_time_keys = account.signed_one_time_keys().await;

        assert_eq!(one_time_keys.len(), 10);

        account.mark_keys_as_published().await;
        assert!(account.signed_one_time_keys().await.is_empty());
    }

    #[tokio::test]
    async fn session_creation() {
        let alice = Account::new(alice_id(), alice_device_id());
        let bob = Account::new(bob_id(), bob_device_id());

        alice.generate_one_time_keys(1).await;
        let one_time_keys = alice.signed_one_time_keys().await;
        alice.mark_keys_as_published().await;

        let one_time_key = match one_time_keys.values().next().cloned().unwrap() {
            crate::types::OneTimeKey::SignedKey(k) => k,
            _ => panic!("One-time key isn't signed"),
        };

        let mut bob_session = bob
            .create_outbound_session_helper(alice.curve25519_key(), &one_time_key)
            .await
            .unwrap();

        let plaintext = "Hello world";

        let message = bob_session.encrypt_helper(plaintext).await;

        let prekey_message = match message.clone() {
            OlmMessage::PreKey(m) => m,
            OlmMessage::Message(_) => panic!("Incorrect message type"),
        };

        let mut alice_session = alice
            .create_inbound_session(bob.curve25519_key(), prekey_message.clone())
            .await
            .unwrap();

        assert!(alice_session
            .matches(bob.curve25519_key(), prekey_message)
            .await
            .unwrap());

        assert_eq!(bob_session.session_id(), alice_session.session_id());

        let decrypted = alice_session.decrypt(message).await.unwrap();
        assert_eq!(plaintext, decrypted);
    }

    #[tokio::test]
    async fn group_session_creation() {
        let alice = Account::new(alice_id(), alice_device_id());
        let room_id = ruma::room_id!("!test:localhost");

        let (outbound, _) = alice.create_group_session_pair_with_defaults(room_id).await;

        assert_eq!(0, outbound.message_index().await);
        assert!(!outbound.shared());
        outbound.mark_as_shared();
        assert!(outbound.shared());

        let inbound = super::InboundGroupSession::new(
            "test_key",
            "test_key",
            room_id,
            &outbound.session_key().await,
        )
        .unwrap();

        assert_eq!(0, inbound.first_known_index().await);
        assert_eq!(outbound.session_id(), inbound.session_id());

        let plaintext = serde_json::json!({"body": "This is a secret to everybody"});
        let encrypted = outbound.encrypt("m.room.message", plaintext.clone()).await;

        let ciphertext = match encrypted {
            crate::types::EncryptedEventContent::MegolmV1AesSha2 { ciphertext, .. } => ciphertext,
            _ => panic!("Incorrect content type"),
        };

        let (decrypted, index) = inbound.decrypt_helper(ciphertext).await.unwrap();
        let decrypted: serde_json::Value = serde_json::from_str(&decrypted).unwrap();

        assert_eq!(index, 0);
        assert_eq!(decrypted["content"], plaintext);
        assert_eq!(decrypted["type"], "m.room.message");
    }
}
