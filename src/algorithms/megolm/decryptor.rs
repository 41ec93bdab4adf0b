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

use std::collections::BTreeMap;

use async_trait::async_trait;
use olm_rs::errors::OlmGroupSessionError;
use ruma::EventEncryptionAlgorithm;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::super::{AlgorithmParts, RoomDecryptor};
use crate::{
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    identities::DeviceIdentity,
    olm::InboundGroupSession,
    requests::{DeviceIdOrAllDevices, ToDeviceRequest},
    types::{
        DecryptionResult, EncryptedEvent, EncryptedEventContent, ForwardedRoomKeyContent,
        RequestedKeyInfo, RoomKeyContent, RoomKeyInfo,
    },
};

/// The Megolm room decryptor.
///
/// Consumes `m.room_key` and `m.forwarded_room_key` events for its room,
/// decrypts room events with the stored inbound sessions and serves incoming
/// key requests for sessions it holds.
#[derive(Debug)]
pub(crate) struct MegolmDecryptor {
    parts: AlgorithmParts,
}

impl MegolmDecryptor {
    pub fn new(parts: AlgorithmParts) -> Self {
        Self { parts }
    }

    /// Save the session unless we already hold an equal or better copy.
    ///
    /// A copy is better when its ratchet reaches further into the past, i.e.
    /// its first known index is lower.
    async fn add_session(&self, session: InboundGroupSession) -> MegolmResult<bool> {
        let existing = self
            .parts
            .store
            .get_inbound_group_session(
                session.room_id(),
                session.sender_key(),
                session.session_id(),
            )
            .await?;

        if let Some(existing) = existing {
            if existing.first_known_index().await <= session.first_known_index().await {
                debug!(
                    session_id = session.session_id(),
                    "Ignoring a room key we already have a better copy of"
                );
                return Ok(false);
            }
        }

        self.parts
            .store
            .save_inbound_group_sessions(&[session.clone()])
            .await?;

        self.notify_new_session(&session);

        Ok(true)
    }

    fn notify_new_session(&self, session: &InboundGroupSession) {
        let info = RoomKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: session.room_id().to_owned(),
            sender_key: session.sender_key().to_owned(),
            session_id: session.session_id().to_owned(),
        };

        // Nobody listening is fine.
        let _ = self.parts.room_keys_sender.send(info);
    }

    /// Map a libolm group decryption failure onto our error taxonomy.
    fn map_decryption_error(error: OlmGroupSessionError) -> MegolmError {
        match error {
            OlmGroupSessionError::UnknownMessageIndex => MegolmError::UnknownMessageIndex,
            OlmGroupSessionError::BadMessageVersion
            | OlmGroupSessionError::BadMessageFormat
            | OlmGroupSessionError::BadMessageMac => MegolmError::BadEncryptedMessage,
            e => MegolmError::OlmGroupSession(e),
        }
    }
}

#[async_trait]
impl RoomDecryptor for MegolmDecryptor {
    async fn decrypt_event(
        &self,
        event: &EncryptedEvent,
        timeline_id: Option<&str>,
    ) -> MegolmResult<DecryptionResult> {
        let (ciphertext, sender_key, session_id) = match &event.content {
            EncryptedEventContent::MegolmV1AesSha2 {
                ciphertext,
                sender_key,
                session_id,
                ..
            } => (ciphertext, sender_key, session_id),
            _ => return Err(EventError::UnsupportedAlgorithm.into()),
        };

        let session = self
            .parts
            .store
            .get_inbound_group_session(&self.parts.room_id, sender_key, session_id)
            .await?
            .ok_or(MegolmError::MissingSession)?;

        let (plaintext, message_index) = session
            .decrypt_helper(ciphertext.clone())
            .await
            .map_err(Self::map_decryption_error)?;

        if let Some(timeline_id) = timeline_id {
            if !self
                .parts
                .replay_ledger
                .record(timeline_id, sender_key, session_id, message_index)
            {
                warn!(
                    room_id = self.parts.room_id.as_str(),
                    session_id = session_id.as_str(),
                    message_index,
                    "Detected a replayed Megolm message"
                );
                return Err(MegolmError::Replay);
            }
        }

        let payload: Value = serde_json::from_str(&plaintext)?;

        let payload_room = payload
            .get("room_id")
            .and_then(|r| r.as_str())
            .ok_or_else(|| EventError::MissingField("room_id".to_owned()))?;

        if payload_room != self.parts.room_id.as_str() {
            return Err(EventError::MismatchedRoom.into());
        }

        let clear_event = json!({
            "type": payload
                .get("type")
                .cloned()
                .ok_or_else(|| EventError::MissingField("type".to_owned()))?,
            "content": payload
                .get("content")
                .cloned()
                .ok_or_else(|| EventError::MissingField("content".to_owned()))?,
        });

        Ok(DecryptionResult {
            clear_event,
            sender_curve25519_key: session.sender_key().to_owned(),
            claimed_ed25519_key: session.sender_claimed_ed25519_key().map(|k| k.to_owned()),
            forwarding_curve25519_key_chain: (*session.forwarding_chains).clone(),
        })
    }

    async fn on_room_key_event(
        &self,
        sender_key: &str,
        claimed_ed25519_key: &str,
        content: RoomKeyContent,
    ) -> MegolmResult<()> {
        let session = InboundGroupSession::new(
            sender_key,
            claimed_ed25519_key,
            &content.room_id,
            &content.session_key,
        )?;

        if self.add_session(session).await? {
            info!(
                room_id = content.room_id.as_str(),
                session_id = content.session_id.as_str(),
                "Received a new Megolm room key"
            );
        }

        Ok(())
    }

    async fn on_forwarded_room_key_event(
        &self,
        forwarder_key: &str,
        content: ForwardedRoomKeyContent,
    ) -> MegolmResult<()> {
        let session = InboundGroupSession::from_forwarded_key(forwarder_key, &content)?;

        if self.add_session(session).await? {
            info!(
                room_id = content.room_id.as_str(),
                session_id = content.session_id.as_str(),
                forwarder = forwarder_key,
                "Received a forwarded Megolm room key"
            );
        }

        Ok(())
    }

    async fn has_keys_for_key_request(&self, body: &RequestedKeyInfo) -> MegolmResult<bool> {
        if body.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Ok(false);
        }

        Ok(self
            .parts
            .store
            .get_inbound_group_session(&body.room_id, &body.sender_key, &body.session_id)
            .await?
            .is_some())
    }

    async fn share_keys_with_device(
        &self,
        device: &DeviceIdentity,
        body: &RequestedKeyInfo,
    ) -> OlmResult<()> {
        let session = self
            .parts
            .store
            .get_inbound_group_session(&body.room_id, &body.sender_key, &body.session_id)
            .await?
            .ok_or(OlmError::MissingSession)?;

        let mut devices = BTreeMap::new();
        devices.insert(
            device.user_id().to_owned(),
            vec![device.clone()],
        );
        self.parts.sessions.ensure_sessions(&devices).await?;

        let content = session
            .as_forwarded_key_content(None)
            .await
            .map_err(OlmError::OlmGroupSession)?;

        let encrypted = self
            .parts
            .sessions
            .encrypt_to_device(
                device,
                "m.forwarded_room_key",
                serde_json::to_value(&content)?,
            )
            .await?;

        let request = ToDeviceRequest::new(
            device.user_id(),
            DeviceIdOrAllDevices::DeviceId(device.device_id().to_owned()),
            "m.room.encrypted",
            serde_json::to_value(&encrypted)?,
        );

        self.parts.transport.send_to_device(&request).await?;

        info!(
            user_id = device.user_id().as_str(),
            device_id = device.device_id().as_str(),
            session_id = body.session_id.as_str(),
            "Shared a room key with a device"
        );

        Ok(())
    }

    async fn on_new_session(&self, sender_key: &str, session_id: &str) {
        let session = self
            .parts
            .store
            .get_inbound_group_session(&self.parts.room_id, sender_key, session_id)
            .await;

        if let Ok(Some(session)) = session {
            self.notify_new_session(&session);
        }
    }
}
