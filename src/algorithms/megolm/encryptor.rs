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

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use ruma::{OwnedUserId, RoomId};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::super::{AlgorithmParts, RoomEncryptor};
use crate::{
    error::{OlmError, OlmResult},
    identities::DeviceIdentity,
    olm::{EncryptionSettings, OutboundGroupSession},
    requests::{DeviceIdOrAllDevices, ToDeviceRequest},
    types::EncryptedEventContent,
};

/// The Megolm room encryptor.
///
/// Owns the room's outbound group session: creates it, rotates it under the
/// policy thresholds and whenever the recipient group shrank, and
/// distributes its key over Olm to every eligible device.
#[derive(Debug)]
pub(crate) struct MegolmEncryptor {
    parts: AlgorithmParts,
    settings: EncryptionSettings,
    outbound: Mutex<Option<OutboundGroupSession>>,
}

impl MegolmEncryptor {
    const MAX_TO_DEVICE_MESSAGES: usize = 20;

    pub fn new(parts: AlgorithmParts, settings: EncryptionSettings) -> Self {
        Self {
            parts,
            settings,
            outbound: Mutex::new(None),
        }
    }

    /// Get the usable outbound session or replace it with a fresh one.
    ///
    /// A session is replaced when it expired under the rotation policy, was
    /// invalidated, or `rotate` demands it.
    async fn obtain_outbound_session(
        &self,
        current: &mut Option<OutboundGroupSession>,
        rotate: bool,
    ) -> OlmResult<OutboundGroupSession> {
        if let Some(session) = current.as_ref() {
            if !rotate && !session.expired() && !session.invalidated() {
                return Ok(session.clone());
            }

            debug!(
                room_id = self.parts.room_id.as_str(),
                session_id = session.session_id(),
                "Rotating the outbound group session"
            );
        }

        let (outbound, inbound) = self
            .parts
            .account
            .create_group_session_pair(&self.parts.room_id, self.settings.clone())
            .await;

        self.parts
            .store
            .save_inbound_group_sessions(&[inbound])
            .await?;

        *current = Some(outbound.clone());

        Ok(outbound)
    }

    /// Collect the devices of the given users that may receive the room key.
    ///
    /// Blacklisted devices never qualify; unverified ones are dropped when
    /// the global or the per-room blacklist switch says so. Fails with
    /// `UnknownDevices` if the unknown-device warning is active and a never
    /// assessed device is present.
    async fn collect_recipient_devices(
        &self,
        users: &[OwnedUserId],
    ) -> OlmResult<HashMap<OwnedUserId, Vec<DeviceIdentity>>> {
        let blacklist_unverified = self.blacklist_unverified_devices().await?;
        let warn_on_unknown = self.parts.store.warn_on_unknown_devices().await?;

        let mut recipients: HashMap<OwnedUserId, Vec<DeviceIdentity>> = HashMap::new();
        let mut unknown: BTreeMap<OwnedUserId, Vec<ruma::OwnedDeviceId>> = BTreeMap::new();

        for user_id in users {
            let devices = self.parts.store.get_user_devices(user_id).await?;

            let mut user_recipients = Vec::new();

            for device in devices.devices() {
                if device.curve25519_key().map(|k| k.as_str())
                    == Some(self.parts.account.curve25519_key())
                {
                    continue;
                }

                if device.is_blacklisted() {
                    continue;
                }

                if warn_on_unknown && device.is_unknown() {
                    unknown
                        .entry(user_id.clone())
                        .or_insert_with(Vec::new)
                        .push(device.device_id().to_owned());
                    continue;
                }

                if blacklist_unverified && !device.is_verified() {
                    continue;
                }

                user_recipients.push(device.clone());
            }

            recipients.insert(user_id.clone(), user_recipients);
        }

        if !unknown.is_empty() {
            return Err(OlmError::UnknownDevices(unknown));
        }

        Ok(recipients)
    }

    async fn blacklist_unverified_devices(&self) -> OlmResult<bool> {
        if self
            .parts
            .store
            .global_blacklist_unverified_devices()
            .await?
        {
            return Ok(true);
        }

        Ok(self
            .parts
            .store
            .get_room_settings(&self.parts.room_id)
            .await?
            .map(|s| s.blacklist_unverified_devices)
            .unwrap_or(false))
    }

    /// Does the recipient group differ from the group the session was shared
    /// with in a way that requires a rotation.
    ///
    /// A user who received the key but is no longer a recipient, or a device
    /// that received the key but no longer exists, means the session key must
    /// not be reused for further messages.
    fn group_shrank(
        &self,
        session: &OutboundGroupSession,
        recipients: &HashMap<OwnedUserId, Vec<DeviceIdentity>>,
    ) -> bool {
        let shared_with: HashSet<OwnedUserId> = session.shared_with_users().into_iter().collect();

        for user_id in &shared_with {
            if !recipients.contains_key(user_id) {
                return true;
            }

            let current_ids: HashSet<_> = recipients[user_id]
                .iter()
                .map(|d| d.device_id().to_owned())
                .collect();

            for device_id in session.shared_with_devices(user_id) {
                if !current_ids.contains(&device_id) {
                    return true;
                }
            }
        }

        false
    }

    /// Send the session key to every recipient device that doesn't have it
    /// yet.
    async fn share_session(
        &self,
        session: &OutboundGroupSession,
        recipients: &HashMap<OwnedUserId, Vec<DeviceIdentity>>,
    ) -> OlmResult<()> {
        let devices_by_user: BTreeMap<OwnedUserId, Vec<DeviceIdentity>> = recipients
            .iter()
            .map(|(u, d)| (u.clone(), d.clone()))
            .collect();

        self.parts.sessions.ensure_sessions(&devices_by_user).await?;

        let to_share: Vec<&DeviceIdentity> = recipients
            .iter()
            .flat_map(|(user_id, devices)| {
                devices.iter().filter(move |d| {
                    d.curve25519_key().map_or(false, |key| {
                        !session.is_shared_with(user_id, &d.device_id().to_owned(), key)
                    })
                })
            })
            .collect();

        if to_share.is_empty() {
            return Ok(());
        }

        info!(
            room_id = self.parts.room_id.as_str(),
            session_id = session.session_id(),
            devices = to_share.len(),
            "Sharing the outbound group session"
        );

        let key_content = serde_json::to_value(session.as_room_key_content().await)?;

        for chunk in to_share.chunks(Self::MAX_TO_DEVICE_MESSAGES) {
            let mut messages: BTreeMap<
                OwnedUserId,
                BTreeMap<DeviceIdOrAllDevices, Value>,
            > = BTreeMap::new();
            let mut chunk_devices = Vec::new();

            for device in chunk {
                let encrypted = match self
                    .parts
                    .sessions
                    .encrypt_to_device(device, "m.room_key", key_content.clone())
                    .await
                {
                    Ok(c) => c,
                    // No usable Olm session; the device is silently omitted
                    // and can ask for the key later.
                    Err(OlmError::MissingSession) => continue,
                    Err(e) => return Err(e),
                };

                messages
                    .entry(device.user_id().to_owned())
                    .or_insert_with(BTreeMap::new)
                    .insert(
                        DeviceIdOrAllDevices::DeviceId(device.device_id().to_owned()),
                        serde_json::to_value(&encrypted)?,
                    );

                chunk_devices.push(*device);
            }

            if messages.is_empty() {
                continue;
            }

            let request = ToDeviceRequest {
                event_type: "m.room.encrypted".to_owned(),
                txn_id: uuid::Uuid::new_v4(),
                messages,
            };

            self.parts.transport.send_to_device(&request).await?;

            for device in chunk_devices {
                if let Some(key) = device.curve25519_key() {
                    session.mark_shared_with(
                        &device.user_id().to_owned(),
                        &device.device_id().to_owned(),
                        key,
                    );
                }
            }
        }

        session.mark_as_shared();

        Ok(())
    }
}

#[async_trait]
impl RoomEncryptor for MegolmEncryptor {
    fn room_id(&self) -> &RoomId {
        &self.parts.room_id
    }

    async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
        users: &[OwnedUserId],
    ) -> OlmResult<EncryptedEventContent> {
        let mut outbound_guard = self.outbound.lock().await;

        let recipients = self.collect_recipient_devices(users).await?;

        let rotate = outbound_guard
            .as_ref()
            .map(|s| self.group_shrank(s, &recipients))
            .unwrap_or(false);

        let session = self
            .obtain_outbound_session(&mut outbound_guard, rotate)
            .await?;

        self.share_session(&session, &recipients).await?;

        Ok(session.encrypt(event_type, content).await)
    }

    fn invalidate_outbound_session(&self) {
        if let Ok(guard) = self.outbound.try_lock() {
            if let Some(session) = guard.as_ref() {
                session.invalidate_session();
            }
        }
    }
}
