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
    collections::BTreeMap,
    convert::TryFrom,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use atomic::Atomic;
use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, EventEncryptionAlgorithm, OwnedDeviceId,
    OwnedDeviceKeyId, OwnedUserId, UserId,
};
use serde_json::json;

use crate::{
    error::SignatureError,
    olm::verify_json,
    types::{DeviceKeys, SignedKey},
};

/// A device represents an E2EE capable client of a user.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    user_id: Arc<OwnedUserId>,
    device_id: Arc<OwnedDeviceId>,
    algorithms: Arc<Vec<EventEncryptionAlgorithm>>,
    keys: Arc<BTreeMap<OwnedDeviceKeyId, String>>,
    signatures: Arc<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>>,
    display_name: Arc<Option<String>>,
    deleted: Arc<AtomicBool>,
    trust_state: Arc<Atomic<LocalTrust>>,
}

/// The local verification state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTrust {
    /// The device was observed but the user never made a trust decision.
    Unknown = 0,
    /// The user saw the device and left it unverified.
    Unverified = 1,
    /// The device has been verified and is trusted.
    Verified = 2,
    /// The device has been blocked from receiving any key material.
    Blacklisted = 3,
}

impl From<i64> for LocalTrust {
    fn from(state: i64) -> Self {
        match state {
            1 => LocalTrust::Unverified,
            2 => LocalTrust::Verified,
            3 => LocalTrust::Blacklisted,
            _ => LocalTrust::Unknown,
        }
    }
}

impl DeviceIdentity {
    /// Create a new device.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        display_name: Option<String>,
        trust_state: LocalTrust,
        algorithms: Vec<EventEncryptionAlgorithm>,
        keys: BTreeMap<OwnedDeviceKeyId, String>,
        signatures: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>,
    ) -> Self {
        DeviceIdentity {
            user_id: Arc::new(user_id),
            device_id: Arc::new(device_id),
            display_name: Arc::new(display_name),
            trust_state: Arc::new(Atomic::new(trust_state)),
            signatures: Arc::new(signatures),
            algorithms: Arc::new(algorithms),
            keys: Arc::new(keys),
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the human readable name of the device.
    pub fn display_name(&self) -> &Option<String> {
        &self.display_name
    }

    /// Get the key of the given key algorithm belonging to this device.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&String> {
        self.keys
            .get(&DeviceKeyId::from_parts(algorithm, &self.device_id))
    }

    /// The long lived curve25519 key naming this device's Olm endpoint.
    pub fn curve25519_key(&self) -> Option<&String> {
        self.get_key(DeviceKeyAlgorithm::Curve25519)
    }

    /// The long lived ed25519 fingerprint key of this device.
    pub fn ed25519_key(&self) -> Option<&String> {
        self.get_key(DeviceKeyAlgorithm::Ed25519)
    }

    /// Get a map containing all the device keys.
    pub fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, String> {
        &self.keys
    }

    /// Get a map containing all the device signatures.
    pub fn signatures(&self) -> &BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>> {
        &self.signatures
    }

    /// Get the trust state of the device.
    pub fn trust_state(&self) -> LocalTrust {
        self.trust_state.load(Ordering::Relaxed)
    }

    /// Is the device locally marked as verified.
    pub fn is_verified(&self) -> bool {
        self.trust_state() == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    ///
    /// Blacklisted devices won't receive any room keys.
    pub fn is_blacklisted(&self) -> bool {
        self.trust_state() == LocalTrust::Blacklisted
    }

    /// Was the device never subject to a local trust decision.
    pub fn is_unknown(&self) -> bool {
        self.trust_state() == LocalTrust::Unknown
    }

    /// Set the local trust state of the device.
    pub(crate) fn set_trust_state(&self, state: LocalTrust) {
        self.trust_state.store(state, Ordering::Relaxed);
    }

    /// Get the list of algorithms this device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.algorithms
    }

    /// Is the device deleted.
    pub fn deleted(&self) -> bool {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Update a device with a new device keys struct.
    ///
    /// The identity keys of a device are immutable: an update that carries a
    /// different ed25519 fingerprint or curve25519 identity key than the ones
    /// we recorded is rejected.
    pub(crate) fn update_device(&mut self, device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        self.verify_device_keys(device_keys)?;

        for algorithm in [DeviceKeyAlgorithm::Ed25519, DeviceKeyAlgorithm::Curve25519] {
            let key_id = DeviceKeyId::from_parts(algorithm, &self.device_id);

            if self.keys.get(&key_id) != device_keys.keys.get(&key_id) {
                return Err(SignatureError::VerificationError);
            }
        }

        let display_name = Arc::new(
            device_keys
                .unsigned
                .as_ref()
                .and_then(|d| d.device_display_name.clone()),
        );

        self.algorithms = Arc::new(device_keys.algorithms.clone());
        self.keys = Arc::new(device_keys.keys.clone());
        self.signatures = Arc::new(device_keys.signatures.clone());
        self.display_name = display_name;

        Ok(())
    }

    fn is_signed_by_device(&self, json: &serde_json::Value) -> Result<(), SignatureError> {
        let signing_key = self
            .ed25519_key()
            .ok_or(SignatureError::MissingSigningKey)?;

        verify_json(
            &self.user_id,
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            signing_key,
            json,
        )
    }

    pub(crate) fn verify_device_keys(
        &self,
        device_keys: &DeviceKeys,
    ) -> Result<(), SignatureError> {
        self.is_signed_by_device(&json!(&device_keys))
    }

    /// Verify that a claimed one-time key was signed by this device.
    pub(crate) fn verify_one_time_key(
        &self,
        one_time_key: &SignedKey,
    ) -> Result<(), SignatureError> {
        self.is_signed_by_device(&json!(&one_time_key))
    }

    /// Mark the device as deleted.
    pub(crate) fn mark_as_deleted(&self) {
        self.deleted.store(true, Ordering::Relaxed);
    }

    /// Build the device from downloaded device keys without checking the
    /// signature. Used for our own device, whose keys we just created.
    pub(crate) fn from_own_keys(device_keys: &DeviceKeys) -> Self {
        DeviceIdentity {
            user_id: Arc::new(device_keys.user_id.clone()),
            device_id: Arc::new(device_keys.device_id.clone()),
            algorithms: Arc::new(device_keys.algorithms.clone()),
            signatures: Arc::new(device_keys.signatures.clone()),
            keys: Arc::new(device_keys.keys.clone()),
            display_name: Arc::new(None),
            deleted: Arc::new(AtomicBool::new(false)),
            trust_state: Arc::new(Atomic::new(LocalTrust::Verified)),
        }
    }
}

impl TryFrom<&DeviceKeys> for DeviceIdentity {
    type Error = SignatureError;

    fn try_from(device_keys: &DeviceKeys) -> Result<Self, Self::Error> {
        let device = DeviceIdentity {
            user_id: Arc::new(device_keys.user_id.clone()),
            device_id: Arc::new(device_keys.device_id.clone()),
            algorithms: Arc::new(device_keys.algorithms.clone()),
            signatures: Arc::new(device_keys.signatures.clone()),
            keys: Arc::new(device_keys.keys.clone()),
            display_name: Arc::new(
                device_keys
                    .unsigned
                    .as_ref()
                    .and_then(|d| d.device_display_name.clone()),
            ),
            deleted: Arc::new(AtomicBool::new(false)),
            trust_state: Arc::new(Atomic::new(LocalTrust::Unknown)),
        };

        device.verify_device_keys(device_keys)?;
        Ok(device)
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id() && self.device_id() == other.device_id()
    }
}
