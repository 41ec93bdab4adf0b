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

//! The requests the coordinator sends to the homeserver and the trait the
//! host's HTTP client implements to carry them.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use ruma::{OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::TransportError,
    types::{DeviceKeys, OneTimeKey},
};

/// Request to publish our device keys and fresh one-time keys.
///
/// Both fields are optional; an empty upload is a valid way to learn the
/// current server side one-time key counts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// The signed identity keys of this device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Signed one-time keys, keyed by `signed_curve25519:<key_id>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_keys: Option<BTreeMap<OwnedDeviceKeyId, OneTimeKey>>,
}

/// Response to a keys upload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// Counts of unclaimed one-time keys currently held by the server, keyed
    /// by algorithm.
    pub one_time_key_counts: BTreeMap<String, u64>,
}

impl KeysUploadResponse {
    /// The count of our published `signed_curve25519` keys.
    pub fn signed_curve25519_count(&self) -> u64 {
        self.one_time_key_counts
            .get("signed_curve25519")
            .copied()
            .unwrap_or_default()
    }
}

/// Request to claim one-time keys so Olm sessions can be established.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The algorithm of the wanted key, per user and device.
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
}

/// Response to a one-time key claim.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed keys, per user and device. The inner map is keyed by the
    /// full key id, e.g. `signed_curve25519:AAAAHg`.
    pub one_time_keys:
        BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<OwnedDeviceKeyId, OneTimeKey>>>,
    /// Servers that couldn't be reached, keyed by server name.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Request to download the device lists of the given users.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users whose devices should be listed. An empty device list per
    /// user requests all of the user's devices.
    pub device_keys: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    /// The sync token the query is consistent with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Response to a device list query.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The downloaded signed device keys, per user and device.
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
    /// Servers that couldn't be reached, keyed by server name.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Addressing of a to-device message: a single device or every device of the
/// user.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceIdOrAllDevices {
    /// Address a single device.
    DeviceId(OwnedDeviceId),
    /// Address all devices of the user, serialized as `*`.
    AllDevices,
}

impl fmt::Display for DeviceIdOrAllDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdOrAllDevices::DeviceId(id) => write!(f, "{}", id),
            DeviceIdOrAllDevices::AllDevices => write!(f, "*"),
        }
    }
}

impl Serialize for DeviceIdOrAllDevices {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceIdOrAllDevices {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;

        if value == "*" {
            Ok(DeviceIdOrAllDevices::AllDevices)
        } else if value.is_empty() {
            Err(de::Error::custom("device id can't be empty"))
        } else {
            Ok(DeviceIdOrAllDevices::DeviceId(value.into()))
        }
    }
}

/// A batch of device addressed messages of a single event type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// The type of the event that is sent, e.g. `m.room_key_request`.
    pub event_type: String,
    /// The transaction id the request is retried under.
    pub txn_id: Uuid,
    /// The event contents, per recipient user and device.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, Value>>,
}

impl ToDeviceRequest {
    /// Create a new to-device request addressed to a single device.
    pub fn new(
        recipient: &ruma::UserId,
        recipient_device: DeviceIdOrAllDevices,
        event_type: &str,
        content: Value,
    ) -> Self {
        let mut messages = BTreeMap::new();
        let mut user_messages = BTreeMap::new();
        user_messages.insert(recipient_device, content);
        messages.insert(recipient.to_owned(), user_messages);

        Self {
            event_type: event_type.to_owned(),
            txn_id: Uuid::new_v4(),
            messages,
        }
    }

    /// The number of messages the request carries.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|m| m.len()).sum()
    }
}

/// The REST surface of the homeserver, from the coordinator's point of view.
///
/// Implementations translate these typed calls into the Matrix client-server
/// API. All methods are suspension points; the coordinator keeps processing
/// other work while a call is in flight.
#[async_trait]
pub trait HomeserverClient: fmt::Debug + Send + Sync {
    /// Upload device keys and/or one-time keys.
    async fn upload_keys(
        &self,
        request: KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError>;

    /// Claim one-time keys for establishing Olm sessions.
    async fn claim_one_time_keys(
        &self,
        request: KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError>;

    /// Download device lists of the given users.
    async fn query_keys(
        &self,
        request: KeysQueryRequest,
    ) -> Result<KeysQueryResponse, TransportError>;

    /// Send device addressed events.
    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError>;
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn all_devices_serialization() {
        let all = DeviceIdOrAllDevices::AllDevices;
        assert_eq!(serde_json::to_value(&all).unwrap(), json!("*"));

        let device: DeviceIdOrAllDevices = serde_json::from_value(json!("DEVICEID")).unwrap();
        assert_eq!(
            device,
            DeviceIdOrAllDevices::DeviceId("DEVICEID".into())
        );
    }

    #[test]
    fn to_device_request_counts_messages() {
        let request = ToDeviceRequest::new(
            ruma::user_id!("@alice:localhost"),
            DeviceIdOrAllDevices::AllDevices,
            "m.room_key_request",
            json!({}),
        );

        assert_eq!(request.message_count(), 1);
        assert_eq!(request.event_type, "m.room_key_request");
    }
}
