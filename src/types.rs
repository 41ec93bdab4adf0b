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

//! Wire and data types that cross the boundary between the coordinator, the
//! homeserver and the host application.

use std::collections::BTreeMap;

use ruma::{
    EventEncryptionAlgorithm, OwnedDeviceId, OwnedDeviceKeyId, OwnedRoomId, OwnedUserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A one-time key signed by the device that generated it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedKey {
    /// The unpadded base64 encoded curve25519 key.
    pub key: String,
    /// Ed25519 signatures keyed by user and signing key id.
    pub signatures: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>,
}

impl SignedKey {
    pub fn new(
        key: String,
        signatures: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>,
    ) -> Self {
        Self { key, signatures }
    }
}

/// A one-time key as it appears in a keys upload or claim response.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneTimeKey {
    /// A key signed by the owning device.
    SignedKey(SignedKey),
    /// A bare, unsigned key.
    Key(String),
}

/// Additional unsigned data of a published device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    /// The display name the user gave the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

/// The signed identity keys of a device, in the form they are uploaded to and
/// downloaded from the homeserver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The id of the user that owns the device.
    pub user_id: OwnedUserId,
    /// The unique id of the device.
    pub device_id: OwnedDeviceId,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<EventEncryptionAlgorithm>,
    /// Public identity keys, keyed by algorithm and device id.
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,
    /// Signatures over the canonical form of this object.
    pub signatures: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>,
    /// Additional data that isn't covered by the signatures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<UnsignedDeviceInfo>,
}

/// A device addressed event, as delivered by the sync response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent<C> {
    /// The user that sent us the event.
    pub sender: OwnedUserId,
    /// The body of the event.
    pub content: C,
}

/// An undeserialized to-device event together with its type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnyToDeviceEvent {
    /// The user that sent us the event.
    pub sender: OwnedUserId,
    /// The Matrix event type, e.g. `m.room.encrypted`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The raw content of the event.
    pub content: Value,
}

/// The content of an `m.room_key` event, carrying a Megolm session key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm the session key is to be used with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The unique id of the session.
    pub session_id: String,
    /// The exported session key.
    pub session_key: String,
}

/// The content of an `m.forwarded_room_key` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    pub algorithm: EventEncryptionAlgorithm,
    pub room_id: OwnedRoomId,
    /// The curve25519 key of the device that originally created the session.
    pub sender_key: String,
    pub session_id: String,
    /// The session key, exported at the index the forwarder was willing to
    /// share.
    pub session_key: String,
    /// The ed25519 key the original sender claimed to own.
    pub sender_claimed_ed25519_key: String,
    /// The chain of curve25519 keys the key traveled through before reaching
    /// us.
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// The action of an `m.room_key_request` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRequestAction {
    /// Ask the receiving devices for a room key.
    Request,
    /// Withdraw a previously sent request.
    RequestCancellation,
}

/// The body of a room key request, identifying the wanted session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    pub algorithm: EventEncryptionAlgorithm,
    pub room_id: OwnedRoomId,
    /// The curve25519 key of the device that created the session.
    pub sender_key: String,
    pub session_id: String,
}

impl RequestedKeyInfo {
    /// A stable fingerprint of the requested session.
    ///
    /// Requests with an equal fingerprint ask for the same key and are
    /// deduplicated on it.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.sender_key, self.room_id, self.session_id, self.algorithm
        )
    }
}

/// The content of an `m.room_key_request` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    pub action: KeyRequestAction,
    /// The device that wants the key.
    pub requesting_device_id: OwnedDeviceId,
    /// A request id, unique per requesting device.
    pub request_id: String,
    /// The wanted session. Absent for cancellations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
}

/// A single Olm ciphertext and its message type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CiphertextInfo {
    /// The unpadded base64 encoded ciphertext.
    pub body: String,
    /// 0 for a pre-key message, 1 for a normal message.
    #[serde(rename = "type")]
    pub message_type: u8,
}

/// The content of an `m.room.encrypted` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum EncryptedEventContent {
    /// An event encrypted with the 1-to-1 Olm ratchet.
    #[serde(rename = "m.olm.v1.curve25519-aes-sha2")]
    OlmV1Curve25519AesSha2 {
        /// Ciphertexts keyed by the recipient device's curve25519 key.
        ciphertext: BTreeMap<String, CiphertextInfo>,
        /// The curve25519 key of the sending device.
        sender_key: String,
    },
    /// An event encrypted with the Megolm group ratchet.
    #[serde(rename = "m.megolm.v1.aes-sha2")]
    MegolmV1AesSha2 {
        /// The unpadded base64 encoded ciphertext.
        ciphertext: String,
        /// The curve25519 key of the device that owns the outbound session.
        sender_key: String,
        /// The id of the Megolm session that produced the ciphertext.
        session_id: String,
        /// The id of the sending device.
        device_id: OwnedDeviceId,
    },
}

impl EncryptedEventContent {
    /// The algorithm that was used to encrypt this content.
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            EncryptedEventContent::OlmV1Curve25519AesSha2 { .. } => {
                EventEncryptionAlgorithm::OlmV1Curve25519AesSha2
            }
            EncryptedEventContent::MegolmV1AesSha2 { .. } => {
                EventEncryptionAlgorithm::MegolmV1AesSha2
            }
        }
    }
}

/// An encrypted room event as it arrives from the sync or from pagination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The id of the event, if the server assigned one already.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// The room the event was sent in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,
    /// The server side timestamp of the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<u64>,
    /// The encrypted payload.
    pub content: EncryptedEventContent,
}

/// The result of decrypting an encrypted room event.
#[derive(Clone, Debug)]
pub struct DecryptionResult {
    /// The decrypted event, with `type` and `content` fields.
    pub clear_event: Value,
    /// The curve25519 key of the device that encrypted the event.
    pub sender_curve25519_key: String,
    /// The ed25519 key the sender claimed to own when the session was
    /// distributed. Unauthenticated for forwarded keys.
    pub claimed_ed25519_key: Option<String>,
    /// Devices the key was forwarded through, empty for directly received
    /// keys.
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// An inbound Megolm session in its exportable form.
///
/// This is the entry format of the Megolm key export file and of
/// `m.forwarded_room_key` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    pub algorithm: EventEncryptionAlgorithm,
    pub room_id: OwnedRoomId,
    pub sender_key: String,
    pub session_id: String,
    pub session_key: String,
    /// Keys the original sender claimed to own, usually only `ed25519`.
    pub sender_claimed_keys: BTreeMap<String, String>,
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// Identifying information of a newly usable inbound session, emitted on the
/// room-keys-received stream so the host can retry queued events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomKeyInfo {
    pub algorithm: EventEncryptionAlgorithm,
    pub room_id: OwnedRoomId,
    pub sender_key: String,
    pub session_id: String,
}

/// Device list changes of a sync response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    /// Users whose device lists changed since the last sync.
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    /// Users we no longer share an encrypted room with.
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

/// The parts of a sync response the coordinator consumes.
#[derive(Clone, Debug, Default)]
pub struct SyncChanges {
    /// The to-device events of the sync response.
    pub to_device_events: Vec<AnyToDeviceEvent>,
    /// The device list changes of the sync response.
    pub device_lists: DeviceLists,
    /// The count of our one-time keys published on the server, keyed by
    /// algorithm name.
    pub one_time_key_counts: BTreeMap<String, u64>,
}

impl SyncChanges {
    /// The server side count of our published `signed_curve25519` one-time
    /// keys, if the sync reported one.
    pub fn signed_curve25519_count(&self) -> Option<u64> {
        self.one_time_key_counts.get("signed_curve25519").copied()
    }
}

/// The membership states the room-member hook distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
}

/// A snapshot of the room state the host passes alongside an event that
/// should be encrypted.
#[derive(Clone, Debug)]
pub struct RoomContext {
    /// The id of the room.
    pub room_id: OwnedRoomId,
    /// Users currently joined to the room.
    pub joined_members: Vec<OwnedUserId>,
    /// Users invited to the room but not yet joined.
    pub invited_members: Vec<OwnedUserId>,
    /// Whether the room's join rules make it acceptable to encrypt for
    /// invited users (invite-only rooms qualify, public ones don't).
    pub should_encrypt_for_invited_members: bool,
}

impl RoomContext {
    /// The users an outbound session for this room should reach, given the
    /// global invitee policy.
    pub fn recipients(&self, encrypt_to_invited: bool) -> Vec<OwnedUserId> {
        if encrypt_to_invited && self.should_encrypt_for_invited_members {
            self.joined_members
                .iter()
                .chain(self.invited_members.iter())
                .cloned()
                .collect()
        } else {
            self.joined_members.clone()
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn encrypted_content_round_trip() {
        let content = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "ciphertext": "AwgAEnACgAkLmt6qF84IK++J7UDH2Za1YVchHyprqTqsg",
            "sender_key": "38nvus98N98ufjPs9pfs8SDF87sdfpsiud98s98sdfANs",
            "session_id": "X3lUlvLELLYxeTx4yOVu6UDpasGEVO0Jbu+QFnm0cKQ",
            "device_id": "RJYKSTBOIE",
        });

        let content: EncryptedEventContent = serde_json::from_value(content).unwrap();

        assert_eq!(
            content.algorithm(),
            EventEncryptionAlgorithm::MegolmV1AesSha2
        );

        let serialized = serde_json::to_value(&content).unwrap();
        assert_eq!(serialized["algorithm"], "m.megolm.v1.aes-sha2");
        assert_eq!(serialized["device_id"], "RJYKSTBOIE");
    }

    #[test]
    fn key_request_content_deserialization() {
        let content = json!({
            "action": "request",
            "requesting_device_id": "RJYKSTBOIE",
            "request_id": "9b84ee0f-e2b5-4a46-92b9-85a891a86d5e",
            "body": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "room_id": "!Cuyf34gef24t:localhost",
                "sender_key": "RF3s+E7RkTQTGF2d8Deol0FkQvgII2aJDf3/Jp5mxVU",
                "session_id": "X3lUlvLELLYxeTx4yOVu6UDpasGEVO0Jbu+QFnm0cKQ"
            }
        });

        let content: RoomKeyRequestContent = serde_json::from_value(content).unwrap();

        assert_eq!(content.action, KeyRequestAction::Request);
        let body = content.body.unwrap();
        assert_eq!(
            body.fingerprint(),
            "RF3s+E7RkTQTGF2d8Deol0FkQvgII2aJDf3/Jp5mxVU|!Cuyf34gef24t:localhost|\
             X3lUlvLELLYxeTx4yOVu6UDpasGEVO0Jbu+QFnm0cKQ|m.megolm.v1.aes-sha2"
        );
    }

    #[test]
    fn recipients_respect_invitee_policy() {
        let room = RoomContext {
            room_id: ruma::room_id!("!test:localhost").to_owned(),
            joined_members: vec![ruma::user_id!("@alice:localhost").to_owned()],
            invited_members: vec![ruma::user_id!("@bob:localhost").to_owned()],
            should_encrypt_for_invited_members: true,
        };

        assert_eq!(room.recipients(false).len(), 1);
        assert_eq!(room.recipients(true).len(), 2);
    }
}
