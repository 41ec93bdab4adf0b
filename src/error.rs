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

use cjson::Error as CjsonError;
use olm_rs::errors::{OlmGroupSessionError, OlmSessionError};
use ruma::{IdParseError, OwnedDeviceId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

use super::store::CryptoStoreError;

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The underlying Olm session operation returned an error.
    #[error("can't finish Olm Session operation {0}")]
    OlmSession(#[from] OlmSessionError),

    /// The underlying group session operation returned an error.
    #[error("can't finish Olm group session operation {0}")]
    OlmGroupSession(#[from] OlmGroupSessionError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The transport layer returned an error while talking to the homeserver.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encryption failed because the device does not have a valid Olm session
    /// with us.
    #[error(
        "encryption failed because the device does not \
            have a valid Olm session with us"
    )]
    MissingSession,

    /// Encryption failed because the room has no configured algorithm or the
    /// configured algorithm has no registered implementation.
    #[error("encryption isn't enabled: {0}")]
    EncryptionNotEnabled(String),

    /// The pre-send device check found devices that were never seen before.
    ///
    /// Carries the map of unknown devices per user so the caller can prompt
    /// for a verification decision.
    #[error("there are unknown devices in the room")]
    UnknownDevices(BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>),

    /// Startup failed with an error that a retry can't fix.
    #[error("the coordinator failed to start: {0}")]
    Startup(String),

    /// The coordinator was closed and no longer accepts work.
    #[error("the coordinator has been closed")]
    Closed,

    /// A group encryption operation returned an error.
    #[error(transparent)]
    Megolm(#[from] MegolmError),
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because we don't hold the inbound group session the
    /// event was encrypted with.
    #[error("decryption failed because the session to decrypt the message is missing")]
    MissingSession,

    /// Decryption failed because our copy of the inbound group session starts
    /// at a later message index than the event uses.
    #[error("decryption failed because the session doesn't reach back to the message index")]
    UnknownMessageIndex,

    /// The ciphertext is malformed or its authentication tag doesn't match.
    #[error("the encrypted message is malformed or was tampered with")]
    BadEncryptedMessage,

    /// The same (session, message index) pair was already decrypted in this
    /// timeline.
    #[error("a message with the same message index was already decrypted in this timeline")]
    Replay,

    /// The underlying group session operation returned an error.
    #[error("can't finish Olm group session operation {0}")]
    OlmGroupSession(#[from] OlmGroupSessionError),

    /// A key export couldn't be read or written.
    #[error(transparent)]
    KeyExport(#[from] crate::file_encryption::KeyExportError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The coordinator was closed and no longer accepts work.
    #[error("the coordinator has been closed")]
    Closed,
}

/// Errors for malformed or mismatching encrypted events.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("the Olm message has a unsupported type")]
    UnsupportedOlmType,

    #[error("the encrypted message has been encrypted with a unsupported algorithm")]
    UnsupportedAlgorithm,

    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    #[error("the encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    #[error("the encrypted message is missing the signing key of the sender")]
    MissingSigningKey,

    #[error("the encrypted message is missing the sender key")]
    MissingSenderKey,

    #[error("the encrypted message is missing the field {0}")]
    MissingField(String),

    #[error("the sender of the plaintext doesn't match the sender of the encrypted message")]
    MismatchedSender,

    #[error("the room of the plaintext doesn't match the room of the encrypted message")]
    MismatchedRoom,

    #[error("the keys of the message don't match the keys in our database")]
    MismatchedKeys,
}

/// Errors of the transport layer, as seen by the coordinator.
///
/// The concrete HTTP client lives outside of this crate; implementations of
/// the homeserver trait translate their failures into these two buckets so
/// the coordinator can decide between retrying and surfacing.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The homeserver couldn't be reached at all.
    #[error("the homeserver is unreachable: {0}")]
    Network(String),

    /// The homeserver answered with a Matrix error.
    #[error("the homeserver returned an error: {status} {errcode}")]
    Protocol {
        /// The HTTP status code of the response.
        status: u16,
        /// The Matrix `errcode` from the response body.
        errcode: String,
    },
}

impl TransportError {
    /// Is this an error that a startup retry can plausibly fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Protocol { status, .. } => *status >= 500,
        }
    }
}

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("the signature used a unsupported algorithm")]
    UnsupportedAlgorithm,

    #[error("the key id of the signing key is invalid")]
    InvalidKeyId(#[from] IdParseError),

    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    #[error("the provided JSON object can't be converted to a canonical representation")]
    CanonicalJsonError(CjsonError),

    #[error("the signature didn't match the provided key")]
    VerificationError,
}

impl From<CjsonError> for SignatureError {
    fn from(error: CjsonError) -> Self {
        Self::CanonicalJsonError(error)
    }
}

impl From<SerdeError> for SignatureError {
    fn from(_: SerdeError) -> Self {
        Self::NotAnObject
    }
}

#[derive(Error, Debug)]
pub(crate) enum SessionCreationError {
    #[error(
        "Failed to create a new Olm session for {0} {1}, the requested \
        one-time key isn't a signed curve key"
    )]
    OneTimeKeyNotSigned(OwnedUserId, OwnedDeviceId),
    #[error(
        "Tried to create a new Olm session for {0} {1}, but the signed \
        one-time key is missing"
    )]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),
    #[error("Failed to verify the one-time key signatures for {0} {1}: {2:?}")]
    InvalidSignature(OwnedUserId, OwnedDeviceId, SignatureError),
    #[error(
        "Tried to create an Olm session for {0} {1}, but the device is missing \
        a curve25519 key"
    )]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),
    #[error("Error creating new Olm session for {0} {1}: {2:?}")]
    OlmError(OwnedUserId, OwnedDeviceId, OlmSessionError),
}
