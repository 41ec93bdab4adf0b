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

//! This crate implements the end-to-end encryption coordinator of a Matrix
//! client: a state machine that manages the device identity, establishes Olm
//! sessions with other devices, encrypts and decrypts room messages with
//! Megolm, distributes room keys and answers room key requests.
//!
//! The crate deliberately doesn't do any networking or persistence itself;
//! the host hands it a [`HomeserverClient`] and a [`store::CryptoStore`]
//! implementation and feeds it the relevant parts of every sync response.

#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod algorithms;
mod context;
mod coordinator;
mod error;
mod file_encryption;
mod gossip;
mod identities;
pub mod olm;
mod requests;
mod session_manager;
pub mod store;
mod types;

pub use coordinator::{CryptoCoordinator, RoomKeyImportResult};
pub use error::{
    EventError, MegolmError, MegolmResult, OlmError, OlmResult, SignatureError, TransportError,
};
pub use file_encryption::{
    decrypt_key_export, encrypt_key_export, KeyExportError, DEFAULT_PBKDF2_ITERATIONS,
};
pub use gossip::{
    IncomingRoomKeyRequest, KeyRequestNotification, OutgoingRequestState, OutgoingRoomKeyRequest,
};
pub use identities::{DeviceIdentity, LocalTrust};
pub use requests::{
    DeviceIdOrAllDevices, HomeserverClient, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
    KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, ToDeviceRequest,
};
pub use session_manager::OlmSessionResult;
pub use store::CryptoStoreError;
pub use types::{
    AnyToDeviceEvent, CiphertextInfo, DecryptionResult, DeviceKeys, DeviceLists, EncryptedEvent,
    EncryptedEventContent, ExportedRoomKey, ForwardedRoomKeyContent, KeyRequestAction,
    MembershipState, OneTimeKey, RequestedKeyInfo, RoomContext, RoomKeyContent, RoomKeyInfo,
    RoomKeyRequestContent, SignedKey, SyncChanges, ToDeviceEvent, UnsignedDeviceInfo,
};
