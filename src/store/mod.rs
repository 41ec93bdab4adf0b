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

//! Types and traits to implement the storage layer of the coordinator.
//!
//! The storage layer is responsible for persisting the account, the
//! established Olm and Megolm sessions, known devices, tracking state and
//! the pending key requests, so a client can resume without recreating its
//! cryptographic identity.

use core::fmt::Debug;
use std::{collections::HashMap, io::Error as IoError, ops::Deref, sync::Arc};

use async_trait::async_trait;
use olm_rs::errors::{OlmAccountError, OlmGroupSessionError, OlmSessionError};
use ruma::{
    DeviceId, EventEncryptionAlgorithm, OwnedDeviceId, OwnedUserId, RoomId, UserId,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Error as SerdeError;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    identities::DeviceIdentity,
    olm::{InboundGroupSession, PickledAccount, Session},
};

pub mod memorystore;

pub use memorystore::MemoryStore;

/// The crypto store's error type.
#[derive(Error, Debug)]
pub enum CryptoStoreError {
    /// The account that owns the sessions, group sessions, and devices wasn't
    /// found.
    #[error("can't save/load sessions or group sessions in the store before an account is stored")]
    AccountUnset,

    /// The store holds an account for a different user or device.
    #[error("the account in the store doesn't match the requested user or device")]
    MismatchedAccount,

    /// An IO error occurred.
    #[error(transparent)]
    Io(#[from] IoError),

    /// The underlying Olm Account operation returned an error.
    #[error(transparent)]
    OlmAccount(#[from] OlmAccountError),

    /// The underlying Olm session operation returned an error.
    #[error(transparent)]
    OlmSession(#[from] OlmSessionError),

    /// The underlying Olm group session operation returned an error.
    #[error(transparent)]
    OlmGroupSession(#[from] OlmGroupSessionError),

    /// The store failed to (de)serialize a data type.
    #[error(transparent)]
    Serialization(#[from] SerdeError),
}

pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// Per-room encryption configuration as persisted by the store.
///
/// The algorithm is write-once: once a room was configured the stored value
/// wins over any later, differing configuration event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomSettings {
    /// The algorithm the room encrypts with.
    pub algorithm: EventEncryptionAlgorithm,
    /// Session rotation period in milliseconds, if the room state set one.
    pub rotation_period_ms: Option<u64>,
    /// Session rotation message count, if the room state set one.
    pub rotation_period_msgs: Option<u64>,
    /// Should unverified devices of this room be excluded from key
    /// distribution.
    #[serde(default)]
    pub blacklist_unverified_devices: bool,
}

/// A read-only snapshot of all devices belonging to a user.
#[derive(Clone, Debug, Default)]
pub struct UserDevices {
    pub(crate) entries: HashMap<OwnedDeviceId, DeviceIdentity>,
}

impl UserDevices {
    /// Create a snapshot from the devices a store holds for one user.
    pub fn new(entries: HashMap<OwnedDeviceId, DeviceIdentity>) -> Self {
        Self { entries }
    }

    /// Get the specific device with the given device id.
    pub fn get(&self, device_id: &DeviceId) -> Option<DeviceIdentity> {
        self.entries.get(device_id).cloned()
    }

    /// Iterator over all the device ids of the user.
    pub fn keys(&self) -> impl Iterator<Item = &OwnedDeviceId> {
        self.entries.keys()
    }

    /// Iterator over all the devices of the user.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.entries.values()
    }

    /// Is the snapshot empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trait abstracting a store that the coordinator uses to persist its
/// cryptographic state.
#[async_trait]
pub trait CryptoStore: Debug + Send + Sync {
    /// Load an account that was previously stored.
    async fn load_account(&self) -> Result<Option<PickledAccount>>;

    /// Save the given account in the store.
    async fn save_account(&self, account: PickledAccount) -> Result<()>;

    /// Save the given sessions in the store.
    ///
    /// # Arguments
    ///
    /// * `sessions` - The sessions that should be stored.
    async fn save_sessions(&self, sessions: &[Session]) -> Result<()>;

    /// Get all the Olm sessions we share with the device owning the given
    /// curve25519 key.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The sender key that was used to establish the
    ///   sessions.
    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>>;

    /// Save the given inbound group sessions in the store.
    async fn save_inbound_group_sessions(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()>;

    /// Get the inbound group session from our store.
    ///
    /// # Arguments
    /// * `room_id` - The room id of the room that the session belongs to.
    ///
    /// * `sender_key` - The sender key that sent us the session.
    ///
    /// * `session_id` - The unique id of the session.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Get all the inbound group sessions we have stored.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>>;

    /// Add a user for tracking, or change the dirty flag of an already
    /// tracked user.
    ///
    /// Returns true if the user wasn't already tracked, false otherwise.
    ///
    /// # Arguments
    ///
    /// * `user` - The user that should be marked as tracked.
    ///
    /// * `dirty` - Should the user be also marked for a key query.
    async fn update_tracked_user(&self, user: &UserId, dirty: bool) -> Result<bool>;

    /// Remove a user from tracking, e.g. when the last shared encrypted room
    /// was left.
    async fn untrack_user(&self, user: &UserId) -> Result<()>;

    /// Is the given user tracked.
    async fn is_user_tracked(&self, user: &UserId) -> bool;

    /// Get the set of tracked users.
    async fn tracked_users(&self) -> Vec<OwnedUserId>;

    /// The subset of the tracked users whose device lists are stale.
    async fn users_for_key_query(&self) -> Vec<OwnedUserId>;

    /// Save the given devices in the store.
    async fn save_devices(&self, devices: &[DeviceIdentity]) -> Result<()>;

    /// Delete the given device from the store.
    async fn delete_device(&self, device: DeviceIdentity) -> Result<()>;

    /// Get the device for the given user with the given device id.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>>;

    /// Get all the devices of the given user.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices>;

    /// Get the persisted encryption settings of a room.
    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<RoomSettings>>;

    /// Persist the encryption settings of a room.
    async fn save_room_settings(&self, room_id: &RoomId, settings: &RoomSettings) -> Result<()>;

    /// Save a free-form value under the given key.
    async fn save_value(&self, key: &str, value: Value) -> Result<()>;

    /// Load a free-form value.
    async fn get_value(&self, key: &str) -> Result<Option<Value>>;

    /// Delete a free-form value.
    async fn delete_value(&self, key: &str) -> Result<()>;
}

/// A cloneable handle over the configured crypto store.
#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<dyn CryptoStore>,
}

impl Store {
    pub fn new(store: Arc<dyn CryptoStore>) -> Self {
        Self { inner: store }
    }

    /// Load a typed object from the free-form value storage.
    pub async fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.inner.get_value(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store a typed object in the free-form value storage.
    pub async fn save_object<T: Serialize>(&self, key: &str, object: &T) -> Result<()> {
        let value = serde_json::to_value(object)?;
        self.inner.save_value(key, value).await
    }

    /// Delete an object from the free-form value storage.
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.inner.delete_value(key).await
    }

    /// Should unverified devices be excluded from key distribution in every
    /// room.
    pub async fn global_blacklist_unverified_devices(&self) -> Result<bool> {
        Ok(self
            .get_object(Self::GLOBAL_BLACKLIST_KEY)
            .await?
            .unwrap_or(false))
    }

    /// Persist the global unverified-device blacklist switch.
    pub async fn set_global_blacklist_unverified_devices(&self, blacklist: bool) -> Result<()> {
        self.save_object(Self::GLOBAL_BLACKLIST_KEY, &blacklist).await
    }

    /// Should encrypting to a room fail while it contains devices the user
    /// never saw.
    pub async fn warn_on_unknown_devices(&self) -> Result<bool> {
        Ok(self
            .get_object(Self::WARN_ON_UNKNOWN_DEVICES_KEY)
            .await?
            .unwrap_or(true))
    }

    /// Persist the unknown-device warning switch.
    pub async fn set_warn_on_unknown_devices(&self, warn: bool) -> Result<()> {
        self.save_object(Self::WARN_ON_UNKNOWN_DEVICES_KEY, &warn).await
    }

    const GLOBAL_BLACKLIST_KEY: &'static str = "global_blacklist_unverified_devices";
    const WARN_ON_UNKNOWN_DEVICES_KEY: &'static str = "warn_on_unknown_devices";
}

impl Deref for Store {
    type Target = dyn CryptoStore;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

#[cfg(test)]
mod test {
    use ruma::user_id;
    use serde_json::json;

    use super::{MemoryStore, Store};
    use std::sync::Arc;

    #[tokio::test]
    async fn object_storage_round_trips() {
        let store = Store::new(Arc::new(MemoryStore::new()));

        assert!(store.get_object::<String>("request").await.unwrap().is_none());

        store.save_object("request", &"id".to_owned()).await.unwrap();
        assert_eq!(
            store.get_object::<String>("request").await.unwrap().unwrap(),
            "id"
        );

        store.delete_object("request").await.unwrap();
        assert!(store.get_object::<String>("request").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tracked_users_have_a_dirty_flag() {
        let store = Store::new(Arc::new(MemoryStore::new()));
        let user = user_id!("@alice:localhost");

        assert!(store.update_tracked_user(user, true).await.unwrap());
        assert!(!store.update_tracked_user(user, false).await.unwrap());

        assert!(store.is_user_tracked(user).await);
        assert!(store.users_for_key_query().await.is_empty());

        store.update_tracked_user(user, true).await.unwrap();
        assert_eq!(store.users_for_key_query().await, vec![user.to_owned()]);

        // Unrelated values don't disturb tracking.
        store.save_value("key", json!(1)).await.unwrap();
        assert!(store.is_user_tracked(user).await);
    }
}
