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

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ruma::{DeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{CryptoStore, Result, RoomSettings, UserDevices};
use crate::{
    identities::DeviceIdentity,
    olm::{InboundGroupSession, PickledAccount, Session},
};

/// An in-memory only store that will forget all the E2EE key material once the
/// object is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    account: Mutex<Option<PickledAccount>>,
    sessions: DashMap<String, Arc<Mutex<Vec<Session>>>>,
    inbound_group_sessions: DashMap<(OwnedRoomId, String, String), InboundGroupSession>,
    tracked_users: DashMap<OwnedUserId, bool>,
    devices: DashMap<OwnedUserId, DashMap<String, DeviceIdentity>>,
    room_settings: DashMap<OwnedRoomId, RoomSettings>,
    values: DashMap<String, Value>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<PickledAccount>> {
        let account = self.account.lock().await;
        Ok(account.as_ref().map(|a| PickledAccount {
            user_id: a.user_id.clone(),
            device_id: a.device_id.clone(),
            pickle: a.pickle.clone(),
            shared: a.shared,
            uploaded_signed_key_count: a.uploaded_signed_key_count,
        }))
    }

    async fn save_account(&self, account: PickledAccount) -> Result<()> {
        *self.account.lock().await = Some(account);
        Ok(())
    }

    async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        for session in sessions {
            let entry = self
                .sessions
                .entry(session.sender_key().to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));

            let mut entry = entry.lock().await;

            if !entry.contains(session) {
                entry.push(session.clone());
            }
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        Ok(self.sessions.get(sender_key).map(|s| s.clone()))
    }

    async fn save_inbound_group_sessions(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()> {
        for session in sessions {
            self.inbound_group_sessions.insert(
                (
                    session.room_id().to_owned(),
                    session.sender_key().to_owned(),
                    session.session_id().to_owned(),
                ),
                session.clone(),
            );
        }

        Ok(())
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self
            .inbound_group_sessions
            .get(&(
                room_id.to_owned(),
                sender_key.to_owned(),
                session_id.to_owned(),
            ))
            .map(|s| s.clone()))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        Ok(self
            .inbound_group_sessions
            .iter()
            .map(|s| s.value().clone())
            .collect())
    }

    async fn update_tracked_user(&self, user: &UserId, dirty: bool) -> Result<bool> {
        Ok(self.tracked_users.insert(user.to_owned(), dirty).is_none())
    }

    async fn untrack_user(&self, user: &UserId) -> Result<()> {
        self.tracked_users.remove(user);
        Ok(())
    }

    async fn is_user_tracked(&self, user: &UserId) -> bool {
        self.tracked_users.contains_key(user)
    }

    async fn tracked_users(&self) -> Vec<OwnedUserId> {
        self.tracked_users.iter().map(|u| u.key().clone()).collect()
    }

    async fn users_for_key_query(&self) -> Vec<OwnedUserId> {
        self.tracked_users
            .iter()
            .filter(|u| *u.value())
            .map(|u| u.key().clone())
            .collect()
    }

    async fn save_devices(&self, devices: &[DeviceIdentity]) -> Result<()> {
        for device in devices {
            self.devices
                .entry(device.user_id().to_owned())
                .or_insert_with(DashMap::new)
                .insert(device.device_id().to_string(), device.clone());
        }

        Ok(())
    }

    async fn delete_device(&self, device: DeviceIdentity) -> Result<()> {
        if let Some(map) = self.devices.get(device.user_id()) {
            map.remove(device.device_id().as_str());
        }

        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>> {
        Ok(self
            .devices
            .get(user_id)
            .and_then(|m| m.get(device_id.as_str()).map(|d| d.clone())))
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices> {
        let entries = self
            .devices
            .get(user_id)
            .map(|m| {
                m.iter()
                    .map(|d| (d.value().device_id().to_owned(), d.value().clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(UserDevices { entries })
    }

    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<RoomSettings>> {
        Ok(self.room_settings.get(room_id).map(|s| s.clone()))
    }

    async fn save_room_settings(&self, room_id: &RoomId, settings: &RoomSettings) -> Result<()> {
        self.room_settings
            .insert(room_id.to_owned(), settings.clone());
        Ok(())
    }

    async fn save_value(&self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_owned(), value);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn delete_value(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::{
        identities::device::test::get_device,
        olm::test::get_account_and_session,
        store::{CryptoStore, MemoryStore},
    };

    #[tokio::test]
    async fn session_store_deduplicates() {
        let (_, session) = get_account_and_session().await;
        let store = MemoryStore::new();

        store.save_sessions(&[session.clone()]).await.unwrap();
        store.save_sessions(&[session.clone()]).await.unwrap();

        let sessions = store.get_sessions(session.sender_key()).await.unwrap().unwrap();
        let sessions = sessions.lock().await;

        assert_eq!(sessions.len(), 1);
        assert_eq!(&sessions[0], &session);
    }

    #[tokio::test]
    async fn device_store_round_trip() {
        let device = get_device();
        let store = MemoryStore::new();

        store.save_devices(&[device.clone()]).await.unwrap();

        let loaded_device = store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(device, loaded_device);

        let user_devices = store.get_user_devices(device.user_id()).await.unwrap();
        assert_eq!(
            user_devices.keys().next().unwrap().as_str(),
            device.device_id().as_str()
        );

        store.delete_device(device.clone()).await.unwrap();
        assert!(store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn account_survives_a_restart() {
        let (account, _) = get_account_and_session().await;
        let store = MemoryStore::new();

        store.save_account(account.pickle().await).await.unwrap();

        let loaded = store.load_account().await.unwrap().unwrap();
        let restored = crate::olm::Account::from_pickle(loaded).unwrap();

        assert_eq!(restored.curve25519_key(), account.curve25519_key());
        assert_eq!(restored.ed25519_key(), account.ed25519_key());
    }
}
