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

use std::{collections::BTreeMap, convert::TryFrom, sync::Arc};

use ruma::{OwnedDeviceId, OwnedUserId, UserId};
use tracing::{debug, trace, warn};

use crate::{
    error::OlmResult,
    identities::DeviceIdentity,
    requests::{HomeserverClient, KeysQueryRequest, KeysQueryResponse},
    store::Store,
    types::DeviceKeys,
};

/// Tracks which users' device lists we mirror and which of those mirrors are
/// stale.
///
/// A user becomes tracked when we share an encrypted room with them. Sync
/// responses flag tracked users as stale; the next refresh downloads their
/// device lists in one batched keys query.
#[derive(Clone, Debug)]
pub(crate) struct DeviceListTracker {
    user_id: Arc<OwnedUserId>,
    device_id: Arc<OwnedDeviceId>,
    store: Store,
    transport: Arc<dyn HomeserverClient>,
}

impl DeviceListTracker {
    pub fn new(
        user_id: Arc<OwnedUserId>,
        device_id: Arc<OwnedDeviceId>,
        store: Store,
        transport: Arc<dyn HomeserverClient>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            store,
            transport,
        }
    }

    /// Start tracking the given user, marking their device list as stale.
    ///
    /// Returns true if the user wasn't tracked before.
    pub async fn start_tracking(&self, user_id: &UserId) -> OlmResult<bool> {
        Ok(self.store.update_tracked_user(user_id, true).await?)
    }

    /// Mark an already tracked user as needing a device list refresh.
    ///
    /// Users we don't track are ignored; we'll learn about their devices when
    /// we first share a room with them.
    pub async fn mark_user_as_changed(&self, user_id: &UserId) -> OlmResult<()> {
        if self.store.is_user_tracked(user_id).await {
            self.store.update_tracked_user(user_id, true).await?;
        }

        Ok(())
    }

    /// Forget a user we no longer share any encrypted room with.
    pub async fn stop_tracking(&self, user_id: &UserId) -> OlmResult<()> {
        Ok(self.store.untrack_user(user_id).await?)
    }

    /// Mark every tracked user as stale.
    ///
    /// Done after an initial sync, when the sync token gap means we may have
    /// missed device list updates.
    pub async fn mark_all_tracked_as_stale(&self) -> OlmResult<()> {
        for user in self.store.tracked_users().await {
            self.store.update_tracked_user(&user, true).await?;
        }

        Ok(())
    }

    /// The tracked users whose device lists need a download.
    pub async fn users_for_key_query(&self) -> Vec<OwnedUserId> {
        self.store.users_for_key_query().await
    }

    /// Download the device lists of all stale users.
    ///
    /// Returns the updated device lists keyed by user.
    pub async fn refresh_outdated_device_lists(
        &self,
    ) -> OlmResult<BTreeMap<OwnedUserId, Vec<DeviceIdentity>>> {
        let users = self.users_for_key_query().await;

        if users.is_empty() {
            return Ok(BTreeMap::new());
        }

        self.download_device_lists(&users).await
    }

    /// Download the device lists of the given users, regardless of staleness.
    ///
    /// Used by the unknown-devices gate, which must not act on a stale
    /// mirror.
    pub async fn force_download_device_lists(
        &self,
        users: &[OwnedUserId],
    ) -> OlmResult<BTreeMap<OwnedUserId, Vec<DeviceIdentity>>> {
        for user in users {
            self.store.update_tracked_user(user, true).await?;
        }

        self.download_device_lists(users).await
    }

    async fn download_device_lists(
        &self,
        users: &[OwnedUserId],
    ) -> OlmResult<BTreeMap<OwnedUserId, Vec<DeviceIdentity>>> {
        let request = KeysQueryRequest {
            device_keys: users.iter().map(|u| (u.clone(), Vec::new())).collect(),
            token: None,
        };

        debug!(users = ?users, "Downloading device lists");

        let response = self.transport.query_keys(request).await?;

        self.apply_response(users, &response).await
    }

    /// Apply a keys query response to the store.
    async fn apply_response(
        &self,
        queried_users: &[OwnedUserId],
        response: &KeysQueryResponse,
    ) -> OlmResult<BTreeMap<OwnedUserId, Vec<DeviceIdentity>>> {
        let mut changed = BTreeMap::new();

        for user_id in queried_users {
            let device_map = match response.device_keys.get(user_id) {
                Some(m) => m,
                None => {
                    trace!(user_id = user_id.as_str(), "Keys query didn't cover user");
                    continue;
                }
            };

            let mut user_devices = Vec::new();

            for (device_id, device_keys) in device_map {
                if &device_keys.user_id != user_id || &device_keys.device_id != device_id {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        "Mismatched device keys in a keys query response"
                    );
                    continue;
                }

                if user_id == &*self.user_id && device_id == &*self.device_id {
                    // Our own device, the local copy is authoritative.
                    continue;
                }

                if let Some(device) = self.update_or_create_device(device_keys).await? {
                    user_devices.push(device);
                }
            }

            self.remove_deleted_devices(user_id, device_map.keys().cloned().collect())
                .await?;

            self.store.save_devices(&user_devices).await?;
            self.store.update_tracked_user(user_id, false).await?;

            changed.insert(user_id.clone(), user_devices);
        }

        Ok(changed)
    }

    /// Update an already known device or verify and add a new one.
    ///
    /// Devices with an invalid signature, or an identity key differing from
    /// the recorded one, are skipped without failing the whole refresh.
    async fn update_or_create_device(
        &self,
        device_keys: &DeviceKeys,
    ) -> OlmResult<Option<DeviceIdentity>> {
        match self
            .store
            .get_device(&device_keys.user_id, &device_keys.device_id)
            .await?
        {
            Some(mut device) => match device.update_device(device_keys) {
                Ok(()) => Ok(Some(device)),
                Err(e) => {
                    warn!(
                        user_id = device_keys.user_id.as_str(),
                        device_id = device_keys.device_id.as_str(),
                        error = ?e,
                        "Rejecting device update"
                    );
                    Ok(None)
                }
            },
            None => match DeviceIdentity::try_from(device_keys) {
                Ok(device) => Ok(Some(device)),
                Err(e) => {
                    warn!(
                        user_id = device_keys.user_id.as_str(),
                        device_id = device_keys.device_id.as_str(),
                        error = ?e,
                        "Rejecting device with an invalid signature"
                    );
                    Ok(None)
                }
            },
        }
    }

    /// Delete the devices of a user that vanished from the freshly
    /// downloaded list.
    async fn remove_deleted_devices(
        &self,
        user_id: &UserId,
        current_ids: Vec<OwnedDeviceId>,
    ) -> OlmResult<()> {
        let stored = self.store.get_user_devices(user_id).await?;

        for device in stored.devices() {
            if !current_ids.iter().any(|id| id == device.device_id()) {
                debug!(
                    user_id = user_id.as_str(),
                    device_id = device.device_id().as_str(),
                    "Device was deleted"
                );
                device.mark_as_deleted();
                self.store.delete_device(device.clone()).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeMap, sync::Arc};

    use ruma::{user_id, OwnedUserId};

    use super::DeviceListTracker;
    use crate::{
        olm::Account,
        requests::{
            HomeserverClient, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
            KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, ToDeviceRequest,
        },
        store::{MemoryStore, Store},
        error::TransportError,
    };

    #[derive(Debug)]
    struct StaticKeysServer {
        response: KeysQueryResponse,
    }

    #[async_trait::async_trait]
    impl HomeserverClient for StaticKeysServer {
        async fn upload_keys(
            &self,
            _: KeysUploadRequest,
        ) -> Result<KeysUploadResponse, TransportError> {
            Ok(KeysUploadResponse::default())
        }

        async fn claim_one_time_keys(
            &self,
            _: KeysClaimRequest,
        ) -> Result<KeysClaimResponse, TransportError> {
            Ok(KeysClaimResponse::default())
        }

        async fn query_keys(
            &self,
            _: KeysQueryRequest,
        ) -> Result<KeysQueryResponse, TransportError> {
            Ok(KeysQueryResponse {
                device_keys: self.response.device_keys.clone(),
                failures: BTreeMap::new(),
            })
        }

        async fn send_to_device(&self, _: &ToDeviceRequest) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn bob_id() -> OwnedUserId {
        user_id!("@bob:localhost").to_owned()
    }

    async fn tracker_with_bob() -> (DeviceListTracker, Store) {
        let bob_account = Account::new(&bob_id(), "BOBDEVICE".into());
        let bob_keys = bob_account.device_keys().await;

        let mut device_keys = BTreeMap::new();
        let mut bob_devices = BTreeMap::new();
        bob_devices.insert(bob_keys.device_id.clone(), bob_keys);
        device_keys.insert(bob_id(), bob_devices);

        let transport = Arc::new(StaticKeysServer {
            response: KeysQueryResponse {
                device_keys,
                failures: BTreeMap::new(),
            },
        });

        let store = Store::new(Arc::new(MemoryStore::new()));

        let tracker = DeviceListTracker::new(
            Arc::new(user_id!("@alice:localhost").to_owned()),
            Arc::new("ALICEDEVICE".into()),
            store.clone(),
            transport,
        );

        (tracker, store)
    }

    #[tokio::test]
    async fn stale_users_are_refreshed() {
        let (tracker, store) = tracker_with_bob().await;

        assert!(tracker.start_tracking(&bob_id()).await.unwrap());
        assert_eq!(tracker.users_for_key_query().await, vec![bob_id()]);

        let changed = tracker.refresh_outdated_device_lists().await.unwrap();
        assert_eq!(changed[&bob_id()].len(), 1);

        // The refresh marked the user clean.
        assert!(tracker.users_for_key_query().await.is_empty());

        let devices = store.get_user_devices(&bob_id()).await.unwrap();
        assert_eq!(devices.devices().count(), 1);
    }

    #[tokio::test]
    async fn changed_flag_only_applies_to_tracked_users() {
        let (tracker, _) = tracker_with_bob().await;

        tracker.mark_user_as_changed(&bob_id()).await.unwrap();
        assert!(tracker.users_for_key_query().await.is_empty());

        tracker.start_tracking(&bob_id()).await.unwrap();
        tracker.refresh_outdated_device_lists().await.unwrap();
        tracker.mark_user_as_changed(&bob_id()).await.unwrap();
        assert_eq!(tracker.users_for_key_query().await, vec![bob_id()]);
    }
}
