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

use std::{collections::BTreeMap, sync::Arc};

use ruma::{EventEncryptionAlgorithm, OwnedDeviceId, OwnedUserId, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    algorithms::RoomDecryptor,
    error::OlmResult,
    identities::LocalTrust,
    store::Store,
    types::{KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent},
};

/// A room key request another device sent us, waiting for a user decision.
///
/// Persisted until it reaches a terminal state: the coordinator's
/// `accept_key_request` and `ignore_key_request` methods are the two terminal
/// actions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomingRoomKeyRequest {
    /// The user that sent the request.
    pub user_id: OwnedUserId,
    /// The device that wants the key.
    pub device_id: OwnedDeviceId,
    /// The id of the request, unique per requesting device.
    pub request_id: String,
    /// The session the device asks for.
    pub body: RequestedKeyInfo,
}

impl IncomingRoomKeyRequest {
    fn storage_key(&self) -> String {
        format!("{}|{}|{}", self.user_id, self.device_id, self.request_id)
    }
}

/// Host-visible notifications about incoming key requests.
#[derive(Clone, Debug)]
pub enum KeyRequestNotification {
    /// A request needs a user decision.
    Request(IncomingRoomKeyRequest),
    /// A previously delivered request was withdrawn by the requester.
    Cancellation {
        /// The user that withdrew the request.
        user_id: OwnedUserId,
        /// The device that withdrew the request.
        device_id: OwnedDeviceId,
        /// The id of the withdrawn request.
        request_id: String,
    },
}

/// Queue of incoming `m.room_key_request` events.
///
/// Events are appended as they arrive with a sync and processed in batch on
/// the next non-catch-up sync.
#[derive(Debug)]
pub(crate) struct IncomingKeyRequestQueue {
    user_id: Arc<OwnedUserId>,
    device_id: Arc<OwnedDeviceId>,
    store: Store,
    queued: Mutex<Vec<(OwnedUserId, RoomKeyRequestContent)>>,
    notifications: broadcast::Sender<KeyRequestNotification>,
}

const STORE_KEY: &str = "incoming_key_requests";

impl IncomingKeyRequestQueue {
    pub fn new(
        user_id: Arc<OwnedUserId>,
        device_id: Arc<OwnedDeviceId>,
        store: Store,
        notifications: broadcast::Sender<KeyRequestNotification>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            store,
            queued: Mutex::new(Vec::new()),
            notifications,
        }
    }

    /// Append a freshly received request or cancellation to the queue.
    pub async fn receive(&self, sender: OwnedUserId, content: RoomKeyRequestContent) {
        self.queued.lock().await.push((sender, content));
    }

    /// Subscribe to request/cancellation notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<KeyRequestNotification> {
        self.notifications.subscribe()
    }

    /// Process everything queued since the last drain.
    ///
    /// `decryptors` resolves the decryptor responsible for a (room,
    /// algorithm) pair; requests nobody can serve are dropped.
    pub async fn process_queued_requests(
        &self,
        decryptors: &(dyn Fn(&RoomId, &EventEncryptionAlgorithm) -> Option<Arc<dyn RoomDecryptor>>
              + Send
              + Sync),
    ) -> OlmResult<()> {
        let queued: Vec<_> = self.queued.lock().await.drain(..).collect();

        for (sender, content) in queued {
            match content.action {
                KeyRequestAction::Request => {
                    self.process_request(sender, content, decryptors).await?;
                }
                KeyRequestAction::RequestCancellation => {
                    self.process_cancellation(sender, content).await?;
                }
            }
        }

        Ok(())
    }

    async fn process_request(
        &self,
        sender: OwnedUserId,
        content: RoomKeyRequestContent,
        decryptors: &(dyn Fn(&RoomId, &EventEncryptionAlgorithm) -> Option<Arc<dyn RoomDecryptor>>
              + Send
              + Sync),
    ) -> OlmResult<()> {
        let body = match content.body {
            Some(b) => b,
            None => return Ok(()),
        };

        // Cross-user sharing stays unimplemented.
        if &sender != &*self.user_id {
            debug!(
                sender = sender.as_str(),
                "Ignoring a room key request from another user"
            );
            return Ok(());
        }

        if content.requesting_device_id == *self.device_id {
            return Ok(());
        }

        let request = IncomingRoomKeyRequest {
            user_id: sender,
            device_id: content.requesting_device_id,
            request_id: content.request_id,
            body,
        };

        let decryptor = match decryptors(&request.body.room_id, &request.body.algorithm) {
            Some(d) => d,
            None => {
                debug!(
                    room_id = request.body.room_id.as_str(),
                    algorithm = ?request.body.algorithm,
                    "Ignoring a room key request we have no decryptor for"
                );
                return Ok(());
            }
        };

        if !decryptor.has_keys_for_key_request(&request.body).await? {
            self.remove_persisted(&request).await?;
            return Ok(());
        }

        let device = self
            .store
            .get_device(&request.user_id, &request.device_id)
            .await?;

        let device = match device {
            Some(d) => d,
            None => {
                debug!(
                    device_id = request.device_id.as_str(),
                    "Ignoring a room key request from an unknown device"
                );
                return Ok(());
            }
        };

        match device.trust_state() {
            LocalTrust::Verified => {
                info!(
                    device_id = request.device_id.as_str(),
                    session_id = request.body.session_id.as_str(),
                    "Serving a room key request from a verified device"
                );

                match decryptor.share_keys_with_device(&device, &request.body).await {
                    Ok(()) => self.remove_persisted(&request).await?,
                    Err(e) => {
                        // The requester will re-request; don't fail the whole
                        // drain over one undeliverable share.
                        warn!(
                            device_id = request.device_id.as_str(),
                            error = ?e,
                            "Failed to share a room key with a device"
                        );
                    }
                }
            }
            LocalTrust::Blacklisted => {
                self.remove_persisted(&request).await?;
            }
            LocalTrust::Unknown | LocalTrust::Unverified => {
                if self.persist(&request).await? {
                    let _ = self
                        .notifications
                        .send(KeyRequestNotification::Request(request));
                }
            }
        }

        Ok(())
    }

    async fn process_cancellation(
        &self,
        sender: OwnedUserId,
        content: RoomKeyRequestContent,
    ) -> OlmResult<()> {
        let mut requests = self.load().await?;

        let key = format!(
            "{}|{}|{}",
            sender, content.requesting_device_id, content.request_id
        );

        if requests.remove(&key).is_some() {
            self.save(&requests).await?;

            let _ = self.notifications.send(KeyRequestNotification::Cancellation {
                user_id: sender,
                device_id: content.requesting_device_id,
                request_id: content.request_id,
            });
        }

        Ok(())
    }

    /// The requests currently waiting for a user decision.
    pub async fn pending_requests(&self) -> OlmResult<Vec<IncomingRoomKeyRequest>> {
        Ok(self.load().await?.into_values().collect())
    }

    /// Forget a request after a terminal action was taken.
    pub async fn remove_persisted(&self, request: &IncomingRoomKeyRequest) -> OlmResult<()> {
        let mut requests = self.load().await?;

        if requests.remove(&request.storage_key()).is_some() {
            self.save(&requests).await?;
        }

        Ok(())
    }

    /// Persist a request waiting for a decision.
    ///
    /// Returns false if it was already persisted, so listeners aren't
    /// prompted twice.
    async fn persist(&self, request: &IncomingRoomKeyRequest) -> OlmResult<bool> {
        let mut requests = self.load().await?;

        if requests.contains_key(&request.storage_key()) {
            return Ok(false);
        }

        requests.insert(request.storage_key(), request.clone());
        self.save(&requests).await?;

        Ok(true)
    }

    async fn load(&self) -> OlmResult<BTreeMap<String, IncomingRoomKeyRequest>> {
        Ok(self
            .store
            .get_object(STORE_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, requests: &BTreeMap<String, IncomingRoomKeyRequest>) -> OlmResult<()> {
        Ok(self.store.save_object(STORE_KEY, requests).await?)
    }
}
