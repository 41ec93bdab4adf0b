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
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::OlmResult,
    requests::{DeviceIdOrAllDevices, HomeserverClient, ToDeviceRequest},
    store::Store,
    types::{KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent},
};

/// The lifecycle state of an outgoing room key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingRequestState {
    /// Created but not yet sent to the homeserver.
    Unsent,
    /// Sent; we're waiting for a device to answer with a forwarded key.
    Sent,
    /// The user asked to withdraw the request, the cancellation still has to
    /// go out.
    CancellationPending,
    /// The cancellation was sent; kept only transiently.
    Cancelled,
}

/// A room key request we sent (or are about to send) to our other devices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingRoomKeyRequest {
    /// The unique id the request is known under; reused for the
    /// cancellation.
    pub request_id: String,
    /// The session the request asks for.
    pub body: RequestedKeyInfo,
    /// The devices the request is addressed to.
    pub recipients: Vec<(OwnedUserId, DeviceIdOrAllDevices)>,
    /// The current lifecycle state.
    pub state: OutgoingRequestState,
}

/// Manages the reliable lifecycle of outgoing room key requests.
///
/// Requests are idempotent by the fingerprint of their body: asking twice for
/// the same session reuses the pending request. Unsent requests and pending
/// cancellations are retried on every drain, which the coordinator triggers
/// after each sync.
#[derive(Debug)]
pub(crate) struct OutgoingRequestManager {
    device_id: Arc<OwnedDeviceId>,
    store: Store,
    transport: Arc<dyn HomeserverClient>,
    /// Sending is held back until the coordinator finished its startup.
    started: AtomicBool,
    /// Serializes read-modify-write cycles on the persisted request map.
    guard: Mutex<()>,
}

const STORE_KEY: &str = "outgoing_key_requests";

impl OutgoingRequestManager {
    pub fn new(
        device_id: Arc<OwnedDeviceId>,
        store: Store,
        transport: Arc<dyn HomeserverClient>,
    ) -> Self {
        Self {
            device_id,
            store,
            transport,
            started: AtomicBool::new(false),
            guard: Mutex::new(()),
        }
    }

    /// Allow requests to be sent out and drain whatever queued up before
    /// startup.
    pub async fn start(&self) -> OlmResult<()> {
        self.started.store(true, Ordering::SeqCst);
        self.drain().await
    }

    /// Queue a new key request.
    ///
    /// If an active request for the same body already exists this does
    /// nothing.
    pub async fn request_key(
        &self,
        body: RequestedKeyInfo,
        recipients: Vec<(OwnedUserId, DeviceIdOrAllDevices)>,
    ) -> OlmResult<()> {
        {
            let _guard = self.guard.lock().await;
            let mut requests = self.load().await?;

            if requests.values().any(|r| {
                r.body == body
                    && matches!(
                        r.state,
                        OutgoingRequestState::Unsent | OutgoingRequestState::Sent
                    )
            }) {
                debug!(body = ?body, "A key request for the session is already active");
                return Ok(());
            }

            let request = OutgoingRoomKeyRequest {
                request_id: Uuid::new_v4().to_string(),
                body,
                recipients,
                state: OutgoingRequestState::Unsent,
            };

            info!(request_id = request.request_id.as_str(), "Queued a room key request");

            requests.insert(request.request_id.clone(), request);
            self.save(&requests).await?;
        }

        if self.started.load(Ordering::SeqCst) {
            self.drain().await?;
        }

        Ok(())
    }

    /// Withdraw the active request for the given body, if any.
    pub async fn cancel_request(&self, body: &RequestedKeyInfo) -> OlmResult<()> {
        {
            let _guard = self.guard.lock().await;
            let mut requests = self.load().await?;

            let matching: Vec<String> = requests
                .values()
                .filter(|r| &r.body == body)
                .map(|r| r.request_id.clone())
                .collect();

            for request_id in matching {
                let request = requests.get_mut(&request_id).expect("id was just collected");

                match request.state {
                    // Never went out, nobody needs a cancellation.
                    OutgoingRequestState::Unsent => {
                        requests.remove(&request_id);
                    }
                    OutgoingRequestState::Sent => {
                        request.state = OutgoingRequestState::CancellationPending;
                    }
                    OutgoingRequestState::CancellationPending
                    | OutgoingRequestState::Cancelled => {}
                }
            }

            self.save(&requests).await?;
        }

        if self.started.load(Ordering::SeqCst) {
            self.drain().await?;
        }

        Ok(())
    }

    /// Cancel the active request for the body and immediately queue a fresh
    /// one.
    ///
    /// Used to re-request the key of an event that still fails to decrypt.
    pub async fn resend_request(
        &self,
        body: RequestedKeyInfo,
        recipients: Vec<(OwnedUserId, DeviceIdOrAllDevices)>,
    ) -> OlmResult<()> {
        self.cancel_request(&body).await?;
        self.request_key(body, recipients).await
    }

    /// Send every unsent request and every pending cancellation.
    ///
    /// Transport failures leave the state untouched; the next drain retries.
    pub async fn drain(&self) -> OlmResult<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self.guard.lock().await;
        let mut requests = self.load().await?;
        let mut dirty = false;

        let ids: Vec<String> = requests.keys().cloned().collect();

        for request_id in ids {
            let request = requests.get(&request_id).expect("id was just collected");

            match request.state {
                OutgoingRequestState::Unsent => {
                    let content = RoomKeyRequestContent {
                        action: KeyRequestAction::Request,
                        requesting_device_id: (*self.device_id).clone(),
                        request_id: request.request_id.clone(),
                        body: Some(request.body.clone()),
                    };

                    match self.send(&request.recipients, &content).await {
                        Ok(()) => {
                            requests.get_mut(&request_id).expect("request exists").state =
                                OutgoingRequestState::Sent;
                            dirty = true;
                        }
                        Err(e) => {
                            warn!(
                                request_id = request_id.as_str(),
                                error = ?e,
                                "Failed to send a room key request, will retry"
                            );
                        }
                    }
                }
                OutgoingRequestState::CancellationPending => {
                    let content = RoomKeyRequestContent {
                        action: KeyRequestAction::RequestCancellation,
                        requesting_device_id: (*self.device_id).clone(),
                        request_id: request.request_id.clone(),
                        body: None,
                    };

                    match self.send(&request.recipients, &content).await {
                        Ok(()) => {
                            requests.remove(&request_id);
                            dirty = true;
                        }
                        Err(e) => {
                            warn!(
                                request_id = request_id.as_str(),
                                error = ?e,
                                "Failed to send a room key request cancellation, will retry"
                            );
                        }
                    }
                }
                OutgoingRequestState::Sent | OutgoingRequestState::Cancelled => {}
            }
        }

        if dirty {
            self.save(&requests).await?;
        }

        Ok(())
    }

    /// Is there an active request matching the given body.
    pub async fn has_active_request(&self, body: &RequestedKeyInfo) -> OlmResult<bool> {
        let requests = self.load().await?;

        Ok(requests.values().any(|r| {
            &r.body == body
                && matches!(
                    r.state,
                    OutgoingRequestState::Unsent | OutgoingRequestState::Sent
                )
        }))
    }

    async fn send(
        &self,
        recipients: &[(OwnedUserId, DeviceIdOrAllDevices)],
        content: &RoomKeyRequestContent,
    ) -> OlmResult<()> {
        let mut messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, serde_json::Value>> =
            BTreeMap::new();

        for (user_id, device) in recipients {
            messages
                .entry(user_id.clone())
                .or_insert_with(BTreeMap::new)
                .insert(device.clone(), serde_json::to_value(content)?);
        }

        let request = ToDeviceRequest {
            event_type: "m.room_key_request".to_owned(),
            txn_id: Uuid::new_v4(),
            messages,
        };

        self.transport.send_to_device(&request).await?;

        Ok(())
    }

    async fn load(&self) -> OlmResult<BTreeMap<String, OutgoingRoomKeyRequest>> {
        Ok(self
            .store
            .get_object(STORE_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, requests: &BTreeMap<String, OutgoingRoomKeyRequest>) -> OlmResult<()> {
        Ok(self.store.save_object(STORE_KEY, requests).await?)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex as StdMutex};

    use ruma::{room_id, user_id, EventEncryptionAlgorithm};

    use super::{OutgoingRequestManager, OutgoingRequestState};
    use crate::{
        error::TransportError,
        requests::{
            DeviceIdOrAllDevices, HomeserverClient, KeysClaimRequest, KeysClaimResponse,
            KeysQueryRequest, KeysQueryResponse, KeysUploadRequest, KeysUploadResponse,
            ToDeviceRequest,
        },
        store::{MemoryStore, Store},
        types::{KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent},
    };

    #[derive(Debug, Default)]
    struct RecordingServer {
        sent: StdMutex<Vec<RoomKeyRequestContent>>,
    }

    #[async_trait::async_trait]
    impl HomeserverClient for RecordingServer {
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
            Ok(KeysQueryResponse::default())
        }

        async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError> {
            for devices in request.messages.values() {
                for content in devices.values() {
                    let content: RoomKeyRequestContent =
                        serde_json::from_value(content.clone()).unwrap();
                    self.sent.lock().unwrap().push(content);
                }
            }

            Ok(())
        }
    }

    fn body() -> RequestedKeyInfo {
        RequestedKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id!("!test:localhost").to_owned(),
            sender_key: "sender_key".to_owned(),
            session_id: "session_id".to_owned(),
        }
    }

    fn recipients() -> Vec<(ruma::OwnedUserId, DeviceIdOrAllDevices)> {
        vec![(
            user_id!("@alice:localhost").to_owned(),
            DeviceIdOrAllDevices::AllDevices,
        )]
    }

    fn manager() -> (OutgoingRequestManager, Arc<RecordingServer>) {
        let transport = Arc::new(RecordingServer::default());
        let manager = OutgoingRequestManager::new(
            Arc::new("ALICEDEVICE".into()),
            Store::new(Arc::new(MemoryStore::new())),
            transport.clone(),
        );

        (manager, transport)
    }

    #[tokio::test]
    async fn requests_are_deduplicated_by_body() {
        let (manager, transport) = manager();
        manager.start().await.unwrap();

        manager.request_key(body(), recipients()).await.unwrap();
        manager.request_key(body(), recipients()).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, KeyRequestAction::Request);
    }

    #[tokio::test]
    async fn nothing_is_sent_before_start() {
        let (manager, transport) = manager();

        manager.request_key(body(), recipients()).await.unwrap();
        assert!(transport.sent.lock().unwrap().is_empty());

        manager.start().await.unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_then_request_equals_fresh_request() {
        let (manager, transport) = manager();
        manager.start().await.unwrap();

        manager.request_key(body(), recipients()).await.unwrap();
        manager.cancel_request(&body()).await.unwrap();
        manager.request_key(body(), recipients()).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        let actions: Vec<_> = sent.iter().map(|c| c.action.clone()).collect();

        assert_eq!(
            actions,
            vec![
                KeyRequestAction::Request,
                KeyRequestAction::RequestCancellation,
                KeyRequestAction::Request,
            ]
        );

        // The new request got a fresh id.
        assert_ne!(sent[0].request_id, sent[2].request_id);
        assert_eq!(sent[0].request_id, sent[1].request_id);
    }

    #[tokio::test]
    async fn unsent_cancellation_sends_nothing() {
        let (manager, transport) = manager();

        manager.request_key(body(), recipients()).await.unwrap();
        manager.cancel_request(&body()).await.unwrap();
        manager.start().await.unwrap();

        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(!manager.has_active_request(&body()).await.unwrap());
    }

    #[tokio::test]
    async fn states_progress_through_the_lifecycle() {
        let (manager, _transport) = manager();

        manager.request_key(body(), recipients()).await.unwrap();

        let requests = manager.load().await.unwrap();
        assert_eq!(
            requests.values().next().unwrap().state,
            OutgoingRequestState::Unsent
        );

        manager.start().await.unwrap();

        let requests = manager.load().await.unwrap();
        assert_eq!(
            requests.values().next().unwrap().state,
            OutgoingRequestState::Sent
        );
    }
}
