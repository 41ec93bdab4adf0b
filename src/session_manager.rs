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

use ruma::{OwnedDeviceId, OwnedUserId};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{OlmError, OlmResult},
    identities::DeviceIdentity,
    olm::{Account, Session},
    requests::{HomeserverClient, KeysClaimRequest},
    store::Store,
    types::EncryptedEventContent,
};

/// The result of an Olm session probe for a single device.
#[derive(Debug, Clone)]
pub struct OlmSessionResult {
    /// The device the session talks to.
    pub device: DeviceIdentity,
    /// The id of the established session, `None` if none could be created.
    pub session_id: Option<String>,
}

/// Establishes and looks up 1-to-1 Olm sessions with other devices.
///
/// Claiming a one-time key, verifying its signature and building the outbound
/// session happens here; the per-room encryptors and the gossip module only
/// consume the resulting sessions.
#[derive(Clone, Debug)]
pub(crate) struct SessionManager {
    account: Account,
    store: Store,
    transport: Arc<dyn HomeserverClient>,
}

impl SessionManager {
    pub fn new(account: Account, store: Store, transport: Arc<dyn HomeserverClient>) -> Self {
        Self {
            account,
            store,
            transport,
        }
    }

    /// Make sure we share an Olm session with each of the given devices.
    ///
    /// Devices that are blacklisted, are missing an identity key, or share
    /// our own identity key are skipped. For the remaining devices an
    /// existing session is looked up; a single keys claim request covers
    /// everything that is missing.
    ///
    /// A failed one-time key signature check skips that device only, the
    /// rest of the batch proceeds.
    ///
    /// Note: two overlapping calls for the same device may claim two one-time
    /// keys and build two sessions. The second session simply goes unused;
    /// serializing callers per peer isn't worth the complexity.
    pub async fn ensure_sessions(
        &self,
        devices_by_user: &BTreeMap<OwnedUserId, Vec<DeviceIdentity>>,
    ) -> OlmResult<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, OlmSessionResult>>> {
        let mut results: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, OlmSessionResult>> =
            BTreeMap::new();
        let mut missing: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>> = BTreeMap::new();
        let mut missing_devices: BTreeMap<(OwnedUserId, OwnedDeviceId), DeviceIdentity> =
            BTreeMap::new();

        for (user_id, devices) in devices_by_user {
            for device in devices {
                let identity_key = match device.curve25519_key() {
                    Some(k) => k.clone(),
                    None => continue,
                };

                if identity_key == self.account.curve25519_key() || device.is_blacklisted() {
                    continue;
                }

                let session_id = self.session_id_for_key(&identity_key).await?;

                if session_id.is_none() {
                    missing
                        .entry(user_id.clone())
                        .or_insert_with(BTreeMap::new)
                        .insert(device.device_id().to_owned(), "signed_curve25519".to_owned());
                    missing_devices.insert(
                        (user_id.clone(), device.device_id().to_owned()),
                        device.clone(),
                    );
                }

                results
                    .entry(user_id.clone())
                    .or_insert_with(BTreeMap::new)
                    .insert(
                        device.device_id().to_owned(),
                        OlmSessionResult {
                            device: device.clone(),
                            session_id,
                        },
                    );
            }
        }

        if missing.is_empty() {
            return Ok(results);
        }

        debug!(devices = ?missing, "Claiming one-time keys for devices without a session");

        let response = self
            .transport
            .claim_one_time_keys(KeysClaimRequest {
                one_time_keys: missing,
            })
            .await?;

        let mut new_sessions = Vec::new();

        for (user_id, device_keys) in &response.one_time_keys {
            for (device_id, key_map) in device_keys {
                let device =
                    match missing_devices.get(&(user_id.clone(), device_id.clone())) {
                        Some(d) => d,
                        None => {
                            warn!(
                                user_id = user_id.as_str(),
                                device_id = device_id.as_str(),
                                "Claim response contains a device we didn't ask for"
                            );
                            continue;
                        }
                    };

                let session = match self.account.create_outbound_session(device, key_map).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            error = ?e,
                            "Couldn't create an Olm session from a claimed key"
                        );
                        continue;
                    }
                };

                info!(
                    user_id = user_id.as_str(),
                    device_id = device_id.as_str(),
                    session_id = session.session_id(),
                    "Established a new Olm session"
                );

                if let Some(result) = results
                    .get_mut(user_id)
                    .and_then(|m| m.get_mut(device_id))
                {
                    result.session_id = Some(session.session_id().to_owned());
                }

                new_sessions.push(session);
            }
        }

        self.store.save_sessions(&new_sessions).await?;

        Ok(results)
    }

    /// The id of an existing session with the device owning the given
    /// curve25519 key.
    async fn session_id_for_key(&self, identity_key: &str) -> OlmResult<Option<String>> {
        let sessions = self.store.get_sessions(identity_key).await?;

        if let Some(sessions) = sessions {
            let sessions = sessions.lock().await;
            Ok(sessions.first().map(|s| s.session_id().to_owned()))
        } else {
            Ok(None)
        }
    }

    /// Encrypt a to-device payload for the given device with its active Olm
    /// session.
    ///
    /// Fails with `OlmError::MissingSession` if we don't share a session with
    /// the device.
    pub async fn encrypt_to_device(
        &self,
        device: &DeviceIdentity,
        event_type: &str,
        content: Value,
    ) -> OlmResult<EncryptedEventContent> {
        let session = self.session_for_device(device).await?;

        let mut session = match session {
            Some(s) => s,
            None => return Err(OlmError::MissingSession),
        };

        let encrypted = session.encrypt(device, event_type, content).await?;

        self.store.save_sessions(&[session]).await?;

        Ok(encrypted)
    }

    /// The active session with the given device, if any.
    pub async fn session_for_device(
        &self,
        device: &DeviceIdentity,
    ) -> OlmResult<Option<Session>> {
        let identity_key = match device.curve25519_key() {
            Some(k) => k,
            None => return Err(crate::error::EventError::MissingSenderKey.into()),
        };

        let sessions = self.store.get_sessions(identity_key).await?;

        if let Some(sessions) = sessions {
            let sessions = sessions.lock().await;
            Ok(sessions.first().cloned())
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex as StdMutex},
    };

    use ruma::{user_id, OwnedUserId};

    use super::SessionManager;
    use crate::{
        error::TransportError,
        identities::DeviceIdentity,
        olm::Account,
        requests::{
            HomeserverClient, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
            KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, ToDeviceRequest,
        },
        store::{MemoryStore, Store},
    };

    /// Serves one-time keys of a single peer account.
    #[derive(Debug)]
    struct OneTimeKeyServer {
        account: Account,
        claims: StdMutex<usize>,
    }

    #[async_trait::async_trait]
    impl HomeserverClient for OneTimeKeyServer {
        async fn upload_keys(
            &self,
            _: KeysUploadRequest,
        ) -> Result<KeysUploadResponse, TransportError> {
            Ok(KeysUploadResponse::default())
        }

        async fn claim_one_time_keys(
            &self,
            request: KeysClaimRequest,
        ) -> Result<KeysClaimResponse, TransportError> {
            *self.claims.lock().unwrap() += 1;

            self.account.generate_one_time_keys(1).await;
            let one_time_keys = self.account.signed_one_time_keys().await;
            self.account.mark_keys_as_published().await;

            let (key_id, key) = one_time_keys.into_iter().next().unwrap();

            let mut response = KeysClaimResponse::default();

            for (user, devices) in request.one_time_keys {
                for (device, _) in devices {
                    let mut keys = BTreeMap::new();
                    keys.insert(key_id.clone(), key.clone());
                    response
                        .one_time_keys
                        .entry(user.clone())
                        .or_default()
                        .insert(device, keys);
                }
            }

            Ok(response)
        }

        async fn query_keys(
            &self,
            _: KeysQueryRequest,
        ) -> Result<KeysQueryResponse, TransportError> {
            Ok(KeysQueryResponse::default())
        }

        async fn send_to_device(&self, _: &ToDeviceRequest) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn bob_id() -> OwnedUserId {
        user_id!("@bob:localhost").to_owned()
    }

    #[tokio::test]
    async fn sessions_are_established_and_reused() {
        let alice = Account::new(user_id!("@alice:localhost"), "ALICEDEVICE".into());
        let bob = Account::new(&bob_id(), "BOBDEVICE".into());

        let bob_device = DeviceIdentity::try_from(&bob.device_keys().await).unwrap();

        let transport = Arc::new(OneTimeKeyServer {
            account: bob,
            claims: StdMutex::new(0),
        });

        let store = Store::new(Arc::new(MemoryStore::new()));
        let manager = SessionManager::new(alice, store, transport.clone());

        let mut devices = BTreeMap::new();
        devices.insert(bob_id(), vec![bob_device.clone()]);

        let result = manager.ensure_sessions(&devices).await.unwrap();
        let session_id = result[&bob_id()][bob_device.device_id()]
            .session_id
            .clone()
            .unwrap();

        assert_eq!(*transport.claims.lock().unwrap(), 1);

        // A second call finds the existing session, no further claim is made.
        let result = manager.ensure_sessions(&devices).await.unwrap();
        assert_eq!(
            result[&bob_id()][bob_device.device_id()]
                .session_id
                .as_deref(),
            Some(session_id.as_str())
        );
        assert_eq!(*transport.claims.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn bad_signature_skips_the_device_only() {
        let alice = Account::new(user_id!("@alice:localhost"), "ALICEDEVICE".into());
        let bob = Account::new(&bob_id(), "BOBDEVICE".into());
        let eve = Account::new(user_id!("@eve:localhost"), "EVEDEVICE".into());

        let bob_device = DeviceIdentity::try_from(&bob.device_keys().await).unwrap();

        // Eve serves the claim: her one-time keys aren't signed by Bob's
        // fingerprint, so the signature check must fail.
        let transport = Arc::new(OneTimeKeyServer {
            account: eve,
            claims: StdMutex::new(0),
        });

        let store = Store::new(Arc::new(MemoryStore::new()));
        let manager = SessionManager::new(alice, store, transport);

        let mut devices = BTreeMap::new();
        devices.insert(bob_id(), vec![bob_device.clone()]);

        let result = manager.ensure_sessions(&devices).await.unwrap();

        assert!(result[&bob_id()][bob_device.device_id()]
            .session_id
            .is_none());
    }
}
