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

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use ruma::{encryption::OneTimeKey, DeviceIdBox, DeviceKeyAlgorithm, UserId};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    error::{CoordinatorError, OlmError},
    identities::DeviceIdentity,
    olm::{Account, Session},
    requests::{HomeserverClient, KeysClaimRequest},
    store::{CryptoStore, Result as StoreResult},
};

const KEY_CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

/// Establishes and uses 1-to-1 Olm sessions with peer devices.
///
/// Session establishment claims a signed one-time key per missing peer and
/// verifies its signature before a session is created; a failed verification
/// skips that single device.
#[derive(Clone, Debug)]
pub(crate) struct SessionManager {
    account: Account,
    store: Arc<dyn CryptoStore>,
    client: Arc<dyn HomeserverClient>,
    /// Serializes session establishment; overlapping claims for the same
    /// peer would needlessly burn one-time keys.
    claim_guard: Arc<Mutex<()>>,
}

impl SessionManager {
    pub fn new(
        account: Account,
        store: Arc<dyn CryptoStore>,
        client: Arc<dyn HomeserverClient>,
    ) -> Self {
        Self { account, store, client, claim_guard: Arc::new(Mutex::new(())) }
    }

    /// Get the Olm session to use for the peer owning the given curve25519
    /// key, if one exists.
    pub async fn get_session(&self, identity_key: &str) -> StoreResult<Option<Session>> {
        let sessions = self.store.get_sessions(identity_key).await?;

        if let Some(sessions) = sessions {
            Ok(sessions.lock().await.first().cloned())
        } else {
            Ok(None)
        }
    }

    /// Make sure we share an Olm session with each of the given devices.
    ///
    /// Our own device and blocked devices are filtered out; devices whose
    /// claimed one-time key fails signature verification are skipped without
    /// affecting the rest of the batch.
    ///
    /// Returns the map of session ids now usable for the given devices.
    pub async fn ensure_sessions_for_devices(
        &self,
        devices: &[DeviceIdentity],
    ) -> Result<BTreeMap<UserId, BTreeMap<DeviceIdBox, String>>, CoordinatorError> {
        let _guard = self.claim_guard.lock().await;

        let mut sessions: BTreeMap<UserId, BTreeMap<DeviceIdBox, String>> = BTreeMap::new();
        let mut missing: BTreeMap<UserId, BTreeMap<DeviceIdBox, DeviceKeyAlgorithm>> =
            BTreeMap::new();

        for device in devices {
            if device.is_blocked() {
                continue;
            }

            let identity_key = match device.curve25519_key() {
                Some(k) => k,
                None => {
                    warn!(
                        user_id = device.user_id().as_str(),
                        device_id = device.device_id().as_str(),
                        "The device doesn't have a curve25519 key, can't \
                         establish an Olm session"
                    );
                    continue;
                }
            };

            if identity_key == self.account.curve25519_key() {
                continue;
            }

            if let Some(session) = self.get_session(identity_key).await? {
                sessions
                    .entry(device.user_id().clone())
                    .or_default()
                    .insert(device.device_id().to_owned(), session.session_id().to_owned());
            } else {
                missing
                    .entry(device.user_id().clone())
                    .or_default()
                    .insert(device.device_id().to_owned(), DeviceKeyAlgorithm::SignedCurve25519);
            }
        }

        if missing.is_empty() {
            return Ok(sessions);
        }

        let request =
            KeysClaimRequest { one_time_keys: missing, timeout: Some(KEY_CLAIM_TIMEOUT) };
        let response = self.client.claim_one_time_keys(request).await?;

        if !response.failures.is_empty() {
            warn!(failures = ?response.failures, "Failed to claim one-time keys from some servers");
        }

        for (user_id, user_devices) in &response.one_time_keys {
            for (device_id, key_map) in user_devices {
                let device = match self.store.get_device(user_id, device_id).await? {
                    Some(d) => d,
                    None => {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            "Tried to create an Olm session, but the device \
                             is unknown"
                        );
                        continue;
                    }
                };

                let one_time_key = match key_map.values().next() {
                    Some(OneTimeKey::SignedKey(k)) => k,
                    Some(_) => {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            "Tried to create an Olm session, but the claimed \
                             key isn't a signed curve25519 key"
                        );
                        continue;
                    }
                    None => {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            "Tried to create an Olm session, but the signed \
                             one-time key is missing"
                        );
                        continue;
                    }
                };

                if device.verify_one_time_key(one_time_key).is_err() {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        "Failed to verify the signature of a claimed one-time \
                         key"
                    );
                    continue;
                }

                let identity_key = match device.curve25519_key() {
                    Some(k) => k.clone(),
                    None => continue,
                };

                info!(
                    user_id = user_id.as_str(),
                    device_id = device_id.as_str(),
                    "Creating an outbound Olm session"
                );

                let session =
                    match self.account.create_outbound_session(&identity_key, one_time_key).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(
                                user_id = user_id.as_str(),
                                device_id = device_id.as_str(),
                                error = ?e,
                                "Error creating a new Olm session"
                            );
                            continue;
                        }
                    };

                let session_id = session.session_id().to_owned();
                self.store.save_sessions(&[session]).await?;

                sessions
                    .entry(user_id.clone())
                    .or_default()
                    .insert(device_id.clone(), session_id);
            }
        }

        Ok(sessions)
    }

    /// Olm-encrypt the given content for each of the given devices.
    ///
    /// Devices we don't share an Olm session with are skipped; no ciphertext
    /// is ever produced for them.
    pub async fn encrypt_for_devices(
        &self,
        devices: Vec<DeviceIdentity>,
        event_type: &str,
        content: &Value,
    ) -> Result<Vec<(DeviceIdentity, Value)>, CoordinatorError> {
        let mut messages = Vec::new();

        for device in devices {
            let identity_key = match device.curve25519_key() {
                Some(k) => k.clone(),
                None => continue,
            };

            let mut session = match self.get_session(&identity_key).await? {
                Some(s) => s,
                None => {
                    warn!(
                        user_id = device.user_id().as_str(),
                        device_id = device.device_id().as_str(),
                        "Trying to encrypt for a device, but no Olm session \
                         is found"
                    );
                    continue;
                }
            };

            let encrypted = session
                .encrypt(&self.account, &device, event_type, content.clone())
                .await
                .map_err(CoordinatorError::Olm)?;

            self.store.save_sessions(&[session]).await?;

            let encrypted = serde_json::to_value(&encrypted)
                .map_err(OlmError::JsonError)
                .map_err(CoordinatorError::Olm)?;

            messages.push((device, encrypted));
        }

        Ok(messages)
    }

    /// The account this manager establishes sessions for.
    pub fn account(&self) -> &Account {
        &self.account
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use ruma::user_id;

    use super::SessionManager;
    use crate::{
        identities::DeviceIdentity,
        olm::Account,
        store::{CryptoStore, MemoryStore},
        testing::{claim_response_for_accounts, MockClient},
    };

    async fn manager() -> (SessionManager, Arc<MemoryStore>, Arc<MockClient>, Account) {
        let account = Account::new(&user_id!("@alice:example.org"), "ALICEDEVICE".into());
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockClient::new());

        let manager = SessionManager::new(account.clone(), store.clone(), client.clone());

        (manager, store, client, account)
    }

    #[tokio::test]
    async fn session_creation() {
        let (manager, store, client, _) = manager().await;

        let bob = Account::new(&user_id!("@bob:example.org"), "BOBDEVICE".into());
        let bob_device = DeviceIdentity::from_account(&bob).await;

        store.save_devices(&[bob_device.clone()]).await.unwrap();
        client.add_keys_claim_response(claim_response_for_accounts(&[&bob]).await);

        let sessions = manager.ensure_sessions_for_devices(&[bob_device.clone()]).await.unwrap();

        assert_eq!(client.keys_claim_requests().len(), 1);
        assert!(sessions.get(bob.user_id()).unwrap().contains_key(bob.device_id()));
        assert!(manager
            .get_session(bob.curve25519_key())
            .await
            .unwrap()
            .is_some());

        // A second call finds the existing session without a new claim.
        let sessions = manager.ensure_sessions_for_devices(&[bob_device]).await.unwrap();
        assert_eq!(client.keys_claim_requests().len(), 1);
        assert!(sessions.get(bob.user_id()).unwrap().contains_key(bob.device_id()));
    }

    #[tokio::test]
    async fn bad_one_time_key_signature_skips_only_that_device() {
        let (manager, store, client, _) = manager().await;

        let bob = Account::new(&user_id!("@bob:example.org"), "BOBDEVICE".into());
        let carl = Account::new(&user_id!("@carl:example.org"), "CARLDEVICE".into());

        let bob_device = DeviceIdentity::from_account(&bob).await;
        let carl_device = DeviceIdentity::from_account(&carl).await;

        store.save_devices(&[bob_device.clone(), carl_device.clone()]).await.unwrap();

        let mut response = claim_response_for_accounts(&[&bob, &carl]).await;

        // Corrupt bob's signature by handing out a key signed by carl.
        let carl_keys = response.one_time_keys.get(carl.user_id()).unwrap().clone();
        response
            .one_time_keys
            .get_mut(bob.user_id())
            .unwrap()
            .insert(bob.device_id().to_owned(), carl_keys.values().next().unwrap().clone());

        client.add_keys_claim_response(response);

        let sessions = manager
            .ensure_sessions_for_devices(&[bob_device, carl_device])
            .await
            .unwrap();

        assert!(sessions.get(bob.user_id()).is_none());
        assert!(sessions.get(carl.user_id()).unwrap().contains_key(carl.device_id()));
    }

    #[tokio::test]
    async fn blocked_and_own_devices_are_filtered() {
        let (manager, store, client, account) = manager().await;

        let own_device = DeviceIdentity::from_account(&account).await;

        let bob = Account::new(&user_id!("@bob:example.org"), "BOBDEVICE".into());
        let bob_device = DeviceIdentity::from_account(&bob).await;
        bob_device.set_verification_state(crate::identities::VerificationState::Blocked);

        store.save_devices(&[own_device.clone(), bob_device.clone()]).await.unwrap();

        let sessions = manager
            .ensure_sessions_for_devices(&[own_device, bob_device])
            .await
            .unwrap();

        assert!(sessions.is_empty());
        assert!(client.keys_claim_requests().is_empty());
    }
}
