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
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use olm_rs::{
    account::{IdentityKeys, OlmAccount},
    errors::{OlmAccountError, OlmSessionError},
    session::PreKeyMessage,
    PicklingMode,
};
use ruma::{
    encryption::{DeviceKeys, OneTimeKey, SignedKey},
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, EventEncryptionAlgorithm, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use super::Session;

/// Account holding the long-lived identity keys and the one-time key pool of
/// our own device.
///
/// This is the stateful heart of the Olm primitive; all other sessions are
/// derived from it. The account is cheap to clone, clones share the
/// underlying primitive.
#[derive(Clone)]
pub struct Account {
    pub(crate) user_id: Arc<UserId>,
    pub(crate) device_id: Arc<DeviceId>,
    inner: Arc<Mutex<OlmAccount>>,
    identity_keys: Arc<IdentityKeys>,
    shared: Arc<AtomicBool>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .field("shared", &self.shared())
            .finish()
    }
}

/// The algorithms this device advertises support for.
pub(crate) const SUPPORTED_ALGORITHMS: &[EventEncryptionAlgorithm; 2] = &[
    EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
    EventEncryptionAlgorithm::MegolmV1AesSha2,
];

impl Account {
    /// Create a fresh account with newly generated identity keys.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let account = OlmAccount::new();
        let identity_keys = account.parsed_identity_keys();

        Self {
            user_id: Arc::new(user_id.clone()),
            device_id: device_id.to_owned().into(),
            inner: Arc::new(Mutex::new(account)),
            identity_keys: Arc::new(identity_keys),
            shared: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The user that owns the account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device the account belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of the account.
    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.identity_keys
    }

    /// Our own long-lived curve25519 key.
    pub fn curve25519_key(&self) -> &str {
        self.identity_keys.curve25519()
    }

    /// Our own ed25519 fingerprint key.
    pub fn ed25519_key(&self) -> &str {
        self.identity_keys.ed25519()
    }

    /// Have the device keys of this account been published.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Mark the account as having published its device keys.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    /// The maximum number of one-time keys the account can hold privately.
    pub async fn max_one_time_keys(&self) -> usize {
        self.inner.lock().await.max_number_of_one_time_keys()
    }

    /// Generate `count` new one-time keys.
    ///
    /// Generation is CPU intensive, callers batch it.
    pub async fn generate_one_time_keys(&self, count: usize) {
        self.inner.lock().await.generate_one_time_keys(count)
    }

    /// Mark the currently generated one-time keys as published, the private
    /// halves can no longer be uploaded after this.
    pub async fn mark_keys_as_published(&self) {
        self.inner.lock().await.mark_keys_as_published()
    }

    /// Sign the given string with the account's ed25519 key.
    pub async fn sign(&self, string: &str) -> String {
        self.inner.lock().await.sign(string)
    }

    /// Convert a JSON value to its canonical representation and sign it.
    pub async fn sign_json(&self, json: &Value) -> Result<String, cjson::Error> {
        let canonical_json = cjson::to_string(json)?;
        Ok(self.sign(&canonical_json).await)
    }

    /// Get the signed device keys of the account in their upload form.
    pub async fn device_keys(&self) -> Result<DeviceKeys, cjson::Error> {
        let mut keys = BTreeMap::new();

        keys.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &self.device_id),
            self.identity_keys.curve25519().to_owned(),
        );
        keys.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            self.identity_keys.ed25519().to_owned(),
        );

        let device_keys = json!({
            "user_id": &*self.user_id,
            "device_id": self.device_id.as_str(),
            "algorithms": SUPPORTED_ALGORITHMS,
            "keys": keys,
        });

        let signature = self.sign_json(&device_keys).await?;

        let mut signature_map = BTreeMap::new();
        signature_map.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            signature,
        );

        let mut signatures = BTreeMap::new();
        signatures.insert((*self.user_id).clone(), signature_map);

        Ok(DeviceKeys::new(
            (*self.user_id).clone(),
            self.device_id.as_ref().to_owned(),
            SUPPORTED_ALGORITHMS.to_vec(),
            keys,
            signatures,
        ))
    }

    /// Sign and prepare the currently held unpublished one-time keys for
    /// upload.
    pub async fn signed_one_time_keys(
        &self,
    ) -> Result<BTreeMap<DeviceKeyId, OneTimeKey>, cjson::Error> {
        let account = self.inner.lock().await;
        let one_time_keys = account.parsed_one_time_keys();
        drop(account);

        let mut one_time_key_map = BTreeMap::new();

        for (key_id, key) in one_time_keys.curve25519().iter() {
            let key_json = json!({ "key": key });
            let signature = self.sign_json(&key_json).await?;

            let mut signature_map = BTreeMap::new();
            signature_map.insert(
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                signature,
            );

            let mut signatures = BTreeMap::new();
            signatures.insert((*self.user_id).clone(), signature_map);

            let signed_key = SignedKey::new(key.to_owned(), signatures);

            one_time_key_map.insert(
                DeviceKeyId::from_parts(
                    DeviceKeyAlgorithm::SignedCurve25519,
                    key_id.as_str().into(),
                ),
                OneTimeKey::SignedKey(signed_key),
            );
        }

        Ok(one_time_key_map)
    }

    /// Create an outbound Olm session with a peer device.
    ///
    /// # Arguments
    ///
    /// * `identity_key` - The curve25519 key of the peer device.
    ///
    /// * `one_time_key` - A one-time key claimed for the peer device, with an
    /// already verified signature.
    pub async fn create_outbound_session(
        &self,
        identity_key: &str,
        one_time_key: &SignedKey,
    ) -> Result<Session, OlmSessionError> {
        let session = self
            .inner
            .lock()
            .await
            .create_outbound_session(identity_key, &one_time_key.key)?;

        let now = Instant::now();
        let session_id = session.session_id();

        Ok(Session {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: identity_key.to_owned().into(),
            creation_time: Arc::new(now),
            last_use_time: Arc::new(now),
        })
    }

    /// Create an inbound Olm session from a received pre-key message.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The curve25519 key of the peer device that initiated
    /// the session.
    ///
    /// * `message` - The pre-key message that was sent to us.
    pub async fn create_inbound_session(
        &self,
        sender_key: &str,
        message: PreKeyMessage,
    ) -> Result<Session, OlmSessionError> {
        let session = self
            .inner
            .lock()
            .await
            .create_inbound_session_from(sender_key, message)?;

        let now = Instant::now();
        let session_id = session.session_id();

        Ok(Session {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: sender_key.to_owned().into(),
            creation_time: Arc::new(now),
            last_use_time: Arc::new(now),
        })
    }

    /// Store the account as a pickled, serializable form.
    pub async fn pickle(&self) -> PickledAccount {
        debug!(user_id = %self.user_id, device_id = self.device_id.as_str(), "Pickling account");

        PickledAccount {
            user_id: (*self.user_id).clone(),
            device_id: self.device_id.as_ref().to_owned(),
            pickle: self.inner.lock().await.pickle(PicklingMode::Unencrypted),
            shared: self.shared(),
        }
    }

    /// Restore an account from a previously pickled form.
    pub fn from_pickle(pickle: PickledAccount) -> Result<Self, OlmAccountError> {
        let account = OlmAccount::unpickle(pickle.pickle, PicklingMode::Unencrypted)?;
        let identity_keys = account.parsed_identity_keys();

        Ok(Self {
            user_id: Arc::new(pickle.user_id),
            device_id: pickle.device_id.into(),
            inner: Arc::new(Mutex::new(account)),
            identity_keys: Arc::new(identity_keys),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
        })
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.identity_keys() == other.identity_keys() && self.shared() == other.shared()
    }
}

/// A pickled version of an [`Account`], suitable for the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: UserId,
    /// The device id the account belongs to.
    pub device_id: ruma::DeviceIdBox,
    /// The pickle string holding the Olm account.
    pub pickle: String,
    /// Whether the device keys of the account were already published.
    pub shared: bool,
}

#[cfg(test)]
mod test {
    use ruma::{user_id, DeviceKeyAlgorithm, DeviceKeyId};
    use serde_json::json;

    use super::Account;
    use crate::olm::Utility;

    fn account() -> Account {
        Account::new(&user_id!("@alice:example.org"), "ALICEDEVICE".into())
    }

    #[tokio::test]
    async fn device_keys_are_self_signed() {
        let account = account();
        let device_keys = account.device_keys().await.unwrap();

        let mut json = json!(&device_keys);
        let utility = Utility::new();

        utility
            .verify_json(
                account.user_id(),
                &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, account.device_id()),
                account.ed25519_key(),
                &mut json,
            )
            .expect("the device keys should verify against our own key");

        utility
            .verify_json(
                account.user_id(),
                &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, account.device_id()),
                "fake_key",
                &mut json,
            )
            .expect_err("the device keys shouldn't verify against a bogus key");
    }

    #[tokio::test]
    async fn one_time_keys_are_signed() {
        let account = account();
        account.generate_one_time_keys(3).await;

        let one_time_keys = account.signed_one_time_keys().await.unwrap();
        assert_eq!(one_time_keys.len(), 3);

        let utility = Utility::new();

        for key in one_time_keys.values() {
            let mut json = json!(&key);
            utility
                .verify_json(
                    account.user_id(),
                    &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, account.device_id()),
                    account.ed25519_key(),
                    &mut json,
                )
                .expect("the one-time key should carry a valid signature");
        }

        account.mark_keys_as_published().await;
        assert!(account.signed_one_time_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn account_pickling_roundtrip() {
        let account = account();
        account.mark_as_shared();

        let pickle = account.pickle().await;
        let restored = Account::from_pickle(pickle).unwrap();

        assert_eq!(account.identity_keys(), restored.identity_keys());
        assert!(restored.shared());
    }
}
