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
    collections::{BTreeMap, HashMap},
    convert::TryFrom,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use atomic::Atomic;
use ruma::{
    encryption::{DeviceKeys, SignedKey},
    DeviceId, DeviceIdBox, DeviceKeyAlgorithm, DeviceKeyId, EventEncryptionAlgorithm, UserId,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

use crate::{
    error::{SignatureError, VerificationResult},
    olm::{Account, Utility},
};

/// The verification state the user assigned to a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationState {
    /// The device was never seen nor judged by the user.
    Unknown = 0,
    /// The device has been seen but not verified.
    Unverified = 1,
    /// The device has been verified by the user.
    Verified = 2,
    /// The device has been blocked, no key material may ever be shared with
    /// it.
    Blocked = 3,
}

fn verification_state_serializer<S>(
    x: &Atomic<VerificationState>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let value = x.load(Ordering::SeqCst);
    s.serialize_some(&value)
}

fn verification_state_deserializer<'de, D>(
    deserializer: D,
) -> Result<Arc<Atomic<VerificationState>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = VerificationState::deserialize(deserializer)?;
    Ok(Arc::new(Atomic::new(value)))
}

fn atomic_bool_serializer<S>(x: &AtomicBool, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_some(&x.load(Ordering::SeqCst))
}

fn atomic_bool_deserializer<'de, D>(deserializer: D) -> Result<Arc<AtomicBool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = bool::deserialize(deserializer)?;
    Ok(Arc::new(AtomicBool::new(value)))
}

/// The identity of a single E2EE capable device of a user.
///
/// The long-lived identity keys are immutable once recorded for a
/// `(user_id, device_id)` pair; the verification state is the only part of
/// the identity the user can mutate.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    user_id: Arc<UserId>,
    device_id: Arc<DeviceId>,
    algorithms: Arc<[EventEncryptionAlgorithm]>,
    keys: Arc<BTreeMap<DeviceKeyId, String>>,
    pub(crate) signatures: Arc<BTreeMap<UserId, BTreeMap<DeviceKeyId, String>>>,
    display_name: Arc<Option<String>>,
    #[serde(
        serialize_with = "atomic_bool_serializer",
        deserialize_with = "atomic_bool_deserializer"
    )]
    deleted: Arc<AtomicBool>,
    #[serde(
        serialize_with = "verification_state_serializer",
        deserialize_with = "verification_state_deserializer"
    )]
    verification_state: Arc<Atomic<VerificationState>>,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .field("display_name", self.display_name())
            .field("keys", self.keys())
            .field("deleted", &self.deleted())
            .field("verification_state", &self.verification_state())
            .finish()
    }
}

impl DeviceIdentity {
    /// Create a new device identity.
    pub fn new(
        user_id: UserId,
        device_id: DeviceIdBox,
        display_name: Option<String>,
        verification_state: VerificationState,
        algorithms: Vec<EventEncryptionAlgorithm>,
        keys: BTreeMap<DeviceKeyId, String>,
        signatures: BTreeMap<UserId, BTreeMap<DeviceKeyId, String>>,
    ) -> Self {
        Self {
            user_id: Arc::new(user_id),
            device_id: device_id.into(),
            display_name: Arc::new(display_name),
            verification_state: Arc::new(Atomic::new(verification_state)),
            signatures: Arc::new(signatures),
            algorithms: algorithms.into(),
            keys: Arc::new(keys),
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create the identity describing our own device.
    pub(crate) async fn from_account(account: &Account) -> DeviceIdentity {
        let device_keys =
            account.device_keys().await.expect("own device keys are canonicalizable");
        let mut device = DeviceIdentity::try_from(&device_keys)
            .expect("own device keys carry a valid signature");

        device.verification_state = Arc::new(Atomic::new(VerificationState::Verified));
        device
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the human readable name of the device.
    pub fn display_name(&self) -> &Option<String> {
        &self.display_name
    }

    /// Get the key of the given key algorithm belonging to this device.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&String> {
        self.keys.get(&DeviceKeyId::from_parts(algorithm, &self.device_id))
    }

    /// The long-lived curve25519 key naming the device's Olm endpoint.
    pub fn curve25519_key(&self) -> Option<&String> {
        self.get_key(DeviceKeyAlgorithm::Curve25519)
    }

    /// The long-lived ed25519 fingerprint key of the device.
    pub fn ed25519_key(&self) -> Option<&String> {
        self.get_key(DeviceKeyAlgorithm::Ed25519)
    }

    /// Get a map containing all the device keys.
    pub fn keys(&self) -> &BTreeMap<DeviceKeyId, String> {
        &self.keys
    }

    /// Get the list of algorithms this device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.algorithms
    }

    /// Does this device support any of our 1-to-1 E2EE algorithms.
    pub fn supports_olm(&self) -> bool {
        self.algorithms.contains(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
    }

    /// Get the verification state of the device.
    pub fn verification_state(&self) -> VerificationState {
        self.verification_state.load(Ordering::Relaxed)
    }

    /// Has the user verified this device.
    pub fn is_verified(&self) -> bool {
        self.verification_state() == VerificationState::Verified
    }

    /// Has the user blocked this device.
    ///
    /// Blocked devices won't receive any group sessions.
    pub fn is_blocked(&self) -> bool {
        self.verification_state() == VerificationState::Blocked
    }

    /// Has the user never seen this device.
    pub fn is_unknown(&self) -> bool {
        self.verification_state() == VerificationState::Unknown
    }

    /// Set the verification state of the device.
    ///
    /// Note: this only updates the in-memory identity, callers persist the
    /// device through the store.
    pub(crate) fn set_verification_state(&self, state: VerificationState) {
        self.verification_state.store(state, Ordering::Relaxed)
    }

    /// Is the device deleted.
    pub fn deleted(&self) -> bool {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Mark the device as deleted.
    pub(crate) fn mark_as_deleted(&self) {
        self.deleted.store(true, Ordering::Relaxed);
    }

    /// Update the mutable parts of the identity from a new device keys
    /// struct.
    ///
    /// The signature of the new struct is verified first; the identity keys
    /// themselves are pinned by the caller.
    pub(crate) fn update_device(&mut self, device_keys: &DeviceKeys) -> VerificationResult<()> {
        self.verify_device_keys(device_keys)?;

        self.algorithms = device_keys.algorithms.as_slice().into();
        self.keys = Arc::new(device_keys.keys.clone());
        self.signatures = Arc::new(device_keys.signatures.clone());
        self.display_name = Arc::new(device_keys.unsigned.device_display_name.clone());

        Ok(())
    }

    fn is_signed_by_device(&self, json: &mut serde_json::Value) -> VerificationResult<()> {
        let signing_key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        let utility = Utility::new();

        utility.verify_json(
            &self.user_id,
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, self.device_id()),
            signing_key,
            json,
        )
    }

    /// Check that the given device keys struct is self-signed by this
    /// device.
    pub(crate) fn verify_device_keys(
        &self,
        device_keys: &DeviceKeys,
    ) -> VerificationResult<()> {
        self.is_signed_by_device(&mut json!(device_keys))
    }

    /// Check that the given claimed one-time key is signed by this device.
    pub(crate) fn verify_one_time_key(&self, one_time_key: &SignedKey) -> VerificationResult<()> {
        self.is_signed_by_device(&mut json!(one_time_key))
    }
}

impl TryFrom<&DeviceKeys> for DeviceIdentity {
    type Error = SignatureError;

    fn try_from(device_keys: &DeviceKeys) -> Result<Self, Self::Error> {
        let device = Self {
            user_id: Arc::new(device_keys.user_id.clone()),
            device_id: device_keys.device_id.clone().into(),
            algorithms: device_keys.algorithms.as_slice().into(),
            signatures: Arc::new(device_keys.signatures.clone()),
            keys: Arc::new(device_keys.keys.clone()),
            display_name: Arc::new(device_keys.unsigned.device_display_name.clone()),
            deleted: Arc::new(AtomicBool::new(false)),
            verification_state: Arc::new(Atomic::new(VerificationState::Unknown)),
        };

        device.verify_device_keys(device_keys)?;
        Ok(device)
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id() && self.device_id() == other.device_id()
    }
}

/// A view over all known devices of a user.
#[derive(Clone, Debug, Default)]
pub struct UserDevices {
    pub(crate) inner: HashMap<DeviceIdBox, DeviceIdentity>,
}

impl UserDevices {
    /// Get the device with the given device id.
    pub fn get(&self, device_id: &DeviceId) -> Option<&DeviceIdentity> {
        self.inner.get(device_id)
    }

    /// Iterator over the device ids of the user devices.
    pub fn keys(&self) -> impl Iterator<Item = &DeviceIdBox> {
        self.inner.keys()
    }

    /// Iterator over the devices of the user.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.inner.values()
    }

    /// The number of known devices of the user.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Does the user have no known devices.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::convert::TryFrom;

    use ruma::{user_id, DeviceKeyAlgorithm};
    use serde_json::json;

    use super::{DeviceIdentity, VerificationState};

    fn device_keys() -> ruma::encryption::DeviceKeys {
        let device_keys = json!({
          "algorithms": vec![
              "m.olm.v1.curve25519-aes-sha2",
              "m.megolm.v1.aes-sha2"
          ],
          "device_id": "BNYQQWUMXO",
          "user_id": "@example:localhost",
          "keys": {
              "curve25519:BNYQQWUMXO": "xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc",
              "ed25519:BNYQQWUMXO": "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4"
          },
          "signatures": {
              "@example:localhost": {
                  "ed25519:BNYQQWUMXO": "kTwMrbsLJJM/uFGOj/oqlCaRuw7i9p/6eGrTlXjo8UJMCFAetoyWzoMcF35vSe4S6FTx8RJmqX6rM7ep53MHDQ"
              }
          },
          "unsigned": {
              "device_display_name": "Alice's mobile phone"
          }
        });

        serde_json::from_value(device_keys).unwrap()
    }

    pub(crate) fn get_device() -> DeviceIdentity {
        DeviceIdentity::try_from(&device_keys()).unwrap()
    }

    #[test]
    fn create_a_device() {
        let user_id = user_id!("@example:localhost");
        let device_id = "BNYQQWUMXO";

        let device = get_device();

        assert_eq!(&user_id, device.user_id());
        assert_eq!(device_id, device.device_id());
        assert_eq!(device.algorithms().len(), 2);
        assert_eq!(VerificationState::Unknown, device.verification_state());
        assert!(device.is_unknown());
        assert_eq!("Alice's mobile phone", device.display_name().as_ref().unwrap());
        assert_eq!(
            device.get_key(DeviceKeyAlgorithm::Curve25519).unwrap(),
            "xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc"
        );
        assert_eq!(
            device.get_key(DeviceKeyAlgorithm::Ed25519).unwrap(),
            "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4"
        );
    }

    #[test]
    fn update_a_device() {
        let mut device = get_device();

        assert_eq!("Alice's mobile phone", device.display_name().as_ref().unwrap());

        let display_name = "Alice's work computer".to_owned();

        let mut device_keys = device_keys();
        device_keys.unsigned.device_display_name = Some(display_name.clone());
        device.update_device(&device_keys).unwrap();

        assert_eq!(&display_name, device.display_name().as_ref().unwrap());
    }

    #[test]
    fn delete_a_device() {
        let device = get_device();
        assert!(!device.deleted());

        let device_clone = device.clone();

        device.mark_as_deleted();
        assert!(device.deleted());
        assert!(device_clone.deleted());
    }
}
