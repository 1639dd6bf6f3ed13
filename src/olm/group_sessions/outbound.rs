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
    cmp::max,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use olm_rs::{
    errors::OlmGroupSessionError, outbound_group_session::OlmOutboundGroupSession, PicklingMode,
};
use ruma::{DeviceId, DeviceIdBox, EventEncryptionAlgorithm, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::super::{deserialize_instant, serialize_instant};
use super::GroupSessionKey;
use crate::events::MegolmV1Content;

const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
const ROTATION_MESSAGES: u64 = 100;

/// Has the session been shared with a specific device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShareState {
    /// The session was never shared with the device.
    NotShared,
    /// The session was shared with the device at the contained message
    /// index.
    Shared(u32),
    /// The session was shared with the device, but the device has since
    /// presented a different curve25519 identity key.
    SharedButChangedIdentityKey,
}

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
        }
    }
}

impl EncryptionSettings {
    /// Create new encryption settings from the fields of a room's
    /// `m.room.encryption` state event content.
    pub fn new(
        algorithm: EventEncryptionAlgorithm,
        rotation_period_ms: Option<u64>,
        rotation_period_msgs: Option<u64>,
    ) -> Self {
        let rotation_period =
            rotation_period_ms.map_or(ROTATION_PERIOD, Duration::from_millis);
        let rotation_period_msgs = rotation_period_msgs.unwrap_or(ROTATION_MESSAGES);

        Self { algorithm, rotation_period, rotation_period_msgs }
    }
}

/// The record of a single device an outbound session was shared with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SharedWith {
    /// The curve25519 key the device presented when the session was shared.
    pub identity_key: String,
    /// The ratchet index the device received the session at.
    pub message_index: u32,
}

/// Outbound group session.
///
/// Outbound group sessions are used to encrypt room messages; the session
/// key is distributed to recipient devices over Olm so they can build the
/// matching inbound session.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<OlmOutboundGroupSession>>,
    device_id: Arc<DeviceId>,
    sender_key: Arc<str>,
    session_id: Arc<str>,
    room_id: Arc<RoomId>,
    pub(crate) creation_time: Arc<Instant>,
    message_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    shared_with_set: Arc<DashMap<UserId, DashMap<DeviceIdBox, SharedWith>>>,
}

impl OutboundGroupSession {
    /// Create a new outbound group session for the given room.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The id of the device that creates the session, our
    /// own device id.
    ///
    /// * `sender_key` - The curve25519 key of the device that creates the
    /// session, our own identity key.
    ///
    /// * `room_id` - The id of the room the session is used in.
    ///
    /// * `settings` - Settings determining the algorithm and rotation period
    /// of the session.
    pub fn new(
        device_id: Arc<DeviceId>,
        sender_key: &str,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Self {
        let session = OlmOutboundGroupSession::new();
        let session_id = session.session_id();

        OutboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            device_id,
            sender_key: sender_key.into(),
            session_id: session_id.into(),
            room_id: Arc::new(room_id.clone()),
            creation_time: Arc::new(Instant::now()),
            message_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with_set: Arc::new(DashMap::new()),
        }
    }

    /// Encrypt the given plaintext using this session.
    ///
    /// Returns the encrypted ciphertext.
    pub(crate) async fn encrypt_helper(&self, plaintext: String) -> String {
        let session = self.inner.lock().await;
        self.message_count.fetch_add(1, Ordering::SeqCst);
        session.encrypt(&plaintext)
    }

    /// Encrypt a room event for the room this session belongs to.
    ///
    /// Beware that the session needs to be shared before this method is
    /// called, callers check with [`expired`](#method.expired) and
    /// [`shared`](#method.shared) whether a new session needs to be created
    /// and distributed first.
    pub async fn encrypt(&self, event_type: &str, content: Value) -> MegolmV1Content {
        let json_content = json!({
            "content": content,
            "room_id": &*self.room_id,
            "type": event_type,
        });

        let plaintext = json_content.to_string();
        let ciphertext = self.encrypt_helper(plaintext).await;

        MegolmV1Content {
            ciphertext,
            sender_key: self.sender_key.to_string(),
            session_id: self.session_id().to_owned(),
            device_id: self.device_id.as_ref().to_owned(),
        }
    }

    /// Check if the session has expired and if it should be rotated.
    ///
    /// A session will expire after some time or if enough messages have been
    /// encrypted using it.
    pub fn expired(&self) -> bool {
        let count = self.message_count.load(Ordering::SeqCst);

        count >= self.settings.rotation_period_msgs
            || self.creation_time.elapsed()
                // Since the room setting is user controlled a really low
                // rotation period could be set, clamp it to an hour.
                >= max(self.settings.rotation_period, Duration::from_secs(3600))
    }

    /// Mark the session as invalid, forcing a rotation before the next use.
    ///
    /// This should be called when a room member leaves the group or when a
    /// previously shared device presents a new identity key.
    pub fn invalidate_session(&self) {
        self.invalidated.store(true, Ordering::Relaxed)
    }

    /// Has the session been invalidated.
    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }

    /// Get the encryption settings of this session.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// Mark the session as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::Relaxed);
    }

    /// Check if the session has been marked as shared.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Get the session key of this session.
    ///
    /// A session key can be used to create an `InboundGroupSession`.
    pub async fn session_key(&self) -> GroupSessionKey {
        let session = self.inner.lock().await;
        GroupSessionKey(session.session_key())
    }

    /// Get the room id of the room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the current message index for this session.
    ///
    /// Each message is sent with an increasing index. This returns the
    /// message index that will be used for the next encrypted message.
    pub async fn message_index(&self) -> u32 {
        let session = self.inner.lock().await;
        session.session_message_index()
    }

    /// Get the content of the `m.room_key` event that distributes this
    /// session.
    pub async fn as_key_content(&self) -> Value {
        json!({
            "algorithm": EventEncryptionAlgorithm::MegolmV1AesSha2,
            "room_id": &*self.room_id,
            "session_id": &*self.session_id,
            "session_key": self.session_key().await,
            "chain_index": self.message_index().await,
        })
    }

    /// Has the session been shared with the given device.
    pub fn is_shared_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        identity_key: &str,
    ) -> ShareState {
        self.shared_with_set
            .get(user_id)
            .and_then(|d| {
                d.get(device_id).map(|s| {
                    if s.identity_key == identity_key {
                        ShareState::Shared(s.message_index)
                    } else {
                        ShareState::SharedButChangedIdentityKey
                    }
                })
            })
            .unwrap_or(ShareState::NotShared)
    }

    /// Mark that the session was shared with the given device at the given
    /// message index.
    pub fn mark_shared_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        identity_key: &str,
        message_index: u32,
    ) {
        self.shared_with_set.entry(user_id.to_owned()).or_insert_with(DashMap::new).insert(
            device_id.to_owned(),
            SharedWith { identity_key: identity_key.to_owned(), message_index },
        );
    }

    /// The set of users the session has been shared with.
    pub fn shared_with_users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.shared_with_set.iter().map(|e| e.key().clone())
    }

    /// Restore a session from a previously pickled form.
    pub fn from_pickle(
        device_id: Arc<DeviceId>,
        sender_key: &str,
        pickle: PickledOutboundGroupSession,
    ) -> Result<Self, OlmGroupSessionError> {
        let inner = OlmOutboundGroupSession::unpickle(pickle.pickle, PicklingMode::Unencrypted)?;
        let session_id = inner.session_id();

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            device_id,
            sender_key: sender_key.into(),
            session_id: session_id.into(),
            room_id: Arc::new(pickle.room_id),
            creation_time: Arc::new(pickle.creation_time),
            message_count: Arc::new(AtomicU64::new(pickle.message_count)),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            invalidated: Arc::new(AtomicBool::new(pickle.invalidated)),
            settings: Arc::new(pickle.settings),
            shared_with_set: Arc::new(
                pickle
                    .shared_with_set
                    .into_iter()
                    .map(|(k, v)| (k, v.into_iter().collect()))
                    .collect(),
            ),
        })
    }

    /// Store the session as a pickled, serializable form.
    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        PickledOutboundGroupSession {
            pickle: self.inner.lock().await.pickle(PicklingMode::Unencrypted),
            room_id: (*self.room_id).clone(),
            settings: (*self.settings).clone(),
            creation_time: *self.creation_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            shared: self.shared(),
            invalidated: self.invalidated(),
            shared_with_set: self
                .shared_with_set
                .iter()
                .map(|u| {
                    (
                        u.key().clone(),
                        u.value().iter().map(|d| (d.key().clone(), d.value().clone())).collect(),
                    )
                })
                .collect(),
        }
    }
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

/// A pickled version of an [`OutboundGroupSession`].
///
/// Holds all the information that needs to be stored in a database to
/// restore the session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PickledOutboundGroupSession {
    /// The pickle string holding the group session.
    pub pickle: String,
    /// The settings this session adheres to.
    pub settings: EncryptionSettings,
    /// The room id this session is used for.
    pub room_id: RoomId,
    /// The timestamp when this session was created.
    #[serde(serialize_with = "serialize_instant", deserialize_with = "deserialize_instant")]
    pub creation_time: Instant,
    /// The number of messages this session has already encrypted.
    pub message_count: u64,
    /// Is the session shared.
    pub shared: bool,
    /// Has the session been invalidated.
    pub invalidated: bool,
    /// The devices the session has been shared with.
    pub shared_with_set: BTreeMap<UserId, BTreeMap<DeviceIdBox, SharedWith>>,
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use ruma::{room_id, user_id, EventEncryptionAlgorithm};

    use super::{EncryptionSettings, OutboundGroupSession, ShareState, ROTATION_MESSAGES, ROTATION_PERIOD};

    #[test]
    fn encryption_settings_conversion() {
        let settings =
            EncryptionSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2, None, None);

        assert_eq!(settings.rotation_period, ROTATION_PERIOD);
        assert_eq!(settings.rotation_period_msgs, ROTATION_MESSAGES);

        let settings = EncryptionSettings::new(
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            Some(3600),
            Some(500),
        );

        assert_eq!(settings.rotation_period, Duration::from_millis(3600));
        assert_eq!(settings.rotation_period_msgs, 500);
    }

    #[tokio::test]
    async fn session_expiry_by_message_count() {
        let settings = EncryptionSettings {
            rotation_period_msgs: 1,
            ..EncryptionSettings::default()
        };

        let device_id: ruma::DeviceIdBox = "ALICEDEVICE".into();
        let session = OutboundGroupSession::new(
            device_id.into(),
            "alice_curve_key",
            &room_id!("!test:example.org"),
            settings,
        );

        assert!(!session.expired());
        session.encrypt("m.room.message", serde_json::json!({ "body": "hello" })).await;
        assert!(session.expired());
    }

    #[tokio::test]
    async fn share_state_tracking() {
        let device_id: ruma::DeviceIdBox = "ALICEDEVICE".into();
        let session = OutboundGroupSession::new(
            device_id.into(),
            "alice_curve_key",
            &room_id!("!test:example.org"),
            EncryptionSettings::default(),
        );

        let bob = user_id!("@bob:example.org");

        assert_eq!(
            session.is_shared_with(&bob, "BOBDEVICE".into(), "bob_curve_key"),
            ShareState::NotShared
        );

        session.mark_shared_with(&bob, "BOBDEVICE".into(), "bob_curve_key", 0);

        assert_eq!(
            session.is_shared_with(&bob, "BOBDEVICE".into(), "bob_curve_key"),
            ShareState::Shared(0)
        );
        assert_eq!(
            session.is_shared_with(&bob, "BOBDEVICE".into(), "rotated_curve_key"),
            ShareState::SharedButChangedIdentityKey
        );
    }
}
