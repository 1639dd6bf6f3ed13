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

//! The per-algorithm encryption and decryption capability contracts and the
//! registry resolving an algorithm name to an implementation.
//!
//! The set of algorithms is closed: Olm for to-device traffic (driven
//! directly by the coordinator) and Megolm for room messages.

mod megolm;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex as StdMutex, RwLock},
};

use async_trait::async_trait;
use ruma::{EventEncryptionAlgorithm, RoomId, UserId};
use serde_json::Value;

pub(crate) use megolm::{MegolmDecryptor, MegolmEncryptor};

use crate::{
    error::{CoordinatorError, MegolmError, MegolmResult},
    events::{
        DecryptionResult, EncryptedEvent, EncryptedEventContent, ForwardedRoomKeyContent,
        RequestedKeyInfo, RoomKeyContent,
    },
    identities::DeviceIdentity,
    key_request::IncomingRoomKeyRequest,
    olm::EncryptionSettings,
    store::Result as StoreResult,
};

/// Capability contract of a per-room encryptor.
#[async_trait]
pub trait RoomEncryptor: std::fmt::Debug + Send + Sync {
    /// The room this encryptor serves.
    fn room_id(&self) -> &RoomId;

    /// The algorithm this encryptor implements.
    fn algorithm(&self) -> EventEncryptionAlgorithm;

    /// Encrypt the given event content for the room.
    ///
    /// Builds, rotates and distributes the outbound session as needed before
    /// any ciphertext is produced.
    async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
        recipients: &[UserId],
    ) -> Result<EncryptedEventContent, CoordinatorError>;

    /// Force a rotation of the outbound session before its next use.
    fn invalidate_outbound_session(&self);
}

/// Capability contract of a per-room decryptor.
#[async_trait]
pub trait RoomDecryptor: std::fmt::Debug + Send + Sync {
    /// The room this decryptor serves.
    fn room_id(&self) -> &RoomId;

    /// The algorithm this decryptor implements.
    fn algorithm(&self) -> EventEncryptionAlgorithm;

    /// Decrypt a room event.
    ///
    /// The `timeline_id` scopes the replay protection: one message index
    /// may only be decrypted once per timeline.
    async fn decrypt_event(
        &self,
        event: &EncryptedEvent,
        timeline_id: &str,
    ) -> MegolmResult<DecryptionResult>;

    /// Consume an `m.room_key` event addressed to us.
    ///
    /// `sender_claimed_ed25519` is the signing key the Olm envelope claimed
    /// for the sender.
    async fn on_room_key_event(
        &self,
        sender_key: &str,
        sender_claimed_ed25519: &str,
        content: RoomKeyContent,
    ) -> MegolmResult<()>;

    /// Consume an `m.forwarded_room_key` event addressed to us.
    async fn on_forwarded_room_key_event(
        &self,
        sender_key: &str,
        content: ForwardedRoomKeyContent,
    ) -> MegolmResult<()>;

    /// Do we hold keys that can serve the given room key request.
    async fn has_keys_for_request(&self, body: &RequestedKeyInfo) -> StoreResult<bool>;

    /// Forward the keys the given request asks for to the requesting device.
    async fn share_keys_with_device(
        &self,
        request: &IncomingRoomKeyRequest,
        device: DeviceIdentity,
    ) -> Result<(), CoordinatorError>;
}

type EncryptorFactory =
    Arc<dyn Fn(&RoomId, EncryptionSettings) -> Arc<dyn RoomEncryptor> + Send + Sync>;
type DecryptorFactory = Arc<dyn Fn(&RoomId) -> Arc<dyn RoomDecryptor> + Send + Sync>;

/// Registry mapping an algorithm name to the factories producing its
/// encryptor and decryptor.
#[derive(Clone, Default)]
pub(crate) struct AlgorithmRegistry {
    encryptors: BTreeMap<EventEncryptionAlgorithm, EncryptorFactory>,
    decryptors: BTreeMap<EventEncryptionAlgorithm, DecryptorFactory>,
}

impl std::fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("encryptors", &self.encryptors.keys())
            .field("decryptors", &self.decryptors.keys())
            .finish()
    }
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_encryptor(
        &mut self,
        algorithm: EventEncryptionAlgorithm,
        factory: EncryptorFactory,
    ) {
        self.encryptors.insert(algorithm, factory);
    }

    pub fn register_decryptor(
        &mut self,
        algorithm: EventEncryptionAlgorithm,
        factory: DecryptorFactory,
    ) {
        self.decryptors.insert(algorithm, factory);
    }

    /// Is an encryptor implementation registered for the given algorithm.
    pub fn supports_encryption(&self, algorithm: &EventEncryptionAlgorithm) -> bool {
        self.encryptors.contains_key(algorithm)
    }

    pub fn create_encryptor(
        &self,
        algorithm: &EventEncryptionAlgorithm,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Option<Arc<dyn RoomEncryptor>> {
        self.encryptors.get(algorithm).map(|f| f(room_id, settings))
    }

    pub fn create_decryptor(
        &self,
        algorithm: &EventEncryptionAlgorithm,
        room_id: &RoomId,
    ) -> Option<Arc<dyn RoomDecryptor>> {
        self.decryptors.get(algorithm).map(|f| f(room_id))
    }
}

/// The per-timeline replay cache.
///
/// Decrypting the same Megolm message index twice inside one timeline is
/// rejected; the same index may legitimately reappear in a different
/// timeline when the host back-paginates.
#[derive(Debug, Default)]
pub(crate) struct ReplayGuard {
    timelines: StdMutex<HashMap<String, HashMap<(String, String, u32), String>>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the decryption of a message index, failing when the index was
    /// already seen in the given timeline.
    pub fn check_and_record(
        &self,
        timeline_id: &str,
        sender_key: &str,
        session_id: &str,
        message_index: u32,
        event_id: &str,
    ) -> Result<(), MegolmError> {
        if timeline_id.is_empty() {
            return Ok(());
        }

        let mut timelines = self.timelines.lock().expect("the replay cache lock is poisoned");
        let timeline = timelines.entry(timeline_id.to_owned()).or_default();
        let key = (sender_key.to_owned(), session_id.to_owned(), message_index);

        if timeline.contains_key(&key) {
            return Err(MegolmError::Replay(message_index));
        }

        timeline.insert(key, event_id.to_owned());
        Ok(())
    }

    /// Forget everything that was decrypted inside the given timeline.
    pub fn reset_timeline(&self, timeline_id: &str) {
        self.timelines.lock().expect("the replay cache lock is poisoned").remove(timeline_id);
    }
}

/// Listener notified when a new usable inbound session arrives, so queued
/// undecrypted events can be retried.
pub trait NewSessionListener: Send + Sync {
    /// A new inbound session for the given room was received.
    fn on_new_session(&self, room_id: &RoomId, sender_key: &str, session_id: &str);
}

/// Fan-out of [`NewSessionListener`] notifications.
#[derive(Clone, Default)]
pub(crate) struct NewSessionNotifier {
    listeners: Arc<RwLock<Vec<Arc<dyn NewSessionListener>>>>,
}

impl std::fmt::Debug for NewSessionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewSessionNotifier").finish()
    }
}

impl NewSessionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn NewSessionListener>) {
        self.listeners.write().expect("the listener lock is poisoned").push(listener);
    }

    pub fn clear(&self) {
        self.listeners.write().expect("the listener lock is poisoned").clear();
    }

    pub fn notify(&self, room_id: &RoomId, sender_key: &str, session_id: &str) {
        for listener in self.listeners.read().expect("the listener lock is poisoned").iter() {
            listener.on_new_session(room_id, sender_key, session_id);
        }
    }
}

#[cfg(test)]
mod test {
    use matches::assert_matches;

    use super::ReplayGuard;
    use crate::error::MegolmError;

    #[test]
    fn replay_is_per_timeline() {
        let guard = ReplayGuard::new();

        guard.check_and_record("tl1", "sender", "session", 0, "$event1").unwrap();

        assert_matches!(
            guard.check_and_record("tl1", "sender", "session", 0, "$event1"),
            Err(MegolmError::Replay(0))
        );

        // A different timeline legitimately re-exposes the same index.
        guard.check_and_record("tl2", "sender", "session", 0, "$event1").unwrap();

        // Resetting the timeline clears its cache.
        guard.reset_timeline("tl1");
        guard.check_and_record("tl1", "sender", "session", 0, "$event1").unwrap();
    }
}
