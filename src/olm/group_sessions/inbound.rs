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
    convert::TryFrom,
    fmt, mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use olm_rs::{
    errors::OlmGroupSessionError, inbound_group_session::OlmInboundGroupSession, PicklingMode,
};
use ruma::{DeviceKeyAlgorithm, EventEncryptionAlgorithm, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use super::{ExportedGroupSessionKey, ExportedRoomKey, GroupSessionKey};
use crate::events::ForwardedRoomKeyContent;

/// Inbound group session.
///
/// Inbound group sessions are used to decrypt the room messages a single
/// peer session encrypted.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<OlmInboundGroupSession>>,
    session_id: Arc<str>,
    first_known_index: u32,
    pub(crate) sender_key: Arc<str>,
    pub(crate) signing_keys: Arc<BTreeMap<DeviceKeyAlgorithm, String>>,
    pub(crate) room_id: Arc<RoomId>,
    forwarding_chains: Arc<Mutex<Option<Vec<String>>>>,
    imported: Arc<bool>,
    backed_up: Arc<AtomicBool>,
}

impl InboundGroupSession {
    /// Create a new inbound group session from a received `m.room_key`
    /// session key.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public curve25519 key of the account that sent
    /// us the session.
    ///
    /// * `signing_key` - The public ed25519 key of the account that sent us
    /// the session.
    ///
    /// * `room_id` - The id of the room the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    /// messages.
    pub fn new(
        sender_key: &str,
        signing_key: &str,
        room_id: &RoomId,
        session_key: GroupSessionKey,
    ) -> Result<Self, OlmGroupSessionError> {
        let session = OlmInboundGroupSession::new(&session_key.0)?;
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        let mut keys: BTreeMap<DeviceKeyAlgorithm, String> = BTreeMap::new();
        keys.insert(DeviceKeyAlgorithm::Ed25519, signing_key.to_owned());

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: sender_key.to_owned().into(),
            first_known_index,
            signing_keys: Arc::new(keys),
            room_id: Arc::new(room_id.clone()),
            forwarding_chains: Arc::new(Mutex::new(None)),
            imported: Arc::new(false),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create an inbound group session from an exported version of the
    /// session.
    ///
    /// Most notably this can be called with an [`ExportedRoomKey`] from a
    /// previous [`export()`](#method.export) call.
    pub fn from_export(
        exported_session: impl Into<ExportedRoomKey>,
    ) -> Result<Self, OlmGroupSessionError> {
        Self::try_from(exported_session.into())
    }

    /// Create a new inbound group session from a forwarded room key content.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public curve25519 key of the account that
    /// forwarded us the session.
    ///
    /// * `content` - The forwarded room key content that contains the
    /// session key.
    pub fn from_forwarded_key(
        sender_key: &str,
        content: &mut ForwardedRoomKeyContent,
    ) -> Result<Self, OlmGroupSessionError> {
        let key = Zeroizing::from(mem::take(&mut content.session_key));

        let session = OlmInboundGroupSession::import(&key)?;
        let first_known_index = session.first_known_index();

        let mut forwarding_chains = content.forwarding_curve25519_key_chain.clone();
        forwarding_chains.push(sender_key.to_owned());

        let mut sender_claimed_keys = BTreeMap::new();
        sender_claimed_keys
            .insert(DeviceKeyAlgorithm::Ed25519, content.sender_claimed_ed25519_key.to_owned());

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: content.session_id.as_str().into(),
            sender_key: content.sender_key.as_str().into(),
            first_known_index,
            signing_keys: Arc::new(sender_claimed_keys),
            room_id: Arc::new(content.room_id.clone()),
            forwarding_chains: Arc::new(Mutex::new(Some(forwarding_chains))),
            imported: Arc::new(true),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the sender key that this session was received from.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// The ed25519 key the session creator claimed to own.
    pub fn claimed_ed25519_key(&self) -> Option<&str> {
        self.signing_keys.get(&DeviceKeyAlgorithm::Ed25519).map(|k| k.as_str())
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Was the session received from a forward or an import rather than
    /// directly from the creating device.
    pub fn imported(&self) -> bool {
        *self.imported
    }

    /// Has the session been uploaded to the key backup.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(Ordering::SeqCst)
    }

    /// Mark the session as having been uploaded to the key backup.
    pub fn mark_as_backed_up(&self) {
        self.backed_up.store(true, Ordering::SeqCst);
    }

    /// The chain of curve25519 keys the session was forwarded through.
    pub async fn forwarding_key_chain(&self) -> Vec<String> {
        self.forwarding_chains.lock().await.as_ref().cloned().unwrap_or_default()
    }

    /// Decrypt the given ciphertext.
    ///
    /// Returns the decrypted plaintext and the message index of the
    /// decrypted message, or an `OlmGroupSessionError` if decryption failed.
    pub async fn decrypt_helper(
        &self,
        ciphertext: String,
    ) -> Result<(String, u32), OlmGroupSessionError> {
        self.inner.lock().await.decrypt(ciphertext)
    }

    /// Export this session at the first known message index.
    ///
    /// If only a limited part of this session should be exported use
    /// [`export_at_index()`](#method.export_at_index).
    pub async fn export(&self) -> ExportedRoomKey {
        self.export_at_index(self.first_known_index()).await
    }

    /// Export this session at the given message index.
    pub async fn export_at_index(
        &self,
        message_index: u32,
    ) -> ExportedRoomKey {
        let message_index = std::cmp::max(self.first_known_index(), message_index);

        let session_key = ExportedGroupSessionKey(
            self.inner
                .lock()
                .await
                .export(message_index)
                .expect("can't export an inbound group session at a known index"),
        );

        ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: (*self.room_id).clone(),
            sender_key: (*self.sender_key).to_owned(),
            session_id: self.session_id().to_owned(),
            forwarding_curve25519_key_chain: self.forwarding_key_chain().await,
            sender_claimed_keys: (*self.signing_keys).clone(),
            session_key,
        }
    }

    /// Store the session as a pickled, serializable form.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            pickle: self.inner.lock().await.pickle(PicklingMode::Unencrypted),
            sender_key: self.sender_key.to_string(),
            signing_keys: (*self.signing_keys).clone(),
            room_id: (*self.room_id).clone(),
            forwarding_chains: self.forwarding_chains.lock().await.clone(),
            imported: *self.imported,
            backed_up: self.backed_up(),
        }
    }

    /// Restore a session from a previously pickled form.
    pub fn from_pickle(
        pickle: PickledInboundGroupSession,
    ) -> Result<Self, OlmGroupSessionError> {
        let session = OlmInboundGroupSession::unpickle(pickle.pickle, PicklingMode::Unencrypted)?;
        let first_known_index = session.first_known_index();
        let session_id = session.session_id();

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key.into(),
            first_known_index,
            signing_keys: Arc::new(pickle.signing_keys),
            room_id: Arc::new(pickle.room_id),
            forwarding_chains: Arc::new(Mutex::new(pickle.forwarding_chains)),
            imported: Arc::new(pickle.imported),
            backed_up: Arc::new(AtomicBool::new(pickle.backed_up)),
        })
    }
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession").field("session_id", &self.session_id()).finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

impl TryFrom<ExportedRoomKey> for InboundGroupSession {
    type Error = OlmGroupSessionError;

    fn try_from(key: ExportedRoomKey) -> Result<Self, Self::Error> {
        let session = OlmInboundGroupSession::import(&key.session_key.0)?;
        let first_known_index = session.first_known_index();

        let forwarding_chains = if key.forwarding_curve25519_key_chain.is_empty() {
            None
        } else {
            Some(key.forwarding_curve25519_key_chain)
        };

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: key.session_id.into(),
            sender_key: key.sender_key.into(),
            first_known_index,
            signing_keys: Arc::new(key.sender_claimed_keys),
            room_id: Arc::new(key.room_id),
            forwarding_chains: Arc::new(Mutex::new(forwarding_chains)),
            imported: Arc::new(true),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// A pickled version of an [`InboundGroupSession`].
///
/// Holds all the information that needs to be stored in a database to
/// restore an inbound group session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickledInboundGroupSession {
    /// The pickle string holding the inbound group session.
    pub pickle: String,
    /// The public curve25519 key of the account that sent us the session.
    pub sender_key: String,
    /// The public keys the creator of the session claimed to own.
    pub signing_keys: BTreeMap<DeviceKeyAlgorithm, String>,
    /// The id of the room the session is used in.
    pub room_id: RoomId,
    /// The list of curve25519 keys that forwarded us this session. Will be
    /// `None` if we directly received the session.
    pub forwarding_chains: Option<Vec<String>>,
    /// Whether the session was directly sent to us by the sender or if it
    /// was imported.
    pub imported: bool,
    /// Whether the session has been uploaded to the key backup.
    #[serde(default)]
    pub backed_up: bool,
}

#[cfg(test)]
mod test {
    use ruma::room_id;

    use super::InboundGroupSession;
    use crate::olm::{EncryptionSettings, OutboundGroupSession};

    async fn session_pair() -> (OutboundGroupSession, InboundGroupSession) {
        let room_id = room_id!("!test:example.org");
        let device_id: ruma::DeviceIdBox = "ALICEDEVICE".into();

        let outbound = OutboundGroupSession::new(
            device_id.into(),
            "alice_curve_key",
            &room_id,
            EncryptionSettings::default(),
        );

        let inbound = InboundGroupSession::new(
            "alice_curve_key",
            "alice_ed25519_key",
            &room_id,
            outbound.session_key().await,
        )
        .unwrap();

        (outbound, inbound)
    }

    #[tokio::test]
    async fn inbound_session_from_outbound_key() {
        let (outbound, inbound) = session_pair().await;

        assert_eq!(outbound.session_id(), inbound.session_id());
        assert_eq!(inbound.first_known_index(), 0);
        assert!(!inbound.imported());
    }

    #[tokio::test]
    async fn export_and_import_roundtrip() {
        let (_, inbound) = session_pair().await;

        let export = inbound.export().await;
        let imported = InboundGroupSession::from_export(export).unwrap();

        assert_eq!(inbound.session_id(), imported.session_id());
        assert_eq!(inbound.first_known_index(), imported.first_known_index());
        assert_eq!(inbound.sender_key(), imported.sender_key());
        assert!(imported.imported());
    }

    #[tokio::test]
    async fn pickle_roundtrip() {
        let (_, inbound) = session_pair().await;
        inbound.mark_as_backed_up();

        let pickle = inbound.pickle().await;
        let restored = InboundGroupSession::from_pickle(pickle).unwrap();

        assert_eq!(inbound.session_id(), restored.session_id());
        assert!(restored.backed_up());
    }
}
