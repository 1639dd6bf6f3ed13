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

use std::{fmt, sync::Arc, time::Instant};

use olm_rs::{
    errors::OlmSessionError,
    session::{OlmMessage, OlmSession, PreKeyMessage},
    PicklingMode,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{deserialize_instant, serialize_instant, Account};
use crate::{
    error::{EventError, OlmResult},
    events::{CiphertextInfo, EncryptedEventContent, OlmV1Content},
    identities::DeviceIdentity,
};

/// Cryptographic session that enables secure communication between two
/// devices.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<Mutex<OlmSession>>,
    pub(crate) session_id: Arc<str>,
    pub(crate) sender_key: Arc<str>,
    pub(crate) creation_time: Arc<Instant>,
    pub(crate) last_use_time: Arc<Instant>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or an `OlmSessionError` if decryption
    /// failed.
    pub async fn decrypt(&mut self, message: OlmMessage) -> Result<String, OlmSessionError> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        self.last_use_time = Arc::new(Instant::now());
        Ok(plaintext)
    }

    /// Encrypt the given plaintext as an OlmMessage.
    pub(crate) async fn encrypt_helper(&mut self, plaintext: &str) -> OlmMessage {
        let message = self.inner.lock().await.encrypt(plaintext);
        self.last_use_time = Arc::new(Instant::now());
        message
    }

    /// Encrypt the given event content as an `m.room.encrypted` to-device
    /// content for the given device.
    ///
    /// The payload binds the ciphertext to the sending and the receiving
    /// device so a ciphertext can't be replayed into another recipient's
    /// session.
    pub async fn encrypt(
        &mut self,
        account: &Account,
        recipient_device: &DeviceIdentity,
        event_type: &str,
        content: Value,
    ) -> OlmResult<EncryptedEventContent> {
        let recipient_signing_key =
            recipient_device.ed25519_key().ok_or(EventError::MissingSigningKey)?;
        let recipient_identity_key =
            recipient_device.curve25519_key().ok_or(EventError::MissingSenderKey)?;

        let payload = json!({
            "sender": account.user_id().as_str(),
            "sender_device": account.device_id().as_str(),
            "keys": {
                "ed25519": account.ed25519_key(),
            },
            "recipient": recipient_device.user_id().as_str(),
            "recipient_keys": {
                "ed25519": recipient_signing_key,
            },
            "type": event_type,
            "content": content,
        });

        let plaintext = cjson::to_string(&payload)
            .map_err(|_| EventError::NotAnObject)?;

        let ciphertext = self.encrypt_helper(&plaintext).await.to_tuple();
        let message_type: usize = ciphertext.0.into();

        let ciphertext =
            CiphertextInfo { body: ciphertext.1, message_type: message_type as u8 };

        let mut content = std::collections::BTreeMap::new();
        content.insert(recipient_identity_key.to_owned(), ciphertext);

        Ok(EncryptedEventContent::OlmV1Curve25519AesSha2(OlmV1Content {
            sender_key: account.curve25519_key().to_owned(),
            ciphertext: content,
        }))
    }

    /// Check if a pre-key Olm message was encrypted for this session.
    ///
    /// Returns true if it matches, false if not and an `OlmSessionError` if
    /// there was an error checking if it matches.
    pub async fn matches(
        &self,
        their_identity_key: &str,
        message: PreKeyMessage,
    ) -> Result<bool, OlmSessionError> {
        self.inner.lock().await.matches_inbound_session_from(their_identity_key, message)
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The curve25519 key of the device this session communicates with.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// Store the session as a pickled, serializable form.
    pub async fn pickle(&self) -> PickledSession {
        PickledSession {
            pickle: self.inner.lock().await.pickle(PicklingMode::Unencrypted),
            sender_key: self.sender_key.to_string(),
            creation_time: *self.creation_time,
            last_use_time: *self.last_use_time,
        }
    }

    /// Restore a session from a previously pickled form.
    pub fn from_pickle(pickle: PickledSession) -> Result<Self, OlmSessionError> {
        let session = OlmSession::unpickle(pickle.pickle, PicklingMode::Unencrypted)?;
        let session_id = session.session_id();

        Ok(Session {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key.into(),
            creation_time: Arc::new(pickle.creation_time),
            last_use_time: Arc::new(pickle.last_use_time),
        })
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a [`Session`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledSession {
    /// The pickle string holding the Olm session.
    pub pickle: String,
    /// The curve25519 key of the peer device.
    pub sender_key: String,
    /// When the session was created.
    #[serde(serialize_with = "serialize_instant", deserialize_with = "deserialize_instant")]
    pub creation_time: Instant,
    /// When the session last encrypted or decrypted a message.
    #[serde(serialize_with = "serialize_instant", deserialize_with = "deserialize_instant")]
    pub last_use_time: Instant,
}
