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

use std::collections::BTreeMap;

use cjson::Error as CjsonError;
use olm_rs::errors::{OlmAccountError, OlmGroupSessionError, OlmSessionError};
use ruma::{DeviceIdBox, EventEncryptionAlgorithm, UserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::{requests::ClientError, store::CryptoStoreError};

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;
pub type VerificationResult<T> = Result<T, SignatureError>;

/// Error representing a failure during a 1-to-1 Olm operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The underlying Olm session operation returned an error.
    #[error("can't finish Olm session operation {0}")]
    OlmSession(#[from] OlmSessionError),

    /// The underlying Olm account operation returned an error.
    #[error("can't finish Olm account operation {0}")]
    OlmAccount(#[from] OlmAccountError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The session with a device has become corrupted.
    #[error(
        "decryption failed likely because an Olm session from {0} with sender key {1} was wedged"
    )]
    SessionWedged(UserId, String),

    /// An Olm message got replayed while the Olm session was wedged.
    #[error("decryption failed because we're missing an Olm session for the sender key")]
    MissingSession,
}

/// Error representing a failure during a Megolm operation, most notably the
/// decryption of a room event.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// No inbound group session was found to decrypt the event.
    #[error("can't find the room key to decrypt the event")]
    UnknownInboundSession,

    /// The room key that should decrypt the event doesn't reach back far
    /// enough in the ratchet to cover the event's message index.
    #[error("the room key doesn't cover the message index of the event")]
    UnknownMessageIndex,

    /// The event could not be authenticated or parsed after decryption.
    #[error("the encrypted message is malformed or its authentication failed")]
    BadEncryptedMessage,

    /// The same message index was already decrypted once inside the same
    /// timeline.
    #[error("a message with the index {0} was already decrypted in this timeline")]
    Replay(u32),

    /// The event uses an encryption algorithm we can't handle.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The decrypted payload couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The underlying group session operation returned an error.
    #[error("can't finish Olm group session operation {0}")]
    OlmGroupSession(#[from] OlmGroupSessionError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),
}

/// Error for events that are malformed or unusable for crypto purposes.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("the event uses an unsupported encryption algorithm")]
    UnsupportedAlgorithm,

    #[error("the Olm message is of an unsupported type")]
    UnsupportedOlmType,

    #[error("the encrypted event doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    #[error("the event is missing the signing key of the sender")]
    MissingSigningKey,

    #[error("the event is missing the sender key of the sender")]
    MissingSenderKey,

    #[error("the event is missing a required field: {0}")]
    MissingField(String),

    #[error(
        "the sender of the plaintext doesn't match the sender of the encrypted event, got \
         {0}, expected {1}"
    )]
    MismatchedSender(String, String),

    #[error(
        "the keys of the plaintext don't match the keys of the device that established the \
         Olm session"
    )]
    MismatchedKeys,

    #[error("the decrypted event isn't a JSON object")]
    NotAnObject,
}

/// Error type describing failures of signature verification over canonical
/// JSON.
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    #[error("the provided JSON object can't be converted to a canonical representation")]
    CanonicalJsonError(#[from] CjsonError),

    #[error("the provided JSON object is missing the signing key")]
    MissingSigningKey,

    #[error("the signature didn't match the provided key")]
    VerificationError,
}

/// Top-level error surfaced to the host application by the coordinator.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// A homeserver request failed, either on the transport or with a
    /// structured Matrix error.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// A 1-to-1 Olm operation failed.
    #[error(transparent)]
    Olm(#[from] OlmError),

    /// A Megolm operation failed.
    #[error(transparent)]
    Megolm(#[from] MegolmError),

    /// A signable object couldn't be canonicalized or verified.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// No usable outbound path exists for the event.
    #[error("unable to encrypt: {0}")]
    UnableToEncrypt(String),

    /// The room uses an algorithm no registered encryptor implements.
    #[error("the encryption algorithm {0} is not supported")]
    UnsupportedAlgorithm(EventEncryptionAlgorithm),

    /// The pre-send gate found devices the user has never seen before.
    #[error("there are unknown devices in the room")]
    UnknownDevices(BTreeMap<UserId, Vec<DeviceIdBox>>),

    /// The key export blob couldn't be decrypted or parsed.
    #[error("the room key export is invalid: {0}")]
    KeyExport(#[from] crate::file_encryption::KeyExportError),

    /// The coordinator was closed and can't serve requests anymore.
    #[error("the coordinator has been closed")]
    Closed,
}
