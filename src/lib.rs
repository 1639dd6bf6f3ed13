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

//! End-to-end encryption coordinator for Matrix clients.
//!
//! This crate orchestrates everything a Matrix client needs to take part in
//! end-to-end encrypted rooms: the device identity and its one-time key
//! pool, Olm session establishment with peer devices, per-room Megolm
//! encryption and decryption, room key distribution and the room key
//! request protocol.
//!
//! The crate performs no I/O of its own. The host hands it three
//! collaborators: a [`CryptoStore`](store::CryptoStore) persisting the key
//! material, a [`HomeserverClient`](requests::HomeserverClient) speaking the
//! relevant REST endpoints and the sync stream driving
//! [`CryptoCoordinator::on_sync_completed`].

#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

mod algorithms;
mod error;
mod events;
mod file_encryption;
mod identities;
mod key_request;
mod machine;
mod olm;
mod requests;
mod session_manager;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use algorithms::{NewSessionListener, RoomDecryptor, RoomEncryptor};
pub use error::{
    CoordinatorError, EventError, MegolmError, MegolmResult, OlmError, OlmResult, SignatureError,
};
pub use events::{
    AnyToDeviceEvent, CiphertextInfo, DecryptionResult, DeviceLists, EncryptedEvent,
    EncryptedEventContent, ForwardedRoomKeyContent, KeyRequestAction, MegolmV1Content,
    MembershipState, OlmV1Content, RequestedKeyInfo, RoomKeyContent, RoomKeyRequestContent,
    RoomSnapshot, SyncChanges, ToDeviceEvent,
};
pub use file_encryption::{
    decrypt_key_export, encrypt_key_export, KeyExportError, DEFAULT_PBKDF_ITERATIONS,
};
pub use identities::{DeviceIdentity, UserDevices, VerificationState};
pub use key_request::{
    IncomingRequestCancellation, IncomingRoomKeyRequest, OutgoingRequestState,
    OutgoingRoomKeyRequest,
};
pub use machine::{
    CoordinatorConfig, CryptoCoordinator, KeyBackupDelegate, RoomKeyImportResult,
    RoomKeyRequestListener, VerificationDelegate,
};
pub use olm::{
    Account, EncryptionSettings, ExportedGroupSessionKey, ExportedRoomKey, GroupSessionKey,
    InboundGroupSession, OutboundGroupSession, PickledAccount, PickledInboundGroupSession,
    PickledOutboundGroupSession, PickledSession, Session, ShareState, SharedWith, Utility,
};
pub use requests::{
    ClientError, ClientResult, ConnectivityObserver, HomeserverClient, KeysClaimRequest,
    KeysClaimResponse, KeysQueryRequest, KeysQueryResponse, KeysUploadRequest,
    KeysUploadResponse, ToDeviceRequest,
};
