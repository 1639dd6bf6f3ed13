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

//! The typed key/value storage interface the coordinator persists its state
//! through, together with an in-memory reference implementation.

mod memorystore;

use std::{collections::HashSet, io::Error as IoError, sync::Arc};

use async_trait::async_trait;
use olm_rs::errors::{OlmAccountError, OlmGroupSessionError, OlmSessionError};
use ruma::{DeviceId, EventEncryptionAlgorithm, RoomId, UserId};
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::sync::Mutex;

pub use memorystore::MemoryStore;

use crate::{
    identities::{DeviceIdentity, UserDevices},
    key_request::{IncomingRoomKeyRequest, OutgoingRoomKeyRequest},
    olm::{Account, InboundGroupSession, Session},
};

/// Error type describing failures of the storage layer.
#[derive(Error, Debug)]
pub enum CryptoStoreError {
    #[error("can't read or write from the store")]
    Io(#[from] IoError),

    #[error("can't finish Olm account operation {0}")]
    OlmAccount(#[from] OlmAccountError),

    #[error("can't finish Olm session operation {0}")]
    OlmSession(#[from] OlmSessionError),

    #[error("can't finish Olm group session operation {0}")]
    OlmGroupSession(#[from] OlmGroupSessionError),

    #[error("error serializing data for the store")]
    Serialization(#[from] SerdeError),

    #[error("sessions or group sessions can't be stored before an account is stored")]
    AccountUnset,
}

pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// Trait abstracting the persistent storage the coordinator needs.
///
/// Every method serializes per key; callers must not assume cross-key
/// atomicity.
#[async_trait]
pub trait CryptoStore: std::fmt::Debug + Send + Sync {
    /// Load the account of our own device, if one was stored before.
    async fn load_account(&self) -> Result<Option<Account>>;

    /// Save the account of our own device.
    async fn save_account(&self, account: Account) -> Result<()>;

    /// Save the given Olm sessions.
    async fn save_sessions(&self, sessions: &[Session]) -> Result<()>;

    /// Get all Olm sessions we share with the device owning the given
    /// curve25519 key.
    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>>;

    /// Save the given inbound group sessions.
    async fn save_inbound_group_sessions(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()>;

    /// Get the inbound group session matching the given room, sender key and
    /// session id.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Get all stored inbound group sessions.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>>;

    /// Save the given device identities.
    async fn save_devices(&self, devices: &[DeviceIdentity]) -> Result<()>;

    /// Delete the given device identity.
    async fn delete_device(&self, device: DeviceIdentity) -> Result<()>;

    /// Get the device identity with the given id, if known.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>>;

    /// Get all known devices of the given user.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices>;

    /// The set of users whose device lists are being tracked.
    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>>;

    /// Add or update a tracked user; `dirty` marks the device list as stale.
    async fn save_tracked_user(&self, user: &UserId, dirty: bool) -> Result<()>;

    /// Stop tracking the given user.
    async fn remove_tracked_user(&self, user: &UserId) -> Result<()>;

    /// The encryption algorithm the given room was bound to, if any.
    async fn get_room_algorithm(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<EventEncryptionAlgorithm>>;

    /// Bind the given room to an encryption algorithm. The binding is
    /// write-once, enforced by the coordinator.
    async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()>;

    /// Should unverified devices be excluded from key distribution in every
    /// room.
    async fn get_global_blacklist_unverified_devices(&self) -> Result<bool>;

    /// Persist the global unverified-device blacklist switch.
    async fn set_global_blacklist_unverified_devices(&self, blacklist: bool) -> Result<()>;

    /// The rooms in which unverified devices are excluded from key
    /// distribution.
    async fn get_room_blacklist_unverified_devices(&self) -> Result<HashSet<RoomId>>;

    /// Add or remove a room from the per-room unverified-device blacklist.
    async fn set_room_blacklist_unverified_devices(
        &self,
        room_id: &RoomId,
        blacklist: bool,
    ) -> Result<()>;

    /// Save an outgoing room key request.
    async fn save_outgoing_key_request(&self, request: OutgoingRoomKeyRequest) -> Result<()>;

    /// Get the outgoing room key request with the given request id.
    async fn get_outgoing_key_request(
        &self,
        request_id: &str,
    ) -> Result<Option<OutgoingRoomKeyRequest>>;

    /// Get the outgoing room key request matching the given body
    /// fingerprint.
    async fn get_outgoing_key_request_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<OutgoingRoomKeyRequest>>;

    /// Get all stored outgoing room key requests.
    async fn get_outgoing_key_requests(&self) -> Result<Vec<OutgoingRoomKeyRequest>>;

    /// Delete the outgoing room key request with the given request id.
    async fn delete_outgoing_key_request(&self, request_id: &str) -> Result<()>;

    /// Persist an incoming room key request until it reaches a terminal
    /// state.
    async fn save_incoming_key_request(&self, request: IncomingRoomKeyRequest) -> Result<()>;

    /// Delete a previously persisted incoming room key request.
    async fn delete_incoming_key_request(&self, request: &IncomingRoomKeyRequest) -> Result<()>;

    /// Get all persisted incoming room key requests.
    async fn get_incoming_key_requests(&self) -> Result<Vec<IncomingRoomKeyRequest>>;
}

/// A user whose device list is tracked, together with the freshness of the
/// tracked list.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedUser {
    /// The id of the tracked user.
    pub user_id: UserId,
    /// Is the locally held device list stale.
    pub dirty: bool,
}
