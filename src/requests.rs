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

//! Request and response types for the homeserver REST surface the
//! coordinator drives, together with the [`HomeserverClient`] trait the host
//! application implements on top of its HTTP stack.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use ruma::{
    encryption::{DeviceKeys, OneTimeKey},
    DeviceIdBox, DeviceKeyAlgorithm, DeviceKeyId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Error returned by a [`HomeserverClient`] implementation.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The homeserver couldn't be reached at all.
    #[error("the homeserver couldn't be reached: {0}")]
    Transport(String),

    /// The homeserver answered with a structured Matrix error.
    #[error("the homeserver returned {status} {errcode}: {error}")]
    Protocol {
        /// The HTTP status code of the response.
        status: u16,
        /// The Matrix error code, e.g. `M_FORBIDDEN`.
        errcode: String,
        /// The human readable error message.
        error: String,
    },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Request to publish device keys and/or one-time keys.
///
/// An empty request is valid and is used to learn the current one-time key
/// counts from the response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// The signed identity keys of our own device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Freshly generated, signed one-time keys, keyed by
    /// `signed_curve25519:<key_id>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_keys: Option<BTreeMap<DeviceKeyId, OneTimeKey>>,
}

impl KeysUploadRequest {
    pub fn new(
        device_keys: Option<DeviceKeys>,
        one_time_keys: Option<BTreeMap<DeviceKeyId, OneTimeKey>>,
    ) -> Self {
        Self { device_keys, one_time_keys }
    }
}

/// Response to a [`KeysUploadRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// The number of unclaimed one-time keys the server currently holds for
    /// us, per key algorithm.
    pub one_time_key_counts: BTreeMap<DeviceKeyAlgorithm, u64>,
}

impl KeysUploadResponse {
    /// The number of unclaimed signed curve25519 one-time keys.
    pub fn signed_curve25519_count(&self) -> Option<u64> {
        self.one_time_key_counts.get(&DeviceKeyAlgorithm::SignedCurve25519).copied()
    }
}

/// Request to claim one-time keys so Olm sessions can be established.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The keys to claim, `user_id -> device_id -> key algorithm`.
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceIdBox, DeviceKeyAlgorithm>>,
    /// How long the server should wait for keys from remote servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

/// Response to a [`KeysClaimRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed keys, `user_id -> device_id -> key id -> key`.
    pub one_time_keys:
        BTreeMap<UserId, BTreeMap<DeviceIdBox, BTreeMap<DeviceKeyId, OneTimeKey>>>,
    /// Servers that couldn't be reached, with the reason.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Request to query the device lists of a set of users.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users whose device lists should be downloaded. An empty device id
    /// list requests all devices of the user.
    pub device_keys: BTreeMap<UserId, Vec<DeviceIdBox>>,
    /// The sync token the device list is known to be current at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl KeysQueryRequest {
    pub(crate) fn new(users: impl IntoIterator<Item = UserId>, token: Option<String>) -> Self {
        let device_keys = users.into_iter().map(|u| (u, Vec::new())).collect();
        Self { device_keys, token }
    }
}

/// Response to a [`KeysQueryRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The requested device keys, `user_id -> device_id -> signed device
    /// info`.
    pub device_keys: BTreeMap<UserId, BTreeMap<DeviceIdBox, DeviceKeys>>,
    /// Servers that couldn't be reached, with the reason.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Request to send unicast to-device events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// The type of the event being sent, e.g. `m.room.encrypted`.
    pub event_type: String,
    /// The transaction id making the request idempotent on the server.
    pub txn_id: Uuid,
    /// The event contents, `user_id -> device_id -> content`.
    pub messages: BTreeMap<UserId, BTreeMap<DeviceIdBox, Value>>,
}

impl ToDeviceRequest {
    pub(crate) fn new(event_type: &str) -> Self {
        Self { event_type: event_type.to_owned(), txn_id: Uuid::new_v4(), messages: BTreeMap::new() }
    }

    /// The number of unique (user, device) pairs addressed by this request.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|m| m.len()).sum()
    }
}

/// Abstraction over the homeserver endpoints the coordinator needs.
///
/// The host application implements this on top of its HTTP client; the
/// coordinator never performs any I/O of its own.
#[async_trait]
pub trait HomeserverClient: std::fmt::Debug + Send + Sync {
    /// Publish device keys and/or one-time keys.
    async fn upload_keys(&self, request: KeysUploadRequest) -> ClientResult<KeysUploadResponse>;

    /// Claim one-time keys for Olm session establishment.
    async fn claim_one_time_keys(
        &self,
        request: KeysClaimRequest,
    ) -> ClientResult<KeysClaimResponse>;

    /// Download the device lists of the given users.
    async fn query_keys(&self, request: KeysQueryRequest) -> ClientResult<KeysQueryResponse>;

    /// Send unicast to-device events.
    async fn send_to_device(&self, request: ToDeviceRequest) -> ClientResult<()>;
}

/// Observer for the device's network connectivity.
///
/// When one is attached, [`start`](crate::CryptoCoordinator::start) defers
/// its startup sequence until the observer reports a connected state.
pub trait ConnectivityObserver: std::fmt::Debug + Send + Sync {
    /// Is the network currently reachable.
    fn is_connected(&self) -> bool;
}
