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

mod inbound;
mod outbound;

use std::collections::BTreeMap;

use ruma::{DeviceKeyAlgorithm, EventEncryptionAlgorithm, RoomId};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};
pub use outbound::{
    EncryptionSettings, OutboundGroupSession, PickledOutboundGroupSession, ShareState, SharedWith,
};

/// The private session key of a group session, in the format an `m.room_key`
/// event carries it.
#[derive(Clone, Debug, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct GroupSessionKey(pub String);

/// The private session key of a group session, exported at a ratchet index.
#[derive(Clone, Debug, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct ExportedGroupSessionKey(pub String);

/// An exported inbound group session.
///
/// This is the entry format of the room key export file and the payload of
/// an `m.forwarded_room_key` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// The encryption algorithm the session is used with.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: RoomId,

    /// The curve25519 key of the device that created the session.
    pub sender_key: String,

    /// The unique id of the session.
    pub session_id: String,

    /// The session key, exported at the first known ratchet index.
    pub session_key: ExportedGroupSessionKey,

    /// The public keys the creator of the session claimed to own.
    pub sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,

    /// The chain of curve25519 keys the session was forwarded through,
    /// empty if we received the session directly.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}
