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

//! Typed contents for the events the coordinator consumes and produces:
//! the key-distribution to-device events and the two encrypted event
//! flavours.

use std::collections::BTreeMap;

use ruma::{DeviceIdBox, EventEncryptionAlgorithm, EventId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unicast device-addressed event as delivered by the sync response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent<C> {
    /// The user that sent the event.
    pub sender: UserId,
    /// The typed content of the event.
    pub content: C,
}

/// Any to-device event the coordinator knows how to handle.
#[derive(Clone, Debug)]
pub enum AnyToDeviceEvent {
    /// `m.room_key`
    RoomKey(ToDeviceEvent<RoomKeyContent>),
    /// `m.forwarded_room_key`
    ForwardedRoomKey(ToDeviceEvent<ForwardedRoomKeyContent>),
    /// `m.room_key_request`
    RoomKeyRequest(ToDeviceEvent<RoomKeyRequestContent>),
    /// `m.room.encrypted`, an Olm-encrypted to-device event.
    Encrypted(ToDeviceEvent<OlmV1Content>),
    /// A verification-flow event, forwarded to the verification delegate.
    Verification(ToDeviceEvent<Value>),
}

impl AnyToDeviceEvent {
    /// Parse a to-device event from its wire form.
    ///
    /// Returns `None` for event types the coordinator doesn't handle.
    pub fn from_parts(event_type: &str, sender: UserId, content: Value) -> Option<Self> {
        let event = match event_type {
            "m.room_key" => Self::RoomKey(ToDeviceEvent {
                sender,
                content: serde_json::from_value(content).ok()?,
            }),
            "m.forwarded_room_key" => Self::ForwardedRoomKey(ToDeviceEvent {
                sender,
                content: serde_json::from_value(content).ok()?,
            }),
            "m.room_key_request" => Self::RoomKeyRequest(ToDeviceEvent {
                sender,
                content: serde_json::from_value(content).ok()?,
            }),
            "m.room.encrypted" => {
                let content: EncryptedEventContent = serde_json::from_value(content).ok()?;
                match content {
                    EncryptedEventContent::OlmV1Curve25519AesSha2(c) => {
                        Self::Encrypted(ToDeviceEvent { sender, content: c })
                    }
                    EncryptedEventContent::MegolmV1AesSha2(_) => return None,
                }
            }
            t if t.starts_with("m.key.verification.") => {
                Self::Verification(ToDeviceEvent { sender, content })
            }
            _ => return None,
        };

        Some(event)
    }
}

/// The content of an `m.room_key` event, carrying a Megolm session key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm the session key is usable with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the session belongs to.
    pub room_id: RoomId,
    /// The unique id of the session.
    pub session_id: String,
    /// The session key, exported at the current ratchet index.
    pub session_key: String,
    /// The ratchet index the key was exported at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_index: Option<u32>,
}

/// The content of an `m.forwarded_room_key` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    pub algorithm: EventEncryptionAlgorithm,
    pub room_id: RoomId,
    /// The curve25519 key of the device that originally sent the session.
    pub sender_key: String,
    pub session_id: String,
    pub session_key: String,
    /// The ed25519 key the original sender claimed to own.
    pub sender_claimed_ed25519_key: String,
    /// The chain of curve25519 keys the session was forwarded through.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// The action of an `m.room_key_request` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRequestAction {
    /// Request the keys described by the request body.
    #[serde(rename = "request")]
    Request,
    /// Cancel a previously sent request.
    #[serde(rename = "request_cancellation")]
    CancelRequest,
}

/// Identification of a single Megolm session, the body of a key request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    pub algorithm: EventEncryptionAlgorithm,
    pub room_id: RoomId,
    pub sender_key: String,
    pub session_id: String,
}

/// The content of an `m.room_key_request` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Whether keys are being requested or a request is being cancelled.
    pub action: KeyRequestAction,
    /// The device that is requesting the keys.
    pub requesting_device_id: DeviceIdBox,
    /// A random string uniquely identifying the request.
    pub request_id: String,
    /// The session being requested; absent for cancellations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
}

/// A single Olm ciphertext together with its message type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CiphertextInfo {
    /// The base64 encoded ciphertext.
    pub body: String,
    /// 0 for pre-key messages, 1 for normal messages.
    #[serde(rename = "type")]
    pub message_type: u8,
}

/// The content of an Olm-encrypted `m.room.encrypted` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmV1Content {
    /// The curve25519 key of the sending device.
    pub sender_key: String,
    /// Ciphertexts keyed by the curve25519 key of the intended recipient
    /// device.
    pub ciphertext: BTreeMap<String, CiphertextInfo>,
}

/// The content of a Megolm-encrypted `m.room.encrypted` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1Content {
    /// The base64 encoded ciphertext.
    pub ciphertext: String,
    /// The curve25519 key of the sending device.
    pub sender_key: String,
    /// The id of the Megolm session that produced the ciphertext.
    pub session_id: String,
    /// The id of the sending device.
    pub device_id: DeviceIdBox,
}

/// The content of an `m.room.encrypted` event, tagged by algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum EncryptedEventContent {
    /// An event encrypted with the 1-to-1 Olm ratchet.
    #[serde(rename = "m.olm.v1.curve25519-aes-sha2")]
    OlmV1Curve25519AesSha2(OlmV1Content),
    /// An event encrypted with the Megolm group ratchet.
    #[serde(rename = "m.megolm.v1.aes-sha2")]
    MegolmV1AesSha2(MegolmV1Content),
}

impl EncryptedEventContent {
    /// The encryption algorithm of this content.
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            Self::OlmV1Curve25519AesSha2(_) => EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            Self::MegolmV1AesSha2(_) => EventEncryptionAlgorithm::MegolmV1AesSha2,
        }
    }
}

/// An encrypted room event, as handed to
/// [`decrypt_event`](crate::CryptoCoordinator::decrypt_event).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEvent {
    /// The globally unique id of the event.
    pub event_id: EventId,
    /// The user that sent the event.
    pub sender: UserId,
    /// The room the event was sent in.
    pub room_id: RoomId,
    /// The server timestamp of the event in milliseconds.
    pub origin_server_ts: u64,
    /// The encrypted content.
    pub content: EncryptedEventContent,
    /// Data added by the server that isn't part of the signed event.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub unsigned: Value,
}

/// The result of a successful room event decryption.
#[derive(Clone, Debug)]
pub struct DecryptionResult {
    /// The decrypted event, with `sender`, `event_id`, `origin_server_ts`
    /// and `unsigned` merged back in from the encrypted envelope.
    pub clear_event: Value,
    /// The curve25519 key of the device that encrypted the event.
    pub sender_curve25519_key: String,
    /// The ed25519 key the sender claimed to own when the session was
    /// received. Only trustworthy when the sending device is verified.
    pub claimed_ed25519_key: Option<String>,
    /// The chain of curve25519 keys the session was forwarded through, empty
    /// when the session came to us directly.
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// Membership states the coordinator reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
}

/// Device list changes carried by a sync response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    /// Users whose device lists changed and need a refresh.
    #[serde(default)]
    pub changed: Vec<UserId>,
    /// Users we no longer share an encrypted room with.
    #[serde(default)]
    pub left: Vec<UserId>,
}

/// The parts of a sync response the coordinator consumes.
#[derive(Clone, Debug, Default)]
pub struct SyncChanges {
    /// The to-device events delivered by this sync.
    pub to_device_events: Vec<AnyToDeviceEvent>,
    /// The device-list change sets.
    pub device_lists: DeviceLists,
    /// The number of unclaimed signed curve25519 one-time keys on the
    /// server, when the sync reported one.
    pub one_time_key_count: Option<u64>,
}

/// A host-supplied snapshot of the room state needed to encrypt for it.
#[derive(Clone, Debug)]
pub struct RoomSnapshot {
    /// The id of the room.
    pub room_id: RoomId,
    /// The users currently joined to the room.
    pub joined_members: Vec<UserId>,
    /// The users currently invited to the room.
    pub invited_members: Vec<UserId>,
    /// Whether the room's join rules allow encrypting for invited users.
    pub allows_encrypting_for_invited_members: bool,
}

impl RoomSnapshot {
    /// The users an outbound session may be shared with, honoring the
    /// invitee policy.
    pub(crate) fn recipients(&self, encrypt_to_invited: bool) -> Vec<UserId> {
        let mut users = self.joined_members.clone();

        if encrypt_to_invited && self.allows_encrypting_for_invited_members {
            users.extend(self.invited_members.iter().cloned());
        }

        users.sort_unstable();
        users.dedup();
        users
    }
}

#[cfg(test)]
mod test {
    use ruma::{user_id, EventEncryptionAlgorithm};
    use serde_json::json;

    use super::{AnyToDeviceEvent, EncryptedEventContent};

    #[test]
    fn encrypted_content_algorithm_tagging() {
        let content = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "ciphertext": "AwgAE...",
            "sender_key": "alice_curve",
            "session_id": "session",
            "device_id": "ALICEDEVICE",
        });

        let content: EncryptedEventContent = serde_json::from_value(content).unwrap();
        assert_eq!(content.algorithm(), EventEncryptionAlgorithm::MegolmV1AesSha2);

        let serialized = serde_json::to_value(&content).unwrap();
        assert_eq!(serialized["algorithm"], "m.megolm.v1.aes-sha2");
    }

    #[test]
    fn to_device_parsing() {
        let content = json!({
            "action": "request",
            "requesting_device_id": "OTHERDEVICE",
            "request_id": "random_id",
            "body": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "room_id": "!room:example.org",
                "sender_key": "alice_curve",
                "session_id": "session",
            }
        });

        let event =
            AnyToDeviceEvent::from_parts("m.room_key_request", user_id!("@alice:example.org"), content)
                .unwrap();

        match event {
            AnyToDeviceEvent::RoomKeyRequest(e) => {
                assert_eq!(e.content.request_id, "random_id");
                assert!(e.content.body.is_some());
            }
            _ => panic!("parsed into the wrong event type"),
        }

        assert!(AnyToDeviceEvent::from_parts(
            "m.unknown",
            user_id!("@alice:example.org"),
            json!({})
        )
        .is_none());
    }
}
