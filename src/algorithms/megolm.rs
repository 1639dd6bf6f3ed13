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

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use olm_rs::errors::OlmGroupSessionError;
use ruma::{DeviceKeyAlgorithm, EventEncryptionAlgorithm, RoomId, UserId};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{NewSessionNotifier, ReplayGuard, RoomDecryptor, RoomEncryptor};
use crate::{
    error::{CoordinatorError, EventError, MegolmError, MegolmResult},
    events::{
        DecryptionResult, EncryptedEvent, EncryptedEventContent, ForwardedRoomKeyContent,
        RequestedKeyInfo, RoomKeyContent,
    },
    identities::DeviceIdentity,
    key_request::IncomingRoomKeyRequest,
    olm::{
        EncryptionSettings, GroupSessionKey, InboundGroupSession, OutboundGroupSession,
        ShareState,
    },
    requests::{HomeserverClient, ToDeviceRequest},
    session_manager::SessionManager,
    store::{CryptoStore, Result as StoreResult},
};

/// The maximum number of to-device messages a single room key share request
/// carries.
const MAX_TO_DEVICE_MESSAGES: usize = 20;

/// The Megolm implementation of the per-room encryption capability.
///
/// Owns the room's outbound group session: builds it, rotates it per the
/// room's settings or when the membership shrinks, and distributes its key
/// to every eligible recipient device over Olm.
#[derive(Debug)]
pub(crate) struct MegolmEncryptor {
    room_id: RoomId,
    settings: EncryptionSettings,
    session_manager: SessionManager,
    store: Arc<dyn CryptoStore>,
    client: Arc<dyn HomeserverClient>,
    outbound: Mutex<Option<OutboundGroupSession>>,
}

impl MegolmEncryptor {
    pub fn new(
        room_id: RoomId,
        settings: EncryptionSettings,
        session_manager: SessionManager,
        store: Arc<dyn CryptoStore>,
        client: Arc<dyn HomeserverClient>,
    ) -> Self {
        Self { room_id, settings, session_manager, store, client, outbound: Mutex::new(None) }
    }

    /// Collect the devices the session key may be distributed to.
    ///
    /// Blocked devices never receive keys; unverified devices are excluded
    /// when the global or the per-room blacklist switch is set; our own
    /// device doesn't need the key over the wire.
    async fn collect_recipient_devices(
        &self,
        recipients: &[UserId],
    ) -> Result<Vec<DeviceIdentity>, CoordinatorError> {
        let blacklist_unverified =
            self.store.get_global_blacklist_unverified_devices().await?
                || self
                    .store
                    .get_room_blacklist_unverified_devices()
                    .await?
                    .contains(&self.room_id);

        let own_key = self.session_manager.account().curve25519_key().to_owned();
        let mut devices = Vec::new();

        for user_id in recipients {
            for device in self.store.get_user_devices(user_id).await?.devices() {
                if device.is_blocked() {
                    continue;
                }

                if blacklist_unverified && !device.is_verified() {
                    debug!(
                        user_id = user_id.as_str(),
                        device_id = device.device_id().as_str(),
                        "Withholding the room key from an unverified device"
                    );
                    continue;
                }

                if device.curve25519_key().map(|k| k.as_str()) == Some(own_key.as_str()) {
                    continue;
                }

                devices.push(device.clone());
            }
        }

        Ok(devices)
    }

    /// Get an outbound session that is usable and fully shared with the
    /// given devices, creating or rotating one as needed.
    async fn ensure_shared_session(
        &self,
        recipients: &[UserId],
    ) -> Result<OutboundGroupSession, CoordinatorError> {
        let devices = self.collect_recipient_devices(recipients).await?;

        let mut guard = self.outbound.lock().await;

        let needs_rotation = match guard.as_ref() {
            None => true,
            Some(session) => {
                let recipient_set: HashSet<&UserId> = recipients.iter().collect();

                let member_left =
                    session.shared_with_users().any(|u| !recipient_set.contains(&u));

                let identity_key_changed = devices.iter().any(|d| {
                    d.curve25519_key().map_or(false, |k| {
                        session.is_shared_with(d.user_id(), d.device_id(), k)
                            == ShareState::SharedButChangedIdentityKey
                    })
                });

                session.expired() || session.invalidated() || member_left || identity_key_changed
            }
        };

        if needs_rotation {
            let account = self.session_manager.account();

            info!(room_id = self.room_id.as_str(), "Creating a new outbound group session");

            let session = OutboundGroupSession::new(
                account.device_id.clone(),
                account.curve25519_key(),
                &self.room_id,
                self.settings.clone(),
            );

            // Store the matching inbound session so our own messages can be
            // decrypted and the key can be exported or re-shared later.
            let inbound = InboundGroupSession::new(
                account.curve25519_key(),
                account.ed25519_key(),
                &self.room_id,
                session.session_key().await,
            )
            .map_err(MegolmError::OlmGroupSession)?;
            self.store.save_inbound_group_sessions(&[inbound]).await.map_err(MegolmError::Store)?;

            *guard = Some(session);
        }

        let session = guard.as_ref().expect("an outbound session was just ensured").clone();
        drop(guard);

        let to_share: Vec<DeviceIdentity> = devices
            .into_iter()
            .filter(|d| {
                d.curve25519_key().map_or(false, |k| {
                    session.is_shared_with(d.user_id(), d.device_id(), k)
                        == ShareState::NotShared
                })
            })
            .collect();

        if !to_share.is_empty() {
            self.session_manager.ensure_sessions_for_devices(&to_share).await?;

            let message_index = session.message_index().await;
            let key_content = session.as_key_content().await;

            let messages = self
                .session_manager
                .encrypt_for_devices(to_share, "m.room_key", &key_content)
                .await?;

            debug!(
                room_id = self.room_id.as_str(),
                session_id = session.session_id(),
                device_count = messages.len(),
                "Sharing an outbound group session"
            );

            for chunk in messages.chunks(MAX_TO_DEVICE_MESSAGES) {
                let mut request = ToDeviceRequest::new("m.room.encrypted");

                for (device, content) in chunk {
                    request
                        .messages
                        .entry(device.user_id().clone())
                        .or_default()
                        .insert(device.device_id().to_owned(), content.clone());
                }

                self.client.send_to_device(request).await?;

                for (device, _) in chunk {
                    if let Some(identity_key) = device.curve25519_key() {
                        session.mark_shared_with(
                            device.user_id(),
                            device.device_id(),
                            identity_key,
                            message_index,
                        );
                    }
                }
            }
        }

        session.mark_as_shared();
        Ok(session)
    }
}

#[async_trait]
impl RoomEncryptor for MegolmEncryptor {
    fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    fn algorithm(&self) -> EventEncryptionAlgorithm {
        EventEncryptionAlgorithm::MegolmV1AesSha2
    }

    async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
        recipients: &[UserId],
    ) -> Result<EncryptedEventContent, CoordinatorError> {
        let session = self.ensure_shared_session(recipients).await?;
        let content = session.encrypt(event_type, content).await;

        Ok(EncryptedEventContent::MegolmV1AesSha2(content))
    }

    fn invalidate_outbound_session(&self) {
        if let Ok(guard) = self.outbound.try_lock() {
            if let Some(session) = guard.as_ref() {
                session.invalidate_session();
            }
        }
    }
}

/// The Megolm implementation of the per-room decryption capability.
///
/// Consumes inbound sessions, decrypts room events with per-timeline replay
/// protection and serves room key requests from the sessions it holds.
#[derive(Debug)]
pub(crate) struct MegolmDecryptor {
    room_id: RoomId,
    session_manager: SessionManager,
    store: Arc<dyn CryptoStore>,
    client: Arc<dyn HomeserverClient>,
    replay: Arc<ReplayGuard>,
    notifier: NewSessionNotifier,
}

impl MegolmDecryptor {
    pub fn new(
        room_id: RoomId,
        session_manager: SessionManager,
        store: Arc<dyn CryptoStore>,
        client: Arc<dyn HomeserverClient>,
        replay: Arc<ReplayGuard>,
        notifier: NewSessionNotifier,
    ) -> Self {
        Self { room_id, session_manager, store, client, replay, notifier }
    }

    /// Save the given inbound session unless a session reaching further back
    /// in the ratchet is already stored.
    async fn add_inbound_session(&self, session: InboundGroupSession) -> MegolmResult<()> {
        if let Some(existing) = self
            .store
            .get_inbound_group_session(
                &self.room_id,
                session.sender_key(),
                session.session_id(),
            )
            .await?
        {
            if existing.first_known_index() <= session.first_known_index() {
                debug!(
                    session_id = session.session_id(),
                    "Ignoring an inbound group session we already have a \
                     better copy of"
                );
                return Ok(());
            }
        }

        let sender_key = session.sender_key().to_owned();
        let session_id = session.session_id().to_owned();

        self.store.save_inbound_group_sessions(&[session]).await?;
        self.notifier.notify(&self.room_id, &sender_key, &session_id);

        Ok(())
    }
}

#[async_trait]
impl RoomDecryptor for MegolmDecryptor {
    fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    fn algorithm(&self) -> EventEncryptionAlgorithm {
        EventEncryptionAlgorithm::MegolmV1AesSha2
    }

    async fn decrypt_event(
        &self,
        event: &EncryptedEvent,
        timeline_id: &str,
    ) -> MegolmResult<DecryptionResult> {
        let content = match &event.content {
            EncryptedEventContent::MegolmV1AesSha2(c) => c,
            _ => return Err(EventError::UnsupportedAlgorithm.into()),
        };

        let session = self
            .store
            .get_inbound_group_session(&event.room_id, &content.sender_key, &content.session_id)
            .await?
            .ok_or(MegolmError::UnknownInboundSession)?;

        let (plaintext, message_index) =
            session.decrypt_helper(content.ciphertext.clone()).await.map_err(|e| match e {
                OlmGroupSessionError::UnknownMessageIndex => MegolmError::UnknownMessageIndex,
                _ => MegolmError::BadEncryptedMessage,
            })?;

        self.replay.check_and_record(
            timeline_id,
            &content.sender_key,
            &content.session_id,
            message_index,
            event.event_id.as_str(),
        )?;

        let mut decrypted_value = serde_json::from_str::<Value>(&plaintext)?;
        let decrypted_object =
            decrypted_value.as_object_mut().ok_or(EventError::NotAnObject)?;

        // The plaintext carries the room id, binding the ciphertext to the
        // room it was encrypted for.
        let claimed_room = decrypted_object.get("room_id").and_then(|r| r.as_str());
        if claimed_room != Some(event.room_id.as_str()) {
            warn!(
                event_id = event.event_id.as_str(),
                "The room id of the decrypted event doesn't match the room \
                 the event was sent in"
            );
            return Err(MegolmError::BadEncryptedMessage);
        }

        decrypted_object.insert("sender".to_owned(), event.sender.to_string().into());
        decrypted_object.insert("event_id".to_owned(), event.event_id.to_string().into());
        decrypted_object.insert("origin_server_ts".to_owned(), event.origin_server_ts.into());
        decrypted_object.insert("unsigned".to_owned(), event.unsigned.clone());

        Ok(DecryptionResult {
            clear_event: decrypted_value,
            sender_curve25519_key: content.sender_key.clone(),
            claimed_ed25519_key: session.claimed_ed25519_key().map(|k| k.to_owned()),
            forwarding_curve25519_key_chain: session.forwarding_key_chain().await,
        })
    }

    async fn on_room_key_event(
        &self,
        sender_key: &str,
        sender_claimed_ed25519: &str,
        content: RoomKeyContent,
    ) -> MegolmResult<()> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(
                algorithm = %content.algorithm,
                "Received a room key with an unsupported algorithm"
            );
            return Ok(());
        }

        let session = InboundGroupSession::new(
            sender_key,
            sender_claimed_ed25519,
            &content.room_id,
            GroupSessionKey(content.session_key),
        )?;

        info!(
            room_id = content.room_id.as_str(),
            session_id = session.session_id(),
            "Received a new inbound group session"
        );

        self.add_inbound_session(session).await
    }

    async fn on_forwarded_room_key_event(
        &self,
        sender_key: &str,
        mut content: ForwardedRoomKeyContent,
    ) -> MegolmResult<()> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(
                algorithm = %content.algorithm,
                "Received a forwarded room key with an unsupported algorithm"
            );
            return Ok(());
        }

        let session = InboundGroupSession::from_forwarded_key(sender_key, &mut content)?;

        info!(
            room_id = content.room_id.as_str(),
            session_id = session.session_id(),
            "Received a forwarded inbound group session"
        );

        self.add_inbound_session(session).await
    }

    async fn has_keys_for_request(&self, body: &RequestedKeyInfo) -> StoreResult<bool> {
        if body.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Ok(false);
        }

        Ok(self
            .store
            .get_inbound_group_session(&body.room_id, &body.sender_key, &body.session_id)
            .await?
            .is_some())
    }

    async fn share_keys_with_device(
        &self,
        request: &IncomingRoomKeyRequest,
        device: DeviceIdentity,
    ) -> Result<(), CoordinatorError> {
        let body = &request.body;

        let session = self
            .store
            .get_inbound_group_session(&body.room_id, &body.sender_key, &body.session_id)
            .await
            .map_err(MegolmError::Store)?
            .ok_or(MegolmError::UnknownInboundSession)?;

        let export = session.export().await;

        let content = ForwardedRoomKeyContent {
            algorithm: export.algorithm,
            room_id: export.room_id,
            sender_key: export.sender_key,
            session_id: export.session_id,
            session_key: export.session_key.0.clone(),
            sender_claimed_ed25519_key: export
                .sender_claimed_keys
                .get(&DeviceKeyAlgorithm::Ed25519)
                .cloned()
                .unwrap_or_default(),
            forwarding_curve25519_key_chain: export.forwarding_curve25519_key_chain.clone(),
        };

        info!(
            user_id = request.user_id.as_str(),
            device_id = request.device_id.as_str(),
            session_id = body.session_id.as_str(),
            "Forwarding a room key to a requesting device"
        );

        self.session_manager.ensure_sessions_for_devices(&[device.clone()]).await?;

        let messages = self
            .session_manager
            .encrypt_for_devices(vec![device], "m.forwarded_room_key", &json!(content))
            .await?;

        if messages.is_empty() {
            warn!(
                user_id = request.user_id.as_str(),
                device_id = request.device_id.as_str(),
                "Couldn't establish an Olm session to forward a room key"
            );
            return Ok(());
        }

        let mut to_device = ToDeviceRequest::new("m.room.encrypted");

        for (device, content) in messages {
            to_device
                .messages
                .entry(device.user_id().clone())
                .or_default()
                .insert(device.device_id().to_owned(), content);
        }

        self.client.send_to_device(to_device).await?;

        Ok(())
    }
}
