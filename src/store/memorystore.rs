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
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ruma::{DeviceId, DeviceIdBox, EventEncryptionAlgorithm, RoomId, UserId};
use tokio::sync::Mutex;

use super::{CryptoStore, Result, TrackedUser};
use crate::{
    identities::{DeviceIdentity, UserDevices},
    key_request::{IncomingRoomKeyRequest, OutgoingRoomKeyRequest},
    olm::{Account, InboundGroupSession, Session},
};

/// An in-memory only store that will forget all the E2EE state once the
/// object is dropped.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    account: Arc<Mutex<Option<Account>>>,
    sessions: Arc<DashMap<String, Arc<Mutex<Vec<Session>>>>>,
    inbound_group_sessions: Arc<DashMap<(RoomId, String, String), InboundGroupSession>>,
    devices: Arc<DashMap<UserId, DashMap<DeviceIdBox, DeviceIdentity>>>,
    tracked_users: Arc<DashMap<UserId, bool>>,
    room_algorithms: Arc<DashMap<RoomId, EventEncryptionAlgorithm>>,
    global_blacklist: Arc<AtomicBool>,
    blacklisted_rooms: Arc<DashSet<RoomId>>,
    outgoing_key_requests: Arc<DashMap<String, OutgoingRoomKeyRequest>>,
    incoming_key_requests: Arc<DashMap<(UserId, DeviceIdBox, String), IncomingRoomKeyRequest>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            account: Arc::new(Mutex::new(None)),
            sessions: Arc::new(DashMap::new()),
            inbound_group_sessions: Arc::new(DashMap::new()),
            devices: Arc::new(DashMap::new()),
            tracked_users: Arc::new(DashMap::new()),
            room_algorithms: Arc::new(DashMap::new()),
            global_blacklist: Arc::new(AtomicBool::new(false)),
            blacklisted_rooms: Arc::new(DashSet::new()),
            outgoing_key_requests: Arc::new(DashMap::new()),
            incoming_key_requests: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        Ok(self.account.lock().await.clone())
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        *self.account.lock().await = Some(account);
        Ok(())
    }

    async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        for session in sessions {
            let entry = self
                .sessions
                .entry(session.sender_key().to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                .clone();

            let mut entry = entry.lock().await;

            if !entry.iter().any(|s| s.session_id() == session.session_id()) {
                entry.push(session.clone());
            }
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        Ok(self.sessions.get(sender_key).map(|s| s.clone()))
    }

    async fn save_inbound_group_sessions(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()> {
        for session in sessions {
            self.inbound_group_sessions.insert(
                (
                    session.room_id().clone(),
                    session.sender_key().to_owned(),
                    session.session_id().to_owned(),
                ),
                session.clone(),
            );
        }

        Ok(())
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self
            .inbound_group_sessions
            .get(&(room_id.clone(), sender_key.to_owned(), session_id.to_owned()))
            .map(|s| s.clone()))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.iter().map(|s| s.value().clone()).collect())
    }

    async fn save_devices(&self, devices: &[DeviceIdentity]) -> Result<()> {
        for device in devices {
            self.devices
                .entry(device.user_id().clone())
                .or_insert_with(DashMap::new)
                .insert(device.device_id().to_owned(), device.clone());
        }

        Ok(())
    }

    async fn delete_device(&self, device: DeviceIdentity) -> Result<()> {
        if let Some(map) = self.devices.get(device.user_id()) {
            map.remove(device.device_id());
        }

        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>> {
        Ok(self.devices.get(user_id).and_then(|m| m.get(device_id).map(|d| d.clone())))
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices> {
        let inner = self
            .devices
            .get(user_id)
            .map(|m| m.iter().map(|d| (d.key().clone(), d.value().clone())).collect())
            .unwrap_or_default();

        Ok(UserDevices { inner })
    }

    async fn load_tracked_users(&self) -> Result<Vec<TrackedUser>> {
        Ok(self
            .tracked_users
            .iter()
            .map(|u| TrackedUser { user_id: u.key().clone(), dirty: *u.value() })
            .collect())
    }

    async fn save_tracked_user(&self, user: &UserId, dirty: bool) -> Result<()> {
        self.tracked_users.insert(user.clone(), dirty);
        Ok(())
    }

    async fn remove_tracked_user(&self, user: &UserId) -> Result<()> {
        self.tracked_users.remove(user);
        Ok(())
    }

    async fn get_room_algorithm(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<EventEncryptionAlgorithm>> {
        Ok(self.room_algorithms.get(room_id).map(|a| a.clone()))
    }

    async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()> {
        self.room_algorithms.insert(room_id.clone(), algorithm);
        Ok(())
    }

    async fn get_global_blacklist_unverified_devices(&self) -> Result<bool> {
        Ok(self.global_blacklist.load(Ordering::SeqCst))
    }

    async fn set_global_blacklist_unverified_devices(&self, blacklist: bool) -> Result<()> {
        self.global_blacklist.store(blacklist, Ordering::SeqCst);
        Ok(())
    }

    async fn get_room_blacklist_unverified_devices(&self) -> Result<HashSet<RoomId>> {
        Ok(self.blacklisted_rooms.iter().map(|r| r.clone()).collect())
    }

    async fn set_room_blacklist_unverified_devices(
        &self,
        room_id: &RoomId,
        blacklist: bool,
    ) -> Result<()> {
        if blacklist {
            self.blacklisted_rooms.insert(room_id.clone());
        } else {
            self.blacklisted_rooms.remove(room_id);
        }

        Ok(())
    }

    async fn save_outgoing_key_request(&self, request: OutgoingRoomKeyRequest) -> Result<()> {
        self.outgoing_key_requests.insert(request.request_id.clone(), request);
        Ok(())
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &str,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        Ok(self.outgoing_key_requests.get(request_id).map(|r| r.clone()))
    }

    async fn get_outgoing_key_request_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        Ok(self
            .outgoing_key_requests
            .iter()
            .find(|r| r.value().fingerprint() == fingerprint)
            .map(|r| r.value().clone()))
    }

    async fn get_outgoing_key_requests(&self) -> Result<Vec<OutgoingRoomKeyRequest>> {
        Ok(self.outgoing_key_requests.iter().map(|r| r.value().clone()).collect())
    }

    async fn delete_outgoing_key_request(&self, request_id: &str) -> Result<()> {
        self.outgoing_key_requests.remove(request_id);
        Ok(())
    }

    async fn save_incoming_key_request(&self, request: IncomingRoomKeyRequest) -> Result<()> {
        self.incoming_key_requests.insert(
            (
                request.user_id.clone(),
                request.device_id.clone(),
                request.request_id.clone(),
            ),
            request,
        );

        Ok(())
    }

    async fn delete_incoming_key_request(&self, request: &IncomingRoomKeyRequest) -> Result<()> {
        self.incoming_key_requests.remove(&(
            request.user_id.clone(),
            request.device_id.clone(),
            request.request_id.clone(),
        ));

        Ok(())
    }

    async fn get_incoming_key_requests(&self) -> Result<Vec<IncomingRoomKeyRequest>> {
        Ok(self.incoming_key_requests.iter().map(|r| r.value().clone()).collect())
    }
}

#[cfg(test)]
mod test {
    use ruma::{room_id, user_id};

    use super::MemoryStore;
    use crate::{
        identities::device::test::get_device,
        olm::{Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession},
        store::CryptoStore,
    };

    #[tokio::test]
    async fn account_and_device_storage() {
        let store = MemoryStore::new();

        assert!(store.load_account().await.unwrap().is_none());

        let account = Account::new(&user_id!("@alice:example.org"), "ALICEDEVICE".into());
        store.save_account(account.clone()).await.unwrap();

        let loaded = store.load_account().await.unwrap().unwrap();
        assert_eq!(account.identity_keys(), loaded.identity_keys());

        let device = get_device();
        store.save_devices(&[device.clone()]).await.unwrap();

        let loaded = store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device, loaded);

        let user_devices = store.get_user_devices(device.user_id()).await.unwrap();
        assert_eq!(user_devices.len(), 1);

        store.delete_device(device.clone()).await.unwrap();
        assert!(store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn inbound_group_session_storage() {
        let store = MemoryStore::new();
        let room_id = room_id!("!test:example.org");

        let device_id: ruma::DeviceIdBox = "ALICEDEVICE".into();
        let outbound = OutboundGroupSession::new(
            device_id.into(),
            "alice_curve_key",
            &room_id,
            EncryptionSettings::default(),
        );

        let session = InboundGroupSession::new(
            "alice_curve_key",
            "alice_ed25519_key",
            &room_id,
            outbound.session_key().await,
        )
        .unwrap();

        store.save_inbound_group_sessions(&[session.clone()]).await.unwrap();

        let loaded = store
            .get_inbound_group_session(&room_id, "alice_curve_key", session.session_id())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.session_id(), loaded.session_id());
        assert_eq!(store.get_inbound_group_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tracked_users_and_blacklists() {
        let store = MemoryStore::new();
        let user = user_id!("@bob:example.org");
        let room = room_id!("!test:example.org");

        store.save_tracked_user(&user, true).await.unwrap();
        let tracked = store.load_tracked_users().await.unwrap();
        assert_eq!(tracked.len(), 1);
        assert!(tracked[0].dirty);

        store.remove_tracked_user(&user).await.unwrap();
        assert!(store.load_tracked_users().await.unwrap().is_empty());

        assert!(!store.get_global_blacklist_unverified_devices().await.unwrap());
        store.set_global_blacklist_unverified_devices(true).await.unwrap();
        assert!(store.get_global_blacklist_unverified_devices().await.unwrap());

        store.set_room_blacklist_unverified_devices(&room, true).await.unwrap();
        assert!(store.get_room_blacklist_unverified_devices().await.unwrap().contains(&room));
        store.set_room_blacklist_unverified_devices(&room, false).await.unwrap();
        assert!(!store.get_room_blacklist_unverified_devices().await.unwrap().contains(&room));
    }
}
