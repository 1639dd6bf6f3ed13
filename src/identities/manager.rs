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

use std::{convert::TryFrom, sync::Arc};

use dashmap::DashMap;
use ruma::{DeviceId, UserId};
use tracing::{debug, info, trace, warn};

use super::device::DeviceIdentity;
use crate::{
    error::CoordinatorError,
    requests::{HomeserverClient, KeysQueryRequest},
    store::CryptoStore,
};

/// Tracker for the device lists of the users we share encrypted rooms with.
///
/// A tracked user's device list is either fresh or stale; stale lists are
/// refreshed in a single batched `/keys/query` request after a sync reported
/// changes or after a room gained a member.
#[derive(Clone, Debug)]
pub(crate) struct DeviceListTracker {
    user_id: Arc<UserId>,
    device_id: Arc<DeviceId>,
    store: Arc<dyn CryptoStore>,
    client: Arc<dyn HomeserverClient>,
    /// The tracked users, `true` when the locally held list is stale.
    tracked: Arc<DashMap<UserId, bool>>,
}

impl DeviceListTracker {
    pub fn new(
        user_id: Arc<UserId>,
        device_id: Arc<DeviceId>,
        store: Arc<dyn CryptoStore>,
        client: Arc<dyn HomeserverClient>,
    ) -> Self {
        Self { user_id, device_id, store, client, tracked: Arc::new(DashMap::new()) }
    }

    /// Load the tracking state persisted by an earlier session.
    pub async fn load_tracked_users(&self) -> Result<(), CoordinatorError> {
        for user in self.store.load_tracked_users().await? {
            self.tracked.insert(user.user_id, user.dirty);
        }

        Ok(())
    }

    /// Is the given user's device list tracked.
    pub fn is_tracked(&self, user_id: &UserId) -> bool {
        self.tracked.contains_key(user_id)
    }

    /// Start tracking the device lists of the given users.
    ///
    /// Newly tracked users start out stale; users that are already tracked
    /// are left untouched.
    pub async fn update_tracked_users<'a, I>(&self, users: I) -> Result<(), CoordinatorError>
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        for user in users {
            if self.tracked.contains_key(user) {
                continue;
            }

            self.tracked.insert(user.clone(), true);
            self.store.save_tracked_user(user, true).await?;
        }

        Ok(())
    }

    /// Mark the device lists of the given users as stale.
    pub async fn mark_tracked_users_dirty<'a, I>(&self, users: I) -> Result<(), CoordinatorError>
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        for user in users {
            let is_tracked = if let Some(mut dirty) = self.tracked.get_mut(user) {
                *dirty = true;
                true
            } else {
                false
            };

            if is_tracked {
                self.store.save_tracked_user(user, true).await?;
            }
        }

        Ok(())
    }

    /// Stop tracking the given users.
    pub async fn untrack_users<'a, I>(&self, users: I) -> Result<(), CoordinatorError>
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        for user in users {
            if self.tracked.remove(user).is_some() {
                self.store.remove_tracked_user(user).await?;
            }
        }

        Ok(())
    }

    /// Mark every tracked device list as stale, forcing a full refresh.
    pub async fn invalidate_all_device_lists(&self) -> Result<(), CoordinatorError> {
        let users: Vec<UserId> = self.tracked.iter().map(|u| u.key().clone()).collect();
        self.mark_tracked_users_dirty(users.iter()).await
    }

    /// The tracked users whose device lists are currently stale.
    pub fn users_with_stale_device_lists(&self) -> Vec<UserId> {
        self.tracked.iter().filter(|u| *u.value()).map(|u| u.key().clone()).collect()
    }

    /// Refresh every stale device list with a single batched query.
    pub async fn refresh_outdated_device_lists(
        &self,
        token: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        let users = self.users_with_stale_device_lists();

        if users.is_empty() {
            return Ok(());
        }

        debug!(user_count = users.len(), "Refreshing stale device lists");
        self.download_device_lists(users, token).await
    }

    /// Download the device lists of the given users, regardless of their
    /// tracking state.
    pub async fn download_device_lists(
        &self,
        users: Vec<UserId>,
        token: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        if users.is_empty() {
            return Ok(());
        }

        let request = KeysQueryRequest::new(users, token.map(|t| t.to_owned()));
        let response = self.client.query_keys(request).await?;

        for (user_id, device_map) in response.device_keys {
            let mut changed_devices = Vec::new();

            for (device_id, device_keys) in device_map.iter() {
                // We don't need our own device in the device store.
                if user_id == *self.user_id && device_id.as_str() == self.device_id.as_str() {
                    continue;
                }

                if user_id != device_keys.user_id || *device_id != device_keys.device_id {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        "Mismatch in the device keys payload",
                    );
                    continue;
                }

                if let Some(mut existing) =
                    self.store.get_device(&user_id, device_id).await?
                {
                    let new_curve_key = device_keys
                        .keys
                        .get(&ruma::DeviceKeyId::from_parts(
                            ruma::DeviceKeyAlgorithm::Curve25519,
                            device_id,
                        ))
                        .cloned();

                    // Identity keys are immutable once recorded; a device
                    // presenting a different key is not the same device.
                    if existing.curve25519_key().cloned() != new_curve_key {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            "The identity key of a known device changed, \
                             ignoring the update",
                        );
                        continue;
                    }

                    match existing.update_device(device_keys) {
                        Ok(()) => changed_devices.push(existing),
                        Err(e) => {
                            warn!(
                                user_id = user_id.as_str(),
                                device_id = device_id.as_str(),
                                error = ?e,
                                "Failed to verify the updated device keys",
                            );
                        }
                    }
                } else {
                    match DeviceIdentity::try_from(device_keys) {
                        Ok(device) => {
                            info!(
                                user_id = user_id.as_str(),
                                device_id = device_id.as_str(),
                                "Found a new device",
                            );
                            changed_devices.push(device);
                        }
                        Err(e) => {
                            warn!(
                                user_id = user_id.as_str(),
                                device_id = device_id.as_str(),
                                error = ?e,
                                "Failed to verify the device keys of a new \
                                 device",
                            );
                        }
                    }
                }
            }

            let stored_devices = self.store.get_user_devices(&user_id).await?;

            for device in stored_devices.devices() {
                if !device_map.contains_key(device.device_id()) {
                    trace!(
                        user_id = user_id.as_str(),
                        device_id = device.device_id().as_str(),
                        "A device was deleted server side",
                    );
                    device.mark_as_deleted();
                    self.store.delete_device(device.clone()).await?;
                }
            }

            self.store.save_devices(&changed_devices).await?;

            let is_tracked = if let Some(mut dirty) = self.tracked.get_mut(&user_id) {
                *dirty = false;
                true
            } else {
                false
            };

            if is_tracked {
                self.store.save_tracked_user(&user_id, false).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use ruma::user_id;

    use super::DeviceListTracker;
    use crate::{
        olm::Account,
        store::{CryptoStore, MemoryStore},
        testing::{response_for_accounts, MockClient},
    };

    fn alice_account() -> Account {
        Account::new(&user_id!("@alice:example.org"), "ALICEDEVICE".into())
    }

    fn bob_account() -> Account {
        Account::new(&user_id!("@bob:example.org"), "BOBDEVICE".into())
    }

    async fn tracker(client: Arc<MockClient>) -> (DeviceListTracker, Arc<MemoryStore>) {
        let account = alice_account();
        let store = Arc::new(MemoryStore::new());

        let tracker = DeviceListTracker::new(
            account.user_id.clone(),
            account.device_id.clone(),
            store.clone(),
            client,
        );

        (tracker, store)
    }

    #[tokio::test]
    async fn tracking_and_staleness() {
        let client = Arc::new(MockClient::new());
        let (tracker, _) = tracker(client).await;
        let bob = user_id!("@bob:example.org");

        assert!(!tracker.is_tracked(&bob));
        tracker.update_tracked_users([bob.clone()].iter()).await.unwrap();
        assert!(tracker.is_tracked(&bob));
        assert_eq!(tracker.users_with_stale_device_lists(), [bob.clone()]);

        tracker.untrack_users([bob.clone()].iter()).await.unwrap();
        assert!(!tracker.is_tracked(&bob));
    }

    #[tokio::test]
    async fn stale_lists_are_refreshed() {
        let bob = bob_account();
        let client = Arc::new(MockClient::new());
        client.add_keys_query_response(response_for_accounts(&[&bob]).await);

        let (tracker, store) = tracker(client.clone()).await;

        tracker.update_tracked_users([bob.user_id().to_owned()].iter()).await.unwrap();
        tracker.refresh_outdated_device_lists(None).await.unwrap();

        assert!(tracker.users_with_stale_device_lists().is_empty());
        assert_eq!(client.keys_query_requests().len(), 1);

        let device = store
            .get_device(bob.user_id(), bob.device_id())
            .await
            .unwrap()
            .expect("bob's device should be stored after the refresh");
        assert_eq!(device.curve25519_key().map(|k| k.as_str()), Some(bob.curve25519_key()));
    }

    #[tokio::test]
    async fn identity_keys_are_pinned(){
        let bob = bob_account();
        let client = Arc::new(MockClient::new());
        client.add_keys_query_response(response_for_accounts(&[&bob]).await);

        let (tracker, store) = tracker(client.clone()).await;
        tracker.update_tracked_users([bob.user_id().to_owned()].iter()).await.unwrap();
        tracker.refresh_outdated_device_lists(None).await.unwrap();

        // A new account posing as the same device.
        let impostor = bob_account();
        client.add_keys_query_response(response_for_accounts(&[&impostor]).await);

        tracker.mark_tracked_users_dirty([bob.user_id().to_owned()].iter()).await.unwrap();
        tracker.refresh_outdated_device_lists(None).await.unwrap();

        let device = store.get_device(bob.user_id(), bob.device_id()).await.unwrap().unwrap();
        assert_eq!(
            device.curve25519_key().map(|k| k.as_str()),
            Some(bob.curve25519_key()),
            "the stored identity key must not follow the impostor"
        );
    }
}
