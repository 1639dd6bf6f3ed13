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

//! The room-key request protocol: reliable delivery of our own
//! `m.room_key_request` events and the records for requests other devices
//! send us.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use ruma::{DeviceId, DeviceIdBox, UserId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    events::{KeyRequestAction, RequestedKeyInfo, RoomKeyRequestContent},
    requests::{HomeserverClient, ToDeviceRequest},
    store::{CryptoStore, Result as StoreResult},
};

/// The delivery state of an outgoing room key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingRequestState {
    /// The request is queued but hasn't reached the homeserver yet.
    Unsent,
    /// The request was delivered to the homeserver.
    Sent,
    /// The request should be cancelled, the cancellation hasn't reached the
    /// homeserver yet.
    CancellationPending,
    /// The cancellation was delivered; the request is terminal and about to
    /// be forgotten.
    Cancelled,
}

/// A room key request this device sent out, tracked until it is answered or
/// cancelled.
///
/// Requests are idempotent by the fingerprint of their body: queueing the
/// same body twice yields a single request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingRoomKeyRequest {
    /// The random id identifying this request on the wire.
    pub request_id: String,
    /// The session being requested.
    pub body: RequestedKeyInfo,
    /// The devices the request is sent to.
    pub recipients: BTreeMap<UserId, Vec<DeviceIdBox>>,
    /// The delivery state of the request.
    pub state: OutgoingRequestState,
    /// Queue a fresh request for the same body once the pending
    /// cancellation went out.
    #[serde(default)]
    pub(crate) resend_after_cancel: bool,
}

impl OutgoingRoomKeyRequest {
    /// The fingerprint of the request body, used for idempotence.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.body)
    }
}

/// The canonical form of a request body, identifying requests for the same
/// session.
pub(crate) fn fingerprint_of(body: &RequestedKeyInfo) -> String {
    cjson::to_string(&json!(body)).expect("a key request body is canonicalizable")
}

/// A room key request another device sent to us, persisted until the user
/// shares or ignores it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomingRoomKeyRequest {
    /// The id the requesting device assigned to the request.
    pub request_id: String,
    /// The user that sent the request.
    pub user_id: UserId,
    /// The device that sent the request.
    pub device_id: DeviceIdBox,
    /// The session being requested.
    pub body: RequestedKeyInfo,
}

/// A cancellation of a previously received room key request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomingRequestCancellation {
    /// The id of the request being cancelled.
    pub request_id: String,
    /// The user that sent the cancellation.
    pub user_id: UserId,
    /// The device that sent the cancellation.
    pub device_id: DeviceIdBox,
}

const BASE_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Default)]
struct BackoffState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl BackoffState {
    fn delay(&self) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(16);
        std::cmp::min(BASE_RETRY_DELAY * 2u32.saturating_pow(exponent), MAX_RETRY_DELAY)
    }

    fn should_wait(&self) -> bool {
        match (self.consecutive_failures, self.last_failure) {
            (0, _) | (_, None) => false,
            (_, Some(at)) => at.elapsed() < self.delay(),
        }
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure = Some(Instant::now());
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure = None;
    }
}

/// Manager owning the lifecycle of our outgoing room key requests.
///
/// The manager never runs on its own; the coordinator drains it at startup
/// and after every sync, which doubles as the retry schedule.
#[derive(Clone, Debug)]
pub(crate) struct OutgoingRequestManager {
    device_id: Arc<DeviceId>,
    store: Arc<dyn CryptoStore>,
    client: Arc<dyn HomeserverClient>,
    backoff: Arc<Mutex<BackoffState>>,
}

impl OutgoingRequestManager {
    pub fn new(
        device_id: Arc<DeviceId>,
        store: Arc<dyn CryptoStore>,
        client: Arc<dyn HomeserverClient>,
    ) -> Self {
        Self { device_id, store, client, backoff: Arc::new(Mutex::new(BackoffState::default())) }
    }

    /// Queue a room key request for the given session.
    ///
    /// Queueing a body that is already pending is a no-op; queueing a body
    /// whose cancellation is still in flight resends once the cancellation
    /// went out.
    pub async fn request_room_key(
        &self,
        body: RequestedKeyInfo,
        recipients: BTreeMap<UserId, Vec<DeviceIdBox>>,
    ) -> StoreResult<()> {
        let fingerprint = fingerprint_of(&body);

        if let Some(mut existing) =
            self.store.get_outgoing_key_request_by_fingerprint(&fingerprint).await?
        {
            match existing.state {
                OutgoingRequestState::Unsent | OutgoingRequestState::Sent => {
                    debug!(
                        request_id = existing.request_id.as_str(),
                        "Not queueing a room key request, a request for the \
                         same session is already pending"
                    );
                }
                OutgoingRequestState::CancellationPending | OutgoingRequestState::Cancelled => {
                    existing.resend_after_cancel = true;
                    self.store.save_outgoing_key_request(existing).await?;
                }
            }

            return Ok(());
        }

        let request = OutgoingRoomKeyRequest {
            request_id: Uuid::new_v4().to_string(),
            body,
            recipients,
            state: OutgoingRequestState::Unsent,
            resend_after_cancel: false,
        };

        info!(request_id = request.request_id.as_str(), "Queueing a room key request");
        self.store.save_outgoing_key_request(request).await
    }

    /// Cancel a previously queued room key request for the given session.
    pub async fn cancel_room_key_request(&self, body: &RequestedKeyInfo) -> StoreResult<()> {
        let fingerprint = fingerprint_of(body);

        let mut request = match self
            .store
            .get_outgoing_key_request_by_fingerprint(&fingerprint)
            .await?
        {
            Some(r) => r,
            None => return Ok(()),
        };

        match request.state {
            OutgoingRequestState::Unsent => {
                // Never hit the wire, forget it outright.
                self.store.delete_outgoing_key_request(&request.request_id).await
            }
            OutgoingRequestState::Sent => {
                request.state = OutgoingRequestState::CancellationPending;
                request.resend_after_cancel = false;
                self.store.save_outgoing_key_request(request).await
            }
            OutgoingRequestState::CancellationPending | OutgoingRequestState::Cancelled => Ok(()),
        }
    }

    /// Send out every queued request and cancellation.
    ///
    /// Failures leave the queue untouched so the next drain retries them,
    /// subject to an exponential backoff.
    pub async fn send_outgoing_requests(&self) -> StoreResult<()> {
        if self.backoff.lock().await.should_wait() {
            return Ok(());
        }

        for request in self.store.get_outgoing_key_requests().await? {
            let sent = match request.state {
                OutgoingRequestState::Unsent => self.send_request(&request).await,
                OutgoingRequestState::CancellationPending => {
                    self.send_cancellation(&request).await
                }
                OutgoingRequestState::Sent | OutgoingRequestState::Cancelled => continue,
            };

            if !sent {
                self.backoff.lock().await.record_failure();
                return Ok(());
            }

            self.backoff.lock().await.record_success();

            match request.state {
                OutgoingRequestState::Unsent => {
                    let mut request = request;
                    request.state = OutgoingRequestState::Sent;
                    self.store.save_outgoing_key_request(request).await?;
                }
                OutgoingRequestState::CancellationPending => {
                    self.store.delete_outgoing_key_request(&request.request_id).await?;

                    if request.resend_after_cancel {
                        let fresh = OutgoingRoomKeyRequest {
                            request_id: Uuid::new_v4().to_string(),
                            body: request.body,
                            recipients: request.recipients,
                            state: OutgoingRequestState::Unsent,
                            resend_after_cancel: false,
                        };
                        self.store.save_outgoing_key_request(fresh).await?;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn send_request(&self, request: &OutgoingRoomKeyRequest) -> bool {
        let content = RoomKeyRequestContent {
            action: KeyRequestAction::Request,
            requesting_device_id: self.device_id.as_ref().to_owned(),
            request_id: request.request_id.clone(),
            body: Some(request.body.clone()),
        };

        self.send_to_recipients(request, content).await
    }

    async fn send_cancellation(&self, request: &OutgoingRoomKeyRequest) -> bool {
        let content = RoomKeyRequestContent {
            action: KeyRequestAction::CancelRequest,
            requesting_device_id: self.device_id.as_ref().to_owned(),
            request_id: request.request_id.clone(),
            body: None,
        };

        self.send_to_recipients(request, content).await
    }

    async fn send_to_recipients(
        &self,
        request: &OutgoingRoomKeyRequest,
        content: RoomKeyRequestContent,
    ) -> bool {
        let content = match serde_json::to_value(&content) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    request_id = request.request_id.as_str(),
                    error = ?e,
                    "Couldn't serialize a room key request content"
                );
                return false;
            }
        };

        let mut to_device = ToDeviceRequest::new("m.room_key_request");

        for (user_id, devices) in &request.recipients {
            let user_messages = to_device.messages.entry(user_id.clone()).or_default();

            for device_id in devices {
                user_messages.insert(device_id.clone(), content.clone());
            }
        }

        match self.client.send_to_device(to_device).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    request_id = request.request_id.as_str(),
                    error = ?e,
                    "Failed to send a room key request, will retry"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeMap, sync::Arc};

    use ruma::{room_id, user_id, EventEncryptionAlgorithm};

    use super::{OutgoingRequestManager, OutgoingRequestState};
    use crate::{
        events::RequestedKeyInfo,
        store::{CryptoStore, MemoryStore},
        testing::MockClient,
    };

    fn body() -> RequestedKeyInfo {
        RequestedKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id!("!test:example.org"),
            sender_key: "alice_curve_key".to_owned(),
            session_id: "session_id".to_owned(),
        }
    }

    fn manager() -> (OutgoingRequestManager, Arc<MemoryStore>, Arc<MockClient>) {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockClient::new());
        let device_id: ruma::DeviceIdBox = "ALICEDEVICE".into();

        let manager = OutgoingRequestManager::new(device_id.into(), store.clone(), client.clone());

        (manager, store, client)
    }

    fn recipients() -> BTreeMap<ruma::UserId, Vec<ruma::DeviceIdBox>> {
        let mut map = BTreeMap::new();
        map.insert(user_id!("@alice:example.org"), vec!["OTHERDEVICE".into()]);
        map
    }

    #[tokio::test]
    async fn requests_are_idempotent_by_body() {
        let (manager, store, client) = manager();

        manager.request_room_key(body(), recipients()).await.unwrap();
        manager.request_room_key(body(), recipients()).await.unwrap();

        assert_eq!(store.get_outgoing_key_requests().await.unwrap().len(), 1);

        manager.send_outgoing_requests().await.unwrap();
        assert_eq!(client.to_device_requests().len(), 1);

        let requests = store.get_outgoing_key_requests().await.unwrap();
        assert_eq!(requests[0].state, OutgoingRequestState::Sent);
    }

    #[tokio::test]
    async fn unsent_requests_are_cancelled_silently() {
        let (manager, store, client) = manager();

        manager.request_room_key(body(), recipients()).await.unwrap();
        manager.cancel_room_key_request(&body()).await.unwrap();

        assert!(store.get_outgoing_key_requests().await.unwrap().is_empty());

        manager.send_outgoing_requests().await.unwrap();
        assert!(client.to_device_requests().is_empty());
    }

    #[tokio::test]
    async fn sent_requests_are_cancelled_on_the_wire() {
        let (manager, store, client) = manager();

        manager.request_room_key(body(), recipients()).await.unwrap();
        manager.send_outgoing_requests().await.unwrap();

        manager.cancel_room_key_request(&body()).await.unwrap();
        let requests = store.get_outgoing_key_requests().await.unwrap();
        assert_eq!(requests[0].state, OutgoingRequestState::CancellationPending);

        manager.send_outgoing_requests().await.unwrap();
        assert!(store.get_outgoing_key_requests().await.unwrap().is_empty());

        let sent = client.to_device_requests();
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn cancel_then_request_resends_with_a_fresh_id() {
        let (manager, store, client) = manager();

        manager.request_room_key(body(), recipients()).await.unwrap();
        manager.send_outgoing_requests().await.unwrap();

        let original_id =
            store.get_outgoing_key_requests().await.unwrap()[0].request_id.clone();

        manager.cancel_room_key_request(&body()).await.unwrap();
        manager.request_room_key(body(), recipients()).await.unwrap();

        // The cancellation goes out first, then the fresh request.
        manager.send_outgoing_requests().await.unwrap();
        manager.send_outgoing_requests().await.unwrap();

        let requests = store.get_outgoing_key_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].state, OutgoingRequestState::Sent);
        assert_ne!(requests[0].request_id, original_id);

        assert_eq!(client.to_device_requests().len(), 3);
    }
}
