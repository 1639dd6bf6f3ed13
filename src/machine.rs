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

//! The coordinator orchestrating device identity, session establishment,
//! per-room encryption and decryption, room-key distribution and the
//! room-key request protocol.

use std::{
    collections::{BTreeMap, BTreeSet},
    convert::TryInto,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock as StdRwLock,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use futures::future::join_all;
use olm_rs::session::OlmMessage;
use ruma::{
    DeviceId, DeviceIdBox, EventEncryptionAlgorithm, RoomId, UserId,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    algorithms::{
        AlgorithmRegistry, MegolmDecryptor, MegolmEncryptor, NewSessionListener,
        NewSessionNotifier, ReplayGuard, RoomDecryptor, RoomEncryptor,
    },
    error::{CoordinatorError, EventError, OlmError, OlmResult, SignatureError},
    events::{
        AnyToDeviceEvent, DecryptionResult, EncryptedEvent, EncryptedEventContent,
        ForwardedRoomKeyContent, KeyRequestAction, MembershipState, OlmV1Content,
        RequestedKeyInfo, RoomKeyContent, RoomSnapshot, SyncChanges, ToDeviceEvent,
    },
    identities::{DeviceIdentity, DeviceListTracker, VerificationState},
    key_request::{
        IncomingRequestCancellation, IncomingRoomKeyRequest, OutgoingRequestManager,
    },
    olm::{Account, EncryptionSettings, InboundGroupSession, Session},
    requests::{ConnectivityObserver, HomeserverClient, KeysUploadRequest},
    session_manager::SessionManager,
    store::CryptoStore,
    file_encryption::{decrypt_key_export, encrypt_key_export, is_key_export},
};

const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(1);
const ONE_TIME_KEY_UPLOAD_PERIOD: Duration = Duration::from_secs(60);
const ONE_TIME_KEY_GENERATION_MAX_NUMBER: usize = 5;

/// Listener notified about incoming room key requests that need a user
/// decision.
pub trait RoomKeyRequestListener: Send + Sync {
    /// A device asked us for room keys and isn't verified; the user decides
    /// through [`accept_key_request`](CryptoCoordinator::accept_key_request)
    /// or [`ignore_key_request`](CryptoCoordinator::ignore_key_request).
    fn on_room_key_request(&self, request: &IncomingRoomKeyRequest);

    /// A previously received request was cancelled by the requesting device.
    fn on_room_key_request_cancellation(&self, cancellation: &IncomingRequestCancellation);
}

/// Delegate receiving the verification-flow to-device events.
pub trait VerificationDelegate: Send + Sync {
    /// A `m.key.verification.*` event arrived for this device.
    fn on_verification_event(&self, sender: &UserId, content: &Value);
}

/// Delegate hooks into the megolm key-backup subsystem.
pub trait KeyBackupDelegate: Send + Sync {
    /// The coordinator finished starting up, the backup state can be
    /// checked.
    fn check_backup(&self);

    /// New room keys were imported and may need to be uploaded to the
    /// backup.
    fn on_keys_imported(&self);
}

/// Runtime configuration of the coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Should room keys be shared with the devices of invited users, when
    /// the room's join rules allow it.
    pub encrypt_to_invited_members: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { encrypt_to_invited_members: true }
    }
}

/// Return type for the room key import.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were imported.
    pub imported_count: usize,
    /// The total number of room keys that were found in the export.
    pub total_count: usize,
    /// The map of imported keys, room id to sender key to session ids.
    pub keys: BTreeMap<RoomId, BTreeMap<String, BTreeSet<String>>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartPhase {
    Idle,
    Starting,
    Started,
}

/// The state owned by the encrypt context: startup, the one-time key ledger
/// and the incoming request queues.
#[derive(Debug)]
struct OutboundContext {
    start_phase: StartPhase,
    otk_check_in_progress: bool,
    last_otk_check: Option<Instant>,
    one_time_key_count: Option<u64>,
    incoming_key_requests: Vec<IncomingRoomKeyRequest>,
    incoming_cancellations: Vec<IncomingRequestCancellation>,
}

impl OutboundContext {
    fn new() -> Self {
        Self {
            start_phase: StartPhase::Idle,
            otk_check_in_progress: false,
            last_otk_check: None,
            one_time_key_count: None,
            incoming_key_requests: Vec::new(),
            incoming_cancellations: Vec::new(),
        }
    }
}

/// The end-to-end crypto coordinator of a Matrix client.
///
/// Owns the device identity, the Olm account and every per-room encryptor
/// and decryptor; the host drives it with the sync stream and uses it to
/// encrypt outgoing and decrypt incoming room events.
#[derive(Clone)]
pub struct CryptoCoordinator {
    user_id: Arc<UserId>,
    device_id: Arc<DeviceId>,
    account: Account,
    store: Arc<dyn CryptoStore>,
    client: Arc<dyn HomeserverClient>,
    config: CoordinatorConfig,
    device_list: DeviceListTracker,
    session_manager: SessionManager,
    outgoing_requests: OutgoingRequestManager,
    registry: Arc<AlgorithmRegistry>,
    encryptors: Arc<DashMap<RoomId, Arc<dyn RoomEncryptor>>>,
    decryptors: Arc<DashMap<RoomId, Arc<dyn RoomDecryptor>>>,
    outbound_ctx: Arc<Mutex<OutboundContext>>,
    replay: Arc<ReplayGuard>,
    new_session_notifier: NewSessionNotifier,
    key_request_listeners: Arc<StdRwLock<Vec<Arc<dyn RoomKeyRequestListener>>>>,
    verification_delegate: Arc<StdRwLock<Option<Arc<dyn VerificationDelegate>>>>,
    backup_delegate: Arc<StdRwLock<Option<Arc<dyn KeyBackupDelegate>>>>,
    connectivity: Arc<StdRwLock<Option<Arc<dyn ConnectivityObserver>>>>,
    /// Held for the whole startup sequence; concurrent `start` calls queue
    /// up on it and observe the result of the winning attempt.
    start_lock: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for CryptoCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoCoordinator")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl CryptoCoordinator {
    /// Create a new coordinator for the given user.
    ///
    /// When the store holds an account from an earlier session the stored
    /// identity is reused, `device_id` is ignored in that case. Otherwise a
    /// fresh account is created under the given device id, or under a newly
    /// generated UUID when none is provided, and persisted.
    pub async fn new(
        user_id: &UserId,
        device_id: Option<&DeviceId>,
        store: Arc<dyn CryptoStore>,
        client: Arc<dyn HomeserverClient>,
        config: CoordinatorConfig,
    ) -> Result<Self, CoordinatorError> {
        let account = match store.load_account().await? {
            Some(account) => {
                debug!(
                    user_id = user_id.as_str(),
                    device_id = account.device_id().as_str(),
                    "Restored a previously stored account"
                );
                account
            }
            None => {
                let device_id: DeviceIdBox = match device_id {
                    Some(d) => d.to_owned(),
                    None => Uuid::new_v4().to_string().into(),
                };

                debug!(
                    user_id = user_id.as_str(),
                    device_id = device_id.as_str(),
                    "Creating a new account"
                );

                let account = Account::new(user_id, &device_id);
                store.save_account(account.clone()).await?;
                account
            }
        };

        let self_device = DeviceIdentity::from_account(&account).await;
        store.save_devices(&[self_device]).await?;

        let device_id = account.device_id.clone();
        let user_id = account.user_id.clone();

        let session_manager = SessionManager::new(account.clone(), store.clone(), client.clone());
        let device_list = DeviceListTracker::new(
            user_id.clone(),
            device_id.clone(),
            store.clone(),
            client.clone(),
        );
        device_list.load_tracked_users().await?;
        device_list.update_tracked_users([(*user_id).clone()].iter()).await?;

        let outgoing_requests =
            OutgoingRequestManager::new(device_id.clone(), store.clone(), client.clone());

        let replay = Arc::new(ReplayGuard::new());
        let new_session_notifier = NewSessionNotifier::new();

        let mut registry = AlgorithmRegistry::new();

        {
            let session_manager = session_manager.clone();
            let store = store.clone();
            let client = client.clone();

            registry.register_encryptor(
                EventEncryptionAlgorithm::MegolmV1AesSha2,
                Arc::new(move |room_id, settings| {
                    Arc::new(MegolmEncryptor::new(
                        room_id.clone(),
                        settings,
                        session_manager.clone(),
                        store.clone(),
                        client.clone(),
                    ))
                }),
            );
        }

        {
            let session_manager = session_manager.clone();
            let store = store.clone();
            let client = client.clone();
            let replay = replay.clone();
            let notifier = new_session_notifier.clone();

            registry.register_decryptor(
                EventEncryptionAlgorithm::MegolmV1AesSha2,
                Arc::new(move |room_id| {
                    Arc::new(MegolmDecryptor::new(
                        room_id.clone(),
                        session_manager.clone(),
                        store.clone(),
                        client.clone(),
                        replay.clone(),
                        notifier.clone(),
                    ))
                }),
            );
        }

        Ok(Self {
            user_id,
            device_id,
            account,
            store,
            client,
            config,
            device_list,
            session_manager,
            outgoing_requests,
            registry: Arc::new(registry),
            encryptors: Arc::new(DashMap::new()),
            decryptors: Arc::new(DashMap::new()),
            outbound_ctx: Arc::new(Mutex::new(OutboundContext::new())),
            replay,
            new_session_notifier,
            key_request_listeners: Arc::new(StdRwLock::new(Vec::new())),
            verification_delegate: Arc::new(StdRwLock::new(None)),
            backup_delegate: Arc::new(StdRwLock::new(None)),
            connectivity: Arc::new(StdRwLock::new(None)),
            start_lock: Arc::new(Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The user the coordinator belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device id of this device, generated and persisted at first use.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public curve25519 key of this device.
    pub fn identity_key(&self) -> &str {
        self.account.curve25519_key()
    }

    /// The public ed25519 fingerprint key of this device.
    pub fn fingerprint_key(&self) -> &str {
        self.account.ed25519_key()
    }

    /// Has [`close`](#method.close) been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Is the startup sequence complete.
    pub async fn is_started(&self) -> bool {
        self.outbound_ctx.lock().await.start_phase == StartPhase::Started
    }

    /// Attach an observer for network connectivity; startup defers until it
    /// reports a connected state.
    pub fn set_connectivity_observer(&self, observer: Arc<dyn ConnectivityObserver>) {
        *self.connectivity.write().expect("the delegate lock is poisoned") = Some(observer);
    }

    /// Register a listener for incoming room key requests.
    pub fn add_room_key_request_listener(&self, listener: Arc<dyn RoomKeyRequestListener>) {
        self.key_request_listeners
            .write()
            .expect("the listener lock is poisoned")
            .push(listener);
    }

    /// Register a listener for newly usable inbound sessions.
    pub fn register_new_session_listener(&self, listener: Arc<dyn NewSessionListener>) {
        self.new_session_notifier.register(listener);
    }

    /// Set the delegate receiving verification-flow events.
    pub fn set_verification_delegate(&self, delegate: Arc<dyn VerificationDelegate>) {
        *self.verification_delegate.write().expect("the delegate lock is poisoned") =
            Some(delegate);
    }

    /// Set the delegate hooking into the key-backup subsystem.
    pub fn set_key_backup_delegate(&self, delegate: Arc<dyn KeyBackupDelegate>) {
        *self.backup_delegate.write().expect("the delegate lock is poisoned") = Some(delegate);
    }

    /// Start the coordinator: publish our device keys, fill the one-time
    /// key pool and begin serving requests.
    ///
    /// Concurrent calls coalesce into a single startup sequence. Transport
    /// and protocol failures are retried with a fixed one second delay; the
    /// call returns once startup succeeded.
    #[instrument(skip(self))]
    pub async fn start(&self, is_initial_sync: bool) -> Result<(), CoordinatorError> {
        if self.is_closed() {
            return Ok(());
        }

        loop {
            if self.is_started().await {
                return Ok(());
            }

            let guard = self.start_lock.lock().await;

            // A concurrent call may have finished the startup while we were
            // queued on the lock.
            if self.is_started().await {
                return Ok(());
            }

            self.outbound_ctx.lock().await.start_phase = StartPhase::Starting;

            let observer =
                self.connectivity.read().expect("the delegate lock is poisoned").clone();
            if let Some(observer) = observer {
                while !observer.is_connected() {
                    debug!("Deferring startup until the network is reachable");
                    tokio::time::sleep(STARTUP_RETRY_DELAY).await;
                }
            }

            match self.run_startup().await {
                Ok(()) => {
                    self.outbound_ctx.lock().await.start_phase = StartPhase::Started;

                    info!(device_id = self.device_id.as_str(), "Crypto coordinator started");

                    let backup =
                        self.backup_delegate.read().expect("the delegate lock is poisoned").clone();
                    if let Some(backup) = backup {
                        backup.check_backup();
                    }

                    if let Err(e) = self.outgoing_requests.send_outgoing_requests().await {
                        warn!(error = ?e, "Failed to drain the outgoing key request queue");
                    }

                    if is_initial_sync {
                        self.device_list.invalidate_all_device_lists().await?;
                        self.device_list.refresh_outdated_device_lists(None).await?;
                    } else if let Err(e) = self.process_incoming_key_requests().await {
                        warn!(error = ?e, "Failed to drain the incoming key request queue");
                    }

                    return Ok(());
                }
                Err(CoordinatorError::Client(e)) => {
                    warn!(error = ?e, "Startup failed, retrying shortly");
                    self.outbound_ctx.lock().await.start_phase = StartPhase::Idle;
                    drop(guard);
                    tokio::time::sleep(STARTUP_RETRY_DELAY).await;
                }
                Err(e) => {
                    self.outbound_ctx.lock().await.start_phase = StartPhase::Idle;
                    return Err(e);
                }
            }
        }
    }

    /// The strictly ordered startup tasks: device-key upload, then one-time
    /// key replenishment.
    async fn run_startup(&self) -> Result<(), CoordinatorError> {
        let device_keys =
            self.account.device_keys().await.map_err(SignatureError::CanonicalJsonError)?;

        let response = self
            .client
            .upload_keys(KeysUploadRequest::new(Some(device_keys), None))
            .await?;

        self.account.mark_as_shared();
        self.store.save_account(self.account.clone()).await?;

        {
            let mut ctx = self.outbound_ctx.lock().await;
            ctx.one_time_key_count = Some(response.signed_curve25519_count().unwrap_or(0));
        }

        self.replenish_one_time_keys().await?;

        Ok(())
    }

    /// Handle the changes of a completed sync.
    ///
    /// Non-essential work (one-time keys, key request queues) is deferred
    /// while the client is catching up to avoid upload storms.
    pub async fn on_sync_completed(
        &self,
        changes: SyncChanges,
        from_token: Option<&str>,
        is_catching_up: bool,
    ) -> Result<(), CoordinatorError> {
        if self.is_closed() {
            return Ok(());
        }

        for event in changes.to_device_events {
            if let Err(e) = self.handle_to_device_event(event).await {
                warn!(error = ?e, "Failed to handle a to-device event");
            }
        }

        if let Some(count) = changes.one_time_key_count {
            self.outbound_ctx.lock().await.one_time_key_count = Some(count);
        }

        self.device_list.mark_tracked_users_dirty(changes.device_lists.changed.iter()).await?;
        self.device_list.untrack_users(changes.device_lists.left.iter()).await?;

        if !self.is_started().await {
            return Ok(());
        }

        if let Err(e) = self.device_list.refresh_outdated_device_lists(from_token).await {
            warn!(error = ?e, "Failed to refresh stale device lists, will retry on the next sync");
        }

        if is_catching_up {
            return Ok(());
        }

        if let Err(e) = self.replenish_one_time_keys().await {
            warn!(error = ?e, "Failed to replenish one-time keys, will retry on the next sync");
        }

        self.process_incoming_key_requests().await?;

        if let Err(e) = self.outgoing_requests.send_outgoing_requests().await {
            warn!(error = ?e, "Failed to drain the outgoing key request queue");
        }

        Ok(())
    }

    /// Dispatch a single inbound to-device event to its owning component.
    async fn handle_to_device_event(&self, event: AnyToDeviceEvent) -> Result<(), CoordinatorError> {
        match event {
            AnyToDeviceEvent::Encrypted(e) => {
                let (sender_key, payload) = match self.decrypt_to_device_event(&e).await {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(
                            sender = e.sender.as_str(),
                            error = ?err,
                            "Failed to decrypt a to-device event"
                        );
                        return Ok(());
                    }
                };

                self.handle_decrypted_to_device_payload(&e.sender, &sender_key, payload).await
            }
            AnyToDeviceEvent::RoomKey(e) => {
                warn!(
                    sender = e.sender.as_str(),
                    "Received an unencrypted m.room_key event, dropping it"
                );
                Ok(())
            }
            AnyToDeviceEvent::ForwardedRoomKey(e) => {
                warn!(
                    sender = e.sender.as_str(),
                    "Received an unencrypted m.forwarded_room_key event, dropping it"
                );
                Ok(())
            }
            AnyToDeviceEvent::RoomKeyRequest(e) => {
                let mut ctx = self.outbound_ctx.lock().await;

                match e.content.action {
                    KeyRequestAction::Request => {
                        if let Some(body) = e.content.body {
                            ctx.incoming_key_requests.push(IncomingRoomKeyRequest {
                                request_id: e.content.request_id,
                                user_id: e.sender,
                                device_id: e.content.requesting_device_id,
                                body,
                            });
                        }
                    }
                    KeyRequestAction::CancelRequest => {
                        ctx.incoming_cancellations.push(IncomingRequestCancellation {
                            request_id: e.content.request_id,
                            user_id: e.sender,
                            device_id: e.content.requesting_device_id,
                        });
                    }
                }

                Ok(())
            }
            AnyToDeviceEvent::Verification(e) => {
                let delegate = self
                    .verification_delegate
                    .read()
                    .expect("the delegate lock is poisoned")
                    .clone();

                if let Some(delegate) = delegate {
                    delegate.on_verification_event(&e.sender, &e.content);
                }

                Ok(())
            }
        }
    }

    /// Decrypt an Olm-encrypted to-device event addressed to us.
    ///
    /// Returns the sender's curve25519 key together with the decrypted
    /// payload after the payload's sender and recipient bindings have been
    /// checked.
    async fn decrypt_to_device_event(
        &self,
        event: &ToDeviceEvent<OlmV1Content>,
    ) -> OlmResult<(String, Value)> {
        let content = &event.content;

        let own_key = self.account.curve25519_key();
        let own_ciphertext =
            content.ciphertext.get(own_key).ok_or(EventError::MissingCiphertext)?;

        let message_type: usize = own_ciphertext.message_type.into();
        let message =
            OlmMessage::from_type_and_ciphertext(message_type, own_ciphertext.body.clone())
                .map_err(|_| EventError::UnsupportedOlmType)?;

        let plaintext =
            self.decrypt_olm_message(&event.sender, &content.sender_key, message).await?;

        let payload: Value = serde_json::from_str(&plaintext)?;

        let claimed_sender = payload.get("sender").and_then(|s| s.as_str()).unwrap_or_default();
        if claimed_sender != event.sender.as_str() {
            return Err(EventError::MismatchedSender(
                claimed_sender.to_owned(),
                event.sender.to_string(),
            )
            .into());
        }

        let recipient = payload.get("recipient").and_then(|r| r.as_str()).unwrap_or_default();
        let recipient_key = payload
            .get("recipient_keys")
            .and_then(|k| k.get("ed25519"))
            .and_then(|k| k.as_str())
            .unwrap_or_default();

        if recipient != self.user_id.as_str() || recipient_key != self.account.ed25519_key() {
            return Err(EventError::MismatchedKeys.into());
        }

        Ok((content.sender_key.clone(), payload))
    }

    /// Decrypt an Olm message with an existing session, or establish the
    /// inbound session a pre-key message carries.
    async fn decrypt_olm_message(
        &self,
        sender: &UserId,
        sender_key: &str,
        message: OlmMessage,
    ) -> OlmResult<String> {
        if let Some(sessions) = self.store.get_sessions(sender_key).await? {
            let sessions: Vec<Session> = sessions.lock().await.clone();

            for mut session in sessions {
                let mut matches = false;

                if let OlmMessage::PreKey(m) = &message {
                    matches = session.matches(sender_key, m.clone()).await?;

                    if !matches {
                        continue;
                    }
                }

                match session.decrypt(message.clone()).await {
                    Ok(plaintext) => {
                        self.store.save_sessions(&[session]).await?;
                        return Ok(plaintext);
                    }
                    Err(_) => {
                        if matches {
                            return Err(OlmError::SessionWedged(
                                sender.clone(),
                                sender_key.to_owned(),
                            ));
                        }
                    }
                }
            }
        }

        match &message {
            OlmMessage::Message(_) => Err(OlmError::MissingSession),
            OlmMessage::PreKey(m) => {
                let mut session =
                    self.account.create_inbound_session(sender_key, m.clone()).await?;

                let plaintext = session.decrypt(message).await?;

                self.store.save_account(self.account.clone()).await?;
                self.store.save_sessions(&[session]).await?;

                Ok(plaintext)
            }
        }
    }

    /// Route a decrypted to-device payload to the component owning its
    /// event type.
    async fn handle_decrypted_to_device_payload(
        &self,
        sender: &UserId,
        sender_key: &str,
        payload: Value,
    ) -> Result<(), CoordinatorError> {
        let event_type =
            payload.get("type").and_then(|t| t.as_str()).unwrap_or_default().to_owned();
        let claimed_ed25519 = payload
            .get("keys")
            .and_then(|k| k.get("ed25519"))
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_owned();
        let content = payload.get("content").cloned().unwrap_or(Value::Null);

        match event_type.as_str() {
            "m.room_key" => {
                let content: RoomKeyContent =
                    serde_json::from_value(content).map_err(OlmError::JsonError)?;

                let decryptor = match self
                    .decryptor_for_room(&content.room_id, &content.algorithm)
                {
                    Some(d) => d,
                    None => {
                        warn!(
                            algorithm = %content.algorithm,
                            "Received a room key for an unsupported algorithm"
                        );
                        return Ok(());
                    }
                };

                decryptor
                    .on_room_key_event(sender_key, &claimed_ed25519, content)
                    .await
                    .map_err(CoordinatorError::Megolm)
            }
            "m.forwarded_room_key" => {
                let content: ForwardedRoomKeyContent =
                    serde_json::from_value(content).map_err(OlmError::JsonError)?;

                let decryptor = match self
                    .decryptor_for_room(&content.room_id, &content.algorithm)
                {
                    Some(d) => d,
                    None => {
                        warn!(
                            algorithm = %content.algorithm,
                            "Received a forwarded room key for an unsupported \
                             algorithm"
                        );
                        return Ok(());
                    }
                };

                decryptor
                    .on_forwarded_room_key_event(sender_key, content)
                    .await
                    .map_err(CoordinatorError::Megolm)
            }
            _ => {
                warn!(
                    sender = sender.as_str(),
                    event_type = event_type.as_str(),
                    "Received an unexpected encrypted to-device event"
                );
                Ok(())
            }
        }
    }

    /// Keep the number of published one-time keys at half of what the
    /// primitive can hold, leaving headroom for in-flight claims.
    ///
    /// Only one replenishment runs at a time and at most one per minute.
    pub(crate) async fn replenish_one_time_keys(&self) -> Result<(), CoordinatorError> {
        {
            let mut ctx = self.outbound_ctx.lock().await;

            if ctx.otk_check_in_progress {
                return Ok(());
            }

            if let Some(last) = ctx.last_otk_check {
                if last.elapsed() < ONE_TIME_KEY_UPLOAD_PERIOD {
                    return Ok(());
                }
            }

            ctx.otk_check_in_progress = true;
        }

        let result = self.replenish_one_time_keys_helper().await;

        {
            let mut ctx = self.outbound_ctx.lock().await;
            ctx.otk_check_in_progress = false;

            if result.is_ok() {
                ctx.last_otk_check = Some(Instant::now());
            }
        }

        result
    }

    async fn replenish_one_time_keys_helper(&self) -> Result<(), CoordinatorError> {
        let max_keys = self.account.max_one_time_keys().await as u64;
        let target = max_keys / 2;

        let mut current = self.outbound_ctx.lock().await.one_time_key_count;

        if current.is_none() {
            // An empty upload teaches us the count the server holds.
            let response = self.client.upload_keys(KeysUploadRequest::default()).await?;
            let count = response.signed_curve25519_count().unwrap_or(0);
            self.outbound_ctx.lock().await.one_time_key_count = Some(count);
            current = Some(count);
        }

        let mut count = current.unwrap_or(0);

        while count < target {
            let to_generate: usize = std::cmp::min(
                ONE_TIME_KEY_GENERATION_MAX_NUMBER as u64,
                target - count,
            )
            .try_into()
            .unwrap_or(ONE_TIME_KEY_GENERATION_MAX_NUMBER);

            self.account.generate_one_time_keys(to_generate).await;

            let one_time_keys = self
                .account
                .signed_one_time_keys()
                .await
                .map_err(SignatureError::CanonicalJsonError)?;

            let response = self
                .client
                .upload_keys(KeysUploadRequest::new(None, Some(one_time_keys)))
                .await?;

            self.account.mark_keys_as_published().await;
            self.store.save_account(self.account.clone()).await?;

            let new_count = response.signed_curve25519_count().unwrap_or(count);

            if new_count <= count {
                warn!(
                    count = new_count,
                    "The one-time key count didn't grow after an upload, \
                     stopping the replenishment"
                );
                self.outbound_ctx.lock().await.one_time_key_count = Some(new_count);
                break;
            }

            count = new_count;
            self.outbound_ctx.lock().await.one_time_key_count = Some(count);

            debug!(count, target, "Uploaded a batch of one-time keys");
        }

        Ok(())
    }

    /// Enable encryption in the given room.
    ///
    /// The algorithm binding is write-once: a subsequent differing
    /// algorithm is logged and ignored. Every member's device list becomes
    /// tracked and stale; a refresh is triggered unless
    /// `inhibit_device_query` is set.
    pub async fn set_encryption_in_room(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
        inhibit_device_query: bool,
        members: &[UserId],
    ) -> Result<(), CoordinatorError> {
        if self.is_closed() {
            return Ok(());
        }

        let algorithm = settings.algorithm.clone();

        match self.store.get_room_algorithm(room_id).await? {
            Some(existing) if existing == algorithm => {}
            Some(existing) => {
                error!(
                    room_id = room_id.as_str(),
                    stored = %existing,
                    requested = %algorithm,
                    "Ignoring an attempt to change the encryption algorithm \
                     of an encrypted room"
                );
                return Ok(());
            }
            None => {
                if !self.registry.supports_encryption(&algorithm) {
                    return Err(CoordinatorError::UnsupportedAlgorithm(algorithm));
                }

                self.store.set_room_algorithm(room_id, algorithm.clone()).await?;
                info!(room_id = room_id.as_str(), algorithm = %algorithm, "Enabled encryption");
            }
        }

        if !self.encryptors.contains_key(room_id) {
            if let Some(encryptor) =
                self.registry.create_encryptor(&algorithm, room_id, settings)
            {
                self.encryptors.insert(room_id.clone(), encryptor);
            }
        }

        self.device_list.update_tracked_users(members.iter()).await?;
        self.device_list.mark_tracked_users_dirty(members.iter()).await?;

        if !inhibit_device_query {
            self.device_list.refresh_outdated_device_lists(None).await?;
        }

        Ok(())
    }

    /// Encrypt an event for the given room.
    ///
    /// Starts the coordinator first when that hasn't happened yet. The
    /// recipient set is the joined members, widened to invited members when
    /// both the configuration and the room allow it.
    pub async fn encrypt_event(
        &self,
        event_type: &str,
        content: Value,
        room: &RoomSnapshot,
    ) -> Result<EncryptedEventContent, CoordinatorError> {
        if self.is_closed() {
            return Err(CoordinatorError::Closed);
        }

        if !self.is_started().await {
            self.start(false).await?;
        }

        let recipients = room.recipients(self.config.encrypt_to_invited_members);

        let algorithm =
            self.store.get_room_algorithm(&room.room_id).await?.ok_or_else(|| {
                CoordinatorError::UnableToEncrypt(format!(
                    "encryption isn't enabled in the room {}",
                    room.room_id
                ))
            })?;

        let encryptor = match self.encryptors.get(&room.room_id) {
            Some(e) => e.clone(),
            None => {
                let settings =
                    EncryptionSettings { algorithm: algorithm.clone(), ..Default::default() };

                let encryptor = self
                    .registry
                    .create_encryptor(&algorithm, &room.room_id, settings)
                    .ok_or(CoordinatorError::UnsupportedAlgorithm(algorithm))?;

                self.encryptors.insert(room.room_id.clone(), encryptor.clone());
                encryptor
            }
        };

        encryptor.encrypt(event_type, content, &recipients).await
    }

    /// Decrypt a room event.
    ///
    /// The `timeline_id` scopes the replay protection: a Megolm message
    /// index may be decrypted once per timeline, back-pagination into a
    /// fresh timeline legitimately decrypts it again.
    pub async fn decrypt_event(
        &self,
        event: &EncryptedEvent,
        timeline_id: &str,
    ) -> Result<DecryptionResult, CoordinatorError> {
        if self.is_closed() {
            return Err(CoordinatorError::Closed);
        }

        let algorithm = event.content.algorithm();

        let decryptor = self
            .decryptor_for_room(&event.room_id, &algorithm)
            .ok_or(CoordinatorError::UnsupportedAlgorithm(algorithm))?;

        decryptor.decrypt_event(event, timeline_id).await.map_err(CoordinatorError::Megolm)
    }

    /// Clear the replay cache of the given timeline. Invoked by the host
    /// when a timeline is discarded.
    pub fn reset_replay_attack_check_in_timeline(&self, timeline_id: &str) {
        self.replay.reset_timeline(timeline_id);
    }

    fn decryptor_for_room(
        &self,
        room_id: &RoomId,
        algorithm: &EventEncryptionAlgorithm,
    ) -> Option<Arc<dyn RoomDecryptor>> {
        if let Some(decryptor) = self.decryptors.get(room_id) {
            if decryptor.algorithm() == *algorithm {
                return Some(decryptor.clone());
            }

            return None;
        }

        let decryptor = self.registry.create_decryptor(algorithm, room_id)?;
        self.decryptors.insert(room_id.clone(), decryptor.clone());

        Some(decryptor)
    }

    /// Make sure we share an Olm session with each of the given devices,
    /// claiming one-time keys for the missing ones.
    ///
    /// Returns the map of usable session ids per device.
    pub async fn ensure_olm_sessions_for_devices(
        &self,
        devices: &[DeviceIdentity],
    ) -> Result<BTreeMap<UserId, BTreeMap<DeviceIdBox, String>>, CoordinatorError> {
        if self.is_closed() {
            return Ok(BTreeMap::new());
        }

        self.session_manager.ensure_sessions_for_devices(devices).await
    }

    /// Olm-encrypt the given content for each of the given devices.
    ///
    /// Devices without an established Olm session are skipped.
    pub async fn encrypt_message(
        &self,
        devices: Vec<DeviceIdentity>,
        event_type: &str,
        content: &Value,
    ) -> Result<Vec<(DeviceIdentity, Value)>, CoordinatorError> {
        self.session_manager.encrypt_for_devices(devices, event_type, content).await
    }

    /// React to a room membership change in an encryption-active room.
    ///
    /// Joining users and, when the invitee policy allows it, invited users
    /// have their device lists tracked from this point on.
    pub async fn on_room_membership_change(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: MembershipState,
        room_allows_invitee_encryption: bool,
    ) -> Result<(), CoordinatorError> {
        if self.store.get_room_algorithm(room_id).await?.is_none() {
            return Ok(());
        }

        match membership {
            MembershipState::Join => {
                self.device_list.update_tracked_users([user_id.clone()].iter()).await?;
            }
            MembershipState::Invite
                if self.config.encrypt_to_invited_members && room_allows_invitee_encryption =>
            {
                self.device_list.update_tracked_users([user_id.clone()].iter()).await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Drain the queue of incoming room key requests.
    ///
    /// Requests from verified devices of our own user are served right
    /// away; blocked devices are refused; everything else is persisted and
    /// surfaced to the registered listeners for a user decision.
    async fn process_incoming_key_requests(&self) -> Result<(), CoordinatorError> {
        let (requests, cancellations) = {
            let mut ctx = self.outbound_ctx.lock().await;
            (mem::take(&mut ctx.incoming_key_requests), mem::take(&mut ctx.incoming_cancellations))
        };

        for request in requests {
            if let Err(e) = self.triage_incoming_key_request(request).await {
                warn!(error = ?e, "Failed to triage an incoming room key request");
            }
        }

        for cancellation in cancellations {
            let persisted = self.store.get_incoming_key_requests().await?;

            for request in persisted {
                if request.request_id == cancellation.request_id
                    && request.user_id == cancellation.user_id
                    && request.device_id == cancellation.device_id
                {
                    self.store.delete_incoming_key_request(&request).await?;
                }
            }

            let listeners =
                self.key_request_listeners.read().expect("the listener lock is poisoned").clone();
            for listener in listeners {
                listener.on_room_key_request_cancellation(&cancellation);
            }
        }

        Ok(())
    }

    async fn triage_incoming_key_request(
        &self,
        request: IncomingRoomKeyRequest,
    ) -> Result<(), CoordinatorError> {
        // Cross-user sharing has no policy surface, the request is dropped.
        if request.user_id != *self.user_id {
            info!(
                user_id = request.user_id.as_str(),
                "Ignoring a room key request from another user"
            );
            return Ok(());
        }

        let body = &request.body;

        let decryptor = match self.decryptor_for_room(&body.room_id, &body.algorithm) {
            Some(d) => d,
            None => {
                debug!(
                    room_id = body.room_id.as_str(),
                    algorithm = %body.algorithm,
                    "Dropping a room key request we have no decryptor for"
                );
                return Ok(());
            }
        };

        if !decryptor.has_keys_for_request(body).await? {
            self.store.delete_incoming_key_request(&request).await?;
            return Ok(());
        }

        if request.device_id.as_str() == self.device_id.as_str() {
            self.store.delete_incoming_key_request(&request).await?;
            return Ok(());
        }

        let device = match self.store.get_device(&request.user_id, &request.device_id).await? {
            Some(d) => d,
            None => {
                warn!(
                    user_id = request.user_id.as_str(),
                    device_id = request.device_id.as_str(),
                    "Dropping a room key request from an unknown device"
                );
                return Ok(());
            }
        };

        if device.is_blocked() {
            self.store.delete_incoming_key_request(&request).await?;
            return Ok(());
        }

        if device.is_verified() {
            decryptor.share_keys_with_device(&request, device).await?;
            self.store.delete_incoming_key_request(&request).await?;
            return Ok(());
        }

        self.store.save_incoming_key_request(request.clone()).await?;

        let listeners =
            self.key_request_listeners.read().expect("the listener lock is poisoned").clone();
        for listener in listeners {
            listener.on_room_key_request(&request);
        }

        Ok(())
    }

    /// Serve a pending room key request: share the keys and forget the
    /// request.
    pub async fn accept_key_request(
        &self,
        request: &IncomingRoomKeyRequest,
    ) -> Result<(), CoordinatorError> {
        if self.is_closed() {
            return Ok(());
        }

        let decryptor =
            match self.decryptor_for_room(&request.body.room_id, &request.body.algorithm) {
                Some(d) => d,
                None => {
                    self.store.delete_incoming_key_request(request).await?;
                    return Ok(());
                }
            };

        if let Some(device) =
            self.store.get_device(&request.user_id, &request.device_id).await?
        {
            decryptor.share_keys_with_device(request, device).await?;
        }

        self.store.delete_incoming_key_request(request).await?;
        Ok(())
    }

    /// Refuse a pending room key request and forget it.
    pub async fn ignore_key_request(
        &self,
        request: &IncomingRoomKeyRequest,
    ) -> Result<(), CoordinatorError> {
        self.store.delete_incoming_key_request(request).await?;
        Ok(())
    }

    /// Queue an outgoing room key request.
    pub async fn request_room_key(
        &self,
        body: RequestedKeyInfo,
        recipients: BTreeMap<UserId, Vec<DeviceIdBox>>,
    ) -> Result<(), CoordinatorError> {
        if self.is_closed() {
            return Ok(());
        }

        self.outgoing_requests.request_room_key(body, recipients).await?;

        if self.is_started().await {
            if let Err(e) = self.outgoing_requests.send_outgoing_requests().await {
                warn!(error = ?e, "Failed to send the queued room key request");
            }
        }

        Ok(())
    }

    /// Cancel a previously queued room key request.
    pub async fn cancel_room_key_request(
        &self,
        body: &RequestedKeyInfo,
    ) -> Result<(), CoordinatorError> {
        if self.is_closed() {
            return Ok(());
        }

        self.outgoing_requests.cancel_room_key_request(body).await?;

        if self.is_started().await {
            if let Err(e) = self.outgoing_requests.send_outgoing_requests().await {
                warn!(error = ?e, "Failed to send the queued cancellation");
            }
        }

        Ok(())
    }

    /// Cancel and re-send the room key request for the session the given
    /// event was encrypted with.
    pub async fn re_request_room_key_for_event(
        &self,
        event: &EncryptedEvent,
    ) -> Result<(), CoordinatorError> {
        let content = match &event.content {
            EncryptedEventContent::MegolmV1AesSha2(c) => c,
            _ => {
                return Err(CoordinatorError::UnableToEncrypt(
                    "only Megolm events have re-requestable room keys".to_owned(),
                ))
            }
        };

        let body = RequestedKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: event.room_id.clone(),
            sender_key: content.sender_key.clone(),
            session_id: content.session_id.clone(),
        };

        let mut recipients: BTreeMap<UserId, Vec<DeviceIdBox>> = BTreeMap::new();

        let own_devices: Vec<DeviceIdBox> = self
            .store
            .get_user_devices(&self.user_id)
            .await?
            .devices()
            .filter(|d| d.device_id() != self.device_id.as_ref())
            .map(|d| d.device_id().to_owned())
            .collect();

        if !own_devices.is_empty() {
            recipients.insert((*self.user_id).clone(), own_devices);
        }

        if event.sender != *self.user_id {
            let sender_devices: Vec<DeviceIdBox> = self
                .store
                .get_user_devices(&event.sender)
                .await?
                .devices()
                .map(|d| d.device_id().to_owned())
                .collect();

            if !sender_devices.is_empty() {
                recipients.insert(event.sender.clone(), sender_devices);
            }
        }

        self.cancel_room_key_request(&body).await?;
        self.request_room_key(body, recipients).await
    }

    /// Force a device-list download for the given users and fail with
    /// [`CoordinatorError::UnknownDevices`] when any of their devices was
    /// never seen by the user.
    ///
    /// Host UIs use this as the "new devices detected" gate before sending.
    pub async fn check_unknown_devices(
        &self,
        user_ids: &[UserId],
    ) -> Result<(), CoordinatorError> {
        self.device_list.download_device_lists(user_ids.to_vec(), None).await?;

        let mut unknown: BTreeMap<UserId, Vec<DeviceIdBox>> = BTreeMap::new();

        for user_id in user_ids {
            for device in self.store.get_user_devices(user_id).await?.devices() {
                if device.is_unknown() {
                    unknown
                        .entry(user_id.clone())
                        .or_default()
                        .push(device.device_id().to_owned());
                }
            }
        }

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(CoordinatorError::UnknownDevices(unknown))
        }
    }

    /// Update the verification state of a device.
    pub async fn set_device_verification(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        state: VerificationState,
    ) -> Result<(), CoordinatorError> {
        if let Some(device) = self.store.get_device(user_id, device_id).await? {
            if device.verification_state() != state {
                device.set_verification_state(state);
                self.store.save_devices(&[device]).await?;
            }
        } else {
            warn!(
                user_id = user_id.as_str(),
                device_id = device_id.as_str(),
                "Can't set the verification state of an unknown device"
            );
        }

        Ok(())
    }

    /// Mark the given devices as seen: every device still in the UNKNOWN
    /// state moves to UNVERIFIED.
    ///
    /// Note that this quietly downgrades verification discipline: a device
    /// the user merely dismissed is afterwards treated like one they
    /// actively chose not to verify.
    pub async fn set_devices_known(
        &self,
        devices: &[(UserId, DeviceIdBox)],
    ) -> Result<(), CoordinatorError> {
        for (user_id, device_id) in devices {
            if let Some(device) = self.store.get_device(user_id, device_id).await? {
                if device.is_unknown() {
                    device.set_verification_state(VerificationState::Unverified);
                    self.store.save_devices(&[device]).await?;
                }
            }
        }

        Ok(())
    }

    /// Is the global switch excluding unverified devices from key
    /// distribution set.
    pub async fn global_blacklist_unverified_devices(&self) -> Result<bool, CoordinatorError> {
        Ok(self.store.get_global_blacklist_unverified_devices().await?)
    }

    /// Set the global switch excluding unverified devices from key
    /// distribution.
    pub async fn set_global_blacklist_unverified_devices(
        &self,
        blacklist: bool,
    ) -> Result<(), CoordinatorError> {
        Ok(self.store.set_global_blacklist_unverified_devices(blacklist).await?)
    }

    /// Are unverified devices excluded from key distribution in the given
    /// room.
    pub async fn room_blacklist_unverified_devices(
        &self,
        room_id: &RoomId,
    ) -> Result<bool, CoordinatorError> {
        Ok(self.store.get_room_blacklist_unverified_devices().await?.contains(room_id))
    }

    /// Include or exclude unverified devices from key distribution in the
    /// given room.
    pub async fn set_room_blacklist_unverified_devices(
        &self,
        room_id: &RoomId,
        blacklist: bool,
    ) -> Result<(), CoordinatorError> {
        Ok(self.store.set_room_blacklist_unverified_devices(room_id, blacklist).await?)
    }

    /// Export all held inbound group sessions, encrypted with the given
    /// passphrase.
    ///
    /// An iteration count of zero skips the encryption and yields the
    /// plain serialized key list.
    pub async fn export_room_keys(
        &self,
        passphrase: &str,
        rounds: u32,
    ) -> Result<Vec<u8>, CoordinatorError> {
        if self.is_closed() {
            return Ok(Vec::new());
        }

        let sessions = self.store.get_inbound_group_sessions().await?;
        let exported = join_all(sessions.iter().map(|s| s.export())).await;

        let serialized = serde_json::to_string(&exported).map_err(OlmError::JsonError)?;

        if rounds == 0 {
            return Ok(serialized.into_bytes());
        }

        Ok(encrypt_key_export(&serialized, passphrase, rounds)?.into_bytes())
    }

    /// Import room keys from a previous export.
    ///
    /// Every imported session cancels a matching outstanding room key
    /// request and notifies the room's decryptor so queued undecrypted
    /// events can be retried. `progress` is reported in integer percent.
    pub async fn import_room_keys(
        &self,
        data: &[u8],
        passphrase: &str,
        back_up_keys: bool,
        progress: Option<Box<dyn Fn(usize) + Send + Sync>>,
    ) -> Result<RoomKeyImportResult, CoordinatorError> {
        if self.is_closed() {
            return Ok(RoomKeyImportResult {
                imported_count: 0,
                total_count: 0,
                keys: BTreeMap::new(),
            });
        }

        let serialized = if is_key_export(data) {
            decrypt_key_export(data, passphrase)?
        } else {
            String::from_utf8(data.to_vec())
                .map_err(|_| crate::file_encryption::KeyExportError::InvalidData)?
        };

        let exported: Vec<crate::olm::ExportedRoomKey> =
            serde_json::from_str(&serialized).map_err(OlmError::JsonError)?;

        let total_count = exported.len();
        let mut imported_count = 0;
        let mut keys: BTreeMap<RoomId, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();
        let mut last_reported_percent = 0;

        for (index, key) in exported.into_iter().enumerate() {
            let body = RequestedKeyInfo {
                algorithm: key.algorithm.clone(),
                room_id: key.room_id.clone(),
                sender_key: key.sender_key.clone(),
                session_id: key.session_id.clone(),
            };

            let session = match InboundGroupSession::from_export(key) {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        session_id = body.session_id.as_str(),
                        error = ?e,
                        "Couldn't import a room key"
                    );
                    continue;
                }
            };

            let existing = self
                .store
                .get_inbound_group_session(
                    session.room_id(),
                    session.sender_key(),
                    session.session_id(),
                )
                .await?;

            let is_better_copy = existing
                .map(|e| e.first_known_index() <= session.first_known_index())
                .unwrap_or(false);

            if !is_better_copy {
                if !back_up_keys {
                    session.mark_as_backed_up();
                }

                keys.entry(session.room_id().clone())
                    .or_default()
                    .entry(session.sender_key().to_owned())
                    .or_default()
                    .insert(session.session_id().to_owned());

                let room_id = session.room_id().clone();
                let sender_key = session.sender_key().to_owned();
                let session_id = session.session_id().to_owned();

                self.store.save_inbound_group_sessions(&[session]).await?;

                self.outgoing_requests.cancel_room_key_request(&body).await?;
                self.new_session_notifier.notify(&room_id, &sender_key, &session_id);

                imported_count += 1;
            }

            if let Some(report) = &progress {
                let percent = (index + 1) * 100 / total_count;
                if percent != last_reported_percent {
                    report(percent);
                    last_reported_percent = percent;
                }
            }
        }

        info!(imported_count, total_count, "Finished importing room keys");

        if back_up_keys && imported_count > 0 {
            let backup =
                self.backup_delegate.read().expect("the delegate lock is poisoned").clone();
            if let Some(backup) = backup {
                backup.on_keys_imported();
            }
        }

        Ok(RoomKeyImportResult { imported_count, total_count, keys })
    }

    /// Shut the coordinator down.
    ///
    /// Listeners are detached and every further call is a no-op. The stored
    /// identity is intentionally kept: a subsequent instantiation over the
    /// same store resumes with the same device.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(device_id = self.device_id.as_str(), "Closing the crypto coordinator");

        self.new_session_notifier.clear();
        self.key_request_listeners.write().expect("the listener lock is poisoned").clear();
        *self.verification_delegate.write().expect("the delegate lock is poisoned") = None;
        *self.backup_delegate.write().expect("the delegate lock is poisoned") = None;
        self.encryptors.clear();
        self.decryptors.clear();
    }
}

#[cfg(test)]
mod test {
    use std::{convert::TryFrom, sync::{Arc, Mutex as StdMutex}};

    use matches::assert_matches;
    use ruma::{room_id, user_id, EventEncryptionAlgorithm, EventId, RoomId, UserId};
    use serde_json::{json, Value};

    use super::{CoordinatorConfig, CryptoCoordinator};
    use crate::{
        algorithms::NewSessionListener,
        error::{CoordinatorError, MegolmError},
        events::{
            AnyToDeviceEvent, EncryptedEvent, EncryptedEventContent, KeyRequestAction,
            RequestedKeyInfo, RoomKeyRequestContent, RoomSnapshot, SyncChanges, ToDeviceEvent,
        },
        identities::{DeviceIdentity, VerificationState},
        key_request::IncomingRoomKeyRequest,
        olm::{Account, EncryptionSettings},
        store::{CryptoStore, MemoryStore},
        testing::{claim_response_for_accounts, MockClient},
    };

    fn alice_id() -> UserId {
        user_id!("@alice:example.org")
    }

    fn bob_id() -> UserId {
        user_id!("@bob:example.org")
    }

    fn room() -> RoomId {
        room_id!("!test:example.org")
    }

    fn snapshot(members: Vec<UserId>) -> RoomSnapshot {
        RoomSnapshot {
            room_id: room(),
            joined_members: members,
            invited_members: Vec::new(),
            allows_encrypting_for_invited_members: false,
        }
    }

    async fn coordinator(
        user_id: &UserId,
        device_id: Option<&str>,
    ) -> (CryptoCoordinator, Arc<MemoryStore>, Arc<MockClient>) {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockClient::new());

        let machine = CryptoCoordinator::new(
            user_id,
            device_id.map(|d| d.into()),
            store.clone(),
            client.clone(),
            CoordinatorConfig::default(),
        )
        .await
        .unwrap();

        (machine, store, client)
    }

    /// Build a coordinator whose account is also accessible to the test, so
    /// the homeserver double can mint one-time keys and device keys for it.
    async fn coordinator_with_account(
        user_id: &UserId,
        device_id: &str,
    ) -> (CryptoCoordinator, Arc<MemoryStore>, Arc<MockClient>, Account) {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockClient::new());

        let account = Account::new(user_id, device_id.into());
        store.save_account(account.clone()).await.unwrap();

        let machine = CryptoCoordinator::new(
            user_id,
            None,
            store.clone(),
            client.clone(),
            CoordinatorConfig::default(),
        )
        .await
        .unwrap();

        (machine, store, client, account)
    }

    /// Extract the to-device events the given client captured for the given
    /// device.
    fn to_device_events_for(
        client: &MockClient,
        sender: &UserId,
        recipient: &Account,
    ) -> Vec<AnyToDeviceEvent> {
        let requests = client.to_device_requests();

        requests
            .iter()
            .flat_map(|request| {
                request
                    .messages
                    .get(recipient.user_id())
                    .and_then(|m| m.get(&recipient.device_id().to_owned()))
                    .and_then(|content| {
                        AnyToDeviceEvent::from_parts(
                            &request.event_type,
                            sender.clone(),
                            content.clone(),
                        )
                    })
            })
            .collect()
    }

    fn encrypted_event(sender: UserId, content: EncryptedEventContent) -> EncryptedEvent {
        EncryptedEvent {
            event_id: EventId::try_from("$WLGTSEFSEF:example.org").unwrap(),
            sender,
            room_id: room(),
            origin_server_ts: 1_632_491_098_485,
            content,
            unsigned: Value::Null,
        }
    }

    #[derive(Default)]
    struct SessionRecorder {
        sessions: StdMutex<Vec<(RoomId, String, String)>>,
    }

    impl NewSessionListener for SessionRecorder {
        fn on_new_session(&self, room_id: &RoomId, sender_key: &str, session_id: &str) {
            self.sessions.lock().unwrap().push((
                room_id.clone(),
                sender_key.to_owned(),
                session_id.to_owned(),
            ));
        }
    }

    #[tokio::test]
    async fn cold_start_generates_and_persists_a_device_id() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockClient::new());

        let machine = CryptoCoordinator::new(
            &alice_id(),
            None,
            store.clone(),
            client.clone(),
            CoordinatorConfig::default(),
        )
        .await
        .unwrap();

        // A freshly generated device id is a UUID.
        assert_eq!(machine.device_id().as_str().len(), 36);

        machine.start(false).await.unwrap();

        let uploads = client.upload_requests();
        let device_key_uploads =
            uploads.iter().filter(|u| u.device_keys.is_some()).count();
        assert_eq!(device_key_uploads, 1);

        let max = machine.account.max_one_time_keys().await as u64;
        assert_eq!(client.one_time_key_count(), max / 2);

        // A second coordinator over the same store resumes the identity.
        let reopened = CryptoCoordinator::new(
            &alice_id(),
            None,
            store,
            client,
            CoordinatorConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(machine.device_id(), reopened.device_id());
        assert_eq!(machine.identity_key(), reopened.identity_key());
    }

    #[tokio::test]
    async fn concurrent_starts_upload_device_keys_once() {
        let (machine, _, client) = coordinator(&alice_id(), Some("ALICEDEVICE")).await;

        let (first, second) = tokio::join!(machine.start(false), machine.start(false));
        first.unwrap();
        second.unwrap();

        let device_key_uploads = client
            .upload_requests()
            .iter()
            .filter(|u| u.device_keys.is_some())
            .count();
        assert_eq!(device_key_uploads, 1);
        assert!(machine.is_started().await);
    }

    #[tokio::test]
    async fn startup_retries_after_a_transport_failure() {
        let (machine, _, client) = coordinator(&alice_id(), Some("ALICEDEVICE")).await;

        client.fail_next_upload();
        machine.start(false).await.unwrap();

        assert!(machine.is_started().await);
        assert!(!client.upload_requests().is_empty());
    }

    #[tokio::test]
    async fn room_algorithm_is_write_once() {
        let (machine, store, _) = coordinator(&alice_id(), Some("ALICEDEVICE")).await;

        machine
            .set_encryption_in_room(&room(), EncryptionSettings::default(), true, &[alice_id()])
            .await
            .unwrap();

        // A differing algorithm is logged and ignored.
        let olm_settings = EncryptionSettings {
            algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            ..EncryptionSettings::default()
        };
        machine
            .set_encryption_in_room(&room(), olm_settings, true, &[alice_id()])
            .await
            .unwrap();

        assert_eq!(
            store.get_room_algorithm(&room()).await.unwrap(),
            Some(EventEncryptionAlgorithm::MegolmV1AesSha2)
        );

        // A room can't be bound to an algorithm nothing implements.
        let other_room = room_id!("!other:example.org");
        let olm_settings = EncryptionSettings {
            algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            ..EncryptionSettings::default()
        };

        assert_matches!(
            machine
                .set_encryption_in_room(&other_room, olm_settings, true, &[alice_id()])
                .await,
            Err(CoordinatorError::UnsupportedAlgorithm(_))
        );
    }

    /// Set up Alice and Bob so Alice can claim Bob's one-time keys and knows
    /// his device.
    async fn alice_and_bob() -> (
        CryptoCoordinator,
        Arc<MockClient>,
        CryptoCoordinator,
        Account,
    ) {
        let (alice, alice_store, alice_client) =
            coordinator(&alice_id(), Some("ALICEDEVICE")).await;
        let (bob, _, _, bob_account) =
            coordinator_with_account(&bob_id(), "BOBDEVICE").await;

        alice_store
            .save_devices(&[DeviceIdentity::from_account(&bob_account).await])
            .await
            .unwrap();

        alice_client.add_keys_claim_response(claim_response_for_accounts(&[&bob_account]).await);

        alice
            .set_encryption_in_room(
                &room(),
                EncryptionSettings::default(),
                true,
                &[alice_id(), bob_id()],
            )
            .await
            .unwrap();

        (alice, alice_client, bob, bob_account)
    }

    #[tokio::test]
    async fn olm_session_establishment_claims_a_single_key() {
        let (alice, alice_client, _bob, bob_account) = alice_and_bob().await;

        let bob_device = DeviceIdentity::from_account(&bob_account).await;
        let sessions = alice
            .ensure_olm_sessions_for_devices(&[bob_device.clone()])
            .await
            .unwrap();

        assert_eq!(alice_client.keys_claim_requests().len(), 1);
        assert!(sessions.get(&bob_id()).unwrap().contains_key(bob_account.device_id()));

        // The session is reused afterwards.
        let sessions = alice.ensure_olm_sessions_for_devices(&[bob_device]).await.unwrap();
        assert_eq!(alice_client.keys_claim_requests().len(), 1);
        assert!(sessions.get(&bob_id()).unwrap().contains_key(bob_account.device_id()));
    }

    #[tokio::test]
    async fn megolm_encrypt_then_decrypt() {
        let (alice, alice_client, bob, bob_account) = alice_and_bob().await;

        let content = alice
            .encrypt_event(
                "m.room.message",
                json!({ "msgtype": "m.text", "body": "hi" }),
                &snapshot(vec![alice_id(), bob_id()]),
            )
            .await
            .unwrap();

        let room_key_events = to_device_events_for(&alice_client, &alice_id(), &bob_account);
        assert_eq!(room_key_events.len(), 1);

        bob.on_sync_completed(
            SyncChanges { to_device_events: room_key_events, ..Default::default() },
            None,
            false,
        )
        .await
        .unwrap();

        let decrypted = bob.decrypt_event(&encrypted_event(alice_id(), content), "tl1").await.unwrap();

        assert_eq!(decrypted.clear_event["content"]["body"], "hi");
        assert_eq!(decrypted.clear_event["type"], "m.room.message");
        assert_eq!(decrypted.clear_event["sender"], alice_id().as_str());
        assert_eq!(decrypted.sender_curve25519_key, alice.identity_key());
    }

    #[tokio::test]
    async fn late_room_key_is_recovered_through_the_new_session_hook() {
        let (alice, alice_client, bob, bob_account) = alice_and_bob().await;

        let recorder = Arc::new(SessionRecorder::default());
        bob.register_new_session_listener(recorder.clone());

        let content = alice
            .encrypt_event(
                "m.room.message",
                json!({ "msgtype": "m.text", "body": "hi" }),
                &snapshot(vec![alice_id(), bob_id()]),
            )
            .await
            .unwrap();

        let event = encrypted_event(alice_id(), content);

        // The event arrives before its room key.
        assert_matches!(
            bob.decrypt_event(&event, "tl1").await,
            Err(CoordinatorError::Megolm(MegolmError::UnknownInboundSession))
        );

        let room_key_events = to_device_events_for(&alice_client, &alice_id(), &bob_account);
        bob.on_sync_completed(
            SyncChanges { to_device_events: room_key_events, ..Default::default() },
            None,
            false,
        )
        .await
        .unwrap();

        // The hook fired, the retry decrypts.
        assert_eq!(recorder.sessions.lock().unwrap().len(), 1);
        let decrypted = bob.decrypt_event(&event, "tl1").await.unwrap();
        assert_eq!(decrypted.clear_event["content"]["body"], "hi");
    }

    #[tokio::test]
    async fn replay_protection_is_scoped_to_a_timeline() {
        let (alice, alice_client, bob, bob_account) = alice_and_bob().await;

        let content = alice
            .encrypt_event(
                "m.room.message",
                json!({ "msgtype": "m.text", "body": "hi" }),
                &snapshot(vec![alice_id(), bob_id()]),
            )
            .await
            .unwrap();

        let room_key_events = to_device_events_for(&alice_client, &alice_id(), &bob_account);
        bob.on_sync_completed(
            SyncChanges { to_device_events: room_key_events, ..Default::default() },
            None,
            false,
        )
        .await
        .unwrap();

        let event = encrypted_event(alice_id(), content);

        bob.decrypt_event(&event, "tl1").await.unwrap();

        assert_matches!(
            bob.decrypt_event(&event, "tl1").await,
            Err(CoordinatorError::Megolm(MegolmError::Replay(_)))
        );

        // Back-pagination into a fresh timeline is legitimate.
        bob.decrypt_event(&event, "tl2").await.unwrap();

        // So is the original timeline after the host discarded it.
        bob.reset_replay_attack_check_in_timeline("tl1");
        bob.decrypt_event(&event, "tl1").await.unwrap();
    }

    #[tokio::test]
    async fn blacklisted_unverified_devices_receive_no_keys() {
        let (alice, alice_client, _bob, bob_account) = alice_and_bob().await;

        alice.set_global_blacklist_unverified_devices(true).await.unwrap();

        alice
            .encrypt_event(
                "m.room.message",
                json!({ "msgtype": "m.text", "body": "hi" }),
                &snapshot(vec![alice_id(), bob_id()]),
            )
            .await
            .unwrap();

        // No key material went to Bob's unverified device.
        assert!(to_device_events_for(&alice_client, &alice_id(), &bob_account).is_empty());
    }

    #[tokio::test]
    async fn key_request_from_a_verified_own_device_is_served() {
        let (alice, store, client) = coordinator(&alice_id(), Some("ALICEDEVICE")).await;

        let second_account = Account::new(&alice_id(), "SECONDDEVICE".into());
        let second_device = DeviceIdentity::from_account(&second_account).await;
        second_device.set_verification_state(VerificationState::Verified);
        store.save_devices(&[second_device]).await.unwrap();

        alice
            .set_encryption_in_room(&room(), EncryptionSettings::default(), true, &[alice_id()])
            .await
            .unwrap();

        let content = alice
            .encrypt_event(
                "m.room.message",
                json!({ "msgtype": "m.text", "body": "hi" }),
                &snapshot(vec![alice_id()]),
            )
            .await
            .unwrap();

        let (sender_key, session_id) = match &content {
            EncryptedEventContent::MegolmV1AesSha2(c) => {
                (c.sender_key.clone(), c.session_id.clone())
            }
            _ => panic!("the event should be Megolm encrypted"),
        };

        client.add_keys_claim_response(claim_response_for_accounts(&[&second_account]).await);

        let request = AnyToDeviceEvent::RoomKeyRequest(ToDeviceEvent {
            sender: alice_id(),
            content: RoomKeyRequestContent {
                action: KeyRequestAction::Request,
                requesting_device_id: "SECONDDEVICE".into(),
                request_id: "request_id_1".to_owned(),
                body: Some(RequestedKeyInfo {
                    algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
                    room_id: room(),
                    sender_key,
                    session_id,
                }),
            },
        });

        alice
            .on_sync_completed(
                SyncChanges { to_device_events: vec![request], ..Default::default() },
                None,
                false,
            )
            .await
            .unwrap();

        // The forward went out to the second device and nothing stayed
        // pending.
        let forwards = to_device_events_for(&client, &alice_id(), &second_account);
        assert_eq!(forwards.len(), 1);
        assert!(store.get_incoming_key_requests().await.unwrap().is_empty());
    }

    struct RequestRecorder {
        requests: StdMutex<Vec<IncomingRoomKeyRequest>>,
    }

    impl super::RoomKeyRequestListener for RequestRecorder {
        fn on_room_key_request(&self, request: &IncomingRoomKeyRequest) {
            self.requests.lock().unwrap().push(request.clone());
        }

        fn on_room_key_request_cancellation(
            &self,
            _: &crate::key_request::IncomingRequestCancellation,
        ) {
        }
    }

    #[tokio::test]
    async fn key_request_from_an_unverified_device_waits_for_the_user() {
        let (alice, store, client) = coordinator(&alice_id(), Some("ALICEDEVICE")).await;

        let recorder =
            Arc::new(RequestRecorder { requests: StdMutex::new(Vec::new()) });
        alice.add_room_key_request_listener(recorder.clone());

        let second_account = Account::new(&alice_id(), "SECONDDEVICE".into());
        let second_device = DeviceIdentity::from_account(&second_account).await;
        second_device.set_verification_state(VerificationState::Unverified);
        store.save_devices(&[second_device]).await.unwrap();

        alice
            .set_encryption_in_room(&room(), EncryptionSettings::default(), true, &[alice_id()])
            .await
            .unwrap();

        let content = alice
            .encrypt_event(
                "m.room.message",
                json!({ "msgtype": "m.text", "body": "hi" }),
                &snapshot(vec![alice_id()]),
            )
            .await
            .unwrap();

        let (sender_key, session_id) = match &content {
            EncryptedEventContent::MegolmV1AesSha2(c) => {
                (c.sender_key.clone(), c.session_id.clone())
            }
            _ => panic!("the event should be Megolm encrypted"),
        };

        let request = AnyToDeviceEvent::RoomKeyRequest(ToDeviceEvent {
            sender: alice_id(),
            content: RoomKeyRequestContent {
                action: KeyRequestAction::Request,
                requesting_device_id: "SECONDDEVICE".into(),
                request_id: "request_id_1".to_owned(),
                body: Some(RequestedKeyInfo {
                    algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
                    room_id: room(),
                    sender_key,
                    session_id,
                }),
            },
        });

        alice
            .on_sync_completed(
                SyncChanges { to_device_events: vec![request], ..Default::default() },
                None,
                false,
            )
            .await
            .unwrap();

        // The request is parked and surfaced to the listener.
        let pending = store.get_incoming_key_requests().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(recorder.requests.lock().unwrap().len(), 1);

        // The user accepts: the keys go out and the request is forgotten.
        client.add_keys_claim_response(claim_response_for_accounts(&[&second_account]).await);
        alice.accept_key_request(&pending[0]).await.unwrap();

        let forwards = to_device_events_for(&client, &alice_id(), &second_account);
        assert_eq!(forwards.len(), 1);
        assert!(store.get_incoming_key_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exported_keys_can_be_imported_elsewhere() {
        let (alice, _, bob, _) = alice_and_bob().await;

        let content = alice
            .encrypt_event(
                "m.room.message",
                json!({ "msgtype": "m.text", "body": "hi" }),
                &snapshot(vec![alice_id(), bob_id()]),
            )
            .await
            .unwrap();

        let export = alice.export_room_keys("passphrase", 10).await.unwrap();

        let progress = Arc::new(StdMutex::new(Vec::new()));
        let progress_clone = progress.clone();

        let result = bob
            .import_room_keys(
                &export,
                "passphrase",
                false,
                Some(Box::new(move |percent| {
                    progress_clone.lock().unwrap().push(percent);
                })),
            )
            .await
            .unwrap();

        assert_eq!(result.imported_count, 1);
        assert_eq!(result.total_count, 1);
        assert_eq!(progress.lock().unwrap().last(), Some(&100));

        // The imported session decrypts the event that was sent before.
        let decrypted = bob.decrypt_event(&encrypted_event(alice_id(), content), "tl1").await.unwrap();
        assert_eq!(decrypted.clear_event["content"]["body"], "hi");

        // Importing the same export again brings nothing new.
        let result = bob.import_room_keys(&export, "passphrase", false, None).await.unwrap();
        assert_eq!(result.imported_count, 0);
        assert_eq!(result.total_count, 1);
    }

    #[tokio::test]
    async fn unknown_devices_gate_before_sending() {
        let (alice, store, _) = coordinator(&alice_id(), Some("ALICEDEVICE")).await;

        let bob_account = Account::new(&bob_id(), "BOBDEVICE".into());
        let bob_device = DeviceIdentity::from_account(&bob_account).await;
        bob_device.set_verification_state(VerificationState::Unknown);
        store.save_devices(&[bob_device]).await.unwrap();

        let err = alice.check_unknown_devices(&[bob_id()]).await.unwrap_err();

        match err {
            CoordinatorError::UnknownDevices(unknown) => {
                assert_eq!(unknown.get(&bob_id()).unwrap().len(), 1);
            }
            e => panic!("expected an unknown devices error, got {:?}", e),
        }

        alice
            .set_devices_known(&[(bob_id(), "BOBDEVICE".into())])
            .await
            .unwrap();

        alice.check_unknown_devices(&[bob_id()]).await.unwrap();
    }

    #[tokio::test]
    async fn closed_coordinator_refuses_work() {
        let (alice, _, client) = coordinator(&alice_id(), Some("ALICEDEVICE")).await;

        alice.close();
        assert!(alice.is_closed());

        alice.start(false).await.unwrap();
        assert!(client.upload_requests().is_empty());

        assert_matches!(
            alice
                .encrypt_event("m.room.message", json!({}), &snapshot(vec![alice_id()]))
                .await,
            Err(CoordinatorError::Closed)
        );
    }
}
