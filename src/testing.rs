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

//! Test helpers: an in-memory homeserver double capturing every request the
//! coordinator makes, plus builders for the responses real accounts would
//! produce.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use ruma::DeviceKeyAlgorithm;

use crate::{
    olm::Account,
    requests::{
        ClientError, ClientResult, HomeserverClient, KeysClaimRequest, KeysClaimResponse,
        KeysQueryRequest, KeysQueryResponse, KeysUploadRequest, KeysUploadResponse,
        ToDeviceRequest,
    },
};

/// A homeserver double that records every request and serves canned or
/// simulated responses.
///
/// Key uploads are simulated faithfully: the double keeps a signed
/// curve25519 counter that grows with every uploaded key, the way a real
/// homeserver reports it back.
#[derive(Debug, Default)]
pub(crate) struct MockClient {
    uploads: Mutex<Vec<KeysUploadRequest>>,
    claims: Mutex<Vec<KeysClaimRequest>>,
    queries: Mutex<Vec<KeysQueryRequest>>,
    to_device: Mutex<Vec<ToDeviceRequest>>,
    claim_responses: Mutex<VecDeque<KeysClaimResponse>>,
    query_responses: Mutex<VecDeque<KeysQueryResponse>>,
    one_time_key_count: Mutex<u64>,
    fail_next_upload: AtomicBool,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next `claim_one_time_keys` call.
    pub fn add_keys_claim_response(&self, response: KeysClaimResponse) {
        self.claim_responses.lock().unwrap().push_back(response);
    }

    /// Queue a response for the next `query_keys` call.
    pub fn add_keys_query_response(&self, response: KeysQueryResponse) {
        self.query_responses.lock().unwrap().push_back(response);
    }

    /// Make the next `upload_keys` call fail with a transport error.
    pub fn fail_next_upload(&self) {
        self.fail_next_upload.store(true, Ordering::SeqCst);
    }

    pub fn upload_requests(&self) -> Vec<KeysUploadRequest> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn keys_claim_requests(&self) -> Vec<KeysClaimRequest> {
        self.claims.lock().unwrap().clone()
    }

    pub fn keys_query_requests(&self) -> Vec<KeysQueryRequest> {
        self.queries.lock().unwrap().clone()
    }

    pub fn to_device_requests(&self) -> Vec<ToDeviceRequest> {
        self.to_device.lock().unwrap().clone()
    }

    /// The simulated number of unclaimed signed curve25519 keys.
    pub fn one_time_key_count(&self) -> u64 {
        *self.one_time_key_count.lock().unwrap()
    }
}

#[async_trait]
impl HomeserverClient for MockClient {
    async fn upload_keys(&self, request: KeysUploadRequest) -> ClientResult<KeysUploadResponse> {
        if self.fail_next_upload.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Transport("connection refused".to_owned()));
        }

        let uploaded = request.one_time_keys.as_ref().map(|k| k.len() as u64).unwrap_or(0);
        self.uploads.lock().unwrap().push(request);

        let mut count = self.one_time_key_count.lock().unwrap();
        *count += uploaded;

        let mut one_time_key_counts = BTreeMap::new();
        one_time_key_counts.insert(DeviceKeyAlgorithm::SignedCurve25519, *count);

        Ok(KeysUploadResponse { one_time_key_counts })
    }

    async fn claim_one_time_keys(
        &self,
        request: KeysClaimRequest,
    ) -> ClientResult<KeysClaimResponse> {
        self.claims.lock().unwrap().push(request);

        Ok(self.claim_responses.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn query_keys(&self, request: KeysQueryRequest) -> ClientResult<KeysQueryResponse> {
        self.queries.lock().unwrap().push(request);

        Ok(self.query_responses.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn send_to_device(&self, request: ToDeviceRequest) -> ClientResult<()> {
        self.to_device.lock().unwrap().push(request);
        Ok(())
    }
}

/// Build the `query_keys` response a homeserver would serve for the given
/// accounts.
pub(crate) async fn response_for_accounts(accounts: &[&Account]) -> KeysQueryResponse {
    let mut device_keys: BTreeMap<_, BTreeMap<_, _>> = BTreeMap::new();

    for account in accounts {
        let keys = account.device_keys().await.expect("test accounts have signable keys");

        device_keys
            .entry(account.user_id().to_owned())
            .or_default()
            .insert(account.device_id().to_owned(), keys);
    }

    KeysQueryResponse { device_keys, failures: BTreeMap::new() }
}

/// Build the `claim_one_time_keys` response a homeserver would serve for
/// the given accounts, generating and publishing one fresh key each.
pub(crate) async fn claim_response_for_accounts(accounts: &[&Account]) -> KeysClaimResponse {
    let mut one_time_keys: BTreeMap<_, BTreeMap<_, _>> = BTreeMap::new();

    for account in accounts {
        account.generate_one_time_keys(1).await;
        let keys = account.signed_one_time_keys().await.expect("test accounts can sign keys");
        account.mark_keys_as_published().await;

        one_time_keys
            .entry(account.user_id().to_owned())
            .or_default()
            .insert(account.device_id().to_owned(), keys);
    }

    KeysClaimResponse { one_time_keys, failures: BTreeMap::new() }
}
