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

use olm_rs::utility::OlmUtility;
use ruma::{DeviceKeyId, UserId};
use serde_json::Value;

use crate::error::{SignatureError, VerificationResult};

/// Signature verification over the canonicalized form of a signed JSON
/// object.
pub struct Utility {
    inner: OlmUtility,
}

impl std::fmt::Debug for Utility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Utility").finish()
    }
}

impl Default for Utility {
    fn default() -> Self {
        Self::new()
    }
}

impl Utility {
    pub fn new() -> Self {
        Self { inner: OlmUtility::new() }
    }

    /// Verify a signed JSON object.
    ///
    /// The signature is checked over the canonical representation of the
    /// object with the `signatures` and `unsigned` fields removed, against
    /// the signature found under `signatures.<user_id>.<key_id>`.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user that claims to have signed the object.
    ///
    /// * `key_id` - The id of the ed25519 key the object was signed with.
    ///
    /// * `signing_key` - The public ed25519 key to verify against.
    ///
    /// * `json` - The signed JSON object.
    pub fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        signing_key: &str,
        json: &mut Value,
    ) -> VerificationResult<()> {
        let json_object = json.as_object_mut().ok_or(SignatureError::NotAnObject)?;
        let unsigned = json_object.remove("unsigned");
        let signatures = json_object.remove("signatures");

        let canonical_json = cjson::to_string(json_object)?;

        if let Some(u) = unsigned {
            json_object.insert("unsigned".to_string(), u);
        }

        let signatures = signatures.ok_or(SignatureError::NoSignatureFound)?;
        let signature = signatures
            .get(user_id.to_string())
            .and_then(|u| u.get(key_id.to_string()))
            .and_then(|s| s.as_str())
            .ok_or(SignatureError::NoSignatureFound)?;

        let ret = if self
            .inner
            .ed25519_verify(signing_key, &canonical_json, signature.to_string())
            .is_ok()
        {
            Ok(())
        } else {
            Err(SignatureError::VerificationError)
        };

        json_object.insert("signatures".to_string(), signatures);

        ret
    }
}
