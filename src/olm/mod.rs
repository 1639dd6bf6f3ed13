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

//! Wrappers around the Olm/Megolm primitive objects.

mod account;
mod group_sessions;
mod session;
mod utility;

use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serializer};

pub use account::{Account, PickledAccount};
pub use group_sessions::{
    EncryptionSettings, ExportedGroupSessionKey, ExportedRoomKey, GroupSessionKey,
    InboundGroupSession, OutboundGroupSession, PickledInboundGroupSession,
    PickledOutboundGroupSession, ShareState, SharedWith,
};
pub use session::{PickledSession, Session};
pub use utility::Utility;

pub(crate) fn serialize_instant<S>(instant: &Instant, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = instant.elapsed().as_millis() as u64;
    serializer.serialize_u64(millis)
}

pub(crate) fn deserialize_instant<'de, D>(deserializer: D) -> Result<Instant, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    let instant = Instant::now()
        .checked_sub(Duration::from_millis(millis))
        .unwrap_or_else(Instant::now);
    Ok(instant)
}
