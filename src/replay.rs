// Copyright 2024 The Matrix.org Foundation C.I.C.
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
    collections::{HashMap, HashSet},
    sync::Mutex,
};

/// Per-timeline record of the group messages that were already decrypted.
///
/// A message is identified by its sender key, session id, and message index.
/// Within one timeline such a triple may be decrypted at most once, which
/// stops a homeserver from replaying old ciphertexts into a conversation.
/// The index is purely in-memory. Separate timelines over the same room
/// track independently, and dropping a timeline's record permits the
/// legitimate re-decryption that happens when the timeline is rebuilt.
#[derive(Debug, Default)]
pub(crate) struct ReplayIndex {
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl ReplayIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the message key in the given timeline.
    ///
    /// Returns true if this is the first time the key is seen in the
    /// timeline. The membership check and the insertion happen under a
    /// single lock acquisition.
    pub fn first_seen(&self, timeline_id: &str, key: String) -> bool {
        let mut seen = self.seen.lock().expect("the replay index lock shouldn't be poisoned");

        seen.entry(timeline_id.to_owned()).or_default().insert(key)
    }

    /// Forget everything that was decrypted in the given timeline.
    pub fn reset(&self, timeline_id: &str) {
        let mut seen = self.seen.lock().expect("the replay index lock shouldn't be poisoned");

        seen.remove(timeline_id);
    }
}
