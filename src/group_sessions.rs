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

//! Per-room group session policy.
//!
//! The engine knows how to create and drive group sessions; this module
//! decides which session a room currently uses. Rotation is always
//! explicit: discarding the room's session and letting the next encryption
//! create a fresh one. There is no implicit rotation, a higher layer
//! decides when membership changes or message counts call for one.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use vodozemac::Curve25519PublicKey;

use crate::{
    device::{DecryptedGroupMessage, MegolmDecryptionError, OlmDevice},
    events::{EncryptedRoomEvent, RoomKeyContent, MEGOLM_ALGORITHM},
    store::StoreError,
};

/// Error type describing how encrypting a room event can fail.
#[derive(Debug, Error)]
pub enum GroupEncryptionError {
    /// The room's outbound session disappeared mid-operation.
    #[error("the room has no active outbound group session")]
    MissingOutboundSession,
    /// The engine couldn't persist its state.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the manager remembers about a room's current outbound session.
///
/// Kept in memory only, like the session itself. Forgetting who already
/// received the key is harmless exactly because a restart discards the
/// session too.
struct OutboundSessionInfo {
    session_id: String,
    shared_with: HashSet<(String, String)>,
}

/// Creation, rotation, and sharing of outbound group sessions, and intake
/// of inbound ones.
pub struct GroupSessionManager {
    device: Arc<OlmDevice>,
    outbound: Mutex<HashMap<String, OutboundSessionInfo>>,
}

impl GroupSessionManager {
    pub fn new(device: Arc<OlmDevice>) -> Self {
        Self { device, outbound: Mutex::new(HashMap::new()) }
    }

    fn outbound(&self) -> std::sync::MutexGuard<'_, HashMap<String, OutboundSessionInfo>> {
        self.outbound.lock().expect("the outbound session map lock shouldn't be poisoned")
    }

    /// The id of the outbound session the room currently uses, if any.
    pub fn current_outbound_session(&self, room_id: &str) -> Option<String> {
        Some(self.outbound().get(room_id)?.session_id.clone())
    }

    /// Get or create the outbound session of a room.
    ///
    /// A fresh session is immediately installed as our own inbound session
    /// too, so the device can decrypt its own sent history. Nothing is
    /// persisted for the outbound side: a restart discards the session and
    /// thereby forces a rotation and a fresh share.
    pub fn ensure_outbound_session(&self, room_id: &str) -> Result<String, GroupEncryptionError> {
        let mut outbound = self.outbound();

        if let Some(info) = outbound.get(room_id) {
            return Ok(info.session_id.clone());
        }

        let session_id = self.device.create_outbound_group_session();
        let session_key = self
            .device
            .outbound_session_key(&session_id)
            .ok_or(GroupEncryptionError::MissingOutboundSession)?;

        let keys_claimed =
            BTreeMap::from([("ed25519".to_owned(), self.device.ed25519_key().to_base64())]);
        let added = self.device.add_inbound_group_session(
            &session_id,
            &session_key,
            room_id,
            self.device.curve25519_key(),
            keys_claimed,
        )?;

        if !added {
            warn!(
                room_id,
                %session_id,
                "Couldn't install our own inbound copy of a fresh outbound session"
            );
        }

        debug!(room_id, %session_id, "Created a fresh outbound group session for a room");
        outbound.insert(
            room_id.to_owned(),
            OutboundSessionInfo { session_id: session_id.clone(), shared_with: HashSet::new() },
        );

        Ok(session_id)
    }

    /// Discard the outbound session of a room.
    ///
    /// The next encryption in the room creates a fresh session that has to
    /// be shared again. Returns false if the room had no session.
    pub fn discard_outbound_session(&self, room_id: &str) -> bool {
        let Some(info) = self.outbound().remove(room_id) else {
            return false;
        };

        self.device.discard_outbound_group_session(&info.session_id);
        debug!(room_id, session_id = %info.session_id, "Discarded a room's outbound group session");

        true
    }

    /// Encrypt a payload with the room's outbound session, creating one if
    /// needed. Returns the session id and the ciphertext.
    pub fn encrypt(
        &self,
        room_id: &str,
        payload: &Value,
    ) -> Result<(String, String), GroupEncryptionError> {
        let session_id = self.ensure_outbound_session(room_id)?;
        let ciphertext = self
            .device
            .encrypt_group_message(&session_id, &payload.to_string())
            .ok_or(GroupEncryptionError::MissingOutboundSession)?;

        Ok((session_id, ciphertext))
    }

    /// The `m.room_key` content announcing the room's current outbound
    /// session, for sharing with recipient devices.
    pub fn room_key_content(&self, room_id: &str) -> Result<RoomKeyContent, GroupEncryptionError> {
        let session_id = self.ensure_outbound_session(room_id)?;
        let session_key = self
            .device
            .outbound_session_key(&session_id)
            .ok_or(GroupEncryptionError::MissingOutboundSession)?;

        Ok(RoomKeyContent {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            room_id: room_id.to_owned(),
            session_id,
            session_key,
        })
    }

    /// Record that the room's current session key reached a device.
    pub fn mark_shared_with(&self, room_id: &str, user_id: &str, device_id: &str) {
        if let Some(info) = self.outbound().get_mut(room_id) {
            info.shared_with.insert((user_id.to_owned(), device_id.to_owned()));
        }
    }

    /// Whether the room's current session key already reached a device.
    pub fn is_shared_with(&self, room_id: &str, user_id: &str, device_id: &str) -> bool {
        self.outbound()
            .get(room_id)
            .map(|info| info.shared_with.contains(&(user_id.to_owned(), device_id.to_owned())))
            .unwrap_or(false)
    }

    /// Install the session a decrypted `m.room_key` event announces.
    ///
    /// Returns false if the algorithm isn't Megolm or the engine refused
    /// the session.
    pub fn receive_room_key(
        &self,
        content: &RoomKeyContent,
        sender_key: Curve25519PublicKey,
        keys_claimed: BTreeMap<String, String>,
    ) -> Result<bool, StoreError> {
        if content.algorithm != MEGOLM_ALGORITHM {
            warn!(
                algorithm = %content.algorithm,
                "Ignoring a room key for an unsupported algorithm"
            );
            return Ok(false);
        }

        self.device.add_inbound_group_session(
            &content.session_id,
            &content.session_key,
            &content.room_id,
            sender_key,
            keys_claimed,
        )
    }

    /// Decrypt an encrypted room event with the announced inbound session.
    pub fn decrypt(
        &self,
        event: &EncryptedRoomEvent,
        timeline_id: Option<&str>,
    ) -> Result<DecryptedGroupMessage, MegolmDecryptionError> {
        let content = &event.content;

        if content.algorithm != MEGOLM_ALGORITHM {
            return Err(MegolmDecryptionError::UnsupportedAlgorithm(content.algorithm.clone()));
        }

        let sender_key = Curve25519PublicKey::from_base64(&content.sender_key)?;

        self.device.decrypt_group_message(
            &content.ciphertext,
            &event.room_id,
            timeline_id,
            &content.session_id,
            sender_key,
        )
    }
}
