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

//! The cryptographic engine of a single device.
//!
//! [`OlmDevice`] owns the long-lived account and mediates every primitive
//! operation: identity and one-time keys, pairwise Olm sessions to other
//! devices, outbound and inbound Megolm group sessions, replay defence, and
//! signing. The account and the outbound group session cache live behind
//! one engine-wide mutex since the underlying primitive objects are not
//! reentrant. Pairwise and inbound group sessions are owned by the store;
//! the engine checks them out under a per-session lock for the span of a
//! single operation and writes them back, so traffic on unrelated sessions
//! proceeds in parallel.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use vodozemac::{
    megolm::{GroupSession, MegolmMessage, SessionKey},
    olm::{Account, OlmMessage, PreKeyMessage},
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature,
};

use crate::{
    canonical_json::{canonical_json, verify_signature, CanonicalJsonError, VerificationError},
    replay::ReplayIndex,
    store::{CryptoStore, StoreError},
    utilities, InboundGroupSession,
};

/// Error type describing how a pairwise operation can fail.
#[derive(Debug, Error)]
pub enum PairwiseError {
    /// The pre-key message didn't establish a session. A different one-time
    /// key may still work.
    #[error("the pre-key message didn't establish a session: {0}")]
    Creation(#[from] vodozemac::olm::SessionCreationError),
    /// The session exists but rejected the ciphertext.
    #[error("the session couldn't decrypt the message: {0}")]
    Olm(#[from] vodozemac::olm::DecryptionError),
    /// The session couldn't be loaded or persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error type describing how decrypting a group message can fail.
///
/// Every variant is scoped to the one event being decrypted; none of them
/// poisons the session or the engine.
#[derive(Debug, Error)]
pub enum MegolmDecryptionError {
    /// No inbound group session with this id is known for the sender. The
    /// key may simply not have arrived yet.
    #[error("no inbound group session with id {0} is known for the sender")]
    UnknownInboundSessionId(String),
    /// The session exists but belongs to another room. A homeserver must
    /// not be able to replay an event into a different room.
    #[error("the inbound group session is bound to room {expected}, the event claimed {got}")]
    RoomIdMismatch {
        /// The room the session was announced for.
        expected: String,
        /// The room the event claimed to be from.
        got: String,
    },
    /// The same message was already decrypted in this timeline.
    #[error("message index {0} was already decrypted in this timeline")]
    DuplicateMessageIndex(u32),
    /// The event used an algorithm this engine doesn't implement.
    #[error("the event used an unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// The sender key on the event wasn't a valid Curve25519 key.
    #[error("the event's sender key couldn't be decoded: {0}")]
    InvalidSenderKey(#[from] vodozemac::KeyError),
    /// The ciphertext wasn't a valid Megolm message.
    #[error("the ciphertext couldn't be decoded: {0}")]
    InvalidCiphertext(#[from] vodozemac::DecodeError),
    /// The ratchet rejected the message.
    #[error("the group message couldn't be decrypted: {0}")]
    Megolm(#[from] vodozemac::megolm::DecryptionError),
    /// The plaintext decrypted fine but wasn't a JSON object.
    #[error("the decrypted payload wasn't valid JSON")]
    MalformedPlaintext,
    /// The session couldn't be loaded or persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The result of decrypting a group message.
#[derive(Debug)]
pub struct DecryptedGroupMessage {
    /// The decrypted event payload.
    pub payload: Value,
    /// The Curve25519 key of the device that encrypted the message. The
    /// only proved identity: it is the key that persuaded us to store the
    /// session in the first place.
    pub sender_key: Curve25519PublicKey,
    /// The keys the sender claimed when the session was announced. Merely
    /// asserted, not proved.
    pub keys_claimed: BTreeMap<String, String>,
    /// The keys the decryption itself proves, keyed by algorithm name.
    pub keys_proved: BTreeMap<String, String>,
    /// The ratchet index of the message.
    pub message_index: u32,
}

/// The result of establishing an inbound pairwise session.
#[derive(Debug)]
pub struct InboundSessionResult {
    /// The decrypted payload of the pre-key message.
    pub payload: String,
    /// The id of the freshly created session.
    pub session_id: String,
}

/// The account and everything else the primitive library forbids touching
/// concurrently.
struct EngineState {
    account: Account,
    outbound_sessions: HashMap<String, GroupSession>,
}

/// The cryptographic engine owning the keys of this device.
pub struct OlmDevice {
    store: Arc<dyn CryptoStore>,
    inner: Mutex<EngineState>,
    curve25519_key: Curve25519PublicKey,
    ed25519_key: Ed25519PublicKey,
    /// One lock per pairwise session, keyed by peer key and session id.
    session_locks: DashMap<(String, String), Arc<Mutex<()>>>,
    /// One lock per inbound group session, keyed by sender key and session
    /// id.
    inbound_locks: DashMap<(String, String), Arc<Mutex<()>>>,
    replay_index: ReplayIndex,
}

impl OlmDevice {
    /// Restore the engine from the store, creating and persisting a fresh
    /// account if none was ever stored.
    pub fn new(store: Arc<dyn CryptoStore>) -> Result<Self, StoreError> {
        let account = match store.load_account()? {
            Some(account) => account,
            None => {
                let account = Account::new();
                store.store_account(&account)?;
                debug!("Created a new account for this device");

                account
            }
        };

        let curve25519_key = account.curve25519_key();
        let ed25519_key = account.ed25519_key();

        Ok(Self {
            store,
            inner: Mutex::new(EngineState { account, outbound_sessions: HashMap::new() }),
            curve25519_key,
            ed25519_key,
            session_locks: DashMap::new(),
            inbound_locks: DashMap::new(),
            replay_index: ReplayIndex::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.lock().expect("the engine lock shouldn't be poisoned")
    }

    fn pairwise_lock(&self, peer: Curve25519PublicKey, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks.entry((peer.to_base64(), session_id.to_owned())).or_default().clone()
    }

    fn inbound_lock(&self, sender: Curve25519PublicKey, session_id: &str) -> Arc<Mutex<()>> {
        self.inbound_locks.entry((sender.to_base64(), session_id.to_owned())).or_default().clone()
    }

    /// The long-lived Curve25519 identity key of this device.
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.curve25519_key
    }

    /// The long-lived Ed25519 fingerprint key of this device.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.ed25519_key
    }

    /// Sign a message with the fingerprint key.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.state().account.sign(message)
    }

    /// Sign the canonical form of a JSON object with the fingerprint key.
    pub fn sign_json(&self, value: &Value) -> Result<Ed25519Signature, CanonicalJsonError> {
        let canonical = canonical_json(value)?;

        Ok(self.sign(&canonical))
    }

    /// Verify an Ed25519 signature over the canonical form of a JSON
    /// object.
    pub fn verify_json(
        &self,
        key: Ed25519PublicKey,
        value: &Value,
        signature: &Ed25519Signature,
    ) -> Result<(), VerificationError> {
        verify_signature(key, value, signature)
    }

    /// The base64-encoded SHA-256 hash of the message.
    pub fn sha256(&self, message: &str) -> String {
        utilities::sha256(message)
    }

    /// The one-time keys that weren't published to the server yet, keyed by
    /// key id.
    pub fn one_time_keys(&self) -> BTreeMap<String, Curve25519PublicKey> {
        self.state()
            .account
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| (key_id.to_base64(), key))
            .collect()
    }

    /// Generate new one-time keys and persist the account.
    pub fn generate_one_time_keys(&self, count: usize) -> Result<(), StoreError> {
        let mut state = self.state();
        state.account.generate_one_time_keys(count);

        self.store.store_account(&state.account)
    }

    /// Mark every unpublished one-time key as published and persist the
    /// account.
    pub fn mark_keys_as_published(&self) -> Result<(), StoreError> {
        let mut state = self.state();
        state.account.mark_keys_as_published();

        self.store.store_account(&state.account)
    }

    /// The maximum number of one-time keys the device should keep on the
    /// server.
    pub fn max_number_of_one_time_keys(&self) -> usize {
        self.state().account.max_number_of_one_time_keys()
    }

    /// Create an outbound pairwise session to the device with the given
    /// identity key, using up one of its one-time keys.
    pub fn create_outbound_session(
        &self,
        their_identity_key: Curve25519PublicKey,
        their_one_time_key: Curve25519PublicKey,
    ) -> Result<String, StoreError> {
        let session = self.state().account.create_outbound_session(
            vodozemac::olm::SessionConfig::version_1(),
            their_identity_key,
            their_one_time_key,
        );

        let session_id = session.session_id();
        self.store.store_pairwise_session(their_identity_key, &session, false)?;

        debug!(
            peer = %their_identity_key.to_base64(),
            %session_id,
            "Created an outbound pairwise session"
        );

        Ok(session_id)
    }

    /// Create an inbound pairwise session from a pre-key message and
    /// decrypt it.
    ///
    /// The account with its used-up one-time key is persisted before the
    /// new session: if we crash in between, the worst case is a lost
    /// session, never a republished one-time key.
    pub fn create_inbound_session(
        &self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundSessionResult, PairwiseError> {
        let result = {
            let mut state = self.state();
            let result = state.account.create_inbound_session(their_identity_key, message)?;
            self.store.store_account(&state.account)?;

            result
        };

        let session_id = result.session.session_id();
        self.store.store_pairwise_session(their_identity_key, &result.session, true)?;

        debug!(
            peer = %their_identity_key.to_base64(),
            %session_id,
            "Created an inbound pairwise session"
        );

        Ok(InboundSessionResult {
            payload: String::from_utf8_lossy(&result.plaintext).into_owned(),
            session_id,
        })
    }

    /// The ids of every known pairwise session with the given device.
    pub fn session_ids(
        &self,
        their_identity_key: Curve25519PublicKey,
    ) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.store.get_pairwise_sessions(their_identity_key)?.into_keys().collect())
    }

    /// Pick the session to use for encrypting to the given device.
    ///
    /// Deterministic so that both sides converge on the same session
    /// without coordinating: the lexicographically smallest id wins.
    pub fn choose_session(
        &self,
        their_identity_key: Curve25519PublicKey,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.session_ids(their_identity_key)?.into_iter().next())
    }

    /// Encrypt a message with an existing pairwise session.
    ///
    /// Returns `None` if no such session is known. The advanced session is
    /// persisted before the ciphertext is returned.
    pub fn encrypt(
        &self,
        their_identity_key: Curve25519PublicKey,
        session_id: &str,
        plaintext: &str,
    ) -> Result<Option<OlmMessage>, StoreError> {
        let lock = self.pairwise_lock(their_identity_key, session_id);
        let _guard = lock.lock().expect("a session lock shouldn't be poisoned");

        let Some(mut session) = self.store.get_pairwise_session(their_identity_key, session_id)?
        else {
            return Ok(None);
        };

        let message = session.encrypt(plaintext);
        self.store.store_pairwise_session(their_identity_key, &session, false)?;

        Ok(Some(message))
    }

    /// Decrypt a message with an existing pairwise session.
    ///
    /// Returns `None` if no such session is known.
    pub fn decrypt(
        &self,
        their_identity_key: Curve25519PublicKey,
        session_id: &str,
        message: &OlmMessage,
    ) -> Result<Option<String>, PairwiseError> {
        let lock = self.pairwise_lock(their_identity_key, session_id);
        let _guard = lock.lock().expect("a session lock shouldn't be poisoned");

        let Some(mut session) = self.store.get_pairwise_session(their_identity_key, session_id)?
        else {
            return Ok(None);
        };

        let plaintext = session.decrypt(message)?;
        self.store.store_pairwise_session(their_identity_key, &session, true)?;

        Ok(Some(String::from_utf8_lossy(&plaintext).into_owned()))
    }

    /// Check whether an incoming pre-key message belongs to an existing
    /// session, to deduplicate session setup when a pre-key message is
    /// delivered twice.
    ///
    /// Always false for normal messages.
    pub fn matches_inbound_session(
        &self,
        their_identity_key: Curve25519PublicKey,
        session_id: &str,
        message: &OlmMessage,
    ) -> Result<bool, StoreError> {
        let OlmMessage::PreKey(message) = message else {
            return Ok(false);
        };

        // A session id is derived from the session keys inside the pre-key
        // message, so id equality is the match.
        if message.session_id() != session_id {
            return Ok(false);
        }

        Ok(self.store.get_pairwise_session(their_identity_key, session_id)?.is_some())
    }

    /// Create a new outbound group session and cache it in memory.
    ///
    /// Outbound group sessions are never persisted. The engine doesn't
    /// remember who already received the session key, so surviving a
    /// restart would mean silently encrypting to nobody-knows-whom;
    /// instead a restart forces a rotation and a fresh share.
    pub fn create_outbound_group_session(&self) -> String {
        let session = GroupSession::new(vodozemac::megolm::SessionConfig::version_1());
        let session_id = session.session_id().to_string();

        self.state().outbound_sessions.insert(session_id.clone(), session);
        debug!(%session_id, "Created an outbound group session");

        session_id
    }

    /// The current exported session key of a cached outbound group
    /// session.
    pub fn outbound_session_key(&self, session_id: &str) -> Option<String> {
        Some(self.state().outbound_sessions.get(session_id)?.session_key().to_base64())
    }

    /// The current message index of a cached outbound group session.
    pub fn outbound_message_index(&self, session_id: &str) -> Option<u32> {
        Some(self.state().outbound_sessions.get(session_id)?.message_index())
    }

    /// Encrypt a message with a cached outbound group session, advancing
    /// its ratchet.
    pub fn encrypt_group_message(&self, session_id: &str, plaintext: &str) -> Option<String> {
        let mut state = self.state();
        let session = state.outbound_sessions.get_mut(session_id)?;

        Some(session.encrypt(plaintext).to_base64())
    }

    /// Drop a cached outbound group session.
    pub fn discard_outbound_group_session(&self, session_id: &str) -> bool {
        self.state().outbound_sessions.remove(session_id).is_some()
    }

    /// Install an inbound group session announced by a room key.
    ///
    /// Returns false without touching the store if a session with this
    /// `(sender_key, session_id)` already exists, whatever the new key
    /// claims: accepting an update would let the sender reset the ratchet
    /// and replay old ciphertexts. Also returns false if the session key
    /// doesn't parse or doesn't actually belong to the announced session
    /// id.
    pub fn add_inbound_group_session(
        &self,
        session_id: &str,
        session_key: &str,
        room_id: &str,
        sender_key: Curve25519PublicKey,
        keys_claimed: BTreeMap<String, String>,
    ) -> Result<bool, StoreError> {
        let lock = self.inbound_lock(sender_key, session_id);
        let _guard = lock.lock().expect("a session lock shouldn't be poisoned");

        if self.store.get_inbound_group_session(sender_key, session_id)?.is_some() {
            warn!(
                sender_key = %sender_key.to_base64(),
                session_id,
                "Ignoring an update for an already known inbound group session"
            );
            return Ok(false);
        }

        let Ok(session_key) = SessionKey::from_base64(session_key) else {
            warn!(
                sender_key = %sender_key.to_base64(),
                session_id,
                "The announced session key couldn't be decoded"
            );
            return Ok(false);
        };

        let session = InboundGroupSession::new(&session_key, room_id, sender_key, keys_claimed);

        if session.session_id() != session_id {
            warn!(
                sender_key = %sender_key.to_base64(),
                session_id,
                "The announced session key belongs to a different session id"
            );
            return Ok(false);
        }

        self.store.store_inbound_group_session(&session)?;
        debug!(
            sender_key = %sender_key.to_base64(),
            session_id,
            room_id,
            "Installed a new inbound group session"
        );

        Ok(true)
    }

    /// Remove an inbound group session from the store.
    pub fn remove_inbound_group_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let lock = self.inbound_lock(sender_key, session_id);
        let _guard = lock.lock().expect("a session lock shouldn't be poisoned");

        self.store.remove_inbound_group_session(sender_key, session_id)
    }

    /// Decrypt a group message with a stored inbound group session.
    ///
    /// The session must be bound to the room the event was received in.
    /// When a `timeline_id` is given, a `(sender_key, session_id,
    /// message_index)` triple decrypts at most once per timeline; a
    /// duplicate fails without persisting the session.
    pub fn decrypt_group_message(
        &self,
        ciphertext: &str,
        room_id: &str,
        timeline_id: Option<&str>,
        session_id: &str,
        sender_key: Curve25519PublicKey,
    ) -> Result<DecryptedGroupMessage, MegolmDecryptionError> {
        let message = MegolmMessage::from_base64(ciphertext)?;

        let lock = self.inbound_lock(sender_key, session_id);
        let _guard = lock.lock().expect("a session lock shouldn't be poisoned");

        let mut session = self
            .store
            .get_inbound_group_session(sender_key, session_id)?
            .ok_or_else(|| MegolmDecryptionError::UnknownInboundSessionId(session_id.to_owned()))?;

        if session.room_id() != room_id {
            return Err(MegolmDecryptionError::RoomIdMismatch {
                expected: session.room_id().to_owned(),
                got: room_id.to_owned(),
            });
        }

        let decrypted = session.decrypt(&message)?;

        if let Some(timeline_id) = timeline_id {
            let key =
                format!("{}|{session_id}|{}", sender_key.to_base64(), decrypted.message_index);

            if !self.replay_index.first_seen(timeline_id, key) {
                warn!(
                    sender_key = %sender_key.to_base64(),
                    session_id,
                    message_index = decrypted.message_index,
                    timeline_id,
                    "Refusing to decrypt the same message twice in one timeline"
                );
                return Err(MegolmDecryptionError::DuplicateMessageIndex(
                    decrypted.message_index,
                ));
            }
        }

        self.store.store_inbound_group_session(&session)?;

        let payload = serde_json::from_slice(&decrypted.plaintext)
            .map_err(|_| MegolmDecryptionError::MalformedPlaintext)?;

        Ok(DecryptedGroupMessage {
            payload,
            sender_key,
            keys_claimed: session.keys_claimed().clone(),
            keys_proved: BTreeMap::from([("curve25519".to_owned(), sender_key.to_base64())]),
            message_index: decrypted.message_index,
        })
    }

    /// Forget which messages were decrypted in the given timeline,
    /// permitting re-decryption when the timeline is rebuilt.
    pub fn reset_replay_tracking(&self, timeline_id: &str) {
        self.replay_index.reset(timeline_id)
    }
}
