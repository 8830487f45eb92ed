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

//! Durable storage for the cryptographic state of a device.
//!
//! Everything that must survive a restart goes through the [`CryptoStore`]
//! trait: the account, pairwise sessions keyed by the peer's Curve25519 key
//! and the session id, inbound group sessions keyed by the sender's
//! Curve25519 key and the session id, the device directory, and per-user
//! tracking metadata. Outbound group sessions are deliberately absent, they
//! live only in memory so a restart forces a rotation and a fresh share.
//!
//! Two implementations are provided: [`MemoryStore`] for tests and
//! ephemeral devices, and [`RedbStore`] backed by an ACID on-disk database.
//! Both serialize the same record types, so they behave identically apart
//! from durability.

mod memory;
mod redb;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{
    olm::{Account, Session, SessionPickle},
    Curve25519PublicKey,
};

pub use self::{memory::MemoryStore, redb::RedbStore};
use crate::{directory::DeviceInfo, InboundGroupSession};

/// Error type describing the ways the store can fail.
///
/// Writes are serialized per key and the last committed value wins; a
/// failure never leaves a record half-written.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database reported a failure.
    #[error("the crypto store backend failed: {0}")]
    Backend(String),
    /// A record couldn't be serialized or deserialized.
    #[error("a crypto store record couldn't be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Whether the device list of a user is known to be current.
///
/// The directory marks users outdated when the server hints at a change;
/// the transport layer is expected to re-download keys for those users and
/// feed them back through the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTrackingStatus {
    /// The stored device list reflects the last download.
    UpToDate,
    /// The device list changed server-side and needs a re-download.
    Outdated,
}

/// The serialized form of a pairwise session and its bookkeeping.
#[derive(Serialize, Deserialize)]
pub struct PickledPairwiseSession {
    /// The serialized double ratchet.
    pub pickle: SessionPickle,
    /// The Curve25519 identity key of the remote device.
    pub sender_key: Curve25519PublicKey,
    /// True if the last recorded use of the session was receiving a
    /// message. A hint for session selection, currently informational.
    pub is_recent_recipient: bool,
}

/// Storage contract the engine persists its state through.
///
/// Implementations must serialize writes to the same key and may buffer
/// writes internally; [`CryptoStore::flush`] is the drain point callers use
/// before relying on durability.
pub trait CryptoStore: Send + Sync {
    /// Load the account, if one was ever stored.
    fn load_account(&self) -> Result<Option<Account>, StoreError>;

    /// Store the account, replacing a previously stored one.
    fn store_account(&self, account: &Account) -> Result<(), StoreError>;

    /// Upsert a pairwise session, keyed by the peer key and the session id.
    fn store_pairwise_session(
        &self,
        sender_key: Curve25519PublicKey,
        session: &Session,
        is_recent_recipient: bool,
    ) -> Result<(), StoreError>;

    /// Get a single pairwise session with the given peer.
    fn get_pairwise_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<Session>, StoreError>;

    /// Get all pairwise sessions with the given peer, keyed by session id.
    fn get_pairwise_sessions(
        &self,
        sender_key: Curve25519PublicKey,
    ) -> Result<BTreeMap<String, Session>, StoreError>;

    /// Upsert an inbound group session, keyed by its sender key and
    /// session id.
    fn store_inbound_group_session(
        &self,
        session: &InboundGroupSession,
    ) -> Result<(), StoreError>;

    /// Get the inbound group session with the given sender key and session
    /// id.
    fn get_inbound_group_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>, StoreError>;

    /// Remove the inbound group session with the given sender key and
    /// session id, if it exists.
    fn remove_inbound_group_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<(), StoreError>;

    /// Upsert a device record.
    fn store_device(&self, device: &DeviceInfo) -> Result<(), StoreError>;

    /// Get the device record for the given user and device id.
    fn get_device(&self, user_id: &str, device_id: &str)
        -> Result<Option<DeviceInfo>, StoreError>;

    /// Get all known device records of a user.
    fn get_user_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, StoreError>;

    /// Find the device record advertising the given Curve25519 identity
    /// key, across all users.
    fn get_device_by_identity_key(
        &self,
        identity_key: Curve25519PublicKey,
    ) -> Result<Option<DeviceInfo>, StoreError>;

    /// Record the device-list tracking status of a user.
    fn set_tracking_status(
        &self,
        user_id: &str,
        status: DeviceTrackingStatus,
    ) -> Result<(), StoreError>;

    /// The device-list tracking status of a user, if the user is tracked.
    fn tracking_status(&self, user_id: &str) -> Result<Option<DeviceTrackingStatus>, StoreError>;

    /// All tracked users and their statuses.
    fn load_tracked_users(&self) -> Result<Vec<(String, DeviceTrackingStatus)>, StoreError>;

    /// Block until every buffered write reached the backend.
    fn flush(&self) -> Result<(), StoreError>;
}

/// The composite key a pairwise or inbound group session is stored under.
///
/// `|` can't occur in unpadded base64, so the concatenation is unambiguous
/// and sorts all sessions of one peer (or sender) into one contiguous key
/// range.
fn session_key(first: Curve25519PublicKey, session_id: &str) -> String {
    format!("{}|{session_id}", first.to_base64())
}

/// The `(start, end)` bounds covering every key produced by [`session_key`]
/// for the given prefix. `}` sorts after every base64 character.
fn prefix_bounds(prefix: &str) -> (String, String) {
    (format!("{prefix}|"), format!("{prefix}}}"))
}

fn serialize_session(
    session: &Session,
    sender_key: Curve25519PublicKey,
    is_recent_recipient: bool,
) -> Result<String, StoreError> {
    let record =
        PickledPairwiseSession { pickle: session.pickle(), sender_key, is_recent_recipient };

    Ok(serde_json::to_string(&record)?)
}

fn deserialize_session(record: &str) -> Result<Session, StoreError> {
    let record: PickledPairwiseSession = serde_json::from_str(record)?;

    Ok(Session::from_pickle(record.pickle))
}

fn serialize_account(account: &Account) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&account.pickle())?)
}

fn deserialize_account(record: &str) -> Result<Account, StoreError> {
    Ok(Account::from_pickle(serde_json::from_str(record)?))
}

fn serialize_inbound(session: &InboundGroupSession) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&session.pickle())?)
}

fn deserialize_inbound(record: &str) -> Result<InboundGroupSession, StoreError> {
    Ok(InboundGroupSession::from_pickle(serde_json::from_str(record)?))
}
