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

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use vodozemac::{
    olm::{Account, Session},
    Curve25519PublicKey,
};

use super::{
    deserialize_account, deserialize_inbound, deserialize_session, prefix_bounds, serialize_account,
    serialize_inbound, serialize_session, session_key, CryptoStore, DeviceTrackingStatus,
    StoreError,
};
use crate::{directory::DeviceInfo, InboundGroupSession};

/// Table: account
/// Key: the constant `"account"`
/// Value: account pickle JSON
const ACCOUNT: TableDefinition<'static, &'static str, &'static str> =
    TableDefinition::new("account");

/// Table: pairwise sessions
/// Key: `{peer_curve25519}|{session_id}`
/// Value: session record JSON
const PAIRWISE_SESSIONS: TableDefinition<'static, &'static str, &'static str> =
    TableDefinition::new("pairwise_sessions");

/// Table: inbound group sessions
/// Key: `{sender_curve25519}|{session_id}`
/// Value: inbound group session pickle JSON
const INBOUND_GROUP_SESSIONS: TableDefinition<'static, &'static str, &'static str> =
    TableDefinition::new("inbound_group_sessions");

/// Table: device directory
/// Key: `{user_id}|{device_id}`
/// Value: device record JSON
const DEVICES: TableDefinition<'static, &'static str, &'static str> =
    TableDefinition::new("devices");

/// Table: device-list tracking
/// Key: `{user_id}`
/// Value: tracking status JSON
const TRACKED_USERS: TableDefinition<'static, &'static str, &'static str> =
    TableDefinition::new("tracked_users");

const ACCOUNT_KEY: &str = "account";

/// A durable [`CryptoStore`] backed by a redb database.
///
/// Every write commits an ACID transaction, so a crash mid-write leaves the
/// previously committed value intact. Thread-safe through redb's internal
/// locking; cloning is cheap.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

fn backend(error: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(error.to_string())
}

impl RedbStore {
    /// Open or create a database at the given path, creating the tables if
    /// they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(backend)?;

        let txn = db.begin_write().map_err(backend)?;
        {
            let _ = txn.open_table(ACCOUNT).map_err(backend)?;
            let _ = txn.open_table(PAIRWISE_SESSIONS).map_err(backend)?;
            let _ = txn.open_table(INBOUND_GROUP_SESSIONS).map_err(backend)?;
            let _ = txn.open_table(DEVICES).map_err(backend)?;
            let _ = txn.open_table(TRACKED_USERS).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn insert(
        &self,
        table: TableDefinition<'_, &str, &str>,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(table).map_err(backend)?;
            table.insert(key, value).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;

        Ok(())
    }

    fn get(
        &self,
        table: TableDefinition<'_, &str, &str>,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(table).map_err(backend)?;

        Ok(table.get(key).map_err(backend)?.map(|value| value.value().to_owned()))
    }

    fn remove(
        &self,
        table: TableDefinition<'_, &str, &str>,
        key: &str,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(table).map_err(backend)?;
            table.remove(key).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;

        Ok(())
    }

    /// Collect every `(key, value)` pair whose key starts with
    /// `{prefix}|`.
    fn scan_prefix(
        &self,
        table: TableDefinition<'_, &str, &str>,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let (start, end) = prefix_bounds(prefix);

        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(table).map_err(backend)?;

        let mut entries = Vec::new();
        for result in table.range(start.as_str()..end.as_str()).map_err(backend)? {
            let (key, value) = result.map_err(backend)?;
            entries.push((key.value()[start.len()..].to_owned(), value.value().to_owned()));
        }

        Ok(entries)
    }
}

impl CryptoStore for RedbStore {
    fn load_account(&self) -> Result<Option<Account>, StoreError> {
        self.get(ACCOUNT, ACCOUNT_KEY)?.as_deref().map(deserialize_account).transpose()
    }

    fn store_account(&self, account: &Account) -> Result<(), StoreError> {
        self.insert(ACCOUNT, ACCOUNT_KEY, &serialize_account(account)?)
    }

    fn store_pairwise_session(
        &self,
        sender_key: Curve25519PublicKey,
        session: &Session,
        is_recent_recipient: bool,
    ) -> Result<(), StoreError> {
        let record = serialize_session(session, sender_key, is_recent_recipient)?;

        self.insert(PAIRWISE_SESSIONS, &session_key(sender_key, &session.session_id()), &record)
    }

    fn get_pairwise_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        self.get(PAIRWISE_SESSIONS, &session_key(sender_key, session_id))?
            .as_deref()
            .map(deserialize_session)
            .transpose()
    }

    fn get_pairwise_sessions(
        &self,
        sender_key: Curve25519PublicKey,
    ) -> Result<std::collections::BTreeMap<String, Session>, StoreError> {
        self.scan_prefix(PAIRWISE_SESSIONS, &sender_key.to_base64())?
            .into_iter()
            .map(|(session_id, record)| Ok((session_id, deserialize_session(&record)?)))
            .collect()
    }

    fn store_inbound_group_session(
        &self,
        session: &InboundGroupSession,
    ) -> Result<(), StoreError> {
        let record = serialize_inbound(session)?;
        let key = session_key(session.sender_key(), &session.session_id());

        self.insert(INBOUND_GROUP_SESSIONS, &key, &record)
    }

    fn get_inbound_group_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>, StoreError> {
        self.get(INBOUND_GROUP_SESSIONS, &session_key(sender_key, session_id))?
            .as_deref()
            .map(deserialize_inbound)
            .transpose()
    }

    fn remove_inbound_group_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.remove(INBOUND_GROUP_SESSIONS, &session_key(sender_key, session_id))
    }

    fn store_device(&self, device: &DeviceInfo) -> Result<(), StoreError> {
        let key = format!("{}|{}", device.user_id(), device.device_id());

        self.insert(DEVICES, &key, &serde_json::to_string(device)?)
    }

    fn get_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceInfo>, StoreError> {
        self.get(DEVICES, &format!("{user_id}|{device_id}"))?
            .map(|record| serde_json::from_str(&record).map_err(StoreError::from))
            .transpose()
    }

    fn get_user_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, StoreError> {
        self.scan_prefix(DEVICES, user_id)?
            .into_iter()
            .map(|(_, record)| serde_json::from_str(&record).map_err(StoreError::from))
            .collect()
    }

    fn get_device_by_identity_key(
        &self,
        identity_key: Curve25519PublicKey,
    ) -> Result<Option<DeviceInfo>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(DEVICES).map_err(backend)?;

        for result in table.iter().map_err(backend)? {
            let (_, value) = result.map_err(backend)?;
            let device: DeviceInfo = serde_json::from_str(value.value())?;

            if device.curve25519_key() == Some(identity_key) {
                return Ok(Some(device));
            }
        }

        Ok(None)
    }

    fn set_tracking_status(
        &self,
        user_id: &str,
        status: DeviceTrackingStatus,
    ) -> Result<(), StoreError> {
        self.insert(TRACKED_USERS, user_id, &serde_json::to_string(&status)?)
    }

    fn tracking_status(&self, user_id: &str) -> Result<Option<DeviceTrackingStatus>, StoreError> {
        self.get(TRACKED_USERS, user_id)?
            .map(|record| serde_json::from_str(&record).map_err(StoreError::from))
            .transpose()
    }

    fn load_tracked_users(&self) -> Result<Vec<(String, DeviceTrackingStatus)>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(TRACKED_USERS).map_err(backend)?;

        let mut users = Vec::new();
        for result in table.iter().map_err(backend)? {
            let (user_id, status) = result.map_err(backend)?;
            users.push((user_id.value().to_owned(), serde_json::from_str(status.value())?));
        }

        Ok(users)
    }

    fn flush(&self) -> Result<(), StoreError> {
        // Writes commit synchronously, there is nothing buffered to drain.
        Ok(())
    }
}
