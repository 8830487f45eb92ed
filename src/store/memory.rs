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
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

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

/// A [`CryptoStore`] that keeps everything in memory.
///
/// Records go through the same serialization as the durable store, so tests
/// against it exercise the full persistence codepath. Dropping the store
/// drops the device's cryptographic identity.
#[derive(Default)]
pub struct MemoryStore {
    account: RwLock<Option<String>>,
    sessions: RwLock<BTreeMap<String, String>>,
    inbound_sessions: RwLock<BTreeMap<String, String>>,
    devices: RwLock<BTreeMap<String, String>>,
    tracked_users: RwLock<HashMap<String, DeviceTrackingStatus>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
        lock.read().expect("a memory store lock shouldn't be poisoned")
    }

    fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
        lock.write().expect("a memory store lock shouldn't be poisoned")
    }
}

impl CryptoStore for MemoryStore {
    fn load_account(&self) -> Result<Option<Account>, StoreError> {
        Self::read(&self.account).as_deref().map(deserialize_account).transpose()
    }

    fn store_account(&self, account: &Account) -> Result<(), StoreError> {
        *Self::write(&self.account) = Some(serialize_account(account)?);

        Ok(())
    }

    fn store_pairwise_session(
        &self,
        sender_key: Curve25519PublicKey,
        session: &Session,
        is_recent_recipient: bool,
    ) -> Result<(), StoreError> {
        let record = serialize_session(session, sender_key, is_recent_recipient)?;
        let key = session_key(sender_key, &session.session_id());

        Self::write(&self.sessions).insert(key, record);

        Ok(())
    }

    fn get_pairwise_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let key = session_key(sender_key, session_id);

        Self::read(&self.sessions).get(&key).map(|r| deserialize_session(r)).transpose()
    }

    fn get_pairwise_sessions(
        &self,
        sender_key: Curve25519PublicKey,
    ) -> Result<BTreeMap<String, Session>, StoreError> {
        let (start, end) = prefix_bounds(&sender_key.to_base64());

        Self::read(&self.sessions)
            .range(start.clone()..end)
            .map(|(key, record)| {
                let session_id = key[start.len()..].to_owned();
                Ok((session_id, deserialize_session(record)?))
            })
            .collect()
    }

    fn store_inbound_group_session(
        &self,
        session: &InboundGroupSession,
    ) -> Result<(), StoreError> {
        let record = serialize_inbound(session)?;
        let key = session_key(session.sender_key(), &session.session_id());

        Self::write(&self.inbound_sessions).insert(key, record);

        Ok(())
    }

    fn get_inbound_group_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>, StoreError> {
        let key = session_key(sender_key, session_id);

        Self::read(&self.inbound_sessions).get(&key).map(|r| deserialize_inbound(r)).transpose()
    }

    fn remove_inbound_group_session(
        &self,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let key = session_key(sender_key, session_id);

        Self::write(&self.inbound_sessions).remove(&key);

        Ok(())
    }

    fn store_device(&self, device: &DeviceInfo) -> Result<(), StoreError> {
        let key = format!("{}|{}", device.user_id(), device.device_id());
        let record = serde_json::to_string(device)?;

        Self::write(&self.devices).insert(key, record);

        Ok(())
    }

    fn get_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceInfo>, StoreError> {
        let key = format!("{user_id}|{device_id}");

        Self::read(&self.devices)
            .get(&key)
            .map(|r| serde_json::from_str(r).map_err(StoreError::from))
            .transpose()
    }

    fn get_user_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, StoreError> {
        let (start, end) = prefix_bounds(user_id);

        Self::read(&self.devices)
            .range(start..end)
            .map(|(_, r)| serde_json::from_str(r).map_err(StoreError::from))
            .collect()
    }

    fn get_device_by_identity_key(
        &self,
        identity_key: Curve25519PublicKey,
    ) -> Result<Option<DeviceInfo>, StoreError> {
        for record in Self::read(&self.devices).values() {
            let device: DeviceInfo = serde_json::from_str(record)?;

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
        Self::write(&self.tracked_users).insert(user_id.to_owned(), status);

        Ok(())
    }

    fn tracking_status(&self, user_id: &str) -> Result<Option<DeviceTrackingStatus>, StoreError> {
        Ok(Self::read(&self.tracked_users).get(user_id).copied())
    }

    fn load_tracked_users(&self) -> Result<Vec<(String, DeviceTrackingStatus)>, StoreError> {
        Ok(Self::read(&self.tracked_users).iter().map(|(u, s)| (u.clone(), *s)).collect())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use vodozemac::olm::Account;

    use super::*;

    #[test]
    fn account_roundtrip() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        assert!(store.load_account()?.is_none());

        let account = Account::new();
        store.store_account(&account)?;

        let restored = store.load_account()?.expect("the account should be stored");
        assert_eq!(restored.identity_keys(), account.identity_keys());

        Ok(())
    }

    #[test]
    fn sessions_are_grouped_by_peer() -> Result<(), StoreError> {
        let store = MemoryStore::new();

        let mut bob = Account::new();
        bob.generate_one_time_keys(2);
        let alice = Account::new();

        let keys: Vec<_> = bob.one_time_keys().values().copied().collect();
        let bob_key = bob.curve25519_key();

        for one_time_key in &keys {
            let session = alice.create_outbound_session(
                vodozemac::olm::SessionConfig::version_1(),
                bob_key,
                *one_time_key,
            );
            store.store_pairwise_session(bob_key, &session, false)?;
        }

        let sessions = store.get_pairwise_sessions(bob_key)?;
        assert_eq!(sessions.len(), 2);

        for (session_id, session) in &sessions {
            assert_eq!(session_id, &session.session_id());
            assert!(store.get_pairwise_session(bob_key, session_id)?.is_some());
        }

        // Another peer's sessions are invisible for Bob's key.
        let carol_key = Account::new().curve25519_key();
        assert!(store.get_pairwise_sessions(carol_key)?.is_empty());

        Ok(())
    }
}
