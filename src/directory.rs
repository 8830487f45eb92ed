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

//! The directory of remote devices we may encrypt to.
//!
//! Device records arrive from the server and are only as trustworthy as
//! their self-signature, so every record is verified against its own
//! advertised Ed25519 key before it is stored. A device id is bound to its
//! identity keys on first sight: a later record claiming different keys for
//! the same device id is the signature of a corrupt or malicious server and
//! is refused while the original record stays in place.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::{
    canonical_json::{verify_signature, VerificationError},
    store::{CryptoStore, DeviceTrackingStatus, StoreError},
};

/// The device-keys record a device publishes about itself, in its wire
/// format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The user the device belongs to.
    pub user_id: String,
    /// The id of the device, unique per user.
    pub device_id: String,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<String>,
    /// The public identity keys, keyed by `{algorithm}:{device_id}`.
    pub keys: BTreeMap<String, String>,
    /// Signatures over the canonical form of this record, keyed by user id
    /// and then by `ed25519:{device_id}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

impl DeviceKeys {
    /// The long-lived Curve25519 identity key the record advertises.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        let key = self.keys.get(&format!("curve25519:{}", self.device_id))?;

        Curve25519PublicKey::from_base64(key).ok()
    }

    /// The long-lived Ed25519 fingerprint key the record advertises.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        let key = self.keys.get(&format!("ed25519:{}", self.device_id))?;

        Ed25519PublicKey::from_base64(key).ok()
    }

    fn self_signature(&self) -> Option<&String> {
        self.signatures.get(&self.user_id)?.get(&format!("ed25519:{}", self.device_id))
    }
}

/// The locally decided trust state of a device.
///
/// Verification is policy, not cryptography: it never changes how messages
/// are encrypted, but a blocked device is excluded when room keys are
/// shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    /// Nothing is known about the device yet.
    #[default]
    Unknown,
    /// The device was seen but nobody vouched for it.
    Unverified,
    /// The device was verified by the local user.
    Verified,
    /// The device must not receive room keys.
    Blocked,
}

/// A validated device record together with its local verification state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The self-signed record as the device published it.
    pub keys: DeviceKeys,
    /// The local trust decision for the device.
    pub verification: VerificationState,
}

impl DeviceInfo {
    pub fn user_id(&self) -> &str {
        &self.keys.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.keys.device_id
    }

    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.keys.curve25519_key()
    }

    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.keys.ed25519_key()
    }

    pub fn is_blocked(&self) -> bool {
        self.verification == VerificationState::Blocked
    }
}

/// Error type describing why a device record was rejected.
#[derive(Debug, Error)]
pub enum DeviceKeyError {
    /// The record doesn't advertise both identity keys.
    #[error("the device record is missing its identity keys")]
    MissingKeys,
    /// The record carries no signature by its own fingerprint key.
    #[error("the device record isn't signed by its own fingerprint key")]
    MissingSignature,
    /// The self-signature doesn't match the canonical form of the record.
    #[error("the self-signature on the device record is invalid: {0}")]
    Signature(#[from] VerificationError),
    /// The record claims to belong to a different user than the one it was
    /// downloaded for.
    #[error("the device record belongs to {got}, expected {expected}")]
    UserIdMismatch {
        /// The user the record was requested for.
        expected: String,
        /// The user named inside the record.
        got: String,
    },
    /// A known device id showed up with different identity keys. The
    /// original record is retained.
    #[error("device {device_id} of {user_id} advertised changed identity keys")]
    DeviceIdentityChanged {
        /// The user the device belongs to.
        user_id: String,
        /// The device id whose keys changed.
        device_id: String,
    },
}

/// Per-device outcome of a device-list update.
#[derive(Debug, Default)]
pub struct DeviceUpdateOutcome {
    /// Device ids that were stored or refreshed.
    pub accepted: Vec<String>,
    /// Device ids that were dropped, with the reason.
    pub rejected: Vec<(String, DeviceKeyError)>,
}

/// Store-backed directory of the devices known to this account.
pub struct DeviceDirectory {
    store: Arc<dyn CryptoStore>,
}

impl DeviceDirectory {
    pub fn new(store: Arc<dyn CryptoStore>) -> Self {
        Self { store }
    }

    /// Validate and store a freshly downloaded device list of a user.
    ///
    /// Each record must carry a valid self-signature over its canonical
    /// form; records that don't are dropped and reported in the outcome.
    /// A record for an already known device id keeps its verification
    /// state, and is refused outright if its identity keys differ from the
    /// stored ones. Afterwards the user's tracking status is up to date.
    pub fn receive_device_keys(
        &self,
        user_id: &str,
        devices: Vec<DeviceKeys>,
    ) -> Result<DeviceUpdateOutcome, StoreError> {
        let mut outcome = DeviceUpdateOutcome::default();

        for keys in devices {
            let device_id = keys.device_id.clone();

            match self.check_device_keys(user_id, &keys)? {
                Some(error) => {
                    warn!(user_id, %device_id, %error, "Dropping an invalid device record");
                    outcome.rejected.push((device_id, error));
                }
                None => {
                    let verification = self
                        .store
                        .get_device(user_id, &device_id)?
                        .map(|known| known.verification)
                        .unwrap_or_default();

                    self.store.store_device(&DeviceInfo { keys, verification })?;
                    outcome.accepted.push(device_id);
                }
            }
        }

        self.store.set_tracking_status(user_id, DeviceTrackingStatus::UpToDate)?;
        debug!(
            user_id,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            "Updated the device list of a user"
        );

        Ok(outcome)
    }

    /// Validate a single record, returning the reason it must be rejected,
    /// if any.
    fn check_device_keys(
        &self,
        user_id: &str,
        keys: &DeviceKeys,
    ) -> Result<Option<DeviceKeyError>, StoreError> {
        if let Some(error) = validate_device_keys(user_id, keys) {
            return Ok(Some(error));
        }

        if let Some(known) = self.store.get_device(user_id, &keys.device_id)? {
            if known.keys.curve25519_key() != keys.curve25519_key()
                || known.keys.ed25519_key() != keys.ed25519_key()
            {
                return Ok(Some(DeviceKeyError::DeviceIdentityChanged {
                    user_id: user_id.to_owned(),
                    device_id: keys.device_id.clone(),
                }));
            }
        }

        Ok(None)
    }

    /// Get the record of a single device.
    pub fn get_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceInfo>, StoreError> {
        self.store.get_device(user_id, device_id)
    }

    /// All known devices of a user.
    pub fn user_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, StoreError> {
        self.store.get_user_devices(user_id)
    }

    /// Find the device that advertises the given Curve25519 identity key.
    pub fn device_by_identity_key(
        &self,
        identity_key: Curve25519PublicKey,
    ) -> Result<Option<DeviceInfo>, StoreError> {
        self.store.get_device_by_identity_key(identity_key)
    }

    /// Set the local verification state of a device.
    ///
    /// Returns false if the device isn't known.
    pub fn set_verification_state(
        &self,
        user_id: &str,
        device_id: &str,
        verification: VerificationState,
    ) -> Result<bool, StoreError> {
        let Some(mut device) = self.store.get_device(user_id, device_id)? else {
            return Ok(false);
        };

        device.verification = verification;
        self.store.store_device(&device)?;

        Ok(true)
    }

    /// Flag a user's device list as outdated, to be re-downloaded by the
    /// transport layer.
    pub fn mark_user_outdated(&self, user_id: &str) -> Result<(), StoreError> {
        self.store.set_tracking_status(user_id, DeviceTrackingStatus::Outdated)
    }

    /// The users whose device lists need a re-download.
    pub fn outdated_users(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .load_tracked_users()?
            .into_iter()
            .filter(|(_, status)| *status == DeviceTrackingStatus::Outdated)
            .map(|(user_id, _)| user_id)
            .collect())
    }
}

/// Check a record's internal consistency and self-signature.
fn validate_device_keys(user_id: &str, keys: &DeviceKeys) -> Option<DeviceKeyError> {
    if keys.user_id != user_id {
        return Some(DeviceKeyError::UserIdMismatch {
            expected: user_id.to_owned(),
            got: keys.user_id.clone(),
        });
    }

    let Some(ed25519) = keys.ed25519_key() else {
        return Some(DeviceKeyError::MissingKeys);
    };
    if keys.curve25519_key().is_none() {
        return Some(DeviceKeyError::MissingKeys);
    }

    let Some(signature) = keys.self_signature() else {
        return Some(DeviceKeyError::MissingSignature);
    };
    let signature = match Ed25519Signature::from_base64(signature) {
        Ok(signature) => signature,
        Err(e) => return Some(DeviceKeyError::Signature(VerificationError::Signature(e))),
    };

    let value = match serde_json::to_value(keys) {
        Ok(value) => value,
        Err(e) => return Some(DeviceKeyError::Signature(VerificationError::Canonical(e.into()))),
    };

    verify_signature(ed25519, &value, &signature).err().map(DeviceKeyError::Signature)
}

#[cfg(test)]
mod test {
    use assert_matches2::assert_let;
    use vodozemac::olm::Account;

    use super::*;
    use crate::{
        canonical_json::canonical_json,
        events::{MEGOLM_ALGORITHM, OLM_ALGORITHM},
        store::MemoryStore,
    };

    fn signed_device_keys(user_id: &str, device_id: &str, account: &Account) -> DeviceKeys {
        let mut keys = DeviceKeys {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            algorithms: vec![OLM_ALGORITHM.to_owned(), MEGOLM_ALGORITHM.to_owned()],
            keys: BTreeMap::from([
                (format!("curve25519:{device_id}"), account.curve25519_key().to_base64()),
                (format!("ed25519:{device_id}"), account.ed25519_key().to_base64()),
            ]),
            signatures: BTreeMap::new(),
        };

        let value = serde_json::to_value(&keys).expect("device keys should serialize");
        let canonical = canonical_json(&value).expect("device keys should have a canonical form");
        let signature = account.sign(canonical.as_str());

        keys.signatures.insert(
            user_id.to_owned(),
            BTreeMap::from([(format!("ed25519:{device_id}"), signature.to_base64())]),
        );

        keys
    }

    fn directory() -> DeviceDirectory {
        DeviceDirectory::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn valid_records_are_accepted() -> Result<(), StoreError> {
        let directory = directory();
        let account = Account::new();

        let keys = signed_device_keys("@bob:example.org", "BOBDEVICE", &account);
        let outcome = directory.receive_device_keys("@bob:example.org", vec![keys.clone()])?;

        assert_eq!(outcome.accepted, ["BOBDEVICE"]);
        assert!(outcome.rejected.is_empty());

        let device = directory
            .get_device("@bob:example.org", "BOBDEVICE")?
            .expect("the device should be known now");
        assert_eq!(device.verification, VerificationState::Unknown);
        assert_eq!(device.curve25519_key(), Some(account.curve25519_key()));

        let by_key = directory
            .device_by_identity_key(account.curve25519_key())?
            .expect("the device should be findable by its identity key");
        assert_eq!(by_key.device_id(), "BOBDEVICE");

        Ok(())
    }

    #[test]
    fn unsigned_records_are_dropped() -> Result<(), StoreError> {
        let directory = directory();
        let account = Account::new();

        let mut keys = signed_device_keys("@bob:example.org", "BOBDEVICE", &account);
        keys.signatures.clear();

        let outcome = directory.receive_device_keys("@bob:example.org", vec![keys])?;

        assert!(outcome.accepted.is_empty());
        assert_let!([(device_id, DeviceKeyError::MissingSignature)] = outcome.rejected.as_slice());
        assert_eq!(device_id, "BOBDEVICE");
        assert!(directory.get_device("@bob:example.org", "BOBDEVICE")?.is_none());

        Ok(())
    }

    #[test]
    fn tampered_records_are_dropped() -> Result<(), StoreError> {
        let directory = directory();
        let account = Account::new();

        let mut keys = signed_device_keys("@bob:example.org", "BOBDEVICE", &account);
        keys.algorithms.push("m.fancy.new.algorithm".to_owned());

        let outcome = directory.receive_device_keys("@bob:example.org", vec![keys])?;

        assert_let!([(_, DeviceKeyError::Signature(_))] = outcome.rejected.as_slice());
        assert!(directory.get_device("@bob:example.org", "BOBDEVICE")?.is_none());

        Ok(())
    }

    #[test]
    fn changed_identity_keys_are_an_alarm() -> Result<(), StoreError> {
        let directory = directory();
        let account = Account::new();

        let original = signed_device_keys("@bob:example.org", "BOBDEVICE", &account);
        directory.receive_device_keys("@bob:example.org", vec![original.clone()])?;

        // The same device id shows up with a brand new set of keys,
        // correctly self-signed by the new fingerprint.
        let imposter = Account::new();
        let replacement = signed_device_keys("@bob:example.org", "BOBDEVICE", &imposter);

        let outcome = directory.receive_device_keys("@bob:example.org", vec![replacement])?;
        assert_let!(
            [(_, DeviceKeyError::DeviceIdentityChanged { user_id, device_id })] =
                outcome.rejected.as_slice()
        );
        assert_eq!(user_id, "@bob:example.org");
        assert_eq!(device_id, "BOBDEVICE");

        let stored = directory
            .get_device("@bob:example.org", "BOBDEVICE")?
            .expect("the original record should be retained");
        assert_eq!(stored.curve25519_key(), Some(account.curve25519_key()));

        Ok(())
    }

    #[test]
    fn verification_state_is_kept_across_refreshes() -> Result<(), StoreError> {
        let directory = directory();
        let account = Account::new();

        let keys = signed_device_keys("@bob:example.org", "BOBDEVICE", &account);
        directory.receive_device_keys("@bob:example.org", vec![keys.clone()])?;

        assert!(directory.set_verification_state(
            "@bob:example.org",
            "BOBDEVICE",
            VerificationState::Blocked
        )?);

        // A re-download of the same record must not reset the local trust
        // decision.
        directory.receive_device_keys("@bob:example.org", vec![keys])?;

        let device = directory
            .get_device("@bob:example.org", "BOBDEVICE")?
            .expect("the device should be known");
        assert!(device.is_blocked());

        assert!(!directory.set_verification_state(
            "@bob:example.org",
            "GHOSTDEVICE",
            VerificationState::Verified
        )?);

        Ok(())
    }

    #[test]
    fn tracking_follows_updates() -> Result<(), StoreError> {
        let directory = directory();
        let account = Account::new();

        directory.mark_user_outdated("@bob:example.org")?;
        assert_eq!(directory.outdated_users()?, ["@bob:example.org"]);

        let keys = signed_device_keys("@bob:example.org", "BOBDEVICE", &account);
        directory.receive_device_keys("@bob:example.org", vec![keys])?;

        assert!(directory.outdated_users()?.is_empty());

        Ok(())
    }
}
