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

//! The surface the transport and room layers drive.
//!
//! [`CryptoEngine`] ties the device engine, the group session manager, and
//! the device directory together behind the handful of operations the rest
//! of a client needs: wrap room keys for recipient devices, unwrap
//! to-device events, and encrypt or decrypt room events. The engine never
//! talks to the network itself; it consumes what the transport delivers and
//! hands back what the transport should send.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey};

use crate::{
    device::{DecryptedGroupMessage, MegolmDecryptionError, OlmDevice, PairwiseError},
    directory::{DeviceDirectory, DeviceInfo, DeviceKeys},
    events::{
        ContentDecodeError, EncryptedRoomEvent, MegolmEventContent, OlmCiphertext,
        OlmEventContent, RoomKeyContent, ToDeviceEvent, ToDeviceMessage, ENCRYPTED_EVENT_TYPE,
        MEGOLM_ALGORITHM, OLM_ALGORITHM, ROOM_KEY_EVENT_TYPE,
    },
    group_sessions::{GroupEncryptionError, GroupSessionManager},
    store::{CryptoStore, StoreError},
    CanonicalJsonError,
};

/// Error type describing how encrypting to a single device can fail.
#[derive(Debug, Error)]
pub enum OlmEncryptionError {
    /// The directory has no record of the device.
    #[error("the device {device_id} of {user_id} isn't known to the directory")]
    UnknownDevice {
        /// The user the device was looked up for.
        user_id: String,
        /// The unknown device id.
        device_id: String,
    },
    /// The device doesn't advertise an algorithm this engine speaks.
    #[error("the device doesn't support any encryption algorithm we do")]
    EncryptionDisabled,
    /// There is no pairwise session with the device yet. One has to be
    /// established from one of its one-time keys first.
    #[error("there is no pairwise session with the device")]
    MissingSession,
    /// The engine couldn't load or persist its state.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error type describing how handling a to-device event can fail.
#[derive(Debug, Error)]
pub enum OlmEventError {
    /// The ciphertext map has no entry for this device.
    #[error("the event isn't encrypted for this device")]
    NotIntendedForDevice,
    /// The event used an algorithm this engine doesn't implement.
    #[error("the event used an unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// The per-recipient ciphertext couldn't be decoded.
    #[error(transparent)]
    Content(#[from] ContentDecodeError),
    /// The sender key on the event wasn't a valid Curve25519 key.
    #[error("the event's sender key couldn't be decoded: {0}")]
    InvalidSenderKey(#[from] vodozemac::KeyError),
    /// No known session accepted the message and it can't establish a new
    /// one.
    #[error("none of the known sessions accepted the message")]
    BadEncryptedMessage,
    /// Session setup or decryption failed.
    #[error(transparent)]
    Pairwise(#[from] PairwiseError),
    /// The event content or the decrypted payload wasn't the expected
    /// JSON shape.
    #[error("the event payload was malformed: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    /// The engine couldn't load or persist its state.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The outcome of handling a to-device event.
#[derive(Debug)]
pub enum ToDeviceOutcome {
    /// The event announced a group session key.
    RoomKey {
        /// The room the session belongs to.
        room_id: String,
        /// The announced session id.
        session_id: String,
        /// False if the session was refused or already known.
        added: bool,
    },
    /// The event decrypted to something other than a room key; the caller
    /// decides what to do with it.
    Decrypted(DecryptedToDeviceEvent),
    /// The event type is none of the engine's business.
    Ignored,
}

/// A decrypted Olm to-device event.
#[derive(Debug)]
pub struct DecryptedToDeviceEvent {
    /// The decrypted payload, with its `type`, `content`, and `keys`
    /// fields.
    pub payload: Value,
    /// The Curve25519 key of the device the event was decrypted from. The
    /// only cryptographically proved sender identity.
    pub sender_key: Curve25519PublicKey,
    /// The keys the sender claimed inside the payload, keyed by algorithm
    /// name. Asserted, not proved.
    pub keys_claimed: BTreeMap<String, String>,
}

/// Devices a room key share deliberately skipped, by category.
#[derive(Debug, Default)]
pub struct KeyShareResult {
    /// The encrypted share messages, ready for the transport.
    pub messages: Vec<ToDeviceMessage>,
    /// Devices that are blocked locally and never receive keys.
    pub blocked: Vec<(String, String)>,
    /// Devices we couldn't encrypt to, either for lack of a pairwise
    /// session or because they advertise no supported algorithm. The
    /// caller may claim one-time keys and retry.
    pub withheld: Vec<(String, String)>,
}

/// The per-device crypto engine, wired up for its collaborators.
pub struct CryptoEngine {
    user_id: String,
    device_id: String,
    store: Arc<dyn CryptoStore>,
    device: Arc<OlmDevice>,
    groups: GroupSessionManager,
    directory: DeviceDirectory,
}

impl CryptoEngine {
    /// Bring up the engine for the given device, restoring state from the
    /// store or creating a fresh account.
    pub fn new(
        user_id: &str,
        device_id: &str,
        store: Arc<dyn CryptoStore>,
    ) -> Result<Self, StoreError> {
        let device = Arc::new(OlmDevice::new(store.clone())?);
        let groups = GroupSessionManager::new(device.clone());
        let directory = DeviceDirectory::new(store.clone());

        Ok(Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            store,
            device,
            groups,
            directory,
        })
    }

    /// The user this engine belongs to.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The device this engine belongs to.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The underlying device engine.
    pub fn olm_device(&self) -> &OlmDevice {
        &self.device
    }

    /// The directory of known remote devices.
    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    /// The per-room group session manager.
    pub fn group_sessions(&self) -> &GroupSessionManager {
        &self.groups
    }

    /// Our own signed device-keys record, ready for upload by the
    /// transport layer.
    pub fn own_device_keys(&self) -> Result<DeviceKeys, CanonicalJsonError> {
        let mut keys = DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: vec![OLM_ALGORITHM.to_owned(), MEGOLM_ALGORITHM.to_owned()],
            keys: BTreeMap::from([
                (
                    format!("curve25519:{}", self.device_id),
                    self.device.curve25519_key().to_base64(),
                ),
                (format!("ed25519:{}", self.device_id), self.device.ed25519_key().to_base64()),
            ]),
            signatures: BTreeMap::new(),
        };

        let value = serde_json::to_value(&keys)?;
        let signature = self.device.sign_json(&value)?;

        keys.signatures.insert(
            self.user_id.clone(),
            BTreeMap::from([(format!("ed25519:{}", self.device_id), signature.to_base64())]),
        );

        Ok(keys)
    }

    /// Encrypt a room event with the room's outbound group session,
    /// creating the session on first use.
    pub fn encrypt_room_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<MegolmEventContent, GroupEncryptionError> {
        let payload = json!({
            "room_id": room_id,
            "type": event_type,
            "content": content,
        });

        let (session_id, ciphertext) = self.groups.encrypt(room_id, &payload)?;

        Ok(MegolmEventContent {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            ciphertext,
            sender_key: self.device.curve25519_key().to_base64(),
            device_id: self.device_id.clone(),
            session_id,
        })
    }

    /// Decrypt an encrypted room event.
    ///
    /// With a `timeline_id`, a message decrypts at most once per timeline;
    /// pass `None` for contexts without replay concerns, e.g. one-off
    /// previews.
    pub fn decrypt_room_event(
        &self,
        event: &EncryptedRoomEvent,
        timeline_id: Option<&str>,
    ) -> Result<DecryptedGroupMessage, MegolmDecryptionError> {
        self.groups.decrypt(event, timeline_id)
    }

    /// Encrypt a payload for a single device over the pairwise channel.
    pub fn encrypt_for_device(
        &self,
        user_id: &str,
        device_id: &str,
        payload: &Value,
    ) -> Result<OlmEventContent, OlmEncryptionError> {
        let device = self.directory.get_device(user_id, device_id)?.ok_or_else(|| {
            OlmEncryptionError::UnknownDevice {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
            }
        })?;

        self.encrypt_to(&device, payload)
    }

    fn encrypt_to(
        &self,
        device: &DeviceInfo,
        payload: &Value,
    ) -> Result<OlmEventContent, OlmEncryptionError> {
        if !device.keys.algorithms.iter().any(|a| a == OLM_ALGORITHM) {
            return Err(OlmEncryptionError::EncryptionDisabled);
        }

        let their_key = device.curve25519_key().ok_or_else(|| {
            OlmEncryptionError::UnknownDevice {
                user_id: device.user_id().to_owned(),
                device_id: device.device_id().to_owned(),
            }
        })?;

        let session_id =
            self.device.choose_session(their_key)?.ok_or(OlmEncryptionError::MissingSession)?;
        let message = self
            .device
            .encrypt(their_key, &session_id, &payload.to_string())?
            .ok_or(OlmEncryptionError::MissingSession)?;

        Ok(OlmEventContent {
            algorithm: OLM_ALGORITHM.to_owned(),
            sender_key: self.device.curve25519_key().to_base64(),
            ciphertext: BTreeMap::from([(
                their_key.to_base64(),
                OlmCiphertext::from_message(&message),
            )]),
        })
    }

    /// Share the room's current group session key with every eligible
    /// device of the given users.
    ///
    /// Blocked devices never receive the key. Devices without a pairwise
    /// session are reported back so the caller can claim one-time keys,
    /// establish sessions, and share again. Devices that already received
    /// this session are skipped.
    pub fn share_room_key(
        &self,
        room_id: &str,
        user_ids: &[&str],
    ) -> Result<KeyShareResult, GroupEncryptionError> {
        let content = self.groups.room_key_content(room_id)?;
        let payload = json!({
            "type": ROOM_KEY_EVENT_TYPE,
            "content": serde_json::to_value(&content).map_err(StoreError::from)?,
            "sender": self.user_id,
            "sender_device": self.device_id,
            "keys": { "ed25519": self.device.ed25519_key().to_base64() },
        });

        let mut result = KeyShareResult::default();

        for user_id in user_ids {
            for device in self.directory.user_devices(user_id)? {
                let recipient = (device.user_id().to_owned(), device.device_id().to_owned());

                if recipient.0 == self.user_id && recipient.1 == self.device_id {
                    continue;
                }
                if device.is_blocked() {
                    debug!(
                        user_id = %recipient.0,
                        device_id = %recipient.1,
                        "Withholding a room key from a blocked device"
                    );
                    result.blocked.push(recipient);
                    continue;
                }
                if self.groups.is_shared_with(room_id, &recipient.0, &recipient.1) {
                    continue;
                }

                match self.encrypt_to(&device, &payload) {
                    Ok(content) => {
                        self.groups.mark_shared_with(room_id, &recipient.0, &recipient.1);
                        result.messages.push(ToDeviceMessage {
                            recipient: recipient.0,
                            recipient_device: recipient.1,
                            content,
                        });
                    }
                    Err(
                        OlmEncryptionError::MissingSession
                        | OlmEncryptionError::EncryptionDisabled
                        | OlmEncryptionError::UnknownDevice { .. },
                    ) => {
                        warn!(
                            user_id = %recipient.0,
                            device_id = %recipient.1,
                            "Couldn't wrap the room key for a device"
                        );
                        result.withheld.push(recipient);
                    }
                    Err(OlmEncryptionError::Store(e)) => return Err(e.into()),
                }
            }
        }

        Ok(result)
    }

    /// Handle a to-device event delivered by the transport.
    ///
    /// Olm-encrypted events are unwrapped, creating an inbound pairwise
    /// session on the fly when a pre-key message arrives for a session we
    /// don't have yet. A decrypted (or directly delivered) room key is
    /// installed as an inbound group session.
    pub fn handle_to_device(
        &self,
        event: &ToDeviceEvent,
    ) -> Result<ToDeviceOutcome, OlmEventError> {
        match event.event_type.as_str() {
            ENCRYPTED_EVENT_TYPE => {
                let content: OlmEventContent = serde_json::from_value(event.content.clone())?;

                if content.algorithm != OLM_ALGORITHM {
                    return Err(OlmEventError::UnsupportedAlgorithm(content.algorithm));
                }

                let decrypted = self.decrypt_olm_content(&content)?;

                let inner_type = decrypted.payload.get("type").and_then(Value::as_str);
                if inner_type == Some(ROOM_KEY_EVENT_TYPE) {
                    let content: RoomKeyContent = serde_json::from_value(
                        decrypted.payload.get("content").cloned().unwrap_or(Value::Null),
                    )?;

                    let added = self.groups.receive_room_key(
                        &content,
                        decrypted.sender_key,
                        decrypted.keys_claimed.clone(),
                    )?;

                    Ok(ToDeviceOutcome::RoomKey {
                        room_id: content.room_id.clone(),
                        session_id: content.session_id.clone(),
                        added,
                    })
                } else {
                    Ok(ToDeviceOutcome::Decrypted(decrypted))
                }
            }
            ROOM_KEY_EVENT_TYPE => {
                // A room key that was already unwrapped by the decryption
                // layer; it must carry the sender key that decrypted it.
                let Some(sender_key) = &event.sender_key else {
                    warn!("Dropping a room key event with no sender key attached");
                    return Ok(ToDeviceOutcome::Ignored);
                };
                let sender_key = Curve25519PublicKey::from_base64(sender_key)?;

                let content: RoomKeyContent = serde_json::from_value(event.content.clone())?;
                let keys_claimed = event.keys.clone().unwrap_or_default();

                let added = self.groups.receive_room_key(&content, sender_key, keys_claimed)?;

                Ok(ToDeviceOutcome::RoomKey {
                    room_id: content.room_id.clone(),
                    session_id: content.session_id.clone(),
                    added,
                })
            }
            _ => Ok(ToDeviceOutcome::Ignored),
        }
    }

    fn decrypt_olm_content(
        &self,
        content: &OlmEventContent,
    ) -> Result<DecryptedToDeviceEvent, OlmEventError> {
        let own_key = self.device.curve25519_key().to_base64();
        let ciphertext =
            content.ciphertext.get(&own_key).ok_or(OlmEventError::NotIntendedForDevice)?;

        let sender_key = Curve25519PublicKey::from_base64(&content.sender_key)?;
        let message = ciphertext.to_message()?;

        let plaintext = self.decrypt_olm_message(sender_key, &message)?;
        let payload: Value = serde_json::from_str(&plaintext)?;

        let keys_claimed = payload
            .get("keys")
            .and_then(|keys| serde_json::from_value(keys.clone()).ok())
            .unwrap_or_default();

        Ok(DecryptedToDeviceEvent { payload, sender_key, keys_claimed })
    }

    /// Try every known session with the sender, then fall back to creating
    /// an inbound session if the message is a pre-key message.
    fn decrypt_olm_message(
        &self,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> Result<String, OlmEventError> {
        for session_id in self.device.session_ids(sender_key)? {
            if matches!(message, OlmMessage::PreKey(_))
                && !self.device.matches_inbound_session(sender_key, &session_id, message)?
            {
                continue;
            }

            match self.device.decrypt(sender_key, &session_id, message) {
                Ok(Some(plaintext)) => return Ok(plaintext),
                Ok(None) => continue,
                Err(PairwiseError::Olm(e)) => {
                    warn!(%session_id, error = %e, "A known session rejected the message");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let OlmMessage::PreKey(prekey) = message {
            let result = self.device.create_inbound_session(sender_key, prekey)?;

            Ok(result.payload)
        } else {
            Err(OlmEventError::BadEncryptedMessage)
        }
    }

    /// Forget the replay tracking of a timeline that is being rebuilt.
    pub fn reset_replay_tracking(&self, timeline_id: &str) {
        self.device.reset_replay_tracking(timeline_id)
    }

    /// Drain every buffered store write.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use assert_matches2::assert_let;
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    fn engine(user_id: &str, device_id: &str) -> Result<CryptoEngine> {
        Ok(CryptoEngine::new(user_id, device_id, Arc::new(MemoryStore::new()))?)
    }

    #[test]
    fn the_own_device_record_is_self_signed() -> Result<()> {
        let alice = engine("@alice:example.org", "ALICEDEVICE")?;
        let bob = engine("@bob:example.org", "BOBDEVICE")?;

        let keys = alice.own_device_keys()?;
        assert_eq!(keys.user_id, "@alice:example.org");
        assert_eq!(keys.curve25519_key(), Some(alice.olm_device().curve25519_key()));

        // Another engine's directory accepts the record as-is.
        let outcome = bob.directory().receive_device_keys("@alice:example.org", vec![keys])?;
        assert_eq!(outcome.accepted, ["ALICEDEVICE"]);
        assert!(outcome.rejected.is_empty());

        Ok(())
    }

    #[test]
    fn encrypting_to_a_device_needs_a_session() -> Result<()> {
        let alice = engine("@alice:example.org", "ALICEDEVICE")?;
        let bob = engine("@bob:example.org", "BOBDEVICE")?;

        assert_let!(
            Err(OlmEncryptionError::UnknownDevice { .. }) = alice.encrypt_for_device(
                "@bob:example.org",
                "BOBDEVICE",
                &json!({ "type": "m.dummy" })
            )
        );

        alice.directory().receive_device_keys("@bob:example.org", vec![bob.own_device_keys()?])?;

        assert_let!(
            Err(OlmEncryptionError::MissingSession) = alice.encrypt_for_device(
                "@bob:example.org",
                "BOBDEVICE",
                &json!({ "type": "m.dummy" })
            )
        );

        Ok(())
    }

    #[test]
    fn devices_without_olm_support_are_refused() -> Result<()> {
        let alice = engine("@alice:example.org", "ALICEDEVICE")?;
        let bob = engine("@bob:example.org", "BOBDEVICE")?;

        // Bob's record is re-signed with Megolm as its only algorithm.
        let bob_device = bob.olm_device();
        let mut keys = bob.own_device_keys()?;
        keys.algorithms = vec![MEGOLM_ALGORITHM.to_owned()];
        keys.signatures.clear();
        let value = serde_json::to_value(&keys)?;
        let signature = bob_device.sign_json(&value)?;
        keys.signatures.insert(
            "@bob:example.org".to_owned(),
            BTreeMap::from([("ed25519:BOBDEVICE".to_owned(), signature.to_base64())]),
        );

        alice.directory().receive_device_keys("@bob:example.org", vec![keys])?;

        assert_let!(
            Err(OlmEncryptionError::EncryptionDisabled) = alice.encrypt_for_device(
                "@bob:example.org",
                "BOBDEVICE",
                &json!({ "type": "m.dummy" })
            )
        );

        Ok(())
    }

    #[test]
    fn unrelated_to_device_events_are_ignored() -> Result<()> {
        let alice = engine("@alice:example.org", "ALICEDEVICE")?;

        let event = ToDeviceEvent {
            event_type: "m.key.verification.request".to_owned(),
            sender: "@bob:example.org".to_owned(),
            content: json!({}),
            sender_key: None,
            keys: None,
        };

        assert_let!(ToDeviceOutcome::Ignored = alice.handle_to_device(&event)?);

        Ok(())
    }
}
