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

//! The wire-compatible event content types the engine consumes and
//! produces.
//!
//! The shapes here are fixed by the protocol; renaming a field breaks
//! every other client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use vodozemac::olm::{Message, OlmMessage, PreKeyMessage};
use zeroize::Zeroize;

/// The algorithm name of Megolm-encrypted room events.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// The algorithm name of Olm-encrypted to-device events.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// The event type carrying an encrypted payload.
pub const ENCRYPTED_EVENT_TYPE: &str = "m.room.encrypted";

/// The event type announcing a Megolm session key.
pub const ROOM_KEY_EVENT_TYPE: &str = "m.room_key";

/// Error type describing how an encrypted event content can fail to parse.
#[derive(Debug, Error)]
pub enum ContentDecodeError {
    /// The message type was neither pre-key (0) nor normal (1).
    #[error("unsupported Olm message type, expected 0 or 1, got {0}")]
    UnsupportedMessageType(usize),
    /// The base64 body didn't decode into a valid message.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),
}

/// The content of a Megolm-encrypted room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmEventContent {
    /// The algorithm, always [`MEGOLM_ALGORITHM`].
    pub algorithm: String,
    /// The base64-encoded Megolm ciphertext.
    pub ciphertext: String,
    /// The Curve25519 identity key of the sending device.
    pub sender_key: String,
    /// The id of the sending device.
    pub device_id: String,
    /// The id of the Megolm session that produced the ciphertext.
    pub session_id: String,
}

/// One Olm ciphertext, addressed to a single recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// 0 for a pre-key message, 1 for a normal message.
    #[serde(rename = "type")]
    pub message_type: usize,
    /// The base64-encoded message body.
    pub body: String,
}

impl OlmCiphertext {
    /// Parse the ciphertext into a typed Olm message.
    pub fn to_message(&self) -> Result<OlmMessage, ContentDecodeError> {
        match self.message_type {
            0 => Ok(OlmMessage::PreKey(PreKeyMessage::from_base64(&self.body)?)),
            1 => Ok(OlmMessage::Normal(Message::from_base64(&self.body)?)),
            t => Err(ContentDecodeError::UnsupportedMessageType(t)),
        }
    }

    pub fn from_message(message: &OlmMessage) -> Self {
        match message {
            OlmMessage::PreKey(m) => Self { message_type: 0, body: m.to_base64() },
            OlmMessage::Normal(m) => Self { message_type: 1, body: m.to_base64() },
        }
    }
}

/// The content of an Olm-encrypted to-device event.
///
/// The ciphertext map is keyed by the Curve25519 identity key of the
/// recipient device; a recipient picks out its own entry and ignores the
/// rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmEventContent {
    /// The algorithm, always [`OLM_ALGORITHM`].
    pub algorithm: String,
    /// The Curve25519 identity key of the sending device.
    pub sender_key: String,
    /// Per-recipient ciphertexts.
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

/// The decrypted content of an `m.room_key` to-device event.
#[derive(Clone, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm the announced session uses.
    pub algorithm: String,
    /// The room the session is bound to.
    pub room_id: String,
    /// The id of the announced session.
    pub session_id: String,
    /// The exported Megolm session key.
    pub session_key: String,
}

impl Drop for RoomKeyContent {
    fn drop(&mut self) {
        self.session_key.zeroize()
    }
}

/// A to-device event as the transport delivers it.
///
/// `sender_key` and `keys` are not part of the wire format; the decryption
/// layer fills them in when it unwraps an Olm envelope, so that handlers of
/// the inner event know which device cryptographically sent it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The user that sent the event.
    pub sender: String,
    /// The content of the event.
    pub content: Value,
    /// The Curve25519 key of the device the event was decrypted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,
    /// The keys the sending device claimed inside the Olm envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<BTreeMap<String, String>>,
}

/// An encrypted room event, reduced to what decryption needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedRoomEvent {
    /// The room the event was received in.
    pub room_id: String,
    /// The encrypted content.
    pub content: MegolmEventContent,
}

/// An encrypted to-device message ready to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToDeviceMessage {
    /// The user to deliver the message to.
    pub recipient: String,
    /// The device of the recipient to deliver the message to.
    pub recipient_device: String,
    /// The Olm-encrypted content.
    pub content: OlmEventContent,
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn megolm_content_wire_format() {
        let content = MegolmEventContent {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            ciphertext: "AwgAE...".to_owned(),
            sender_key: "sender-curve25519".to_owned(),
            device_id: "ALICEDEVICE".to_owned(),
            session_id: "session-id".to_owned(),
        };

        let value = serde_json::to_value(&content).expect("the content should serialize");
        assert_eq!(
            value,
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "ciphertext": "AwgAE...",
                "sender_key": "sender-curve25519",
                "device_id": "ALICEDEVICE",
                "session_id": "session-id",
            })
        );
    }

    #[test]
    fn olm_content_uses_type_and_body() {
        let json = json!({
            "algorithm": "m.olm.v1.curve25519-aes-sha2",
            "sender_key": "sender-curve25519",
            "ciphertext": {
                "recipient-curve25519": { "type": 0, "body": "AwoB..." }
            }
        });

        let content: OlmEventContent =
            serde_json::from_value(json.clone()).expect("the content should deserialize");
        assert_eq!(content.ciphertext["recipient-curve25519"].message_type, 0);
        assert_eq!(
            serde_json::to_value(&content).expect("the content should serialize"),
            json
        );
    }

    #[test]
    fn unknown_message_types_are_rejected() {
        let ciphertext = OlmCiphertext { message_type: 2, body: "AwoB".to_owned() };

        assert!(matches!(
            ciphertext.to_message(),
            Err(ContentDecodeError::UnsupportedMessageType(2))
        ));
    }

    #[test]
    fn room_key_content_roundtrip() {
        let json = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "room_id": "!room:example.org",
            "session_id": "session-id",
            "session_key": "AgAAAA...",
        });

        let content: RoomKeyContent =
            serde_json::from_value(json.clone()).expect("the content should deserialize");
        assert_eq!(content.room_id, "!room:example.org");
        assert_eq!(
            serde_json::to_value(&content).expect("the content should serialize"),
            json
        );
    }
}
