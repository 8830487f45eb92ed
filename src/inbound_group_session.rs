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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vodozemac::{
    megolm::{self, DecryptedMessage, MegolmMessage, SessionConfig, SessionKey},
    Curve25519PublicKey,
};

/// An inbound Megolm session together with the context it was received in.
///
/// The Megolm ratchet alone doesn't say where its ciphertexts belong, so the
/// session carries the room it was announced for, the Curve25519 key of the
/// device that sent it, and whatever further keys that device claimed to
/// own. Once a session is stored, all three are immutable: a later room key
/// for the same session id must not rebind or rewind an existing ratchet.
pub struct InboundGroupSession {
    inner: megolm::InboundGroupSession,
    room_id: String,
    sender_key: Curve25519PublicKey,
    keys_claimed: BTreeMap<String, String>,
}

impl InboundGroupSession {
    /// Create a session from an exported session key.
    pub fn new(
        session_key: &SessionKey,
        room_id: &str,
        sender_key: Curve25519PublicKey,
        keys_claimed: BTreeMap<String, String>,
    ) -> Self {
        Self {
            inner: megolm::InboundGroupSession::new(session_key, SessionConfig::version_1()),
            room_id: room_id.to_owned(),
            sender_key,
            keys_claimed,
        }
    }

    /// The globally unique id of this session.
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// The room this session is bound to.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The Curve25519 key of the device the session key arrived from.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The keys the sender claimed to own when announcing the session,
    /// keyed by algorithm name.
    pub fn keys_claimed(&self) -> &BTreeMap<String, String> {
        &self.keys_claimed
    }

    /// The first message index this session is able to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.inner.first_known_index()
    }

    /// Decrypt a Megolm message, advancing the ratchet if needed.
    pub fn decrypt(
        &mut self,
        message: &MegolmMessage,
    ) -> Result<DecryptedMessage, megolm::DecryptionError> {
        self.inner.decrypt(message)
    }

    /// Convert the session into a struct which implements
    /// [`serde::Serialize`] and [`serde::Deserialize`].
    pub fn pickle(&self) -> InboundGroupSessionPickle {
        InboundGroupSessionPickle {
            session: self.inner.pickle(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            keys_claimed: self.keys_claimed.clone(),
        }
    }

    /// Restore an [`InboundGroupSession`] from a previously saved
    /// [`InboundGroupSessionPickle`].
    pub fn from_pickle(pickle: InboundGroupSessionPickle) -> Self {
        Self {
            inner: megolm::InboundGroupSession::from_pickle(pickle.session),
            room_id: pickle.room_id,
            sender_key: pickle.sender_key,
            keys_claimed: pickle.keys_claimed,
        }
    }
}

/// A format suitable for serialization which implements
/// [`serde::Serialize`] and [`serde::Deserialize`]. Obtainable by calling
/// [`InboundGroupSession::pickle`].
#[derive(Serialize, Deserialize)]
pub struct InboundGroupSessionPickle {
    session: megolm::InboundGroupSessionPickle,
    room_id: String,
    sender_key: Curve25519PublicKey,
    keys_claimed: BTreeMap<String, String>,
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use vodozemac::megolm::{GroupSession, SessionConfig};

    use super::InboundGroupSession;

    #[test]
    fn pickling_preserves_the_session_context() {
        let outbound = GroupSession::new(SessionConfig::version_1());
        let sender_key = vodozemac::olm::Account::new().curve25519_key();

        let keys_claimed =
            BTreeMap::from([("ed25519".to_owned(), "fingerprint-of-the-sender".to_owned())]);
        let session = InboundGroupSession::new(
            &outbound.session_key(),
            "!room:example.org",
            sender_key,
            keys_claimed.clone(),
        );

        assert_eq!(session.session_id(), outbound.session_id());

        let json = serde_json::to_string(&session.pickle()).expect("the pickle should serialize");
        let pickle = serde_json::from_str(&json).expect("the pickle should deserialize");
        let restored = InboundGroupSession::from_pickle(pickle);

        assert_eq!(restored.session_id(), session.session_id());
        assert_eq!(restored.room_id(), "!room:example.org");
        assert_eq!(restored.sender_key(), sender_key);
        assert_eq!(restored.keys_claimed(), &keys_claimed);
    }
}
