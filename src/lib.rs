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

#![deny(
    clippy::mem_forget,
    clippy::unwrap_used,
    dead_code,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unsafe_op_in_unsafe_fn,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    rust_2018_idioms
)]
#![doc = include_str!("../README.md")]

mod canonical_json;
mod device;
mod directory;
mod engine;
mod group_sessions;
mod inbound_group_session;
mod replay;
mod utilities;

pub mod events;
pub mod store;

pub use canonical_json::{canonical_json, verify_signature, CanonicalJsonError, VerificationError};
pub use device::{
    DecryptedGroupMessage, InboundSessionResult, MegolmDecryptionError, OlmDevice, PairwiseError,
};
pub use directory::{
    DeviceDirectory, DeviceInfo, DeviceKeyError, DeviceKeys, DeviceUpdateOutcome,
    VerificationState,
};
pub use engine::{
    CryptoEngine, DecryptedToDeviceEvent, KeyShareResult, OlmEncryptionError, OlmEventError,
    ToDeviceOutcome,
};
pub use group_sessions::{GroupEncryptionError, GroupSessionManager};
pub use inbound_group_session::{InboundGroupSession, InboundGroupSessionPickle};
pub use utilities::sha256;
pub use vodozemac;
pub use vodozemac::{
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature, KeyError, SignatureError,
};
