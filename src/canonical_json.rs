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

//! Canonical JSON, the byte-deterministic serialization signatures and
//! hashes are computed over.
//!
//! Object keys are sorted by Unicode code point, the output contains no
//! insignificant whitespace, and strings are emitted as raw UTF-8 rather
//! than `\u` escapes. The `signatures` and `unsigned` fields are removed
//! before serialization since the former holds the signature being computed
//! and the latter is mutable server-side metadata. Non-finite numbers can't
//! occur: [`serde_json::Value`] has no representation for NaN or infinity.
//!
//! Every client on a Matrix wire must produce byte-identical output here,
//! otherwise signature verification fails across implementations. The test
//! vectors below are shared with the other SDK families.

use serde_json::Value;
use thiserror::Error;
use vodozemac::{Ed25519PublicKey, Ed25519Signature, SignatureError};

/// Error type describing how producing canonical JSON can fail.
#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    /// Only JSON objects can be signed or verified.
    #[error("canonical JSON is only defined for objects, got a {0}")]
    NotAnObject(&'static str),
    /// The value couldn't be serialized.
    #[error("the object couldn't be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error type describing how verifying a signed JSON object can fail.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The object couldn't be put into canonical form.
    #[error(transparent)]
    Canonical(#[from] CanonicalJsonError),
    /// The signature doesn't match the canonical form of the object.
    #[error("the signature didn't match the canonical JSON: {0}")]
    Signature(#[from] SignatureError),
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Serialize a JSON object into its canonical form, with the `signatures`
/// and `unsigned` fields removed.
///
/// Relies on [`serde_json`] maps being ordered by key, so the crate must not
/// be built with the `preserve_order` feature.
pub fn canonical_json(value: &Value) -> Result<String, CanonicalJsonError> {
    let Value::Object(object) = value else {
        return Err(CanonicalJsonError::NotAnObject(value_kind(value)));
    };

    let mut object = object.clone();
    object.remove("signatures");
    object.remove("unsigned");

    Ok(serde_json::to_string(&object)?)
}

/// Verify an Ed25519 signature over the canonical form of the given JSON
/// object.
pub fn verify_signature(
    key: Ed25519PublicKey,
    value: &Value,
    signature: &Ed25519Signature,
) -> Result<(), VerificationError> {
    let canonical = canonical_json(value)?;
    key.verify(canonical.as_bytes(), signature)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use assert_matches2::assert_let;
    use serde_json::json;

    use super::*;

    #[test]
    fn known_vectors() {
        let cases = [
            (json!({}), "{}"),
            (json!({ "one": 1, "two": "Two" }), r#"{"one":1,"two":"Two"}"#),
            (json!({ "b": "2", "a": "1" }), r#"{"a":"1","b":"2"}"#),
            (json!({"b":"2","a":"1"}), r#"{"a":"1","b":"2"}"#),
            (
                json!({ "auth": { "success": true, "mxid": "@john.doe:example.com", "profile": {
                    "display_name": "John Doe",
                    "three_pids": [
                        { "medium": "email", "address": "john.doe@example.org" },
                        { "medium": "msisdn", "address": "123456789" }
                    ]
                }}}),
                "{\"auth\":{\"mxid\":\"@john.doe:example.com\",\"profile\":{\"display_name\":\
                 \"John Doe\",\"three_pids\":[{\"address\":\"john.doe@example.org\",\"medium\":\
                 \"email\"},{\"address\":\"123456789\",\"medium\":\"msisdn\"}]},\"success\":true}}",
            ),
            (json!({ "a": "日本語" }), "{\"a\":\"日本語\"}"),
            (json!({ "本": 2, "日": 1 }), "{\"日\":1,\"本\":2}"),
            (json!({ "a": "\u{65E5}" }), "{\"a\":\"日\"}"),
            (json!({ "a": null }), r#"{"a":null}"#),
        ];

        for (value, expected) in cases {
            let canonical = canonical_json(&value).expect("objects have a canonical form");
            assert_eq!(canonical, expected);
        }
    }

    #[test]
    fn signatures_and_unsigned_are_stripped() {
        let value = json!({
            "name": "example.org",
            "signatures": {
                "example.org": { "ed25519:1": "s76RUgajp8w172am0zQb/iPTHsRnb4SkrzGoeCOSFfcBY2V/1c8QfrmdXHpvnc2jK5BD1WiJIxiMW95fMjK7Bw" }
            },
            "unsigned": { "age_ts": 922834800000u64 },
        });

        let canonical = canonical_json(&value).expect("objects have a canonical form");
        assert_eq!(canonical, r#"{"name":"example.org"}"#);
    }

    #[test]
    fn non_objects_are_rejected() {
        assert_let!(Err(CanonicalJsonError::NotAnObject(kind)) = canonical_json(&json!([1, 2])));
        assert_eq!(kind, "array");
        assert!(canonical_json(&json!("just a string")).is_err());
    }
}
