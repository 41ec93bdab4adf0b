// Copyright 2020 The Matrix.org Foundation C.I.C.
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

use olm_rs::utility::OlmUtility;
use ruma::{DeviceKeyAlgorithm, DeviceKeyId, UserId};
use serde_json::Value;

use crate::error::SignatureError;

/// Verify the ed25519 signature of a signed JSON object.
///
/// The object is expected to carry its signatures in the usual Matrix form,
/// `signatures: { user_id: { key_id: signature } }`. The signature of the
/// given key is checked against the canonical serialization of the object,
/// with `signatures` and `unsigned` left out the way the signer dropped them.
///
/// # Arguments
///
/// * `user_id` - The user who signed the JSON object.
///
/// * `key_id` - The id of the key that signed the JSON object.
///
/// * `signing_key` - The public ed25519 key which was used to sign the JSON
///   object.
///
/// * `json` - The JSON object that should be verified.
pub(crate) fn verify_json(
    user_id: &UserId,
    key_id: &DeviceKeyId,
    signing_key: &str,
    json: &Value,
) -> Result<(), SignatureError> {
    if key_id.algorithm() != DeviceKeyAlgorithm::Ed25519 {
        return Err(SignatureError::UnsupportedAlgorithm);
    }

    let signature = json
        .get("signatures")
        .and_then(|s| s.get(user_id.as_str()))
        .and_then(|s| s.get(key_id.to_string()))
        .and_then(|s| s.as_str())
        .ok_or(SignatureError::NoSignatureFound)?;

    let canonical_json = canonical_signable_json(json)?;

    if OlmUtility::new()
        .ed25519_verify(signing_key, &canonical_json, signature.to_string())
        .is_ok()
    {
        Ok(())
    } else {
        Err(SignatureError::VerificationError)
    }
}

/// The canonical serialization a signature covers: the object with its
/// `signatures` and `unsigned` fields removed.
fn canonical_signable_json(json: &Value) -> Result<String, SignatureError> {
    let mut object = json
        .as_object()
        .ok_or(SignatureError::NotAnObject)?
        .clone();

    object.remove("signatures");
    object.remove("unsigned");

    Ok(serde_json::to_string(&object)?)
}

#[cfg(test)]
mod test {
    use ruma::{user_id, DeviceKeyAlgorithm, DeviceKeyId};
    use serde_json::json;

    use super::verify_json;
    use crate::olm::Account;

    #[tokio::test]
    async fn tampering_with_a_signed_payload_is_detected() {
        let user_id = user_id!("@alice:example.org");
        let account = Account::new(user_id, "DEVICEID".into());
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, "DEVICEID".into());

        let mut payload = json!({"key": "fFOBhz9FZZIzGTdTnkOiDc9dLZOhfA1UcnH3nMx9cbQ"});
        let signature = account.sign_json(&payload).await;

        payload["signatures"] = json!({
            "@alice:example.org": { "ed25519:DEVICEID": signature }
        });

        verify_json(user_id, &key_id, account.ed25519_key(), &payload).unwrap();

        // The `unsigned` field isn't covered by the signature.
        payload["unsigned"] = json!({"device_display_name": "Alice's phone"});
        verify_json(user_id, &key_id, account.ed25519_key(), &payload).unwrap();

        payload["key"] = json!("tampered");
        assert!(verify_json(user_id, &key_id, account.ed25519_key(), &payload).is_err());
    }
}
