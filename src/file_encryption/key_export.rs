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

use std::io::{Cursor, Read, Seek, SeekFrom};

use aes_ctr::{
    cipher::stream::{NewStreamCipher, SyncStreamCipher},
    Aes256Ctr,
};
use base64::{decode_config, encode_config, DecodeError, STANDARD_NO_PAD};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use hmac::{Hmac, Mac, NewMac};
use pbkdf2::pbkdf2;
use rand::{thread_rng, RngCore};
use sha2::{Sha256, Sha512};
use thiserror::Error;

use crate::types::ExportedRoomKey;

const SALT_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const KEY_SIZE: usize = 32;
const VERSION: u8 = 1;

const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";
const LINE_WIDTH: usize = 96;

/// The default PBKDF2 iteration count of the export scheme.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 500_000;

/// Error representing a failure during key export or import.
#[derive(Error, Debug)]
pub enum KeyExportError {
    /// The export file uses a scheme version we don't understand.
    #[error("the key export file uses an unsupported version")]
    UnsupportedVersion,

    /// The MAC over the export file didn't validate, wrong passphrase or
    /// corrupted file.
    #[error("the MAC of the key export file is invalid")]
    InvalidMac,

    /// The export file is truncated or otherwise malformed.
    #[error("the key export file is malformed")]
    MalformedFile,

    /// The base64 armor couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The decrypted payload isn't a valid room key list.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Reading from the file buffer failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) fn decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, DecodeError> {
    decode_config(input, STANDARD_NO_PAD)
}

pub(crate) fn encode(input: impl AsRef<[u8]>) -> String {
    encode_config(input, STANDARD_NO_PAD)
}

/// Encrypt a list of room keys into the Megolm export file format.
///
/// # Arguments
///
/// * `keys` - The sessions that should end up in the export.
///
/// * `passphrase` - The passphrase the file is protected with.
///
/// * `rounds` - The PBKDF2 iteration count. Zero means the keys are
///   serialized without any encryption.
pub fn encrypt_key_export(
    keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<String, KeyExportError> {
    let plaintext = serde_json::to_string(keys)?;

    if rounds == 0 {
        return Ok(plaintext);
    }

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];

    let mut rng = thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);
    // Clear the highest counter bit so the CTR counter can't overflow.
    iv[8] &= 0x7f;

    let mut derived_keys = [0u8; KEY_SIZE * 2];
    pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), &salt, rounds, &mut derived_keys);
    let (key, hmac_key) = derived_keys.split_at(KEY_SIZE);

    let mut ciphertext = plaintext.into_bytes();
    let mut aes = Aes256Ctr::new_var(key, &iv).map_err(|_| KeyExportError::MalformedFile)?;
    aes.apply_keystream(&mut ciphertext);

    let mut payload: Vec<u8> = Vec::new();
    payload.write_u8(VERSION)?;
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&iv);
    payload.write_u32::<BigEndian>(rounds)?;
    payload.extend_from_slice(&ciphertext);

    let mut hmac = Hmac::<Sha256>::new_varkey(hmac_key)
        .expect("HMAC can take a key of any size");
    hmac.update(&payload);
    let mac = hmac.finalize().into_bytes();
    payload.extend_from_slice(&mac);

    let mut armored = String::from(HEADER);
    armored.push('\n');

    let encoded = encode(&payload);
    for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
        armored.push_str(std::str::from_utf8(chunk).expect("base64 output is ASCII"));
        armored.push('\n');
    }

    armored.push_str(FOOTER);
    armored.push('\n');

    Ok(armored)
}

/// Decrypt a Megolm export file back into a list of room keys.
///
/// A blob without the `MEGOLM SESSION DATA` armor is treated as an
/// unencrypted export, the counterpart of `encrypt_key_export` with zero
/// rounds.
pub fn decrypt_key_export(
    blob: &str,
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    if !blob.trim_start().starts_with(HEADER) {
        return Ok(serde_json::from_str(blob)?);
    }

    let payload: String = blob
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect();

    let plaintext = decrypt_helper(&payload, passphrase)?;

    Ok(serde_json::from_str(&plaintext)?)
}

fn decrypt_helper(ciphertext: &str, passphrase: &str) -> Result<String, KeyExportError> {
    let decoded = decode(ciphertext)?;

    if decoded.len() < 1 + SALT_SIZE + IV_SIZE + 4 + MAC_SIZE {
        return Err(KeyExportError::MalformedFile);
    }

    let mut decoded = Cursor::new(decoded);

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    let mut mac = [0u8; MAC_SIZE];
    let mut derived_keys = [0u8; KEY_SIZE * 2];

    let version = decoded.read_u8()?;
    decoded.read_exact(&mut salt)?;
    decoded.read_exact(&mut iv)?;

    let rounds = decoded.read_u32::<BigEndian>()?;
    let ciphertext_start = decoded.position() as usize;

    decoded.seek(SeekFrom::End(-(MAC_SIZE as i64)))?;
    let ciphertext_end = decoded.position() as usize;

    decoded.read_exact(&mut mac)?;

    let mut decoded = decoded.into_inner();

    if version != VERSION {
        return Err(KeyExportError::UnsupportedVersion);
    }

    pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), &salt, rounds, &mut derived_keys);
    let (key, hmac_key) = derived_keys.split_at(KEY_SIZE);

    let mut hmac = Hmac::<Sha256>::new_varkey(hmac_key)
        .expect("HMAC can take a key of any size");
    hmac.update(&decoded[0..ciphertext_end]);
    hmac.verify(&mac).map_err(|_| KeyExportError::InvalidMac)?;

    let ciphertext = &mut decoded[ciphertext_start..ciphertext_end];
    let mut aes = Aes256Ctr::new_var(key, &iv).map_err(|_| KeyExportError::MalformedFile)?;
    aes.apply_keystream(ciphertext);

    String::from_utf8(ciphertext.to_owned()).map_err(|_| KeyExportError::MalformedFile)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use ruma::{room_id, EventEncryptionAlgorithm};

    use super::{decrypt_key_export, encrypt_key_export};
    use crate::types::ExportedRoomKey;

    const PASSPHRASE: &str = "1234";

    fn export_fixture() -> Vec<ExportedRoomKey> {
        let mut sender_claimed_keys = BTreeMap::new();
        sender_claimed_keys.insert("ed25519".to_owned(), "aV1nb25ze".to_owned());

        vec![ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: room_id!("!test:localhost").to_owned(),
            sender_key: "8Hr7dK+AYy7cRfJZk0ihCa0cGl3IT1TVBTJkCn1gmGk".to_owned(),
            session_id: "X3lUlvLELLYxeTx4yOVu6UDpasGEVO0Jbu+QFnm0cKQ".to_owned(),
            session_key: "AgAAAAAwMTIzNDU2Nzg5MDEyMzQ1".to_owned(),
            sender_claimed_keys,
            forwarding_curve25519_key_chain: vec![],
        }]
    }

    #[test]
    fn encrypted_export_round_trips() {
        let keys = export_fixture();

        // Small round count to keep the test fast.
        let encrypted = encrypt_key_export(&keys, PASSPHRASE, 10).unwrap();

        assert!(encrypted.starts_with("-----BEGIN MEGOLM SESSION DATA-----"));

        let decrypted = decrypt_key_export(&encrypted, PASSPHRASE).unwrap();
        assert_eq!(keys, decrypted);
    }

    #[test]
    fn wrong_passphrase_is_detected() {
        let keys = export_fixture();

        let encrypted = encrypt_key_export(&keys, PASSPHRASE, 10).unwrap();
        assert!(decrypt_key_export(&encrypted, "wrong").is_err());
    }

    #[test]
    fn zero_rounds_mean_no_encryption() {
        let keys = export_fixture();

        let exported = encrypt_key_export(&keys, "", 0).unwrap();

        // It's plain JSON, readable without the passphrase.
        assert!(exported.starts_with('['));
        let decrypted = decrypt_key_export(&exported, "anything").unwrap();
        assert_eq!(keys, decrypted);
    }
}
