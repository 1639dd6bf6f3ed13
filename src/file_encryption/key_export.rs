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

//! The passphrase-based encryption scheme of the room key export file.
//!
//! The exported keys are AES-256-CTR encrypted and authenticated with
//! HMAC-SHA256, both keys derived from the passphrase with PBKDF2-SHA512,
//! then armored in base64 between well-known header and footer lines.

use std::io::Cursor;

use aes::{
    cipher::{NewCipher, StreamCipher},
    Aes256Ctr,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use getrandom::getrandom;
use hmac::{Hmac, Mac, NewMac};
use pbkdf2::pbkdf2;
use sha2::{Sha256, Sha512};
use thiserror::Error;
use zeroize::Zeroizing;

const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";

const VERSION: u8 = 1;
const SALT_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const KEY_SIZE: usize = 32;
const HEADER_SIZE: usize = 1 + SALT_SIZE + IV_SIZE + 4;

/// The iteration count used when the caller doesn't supply one.
pub const DEFAULT_PBKDF_ITERATIONS: u32 = 500_000;

/// Error representing a failure to decrypt or parse a room key export.
#[derive(Error, Debug)]
pub enum KeyExportError {
    #[error("the key export is missing its header or footer")]
    InvalidHeaders,

    #[error("the key export isn't valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("the key export uses an unsupported version")]
    UnsupportedVersion,

    #[error("the MAC of the key export is invalid, wrong passphrase?")]
    InvalidMac,

    #[error("the key export is truncated or otherwise malformed")]
    InvalidData,
}

/// Does the given blob look like an armored key export.
pub fn is_key_export(data: &[u8]) -> bool {
    std::str::from_utf8(data)
        .map(|s| s.trim_start().starts_with(HEADER))
        .unwrap_or(false)
}

fn derive_keys(
    passphrase: &str,
    salt: &[u8],
    rounds: u32,
) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
    let mut derived = Zeroizing::new(vec![0u8; KEY_SIZE * 2]);
    pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt, rounds, &mut derived);

    let aes_key = Zeroizing::new(derived[0..KEY_SIZE].to_vec());
    let mac_key = Zeroizing::new(derived[KEY_SIZE..].to_vec());

    (aes_key, mac_key)
}

/// Encrypt the serialized room key list with the given passphrase.
///
/// # Arguments
///
/// * `plaintext` - The serialized list of exported room keys.
///
/// * `passphrase` - The passphrase the export is protected with.
///
/// * `rounds` - The PBKDF2 iteration count, larger counts slow brute-force
/// attempts down.
pub fn encrypt_key_export(
    plaintext: &str,
    passphrase: &str,
    rounds: u32,
) -> Result<String, KeyExportError> {
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];

    getrandom(&mut salt).map_err(|_| KeyExportError::InvalidData)?;
    getrandom(&mut iv).map_err(|_| KeyExportError::InvalidData)?;

    let (aes_key, mac_key) = derive_keys(passphrase, &salt, rounds);

    let mut ciphertext = plaintext.as_bytes().to_vec();
    let mut cipher = Aes256Ctr::new_from_slices(&aes_key, &iv)
        .map_err(|_| KeyExportError::InvalidData)?;
    cipher.apply_keystream(&mut ciphertext);

    let mut payload = Vec::with_capacity(HEADER_SIZE + ciphertext.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&iv);
    payload.write_u32::<BigEndian>(rounds).map_err(|_| KeyExportError::InvalidData)?;
    payload.extend_from_slice(&ciphertext);

    let mut mac = Hmac::<Sha256>::new_from_slice(&mac_key)
        .map_err(|_| KeyExportError::InvalidData)?;
    mac.update(&payload);
    payload.extend_from_slice(&mac.finalize().into_bytes());

    let base64 = base64::encode(&payload);

    let mut armored = String::with_capacity(base64.len() + HEADER.len() + FOOTER.len() + 4);
    armored.push_str(HEADER);
    armored.push('\n');

    for chunk in base64.as_bytes().chunks(96) {
        armored.push_str(std::str::from_utf8(chunk).expect("base64 output is ASCII"));
        armored.push('\n');
    }

    armored.push_str(FOOTER);
    armored.push('\n');

    Ok(armored)
}

/// Decrypt an armored room key export with the given passphrase.
///
/// Returns the serialized list of exported room keys.
pub fn decrypt_key_export(data: &[u8], passphrase: &str) -> Result<String, KeyExportError> {
    let armored = std::str::from_utf8(data).map_err(|_| KeyExportError::InvalidHeaders)?;

    let mut lines = armored.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some(HEADER) {
        return Err(KeyExportError::InvalidHeaders);
    }

    let mut base64 = String::new();
    let mut saw_footer = false;

    for line in lines {
        if line == FOOTER {
            saw_footer = true;
            break;
        }
        base64.push_str(line);
    }

    if !saw_footer {
        return Err(KeyExportError::InvalidHeaders);
    }

    let payload = base64::decode(&base64)?;

    if payload.len() < HEADER_SIZE + MAC_SIZE {
        return Err(KeyExportError::InvalidData);
    }

    let (signed, tag) = payload.split_at(payload.len() - MAC_SIZE);

    let mut cursor = Cursor::new(signed);

    let version = cursor.read_u8().map_err(|_| KeyExportError::InvalidData)?;
    if version != VERSION {
        return Err(KeyExportError::UnsupportedVersion);
    }

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    std::io::Read::read_exact(&mut cursor, &mut salt)
        .map_err(|_| KeyExportError::InvalidData)?;
    std::io::Read::read_exact(&mut cursor, &mut iv)
        .map_err(|_| KeyExportError::InvalidData)?;
    let rounds = cursor.read_u32::<BigEndian>().map_err(|_| KeyExportError::InvalidData)?;

    let (aes_key, mac_key) = derive_keys(passphrase, &salt, rounds);

    let mut mac = Hmac::<Sha256>::new_from_slice(&mac_key)
        .map_err(|_| KeyExportError::InvalidData)?;
    mac.update(signed);
    mac.verify(tag).map_err(|_| KeyExportError::InvalidMac)?;

    let mut plaintext = signed[HEADER_SIZE..].to_vec();
    let mut cipher = Aes256Ctr::new_from_slices(&aes_key, &iv)
        .map_err(|_| KeyExportError::InvalidData)?;
    cipher.apply_keystream(&mut plaintext);

    String::from_utf8(plaintext).map_err(|_| KeyExportError::InvalidData)
}

#[cfg(test)]
mod test {
    use matches::assert_matches;

    use super::{decrypt_key_export, encrypt_key_export, is_key_export, KeyExportError};

    const PLAINTEXT: &str = r#"[{"algorithm":"m.megolm.v1.aes-sha2","room_id":"!test:example.org"}]"#;

    #[test]
    fn export_roundtrip() {
        let export = encrypt_key_export(PLAINTEXT, "secret passphrase", 100).unwrap();

        assert!(is_key_export(export.as_bytes()));
        assert!(export.starts_with("-----BEGIN MEGOLM SESSION DATA-----"));
        assert!(export.trim_end().ends_with("-----END MEGOLM SESSION DATA-----"));

        let decrypted = decrypt_key_export(export.as_bytes(), "secret passphrase").unwrap();
        assert_eq!(decrypted, PLAINTEXT);
    }

    #[test]
    fn wrong_passphrase_is_detected() {
        let export = encrypt_key_export(PLAINTEXT, "secret passphrase", 100).unwrap();

        assert_matches!(
            decrypt_key_export(export.as_bytes(), "wrong passphrase"),
            Err(KeyExportError::InvalidMac)
        );
    }

    #[test]
    fn malformed_exports_are_rejected() {
        assert_matches!(
            decrypt_key_export(b"not an export", "passphrase"),
            Err(KeyExportError::InvalidHeaders)
        );

        let truncated =
            "-----BEGIN MEGOLM SESSION DATA-----\nAAAA\n-----END MEGOLM SESSION DATA-----\n";
        assert_matches!(
            decrypt_key_export(truncated.as_bytes(), "passphrase"),
            Err(KeyExportError::InvalidData)
        );
    }
}
