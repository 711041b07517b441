//! Replication cryptography.
//!
//! Group payloads mirrored through the gateway are sealed with AES-256-GCM under
//! the group's current replication secret, with a fresh 12-byte nonce prepended
//! to the ciphertext (`base64(iv || ciphertext || tag)`). Secrets themselves are
//! handed to members over NIP-44.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use nostr_sdk::nips::nip44;
use nostr_sdk::prelude::*;
use rand::Rng;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::shared::ResultExt;
use crate::util::{bytes_to_hex_string, hex_string_to_bytes, sha256_hex};

const NONCE_LEN: usize = 12;

/// A 32-byte symmetric replication secret, wiped on drop
pub type SecretKeyBytes = Zeroizing<[u8; 32]>;

/// Generate a fresh random replication secret
pub fn generate_secret() -> SecretKeyBytes {
    let mut rng = rand::thread_rng();
    Zeroizing::new(rng.gen())
}

pub fn secret_to_hex(secret: &SecretKeyBytes) -> String {
    bytes_to_hex_string(secret.as_ref())
}

pub fn secret_from_hex(hex: &str) -> Result<SecretKeyBytes> {
    let bytes = Zeroizing::new(
        hex_string_to_bytes(hex.trim()).ok_or_else(|| Error::Crypto("Secret is not valid hex".into()))?,
    );
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Crypto(format!("Secret must be 32 bytes, got {}", bytes.len())))?;
    Ok(Zeroizing::new(arr))
}

/// Seal `plaintext` under `key`; output is `base64(iv || ciphertext)`
pub fn encrypt_payload(plaintext: &[u8], key: &[u8; 32]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key).context(Error::Crypto, "Invalid replication key")?;

    let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .context(Error::Crypto, "Failed to encrypt payload")?;

    let mut buffer = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    buffer.extend_from_slice(&nonce_bytes);
    buffer.extend_from_slice(&ciphertext);

    Ok(base64_simd::STANDARD.encode_to_string(&buffer))
}

/// Open a payload produced by [`encrypt_payload`]
pub fn decrypt_payload(encoded: &str, key: &[u8; 32]) -> Result<Vec<u8>> {
    let data = base64_simd::STANDARD
        .decode_to_vec(encoded.as_bytes())
        .context(Error::Crypto, "Payload is not valid base64")?;

    if data.len() <= NONCE_LEN {
        return Err(Error::Crypto("Payload too short".into()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key).context(Error::Crypto, "Invalid replication key")?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .context(Error::Crypto, "Failed to decrypt payload")
}

/// Opaque relay id used on the gateway so it never sees the group identifier
pub fn relay_hash(group_id: &str) -> String {
    sha256_hex(group_id.as_bytes())
}

/// NIP-44 encrypt for a single recipient
pub fn seal_for(keys: &Keys, recipient: &PublicKey, plaintext: &str) -> Result<String> {
    nip44::encrypt(keys.secret_key(), recipient, plaintext, nip44::Version::V2)
        .context(Error::Crypto, "NIP-44 encryption failed")
}

/// NIP-44 decrypt a payload sent to us by `sender`
pub fn open_from(keys: &Keys, sender: &PublicKey, payload: &str) -> Result<String> {
    nip44::decrypt(keys.secret_key(), sender, payload).context(Error::Crypto, "NIP-44 decryption failed")
}
