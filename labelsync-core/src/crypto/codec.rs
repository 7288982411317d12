//! AES-256-CBC label codec.
//!
//! Key material is derived deterministically from the wallet fingerprint:
//! - key: first 32 hex characters of `SHA1(fingerprint)`, as ASCII bytes
//! - iv: first 16 bytes of `SHA256(key)`
//! - wallet id: hex `SHA256(fingerprint)`
//!
//! The IV is fixed per wallet, so equal labels always produce equal
//! ciphertexts. The label server relies on this wire format.

use crate::crypto::{CodecError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroize;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encryption material and server-side identity for one wallet.
#[derive(Clone, PartialEq, Eq)]
pub struct SyncCredentials {
    password: [u8; 32],
    iv: [u8; 16],
    wallet_id: String,
}

impl SyncCredentials {
    /// Hex wallet identifier sent to the label server.
    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    /// The AES-256 key bytes (use sparingly)
    pub fn password(&self) -> &[u8; 32] {
        &self.password
    }

    /// The fixed CBC initialization vector
    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }
}

impl fmt::Debug for SyncCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCredentials")
            .field("wallet_id", &self.wallet_id)
            .finish_non_exhaustive()
    }
}

impl Drop for SyncCredentials {
    fn drop(&mut self) {
        self.password.zeroize();
        self.iv.zeroize();
    }
}

/// Derive the sync credentials for a wallet fingerprint.
pub fn derive_credentials(fingerprint: &[u8]) -> Result<SyncCredentials> {
    if fingerprint.is_empty() {
        return Err(CodecError::InvalidFingerprint);
    }

    let mut hex_digest = hex::encode(Sha1::digest(fingerprint));
    let mut password = [0u8; 32];
    password.copy_from_slice(&hex_digest.as_bytes()[..32]);
    hex_digest.zeroize();

    let mut iv = [0u8; 16];
    iv.copy_from_slice(&Sha256::digest(password)[..16]);

    let wallet_id = hex::encode(Sha256::digest(fingerprint));

    Ok(SyncCredentials {
        password,
        iv,
        wallet_id,
    })
}

/// Encrypt a label and wrap it in base64.
pub fn encode(credentials: &SyncCredentials, plaintext: &str) -> String {
    encode_bytes(credentials, plaintext.as_bytes())
}

pub(crate) fn encode_bytes(credentials: &SyncCredentials, plaintext: &[u8]) -> String {
    let ciphertext = Aes256CbcEnc::new(&credentials.password.into(), &credentials.iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    STANDARD.encode(ciphertext)
}

/// Reverse [`encode`]. The plaintext must be UTF-8 and survive a JSON
/// string round-trip, otherwise the label is rejected.
pub fn decode(credentials: &SyncCredentials, ciphertext: &str) -> Result<String> {
    let raw = STANDARD
        .decode(ciphertext)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;

    let plaintext = Aes256CbcDec::new(&credentials.password.into(), &credentials.iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&raw)
        .map_err(|_| CodecError::DecryptionFailed)?;

    validate_label(plaintext)
}

fn validate_label(bytes: Vec<u8>) -> Result<String> {
    let label = String::from_utf8(bytes).map_err(|e| CodecError::InvalidLabel(e.to_string()))?;

    let json = serde_json::to_string(&label).map_err(|e| CodecError::InvalidLabel(e.to_string()))?;
    let back: String =
        serde_json::from_str(&json).map_err(|e| CodecError::InvalidLabel(e.to_string()))?;
    if back != label {
        return Err(CodecError::InvalidLabel("JSON round-trip changed label".to_string()));
    }

    Ok(label)
}
