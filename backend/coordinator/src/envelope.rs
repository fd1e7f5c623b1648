//! Envelope codec: serialize, encrypt, base64, and the reverse.
//!
//! Every protocol message for a session is encrypted with the session-wide
//! symmetric key under AES-256-GCM, so a tampered or wrong-key body fails
//! authentication instead of decrypting to garbage. The deduplication hash
//! is computed over the body as transmitted, before any decryption.

use aes_gcm::aead::{ generic_array::GenericArray, Aead, KeyInit };
use aes_gcm::Aes256Gcm;
use rand::RngCore;
use shared::Envelope;

use crate::error::KeysignError;

pub const SESSION_KEY_BYTES_LEN: usize = 32;
const NONCE_BYTES_LEN: usize = 12;

/// Decodes the hex session key handed over by the caller.
pub fn session_key_from_hex(hex_key: &str) -> Result<[u8; SESSION_KEY_BYTES_LEN], KeysignError> {
    let bytes = hex
        ::decode(hex_key)
        .map_err(|_| KeysignError::InvalidParams("session key is not valid hex".to_string()))?;
    bytes
        .try_into()
        .map_err(|_|
            KeysignError::InvalidParams(
                format!("session key must be {} bytes", SESSION_KEY_BYTES_LEN)
            )
        )
}

/// Encrypts a raw payload into base64(nonce || ciphertext). Used both for
/// envelope bodies and for setup messages stored on the relay.
pub fn seal_raw(
    plaintext: &[u8],
    key: &[u8; SESSION_KEY_BYTES_LEN]
) -> Result<String, KeysignError> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_BYTES_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| KeysignError::SetupConstruction("AEAD encryption failed".to_string()))?;

    let mut body = Vec::with_capacity(NONCE_BYTES_LEN + ciphertext.len());
    body.extend_from_slice(&nonce_bytes);
    body.extend_from_slice(&ciphertext);
    Ok(base64::encode(body))
}

/// Reverses [`seal_raw`]. Fails with `DecryptionFailed` on a wrong key,
/// a truncated body or any tampering.
pub fn open_raw(
    body: &str,
    key: &[u8; SESSION_KEY_BYTES_LEN]
) -> Result<Vec<u8>, KeysignError> {
    let raw = base64::decode(body).map_err(|_| KeysignError::DecryptionFailed)?;
    if raw.len() <= NONCE_BYTES_LEN {
        return Err(KeysignError::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_BYTES_LEN);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| KeysignError::DecryptionFailed)
}

/// Wraps one outbound engine message into an immutable envelope.
pub fn seal(
    from: &str,
    to: &str,
    sequence_no: u64,
    plaintext: &[u8],
    key: &[u8; SESSION_KEY_BYTES_LEN]
) -> Result<Envelope, KeysignError> {
    let body = seal_raw(plaintext, key)?;
    let hash = Envelope::content_hash(&body);
    Ok(Envelope {
        from: from.to_string(),
        to: to.to_string(),
        body,
        hash,
        sequence_no,
    })
}

/// Decrypts a received envelope body.
pub fn open(
    envelope: &Envelope,
    key: &[u8; SESSION_KEY_BYTES_LEN]
) -> Result<Vec<u8>, KeysignError> {
    open_raw(&envelope.body, key)
}
