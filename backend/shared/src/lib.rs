//! Wire model shared between the keysign coordinator and relay tooling.
//!
//! Everything a mediator server ever sees lives in this crate: encrypted
//! envelopes, setup-message records and completion notices. Key material
//! and plaintext protocol messages never appear here.

pub mod signature;

pub use signature::{ KeysignSignature, SignatureData, SignatureFamily };

use serde::{ Deserialize, Serialize };
use sha2::{ Digest, Sha256 };

/// One encrypted, addressed protocol message exchanged via the relay.
///
/// `body` is base64(nonce || AES-256-GCM ciphertext) and `hash` is the
/// content hash of `body` as transmitted, so duplicate deliveries can be
/// detected without decrypting. An envelope is immutable once created.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub body: String,
    pub hash: String,
    pub sequence_no: u64,
}

impl Envelope {
    /// Content hash used for deduplication and relay addressing,
    /// computed over the body exactly as received.
    pub fn content_hash(body: &str) -> String {
        hex::encode(Sha256::digest(body.as_bytes()))
    }
}

/// A setup message as stored on the relay, keyed by session and message id.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetupRecord {
    pub session_id: String,
    pub message_id: String,
    /// base64(nonce || ciphertext) of the engine setup message.
    pub payload: String,
}

/// Completion notice posted to the verification endpoint after a
/// signature has been assembled locally. Delivery is best-effort.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CompletionNotice {
    pub message_id: String,
    pub signature: signature::KeysignSignature,
}
