use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong while running a keysign ceremony.
///
/// Apart from [`KeysignError::Cancelled`], every variant is converted to
/// "this attempt failed" at the round boundary; the retry controller then
/// decides whether attempts remain. No partial signature ever escapes: the
/// engine is only finalized after it has reported completion itself.
#[derive(Debug, Error)]
pub enum KeysignError {
    #[error("relay returned status {status}: {body}")] Transport {
        status: u16,
        body: String,
    },

    #[error("relay request failed: {0}")] Http(#[from] reqwest::Error),

    #[error("failed to decrypt envelope (wrong key or tampered body)")]
    DecryptionFailed,

    #[error("invalid key share: {0}")] KeyShareInvalid(String),

    #[error("failed to construct setup message: {0}")] SetupConstruction(String),

    #[error("setup message commits to digest {actual}, expected {expected}")] SetupDigestMismatch {
        expected: String,
        actual: String,
    },

    #[error("failed to open signing session: {0}")] SessionSetup(String),

    #[error("failed to apply protocol message: {0}")] MessageApplication(String),

    #[error("failed to finalize signature: {0}")] Finalization(String),

    #[error("no terminating message within {0:?}")] CeremonyTimeout(Duration),

    #[error("ceremony cancelled")]
    Cancelled,

    #[error("wire codec error: {0}")] Codec(#[from] serde_json::Error),

    #[error("invalid ceremony parameters: {0}")] InvalidParams(String),
}

impl KeysignError {
    /// Timeouts and cancellation are flow control, not protocol faults.
    pub fn is_protocol_fault(&self) -> bool {
        !matches!(self, KeysignError::CeremonyTimeout(_) | KeysignError::Cancelled)
    }
}
