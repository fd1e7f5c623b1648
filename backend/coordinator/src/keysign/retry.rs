//! Retry controller for a single digest.

use tracing::{ info, warn };

use crate::config::CeremonyConfig;
use crate::engine::SigningEngine;
use crate::envelope::SESSION_KEY_BYTES_LEN;
use crate::error::KeysignError;
use crate::keysign::{ round, CancelToken, KeysignParams };
use crate::relay::Relay;
use shared::KeysignSignature;

/// Runs attempts for one digest until one succeeds or the budget runs
/// out. Every attempt starts from scratch: fresh setup fetch, fresh
/// session, empty dedup state. Cancellation is surfaced immediately and
/// never retried.
pub(crate) async fn sign_with_retry<E, R>(
    engine: &E,
    relay: &R,
    params: &KeysignParams,
    key: &[u8; SESSION_KEY_BYTES_LEN],
    digest: &str,
    config: &CeremonyConfig,
    cancel: &CancelToken
) -> Result<KeysignSignature, KeysignError>
    where E: SigningEngine, R: Relay + ?Sized
{
    let mut last_error: Option<KeysignError> = None;

    for attempt in 0..config.max_attempts {
        if cancel.is_cancelled() {
            return Err(KeysignError::Cancelled);
        }
        info!(attempt, digest, "starting signing attempt");
        match round::run_round(engine, relay, params, key, digest, attempt, config, cancel).await {
            Ok(data) => {
                return Ok(KeysignSignature {
                    msg_digest: digest.to_string(),
                    data,
                });
            }
            Err(KeysignError::Cancelled) => {
                return Err(KeysignError::Cancelled);
            }
            Err(err) => {
                warn!(attempt, digest, "signing attempt failed: {err}");
                last_error = Some(err);
            }
        }
    }

    Err(
        last_error.unwrap_or_else(|| {
            KeysignError::InvalidParams("retry budget is zero".to_string())
        })
    )
}
