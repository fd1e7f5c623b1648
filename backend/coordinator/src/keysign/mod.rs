//! Keysign ceremony orchestration.
//!
//! A ceremony signs a batch of message digests with one key share, one
//! digest at a time. Each digest gets its own isolated signing round with
//! a retry budget; a digest failing or timing out never aborts the rest of
//! the batch. Cancellation is cooperative: the token is checked between
//! polls and between digests, and an in-flight relay request is allowed to
//! complete.

mod retry;
mod round;

use std::collections::BTreeMap;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;

use shared::{ CompletionNotice, KeysignSignature };
use tracing::{ error, info, instrument, warn };
use uuid::Uuid;

use crate::config::CeremonyConfig;
use crate::engine::SigningEngine;
use crate::envelope;
use crate::error::KeysignError;
use crate::relay::Relay;

/// Everything a party needs to join one ceremony.
#[derive(Clone, Debug)]
pub struct KeysignParams {
    pub session_id: String,
    pub local_party_id: String,
    /// ordered committee, identical on every device
    pub committee: Vec<String>,
    /// whether this party publishes the setup message
    pub is_initiator: bool,
    /// hex AES-256 session key shared out of band
    pub hex_encryption_key: String,
    /// opaque, engine-specific key share
    pub key_share: Vec<u8>,
    /// hex digests, signed in order
    pub messages_to_sign: Vec<String>,
    pub derivation_path: Option<String>,
}

impl KeysignParams {
    fn validate(&self) -> Result<(), KeysignError> {
        if self.session_id.is_empty() {
            return Err(KeysignError::InvalidParams("session id is empty".to_string()));
        }
        if self.committee.len() < 2 {
            return Err(
                KeysignError::InvalidParams(
                    "committee must have at least two members".to_string()
                )
            );
        }
        let mut deduped = self.committee.clone();
        deduped.sort();
        deduped.dedup();
        if deduped.len() != self.committee.len() {
            return Err(
                KeysignError::InvalidParams("committee contains duplicate parties".to_string())
            );
        }
        if !self.committee.contains(&self.local_party_id) {
            return Err(
                KeysignError::InvalidParams(
                    format!("local party {:?} is not in the committee", self.local_party_id)
                )
            );
        }
        if self.messages_to_sign.is_empty() {
            return Err(KeysignError::InvalidParams("no messages to sign".to_string()));
        }
        envelope::session_key_from_hex(&self.hex_encryption_key)?;
        Ok(())
    }
}

/// Fresh session id for a new ceremony.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Cooperative cancellation flag, cloneable across tasks and threads.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-digest results of one ceremony.
#[derive(Debug, Default)]
pub struct KeysignOutcome {
    pub signatures: BTreeMap<String, KeysignSignature>,
    pub failures: BTreeMap<String, KeysignError>,
}

impl KeysignOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs a full ceremony for the local party.
///
/// Digests are processed strictly in order. A digest that exhausts its
/// retry budget lands in `failures` and processing moves on; only
/// cancellation stops the batch early. Each produced signature is reported
/// to the relay on a detached task, the outcome does not wait for or
/// depend on that delivery.
#[instrument(skip_all, fields(session_id = %params.session_id, party = %params.local_party_id))]
pub async fn run_ceremony<E, R>(
    engine: &E,
    relay: Arc<R>,
    params: &KeysignParams,
    config: &CeremonyConfig,
    cancel: &CancelToken
) -> Result<KeysignOutcome, KeysignError>
    where E: SigningEngine, R: Relay + 'static
{
    params.validate()?;
    let key = envelope::session_key_from_hex(&params.hex_encryption_key)?;
    info!(digests = params.messages_to_sign.len(), family = %engine.family(), "ceremony started");

    let mut outcome = KeysignOutcome::default();
    for digest in &params.messages_to_sign {
        if cancel.is_cancelled() {
            outcome.failures.insert(digest.clone(), KeysignError::Cancelled);
            break;
        }
        match
            retry::sign_with_retry(engine, relay.as_ref(), params, &key, digest, config, cancel).await
        {
            Ok(signature) => {
                report_completion(relay.clone(), params.session_id.clone(), signature.clone());
                outcome.signatures.insert(digest.clone(), signature);
            }
            Err(KeysignError::Cancelled) => {
                info!(digest, "ceremony cancelled");
                outcome.failures.insert(digest.clone(), KeysignError::Cancelled);
                break;
            }
            Err(err) => {
                error!(digest, "digest failed after all attempts: {err}");
                outcome.failures.insert(digest.clone(), err);
            }
        }
    }

    info!(
        signed = outcome.signatures.len(),
        failed = outcome.failures.len(),
        "ceremony finished"
    );
    Ok(outcome)
}

/// Fire-and-forget completion notice.
fn report_completion<R: Relay + 'static>(
    relay: Arc<R>,
    session_id: String,
    signature: KeysignSignature
) {
    tokio::spawn(async move {
        let notice = CompletionNotice {
            message_id: signature.msg_digest.clone(),
            signature,
        };
        if let Err(err) = relay.report_completion(&session_id, &notice).await {
            warn!(%session_id, "completion notice was not delivered: {err}");
        }
    });
}
