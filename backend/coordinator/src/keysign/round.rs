//! One signing attempt for one digest: setup, message exchange, finalize.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{ debug, info, instrument, warn };

use crate::config::CeremonyConfig;
use crate::engine::{ EngineSession, SigningEngine };
use crate::envelope::{ self, SESSION_KEY_BYTES_LEN };
use crate::error::KeysignError;
use crate::keysign::{ CancelToken, KeysignParams };
use crate::relay::Relay;
use shared::signature::SignatureData;

/// Runs one attempt end to end. All protocol state is created inside and
/// dropped on any exit path, so a failed attempt leaves nothing behind for
/// the next one to trip over.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(digest = %digest, attempt))]
pub(crate) async fn run_round<E, R>(
    engine: &E,
    relay: &R,
    params: &KeysignParams,
    key: &[u8; SESSION_KEY_BYTES_LEN],
    digest: &str,
    attempt: u32,
    config: &CeremonyConfig,
    cancel: &CancelToken
) -> Result<SignatureData, KeysignError>
    where E: SigningEngine, R: Relay + ?Sized
{
    // The digest doubles as the relay-side message id, scoping inboxes
    // and the setup slot to this digest.
    let message_id = digest;
    let deadline = Instant::now() + config.exchange_timeout;

    let setup = obtain_setup(engine, relay, params, key, digest, attempt, config, deadline, cancel).await?;
    verify_setup_digest(engine, &setup, digest)?;

    let mut session = engine.open_session(&setup, &params.local_party_id, &params.key_share)?;
    let mut sequence_no: u64 = 0;
    let mut applied_hashes: HashSet<String> = HashSet::new();

    flush_outbound(relay, params, key, message_id, &mut session, &mut sequence_no).await?;

    while !session.is_finished() {
        if cancel.is_cancelled() {
            return Err(KeysignError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(KeysignError::CeremonyTimeout(config.exchange_timeout));
        }

        let inbox = relay.poll(&params.session_id, &params.local_party_id, message_id).await?;
        let mut applied_any = false;
        for envelope in inbox {
            if envelope.to != params.local_party_id {
                debug!(to = %envelope.to, "skipping misaddressed envelope");
                continue;
            }
            if applied_hashes.contains(&envelope.hash) {
                // Redelivery of an envelope we already applied; consume it
                // again so the relay can drop it.
                relay.acknowledge(
                    &params.session_id,
                    &params.local_party_id,
                    &envelope.hash,
                    message_id
                ).await?;
                continue;
            }

            let plaintext = envelope::open(&envelope, key)?;
            let finished = session.apply(&envelope.from, &plaintext)?;
            applied_hashes.insert(envelope.hash.clone());
            relay.acknowledge(
                &params.session_id,
                &params.local_party_id,
                &envelope.hash,
                message_id
            ).await?;
            flush_outbound(relay, params, key, message_id, &mut session, &mut sequence_no).await?;
            applied_any = true;
            if finished {
                break;
            }
        }

        if session.is_finished() {
            break;
        }
        if !applied_any {
            tokio::time::sleep(config.poll_interval).await;
        }
    }

    // Peers may still be waiting on our last messages even though we are
    // done locally.
    flush_outbound(relay, params, key, message_id, &mut session, &mut sequence_no).await?;

    info!("signing round completed");
    session.finalize()
}

/// Publishes the setup message when this party initiates the first
/// attempt, otherwise fetches it from the relay, waiting for the initiator
/// if needed.
#[allow(clippy::too_many_arguments)]
async fn obtain_setup<E, R>(
    engine: &E,
    relay: &R,
    params: &KeysignParams,
    key: &[u8; SESSION_KEY_BYTES_LEN],
    digest: &str,
    attempt: u32,
    config: &CeremonyConfig,
    deadline: Instant,
    cancel: &CancelToken
) -> Result<Vec<u8>, KeysignError>
    where E: SigningEngine, R: Relay + ?Sized
{
    if params.is_initiator && attempt == 0 {
        let setup = engine.build_setup(
            &params.key_share,
            &params.committee,
            digest,
            params.derivation_path.as_deref()
        )?;
        let payload = envelope::seal_raw(&setup, key)?;
        relay.post_setup(&params.session_id, digest, &payload).await?;
        debug!("setup message published");
        return Ok(setup);
    }

    loop {
        if cancel.is_cancelled() {
            return Err(KeysignError::Cancelled);
        }
        if let Some(payload) = relay.fetch_setup(&params.session_id, digest).await? {
            return envelope::open_raw(&payload, key);
        }
        if Instant::now() >= deadline {
            return Err(KeysignError::CeremonyTimeout(config.exchange_timeout));
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

/// Cross-checks the digest embedded in the setup message against the one
/// this round is supposed to sign, for engines that expose it.
fn verify_setup_digest<E: SigningEngine>(
    engine: &E,
    setup: &[u8],
    digest: &str
) -> Result<(), KeysignError> {
    match engine.decode_setup_digest(setup) {
        Some(Ok(actual)) if actual == digest => Ok(()),
        Some(Ok(actual)) =>
            Err(KeysignError::SetupDigestMismatch {
                expected: digest.to_string(),
                actual,
            }),
        Some(Err(err)) => Err(err),
        None => {
            warn!(
                family = %engine.family(),
                "engine exposes no setup digest check; trusting the published setup message"
            );
            Ok(())
        }
    }
}

/// Seals and publishes every message the engine wants to send.
async fn flush_outbound<S, R>(
    relay: &R,
    params: &KeysignParams,
    key: &[u8; SESSION_KEY_BYTES_LEN],
    message_id: &str,
    session: &mut S,
    sequence_no: &mut u64
) -> Result<(), KeysignError>
    where S: EngineSession, R: Relay + ?Sized
{
    for outbound in session.outbound()? {
        let envelope = envelope::seal(
            &params.local_party_id,
            &outbound.to,
            *sequence_no,
            &outbound.payload,
            key
        )?;
        *sequence_no += 1;
        relay.publish(&params.session_id, message_id, &envelope).await?;
    }
    Ok(())
}
