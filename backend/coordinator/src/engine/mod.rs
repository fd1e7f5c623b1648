//! Uniform interface over the per-family cryptographic engines.
//!
//! Each family (ECDSA, EdDSA, ML-DSA) wraps its own opaque protocol state
//! behind [`SigningEngine`] and [`EngineSession`]. The coordinator drives
//! every family through the same skeleton: build or decode a setup
//! message, open a session, drain outbound messages, feed inbound ones,
//! finalize once the engine reports completion. Format quirks stay inside
//! the adapters.

pub mod derive;
pub mod ecdsa;
pub mod eddsa;
pub mod mldsa;

use serde::{ Deserialize, Serialize };
use shared::signature::{ SignatureData, SignatureFamily };

use crate::error::KeysignError;

pub use ecdsa::EcdsaEngine;
pub use eddsa::EddsaEngine;
pub use mldsa::MldsaEngine;

/// One engine message addressed to a single committee member.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub to: String,
    pub payload: Vec<u8>,
}

/// Setup message content common to all families. The initiator builds it,
/// everyone else derives their session from it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetupMessage {
    /// hex identifier of the key share the ceremony signs with
    pub key_share_id: String,
    /// ordered committee, the local party included
    pub committee: Vec<String>,
    /// hex digest being signed
    pub msg_digest: String,
    pub derivation_path: Option<String>,
}

impl SetupMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeysignError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeysignError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An opened signing session: the owning handle to one party's protocol
/// state for one digest. Dropping it on any path releases the state;
/// [`EngineSession::finalize`] consumes it so release happens exactly once.
pub trait EngineSession {
    /// Drains every message the engine currently wants to send. Must be
    /// called until empty before waiting on the inbox, otherwise the
    /// ceremony stalls.
    fn outbound(&mut self) -> Result<Vec<OutboundMessage>, KeysignError>;

    /// Feeds one decrypted peer message. Returns the engine's completion
    /// flag. Idempotence is the coordinator's job (hash dedup), not the
    /// engine's.
    fn apply(&mut self, from: &str, message: &[u8]) -> Result<bool, KeysignError>;

    fn is_finished(&self) -> bool;

    /// Produces the raw signature. Only valid after the engine has
    /// reported completion.
    fn finalize(self) -> Result<SignatureData, KeysignError>;
}

/// One signature family's engine.
pub trait SigningEngine {
    type Session: EngineSession;

    fn family(&self) -> SignatureFamily;

    /// Derives the public identifier of an opaque key share.
    fn key_share_id(&self, key_share: &[u8]) -> Result<Vec<u8>, KeysignError>;

    /// Builds the setup message. Initiator only.
    fn build_setup(
        &self,
        key_share: &[u8],
        committee: &[String],
        msg_digest: &str,
        derivation_path: Option<&str>
    ) -> Result<Vec<u8>, KeysignError>;

    /// Extracts the digest a setup message commits to, where the family
    /// supports the check. The ML-DSA engine returns `None`: its setup
    /// message is trusted as published (see DESIGN.md).
    fn decode_setup_digest(&self, setup: &[u8]) -> Option<Result<String, KeysignError>>;

    fn open_session(
        &self,
        setup: &[u8],
        local_party_id: &str,
        key_share: &[u8]
    ) -> Result<Self::Session, KeysignError>;
}

pub(crate) fn decode_digest_hex(
    msg_digest: &str,
    expected_len: Option<usize>
) -> Result<Vec<u8>, KeysignError> {
    let bytes = hex
        ::decode(msg_digest)
        .map_err(|_| {
            KeysignError::SetupConstruction(format!("digest {msg_digest:?} is not valid hex"))
        })?;
    if bytes.is_empty() {
        return Err(KeysignError::SetupConstruction("digest is empty".to_string()));
    }
    if let Some(len) = expected_len {
        if bytes.len() != len {
            return Err(
                KeysignError::SetupConstruction(
                    format!("digest must be {len} bytes, got {}", bytes.len())
                )
            );
        }
    }
    Ok(bytes)
}

fn check_committee(committee: &[String]) -> Result<(), KeysignError> {
    if committee.len() < 2 {
        return Err(
            KeysignError::SetupConstruction("committee must have at least two members".to_string())
        );
    }
    let mut sorted = committee.to_vec();
    sorted.sort();
    sorted.dedup();
    if sorted.len() != committee.len() {
        return Err(
            KeysignError::SetupConstruction("committee contains duplicate parties".to_string())
        );
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::{ EngineSession, OutboundMessage };
    use std::collections::BTreeMap;

    /// Runs a set of sessions to completion by delivering every outbound
    /// message directly, no relay involved. Panics on a stalled exchange.
    pub(crate) fn run_loopback<S: EngineSession>(sessions: &mut BTreeMap<String, S>) {
        loop {
            let mut in_flight: Vec<(String, OutboundMessage)> = Vec::new();
            for (party, session) in sessions.iter_mut() {
                for message in session.outbound().expect("drain outbound") {
                    in_flight.push((party.clone(), message));
                }
            }

            if sessions.values().all(|session| session.is_finished()) {
                return;
            }
            assert!(!in_flight.is_empty(), "message exchange stalled before completion");

            for (from, message) in in_flight {
                let session = sessions.get_mut(&message.to).expect("recipient session");
                session.apply(&from, &message.payload).expect("apply message");
            }
        }
    }
}
