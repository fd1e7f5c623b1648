//! Lattice engine built on ML-DSA-87.
//!
//! There is no threshold scheme here: every committee member holds a full
//! ML-DSA keypair and the aggregate signature is the ordered set of
//! per-party signatures, each valid under that party's public key. A
//! commit-reveal exchange keeps the transcript honest: parties first
//! broadcast a hash of their signature, then reveal it once every
//! commitment is in, so nobody can adapt their contribution to what they
//! have seen.
//!
//! This engine does not decode digests out of setup messages, so the
//! coordinator's setup cross-check is skipped for this family and the
//! initiator's setup message is taken at face value.

use std::collections::{ BTreeMap, BTreeSet };
use std::mem;

use pqcrypto_mldsa::mldsa87;
use pqcrypto_traits::sign::DetachedSignature as _;
use pqcrypto_traits::sign::PublicKey as _;
use pqcrypto_traits::sign::SecretKey as _;
use serde::{ Deserialize, Serialize };
use sha2::{ Digest, Sha256 };
use shared::signature::{ SignatureData, SignatureFamily };
use tracing::instrument;

use crate::engine::{ check_committee, decode_digest_hex };
use crate::engine::{ EngineSession, OutboundMessage, SetupMessage, SigningEngine };
use crate::error::KeysignError;

/// Opaque key share format for the lattice family.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MldsaKeyShare {
    /// party id -> base64 ML-DSA-87 public key, whole committee included
    pub committee_keys: BTreeMap<String, String>,
    /// base64 ML-DSA-87 secret key of the local party
    pub secret_key: String,
}

impl MldsaKeyShare {
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeysignError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeysignError> {
        serde_json
            ::from_slice(bytes)
            .map_err(|err| KeysignError::KeyShareInvalid(format!("ML-DSA key share: {err}")))
    }
}

#[derive(Deserialize, Serialize)]
enum MldsaWireMessage {
    /// hex SHA-256 over the signature bytes revealed later
    Commitment { hash: String },
    Reveal { signature: Vec<u8> },
}

/// One party's slice of the aggregate signature.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MldsaComponent {
    pub party: String,
    /// hex detached signature
    pub signature: String,
}

#[derive(Clone, Copy, Default)]
pub struct MldsaEngine;

impl MldsaEngine {
    pub fn new() -> Self {
        Self
    }
}

fn decode_public_key(party: &str, encoded: &str) -> Result<mldsa87::PublicKey, KeysignError> {
    let bytes = base64
        ::decode(encoded)
        .map_err(|_| {
            KeysignError::KeyShareInvalid(format!("public key for {party:?} is not valid base64"))
        })?;
    mldsa87::PublicKey
        ::from_bytes(&bytes)
        .map_err(|_| KeysignError::KeyShareInvalid(format!("public key for {party:?} is malformed")))
}

impl SigningEngine for MldsaEngine {
    type Session = MldsaSession;

    fn family(&self) -> SignatureFamily {
        SignatureFamily::Mldsa
    }

    fn key_share_id(&self, key_share: &[u8]) -> Result<Vec<u8>, KeysignError> {
        let share = MldsaKeyShare::from_bytes(key_share)?;
        // The committee key set is the closest thing to a group key.
        let mut hasher = Sha256::new();
        for (party, encoded) in &share.committee_keys {
            hasher.update(party.as_bytes());
            hasher.update(decode_public_key(party, encoded)?.as_bytes());
        }
        Ok(hasher.finalize().to_vec())
    }

    fn build_setup(
        &self,
        key_share: &[u8],
        committee: &[String],
        msg_digest: &str,
        derivation_path: Option<&str>
    ) -> Result<Vec<u8>, KeysignError> {
        check_committee(committee)?;
        decode_digest_hex(msg_digest, None)?;
        if derivation_path.is_some() {
            return Err(
                KeysignError::SetupConstruction(
                    "key derivation is not supported for the ML-DSA family".to_string()
                )
            );
        }
        let setup = SetupMessage {
            key_share_id: hex::encode(self.key_share_id(key_share)?),
            committee: committee.to_vec(),
            msg_digest: msg_digest.to_string(),
            derivation_path: None,
        };
        setup.to_bytes()
    }

    fn decode_setup_digest(&self, _setup: &[u8]) -> Option<Result<String, KeysignError>> {
        None
    }

    #[instrument(skip_all)]
    fn open_session(
        &self,
        setup: &[u8],
        local_party_id: &str,
        key_share: &[u8]
    ) -> Result<Self::Session, KeysignError> {
        let setup = SetupMessage::from_bytes(setup)?;
        let share = MldsaKeyShare::from_bytes(key_share)?;

        if setup.derivation_path.is_some() {
            return Err(
                KeysignError::SessionSetup(
                    "key derivation is not supported for the ML-DSA family".to_string()
                )
            );
        }
        if !setup.committee.iter().any(|party| party == local_party_id) {
            return Err(
                KeysignError::SessionSetup(
                    format!("local party {local_party_id:?} is not in the committee")
                )
            );
        }
        let digest = decode_digest_hex(&setup.msg_digest, None).map_err(|err|
            KeysignError::SessionSetup(err.to_string())
        )?;

        let mut public_keys = BTreeMap::new();
        for party in &setup.committee {
            let encoded = share.committee_keys
                .get(party)
                .ok_or_else(|| {
                    KeysignError::SessionSetup(
                        format!("party {party:?} has no public key in the key share")
                    )
                })?;
            public_keys.insert(party.clone(), decode_public_key(party, encoded)?);
        }

        let secret_bytes = base64
            ::decode(&share.secret_key)
            .map_err(|_| KeysignError::KeyShareInvalid("secret key is not valid base64".to_string()))?;
        let secret_key = mldsa87::SecretKey
            ::from_bytes(&secret_bytes)
            .map_err(|_| KeysignError::KeyShareInvalid("secret key is malformed".to_string()))?;

        let own_signature = mldsa87::detached_sign(&digest, &secret_key).as_bytes().to_vec();

        let mut session = MldsaSession {
            local_party_id: local_party_id.to_string(),
            committee: setup.committee,
            public_keys,
            digest,
            own_signature: own_signature.clone(),
            commitments: BTreeMap::new(),
            reveals: BTreeMap::new(),
            verified: BTreeSet::new(),
            revealed: false,
            pending: Vec::new(),
            aggregate: None,
        };
        let own_commitment = hex::encode(Sha256::digest(&own_signature));
        session.commitments.insert(session.local_party_id.clone(), own_commitment.clone());
        session.broadcast(&MldsaWireMessage::Commitment { hash: own_commitment })?;
        Ok(session)
    }
}

pub struct MldsaSession {
    local_party_id: String,
    committee: Vec<String>,
    public_keys: BTreeMap<String, mldsa87::PublicKey>,
    digest: Vec<u8>,
    own_signature: Vec<u8>,
    commitments: BTreeMap<String, String>,
    reveals: BTreeMap<String, Vec<u8>>,
    verified: BTreeSet<String>,
    revealed: bool,
    pending: Vec<OutboundMessage>,
    aggregate: Option<Vec<u8>>,
}

impl MldsaSession {
    fn broadcast(&mut self, message: &MldsaWireMessage) -> Result<(), KeysignError> {
        let payload = serde_json::to_vec(message)?;
        for party in &self.committee {
            if party != &self.local_party_id {
                self.pending.push(OutboundMessage {
                    to: party.clone(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<(), KeysignError> {
        if !self.revealed && self.commitments.len() == self.committee.len() {
            let own = self.own_signature.clone();
            self.reveals.insert(self.local_party_id.clone(), own.clone());
            self.broadcast(&(MldsaWireMessage::Reveal { signature: own }))?;
            self.revealed = true;
        }

        let unchecked: Vec<String> = self.reveals
            .keys()
            .filter(|party| !self.verified.contains(*party))
            .cloned()
            .collect();
        for party in unchecked {
            let signature = &self.reveals[&party];
            let commitment = self.commitments
                .get(&party)
                .ok_or_else(|| {
                    KeysignError::MessageApplication(
                        format!("party {party:?} revealed before committing")
                    )
                })?;
            if hex::encode(Sha256::digest(signature)) != *commitment {
                return Err(
                    KeysignError::MessageApplication(
                        format!("reveal from {party:?} does not match its commitment")
                    )
                );
            }
            let detached = mldsa87::DetachedSignature
                ::from_bytes(signature)
                .map_err(|_| {
                    KeysignError::MessageApplication(format!("reveal from {party:?} is malformed"))
                })?;
            let public_key = &self.public_keys[&party];
            mldsa87
                ::verify_detached_signature(&detached, &self.digest, public_key)
                .map_err(|_| {
                    KeysignError::MessageApplication(
                        format!("signature share from {party:?} does not verify")
                    )
                })?;
            self.verified.insert(party);
        }

        if self.aggregate.is_none() && self.verified.len() == self.committee.len() {
            let components: Vec<MldsaComponent> = self.committee
                .iter()
                .map(|party| MldsaComponent {
                    party: party.clone(),
                    signature: hex::encode(&self.reveals[party]),
                })
                .collect();
            self.aggregate = Some(serde_json::to_vec(&components)?);
        }
        Ok(())
    }
}

impl EngineSession for MldsaSession {
    fn outbound(&mut self) -> Result<Vec<OutboundMessage>, KeysignError> {
        Ok(mem::take(&mut self.pending))
    }

    fn apply(&mut self, from: &str, message: &[u8]) -> Result<bool, KeysignError> {
        if !self.public_keys.contains_key(from) {
            return Err(
                KeysignError::MessageApplication(format!("message from unknown party {from:?}"))
            );
        }
        let message: MldsaWireMessage = serde_json
            ::from_slice(message)
            .map_err(|err| KeysignError::MessageApplication(format!("wire format: {err}")))?;

        match message {
            MldsaWireMessage::Commitment { hash } => {
                match self.commitments.get(from) {
                    Some(existing) if *existing != hash => {
                        return Err(
                            KeysignError::MessageApplication(
                                format!("party {from:?} sent conflicting commitments")
                            )
                        );
                    }
                    _ => {
                        self.commitments.insert(from.to_string(), hash);
                    }
                }
            }
            MldsaWireMessage::Reveal { signature } => {
                self.reveals.insert(from.to_string(), signature);
            }
        }
        self.advance()?;
        Ok(self.is_finished())
    }

    fn is_finished(&self) -> bool {
        self.aggregate.is_some()
    }

    fn finalize(self) -> Result<SignatureData, KeysignError> {
        let aggregate = self.aggregate.ok_or_else(|| {
            KeysignError::Finalization("signing has not completed".to_string())
        })?;
        Ok(SignatureData::Mldsa {
            signature: hex::encode(aggregate),
        })
    }
}

/// Checks a hex-encoded aggregate against the committee key set: every
/// member must be present and every component must verify.
pub fn verify_aggregate(
    committee_keys: &BTreeMap<String, String>,
    msg_digest: &str,
    aggregate_hex: &str
) -> Result<(), KeysignError> {
    let digest = decode_digest_hex(msg_digest, None)?;
    let raw = hex
        ::decode(aggregate_hex)
        .map_err(|_| KeysignError::Finalization("aggregate is not valid hex".to_string()))?;
    let components: Vec<MldsaComponent> = serde_json::from_slice(&raw)?;

    let signed: BTreeSet<&str> = components
        .iter()
        .map(|component| component.party.as_str())
        .collect();
    for party in committee_keys.keys() {
        if !signed.contains(party.as_str()) {
            return Err(
                KeysignError::Finalization(format!("aggregate is missing a share from {party:?}"))
            );
        }
    }

    for component in &components {
        let encoded = committee_keys
            .get(&component.party)
            .ok_or_else(|| {
                KeysignError::Finalization(
                    format!("aggregate contains unknown party {:?}", component.party)
                )
            })?;
        let public_key = decode_public_key(&component.party, encoded)?;
        let bytes = hex
            ::decode(&component.signature)
            .map_err(|_| {
                KeysignError::Finalization(
                    format!("component from {:?} is not valid hex", component.party)
                )
            })?;
        let detached = mldsa87::DetachedSignature
            ::from_bytes(&bytes)
            .map_err(|_| {
                KeysignError::Finalization(format!("component from {:?} is malformed", component.party))
            })?;
        mldsa87
            ::verify_detached_signature(&detached, &digest, &public_key)
            .map_err(|_| {
                KeysignError::Finalization(
                    format!("component from {:?} does not verify", component.party)
                )
            })?;
    }
    Ok(())
}
