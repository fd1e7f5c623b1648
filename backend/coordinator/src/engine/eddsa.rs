//! EdDSA engine over Ed25519, built on the two-round FROST protocol.
//!
//! Round one broadcasts nonce commitments, round two broadcasts signature
//! shares; every party aggregates locally so no one holds a privileged
//! coordinator role. Signature shares arriving before the local party has
//! assembled its signing package are buffered, ordering across the rounds
//! is not guaranteed by the relay.

use std::collections::BTreeMap;
use std::mem;

use frost_ed25519::keys::{ KeyPackage, PublicKeyPackage };
use frost_ed25519::round1::{ self, SigningCommitments, SigningNonces };
use frost_ed25519::round2::{ self, SignatureShare };
use frost_ed25519::{ Identifier, SigningPackage };
use rand::rngs::OsRng;
use serde::{ Deserialize, Serialize };
use sha2::{ Digest, Sha256 };
use shared::signature::{ SignatureData, SignatureFamily };
use tracing::instrument;

use crate::engine::{ check_committee, decode_digest_hex };
use crate::engine::{ EngineSession, OutboundMessage, SetupMessage, SigningEngine };
use crate::error::KeysignError;

/// Opaque key share format for the EdDSA family.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EddsaKeyShare {
    /// party id -> FROST identifier index (1-based)
    pub identifiers: BTreeMap<String, u16>,
    pub key_package: KeyPackage,
    pub public_key_package: PublicKeyPackage,
}

impl EddsaKeyShare {
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeysignError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeysignError> {
        serde_json
            ::from_slice(bytes)
            .map_err(|err| KeysignError::KeyShareInvalid(format!("EdDSA key share: {err}")))
    }
}

#[derive(Deserialize, Serialize)]
enum EddsaWireMessage {
    Commitments(SigningCommitments),
    Share(SignatureShare),
}

#[derive(Clone, Copy, Default)]
pub struct EddsaEngine;

impl EddsaEngine {
    pub fn new() -> Self {
        Self
    }
}

impl SigningEngine for EddsaEngine {
    type Session = EddsaSession;

    fn family(&self) -> SignatureFamily {
        SignatureFamily::Eddsa
    }

    fn key_share_id(&self, key_share: &[u8]) -> Result<Vec<u8>, KeysignError> {
        let share = EddsaKeyShare::from_bytes(key_share)?;
        share.public_key_package
            .verifying_key()
            .serialize()
            .map_err(|err| KeysignError::KeyShareInvalid(format!("group key: {err}")))
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
                    "key derivation is not supported for the EdDSA family".to_string()
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

    fn decode_setup_digest(&self, setup: &[u8]) -> Option<Result<String, KeysignError>> {
        Some(SetupMessage::from_bytes(setup).map(|setup| setup.msg_digest))
    }

    #[instrument(skip_all)]
    fn open_session(
        &self,
        setup: &[u8],
        local_party_id: &str,
        key_share: &[u8]
    ) -> Result<Self::Session, KeysignError> {
        let setup = SetupMessage::from_bytes(setup)?;
        let share = EddsaKeyShare::from_bytes(key_share)?;

        if setup.derivation_path.is_some() {
            return Err(
                KeysignError::SessionSetup(
                    "key derivation is not supported for the EdDSA family".to_string()
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

        let mut identifiers = BTreeMap::new();
        for party in &setup.committee {
            let index = share.identifiers
                .get(party)
                .ok_or_else(|| {
                    KeysignError::SessionSetup(
                        format!("party {party:?} has no identifier in the key share")
                    )
                })?;
            let identifier = Identifier::try_from(*index).map_err(|err|
                KeysignError::SessionSetup(format!("identifier {index}: {err}"))
            )?;
            identifiers.insert(party.clone(), identifier);
        }
        let my_identifier = identifiers[local_party_id];

        let (nonces, commitments) = round1::commit(share.key_package.signing_share(), &mut OsRng);

        let mut session = EddsaSession {
            local_party_id: local_party_id.to_string(),
            committee: setup.committee,
            identifiers,
            key_package: share.key_package,
            public_key_package: share.public_key_package,
            digest,
            nonces: Some(nonces),
            commitments: BTreeMap::new(),
            shares: BTreeMap::new(),
            signing_package: None,
            pending: Vec::new(),
            signature: None,
        };
        session.commitments.insert(my_identifier, commitments.clone());
        session.broadcast(&EddsaWireMessage::Commitments(commitments))?;
        Ok(session)
    }
}

pub struct EddsaSession {
    local_party_id: String,
    committee: Vec<String>,
    identifiers: BTreeMap<String, Identifier>,
    key_package: KeyPackage,
    public_key_package: PublicKeyPackage,
    digest: Vec<u8>,
    nonces: Option<SigningNonces>,
    commitments: BTreeMap<Identifier, SigningCommitments>,
    shares: BTreeMap<Identifier, SignatureShare>,
    signing_package: Option<SigningPackage>,
    pending: Vec<OutboundMessage>,
    signature: Option<Vec<u8>>,
}

impl EddsaSession {
    fn broadcast(&mut self, message: &EddsaWireMessage) -> Result<(), KeysignError> {
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

    /// Moves through the rounds whenever the inputs for the next step are
    /// complete.
    fn advance(&mut self) -> Result<(), KeysignError> {
        if self.signing_package.is_none() && self.commitments.len() == self.committee.len() {
            let package = SigningPackage::new(self.commitments.clone(), &self.digest);
            let nonces = self.nonces
                .as_ref()
                .ok_or_else(|| {
                    KeysignError::MessageApplication("signing nonces already consumed".to_string())
                })?;
            let own_share = round2
                ::sign(&package, nonces, &self.key_package)
                .map_err(|err| KeysignError::MessageApplication(format!("round two: {err}")))?;
            let my_identifier = self.identifiers[&self.local_party_id];
            self.shares.insert(my_identifier, own_share.clone());
            self.broadcast(&EddsaWireMessage::Share(own_share))?;
            self.signing_package = Some(package);
        }

        if self.signature.is_none() && self.shares.len() == self.committee.len() {
            if let Some(package) = self.signing_package.as_ref() {
                let group_signature = frost_ed25519
                    ::aggregate(package, &self.shares, &self.public_key_package)
                    .map_err(|err| KeysignError::MessageApplication(format!("aggregate: {err}")))?;
                let bytes = group_signature
                    .serialize()
                    .map_err(|err| KeysignError::Finalization(format!("signature: {err}")))?;
                self.signature = Some(bytes);
            }
        }
        Ok(())
    }
}

impl EngineSession for EddsaSession {
    fn outbound(&mut self) -> Result<Vec<OutboundMessage>, KeysignError> {
        Ok(mem::take(&mut self.pending))
    }

    fn apply(&mut self, from: &str, message: &[u8]) -> Result<bool, KeysignError> {
        let identifier = *self.identifiers
            .get(from)
            .ok_or_else(|| {
                KeysignError::MessageApplication(format!("message from unknown party {from:?}"))
            })?;
        let message: EddsaWireMessage = serde_json
            ::from_slice(message)
            .map_err(|err| KeysignError::MessageApplication(format!("wire format: {err}")))?;

        match message {
            EddsaWireMessage::Commitments(commitments) => {
                // A commitment that arrives after the signing package is
                // fixed cannot be folded in any more.
                if self.signing_package.is_none() {
                    self.commitments.insert(identifier, commitments);
                }
            }
            EddsaWireMessage::Share(share) => {
                self.shares.insert(identifier, share);
            }
        }
        self.advance()?;
        Ok(self.is_finished())
    }

    fn is_finished(&self) -> bool {
        self.signature.is_some()
    }

    fn finalize(self) -> Result<SignatureData, KeysignError> {
        let signature = self.signature.ok_or_else(|| {
            KeysignError::Finalization("signing has not completed".to_string())
        })?;
        Ok(SignatureData::Eddsa {
            signature: hex::encode(signature),
        })
    }
}
