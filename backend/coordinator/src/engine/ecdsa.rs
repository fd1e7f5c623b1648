//! ECDSA engine over secp256k1, built on the cait-sith signing protocol.
//!
//! The opaque key share carries the keygen output, one unused presignature
//! and a chain code for non-hardened derivation. Signing consumes the
//! presignature; refreshing it is the key-management plane's job and out
//! of scope here.

use std::collections::BTreeMap;
use std::mem;

use cait_sith::protocol::{ Action, Participant, Protocol };
use cait_sith::FullSignature;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{ RecoveryId, Signature as EcdsaSignature, VerifyingKey };
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::AffineCoordinates;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ AffinePoint, FieldBytes, Scalar, Secp256k1, U256 };
use serde::{ Deserialize, Serialize };
use shared::signature::{ SignatureData, SignatureFamily };
use tracing::instrument;

use crate::engine::derive::{ self, CHAIN_CODE_BYTES_LEN };
use crate::engine::{ check_committee, decode_digest_hex };
use crate::engine::{ EngineSession, OutboundMessage, SetupMessage, SigningEngine };
use crate::error::KeysignError;

const DIGEST_BYTES_LEN: usize = 32;

/// One-time signing material produced by the presign phase.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PresignMaterial {
    pub big_r: AffinePoint,
    pub k: Scalar,
    pub sigma: Scalar,
}

/// Serde shim for `cait_sith::KeygenOutput`, which has public fields but no
/// serde derives of its own.
#[derive(Deserialize, Serialize)]
#[serde(remote = "cait_sith::KeygenOutput::<Secp256k1>")]
struct KeygenOutputDef {
    private_share: Scalar,
    public_key: AffinePoint,
}

/// Opaque key share format for the ECDSA family.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EcdsaKeyShare {
    /// party id -> protocol participant index
    pub participants: BTreeMap<String, u32>,
    #[serde(with = "KeygenOutputDef")]
    pub keygen: cait_sith::KeygenOutput<Secp256k1>,
    pub presignature: PresignMaterial,
    /// hex, 32 bytes, for non-hardened derivation
    pub chain_code: String,
}

impl EcdsaKeyShare {
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeysignError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeysignError> {
        serde_json
            ::from_slice(bytes)
            .map_err(|err| KeysignError::KeyShareInvalid(format!("ECDSA key share: {err}")))
    }

    fn chain_code_bytes(&self) -> Result<[u8; CHAIN_CODE_BYTES_LEN], KeysignError> {
        let bytes = hex
            ::decode(&self.chain_code)
            .map_err(|_| KeysignError::KeyShareInvalid("chain code is not valid hex".to_string()))?;
        bytes
            .try_into()
            .map_err(|_|
                KeysignError::KeyShareInvalid(
                    format!("chain code must be {CHAIN_CODE_BYTES_LEN} bytes")
                )
            )
    }
}

#[derive(Clone, Copy, Default)]
pub struct EcdsaEngine;

impl EcdsaEngine {
    pub fn new() -> Self {
        Self
    }
}

impl SigningEngine for EcdsaEngine {
    type Session = EcdsaSession;

    fn family(&self) -> SignatureFamily {
        SignatureFamily::Ecdsa
    }

    fn key_share_id(&self, key_share: &[u8]) -> Result<Vec<u8>, KeysignError> {
        let share = EcdsaKeyShare::from_bytes(key_share)?;
        Ok(share.keygen.public_key.to_encoded_point(true).as_bytes().to_vec())
    }

    fn build_setup(
        &self,
        key_share: &[u8],
        committee: &[String],
        msg_digest: &str,
        derivation_path: Option<&str>
    ) -> Result<Vec<u8>, KeysignError> {
        check_committee(committee)?;
        decode_digest_hex(msg_digest, Some(DIGEST_BYTES_LEN))?;
        if let Some(path) = derivation_path {
            derive::parse_path(path)?;
        }
        let setup = SetupMessage {
            key_share_id: hex::encode(self.key_share_id(key_share)?),
            committee: committee.to_vec(),
            msg_digest: msg_digest.to_string(),
            derivation_path: derivation_path.map(str::to_string),
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
        let share = EcdsaKeyShare::from_bytes(key_share)?;

        if !setup.committee.iter().any(|party| party == local_party_id) {
            return Err(
                KeysignError::SessionSetup(
                    format!("local party {local_party_id:?} is not in the committee")
                )
            );
        }
        let expected_id = hex::encode(self.key_share_id(key_share)?);
        if setup.key_share_id != expected_id {
            return Err(
                KeysignError::SessionSetup("setup references a different key share".to_string())
            );
        }

        let digest_bytes = decode_digest_hex(&setup.msg_digest, Some(DIGEST_BYTES_LEN)).map_err(
            |err| KeysignError::SessionSetup(err.to_string())
        )?;
        let digest: [u8; DIGEST_BYTES_LEN] = digest_bytes
            .try_into()
            .map_err(|_| KeysignError::SessionSetup("digest length changed underfoot".to_string()))?;

        let mut roster = Vec::with_capacity(setup.committee.len());
        for party in &setup.committee {
            let index = share.participants
                .get(party)
                .ok_or_else(|| {
                    KeysignError::SessionSetup(
                        format!("party {party:?} has no participant index in the key share")
                    )
                })?;
            roster.push((party.clone(), Participant::from(*index)));
        }
        let me = roster
            .iter()
            .find(|(party, _)| party == local_party_id)
            .map(|(_, participant)| *participant)
            .ok_or_else(|| KeysignError::SessionSetup("local participant missing".to_string()))?;

        // Apply the derivation tweak locally: the public key moves to
        // pk + t*G and each sigma share to sigma_i + k_i * t, which keeps
        // sum(lambda_i * sigma_i) = k * (x + t) without any communication.
        let mut public_key = share.keygen.public_key;
        let mut presignature = share.presignature.clone();
        if let Some(path) = setup.derivation_path.as_deref() {
            let chain_code = share.chain_code_bytes()?;
            let (tweak, derived) = derive::derive_tweak(&public_key, &chain_code, path)?;
            presignature.sigma += presignature.k * tweak;
            public_key = derived;
        }

        let participants: Vec<Participant> = roster
            .iter()
            .map(|(_, participant)| *participant)
            .collect();
        let msg_hash = <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(&digest));
        let protocol = cait_sith
            ::sign::<Secp256k1>(&participants, me, public_key, cait_sith::PresignOutput {
                big_r: presignature.big_r,
                k: presignature.k,
                sigma: presignature.sigma,
            }, msg_hash)
            .map_err(|err| KeysignError::SessionSetup(err.to_string()))?;

        Ok(EcdsaSession {
            local_party_id: local_party_id.to_string(),
            roster,
            protocol: Box::new(protocol),
            digest,
            public_key,
            pending: Vec::new(),
            signature: None,
        })
    }
}

/// One party's signing run. Wraps the protocol state machine and turns its
/// actions into addressed messages.
pub struct EcdsaSession {
    local_party_id: String,
    roster: Vec<(String, Participant)>,
    protocol: Box<dyn Protocol<Output = FullSignature<Secp256k1>>>,
    digest: [u8; DIGEST_BYTES_LEN],
    public_key: AffinePoint,
    pending: Vec<OutboundMessage>,
    signature: Option<FullSignature<Secp256k1>>,
}

impl std::fmt::Debug for EcdsaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaSession")
            .field("local_party_id", &self.local_party_id)
            .field("roster", &self.roster)
            .field("digest", &self.digest)
            .field("public_key", &self.public_key)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl EcdsaSession {
    fn party_for(&self, participant: Participant) -> Option<&str> {
        self.roster
            .iter()
            .find(|(_, candidate)| *candidate == participant)
            .map(|(party, _)| party.as_str())
    }

    fn participant_for(&self, party: &str) -> Option<Participant> {
        self.roster
            .iter()
            .find(|(candidate, _)| candidate == party)
            .map(|(_, participant)| *participant)
    }

    /// Pokes the protocol until it wants input, buffering everything it
    /// emits along the way.
    fn pump(&mut self) -> Result<(), KeysignError> {
        while self.signature.is_none() {
            let action = self.protocol
                .poke()
                .map_err(|err| KeysignError::MessageApplication(err.to_string()))?;
            match action {
                Action::Wait => {
                    break;
                }
                Action::SendMany(payload) => {
                    for (party, _) in &self.roster {
                        if party != &self.local_party_id {
                            self.pending.push(OutboundMessage {
                                to: party.clone(),
                                payload: payload.clone(),
                            });
                        }
                    }
                }
                Action::SendPrivate(to, payload) => {
                    let party = self
                        .party_for(to)
                        .ok_or_else(|| {
                            KeysignError::MessageApplication(
                                format!("protocol addressed unknown participant {to:?}")
                            )
                        })?
                        .to_string();
                    self.pending.push(OutboundMessage { to: party, payload });
                }
                Action::Return(signature) => {
                    self.signature = Some(signature);
                }
            }
        }
        Ok(())
    }
}

impl EngineSession for EcdsaSession {
    fn outbound(&mut self) -> Result<Vec<OutboundMessage>, KeysignError> {
        self.pump()?;
        Ok(mem::take(&mut self.pending))
    }

    fn apply(&mut self, from: &str, message: &[u8]) -> Result<bool, KeysignError> {
        let participant = self
            .participant_for(from)
            .ok_or_else(|| {
                KeysignError::MessageApplication(format!("message from unknown party {from:?}"))
            })?;
        self.protocol.message(participant, message.to_vec());
        self.pump()?;
        Ok(self.is_finished())
    }

    fn is_finished(&self) -> bool {
        self.signature.is_some()
    }

    fn finalize(self) -> Result<SignatureData, KeysignError> {
        let full = self.signature.ok_or_else(|| {
            KeysignError::Finalization("signing has not completed".to_string())
        })?;

        let r = <Scalar as Reduce<U256>>::reduce_bytes(&full.big_r.x());
        let signature = EcdsaSignature::from_scalars(r.to_bytes(), full.s.to_bytes()).map_err(
            |err| KeysignError::Finalization(format!("scalars rejected: {err}"))
        )?;

        let verifying_key = VerifyingKey::from_affine(self.public_key).map_err(|err|
            KeysignError::Finalization(format!("public key rejected: {err}"))
        )?;
        verifying_key
            .verify_prehash(&self.digest, &signature)
            .map_err(|_| {
                KeysignError::Finalization("signature does not verify against the key".to_string())
            })?;

        let recovery_id = recover_id(&self.digest, &signature, &verifying_key).ok_or_else(|| {
            KeysignError::Finalization("no recovery id reproduces the public key".to_string())
        })?;

        Ok(SignatureData::Ecdsa {
            r: hex::encode(r.to_bytes()),
            s: hex::encode(full.s.to_bytes()),
            recovery_id,
            der_signature: hex::encode(signature.to_der().as_bytes()),
        })
    }
}

fn recover_id(
    digest: &[u8; DIGEST_BYTES_LEN],
    signature: &EcdsaSignature,
    expected: &VerifyingKey
) -> Option<u8> {
    (0u8..=3).find(|candidate| {
        RecoveryId::try_from(*candidate)
            .ok()
            .and_then(|id| VerifyingKey::recover_from_prehash(digest, signature, id).ok())
            .map(|recovered| &recovered == expected)
            .unwrap_or(false)
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::run_loopback;
    use sha2::{ Digest, Sha256 };

    fn digest_hex() -> String {
        hex::encode(Sha256::digest(b"spend transaction"))
    }

    fn open_all(
        engine: &EcdsaEngine,
        shares: &BTreeMap<String, Vec<u8>>,
        setup: &[u8]
    ) -> BTreeMap<String, EcdsaSession> {
        shares
            .iter()
            .map(|(party, share)| {
                (party.clone(), engine.open_session(setup, party, share).unwrap())
            })
            .collect()
    }

    #[test]
    fn two_party_signing_produces_one_valid_signature() {
        let engine = EcdsaEngine::new();
        let (shares, public_key) = test_material::committee_shares(&["alpha", "beta"]);
        let committee = vec!["alpha".to_string(), "beta".to_string()];
        let digest = digest_hex();

        let setup = engine
            .build_setup(&shares["alpha"], &committee, &digest, None)
            .unwrap();
        assert_eq!(engine.decode_setup_digest(&setup).unwrap().unwrap(), digest);

        let mut sessions = open_all(&engine, &shares, &setup);
        run_loopback(&mut sessions);

        let mut produced = Vec::new();
        for (_, session) in sessions {
            match session.finalize().unwrap() {
                SignatureData::Ecdsa { r, s, recovery_id, der_signature } => {
                    assert!(!der_signature.is_empty());
                    assert!(recovery_id <= 3);
                    produced.push((r, s));
                }
                other => panic!("unexpected family: {:?}", other.family()),
            }
        }
        assert_eq!(produced[0], produced[1]);

        let verifying_key = VerifyingKey::from_affine(public_key).unwrap();
        let digest_bytes: [u8; 32] = hex::decode(&digest).unwrap().try_into().unwrap();
        let (r, s) = &produced[0];
        let signature = EcdsaSignature::from_scalars(
            FieldBytes::clone_from_slice(&hex::decode(r).unwrap()),
            FieldBytes::clone_from_slice(&hex::decode(s).unwrap())
        ).unwrap();
        verifying_key.verify_prehash(&digest_bytes, &signature).unwrap();
    }

    #[test]
    fn derived_signature_verifies_against_tweaked_key() {
        let engine = EcdsaEngine::new();
        let (shares, public_key) = test_material::committee_shares(&["alpha", "beta", "gamma"]);
        let committee: Vec<String> = ["alpha", "beta", "gamma"]
            .iter()
            .map(|party| party.to_string())
            .collect();
        let digest = digest_hex();

        let setup = engine
            .build_setup(&shares["alpha"], &committee, &digest, Some("m/44/0/7"))
            .unwrap();
        let mut sessions = open_all(&engine, &shares, &setup);
        run_loopback(&mut sessions);

        let chain_code = [0x42u8; CHAIN_CODE_BYTES_LEN];
        let (_, derived) = derive::derive_tweak(&public_key, &chain_code, "m/44/0/7").unwrap();
        let verifying_key = VerifyingKey::from_affine(derived).unwrap();
        let digest_bytes: [u8; 32] = hex::decode(&digest).unwrap().try_into().unwrap();

        for (_, session) in sessions {
            if let SignatureData::Ecdsa { r, s, .. } = session.finalize().unwrap() {
                let signature = EcdsaSignature::from_scalars(
                    FieldBytes::clone_from_slice(&hex::decode(r).unwrap()),
                    FieldBytes::clone_from_slice(&hex::decode(s).unwrap())
                ).unwrap();
                verifying_key.verify_prehash(&digest_bytes, &signature).unwrap();
            } else {
                panic!("expected an ECDSA signature");
            }
        }
    }

    #[test]
    fn setup_rejects_hardened_derivation_and_bad_digests() {
        let engine = EcdsaEngine::new();
        let (shares, _) = test_material::committee_shares(&["alpha", "beta"]);
        let committee = vec!["alpha".to_string(), "beta".to_string()];

        assert!(engine.build_setup(&shares["alpha"], &committee, "zz", None).is_err());
        assert!(engine.build_setup(&shares["alpha"], &committee, "abcd", None).is_err());
        assert!(
            engine
                .build_setup(&shares["alpha"], &committee, &digest_hex(), Some("m/44'/0"))
                .is_err()
        );
    }

    #[test]
    fn session_rejects_parties_outside_the_key_share() {
        let engine = EcdsaEngine::new();
        let (shares, _) = test_material::committee_shares(&["alpha", "beta"]);
        let committee = vec!["alpha".to_string(), "delta".to_string()];
        let setup = SetupMessage {
            key_share_id: hex::encode(engine.key_share_id(&shares["alpha"]).unwrap()),
            committee,
            msg_digest: digest_hex(),
            derivation_path: None,
        }
            .to_bytes()
            .unwrap();

        let err = engine.open_session(&setup, "alpha", &shares["alpha"]).unwrap_err();
        assert!(matches!(err, KeysignError::SessionSetup(_)));
    }
}
