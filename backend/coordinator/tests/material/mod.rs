//! Key material fixtures for the ceremony tests.
//!
//! Shares are fabricated the way a key-management plane would hand them
//! over: for ECDSA by sampling the secret polynomials directly, for EdDSA
//! through the FROST trusted dealer, for ML-DSA with one full keypair per
//! member.

use std::collections::BTreeMap;

use cait_sith::protocol::Participant;
use coordinator::engine::derive::CHAIN_CODE_BYTES_LEN;
use coordinator::engine::ecdsa::{ EcdsaKeyShare, PresignMaterial };
use coordinator::engine::eddsa::EddsaKeyShare;
use coordinator::engine::mldsa::MldsaKeyShare;
use frost_ed25519::keys::{ IdentifierList, KeyPackage, PublicKeyPackage };
use frost_ed25519::Identifier;
use k256::elliptic_curve::Field;
use k256::{ AffinePoint, ProjectivePoint, Scalar, Secp256k1 };
use pqcrypto_mldsa::mldsa87;
use pqcrypto_traits::sign::PublicKey as _;
use pqcrypto_traits::sign::SecretKey as _;
use rand::rngs::OsRng;
use sha2::{ Digest, Sha256 };

pub const CHAIN_CODE: [u8; CHAIN_CODE_BYTES_LEN] = [0x42; CHAIN_CODE_BYTES_LEN];

pub fn digest_hex(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

fn evaluate(coefficients: &[Scalar], at: Scalar) -> Scalar {
    let mut out = Scalar::ZERO;
    for coefficient in coefficients.iter().rev() {
        out = out * at + coefficient;
    }
    out
}

fn random_polynomial(constant: Scalar, degree: usize) -> Vec<Scalar> {
    let mut coefficients = vec![constant];
    for _ in 0..degree {
        coefficients.push(Scalar::random(&mut OsRng));
    }
    coefficients
}

pub fn ecdsa_committee_shares(
    parties: &[&str]
) -> (BTreeMap<String, Vec<u8>>, AffinePoint) {
    let degree = parties.len() - 1;
    let x_poly = random_polynomial(Scalar::random(&mut OsRng), degree);
    let k_poly = random_polynomial(Scalar::random(&mut OsRng), degree);

    let x = x_poly[0];
    let k = k_poly[0];
    let sigma_poly = random_polynomial(k * x, degree);

    let public_key = (ProjectivePoint::GENERATOR * x).to_affine();
    let big_r = (ProjectivePoint::GENERATOR * k.invert().unwrap()).to_affine();

    let participants: BTreeMap<String, u32> = parties
        .iter()
        .enumerate()
        .map(|(index, party)| (party.to_string(), index as u32))
        .collect();

    let mut shares = BTreeMap::new();
    for (party, index) in &participants {
        let at = Participant::from(*index).scalar::<Secp256k1>();
        let share = EcdsaKeyShare {
            participants: participants.clone(),
            keygen: cait_sith::KeygenOutput {
                private_share: evaluate(&x_poly, at),
                public_key,
            },
            presignature: PresignMaterial {
                big_r,
                k: evaluate(&k_poly, at),
                sigma: evaluate(&sigma_poly, at),
            },
            chain_code: hex::encode(CHAIN_CODE),
        };
        shares.insert(party.clone(), share.to_bytes().unwrap());
    }
    (shares, public_key)
}

pub fn eddsa_committee_shares(
    parties: &[&str]
) -> (BTreeMap<String, Vec<u8>>, PublicKeyPackage) {
    let count = parties.len() as u16;
    let identifiers: Vec<Identifier> = (1..=count)
        .map(|index| Identifier::try_from(index).unwrap())
        .collect();
    let (secret_shares, public_key_package) = frost_ed25519::keys
        ::generate_with_dealer(count, count, IdentifierList::Custom(&identifiers), &mut OsRng)
        .unwrap();

    let index_by_party: BTreeMap<String, u16> = parties
        .iter()
        .enumerate()
        .map(|(position, party)| (party.to_string(), (position as u16) + 1))
        .collect();

    let mut shares = BTreeMap::new();
    for (party, index) in &index_by_party {
        let identifier = Identifier::try_from(*index).unwrap();
        let key_package = KeyPackage::try_from(secret_shares[&identifier].clone()).unwrap();
        let share = EddsaKeyShare {
            identifiers: index_by_party.clone(),
            key_package,
            public_key_package: public_key_package.clone(),
        };
        shares.insert(party.clone(), share.to_bytes().unwrap());
    }
    (shares, public_key_package)
}

pub fn mldsa_committee_shares(
    parties: &[&str]
) -> (BTreeMap<String, Vec<u8>>, BTreeMap<String, String>) {
    let mut committee_keys = BTreeMap::new();
    let mut secret_keys = BTreeMap::new();
    for party in parties {
        let (public_key, secret_key) = mldsa87::keypair();
        committee_keys.insert(party.to_string(), base64::encode(public_key.as_bytes()));
        secret_keys.insert(party.to_string(), base64::encode(secret_key.as_bytes()));
    }

    let mut shares = BTreeMap::new();
    for party in parties {
        let share = MldsaKeyShare {
            committee_keys: committee_keys.clone(),
            secret_key: secret_keys[*party].clone(),
        };
        shares.insert(party.to_string(), share.to_bytes().unwrap());
    }
    (shares, committee_keys)
}
