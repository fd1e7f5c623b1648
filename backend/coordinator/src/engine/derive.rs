//! Non-hardened key derivation for the ECDSA family.
//!
//! Follows the BIP32 public derivation scheme: for each path component an
//! HMAC-SHA512 over the compressed parent key and the component index
//! yields a scalar tweak and the next chain code. Tweaks accumulate into a
//! single scalar so a threshold share can be adjusted locally without any
//! extra communication. Hardened components need the private key and are
//! rejected.

use hmac::{ Hmac, Mac };
use k256::elliptic_curve::group::Curve as _;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ AffinePoint, FieldBytes, ProjectivePoint, Scalar, U256 };
use sha2::Sha512;

use crate::error::KeysignError;

pub const CHAIN_CODE_BYTES_LEN: usize = 32;

type HmacSha512 = Hmac<Sha512>;

/// Parses a slash-separated derivation path such as `m/44/0/1`. A leading
/// `m` or `M` component is optional.
pub fn parse_path(path: &str) -> Result<Vec<u32>, KeysignError> {
    let mut components = path.split('/').peekable();
    if matches!(components.peek(), Some(&"m") | Some(&"M")) {
        components.next();
    }

    let mut indices = Vec::new();
    for component in components {
        if component.is_empty() {
            return Err(
                KeysignError::InvalidParams(format!("derivation path {path:?} has an empty component"))
            );
        }
        if component.ends_with('\'') || component.ends_with('h') || component.ends_with('H') {
            return Err(
                KeysignError::InvalidParams(
                    format!("derivation path {path:?} contains a hardened component")
                )
            );
        }
        let index: u32 = component
            .parse()
            .map_err(|_| {
                KeysignError::InvalidParams(
                    format!("derivation path component {component:?} is not a valid index")
                )
            })?;
        if index >= 0x8000_0000 {
            return Err(
                KeysignError::InvalidParams(
                    format!("derivation path component {index} is in the hardened range")
                )
            );
        }
        indices.push(index);
    }
    Ok(indices)
}

/// Walks the path from the group public key and returns the accumulated
/// scalar tweak together with the derived public key.
pub fn derive_tweak(
    parent: &AffinePoint,
    chain_code: &[u8; CHAIN_CODE_BYTES_LEN],
    path: &str
) -> Result<(Scalar, AffinePoint), KeysignError> {
    let mut point = ProjectivePoint::from(*parent);
    let mut code = *chain_code;
    let mut tweak = Scalar::ZERO;

    for index in parse_path(path)? {
        let mut mac = HmacSha512::new_from_slice(&code).map_err(|_|
            KeysignError::InvalidParams("chain code rejected by HMAC".to_string())
        )?;
        mac.update(point.to_affine().to_encoded_point(true).as_bytes());
        mac.update(&index.to_be_bytes());
        let output = mac.finalize().into_bytes();
        let (left, right) = output.split_at(32);

        let step = <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(left));
        tweak += step;
        point += ProjectivePoint::GENERATOR * step;
        code.copy_from_slice(right);
    }

    Ok((tweak, point.to_affine()))
}
