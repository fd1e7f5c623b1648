use serde::{ Deserialize, Serialize };

/// The three signature families the coordinator can drive.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SignatureFamily {
    Ecdsa,
    Eddsa,
    Mldsa,
}

impl std::fmt::Display for SignatureFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureFamily::Ecdsa => write!(f, "ecdsa"),
            SignatureFamily::Eddsa => write!(f, "eddsa"),
            SignatureFamily::Mldsa => write!(f, "mldsa"),
        }
    }
}

/// Family-specific raw signature fields.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SignatureData {
    Ecdsa {
        /// hex, 32 bytes
        r: String,
        /// hex, 32 bytes, low-s normalized
        s: String,
        recovery_id: u8,
        /// hex DER encoding of (r, s)
        der_signature: String,
    },
    Eddsa {
        /// hex, 64 bytes
        signature: String,
    },
    Mldsa {
        /// hex, variable length aggregate
        signature: String,
    },
}

impl SignatureData {
    pub fn family(&self) -> SignatureFamily {
        match self {
            SignatureData::Ecdsa { .. } => SignatureFamily::Ecdsa,
            SignatureData::Eddsa { .. } => SignatureFamily::Eddsa,
            SignatureData::Mldsa { .. } => SignatureFamily::Mldsa,
        }
    }
}

/// A signature produced by one successful keysign round, keyed by the
/// digest it covers. The digest is retained for audit.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeysignSignature {
    pub msg_digest: String,
    #[serde(flatten)]
    pub data: SignatureData,
}
