use asn1_rs::FromDer;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use p256::ecdsa::VerifyingKey;

use crate::signature::RAW_SIGNATURE_LEN;

/// Length of an uncompressed SEC1 P-256 point, `04 || X || Y`.
pub const EC_POINT_LEN: usize = 65;

const UNCOMPRESSED_POINT_TAG: u8 = 0x04;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EcPointError {
    #[error("CKA_EC_POINT is not a DER OCTET STRING: {0}")]
    NotOctetString(String),

    #[error("CKA_EC_POINT has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("EC point is {0} bytes long, expected {EC_POINT_LEN}")]
    InvalidLength(usize),

    #[error("EC point is not in uncompressed form, leading byte is {0:#04x}")]
    NotUncompressed(u8),

    #[error("EC point is not on the P-256 curve")]
    NotOnCurve,
}

/// A P-256 public key read back from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcPublicKey {
    point: [u8; EC_POINT_LEN],
}

impl EcPublicKey {
    /// Parses the value of a `CKA_EC_POINT` attribute: an OCTET STRING wrapping the SEC1 point.
    pub fn from_ec_point_attribute(attribute: &[u8]) -> Result<Self, EcPointError> {
        // Elliptic-Curve-Point-to-Octet-String from SEC 1 (Version 2.0) section 2.3.3
        let (rest, octet_string) = asn1_rs::OctetString::from_der(attribute)
            .map_err(|err| EcPointError::NotOctetString(err.to_string()))?;
        if !rest.is_empty() {
            return Err(EcPointError::TrailingBytes(rest.len()));
        }
        Self::from_sec1_bytes(&octet_string.into_cow())
    }

    /// Parses an uncompressed SEC1 point.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, EcPointError> {
        let point: [u8; EC_POINT_LEN] = bytes
            .try_into()
            .map_err(|_| EcPointError::InvalidLength(bytes.len()))?;
        if point[0] != UNCOMPRESSED_POINT_TAG {
            return Err(EcPointError::NotUncompressed(point[0]));
        }
        VerifyingKey::from_sec1_bytes(&point).map_err(|_| EcPointError::NotOnCurve)?;
        Ok(EcPublicKey { point })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.point
    }

    /// Checks a raw `r || s` signature over an already computed digest.
    pub fn verify_prehash(&self, digest: &[u8], raw_signature: &[u8]) -> bool {
        if raw_signature.len() != RAW_SIGNATURE_LEN {
            return false;
        }
        let Ok(key) = VerifyingKey::from_sec1_bytes(&self.point) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(raw_signature) else {
            return false;
        };
        key.verify_prehash(digest, &signature).is_ok()
    }
}
