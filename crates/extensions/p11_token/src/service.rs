use crate::error::TokenError;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::os::raw::c_ulong;

/// `CKO_CERTIFICATE`
pub const CKO_CERTIFICATE: u64 = 0x1;
/// `CKO_PUBLIC_KEY`
pub const CKO_PUBLIC_KEY: u64 = 0x2;
/// `CKO_PRIVATE_KEY`
pub const CKO_PRIVATE_KEY: u64 = 0x3;
/// `CKK_EC`
pub const CKK_EC: u64 = 0x3;

/// Size of a `CK_ULONG` attribute value, e.g. `CKA_CLASS` or `CKA_KEY_TYPE`.
pub const ULONG_ATTRIBUTE_LEN: usize = std::mem::size_of::<c_ulong>();

/// DER encoding of the secp256r1 OID, the value of `CKA_EC_PARAMS` for P-256 keys.
pub const SECP256R1_EC_PARAMS: [u8; 10] = [
    0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07,
];

/// Opens sessions with a token.
pub trait Token {
    fn open_session(&self) -> Result<Box<dyn TokenSession + '_>, TokenError>;
}

/// The operations performed on an open token session during provisioning.
///
/// A session is used from a single thread; the token serializes operations within it.
pub trait TokenSession {
    /// Fills `buf` with random bytes produced by the token.
    fn generate_random(&self, buf: &mut [u8]) -> Result<(), TokenError>;

    /// Generates a P-256 keypair on the token, the private half being non-extractable.
    fn generate_ec_keypair(&self, template: &KeyPairTemplate<'_>)
        -> Result<KeyPairHandles, TokenError>;

    /// Writes an externally created P-256 keypair to the token.
    fn import_ec_keypair(
        &self,
        template: &KeyPairTemplate<'_>,
        private_scalar: &[u8],
        ec_point: &[u8],
    ) -> Result<KeyPairHandles, TokenError>;

    /// Reads an attribute value in two phases.
    ///
    /// With no receiver, returns the length of the value. With a receiver, copies the value into
    /// it and returns the number of bytes written; a receiver that is too short is rejected with
    /// `CKR_BUFFER_TOO_SMALL`. `CK_ULONG` attributes are encoded in native byte order.
    fn get_attribute(
        &self,
        object: ObjectHandle,
        attribute: AttributeKind,
        receiver: Option<&mut [u8]>,
    ) -> Result<usize, TokenError>;

    /// Arms a signing operation with the given key.
    ///
    /// A key the token will not sign with is rejected here. Backends whose library only offers
    /// single-part signing may defer `C_SignInit` itself to [`TokenSession::sign`].
    fn sign_init(&self, mechanism: SignMechanism, key: ObjectHandle) -> Result<(), TokenError>;

    /// Signs `data` with the armed operation, which is consumed.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, TokenError>;

    /// Destroys every object labelled with one of `labels`, returning how many were destroyed.
    fn destroy_all_credentials(&self, labels: &[&str]) -> Result<usize, TokenError>;

    /// Returns true if an object with the given label exists on the token.
    fn object_exists(&self, label: &str) -> Result<bool, TokenError>;

    /// Stores a PEM-encoded X.509 certificate as a token object.
    fn store_certificate(&self, label: &str, pem: &[u8]) -> Result<ObjectHandle, TokenError>;

    /// Logs out and closes the session.
    fn close(self: Box<Self>) -> Result<(), TokenError>;
}

/// An opaque token object identifier, valid only within the session that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    /// `CK_INVALID_HANDLE`
    pub const INVALID: ObjectHandle = ObjectHandle(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPairHandles {
    pub private_key: ObjectHandle,
    pub public_key: ObjectHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPairTemplate<'a> {
    pub private_label: &'a str,
    pub public_label: &'a str,
    /// `CKA_ID` shared by both halves of the keypair.
    pub id: &'a [u8],
}

/// The object attributes read back during provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// `CKA_CLASS`
    Class,
    /// `CKA_KEY_TYPE`
    KeyType,
    /// `CKA_EC_POINT`
    EcPoint,
}

impl AttributeKind {
    /// Returns the size of the value if it is fixed.
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            AttributeKind::Class | AttributeKind::KeyType => Some(ULONG_ATTRIBUTE_LEN),
            AttributeKind::EcPoint => None,
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeKind::Class => "CKA_CLASS",
            AttributeKind::KeyType => "CKA_KEY_TYPE",
            AttributeKind::EcPoint => "CKA_EC_POINT",
        };
        f.write_str(name)
    }
}

/// Signing mechanisms used by the signing bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMechanism {
    /// `CKM_ECDSA`: raw ECDSA over a caller-computed digest, producing `r || s`.
    Ecdsa,
}

/// Encodes a `CK_ULONG` attribute value the way the token returns it.
pub fn encode_ulong(value: u64) -> [u8; ULONG_ATTRIBUTE_LEN] {
    (value as c_ulong).to_ne_bytes()
}

/// Decodes a `CK_ULONG` attribute value, returning `None` if it has the wrong size.
pub fn decode_ulong(bytes: &[u8]) -> Option<u64> {
    let bytes: [u8; ULONG_ATTRIBUTE_LEN] = bytes.try_into().ok()?;
    #[allow(clippy::useless_conversion)]
    Some(u64::from(c_ulong::from_ne_bytes(bytes)))
}

/// A secret string that should not be printed by accident.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(string: String) -> Self {
        Self(string)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        SecretString::new(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        SecretString::new(value.to_string())
    }
}

impl Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulong_attributes_roundtrip_with_native_size() {
        let encoded = encode_ulong(CKO_PRIVATE_KEY);
        assert_eq!(encoded.len(), ULONG_ATTRIBUTE_LEN);
        assert_eq!(decode_ulong(&encoded), Some(CKO_PRIVATE_KEY));
        assert_eq!(decode_ulong(&encoded[1..]), None);
    }

    #[test]
    fn invalid_handle_is_the_sentinel() {
        assert!(!ObjectHandle::INVALID.is_valid());
        assert!(ObjectHandle(0xA1).is_valid());
        assert_eq!(ObjectHandle(0xA1).to_string(), "0xa1");
    }

    #[test]
    fn secret_string_is_redacted() {
        let pin = SecretString::from("123456");
        assert_eq!(format!("{pin}"), "[REDACTED]");
        assert_eq!(format!("{pin:?}"), "[REDACTED]");
        assert_eq!(pin.expose(), "123456");
    }
}
