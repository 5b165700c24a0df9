//! An X.509 signing key whose private half stays on a PKCS #11 token.
//!
//! `rcgen` only sees a [`rcgen::SigningKey`]; signing requests are digested here, signed by the
//! token with raw ECDSA and converted to the DER form X.509 structures carry.

use p11_token::ObjectHandle;
use p11_token::SignMechanism;
use p11_token::TokenError;
use p11_token::TokenSession;
use sha2::Digest;
use sha2::Sha256;
use std::sync::Mutex;
use tracing::error;
use tracing::trace;

use crate::ec_point::EcPublicKey;
use crate::signature::format_asn1_ecdsa_signature;
use crate::signature::MAX_DER_SIGNATURE_LEN;
use crate::signature::RAW_SIGNATURE_LEN;

/// Largest digest the bridge accepts.
pub const MAX_DIGEST_LEN: usize = 256;

/// Status returned by the signer callback shape when signing fails.
pub const TLS_ERROR_SIGN: i32 = -2003;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("Digest of {0} bytes is longer than {MAX_DIGEST_LEN} bytes")]
    BadInput(usize),

    #[error("Token failed to sign the digest")]
    Sign(#[from] TokenError),

    #[error("Token returned a {0} bytes signature, expected {RAW_SIGNATURE_LEN}")]
    UnexpectedSignatureLength(usize),
}

impl SignerError {
    /// The non-zero status reported to callers expecting the signer callback shape.
    pub fn status(&self) -> i32 {
        TLS_ERROR_SIGN
    }
}

/// Signs with a private key held by a token.
///
/// Carries nothing between calls but the session, the key handle and the last error.
pub struct TokenSigner<'a> {
    session: &'a dyn TokenSession,
    private_key: ObjectHandle,
    public_key: EcPublicKey,
    last_error: Mutex<Option<SignerError>>,
}

impl<'a> TokenSigner<'a> {
    pub fn new(
        session: &'a dyn TokenSession,
        private_key: ObjectHandle,
        public_key: EcPublicKey,
    ) -> Self {
        TokenSigner {
            session,
            private_key,
            public_key,
            last_error: Mutex::new(None),
        }
    }

    /// Signs an already computed digest, writing the DER signature to `out`.
    ///
    /// Returns the length of the DER signature.
    pub fn sign_digest(
        &self,
        digest: &[u8],
        out: &mut [u8; MAX_DER_SIGNATURE_LEN],
    ) -> Result<usize, SignerError> {
        let result = self.sign_digest_inner(digest, out);
        if let Err(err) = &result {
            error!(status = err.status(), %err, "Signing bridge failed");
            *self.lock_last_error() = Some(err.clone());
        }
        result
    }

    fn sign_digest_inner(
        &self,
        digest: &[u8],
        out: &mut [u8; MAX_DER_SIGNATURE_LEN],
    ) -> Result<usize, SignerError> {
        if digest.len() > MAX_DIGEST_LEN {
            return Err(SignerError::BadInput(digest.len()));
        }
        let mut to_be_signed = [0; MAX_DIGEST_LEN];
        to_be_signed[..digest.len()].copy_from_slice(digest);

        self.session.sign_init(SignMechanism::Ecdsa, self.private_key)?;
        let raw = self.session.sign(&to_be_signed[..digest.len()])?;

        let raw: &[u8; RAW_SIGNATURE_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::UnexpectedSignatureLength(raw.len()))?;
        let len = format_asn1_ecdsa_signature(raw, out);
        trace!(len, "Encoded ASN.1 signature");
        Ok(len)
    }

    /// Returns the error of the last failed signature, if any, and clears it.
    pub fn take_last_error(&self) -> Option<SignerError> {
        self.lock_last_error().take()
    }

    fn lock_last_error(&self) -> std::sync::MutexGuard<'_, Option<SignerError>> {
        match self.last_error.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        }
    }
}

impl rcgen::PublicKeyData for TokenSigner<'_> {
    fn der_bytes(&self) -> &[u8] {
        self.public_key.as_bytes()
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

impl rcgen::SigningKey for TokenSigner<'_> {
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        let digest = Sha256::digest(msg);
        let mut out = [0; MAX_DER_SIGNATURE_LEN];
        let len = self
            .sign_digest(&digest, &mut out)
            .map_err(|_| rcgen::Error::RemoteKeyError)?;
        Ok(out[..len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use p11_test_utils::MockToken;
    use p11_token::rv;
    use p11_token::KeyPairTemplate;
    use p11_token::Token;
    use rcgen::SigningKey;

    const TEMPLATE: KeyPairTemplate<'static> = KeyPairTemplate {
        private_label: "Device Priv TLS Key",
        public_label: "Device Pub TLS Key",
        id: &[7; 20],
    };

    fn public_key() -> EcPublicKey {
        EcPublicKey::from_sec1_bytes(&MockToken::generated_public_point()).unwrap()
    }

    #[test]
    fn signs_the_digest_with_raw_ecdsa() {
        let token = MockToken::new();
        let session = token.open_session().unwrap();
        let keys = session.generate_ec_keypair(&TEMPLATE).unwrap();
        let signer = TokenSigner::new(session.as_ref(), keys.private_key, public_key());

        let digest = [0xAB; 32];
        let mut out = [0; MAX_DER_SIGNATURE_LEN];
        let len = signer.sign_digest(&digest, &mut out).unwrap();

        assert!((70..=72).contains(&len));
        assert_eq!(out[0], 0x30);
        assert_eq!(token.calls().sign_inputs, vec![digest.to_vec()]);
    }

    #[test]
    fn reformats_the_token_signature() {
        let mut raw = [0x7F; 64];
        raw[32] = 0x80;
        let token = MockToken::new().with_raw_signature(raw);
        let session = token.open_session().unwrap();
        let keys = session.generate_ec_keypair(&TEMPLATE).unwrap();
        let signer = TokenSigner::new(session.as_ref(), keys.private_key, public_key());

        let mut out = [0; MAX_DER_SIGNATURE_LEN];
        assert_eq!(signer.sign_digest(&[0; 32], &mut out), Ok(71));
        assert_eq!(out[1], 0x45);
    }

    #[test]
    fn oversized_digest_is_rejected_before_calling_the_token() {
        let token = MockToken::new();
        let session = token.open_session().unwrap();
        let keys = session.generate_ec_keypair(&TEMPLATE).unwrap();
        let signer = TokenSigner::new(session.as_ref(), keys.private_key, public_key());

        let mut out = [0; MAX_DER_SIGNATURE_LEN];
        let err = signer.sign_digest(&[0; 257], &mut out).unwrap_err();

        assert_eq!(err, SignerError::BadInput(257));
        assert_eq!(err.status(), TLS_ERROR_SIGN);
        assert_eq!(token.calls().sign_init, 0);
    }

    #[test]
    fn token_failures_are_kept_for_the_caller() {
        let token = MockToken::new().failing_sign(rv::CKR_FUNCTION_FAILED);
        let session = token.open_session().unwrap();
        let keys = session.generate_ec_keypair(&TEMPLATE).unwrap();
        let signer = TokenSigner::new(session.as_ref(), keys.private_key, public_key());

        assert_matches!(signer.sign(b"to be signed"), Err(rcgen::Error::RemoteKeyError));
        assert_matches!(
            signer.take_last_error(),
            Some(SignerError::Sign(TokenError { code: rv::CKR_FUNCTION_FAILED, .. }))
        );
        assert_eq!(signer.take_last_error(), None);
    }

    #[test]
    fn short_token_signatures_are_rejected() {
        let token = MockToken::new().with_raw_signature(vec![0x01; 63]);
        let session = token.open_session().unwrap();
        let keys = session.generate_ec_keypair(&TEMPLATE).unwrap();
        let signer = TokenSigner::new(session.as_ref(), keys.private_key, public_key());

        let mut out = [0; MAX_DER_SIGNATURE_LEN];
        assert_eq!(
            signer.sign_digest(&[0; 32], &mut out),
            Err(SignerError::UnexpectedSignatureLength(63))
        );
    }
}
