//! Generation and verification of the device keypair on the token.

use certificate::EcPublicKey;
use p11_token::decode_ulong;
use p11_token::fill_random;
use p11_token::AttributeKind;
use p11_token::KeyPairHandles;
use p11_token::KeyPairTemplate;
use p11_token::ObjectHandle;
use p11_token::SignMechanism;
use p11_token::TokenError;
use p11_token::TokenSession;
use p11_token::CKK_EC;
use p11_token::CKO_PRIVATE_KEY;
use p11_token::CKO_PUBLIC_KEY;
use p11_token::ULONG_ATTRIBUTE_LEN;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::config::LabelConfig;
use crate::error::Diagnostic;
use crate::error::DiagnosticSink;
use crate::error::ProvisioningError;

/// Length of the `CKA_ID` shared by both halves of a keypair.
pub const KEY_ID_LEN: usize = 20;

/// Digest signed by the self-test, `0xAB` followed by 31 zero bytes.
pub const SELF_TEST_DIGEST: [u8; 32] = {
    let mut digest = [0; 32];
    digest[0] = 0xAB;
    digest
};

/// A keypair generated on the token, with its public point read back.
#[derive(Debug, Clone)]
pub struct GeneratedKeyPair {
    pub handles: KeyPairHandles,
    /// `CKA_EC_POINT` of the public key, as stored by the token.
    pub ec_point: Vec<u8>,
    pub public_key: EcPublicKey,
}

pub struct KeypairProvisioner<'a> {
    session: &'a dyn TokenSession,
    labels: &'a LabelConfig,
}

impl<'a> KeypairProvisioner<'a> {
    pub fn new(session: &'a dyn TokenSession, labels: &'a LabelConfig) -> Self {
        KeypairProvisioner { session, labels }
    }

    /// Destroys every object carrying one of the provisioning labels.
    #[instrument(skip_all)]
    pub fn destroy_credentials(
        &self,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<(), ProvisioningError> {
        let destroyed = self
            .session
            .destroy_all_credentials(&self.labels.all())
            .map_err(|e| {
                sink.fatal(
                    "Failed to destroy credentials before Generating Key Pair.",
                    e.into(),
                )
            })?;
        info!(destroyed, "Destroyed previous credentials");
        Ok(())
    }

    /// Draws a fresh `CKA_ID` from the token.
    pub fn new_key_id(
        &self,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<[u8; KEY_ID_LEN], ProvisioningError> {
        let mut id = [0; KEY_ID_LEN];
        fill_random(self.session, &mut id)
            .map_err(|e| sink.fatal("Failed to generate random bytes.", e.into()))?;
        Ok(id)
    }

    /// Generates a P-256 keypair, then checks what the token reports about it.
    ///
    /// Failing checks are reported and provisioning carries on; only a failed generation or
    /// an unusable public point end it.
    #[instrument(skip_all)]
    pub fn generate(
        &self,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<GeneratedKeyPair, ProvisioningError> {
        let id = self.new_key_id(sink)?;
        let template = KeyPairTemplate {
            private_label: &self.labels.private_key,
            public_label: &self.labels.public_key,
            id: &id,
        };
        let handles = self
            .session
            .generate_ec_keypair(&template)
            .map_err(|e| sink.fatal("Generating EC key pair failed.", e.into()))?;
        if !handles.private_key.is_valid() {
            return Err(sink.fatal(
                "Invalid private key handle generated by GenerateKeyPair.",
                ProvisioningError::InvalidHandle("private"),
            ));
        }
        if !handles.public_key.is_valid() {
            return Err(sink.fatal(
                "Invalid public key handle generated by GenerateKeyPair.",
                ProvisioningError::InvalidHandle("public"),
            ));
        }
        info!(
            private_key = %handles.private_key,
            public_key = %handles.public_key,
            "Generated EC key pair"
        );

        let checks = [
            (handles.private_key, AttributeKind::Class, CKO_PRIVATE_KEY, "private EC key class"),
            (handles.public_key, AttributeKind::Class, CKO_PUBLIC_KEY, "public EC key class"),
            (handles.private_key, AttributeKind::KeyType, CKK_EC, "private EC key type"),
            (handles.public_key, AttributeKind::KeyType, CKK_EC, "public EC key type"),
        ];
        for (object, attribute, expected, what) in checks {
            self.check_ulong(object, attribute, expected, what, sink);
        }

        let ec_point = self
            .read_attribute(handles.public_key, AttributeKind::EcPoint)
            .map_err(|e| sink.fatal("Failed to retrieve EC Point.", e.into()))?;
        let public_key = EcPublicKey::from_ec_point_attribute(&ec_point)
            .map_err(|e| sink.fatal("Malformed EC Point.", e.into()))?;

        self.self_test(handles.private_key, &public_key, sink);

        Ok(GeneratedKeyPair {
            handles,
            ec_point,
            public_key,
        })
    }

    /// Reads an attribute in two phases: its length, then its value.
    pub fn read_attribute(
        &self,
        object: ObjectHandle,
        attribute: AttributeKind,
    ) -> Result<Vec<u8>, TokenError> {
        let len = self.session.get_attribute(object, attribute, None)?;
        let mut value = vec![0; len];
        let written = self
            .session
            .get_attribute(object, attribute, Some(&mut value))?;
        value.truncate(written);
        Ok(value)
    }

    fn check_ulong(
        &self,
        object: ObjectHandle,
        attribute: AttributeKind,
        expected: u64,
        what: &str,
        sink: &mut dyn DiagnosticSink,
    ) {
        let len = match self.session.get_attribute(object, attribute, None) {
            Ok(len) => len,
            Err(e) => {
                let message = format!("GetAttributeValue for length of {what} failed.");
                sink.report(Diagnostic::failed(message, &e.into()));
                return;
            }
        };
        if len != ULONG_ATTRIBUTE_LEN {
            sink.report(Diagnostic::check(format!(
                "Incorrect {what} length returned from GetAttributeValue: {len}."
            )));
            return;
        }

        let mut value = [0; ULONG_ATTRIBUTE_LEN];
        if let Err(e) = self.session.get_attribute(object, attribute, Some(&mut value)) {
            let message = format!("GetAttributeValue for {what} failed.");
            sink.report(Diagnostic::failed(message, &e.into()));
            return;
        }
        match decode_ulong(&value) {
            Some(actual) if actual == expected => {
                debug!(%object, %attribute, actual, "Attribute matches")
            }
            Some(actual) => sink.report(Diagnostic::check(format!(
                "Incorrect {what} returned from GetAttributeValue: {actual:#x}, expected {expected:#x}."
            ))),
            None => sink.report(Diagnostic::check(format!(
                "Incorrect {what} returned from GetAttributeValue."
            ))),
        }
    }

    /// Signs a fixed digest and verifies the signature against the public point.
    fn self_test(
        &self,
        private_key: ObjectHandle,
        public_key: &EcPublicKey,
        sink: &mut dyn DiagnosticSink,
    ) {
        if let Err(e) = self.session.sign_init(SignMechanism::Ecdsa, private_key) {
            sink.report(Diagnostic::failed("Failed to SignInit ECDSA.", &e.into()));
            return;
        }
        let signature = match self.session.sign(&SELF_TEST_DIGEST) {
            Ok(signature) => signature,
            Err(e) => {
                sink.report(Diagnostic::failed("Failed to ECDSA Sign.", &e.into()));
                return;
            }
        };
        if public_key.verify_prehash(&SELF_TEST_DIGEST, &signature) {
            debug!("Self-test signature verified");
        } else {
            sink.report(Diagnostic::check(
                "Self-test signature does not verify against the public key.",
            ));
        }
    }
}
