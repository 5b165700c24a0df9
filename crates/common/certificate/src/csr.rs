//! PKCS #10 certificate signing requests for keys held by a token.

use p11_token::ObjectHandle;
use p11_token::TokenSession;
use rcgen::CertificateParams;
use rcgen::CustomExtension;
use rcgen::DistinguishedName;
use rcgen::DnType;
use std::fmt;
use tracing::debug;
use tracing::error;

use crate::ec_point::EcPublicKey;
use crate::signer::SignerError;
use crate::signer::TokenSigner;

/// Subject of the requests emitted by provisioning.
pub const DEFAULT_SUBJECT: &str = "CN=ThingName";

/// Capacity of the PEM output.
///
/// A P-256 request with the default subject and extensions encodes to at most 258 DER bytes,
/// which is 430 bytes of PEM with CRLF line endings.
pub const CSR_PEM_BUFFER_SIZE: usize = 512;

const OID_KEY_USAGE: &[u64] = &[2, 5, 29, 15];
const OID_NS_CERT_TYPE: &[u64] = &[2, 16, 840, 1, 113730, 1, 1];

/// The step of request construction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsrPhase {
    Subject,
    Key,
    Md,
    KeyUsage,
    NsCertType,
    Write,
}

impl fmt::Display for CsrPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            CsrPhase::Subject => "subject",
            CsrPhase::Key => "key",
            CsrPhase::Md => "md",
            CsrPhase::KeyUsage => "keyUsage",
            CsrPhase::NsCertType => "nsCertType",
            CsrPhase::Write => "write",
        };
        f.write_str(phase)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to build the certificate signing request ({phase}): {reason}")]
pub struct CsrBuildError {
    pub phase: CsrPhase,
    pub reason: String,
    /// Set when the request could not be signed.
    pub signer_error: Option<SignerError>,
}

impl CsrBuildError {
    fn new(phase: CsrPhase, reason: impl ToString) -> Self {
        CsrBuildError {
            phase,
            reason: reason.to_string(),
            signer_error: None,
        }
    }

    fn signing_failed(err: SignerError) -> Self {
        CsrBuildError {
            phase: CsrPhase::Write,
            reason: err.to_string(),
            signer_error: Some(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
}

/// Bits of the X.509 keyUsage extension, RFC 5280 section 4.2.1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
}

impl KeyUsage {
    fn bit(self) -> u8 {
        match self {
            KeyUsage::DigitalSignature => 0,
            KeyUsage::NonRepudiation => 1,
            KeyUsage::KeyEncipherment => 2,
            KeyUsage::DataEncipherment => 3,
            KeyUsage::KeyAgreement => 4,
            KeyUsage::KeyCertSign => 5,
            KeyUsage::CrlSign => 6,
        }
    }
}

/// Bits of the Netscape certificate type extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsCertType {
    SslClient,
    SslServer,
    Smime,
    ObjectSigning,
}

impl NsCertType {
    fn bit(self) -> u8 {
        match self {
            NsCertType::SslClient => 0,
            NsCertType::SslServer => 1,
            NsCertType::Smime => 2,
            NsCertType::ObjectSigning => 3,
        }
    }
}

/// What goes into a signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrTemplate {
    /// Comma separated `KEY=value` pairs, e.g. `CN=ThingName, O=Acme`.
    pub subject: String,
    pub digest: DigestAlgorithm,
    pub key_usage: Vec<KeyUsage>,
    pub ns_cert_type: Vec<NsCertType>,
}

impl Default for CsrTemplate {
    fn default() -> Self {
        CsrTemplate {
            subject: DEFAULT_SUBJECT.to_string(),
            digest: DigestAlgorithm::Sha256,
            key_usage: vec![KeyUsage::DigitalSignature],
            ns_cert_type: vec![NsCertType::SslClient],
        }
    }
}

impl CsrTemplate {
    /// Builds a request for the token keypair and returns it PEM encoded.
    ///
    /// `ec_point` is the `CKA_EC_POINT` value of the public key. The request is signed by the
    /// token through a [`TokenSigner`].
    pub fn write_csr_pem(
        &self,
        session: &dyn TokenSession,
        private_key: ObjectHandle,
        ec_point: &[u8],
    ) -> Result<String, CsrBuildError> {
        let result = self.write_csr_pem_inner(session, private_key, ec_point);
        if let Err(err) = &result {
            error!(phase = %err.phase, reason = %err.reason, "Failed to build the CSR");
        }
        result
    }

    fn write_csr_pem_inner(
        &self,
        session: &dyn TokenSession,
        private_key: ObjectHandle,
        ec_point: &[u8],
    ) -> Result<String, CsrBuildError> {
        let distinguished_name =
            parse_subject(&self.subject).map_err(|e| CsrBuildError::new(CsrPhase::Subject, e))?;

        let public_key = EcPublicKey::from_ec_point_attribute(ec_point)
            .map_err(|e| CsrBuildError::new(CsrPhase::Key, e))?;
        let signer = TokenSigner::new(session, private_key, public_key);

        if self.digest != DigestAlgorithm::Sha256 {
            return Err(CsrBuildError::new(
                CsrPhase::Md,
                format!("{:?} cannot be used with a P-256 key", self.digest),
            ));
        }

        let key_usage = named_bits(self.key_usage.iter().map(|u| u.bit()))
            .ok_or_else(|| CsrBuildError::new(CsrPhase::KeyUsage, "no key usage is set"))?;
        let ns_cert_type = named_bits(self.ns_cert_type.iter().map(|t| t.bit())).ok_or_else(
            || CsrBuildError::new(CsrPhase::NsCertType, "no certificate type is set"),
        )?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name;
        params.custom_extensions = vec![
            CustomExtension::from_oid_content(OID_KEY_USAGE, key_usage),
            CustomExtension::from_oid_content(OID_NS_CERT_TYPE, ns_cert_type),
        ];

        let csr = params.serialize_request(&signer).map_err(|err| {
            // rcgen only knows a remote key failed, the signer knows why
            match signer.take_last_error() {
                Some(signer_err) => CsrBuildError::signing_failed(signer_err),
                None => CsrBuildError::new(CsrPhase::Write, err),
            }
        })?;
        let pem = csr.pem().map_err(|e| CsrBuildError::new(CsrPhase::Write, e))?;

        if pem.len() > CSR_PEM_BUFFER_SIZE {
            return Err(CsrBuildError::new(
                CsrPhase::Write,
                format!(
                    "PEM is {} bytes long, the buffer holds {CSR_PEM_BUFFER_SIZE}",
                    pem.len()
                ),
            ));
        }

        debug!(len = pem.len(), "Wrote certificate signing request");
        Ok(pem)
    }
}

/// Parses a subject such as `CN=ThingName, O=Acme`.
pub fn parse_subject(subject: &str) -> Result<DistinguishedName, String> {
    if subject.trim().is_empty() {
        return Err("subject is empty".to_string());
    }

    let mut distinguished_name = DistinguishedName::new();
    for component in subject.split(',') {
        let Some((key, value)) = component.split_once('=') else {
            return Err(format!("'{}' is not a KEY=value pair", component.trim()));
        };
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("{} has no value", key.trim()));
        }
        let dn_type = match key.trim() {
            "CN" => DnType::CommonName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "C" => DnType::CountryName,
            "ST" => DnType::StateOrProvinceName,
            "L" => DnType::LocalityName,
            other => return Err(format!("unsupported attribute '{other}'")),
        };
        distinguished_name.push(dn_type, value);
    }
    Ok(distinguished_name)
}

/// DER encodes a named bit list as a BIT STRING, without trailing zero bits.
fn named_bits(bits: impl Iterator<Item = u8>) -> Option<Vec<u8>> {
    let mut value: u8 = 0;
    for bit in bits {
        value |= 0x80 >> bit;
    }
    if value == 0 {
        return None;
    }
    let unused_bits = value.trailing_zeros() as u8;
    Some(vec![0x03, 0x02, unused_bits, value])
}
