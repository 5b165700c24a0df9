use camino::Utf8Path;
use camino::Utf8PathBuf;
use sha1::Digest;
use sha1::Sha1;

pub mod csr;
pub mod ec_point;
pub mod signature;
pub mod signer;

pub use csr::CsrBuildError;
pub use csr::CsrPhase;
pub use csr::CsrTemplate;
pub use ec_point::EcPointError;
pub use ec_point::EcPublicKey;
pub use signer::SignerError;
pub use signer::TokenSigner;

/// A PEM certificate, inspected before it is written to a token.
pub struct PemCertificate {
    pem: x509_parser::pem::Pem,
}

impl PemCertificate {
    pub fn from_pem_file(path: impl AsRef<Utf8Path>) -> Result<PemCertificate, CertificateError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| CertificateError::ReadFailed {
            path: path.to_owned(),
            source,
        })?;
        let (pem, _) = x509_parser::pem::Pem::read(std::io::BufReader::new(file))?;
        Ok(PemCertificate { pem })
    }

    pub fn from_pem_bytes(content: &[u8]) -> Result<PemCertificate, CertificateError> {
        let (pem, _) = x509_parser::pem::Pem::read(std::io::Cursor::new(content))?;
        Ok(PemCertificate { pem })
    }

    pub fn subject(&self) -> Result<String, CertificateError> {
        let x509 = PemCertificate::extract_certificate(&self.pem)?;
        Ok(x509.tbs_certificate.subject.to_string())
    }

    pub fn issuer(&self) -> Result<String, CertificateError> {
        let x509 = PemCertificate::extract_certificate(&self.pem)?;
        Ok(x509.tbs_certificate.issuer.to_string())
    }

    /// Upper-case hex SHA-1 of the DER certificate.
    pub fn thumbprint(&self) -> String {
        let bytes = Sha1::digest(&self.pem.contents);
        bytes.iter().map(|b| format!("{:02X}", b)).collect()
    }

    fn extract_certificate(
        pem: &x509_parser::pem::Pem,
    ) -> Result<x509_parser::certificate::X509Certificate<'_>, CertificateError> {
        let x509 = pem.parse_x509().map_err(|err| {
            // The x509 error is wrapped into a `nom::Err`
            // and cannot be extracted without pattern matching on that type
            CertificateError::X509Error(err.to_string())
        })?;
        Ok(x509)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CertificateError {
    #[error("Could not read {path}")]
    ReadFailed {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("PEM file format error")]
    PemError(#[from] x509_parser::error::PEMError),

    #[error("X509 file format error: {0}")]
    X509Error(String),
}
