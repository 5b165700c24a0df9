use camino::Utf8PathBuf;
use certificate::CsrBuildError;
use certificate::CsrPhase;
use certificate::EcPointError;
use certificate::SignerError;
use p11_token::rv;
use p11_token::RngError;
use p11_token::TokenError;
use std::fmt;
use tracing::error;
use tracing::warn;

use crate::config::ConfigError;

/// Code reported for failures that did not come from the token.
pub const NO_TOKEN_CODE: i64 = -1;

/// How provisioning failed, as recorded in the final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Token { code: u64 },
    BadInput,
    Sign,
    CsrBuild { phase: CsrPhase },
    Aborted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Token { code } => write!(f, "TokenError{{{code:#06x}}}"),
            FailureKind::BadInput => f.write_str("BadInput"),
            FailureKind::Sign => f.write_str("SignError"),
            FailureKind::CsrBuild { phase } => write!(f, "CsrBuildError{{{phase}}}"),
            FailureKind::Aborted => f.write_str("Aborted"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisioningError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Csr(#[from] CsrBuildError),

    #[error("Malformed public key")]
    EcPoint(#[from] EcPointError),

    #[error("Invalid {0} key handle generated by GenerateKeyPair")]
    InvalidHandle(&'static str),

    #[error("Could not read credential {path}")]
    Credential {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("No {0} configured in the [credentials] section")]
    MissingCredential(&'static str),

    #[error("Could not parse the P-256 private key in {path}: {reason}")]
    PrivateKey { path: Utf8PathBuf, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProvisioningError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProvisioningError::Token(err) | ProvisioningError::Rng(RngError(err)) => {
                token_failure(err)
            }
            ProvisioningError::Signer(SignerError::Sign(err)) if err.is_abort() => {
                FailureKind::Aborted
            }
            ProvisioningError::Signer(SignerError::BadInput(_)) => FailureKind::BadInput,
            ProvisioningError::Signer(_) => FailureKind::Sign,
            ProvisioningError::Csr(err) => match &err.signer_error {
                Some(SignerError::Sign(token_err)) if token_err.is_abort() => FailureKind::Aborted,
                _ => FailureKind::CsrBuild { phase: err.phase },
            },
            ProvisioningError::InvalidHandle(_) => FailureKind::Token {
                code: rv::CKR_KEY_HANDLE_INVALID,
            },
            ProvisioningError::EcPoint(_)
            | ProvisioningError::Credential { .. }
            | ProvisioningError::MissingCredential(_)
            | ProvisioningError::PrivateKey { .. }
            | ProvisioningError::Config(_) => FailureKind::BadInput,
        }
    }

    /// The integer code logged with the diagnostic line.
    pub fn code(&self) -> i64 {
        match self {
            ProvisioningError::Token(err) => err.code as i64,
            ProvisioningError::Rng(err) => i64::from(err.status()),
            ProvisioningError::Signer(err) => i64::from(err.status()),
            ProvisioningError::Csr(err) => match &err.signer_error {
                Some(signer_err) => i64::from(signer_err.status()),
                None => NO_TOKEN_CODE,
            },
            ProvisioningError::InvalidHandle(_) => rv::CKR_KEY_HANDLE_INVALID as i64,
            _ => NO_TOKEN_CODE,
        }
    }
}

fn token_failure(err: &TokenError) -> FailureKind {
    if err.is_abort() {
        FailureKind::Aborted
    } else {
        FailureKind::Token { code: err.code }
    }
}

/// One line of the diagnostic dump shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    /// Kind of the failed call, if a call failed.
    pub kind: Option<FailureKind>,
    /// `CK_RV` or callback status of the failed call.
    pub code: Option<i64>,
    /// Set when the failure ended provisioning.
    pub fatal: bool,
}

impl Diagnostic {
    /// A check that found an unexpected value.
    pub fn check(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            kind: None,
            code: None,
            fatal: false,
        }
    }

    /// A failed step that provisioning carries on after.
    pub fn failed(message: impl Into<String>, err: &ProvisioningError) -> Self {
        Diagnostic {
            message: message.into(),
            kind: Some(err.kind()),
            code: Some(err.code()),
            fatal: false,
        }
    }

    /// A failed step that ends provisioning.
    pub fn fatal(message: impl Into<String>, err: &ProvisioningError) -> Self {
        Diagnostic {
            fatal: true,
            ..Diagnostic::failed(message, err)
        }
    }
}

/// Receives the diagnostics of the provisioning steps, in order.
pub trait DiagnosticSink {
    fn record(&mut self, diagnostic: Diagnostic);

    /// Logs a diagnostic and records it.
    fn report(&mut self, diagnostic: Diagnostic) {
        let kind = diagnostic.kind.map(|kind| kind.to_string());
        if diagnostic.fatal {
            error!(kind = kind.as_deref(), code = diagnostic.code, "{}", diagnostic.message);
        } else {
            warn!(kind = kind.as_deref(), code = diagnostic.code, "{}", diagnostic.message);
        }
        self.record(diagnostic);
    }

    /// Reports a step that ends provisioning, handing its error back.
    fn fatal(&mut self, message: &str, err: ProvisioningError) -> ProvisioningError {
        self.report(Diagnostic::fatal(message, &err));
        err
    }
}

impl DiagnosticSink for Vec<Diagnostic> {
    fn record(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p11_token::TokenFunction;
    use test_case::test_case;

    fn token_error(code: u64) -> TokenError {
        TokenError::new(TokenFunction::Sign, code)
    }

    #[test_case(rv::CKR_DEVICE_ERROR, FailureKind::Token { code: rv::CKR_DEVICE_ERROR }; "device error")]
    #[test_case(rv::CKR_FUNCTION_CANCELED, FailureKind::Aborted; "cancelled")]
    #[test_case(rv::CKR_SESSION_HANDLE_INVALID, FailureKind::Aborted; "session gone")]
    fn token_errors_map_to_token_or_aborted(code: u64, kind: FailureKind) {
        assert_eq!(ProvisioningError::from(token_error(code)).kind(), kind);
    }

    #[test]
    fn signing_failures_inside_the_csr_writer() {
        let write_failure = |code| CsrBuildError {
            phase: CsrPhase::Write,
            reason: "Token failed to sign the digest".into(),
            signer_error: Some(SignerError::Sign(token_error(code))),
        };

        let err = ProvisioningError::from(write_failure(rv::CKR_FUNCTION_FAILED));
        assert_eq!(
            err.kind(),
            FailureKind::CsrBuild {
                phase: CsrPhase::Write
            }
        );
        assert_eq!(err.code(), -2003);

        let err = ProvisioningError::from(write_failure(rv::CKR_DEVICE_REMOVED));
        assert_eq!(err.kind(), FailureKind::Aborted);
    }

    #[test]
    fn signer_errors() {
        assert_eq!(
            ProvisioningError::from(SignerError::BadInput(300)).kind(),
            FailureKind::BadInput
        );
        assert_eq!(
            ProvisioningError::from(SignerError::UnexpectedSignatureLength(10)).kind(),
            FailureKind::Sign
        );
    }

    #[test]
    fn rng_failures_report_the_rng_status() {
        let err = ProvisioningError::from(RngError(token_error(rv::CKR_DEVICE_ERROR)));
        assert_eq!(err.code(), -2002);
        assert_eq!(
            err.kind(),
            FailureKind::Token {
                code: rv::CKR_DEVICE_ERROR
            }
        );
    }

    #[test]
    fn kinds_are_displayed_like_the_log_lines() {
        assert_eq!(
            FailureKind::CsrBuild {
                phase: CsrPhase::Write
            }
            .to_string(),
            "CsrBuildError{write}"
        );
        assert_eq!(
            FailureKind::Token {
                code: rv::CKR_PIN_INCORRECT
            }
            .to_string(),
            "TokenError{0x00a0}"
        );
    }
}
