use std::fmt;
use tracing::debug;
use tracing::warn;

use crate::error::FailureKind;

/// Where a provisioning run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvisioningState {
    #[default]
    Uninitialized,
    /// Prior credentials are gone from the token.
    NoCredentials,
    KeyPairGenerated,
    /// Terminal: the operator takes the request to a CA.
    CsrEmitted,
    CertificateImported,
    Failed { kind: FailureKind },
}

impl ProvisioningState {
    pub fn can_transition_to(&self, next: &ProvisioningState) -> bool {
        use ProvisioningState::*;
        matches!(
            (self, next),
            (Uninitialized, NoCredentials)
                | (NoCredentials, KeyPairGenerated)
                | (KeyPairGenerated, CsrEmitted)
                | (Uninitialized, CertificateImported)
                | (NoCredentials, CertificateImported)
        ) || (!self.is_failed() && next.is_failed())
    }

    /// Moves to `next` if the transition is legal. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: ProvisioningState) -> bool {
        if self.can_transition_to(&next) {
            debug!(from = %self, to = %next, "Provisioning state changed");
            *self = next;
            true
        } else {
            warn!(from = %self, to = %next, "Ignoring illegal provisioning state transition");
            false
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ProvisioningState::Failed { .. })
    }

    /// True for the states a successful run ends in.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProvisioningState::CsrEmitted | ProvisioningState::CertificateImported
        )
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningState::Uninitialized => f.write_str("Uninitialized"),
            ProvisioningState::NoCredentials => f.write_str("NoCredentials"),
            ProvisioningState::KeyPairGenerated => f.write_str("KeyPairGenerated"),
            ProvisioningState::CsrEmitted => f.write_str("CsrEmitted"),
            ProvisioningState::CertificateImported => f.write_str("CertificateImported"),
            ProvisioningState::Failed { kind } => write!(f, "Failed{{{kind}}}"),
        }
    }
}
