//! Provisioning of the credentials a device uses for mutually authenticated TLS.
//!
//! In generate mode the device keypair is created inside a PKCS #11 token and a certificate
//! signing request, signed by the token, is handed to the operator. In import mode externally
//! minted credentials are written to the token.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod import;
pub mod keypair;
pub mod operator;
pub mod state;

pub use config::ConfigError;
pub use config::ProvisioningConfig;
pub use config::ProvisioningMode;
pub use coordinator::KeyProvisioning;
pub use coordinator::ProvisioningReport;
pub use error::Diagnostic;
pub use error::FailureKind;
pub use error::ProvisioningError;
pub use state::ProvisioningState;
