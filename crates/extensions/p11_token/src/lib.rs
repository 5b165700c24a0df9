//! Access to a PKCS#11 token for device credential provisioning.
//!
//! The [`Token`] and [`TokenSession`] traits are the seam between the provisioning flow and a
//! token implementation. [`pkcs11::Cryptoki`] implements them on top of a dynamically loaded
//! PKCS#11 module.

pub mod error;
pub mod pkcs11;
pub mod rng;
pub mod service;

pub use error::rv;
pub use error::TokenError;
pub use error::TokenFunction;
pub use pkcs11::Cryptoki;
pub use pkcs11::CryptokiConfigDirect;
pub use rng::fill_random;
pub use rng::RngError;
pub use rng::TokenRng;
pub use rng::TLS_ERROR_RNG;
pub use service::*;
