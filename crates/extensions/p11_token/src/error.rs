use std::fmt;

/// `CK_RV` values the provisioning flow produces or inspects.
///
/// Reference: <https://docs.oasis-open.org/pkcs11/pkcs11-base/v2.40/os/pkcs11-base-v2.40-os.html#_Toc416959687>
pub mod rv {
    pub const CKR_OK: u64 = 0x0000;
    pub const CKR_GENERAL_ERROR: u64 = 0x0005;
    pub const CKR_FUNCTION_FAILED: u64 = 0x0006;
    pub const CKR_ARGUMENTS_BAD: u64 = 0x0007;
    pub const CKR_ATTRIBUTE_TYPE_INVALID: u64 = 0x0012;
    pub const CKR_DEVICE_ERROR: u64 = 0x0030;
    pub const CKR_DEVICE_REMOVED: u64 = 0x0032;
    pub const CKR_FUNCTION_CANCELED: u64 = 0x0050;
    pub const CKR_KEY_HANDLE_INVALID: u64 = 0x0060;
    pub const CKR_KEY_FUNCTION_NOT_PERMITTED: u64 = 0x0068;
    pub const CKR_MECHANISM_INVALID: u64 = 0x0070;
    pub const CKR_OBJECT_HANDLE_INVALID: u64 = 0x0082;
    pub const CKR_OPERATION_NOT_INITIALIZED: u64 = 0x0091;
    pub const CKR_PIN_INCORRECT: u64 = 0x00A0;
    pub const CKR_SESSION_CLOSED: u64 = 0x00B0;
    pub const CKR_SESSION_HANDLE_INVALID: u64 = 0x00B3;
    pub const CKR_TEMPLATE_INCOMPLETE: u64 = 0x00D0;
    pub const CKR_TOKEN_NOT_PRESENT: u64 = 0x00E0;
    pub const CKR_USER_NOT_LOGGED_IN: u64 = 0x0101;
    pub const CKR_BUFFER_TOO_SMALL: u64 = 0x0150;
    pub const CKR_CRYPTOKI_NOT_INITIALIZED: u64 = 0x0190;
}

/// A token call that did not return `CKR_OK`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{function} failed with CK_RV {code:#06x}")]
pub struct TokenError {
    pub function: TokenFunction,
    pub code: u64,
}

impl TokenError {
    pub fn new(function: TokenFunction, code: u64) -> Self {
        TokenError { function, code }
    }

    /// Returns true if the error is how a host-side abort surfaces: the operation was cancelled,
    /// or the session or the token went away under us.
    pub fn is_abort(&self) -> bool {
        matches!(
            self.code,
            rv::CKR_FUNCTION_CANCELED
                | rv::CKR_SESSION_CLOSED
                | rv::CKR_SESSION_HANDLE_INVALID
                | rv::CKR_DEVICE_REMOVED
                | rv::CKR_TOKEN_NOT_PRESENT
        )
    }
}

/// The token entry point that produced a [`TokenError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenFunction {
    Initialize,
    OpenSession,
    Login,
    CloseSession,
    GenerateRandom,
    GenerateKeyPair,
    GetAttributeValue,
    SignInit,
    Sign,
    FindObjects,
    DestroyObject,
    CreateObject,
}

impl TokenFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenFunction::Initialize => "C_Initialize",
            TokenFunction::OpenSession => "C_OpenSession",
            TokenFunction::Login => "C_Login",
            TokenFunction::CloseSession => "C_CloseSession",
            TokenFunction::GenerateRandom => "C_GenerateRandom",
            TokenFunction::GenerateKeyPair => "C_GenerateKeyPair",
            TokenFunction::GetAttributeValue => "C_GetAttributeValue",
            TokenFunction::SignInit => "C_SignInit",
            TokenFunction::Sign => "C_Sign",
            TokenFunction::FindObjects => "C_FindObjects",
            TokenFunction::DestroyObject => "C_DestroyObject",
            TokenFunction::CreateObject => "C_CreateObject",
        }
    }
}

impl fmt::Display for TokenFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
