//! Interfaces with the PKCS#11 dynamic module using cryptoki crate.
//!
//! Object handles returned by cryptoki are kept in a per-session registry and handed out as
//! [`ObjectHandle`] indices, so callers never depend on cryptoki types.
//!
//! Reference:
//! - PKCS#11: <https://docs.oasis-open.org/pkcs11/pkcs11-base/v2.40/os/pkcs11-base-v2.40-os.html>
//! - EC keys: <https://docs.oasis-open.org/pkcs11/pkcs11-curr/v3.0/os/pkcs11-curr-v3.0-os.html#_Toc30061181>

use anyhow::Context;
use asn1_rs::ToDer;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use cryptoki::context::CInitializeArgs;
use cryptoki::context::CInitializeFlags;
use cryptoki::context::Pkcs11;
use cryptoki::error::Error;
use cryptoki::error::RvError;
use cryptoki::mechanism::Mechanism;
use cryptoki::object::Attribute;
use cryptoki::object::AttributeInfo;
use cryptoki::object::AttributeType;
use cryptoki::object::CertificateType;
use cryptoki::object::KeyType;
use cryptoki::object::ObjectClass;
use cryptoki::object::ObjectHandle as CryptokiHandle;
use cryptoki::session::Session;
use cryptoki::session::UserType;
use cryptoki::slot::TokenInfo;
use cryptoki::types::AuthPin;
use tracing::debug;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::error::rv;
use crate::error::TokenError;
use crate::error::TokenFunction;
use crate::service::encode_ulong;
use crate::service::AttributeKind;
use crate::service::KeyPairHandles;
use crate::service::KeyPairTemplate;
use crate::service::ObjectHandle;
use crate::service::SecretString;
use crate::service::SignMechanism;
use crate::service::Token;
use crate::service::TokenSession;
use crate::service::CKO_CERTIFICATE;
use crate::service::CKO_PRIVATE_KEY;
use crate::service::CKO_PUBLIC_KEY;
use crate::service::CKK_EC;
use crate::service::SECP256R1_EC_PARAMS;

#[derive(Clone)]
pub struct CryptokiConfigDirect {
    pub module_path: Utf8PathBuf,
    pub pin: SecretString,
    /// Label of the token to use; the first token present is used if unset.
    pub token_label: Option<Arc<str>>,
    /// Serial number of the token to use.
    pub serial: Option<Arc<str>>,
}

impl Debug for CryptokiConfigDirect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptokiConfigDirect")
            .field("module_path", &self.module_path)
            .field("pin", &"[REDACTED]")
            .field("token_label", &self.token_label)
            .field("serial", &self.serial)
            .finish()
    }
}

/// A [`Token`] implementation that uses the loaded cryptoki library.
#[derive(Debug, Clone)]
pub struct Cryptoki {
    context: Arc<Mutex<Pkcs11>>,
    config: CryptokiConfigDirect,
}

impl Cryptoki {
    pub fn new(config: CryptokiConfigDirect) -> anyhow::Result<Self> {
        let pkcs11client = Self::load(&config.module_path)?;
        pkcs11client
            .initialize(CInitializeArgs::new(CInitializeFlags::OS_LOCKING_OK))
            .context("Failed to initialize PKCS#11 module")?;

        Ok(Self {
            context: Arc::new(Mutex::new(pkcs11client)),
            config,
        })
    }

    fn load(module_path: &Utf8Path) -> anyhow::Result<Pkcs11> {
        debug!(%module_path, "Loading PKCS#11 module");
        // can fail with Pkcs11(GeneralError, GetFunctionList) if P11_KIT_SERVER_ADDRESS is wrong
        Pkcs11::new(module_path).context("Failed to load PKCS#11 dynamic object")
    }

    /// Reinitializes the PKCS11 library.
    ///
    /// In some libraries, if the slot list changes, this change might not be visible until
    /// C_Initialize is called again.
    fn reinit(&self) -> Result<(), TokenError> {
        // load a new client before locking so if error we don't poison the mutex
        let new_client = Self::load(&self.config.module_path).map_err(|err| {
            warn!(?err, "Failed to reload PKCS#11 module");
            TokenError::new(TokenFunction::Initialize, rv::CKR_GENERAL_ERROR)
        })?;

        let mut context = lock(&self.context);
        let old_client = std::mem::replace(&mut *context, new_client);

        // C_Finalize should be the last call made on the old client
        let _ = old_client.finalize();

        context
            .initialize(CInitializeArgs::new(CInitializeFlags::OS_LOCKING_OK))
            .map_err(token_error(TokenFunction::Initialize))
    }

    fn select_slot(&self, context: &Pkcs11) -> Result<Option<cryptoki::slot::Slot>, TokenError> {
        let wanted_label = self.config.token_label.as_deref();
        let wanted_serial = self.config.serial.as_deref();

        let slots = context
            .get_slots_with_token()
            .map_err(token_error(TokenFunction::OpenSession))?;

        for slot in slots {
            let token_info = context
                .get_token_info(slot)
                .map_err(token_error(TokenFunction::OpenSession))?;
            let label_matches = wanted_label.is_none() || wanted_label == Some(token_info.label());
            let serial_matches =
                wanted_serial.is_none() || wanted_serial == Some(token_info.serial_number());
            if label_matches && serial_matches {
                return Ok(Some(slot));
            }
        }

        Ok(None)
    }

    fn open_session_in(&self, slot: cryptoki::slot::Slot) -> Result<CryptokiSession, TokenError> {
        let context = lock(&self.context);
        let token_info = context
            .get_token_info(slot)
            .map_err(token_error(TokenFunction::OpenSession))?;
        debug!(?token_info, "Selected slot");

        // provisioning writes objects, so the session is always read-write
        let session = context
            .open_rw_session(slot)
            .map_err(token_error(TokenFunction::OpenSession))?;

        let pin = AuthPin::new(self.config.pin.expose().to_string().into());
        session
            .login(UserType::User, Some(&pin))
            .map_err(token_error(TokenFunction::Login))?;
        let session_info = session
            .get_session_info()
            .map_err(token_error(TokenFunction::OpenSession))?;
        debug!(?session_info, "Opened a read-write session");

        Ok(CryptokiSession {
            session,
            token_info,
            handles: Mutex::new(Vec::new()),
            pending_sign: Mutex::new(None),
        })
    }
}

impl Token for Cryptoki {
    #[instrument(skip_all)]
    fn open_session(&self) -> Result<Box<dyn TokenSession + '_>, TokenError> {
        let slot = {
            let context = lock(&self.context);
            self.select_slot(&context)?
        };

        let slot = match slot {
            Some(slot) => slot,
            // some libraries only notice a newly inserted token after C_Initialize
            None => {
                warn!("Didn't find a slot to use, reloading the library to retry");
                self.reinit()?;
                let context = lock(&self.context);
                self.select_slot(&context)?.ok_or_else(|| {
                    warn!("Didn't find a slot to use. The device may be disconnected.");
                    TokenError::new(TokenFunction::OpenSession, rv::CKR_TOKEN_NOT_PRESENT)
                })?
            }
        };

        Ok(Box::new(self.open_session_in(slot)?))
    }
}

/// A cryptoki session opened with a token.
struct CryptokiSession {
    session: Session,
    token_info: TokenInfo,
    handles: Mutex<Vec<CryptokiHandle>>,
    pending_sign: Mutex<Option<(SignMechanism, CryptokiHandle)>>,
}

impl CryptokiSession {
    fn register(&self, handle: CryptokiHandle) -> ObjectHandle {
        let mut handles = lock(&self.handles);
        handles.push(handle);
        ObjectHandle(handles.len() as u64)
    }

    fn resolve(
        &self,
        handle: ObjectHandle,
        function: TokenFunction,
    ) -> Result<CryptokiHandle, TokenError> {
        let handles = lock(&self.handles);
        usize::try_from(handle.0)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| handles.get(i).copied())
            .ok_or(TokenError::new(function, rv::CKR_OBJECT_HANDLE_INVALID))
    }

    fn find_by_label(&self, label: &str) -> Result<Vec<CryptokiHandle>, TokenError> {
        let template = [Attribute::Label(label.as_bytes().to_vec())];
        self.session
            .find_objects(&template)
            .map_err(token_error(TokenFunction::FindObjects))
    }

    fn create_keypair_objects(
        &self,
        public_template: Vec<Attribute>,
        private_template: Vec<Attribute>,
    ) -> Result<KeyPairHandles, TokenError> {
        let public_key = self
            .session
            .create_object(&public_template)
            .map_err(token_error(TokenFunction::CreateObject))?;
        let private_key = self
            .session
            .create_object(&private_template)
            .map_err(token_error(TokenFunction::CreateObject))?;

        Ok(KeyPairHandles {
            private_key: self.register(private_key),
            public_key: self.register(public_key),
        })
    }
}

impl TokenSession for CryptokiSession {
    fn generate_random(&self, buf: &mut [u8]) -> Result<(), TokenError> {
        self.session
            .generate_random_slice(buf)
            .map_err(token_error(TokenFunction::GenerateRandom))
    }

    #[instrument(skip_all, fields(private_label = template.private_label, public_label = template.public_label))]
    fn generate_ec_keypair(
        &self,
        template: &KeyPairTemplate<'_>,
    ) -> Result<KeyPairHandles, TokenError> {
        let pub_key_template = [
            Attribute::EcParams(SECP256R1_EC_PARAMS.to_vec()),
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Verify(true),
            Attribute::Label(template.public_label.as_bytes().to_vec()),
            Attribute::Id(template.id.to_vec()),
        ];

        let priv_key_template = [
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
            Attribute::Label(template.private_label.as_bytes().to_vec()),
            Attribute::Id(template.id.to_vec()),
        ];

        trace!(?pub_key_template, ?priv_key_template, "Generating keypair");
        let (public_key, private_key) = self
            .session
            .generate_key_pair(
                &Mechanism::EccKeyPairGen,
                &pub_key_template,
                &priv_key_template,
            )
            .map_err(token_error(TokenFunction::GenerateKeyPair))?;

        Ok(KeyPairHandles {
            private_key: self.register(private_key),
            public_key: self.register(public_key),
        })
    }

    #[instrument(skip_all, fields(private_label = template.private_label, public_label = template.public_label))]
    fn import_ec_keypair(
        &self,
        template: &KeyPairTemplate<'_>,
        private_scalar: &[u8],
        ec_point: &[u8],
    ) -> Result<KeyPairHandles, TokenError> {
        // CKA_EC_POINT holds the SEC1 point wrapped in an OCTET STRING
        let ec_point = asn1_rs::OctetString::new(ec_point)
            .to_der_vec()
            .map_err(|err| {
                warn!(?err, "Failed to encode EC point");
                TokenError::new(TokenFunction::CreateObject, rv::CKR_ARGUMENTS_BAD)
            })?;

        let public_template = vec![
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(KeyType::EC),
            Attribute::EcParams(SECP256R1_EC_PARAMS.to_vec()),
            Attribute::EcPoint(ec_point),
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Verify(true),
            Attribute::Label(template.public_label.as_bytes().to_vec()),
            Attribute::Id(template.id.to_vec()),
        ];

        let private_template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(KeyType::EC),
            Attribute::EcParams(SECP256R1_EC_PARAMS.to_vec()),
            Attribute::Value(private_scalar.to_vec()),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
            Attribute::Label(template.private_label.as_bytes().to_vec()),
            Attribute::Id(template.id.to_vec()),
        ];

        self.create_keypair_objects(public_template, private_template)
    }

    fn get_attribute(
        &self,
        object: ObjectHandle,
        attribute: AttributeKind,
        receiver: Option<&mut [u8]>,
    ) -> Result<usize, TokenError> {
        let function = TokenFunction::GetAttributeValue;
        let handle = self.resolve(object, function)?;
        let attribute_type = attribute_type(attribute);

        let Some(receiver) = receiver else {
            let info = self
                .session
                .get_attribute_info(handle, &[attribute_type])
                .map_err(token_error(function))?;
            return match info.into_iter().next() {
                Some(AttributeInfo::Available(len)) => Ok(len),
                other => {
                    warn!(%object, %attribute, ?other, "Attribute is not available");
                    Err(TokenError::new(function, rv::CKR_ATTRIBUTE_TYPE_INVALID))
                }
            };
        };

        let value = self
            .session
            .get_attributes(handle, &[attribute_type])
            .map_err(token_error(function))?
            .into_iter()
            .next()
            .and_then(attribute_value)
            .ok_or(TokenError::new(function, rv::CKR_ATTRIBUTE_TYPE_INVALID))?;

        let Some(target) = receiver.get_mut(..value.len()) else {
            return Err(TokenError::new(function, rv::CKR_BUFFER_TOO_SMALL));
        };
        target.copy_from_slice(&value);
        Ok(value.len())
    }

    /// Checks the key with the token and arms the operation.
    ///
    /// cryptoki issues `C_SignInit` and `C_Sign` together, so `C_SignInit` itself runs in
    /// [`TokenSession::sign`]. Keys that are not signing private keys are rejected here.
    fn sign_init(&self, mechanism: SignMechanism, key: ObjectHandle) -> Result<(), TokenError> {
        let function = TokenFunction::SignInit;
        let key = self.resolve(key, function)?;
        let attributes = self
            .session
            .get_attributes(key, &[AttributeType::Class, AttributeType::Sign])
            .map_err(token_error(function))?;
        for attribute in attributes {
            match attribute {
                Attribute::Class(class) if class != ObjectClass::PRIVATE_KEY => {
                    warn!(?class, "Signing key is not a private key");
                    return Err(TokenError::new(function, rv::CKR_KEY_HANDLE_INVALID));
                }
                Attribute::Sign(false) => {
                    warn!("Signing key does not allow signing");
                    return Err(TokenError::new(function, rv::CKR_KEY_FUNCTION_NOT_PERMITTED));
                }
                _ => {}
            }
        }
        *lock(&self.pending_sign) = Some((mechanism, key));
        Ok(())
    }

    #[instrument(skip_all)]
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let Some((mechanism, key)) = lock(&self.pending_sign).take() else {
            return Err(TokenError::new(
                TokenFunction::Sign,
                rv::CKR_OPERATION_NOT_INITIALIZED,
            ));
        };

        let mechanism = match mechanism {
            SignMechanism::Ecdsa => Mechanism::Ecdsa,
        };

        trace!(len = data.len(), ?mechanism, "Signing digest");
        self.session
            .sign(&mechanism, key, data)
            .map_err(token_error(TokenFunction::Sign))
    }

    #[instrument(skip_all)]
    fn destroy_all_credentials(&self, labels: &[&str]) -> Result<usize, TokenError> {
        let mut destroyed = 0;
        for label in labels {
            for object in self.find_by_label(label)? {
                debug!(%label, ?object, "Destroying object");
                self.session
                    .destroy_object(object)
                    .map_err(token_error(TokenFunction::DestroyObject))?;
                destroyed += 1;
            }
        }
        lock(&self.handles).clear();
        Ok(destroyed)
    }

    fn object_exists(&self, label: &str) -> Result<bool, TokenError> {
        Ok(!self.find_by_label(label)?.is_empty())
    }

    #[instrument(skip_all, fields(%label))]
    fn store_certificate(&self, label: &str, pem: &[u8]) -> Result<ObjectHandle, TokenError> {
        let function = TokenFunction::CreateObject;
        let certificate = pem::parse(pem).map_err(|err| {
            warn!(?err, "Certificate is not valid PEM");
            TokenError::new(function, rv::CKR_ARGUMENTS_BAD)
        })?;
        if certificate.tag() != "CERTIFICATE" {
            warn!(tag = certificate.tag(), "PEM block is not a certificate");
            return Err(TokenError::new(function, rv::CKR_ARGUMENTS_BAD));
        }
        let der = certificate.contents();

        // a certificate replaces whatever certificate was stored under its label
        let previous = [
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::Label(label.as_bytes().to_vec()),
        ];
        for object in self
            .session
            .find_objects(&previous)
            .map_err(token_error(TokenFunction::FindObjects))?
        {
            debug!(?object, "Destroying previous certificate");
            self.session
                .destroy_object(object)
                .map_err(token_error(TokenFunction::DestroyObject))?;
        }

        let mut template = vec![
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            Attribute::Token(true),
            Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Value(der.to_vec()),
        ];
        match x509_parser::parse_x509_certificate(der) {
            Ok((_, x509)) => template.push(Attribute::Subject(x509.subject().as_raw().to_vec())),
            Err(err) => warn!(?err, "Could not read certificate subject, storing without it"),
        }

        let object = self
            .session
            .create_object(&template)
            .map_err(token_error(function))?;
        Ok(self.register(object))
    }

    fn close(self: Box<Self>) -> Result<(), TokenError> {
        debug!(token = self.token_info.label(), "Closing session");
        let result = self
            .session
            .logout()
            .map_err(token_error(TokenFunction::CloseSession));
        // the session itself is closed when dropped
        drop(self);
        result
    }
}

fn attribute_type(attribute: AttributeKind) -> AttributeType {
    match attribute {
        AttributeKind::Class => AttributeType::Class,
        AttributeKind::KeyType => AttributeType::KeyType,
        AttributeKind::EcPoint => AttributeType::EcPoint,
    }
}

/// Encodes an attribute as the raw bytes C_GetAttributeValue would return.
fn attribute_value(attribute: Attribute) -> Option<Vec<u8>> {
    match attribute {
        Attribute::Class(class) => Some(encode_ulong(class_code(class)).to_vec()),
        Attribute::KeyType(key_type) => Some(encode_ulong(key_type_code(key_type)).to_vec()),
        Attribute::EcPoint(bytes) => Some(bytes),
        other => {
            warn!(got = ?other, "Got invalid attribute");
            None
        }
    }
}

/// `CK_UNAVAILABLE_INFORMATION`
const UNAVAILABLE_INFORMATION: u64 = u64::MAX;

fn class_code(class: ObjectClass) -> u64 {
    if class == ObjectClass::PRIVATE_KEY {
        CKO_PRIVATE_KEY
    } else if class == ObjectClass::PUBLIC_KEY {
        CKO_PUBLIC_KEY
    } else if class == ObjectClass::CERTIFICATE {
        CKO_CERTIFICATE
    } else {
        UNAVAILABLE_INFORMATION
    }
}

fn key_type_code(key_type: KeyType) -> u64 {
    if key_type == KeyType::EC {
        CKK_EC
    } else {
        UNAVAILABLE_INFORMATION
    }
}

fn token_error(function: TokenFunction) -> impl Fn(Error) -> TokenError {
    move |err| {
        let code = match &err {
            Error::Pkcs11(rv_error, _) => rv_code(rv_error),
            _ => rv::CKR_GENERAL_ERROR,
        };
        debug!(?err, %function, "Token call failed");
        TokenError::new(function, code)
    }
}

fn rv_code(rv_error: &RvError) -> u64 {
    match rv_error {
        RvError::ArgumentsBad => rv::CKR_ARGUMENTS_BAD,
        RvError::AttributeTypeInvalid => rv::CKR_ATTRIBUTE_TYPE_INVALID,
        RvError::BufferTooSmall => rv::CKR_BUFFER_TOO_SMALL,
        RvError::CryptokiNotInitialized => rv::CKR_CRYPTOKI_NOT_INITIALIZED,
        RvError::DeviceError => rv::CKR_DEVICE_ERROR,
        RvError::DeviceRemoved => rv::CKR_DEVICE_REMOVED,
        RvError::FunctionCanceled => rv::CKR_FUNCTION_CANCELED,
        RvError::FunctionFailed => rv::CKR_FUNCTION_FAILED,
        RvError::KeyFunctionNotPermitted => rv::CKR_KEY_FUNCTION_NOT_PERMITTED,
        RvError::KeyHandleInvalid => rv::CKR_KEY_HANDLE_INVALID,
        RvError::MechanismInvalid => rv::CKR_MECHANISM_INVALID,
        RvError::ObjectHandleInvalid => rv::CKR_OBJECT_HANDLE_INVALID,
        RvError::OperationNotInitialized => rv::CKR_OPERATION_NOT_INITIALIZED,
        RvError::PinIncorrect => rv::CKR_PIN_INCORRECT,
        RvError::SessionClosed => rv::CKR_SESSION_CLOSED,
        RvError::SessionHandleInvalid => rv::CKR_SESSION_HANDLE_INVALID,
        RvError::TemplateIncomplete => rv::CKR_TEMPLATE_INCOMPLETE,
        RvError::TokenNotPresent => rv::CKR_TOKEN_NOT_PRESENT,
        RvError::UserNotLoggedIn => rv::CKR_USER_NOT_LOGGED_IN,
        _ => rv::CKR_GENERAL_ERROR,
    }
}

/// Locks the mutex, recovering the value if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(e) => e.into_inner(),
    }
}
