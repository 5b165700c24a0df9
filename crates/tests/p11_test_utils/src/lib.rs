//! An in-memory PKCS #11 token.
//!
//! [`MockToken`] keeps its objects in memory and signs with software P-256 keys, so the whole
//! provisioning flow can run without a PKCS #11 module. Failures, handles, signatures and
//! attribute values can be scripted through the builder methods.

use p11_token::rv;
use p11_token::AttributeKind;
use p11_token::KeyPairHandles;
use p11_token::KeyPairTemplate;
use p11_token::ObjectHandle;
use p11_token::SignMechanism;
use p11_token::Token;
use p11_token::TokenError;
use p11_token::TokenFunction;
use p11_token::TokenSession;
use p11_token::CKK_EC;
use p11_token::CKO_CERTIFICATE;
use p11_token::CKO_PRIVATE_KEY;
use p11_token::CKO_PUBLIC_KEY;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::Signature;
use p256::ecdsa::SigningKey;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

/// The private scalar of every keypair generated by the mock.
pub const GENERATED_KEY_SCALAR: [u8; 32] = [
    0xc9, 0xaf, 0xa9, 0xd8, 0x45, 0xba, 0x75, 0x16, 0x6b, 0x5c, 0x21, 0x57, 0x67, 0xb1, 0xd6,
    0x93, 0x4e, 0x50, 0xc3, 0xdb, 0x36, 0xe8, 0x9b, 0x12, 0x7b, 0x8a, 0x62, 0x2b, 0x12, 0x0f,
    0x67, 0x21,
];

/// An object stored on the mock token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockObject {
    pub label: String,
    pub class: u64,
    pub id: Vec<u8>,
    /// Private scalar for private keys, DER for certificates, empty otherwise.
    pub value: Vec<u8>,
    /// SEC1 uncompressed point for public keys.
    pub point: Option<Vec<u8>>,
}

/// Calls made on the token, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub open_session: usize,
    pub close: usize,
    pub generate_random: usize,
    pub generate_keypair: usize,
    pub import_keypair: usize,
    pub sign_init: usize,
    pub sign: usize,
    pub destroy_all: usize,
    pub store_certificate: usize,
    /// The data passed to every `sign` call.
    pub sign_inputs: Vec<Vec<u8>>,
    /// Sizes of the random buffers requested.
    pub random_lengths: Vec<usize>,
}

#[derive(Debug, Default)]
struct Behaviour {
    keypair_handles: Option<KeyPairHandles>,
    raw_signature: Option<Vec<u8>>,
    private_key_class: Option<u64>,
    public_key_class: Option<u64>,
    key_type: Option<u64>,
    ec_point: Option<Vec<u8>>,
    fail_open: Option<u64>,
    fail_random: Option<u64>,
    fail_keygen: Option<u64>,
    fail_attribute: Option<(AttributeKind, u64)>,
    fail_sign: Option<u64>,
    fail_destroy: Option<u64>,
    fail_store: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<u64, MockObject>,
    next_handle: u64,
    calls: MockCalls,
    random_counter: u8,
}

/// An in-memory token. Objects survive sessions, so a token can be provisioned more than once.
#[derive(Debug, Default)]
pub struct MockToken {
    behaviour: Behaviour,
    state: Mutex<State>,
}

impl MockToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generated keypairs get these handles instead of sequential ones.
    pub fn with_keypair_handles(mut self, private_key: u64, public_key: u64) -> Self {
        self.behaviour.keypair_handles = Some(KeyPairHandles {
            private_key: ObjectHandle(private_key),
            public_key: ObjectHandle(public_key),
        });
        self
    }

    /// Every `sign` call returns these raw bytes instead of a real signature.
    pub fn with_raw_signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.behaviour.raw_signature = Some(signature.into());
        self
    }

    /// `CKA_CLASS` of private keys reads back as `class`.
    pub fn with_private_key_class(mut self, class: u64) -> Self {
        self.behaviour.private_key_class = Some(class);
        self
    }

    /// `CKA_CLASS` of public keys reads back as `class`.
    pub fn with_public_key_class(mut self, class: u64) -> Self {
        self.behaviour.public_key_class = Some(class);
        self
    }

    /// `CKA_KEY_TYPE` of all keys reads back as `key_type`.
    pub fn with_key_type(mut self, key_type: u64) -> Self {
        self.behaviour.key_type = Some(key_type);
        self
    }

    /// `CKA_EC_POINT` of public keys reads back as these bytes.
    pub fn with_ec_point(mut self, ec_point: impl Into<Vec<u8>>) -> Self {
        self.behaviour.ec_point = Some(ec_point.into());
        self
    }

    pub fn failing_open(mut self, code: u64) -> Self {
        self.behaviour.fail_open = Some(code);
        self
    }

    pub fn failing_random(mut self, code: u64) -> Self {
        self.behaviour.fail_random = Some(code);
        self
    }

    pub fn failing_keygen(mut self, code: u64) -> Self {
        self.behaviour.fail_keygen = Some(code);
        self
    }

    pub fn failing_attribute(mut self, attribute: AttributeKind, code: u64) -> Self {
        self.behaviour.fail_attribute = Some((attribute, code));
        self
    }

    /// Every `sign` call fails, starting with the first.
    pub fn failing_sign(mut self, code: u64) -> Self {
        self.behaviour.fail_sign = Some(code);
        self
    }

    pub fn failing_destroy(mut self, code: u64) -> Self {
        self.behaviour.fail_destroy = Some(code);
        self
    }

    /// Storing a certificate under `label` fails.
    pub fn failing_store(mut self, label: &str, code: u64) -> Self {
        self.behaviour.fail_store.insert(label.to_string(), code);
        self
    }

    /// Adds an object to the token, as if left there by a previous run.
    pub fn with_object(self, label: &str, class: u64) -> Self {
        self.state().insert(MockObject {
            label: label.to_string(),
            class,
            id: Vec::new(),
            value: Vec::new(),
            point: None,
        });
        self
    }

    pub fn calls(&self) -> MockCalls {
        self.state().calls.clone()
    }

    /// All objects on the token, in creation order.
    pub fn objects(&self) -> Vec<MockObject> {
        self.state().objects.values().cloned().collect()
    }

    pub fn objects_labelled(&self, label: &str) -> Vec<MockObject> {
        self.objects()
            .into_iter()
            .filter(|o| o.label == label)
            .collect()
    }

    /// The SEC1 uncompressed point of generated keypairs.
    pub fn generated_public_point() -> Vec<u8> {
        public_point(&GENERATED_KEY_SCALAR)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

impl State {
    fn insert(&mut self, object: MockObject) -> u64 {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.objects.insert(handle, object);
        handle
    }

    fn next_random_byte(&mut self) -> u8 {
        self.random_counter = self.random_counter.wrapping_add(1);
        self.random_counter
    }
}

impl Token for MockToken {
    fn open_session(&self) -> Result<Box<dyn TokenSession + '_>, TokenError> {
        self.state().calls.open_session += 1;
        if let Some(code) = self.behaviour.fail_open {
            return Err(TokenError::new(TokenFunction::OpenSession, code));
        }
        Ok(Box::new(MockSession {
            token: self,
            aliases: Mutex::new(HashMap::new()),
            pending_sign: Mutex::new(None),
        }))
    }
}

struct MockSession<'a> {
    token: &'a MockToken,
    /// Scripted handles mapped to the stored objects.
    aliases: Mutex<HashMap<u64, u64>>,
    pending_sign: Mutex<Option<u64>>,
}

impl MockSession<'_> {
    fn behaviour(&self) -> &Behaviour {
        &self.token.behaviour
    }

    fn resolve(&self, handle: ObjectHandle) -> u64 {
        let aliases = self.aliases.lock().unwrap();
        aliases.get(&handle.0).copied().unwrap_or(handle.0)
    }

    fn add_keypair(
        &self,
        template: &KeyPairTemplate<'_>,
        scalar: &[u8],
        point: Vec<u8>,
    ) -> KeyPairHandles {
        let mut state = self.token.state();
        let public_key = state.insert(MockObject {
            label: template.public_label.to_string(),
            class: CKO_PUBLIC_KEY,
            id: template.id.to_vec(),
            value: Vec::new(),
            point: Some(point),
        });
        let private_key = state.insert(MockObject {
            label: template.private_label.to_string(),
            class: CKO_PRIVATE_KEY,
            id: template.id.to_vec(),
            value: scalar.to_vec(),
            point: None,
        });

        match self.behaviour().keypair_handles {
            Some(handles) => {
                let mut aliases = self.aliases.lock().unwrap();
                aliases.insert(handles.private_key.0, private_key);
                aliases.insert(handles.public_key.0, public_key);
                handles
            }
            None => KeyPairHandles {
                private_key: ObjectHandle(private_key),
                public_key: ObjectHandle(public_key),
            },
        }
    }

    fn attribute_value(&self, object: &MockObject, attribute: AttributeKind) -> Option<Vec<u8>> {
        let behaviour = self.behaviour();
        let is_key = object.class == CKO_PRIVATE_KEY || object.class == CKO_PUBLIC_KEY;
        match attribute {
            AttributeKind::Class => {
                let class = match object.class {
                    CKO_PRIVATE_KEY => behaviour.private_key_class.unwrap_or(CKO_PRIVATE_KEY),
                    CKO_PUBLIC_KEY => behaviour.public_key_class.unwrap_or(CKO_PUBLIC_KEY),
                    class => class,
                };
                Some(p11_token::encode_ulong(class).to_vec())
            }
            AttributeKind::KeyType if is_key => {
                let key_type = behaviour.key_type.unwrap_or(CKK_EC);
                Some(p11_token::encode_ulong(key_type).to_vec())
            }
            AttributeKind::EcPoint => {
                let point = object.point.as_ref()?;
                match &behaviour.ec_point {
                    Some(ec_point) => Some(ec_point.clone()),
                    None => Some(wrap_octet_string(point)),
                }
            }
            _ => None,
        }
    }
}

impl TokenSession for MockSession<'_> {
    fn generate_random(&self, buf: &mut [u8]) -> Result<(), TokenError> {
        let mut state = self.token.state();
        state.calls.generate_random += 1;
        state.calls.random_lengths.push(buf.len());
        if let Some(code) = self.behaviour().fail_random {
            return Err(TokenError::new(TokenFunction::GenerateRandom, code));
        }
        for byte in buf.iter_mut() {
            *byte = state.next_random_byte();
        }
        Ok(())
    }

    fn generate_ec_keypair(
        &self,
        template: &KeyPairTemplate<'_>,
    ) -> Result<KeyPairHandles, TokenError> {
        self.token.state().calls.generate_keypair += 1;
        if let Some(code) = self.behaviour().fail_keygen {
            return Err(TokenError::new(TokenFunction::GenerateKeyPair, code));
        }
        let point = public_point(&GENERATED_KEY_SCALAR);
        Ok(self.add_keypair(template, &GENERATED_KEY_SCALAR, point))
    }

    fn import_ec_keypair(
        &self,
        template: &KeyPairTemplate<'_>,
        private_scalar: &[u8],
        ec_point: &[u8],
    ) -> Result<KeyPairHandles, TokenError> {
        self.token.state().calls.import_keypair += 1;
        if SigningKey::from_slice(private_scalar).is_err() || ec_point.first() != Some(&0x04) {
            return Err(TokenError::new(
                TokenFunction::CreateObject,
                rv::CKR_ARGUMENTS_BAD,
            ));
        }
        Ok(self.add_keypair(template, private_scalar, ec_point.to_vec()))
    }

    fn get_attribute(
        &self,
        object: ObjectHandle,
        attribute: AttributeKind,
        receiver: Option<&mut [u8]>,
    ) -> Result<usize, TokenError> {
        let function = TokenFunction::GetAttributeValue;
        if let Some((failing, code)) = self.behaviour().fail_attribute {
            if failing == attribute {
                return Err(TokenError::new(function, code));
            }
        }

        let handle = self.resolve(object);
        let stored = self.token.state().objects.get(&handle).cloned();
        let Some(stored) = stored else {
            return Err(TokenError::new(function, rv::CKR_OBJECT_HANDLE_INVALID));
        };
        let Some(value) = self.attribute_value(&stored, attribute) else {
            return Err(TokenError::new(function, rv::CKR_ATTRIBUTE_TYPE_INVALID));
        };

        match receiver {
            None => Ok(value.len()),
            Some(buf) if buf.len() < value.len() => {
                Err(TokenError::new(function, rv::CKR_BUFFER_TOO_SMALL))
            }
            Some(buf) => {
                buf[..value.len()].copy_from_slice(&value);
                Ok(value.len())
            }
        }
    }

    fn sign_init(&self, mechanism: SignMechanism, key: ObjectHandle) -> Result<(), TokenError> {
        self.token.state().calls.sign_init += 1;
        assert_eq!(mechanism, SignMechanism::Ecdsa);
        let handle = self.resolve(key);
        match self.token.state().objects.get(&handle) {
            Some(object) if object.class == CKO_PRIVATE_KEY => {
                *self.pending_sign.lock().unwrap() = Some(handle);
                Ok(())
            }
            _ => Err(TokenError::new(
                TokenFunction::SignInit,
                rv::CKR_KEY_HANDLE_INVALID,
            )),
        }
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        {
            let mut state = self.token.state();
            state.calls.sign += 1;
            state.calls.sign_inputs.push(data.to_vec());
        }
        let pending = self.pending_sign.lock().unwrap().take();
        if let Some(code) = self.behaviour().fail_sign {
            return Err(TokenError::new(TokenFunction::Sign, code));
        }
        let Some(handle) = pending else {
            return Err(TokenError::new(
                TokenFunction::Sign,
                rv::CKR_OPERATION_NOT_INITIALIZED,
            ));
        };
        if let Some(signature) = &self.behaviour().raw_signature {
            return Ok(signature.clone());
        }

        let scalar = self.token.state().objects[&handle].value.clone();
        let key = SigningKey::from_slice(&scalar).unwrap();
        let signature: Signature = key.sign_prehash(data).unwrap();
        Ok(signature.to_bytes().to_vec())
    }

    fn destroy_all_credentials(&self, labels: &[&str]) -> Result<usize, TokenError> {
        let mut state = self.token.state();
        state.calls.destroy_all += 1;
        if let Some(code) = self.behaviour().fail_destroy {
            return Err(TokenError::new(TokenFunction::DestroyObject, code));
        }
        let before = state.objects.len();
        state
            .objects
            .retain(|_, object| !labels.contains(&object.label.as_str()));
        Ok(before - state.objects.len())
    }

    fn object_exists(&self, label: &str) -> Result<bool, TokenError> {
        let state = self.token.state();
        Ok(state.objects.values().any(|o| o.label == label))
    }

    fn store_certificate(&self, label: &str, pem: &[u8]) -> Result<ObjectHandle, TokenError> {
        let mut state = self.token.state();
        state.calls.store_certificate += 1;
        if let Some(code) = self.behaviour().fail_store.get(label) {
            return Err(TokenError::new(TokenFunction::CreateObject, *code));
        }
        if pem.is_empty() {
            return Err(TokenError::new(
                TokenFunction::CreateObject,
                rv::CKR_ARGUMENTS_BAD,
            ));
        }
        // a certificate replaces whatever certificate was stored under its label
        state
            .objects
            .retain(|_, object| object.class != CKO_CERTIFICATE || object.label != label);
        let handle = state.insert(MockObject {
            label: label.to_string(),
            class: CKO_CERTIFICATE,
            id: Vec::new(),
            value: pem.to_vec(),
            point: None,
        });
        Ok(ObjectHandle(handle))
    }

    fn close(self: Box<Self>) -> Result<(), TokenError> {
        self.token.state().calls.close += 1;
        Ok(())
    }
}

/// Returns the SEC1 uncompressed point of a P-256 private scalar.
pub fn public_point(scalar: &[u8]) -> Vec<u8> {
    let key = SigningKey::from_slice(scalar).unwrap();
    key.verifying_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec()
}

/// Wraps a point the way `CKA_EC_POINT` holds it: a DER OCTET STRING.
pub fn wrap_octet_string(point: &[u8]) -> Vec<u8> {
    let mut der = vec![0x04, point.len() as u8];
    der.extend_from_slice(point);
    der
}
