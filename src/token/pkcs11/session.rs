use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use cryptoki::{
    error::{Error as CryptokiError, RvError},
    mechanism::Mechanism,
    object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle},
    session::{Session, UserType},
    types::AuthPin,
};
use log::{trace, warn};
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};

use super::context::Pkcs11Context;
use crate::{
    constants::PROBE_DATA,
    token::{KeyAlgorithm, KeyHandle, TokenError, TokenSession},
};

/// A logged in session with one slot of a PKCS#11 token.
///
/// The underlying session may only be used by one thread at a time, so it is kept behind a
/// mutex. Key handles given out refer to entries in `objects`, which map to the object handles
/// of this session only.
pub struct CryptokiSession {
    name: String,
    context: Arc<Pkcs11Context>,
    slot_id: u64,
    session: Mutex<Session>,
    objects: RwLock<HashMap<u64, ObjectHandle>>,
    next_object: AtomicU64,
}

impl CryptokiSession {
    pub(super) fn new(name: &str, context: Arc<Pkcs11Context>, slot_id: u64, session: Session) -> Self {
        CryptokiSession {
            name: name.to_string(),
            context,
            slot_id,
            session: Mutex::new(session),
            objects: RwLock::new(HashMap::new()),
            next_object: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>, TokenError> {
        self.session
            .lock()
            .map_err(|_| TokenError::Device(format!("[{}] session lock poisoned", self.name)))
    }

    fn login(&self, session: &Session, pin: &SecretString) -> Result<(), TokenError> {
        let pin = AuthPin::new(pin.expose_secret().clone());
        match session.login(UserType::User, Some(&pin)) {
            Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, ..)) => {
                trace!(
                    "[{}] Logged in to PKCS#11 session for library '{}' slot {}",
                    self.name,
                    self.context.lib_file_name(),
                    self.slot_id
                );
                Ok(())
            }
            Err(err) => Err(TokenError::Auth(format!(
                "[{}] Unable to login to PKCS#11 session for library '{}' slot {}: {}",
                self.name,
                self.context.lib_file_name(),
                self.slot_id,
                err
            ))),
        }
    }

    /// Every certificate stored under the alias must parse, a broken one makes the credential
    /// unusable.
    fn check_certificates(&self, session: &Session, alias: &str) -> Result<(), TokenError> {
        let template = [
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::Label(alias.as_bytes().to_vec()),
        ];

        for handle in session.find_objects(&template).map_err(|err| self.device_error(err))? {
            let attributes = session
                .get_attributes(handle, &[AttributeType::Value])
                .map_err(|err| self.device_error(err))?;

            for attribute in attributes {
                if let Attribute::Value(der) = attribute {
                    X509::from_der(&der).map_err(|err| {
                        TokenError::Format(format!(
                            "[{}] Certificate for alias '{}' cannot be parsed: {}",
                            self.name, alias, err
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }

    fn find_private_key(&self, session: &Session, alias: &str) -> Result<(ObjectHandle, KeyAlgorithm), TokenError> {
        let template = [
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Label(alias.as_bytes().to_vec()),
        ];

        let handles = session.find_objects(&template).map_err(|err| self.device_error(err))?;
        let handle = match handles.as_slice() {
            [] => return Err(TokenError::NotFound(alias.to_string())),
            [handle] => *handle,
            [handle, ..] => {
                warn!(
                    "[{}] Found {} private keys with alias '{}', using the first",
                    self.name,
                    handles.len(),
                    alias
                );
                *handle
            }
        };

        let algorithm = session
            .get_attributes(handle, &[AttributeType::KeyType])
            .map_err(|err| self.device_error(err))?
            .into_iter()
            .find_map(|attribute| match attribute {
                Attribute::KeyType(key_type) if key_type == KeyType::RSA => Some(KeyAlgorithm::Rsa),
                Attribute::KeyType(key_type) if key_type == KeyType::EC => Some(KeyAlgorithm::Ec),
                Attribute::KeyType(key_type) => Some(KeyAlgorithm::Other(key_type.to_string())),
                _ => None,
            })
            .unwrap_or_else(|| KeyAlgorithm::Other("unknown".to_string()));

        Ok((handle, algorithm))
    }

    fn device_error(&self, err: CryptokiError) -> TokenError {
        TokenError::Device(format!("[{}] {}", self.name, err))
    }
}

impl TokenSession for CryptokiSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_key(&self, alias: &str, pin: &SecretString) -> Result<KeyHandle, TokenError> {
        let (handle, algorithm) = {
            let session = self.lock()?;
            self.login(&session, pin)?;
            self.check_certificates(&session, alias)?;
            self.find_private_key(&session, alias)?
        };

        let object = self.next_object.fetch_add(1, Ordering::SeqCst);
        self.objects.write().unwrap().insert(object, handle);
        Ok(KeyHandle::new(object, algorithm))
    }

    fn probe_key(&self, key: &KeyHandle) -> Result<(), TokenError> {
        let handle = self
            .objects
            .read()
            .unwrap()
            .get(&key.object())
            .copied()
            .ok_or_else(|| TokenError::NotFound(format!("object {}", key.object())))?;

        let mechanism = match key.algorithm() {
            KeyAlgorithm::Rsa => Mechanism::Sha256RsaPkcs,
            KeyAlgorithm::Ec => Mechanism::Ecdsa,
            KeyAlgorithm::Other(name) => {
                return Err(TokenError::Unsupported(format!("no probe for {} keys", name)));
            }
        };

        self.lock()?
            .sign(&mechanism, handle, PROBE_DATA)
            .map(|_| ())
            .map_err(|err| self.device_error(err))
    }
}

impl fmt::Debug for CryptokiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptokiSession")
            .field("name", &self.name)
            .field("library", &self.context.lib_file_name())
            .field("slot_id", &self.slot_id)
            .finish()
    }
}
