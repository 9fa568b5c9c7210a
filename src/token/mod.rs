//! The boundary between the credential pool and a PKCS#11 token-interface library.
//!
//! The pool only ever needs three things from a token library: open a session from a provider
//! configuration, fetch the private key stored under an alias, and probe whether a previously
//! fetched key can still be used. [TokenLibrary] and [TokenSession] capture exactly that, so that
//! the pool can be driven by a real PKCS#11 module (see the `pkcs11` module, feature `hsm`) or by
//! the in-memory library in [crate::test].

use std::{fmt, sync::Arc};

use secrecy::SecretString;

pub mod cert;
pub mod provider;
pub mod registry;

#[cfg(feature = "hsm")]
pub mod pkcs11;

pub use cert::Certificate;
pub use provider::ProviderConfig;
pub use registry::ProviderRegistry;

/// The name under which an opened session is known, e.g. `MyHsm-0`.
pub type TokenSessionId = String;

//------------ TokenError ----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenError {
    /// The library could not be loaded or a session could not be opened.
    Load(String),

    /// Logging in to the token failed.
    Auth(String),

    /// The token has no private key with the requested alias.
    NotFound(String),

    /// An object in the token is structurally invalid, e.g. a certificate that does not parse.
    Format(String),

    /// Any other failure reported by the token, including failed probes.
    Device(String),

    /// The operation is not supported for this kind of key.
    Unsupported(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenError::Load(e) => write!(f, "Load error: {}", e),
            TokenError::Auth(e) => write!(f, "Login failed: {}", e),
            TokenError::NotFound(alias) => write!(f, "No private key with alias '{}'", alias),
            TokenError::Format(e) => write!(f, "Invalid token object: {}", e),
            TokenError::Device(e) => write!(f, "Token error: {}", e),
            TokenError::Unsupported(e) => write!(f, "Unsupported: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

//------------ KeyAlgorithm --------------------------------------------------

/// The algorithm family of a private key, as far as the pool cares about it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Other(String),
}

impl KeyAlgorithm {
    /// Whether a liveness probe exists for this family. Only families whose signing mechanism
    /// takes no parameters are probed, keys of other families are assumed to be live.
    pub fn is_probeable(&self) -> bool {
        matches!(self, KeyAlgorithm::Rsa | KeyAlgorithm::Ec)
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => write!(f, "RSA"),
            KeyAlgorithm::Ec => write!(f, "EC"),
            KeyAlgorithm::Other(name) => write!(f, "{}", name),
        }
    }
}

//------------ KeyHandle -----------------------------------------------------

/// An opaque reference to a private key inside one session.
///
/// The object number is only meaningful to the session that issued it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyHandle {
    object: u64,
    algorithm: KeyAlgorithm,
}

impl KeyHandle {
    pub fn new(object: u64, algorithm: KeyAlgorithm) -> Self {
        KeyHandle { object, algorithm }
    }

    pub fn object(&self) -> u64 {
        self.object
    }

    pub fn algorithm(&self) -> &KeyAlgorithm {
        &self.algorithm
    }
}

//------------ TokenSession / TokenLibrary -----------------------------------

/// One open session against a token.
pub trait TokenSession: Send + Sync + fmt::Debug {
    /// The provider name of this session.
    fn name(&self) -> &str;

    /// Logs in with the given PIN if needed and returns the private key stored under `alias`.
    fn fetch_key(&self, alias: &str, pin: &SecretString) -> Result<KeyHandle, TokenError>;

    /// Performs a side-effect free operation with the key to find out if it is still usable.
    fn probe_key(&self, key: &KeyHandle) -> Result<(), TokenError>;
}

pub trait TokenLibrary: Send + Sync {
    fn open_session(&self, config: &ProviderConfig) -> Result<Arc<dyn TokenSession>, TokenError>;
}

//------------ KeySource -----------------------------------------------------

/// Custom way of obtaining a private key from a session, used instead of a PIN.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, session: &dyn TokenSession, alias: &str) -> Result<KeyHandle, TokenError>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&dyn TokenSession, &str) -> Result<KeyHandle, TokenError> + Send + Sync,
{
    fn extract(&self, session: &dyn TokenSession, alias: &str) -> Result<KeyHandle, TokenError> {
        (self)(session, alias)
    }
}

/// How a credential unlocks its key in each session.
#[derive(Clone)]
pub enum KeySource {
    Pin(SecretString),
    Extractor(Arc<dyn KeyExtractor>),
}

impl KeySource {
    pub fn pin(pin: &str) -> Self {
        KeySource::Pin(SecretString::new(pin.to_string()))
    }

    pub fn extractor(extractor: impl KeyExtractor + 'static) -> Self {
        KeySource::Extractor(Arc::new(extractor))
    }

    pub fn key_from(&self, session: &dyn TokenSession, alias: &str) -> Result<KeyHandle, TokenError> {
        match self {
            KeySource::Pin(pin) => session.fetch_key(alias, pin),
            KeySource::Extractor(extractor) => extractor.extract(session, alias),
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Pin(_) => write!(f, "Pin(*****)"),
            KeySource::Extractor(_) => write!(f, "Extractor"),
        }
    }
}
