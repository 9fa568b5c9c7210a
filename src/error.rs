//! Defines all hsmcred errors

use std::fmt;

use crate::token::TokenError;

/// Errors surfaced to users of a credential.
///
/// The error of a failed reload is cloned to every caller queued behind that reload, and to
/// every later caller of the exhausted credential.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Malformed or contradictory input. Fatal at construction, never retried.
    Configuration(String),

    /// A single, explicitly requested session failed to open.
    ProviderLoad(String),

    /// A certificate or key artifact is structurally invalid. Never masked by fail-over.
    CredentialFormat(String),

    /// No session yields the requested key. Terminal for the credential that hits it.
    KeyUnavailable(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Configuration(e) => write!(f, "Configuration error: {}", e),
            Error::ProviderLoad(e) => write!(f, "Failed to load PKCS#11 provider: {}", e),
            Error::CredentialFormat(e) => write!(f, "Invalid credential: {}", e),
            Error::KeyUnavailable(e) => write!(f, "Private key unavailable: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn configuration(msg: impl fmt::Display) -> Self {
        Error::Configuration(msg.to_string())
    }

    pub fn no_key_for_alias(alias: &str) -> Self {
        Error::KeyUnavailable(format!(
            "no private key for alias '{}' was available from any session",
            alias
        ))
    }
}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Format(e) => Error::CredentialFormat(e),
            TokenError::Load(e) => Error::ProviderLoad(e),
            other => Error::KeyUnavailable(other.to_string()),
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::CredentialFormat(e.to_string())
    }
}

//------------ Tests ---------------------------------------------------------
