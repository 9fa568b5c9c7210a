//! The _hsmcred_ library crate.
//!
//! Gives applications a credential whose private key lives in a PKCS#11 token. The key may be
//! exposed redundantly by several token sessions, and key handles that silently stop working
//! (device reset, token removal, session timeout) are detected and reloaded on the next use.

pub mod config;
pub mod constants;
pub mod error;
pub mod ext_serde;
pub mod factory;
pub mod pool;
pub mod provisioning;
pub mod test;
pub mod token;

pub use error::Error;
pub use factory::{CredentialFactory, CredentialSpec, TokenProvider};
pub use pool::engine::{LivenessPolicy, Pkcs11Credential};
pub use token::{Certificate, KeyAlgorithm, KeyHandle, KeySource};
