use std::{fmt, fs, path::Path, sync::Arc};

use openssl::x509::X509;

use crate::error::Error;

/// The X.509 certificate of a credential, kept as immutable DER bytes.
///
/// The bytes are checked to be a structurally valid certificate when the value is created, they
/// are not interpreted any further.
#[derive(Clone, Eq, PartialEq)]
pub struct Certificate {
    der: Arc<[u8]>,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        X509::from_der(der).map_err(|e| Error::CredentialFormat(format!("Invalid DER certificate: {}", e)))?;
        Ok(Certificate { der: Arc::from(der) })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
        let cert = X509::from_pem(pem).map_err(|e| Error::CredentialFormat(format!("Invalid PEM certificate: {}", e)))?;
        let der = cert.to_der()?;
        Ok(Certificate { der: Arc::from(der) })
    }

    /// Loads a PEM or DER encoded certificate file.
    pub fn read(path: &Path) -> Result<Self, Error> {
        let bytes = fs::read(path)
            .map_err(|e| Error::Configuration(format!("Cannot read certificate '{}': {}", path.display(), e)))?;

        let res = if bytes.starts_with(b"-----BEGIN") {
            Self::from_pem(&bytes)
        } else {
            Self::from_der(&bytes)
        };

        res.map_err(|e| match e {
            Error::CredentialFormat(msg) => Error::CredentialFormat(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({} bytes)", self.der.len())
    }
}

//------------ Tests ---------------------------------------------------------
