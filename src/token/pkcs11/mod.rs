//! Sessions with real PKCS#11 modules, through the `cryptoki` crate.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
};

use log::info;

use crate::token::{ProviderConfig, TokenError, TokenLibrary, TokenSession};

mod context;
mod session;

use context::Pkcs11Context;
pub use session::CryptokiSession;

/// Opens sessions with PKCS#11 modules loaded from the library path in a provider config.
///
/// Modules are loaded and initialized on first use and then kept for the lifetime of this
/// value, keyed by library file name.
#[derive(Debug, Default)]
pub struct Pkcs11Library {
    contexts: RwLock<HashMap<String, Arc<Pkcs11Context>>>,
}

impl Pkcs11Library {
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&self, lib_path: &Path) -> Result<Arc<Pkcs11Context>, TokenError> {
        let lib_file_name = context::lib_file_name(lib_path)?;

        if let Some(context) = self.contexts.read().unwrap().get(&lib_file_name) {
            return Ok(context.clone());
        }

        let mut contexts = self.contexts.write().unwrap();
        if let Some(context) = contexts.get(&lib_file_name) {
            return Ok(context.clone());
        }

        let context = Arc::new(Pkcs11Context::load(lib_path)?);
        contexts.insert(lib_file_name, context.clone());
        Ok(context)
    }
}

impl TokenLibrary for Pkcs11Library {
    fn open_session(&self, config: &ProviderConfig) -> Result<Arc<dyn TokenSession>, TokenError> {
        let context = self.context(Path::new(config.library()))?;
        let slot = context.select_slot(config)?;
        let session = context.open_session(slot)?;

        info!(
            "[{}] Opened PKCS#11 session with library '{}' slot {}",
            config.name(),
            context.lib_file_name(),
            slot.id()
        );
        Ok(Arc::new(CryptokiSession::new(config.name(), context, slot.id(), session)))
    }
}

//------------ Tests ---------------------------------------------------------
