use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, RwLock},
};

use log::{debug, info};

use crate::token::{ProviderConfig, TokenError, TokenLibrary, TokenSession};

/// The sessions opened by an application, by provider name.
///
/// Owned by the application and handed to whatever needs to open sessions, rather than being
/// process wide state. Opening a session under a name that is already registered replaces the
/// earlier session, which is what happens when a credential reloads after a token reset.
pub struct ProviderRegistry {
    library: Arc<dyn TokenLibrary>,
    sessions: RwLock<BTreeMap<String, Arc<dyn TokenSession>>>,
}

impl ProviderRegistry {
    pub fn new(library: Arc<dyn TokenLibrary>) -> Self {
        ProviderRegistry {
            library,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Opens a session through the token library and registers it under its name.
    pub fn open(&self, config: &ProviderConfig) -> Result<Arc<dyn TokenSession>, TokenError> {
        debug!("Generated PKCS#11 configuration:\n{}", config.to_config_text());
        let session = self.library.open_session(config)?;
        self.add(session.clone());
        info!("Added provider {}", session.name());
        Ok(session)
    }

    pub fn add(&self, session: Arc<dyn TokenSession>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.name().to_string(), session);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TokenSession>> {
        self.sessions.read().unwrap().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn TokenSession>> {
        self.sessions.write().unwrap().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.sessions.read().unwrap().keys().cloned().collect()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry").field("sessions", &self.names()).finish()
    }
}

//------------ Tests ---------------------------------------------------------
