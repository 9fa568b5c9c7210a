use std::{collections::BTreeMap, sync::Arc};

use log::{debug, warn};

use crate::{
    error::Error,
    token::{KeyHandle, KeySource, TokenError, TokenSession, TokenSessionId},
};

//------------ KeyBinding ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindingState {
    Live,

    /// Failed a liveness probe, the binding is waiting to be replaced by a reload.
    Condemned,
}

/// A session together with the handle of the key it exposes for the credential's alias.
#[derive(Clone, Debug)]
pub struct KeyBinding {
    session: Arc<dyn TokenSession>,
    key: KeyHandle,
    state: BindingState,
}

impl KeyBinding {
    pub fn new(session: Arc<dyn TokenSession>, key: KeyHandle) -> Self {
        KeyBinding {
            session,
            key,
            state: BindingState::Live,
        }
    }

    pub fn session(&self) -> &Arc<dyn TokenSession> {
        &self.session
    }

    pub fn key(&self) -> &KeyHandle {
        &self.key
    }

    pub fn is_live(&self) -> bool {
        self.state == BindingState::Live
    }

    pub fn condemn(&mut self) {
        self.state = BindingState::Condemned;
    }
}

pub type Bindings = BTreeMap<TokenSessionId, KeyBinding>;

//------------ load ----------------------------------------------------------

/// Binds `alias` in every session that exposes it.
///
/// Sessions that refuse the login or do not hold the key are skipped. A key or certificate
/// object that is structurally broken fails the whole load, as does ending up with no
/// bindings at all.
pub fn load(sessions: &[Arc<dyn TokenSession>], alias: &str, key_source: &KeySource) -> Result<Bindings, Error> {
    let mut bindings = Bindings::new();

    for session in sessions {
        match key_source.key_from(session.as_ref(), alias) {
            Ok(key) => {
                debug!(
                    "[{}] Found {} key for alias '{}' (object {})",
                    session.name(),
                    key.algorithm(),
                    alias,
                    key.object()
                );
                bindings.insert(session.name().to_string(), KeyBinding::new(session.clone(), key));
            }
            Err(TokenError::Format(msg)) => {
                return Err(Error::CredentialFormat(format!("[{}] {}", session.name(), msg)));
            }
            Err(err) => {
                warn!("[{}] Unable to get key '{}', skipping session: {}", session.name(), alias, err);
            }
        }
    }

    if bindings.is_empty() {
        Err(Error::no_key_for_alias(alias))
    } else {
        Ok(bindings)
    }
}

//------------ Tests ---------------------------------------------------------
