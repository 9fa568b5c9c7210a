use std::{
    fmt,
    sync::{Arc, Mutex},
};

use log::{debug, error, info, warn};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    error::Error,
    pool::keys::{self, Bindings},
    token::{Certificate, KeyHandle, KeySource, TokenError, TokenSession, TokenSessionId},
};

//------------ LivenessPolicy ------------------------------------------------

/// Whether a key handle is checked before it is handed out.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LivenessPolicy {
    /// Sign throw-away data with the key first, reload all sessions if that fails.
    #[default]
    Probe,

    /// Hand out the key without checking it.
    Trust,
}

//------------ SessionSelector -----------------------------------------------

/// Picks which of the live sessions serves the next request.
pub trait SessionSelector: Send {
    /// Returns an index into `sessions`, which is never empty.
    fn select(&mut self, sessions: &[&str]) -> usize;
}

/// Spreads requests uniformly at random over the sessions.
pub struct RandomSelector {
    rng: StdRng,
}

impl RandomSelector {
    pub fn new() -> Self {
        RandomSelector {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        RandomSelector {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSelector for RandomSelector {
    fn select(&mut self, sessions: &[&str]) -> usize {
        if sessions.len() <= 1 {
            0
        } else {
            self.rng.random_range(0..sessions.len())
        }
    }
}

//------------ SessionSource -------------------------------------------------

/// Where a credential gets its sessions from, initially and when it has to reload.
pub trait SessionSource: Send + Sync {
    /// The sessions that are currently open.
    fn sessions(&self) -> Vec<Arc<dyn TokenSession>>;

    /// Discards the current sessions and opens them again from scratch.
    fn reopen(&self) -> Result<Vec<Arc<dyn TokenSession>>, Error>;
}

//------------ Pkcs11Credential ----------------------------------------------

struct Loader {
    source: Arc<dyn SessionSource>,
    key_source: KeySource,
}

struct CredentialState {
    bindings: Bindings,
    last_selected: Option<TokenSessionId>,
    exhausted: Option<Error>,
    reloads: u64,
    selector: Box<dyn SessionSelector>,
}

/// A certificate plus a private key that may be served by any of several token sessions.
///
/// Every call to [Pkcs11Credential::resolve_key] picks one of the sessions that hold the key
/// and, depending on the [LivenessPolicy], checks that the key still works there. When it does
/// not, all sessions are re-opened and the key is looked up again before a second, final
/// attempt. A single lock guards the bindings, so concurrent callers never see a half replaced
/// set and queue behind a reload in progress rather than starting their own.
///
/// If a reload fails the credential is exhausted: the error is kept and returned to every later
/// caller, no further reloads are attempted.
pub struct Pkcs11Credential {
    certificate: Option<Certificate>,
    alias: String,
    liveness: LivenessPolicy,
    loader: Option<Loader>,
    state: Mutex<CredentialState>,
}

impl Pkcs11Credential {
    /// Binds `alias` in the sessions currently offered by `source`.
    pub fn build(
        source: Arc<dyn SessionSource>,
        certificate: Certificate,
        alias: &str,
        key_source: KeySource,
        liveness: LivenessPolicy,
    ) -> Result<Self, Error> {
        let bindings = keys::load(&source.sessions(), alias, &key_source)?;
        info!(
            "[{}] Credential available from {} session(s): {}",
            alias,
            bindings.len(),
            bindings.keys().cloned().collect::<Vec<_>>().join(", ")
        );

        Ok(Pkcs11Credential {
            certificate: Some(certificate),
            alias: alias.to_string(),
            liveness,
            loader: Some(Loader { source, key_source }),
            state: Mutex::new(CredentialState::new(bindings)),
        })
    }

    /// A credential without any token behind it. Never yields a key.
    pub fn absent(certificate: Option<Certificate>, alias: &str) -> Self {
        Pkcs11Credential {
            certificate,
            alias: alias.to_string(),
            liveness: LivenessPolicy::Trust,
            loader: None,
            state: Mutex::new(CredentialState::new(Bindings::new())),
        }
    }

    pub fn with_selector(mut self, selector: impl SessionSelector + 'static) -> Self {
        if let Ok(state) = self.state.get_mut() {
            state.selector = Box::new(selector);
        }
        self
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn liveness(&self) -> LivenessPolicy {
        self.liveness
    }

    /// Returns a usable handle for the private key.
    pub fn resolve_key(&self) -> Result<KeyHandle, Error> {
        let loader = match &self.loader {
            Some(loader) => loader,
            None => return Err(Error::no_key_for_alias(&self.alias)),
        };

        let mut state = self.lock()?;

        if let Some(err) = &state.exhausted {
            return Err(err.clone());
        }

        match self.select_key(&mut state) {
            Ok(key) => return Ok(key),
            Err(err) => warn!("[{}] Key not usable, reloading all sessions: {}", self.alias, err),
        }

        self.reload(&mut state, loader)?;

        self.select_key(&mut state).map_err(|err| {
            Error::KeyUnavailable(format!(
                "key for alias '{}' still not usable after reload: {}",
                self.alias, err
            ))
        })
    }

    /// The session that served the most recent successful [Pkcs11Credential::resolve_key].
    pub fn current_session(&self) -> Option<TokenSessionId> {
        self.lock().ok().and_then(|state| state.last_selected.clone())
    }

    /// The sessions currently bound to the key.
    pub fn sessions(&self) -> Vec<TokenSessionId> {
        self.lock()
            .map(|state| state.bindings.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reload_count(&self) -> u64 {
        self.lock().map(|state| state.reloads).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CredentialState>, Error> {
        self.state.lock().map_err(|_| {
            Error::KeyUnavailable(format!(
                "credential for alias '{}' is unusable after a panic during key resolution",
                self.alias
            ))
        })
    }

    fn select_key(&self, state: &mut CredentialState) -> Result<KeyHandle, TokenError> {
        let live: Vec<&str> = state
            .bindings
            .iter()
            .filter(|(_, binding)| binding.is_live())
            .map(|(id, _)| id.as_str())
            .collect();

        if live.is_empty() {
            return Err(TokenError::NotFound(self.alias.clone()));
        }

        let index = state.selector.select(&live).min(live.len() - 1);
        let id = live[index].to_string();

        let binding = match state.bindings.get_mut(&id) {
            Some(binding) => binding,
            None => return Err(TokenError::NotFound(self.alias.clone())),
        };

        let res = match self.liveness {
            LivenessPolicy::Probe if binding.key().algorithm().is_probeable() => {
                binding.session().probe_key(binding.key())
            }
            LivenessPolicy::Probe => {
                debug!(
                    "[{}] No liveness probe for {} keys, assuming the key in '{}' is live",
                    self.alias,
                    binding.key().algorithm(),
                    id
                );
                Ok(())
            }
            LivenessPolicy::Trust => Ok(()),
        };

        match res {
            Ok(()) => {
                let key = binding.key().clone();
                debug!("[{}] Using key from session '{}'", self.alias, id);
                state.last_selected = Some(id);
                Ok(key)
            }
            Err(err) => {
                binding.condemn();
                Err(TokenError::Device(format!("probe in session '{}' failed: {}", id, err)))
            }
        }
    }

    fn reload(&self, state: &mut CredentialState, loader: &Loader) -> Result<(), Error> {
        state.reloads += 1;
        info!("[{}] Reloading sessions (reload #{})", self.alias, state.reloads);

        let res = loader
            .source
            .reopen()
            .and_then(|sessions| keys::load(&sessions, &self.alias, &loader.key_source));

        match res {
            Ok(bindings) => {
                info!("[{}] Reload found the key in {} session(s)", self.alias, bindings.len());
                state.bindings = bindings;
                Ok(())
            }
            Err(err) => {
                error!("[{}] Reload failed, credential is no longer usable: {}", self.alias, err);
                state.bindings.clear();
                state.last_selected = None;
                state.exhausted = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl CredentialState {
    fn new(bindings: Bindings) -> Self {
        CredentialState {
            bindings,
            last_selected: None,
            exhausted: None,
            reloads: 0,
            selector: Box::new(RandomSelector::new()),
        }
    }
}

impl fmt::Debug for Pkcs11Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Credential")
            .field("alias", &self.alias)
            .field("certificate", &self.certificate)
            .field("liveness", &self.liveness)
            .field("sessions", &self.sessions())
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------
