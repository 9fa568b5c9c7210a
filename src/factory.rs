//! Turns a [TokenConfig] into a [TokenProvider], and credentials from that.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use log::info;
use secrecy::SecretString;

use crate::{
    config::TokenConfig,
    error::Error,
    pool::{LivenessPolicy, Pkcs11Credential, SessionSource, SlotDiscoverer, SlotRangeSpec},
    provisioning::{CommandRunner, ProcessRunner, ProvisioningBootstrap, SoftTokenProvider},
    token::{Certificate, KeySource, ProviderConfig, ProviderRegistry, TokenSession},
};

//------------ CredentialSpec ------------------------------------------------

/// What a credential is built from, besides the provider.
#[derive(Clone, Debug)]
pub struct CredentialSpec {
    alias: String,
    certificate: Option<Certificate>,
    key_source: Option<KeySource>,
    liveness: LivenessPolicy,
}

impl CredentialSpec {
    pub fn new(alias: &str) -> Self {
        CredentialSpec {
            alias: alias.to_string(),
            certificate: None,
            key_source: None,
            liveness: LivenessPolicy::default(),
        }
    }

    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    /// Overrides the PIN from the token configuration.
    pub fn with_key_source(mut self, key_source: KeySource) -> Self {
        self.key_source = Some(key_source);
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessPolicy) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

//------------ CredentialFactory ---------------------------------------------

pub struct CredentialFactory {
    config: TokenConfig,
    registry: Arc<ProviderRegistry>,
    runner: Arc<dyn CommandRunner>,
}

impl CredentialFactory {
    pub fn new(config: TokenConfig, registry: Arc<ProviderRegistry>) -> Self {
        CredentialFactory {
            config,
            registry,
            runner: Arc::new(ProcessRunner),
        }
    }

    /// Replaces the runner used to call `pkcs11-tool` when provisioning a SoftHSM token.
    pub fn with_command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Creates the provider matching the configuration and opens its sessions.
    ///
    /// External configuration files win over everything else. Without them, a missing library
    /// or name gives a provider without any token. Credentials to provision together with a PIN
    /// give a SoftHSM provider, anything else opens the configured slot or slot range.
    pub fn create_provider(&self) -> Result<Arc<TokenProvider>, Error> {
        let config = &self.config;

        let kind = if let Some(files) = config.external_configs() {
            let configs = files
                .iter()
                .map(|file| ProviderConfig::read(file))
                .collect::<Result<Vec<_>, _>>()?;
            ProviderKind::External(ExternalProvider {
                configs,
                registry: self.registry.clone(),
            })
        } else if let (Some(library), Some(name)) = (&config.library, &config.name) {
            let provisioning = config
                .pin
                .as_ref()
                .and_then(|pin| config.credential_descriptors().map(|descriptors| (descriptors, pin)));
            match provisioning {
                Some((descriptors, pin)) => {
                    let label: String = name.chars().filter(|c| !c.is_whitespace()).collect();
                    if label.is_empty() {
                        return Err(Error::configuration("'name' must not be empty"));
                    }
                    let bootstrap =
                        ProvisioningBootstrap::new(library, &label, pin.clone(), &descriptors, self.runner.clone());
                    ProviderKind::SoftToken(SoftTokenProvider::new(bootstrap, self.registry.clone()))
                }
                _ => {
                    let spec = SlotRangeSpec::new(library, name)
                        .with_slot(config.slot.as_deref())
                        .with_start_index(config.slot_list_index)
                        .with_max_range(config.slot_list_index_max_range);
                    ProviderKind::Generic(SlotDiscoverer::new(spec, self.registry.clone())?)
                }
            }
        } else {
            info!("No PKCS#11 library and name configured, credentials will not be backed by a token");
            ProviderKind::Absent
        };

        TokenProvider::open(kind, config.pin.clone()).map(Arc::new)
    }

    /// Creates a provider and builds a single credential from it.
    pub fn create_credential(&self, spec: CredentialSpec) -> Result<Pkcs11Credential, Error> {
        self.create_provider()?.credential(spec)
    }
}

//------------ TokenProvider -------------------------------------------------

/// Opens sessions from a set of provider configuration files.
pub struct ExternalProvider {
    configs: Vec<ProviderConfig>,
    registry: Arc<ProviderRegistry>,
}

impl ExternalProvider {
    fn open(&self) -> Result<Vec<Arc<dyn TokenSession>>, Error> {
        self.configs
            .iter()
            .map(|config| {
                self.registry.open(config).map_err(|e| {
                    Error::ProviderLoad(format!("Failed to load provider configuration '{}': {}", config, e))
                })
            })
            .collect()
    }
}

pub enum ProviderKind {
    Absent,
    External(ExternalProvider),
    SoftToken(SoftTokenProvider),
    Generic(SlotDiscoverer),
}

impl ProviderKind {
    fn open(&self) -> Result<Vec<Arc<dyn TokenSession>>, Error> {
        match self {
            ProviderKind::Absent => Ok(Vec::new()),
            ProviderKind::External(provider) => provider.open(),
            ProviderKind::SoftToken(provider) => provider.open(),
            ProviderKind::Generic(discoverer) => discoverer.discover(),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProviderKind::Absent => write!(f, "none"),
            ProviderKind::External(_) => write!(f, "external configuration"),
            ProviderKind::SoftToken(_) => write!(f, "SoftHSM"),
            ProviderKind::Generic(_) => write!(f, "PKCS#11"),
        }
    }
}

/// The sessions opened for a token configuration, and the means to open them again.
///
/// Credentials built from a provider share it, a reload by any of them re-opens the sessions
/// for all.
pub struct TokenProvider {
    kind: ProviderKind,
    pin: Option<SecretString>,
    sessions: RwLock<Vec<Arc<dyn TokenSession>>>,
}

impl TokenProvider {
    fn open(kind: ProviderKind, pin: Option<SecretString>) -> Result<Self, Error> {
        let sessions = kind.open()?;
        info!("Opened {} session(s) using {} provider", sessions.len(), kind);
        Ok(TokenProvider {
            kind,
            pin,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn kind(&self) -> &ProviderKind {
        &self.kind
    }

    pub fn is_absent(&self) -> bool {
        matches!(self.kind, ProviderKind::Absent)
    }

    /// The names of the currently open sessions.
    pub fn provider_names(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .map(|session| session.name().to_string())
            .collect()
    }

    /// Builds a credential for the alias in `spec`.
    ///
    /// The key source defaults to the configured PIN and, for a SoftHSM token, the certificate
    /// defaults to the one provisioned under the alias. A provider without a token builds a
    /// credential that never yields a key.
    pub fn credential(self: &Arc<Self>, spec: CredentialSpec) -> Result<Pkcs11Credential, Error> {
        if self.is_absent() {
            return Ok(Pkcs11Credential::absent(spec.certificate, &spec.alias));
        }

        let key_source = match (spec.key_source, &self.pin) {
            (Some(key_source), _) => key_source,
            (None, Some(pin)) => KeySource::Pin(pin.clone()),
            (None, None) => {
                return Err(Error::Configuration(format!(
                    "Credential '{}' needs a PIN or a key extractor",
                    spec.alias
                )));
            }
        };

        let certificate = match (spec.certificate, &self.kind) {
            (Some(certificate), _) => certificate,
            (None, ProviderKind::SoftToken(provider)) => {
                provider.bootstrap().certificate(&spec.alias).cloned().ok_or_else(|| {
                    Error::Configuration(format!("No certificate provisioned for alias '{}'", spec.alias))
                })?
            }
            (None, _) => {
                return Err(Error::Configuration(format!(
                    "Credential '{}' needs a certificate",
                    spec.alias
                )));
            }
        };

        let source: Arc<dyn SessionSource> = self.clone();
        Pkcs11Credential::build(source, certificate, &spec.alias, key_source, spec.liveness)
    }
}

impl SessionSource for TokenProvider {
    fn sessions(&self) -> Vec<Arc<dyn TokenSession>> {
        self.sessions.read().unwrap().clone()
    }

    fn reopen(&self) -> Result<Vec<Arc<dyn TokenSession>>, Error> {
        let sessions = self.kind.open()?;
        *self.sessions.write().unwrap() = sessions.clone();
        Ok(sessions)
    }
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("kind", &self.kind.to_string())
            .field("sessions", &self.provider_names())
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------
