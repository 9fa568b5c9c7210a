use std::{
    env, fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{LevelFilter, warn};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, de};
#[cfg(unix)]
use syslog::Facility;

use crate::{
    constants::*,
    error::Error,
    ext_serde,
    factory::CredentialSpec,
    pool::LivenessPolicy,
    provisioning::CredentialDescriptor,
    token::Certificate,
};

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(HSMCRED_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value '{}' for log level in env var {}, using 'info'",
                        level, HSMCRED_ENV_LOG_LEVEL
                    );
                    LevelFilter::Info
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./hsmcred.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration of the hsmcred tool.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub credential: Option<CredentialConfig>,
}

/// The token settings deciding which kind of provider is created, see
/// [crate::factory::CredentialFactory].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TokenConfig {
    /// Path to the PKCS#11 module.
    #[serde(default, deserialize_with = "ext_serde::de_opt_string")]
    pub library: Option<String>,

    /// Provider name, also used as the token label of a provisioned SoftHSM.
    #[serde(default, deserialize_with = "ext_serde::de_opt_string")]
    pub name: Option<String>,

    #[serde(default, deserialize_with = "ext_serde::de_opt_slot")]
    pub slot: Option<String>,

    #[serde(default)]
    pub slot_list_index: Option<u32>,

    /// Number of consecutive slot list indices to probe, starting at `slot_list_index`.
    #[serde(default)]
    pub slot_list_index_max_range: Option<u32>,

    /// Provider configuration files to use instead of `library` and `name`.
    #[serde(default)]
    pub external_configs: Option<Vec<PathBuf>>,

    /// Credentials to import into a SoftHSM token.
    #[serde(default)]
    pub credentials: Option<Vec<CredentialDescriptor>>,

    /// Directory holding `<alias>.key` and `<alias>.crt` files to import into a SoftHSM token.
    #[serde(default, deserialize_with = "ext_serde::de_opt_path")]
    pub key_location: Option<PathBuf>,

    #[serde(default, deserialize_with = "ext_serde::de_opt_secret")]
    pub pin: Option<SecretString>,
}

impl TokenConfig {
    pub fn new(library: &str, name: &str) -> Self {
        TokenConfig {
            library: Some(library.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(SecretString::new(pin.to_string()));
        self
    }

    pub fn external_configs(&self) -> Option<&[PathBuf]> {
        self.external_configs.as_deref().filter(|configs| !configs.is_empty())
    }

    /// All credentials to provision, listed ones first, then those found in `key_location`.
    /// Returns `None` if neither is configured. An unreadable `key_location` adds nothing.
    pub fn credential_descriptors(&self) -> Option<Vec<CredentialDescriptor>> {
        if self.credentials.is_none() && self.key_location.is_none() {
            return None;
        }

        let mut descriptors = self.credentials.clone().unwrap_or_default();
        if let Some(dir) = &self.key_location {
            match CredentialDescriptor::scan_dir(dir) {
                Ok(found) => descriptors.extend(found),
                Err(e) => warn!("No credentials loaded from key location: {}", e),
            }
        }
        Some(descriptors)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.slot.is_some() && self.slot_list_index.is_some() {
            return Err(ConfigError::other(
                "'slot' and 'slot_list_index' cannot be used together",
            ));
        }

        if self.slot_list_index_max_range.is_some() && self.slot.is_some() {
            return Err(ConfigError::other(
                "'slot_list_index_max_range' cannot be used together with 'slot'",
            ));
        }

        Ok(())
    }
}

/// The credential the `hsmcred` tool builds and checks.
#[derive(Clone, Debug, Deserialize)]
pub struct CredentialConfig {
    pub alias: String,

    /// Certificate file, PEM or DER. May be left out for credentials provisioned into a SoftHSM.
    #[serde(default, deserialize_with = "ext_serde::de_opt_path")]
    pub certificate: Option<PathBuf>,

    #[serde(default)]
    pub liveness: LivenessPolicy,
}

impl CredentialConfig {
    pub fn spec(&self) -> Result<CredentialSpec, Error> {
        let mut spec = CredentialSpec::new(self.alias.trim()).with_liveness(self.liveness);
        if let Some(path) = &self.certificate {
            spec = spec.with_certificate(Certificate::read(path)?);
        }
        Ok(spec)
    }
}

/// # Create
impl Config {
    pub fn test() -> Self {
        Config {
            log_level: LevelFilter::Debug,
            log_type: LogType::Stderr,
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            token: TokenConfig::default(),
            credential: None,
        }
    }

    /// Reads and verifies the config, and sets up logging as configured.
    pub fn create(config_file: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_config(config_file)?;
        config.init_logging()?;
        config.verify()?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        self.token.verify()?;

        if let Some(credential) = &self.credential {
            if credential.alias.trim().is_empty() {
                return Err(ConfigError::other("credential 'alias' must not be empty"));
            }
        }

        Ok(())
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(file)?;
        let c: Config = toml::from_str(&text)?;
        Ok(c)
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("syslog is only supported on unix")),
        }
    }

    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.apply_logger(io::stderr(), "stderr")
    }

    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = fern::log_file(path).map_err(|e| {
            ConfigError::Other(format!("Failed to open log file '{}': {}", path.display(), e))
        })?;
        self.apply_logger(file, "file")
    }

    /// Logs to the local syslog socket, or to a syslog daemon listening on UDP port 514.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process: HSMCRED_APP.to_string(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)))
            .map_err(|e| ConfigError::Other(format!("Cannot connect to syslog: {}", e)))?;
        self.apply_logger(logger, "syslog")
    }

    /// Installs a dispatcher writing to `output`. Records carry their target at debug and
    /// trace level only, and the PKCS#11 binding never logs below info.
    fn apply_logger(&self, output: impl Into<fern::Output>, kind: &str) -> Result<(), ConfigError> {
        let show_target = self.log_level >= LevelFilter::Debug;

        fern::Dispatch::new()
            .format(move |out, message, record| {
                let target = if show_target {
                    format!(" [{}]", record.target())
                } else {
                    String::new()
                };
                out.finish(format_args!(
                    "{} [{}]{} {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    target,
                    message
                ))
            })
            .level(self.log_level)
            .level_for("cryptoki", self.log_level.min(LevelFilter::Info))
            .chain(output)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init {} logging: {}", kind, e)))
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                string
            ))),
        }
    }
}

//------------ LivenessPolicy ------------------------------------------------

impl<'de> Deserialize<'de> for LivenessPolicy {
    fn deserialize<D>(d: D) -> Result<LivenessPolicy, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.trim() {
            "probe" => Ok(LivenessPolicy::Probe),
            "trust" => Ok(LivenessPolicy::Trust),
            _ => Err(de::Error::custom(format!(
                "expected \"probe\" or \"trust\", found: \"{}\"",
                string
            ))),
        }
    }
}

//------------ Tests ---------------------------------------------------------
