//! Provisioning of a SoftHSM software token with keys and certificates from files.
//!
//! A freshly installed SoftHSM has an uninitialized slot 0. Before any session can be opened the
//! slot is initialized with the configured user PIN, and every credential is imported with
//! `pkcs11-tool` so that its private key and certificate share a label (the alias) and an id.
//! On later starts the token is found to be initialized already and nothing is imported.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use log::{debug, info, warn};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::{
    constants::{
        HSMCRED_ENV_PKCS11_TOOL, PKCS11_TOOL, PROVISIONED_KEY_ID_BASE, SOFTHSM_UNINITIALIZED_SLOT_MARKER,
        SOFTHSM_UNINITIALIZED_STATE_MARKER,
    },
    error::Error,
    token::{Certificate, ProviderConfig, ProviderRegistry, TokenSession},
};

//------------ CredentialDescriptor ------------------------------------------

/// A private key file and certificate file to be imported under an alias.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CredentialDescriptor {
    #[serde(alias = "name")]
    pub alias: String,
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
}

impl CredentialDescriptor {
    pub fn new(alias: &str, key_file: impl Into<PathBuf>, cert_file: impl Into<PathBuf>) -> Self {
        CredentialDescriptor {
            alias: alias.to_string(),
            key_file: key_file.into(),
            cert_file: cert_file.into(),
        }
    }

    /// Finds every `<alias>.key` in `dir` and pairs it with `<alias>.crt`, ordered by alias.
    ///
    /// Whether the certificate actually exists is checked later, when the descriptors are
    /// validated.
    pub fn scan_dir(dir: &Path) -> Result<Vec<Self>, Error> {
        let entries = fs::read_dir(dir)
            .map_err(|e| Error::Configuration(format!("Cannot read key location '{}': {}", dir.display(), e)))?;

        let mut descriptors = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("key") {
                continue;
            }
            if let Some(alias) = path.file_stem().and_then(|stem| stem.to_str()) {
                descriptors.push(CredentialDescriptor::new(alias, &path, dir.join(format!("{}.crt", alias))));
            }
        }

        descriptors.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(descriptors)
    }
}

//------------ CommandRunner -------------------------------------------------

/// Runs an external program and returns what it printed on stdout.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> io::Result<String>;
}

/// Runs commands as child processes. Spawn failures and non-zero exit codes are errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<String> {
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

//------------ ProvisioningBootstrap -----------------------------------------

#[derive(Clone, Debug)]
struct ProvisionedCredential {
    descriptor: CredentialDescriptor,
    id: String,
    certificate: Certificate,
}

pub struct ProvisioningBootstrap {
    library: String,
    label: String,
    pin: SecretString,
    credentials: Vec<ProvisionedCredential>,
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl ProvisioningBootstrap {
    /// Keeps the descriptors whose key file is readable and whose certificate file holds a
    /// certificate, dropping the others with a warning. Ids follow the order of the kept ones.
    pub fn new(
        library: &str,
        label: &str,
        pin: SecretString,
        descriptors: &[CredentialDescriptor],
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let mut credentials = Vec::new();

        for descriptor in descriptors {
            if let Err(e) = fs::File::open(&descriptor.key_file) {
                warn!(
                    "Key file '{}' for alias '{}' is not readable, skipping: {}",
                    descriptor.key_file.display(),
                    descriptor.alias,
                    e
                );
                continue;
            }

            let certificate = match Certificate::read(&descriptor.cert_file) {
                Ok(certificate) => certificate,
                Err(e) => {
                    warn!("Certificate for alias '{}' cannot be used, skipping: {}", descriptor.alias, e);
                    continue;
                }
            };

            let id = match u16::try_from(credentials.len())
                .ok()
                .and_then(|position| PROVISIONED_KEY_ID_BASE.checked_add(position))
            {
                Some(id) => hex::encode(id.to_be_bytes()),
                None => {
                    warn!("No key id left for alias '{}', skipping", descriptor.alias);
                    continue;
                }
            };

            credentials.push(ProvisionedCredential {
                descriptor: descriptor.clone(),
                id,
                certificate,
            });
        }

        ProvisioningBootstrap {
            library: library.to_string(),
            label: label.to_string(),
            pin,
            credentials,
            runner,
            program: env::var(HSMCRED_ENV_PKCS11_TOOL).unwrap_or_else(|_| PKCS11_TOOL.to_string()),
        }
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The aliases of the credentials that passed validation.
    pub fn aliases(&self) -> Vec<&str> {
        self.credentials.iter().map(|c| c.descriptor.alias.as_str()).collect()
    }

    pub fn certificate(&self, alias: &str) -> Option<&Certificate> {
        self.credentials
            .iter()
            .find(|c| c.descriptor.alias == alias)
            .map(|c| &c.certificate)
    }

    /// The id under which the credential for `alias` is imported.
    pub fn key_id(&self, alias: &str) -> Option<&str> {
        self.credentials
            .iter()
            .find(|c| c.descriptor.alias == alias)
            .map(|c| c.id.as_str())
    }

    /// Initializes the token and imports all credentials, unless the token is initialized
    /// already.
    pub fn run(&self) -> Result<(), Error> {
        if !self.is_uninitialized() {
            info!("[{}] SoftHSM already initialized, skipping key import", self.label);
            return Ok(());
        }

        info!("[{}] SoftHSM is not initialized, loading keys into the token", self.label);
        self.init_token()?;

        for credential in &self.credentials {
            if let Err(e) = self.import(credential) {
                warn!(
                    "[{}] Failed to import key and certificate for alias '{}': {}",
                    self.label, credential.descriptor.alias, e
                );
            }
        }

        Ok(())
    }

    /// Asks `pkcs11-tool` for the token state. A token is only considered uninitialized when
    /// the output says so, a failing command means it is assumed to be initialized.
    pub fn is_uninitialized(&self) -> bool {
        let args = self.module_args(&["-T"]);
        match self.execute(&args) {
            Ok(output) => {
                let uninitialized = output.contains(SOFTHSM_UNINITIALIZED_SLOT_MARKER)
                    && output.contains(SOFTHSM_UNINITIALIZED_STATE_MARKER);
                info!(
                    "[{}] Initialized state of SoftHSM: {}",
                    self.label,
                    if uninitialized { "uninitialized" } else { "initialized" }
                );
                uninitialized
            }
            Err(e) => {
                warn!("[{}] Could not determine token state, assuming initialized: {}", self.label, e);
                false
            }
        }
    }

    fn init_token(&self) -> Result<(), Error> {
        let so_pin = rand::rng().random_range(0..1u32 << 24).to_string();
        let args = self.module_args(&[
            "--init-token",
            "--slot",
            "0",
            "--so-pin",
            so_pin.as_str(),
            "--init-pin",
            "--pin",
            self.pin.expose_secret().as_str(),
            "--label",
            self.label.as_str(),
        ]);

        self.execute(&args).map_err(|e| {
            Error::ProviderLoad(format!("Failed to initialize SoftHSM slot 0 as '{}': {}", self.label, e))
        })?;
        info!("[{}] Initialized SoftHSM key slot", self.label);
        Ok(())
    }

    fn import(&self, credential: &ProvisionedCredential) -> io::Result<()> {
        let alias = credential.descriptor.alias.as_str();
        let key_file = credential.descriptor.key_file.to_string_lossy().into_owned();
        let cert_file = credential.descriptor.cert_file.to_string_lossy().into_owned();
        let pin = self.pin.expose_secret().as_str();
        let id = credential.id.as_str();

        self.execute(&self.module_args(&[
            "-p",
            pin,
            "-l",
            "-w",
            key_file.as_str(),
            "-y",
            "privkey",
            "-a",
            alias,
            "-d",
            id,
            "--usage-sign",
            "--usage-decrypt",
        ]))?;

        self.execute(&self.module_args(&[
            "-p",
            pin,
            "-l",
            "-w",
            cert_file.as_str(),
            "-y",
            "cert",
            "-a",
            alias,
            "-d",
            id,
        ]))?;

        info!("[{}] Loaded key and certificate for alias '{}'", self.label, alias);
        Ok(())
    }

    fn module_args(&self, args: &[&str]) -> Vec<String> {
        let mut res = vec!["--module".to_string(), self.library.clone()];
        res.extend(args.iter().map(|arg| arg.to_string()));
        res
    }

    fn execute(&self, args: &[String]) -> io::Result<String> {
        debug!("Executing: {} {}", self.program, redacted(args));
        let output = self.runner.run(&self.program, args)?;
        debug!("{}", output.trim_end());
        Ok(output)
    }
}

/// Joins the arguments for logging, hiding the values of PIN options.
fn redacted(args: &[String]) -> String {
    let mut res = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            res.push("*****");
        } else {
            res.push(arg.as_str());
        }
        hide_next = matches!(arg.as_str(), "-p" | "--pin" | "--so-pin");
    }
    res.join(" ")
}

//------------ SoftTokenProvider ---------------------------------------------

/// Provisions the token if needed, then opens the single session `{library, name}`.
pub struct SoftTokenProvider {
    bootstrap: ProvisioningBootstrap,
    registry: Arc<ProviderRegistry>,
}

impl SoftTokenProvider {
    pub fn new(bootstrap: ProvisioningBootstrap, registry: Arc<ProviderRegistry>) -> Self {
        SoftTokenProvider { bootstrap, registry }
    }

    pub fn bootstrap(&self) -> &ProvisioningBootstrap {
        &self.bootstrap
    }

    pub fn open(&self) -> Result<Vec<Arc<dyn TokenSession>>, Error> {
        self.bootstrap.run()?;

        let config = ProviderConfig::new(self.bootstrap.library(), self.bootstrap.label());
        let session = self.registry.open(&config).map_err(|e| {
            Error::ProviderLoad(format!(
                "Failed to open SoftHSM session '{}': {}",
                self.bootstrap.label(),
                e
            ))
        })?;
        Ok(vec![session])
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::test::{self, MockTokenLibrary, ScriptedCommandRunner};

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::File::create(&path).unwrap().write_all(content).unwrap();
        path
    }

    fn write_credential(dir: &Path, alias: &str) -> CredentialDescriptor {
        let key = write_file(dir, &format!("{}.key", alias), &test::private_key_pem());
        let cert = write_file(dir, &format!("{}.crt", alias), &test::self_signed_certificate_pem(alias));
        CredentialDescriptor::new(alias, key, cert)
    }

    fn bootstrap(descriptors: &[CredentialDescriptor], runner: &Arc<ScriptedCommandRunner>) -> ProvisioningBootstrap {
        ProvisioningBootstrap::new(
            "/usr/lib/softhsm/libsofthsm2.so",
            "SoftHsm",
            SecretString::new("1234".to_string()),
            descriptors,
            runner.clone(),
        )
    }

    #[test]
    fn imports_only_valid_descriptors_into_uninitialized_token() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_credential(dir.path(), "good");
        let key = write_file(dir.path(), "nocert.key", &test::private_key_pem());
        let no_cert = CredentialDescriptor::new("nocert", key, dir.path().join("nocert.crt"));

        let runner = Arc::new(ScriptedCommandRunner::uninitialized());
        let bootstrap = bootstrap(&[no_cert, good.clone()], &runner);
        assert_eq!(vec!["good"], bootstrap.aliases());
        assert_eq!(Some("aaaa"), bootstrap.key_id("good"));

        bootstrap.run().unwrap();

        let key_file = good.key_file.to_string_lossy().into_owned();
        assert_eq!(1, runner.calls_with("--init-token").len());
        let key_imports = runner.calls_with("privkey");
        assert_eq!(1, key_imports.len());
        let expected: Vec<String> = [
            "--module",
            "/usr/lib/softhsm/libsofthsm2.so",
            "-p",
            "1234",
            "-l",
            "-w",
            key_file.as_str(),
            "-y",
            "privkey",
            "-a",
            "good",
            "-d",
            "aaaa",
            "--usage-sign",
            "--usage-decrypt",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(expected, key_imports[0]);
        assert_eq!(1, runner.calls_with("cert").len());
    }

    #[test]
    fn initialized_token_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let one = write_credential(dir.path(), "one");

        let runner = Arc::new(ScriptedCommandRunner::new().respond_to(
            "-T",
            Ok("Available slots:\nSlot 0 (0x5e498485): SoftHSM slot ID 0x5e498485\n  token label        : SoftHsm\n"),
        ));
        bootstrap(&[one], &runner).run().unwrap();

        assert_eq!(1, runner.calls().len());
    }

    #[test]
    fn failing_state_check_means_initialized() {
        let runner = Arc::new(ScriptedCommandRunner::new().respond_to("-T", Err("pkcs11-tool: not found")));
        let bootstrap = bootstrap(&[], &runner);
        assert!(!bootstrap.is_uninitialized());
        bootstrap.run().unwrap();
        assert!(runner.calls_with("--init-token").is_empty());
    }

    #[test]
    fn failed_import_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let one = write_credential(dir.path(), "one");
        let two = write_credential(dir.path(), "two");

        let runner = Arc::new(ScriptedCommandRunner::uninitialized().respond_to("one", Err("CKR_TEMPLATE_INCONSISTENT")));
        let bootstrap = bootstrap(&[one, two], &runner);
        assert_eq!(Some("aaab"), bootstrap.key_id("two"));

        bootstrap.run().unwrap();

        let imported: Vec<Vec<String>> = runner.calls_with("two");
        assert_eq!(2, imported.len());
        assert!(imported.iter().all(|call| call.contains(&"aaab".to_string())));
        assert_eq!(1, runner.calls_with("one").len());
    }

    #[test]
    fn failed_init_is_a_load_error() {
        let runner = Arc::new(ScriptedCommandRunner::uninitialized().respond_to("--init-token", Err("CKR_PIN_INVALID")));
        let res = bootstrap(&[], &runner).run();
        assert!(matches!(res, Err(Error::ProviderLoad(_))));
    }

    #[test]
    fn pins_are_not_logged() {
        let args: Vec<String> = ["--module", "/lib.so", "--so-pin", "4242", "--init-pin", "--pin", "1234", "-p", "1234"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            "--module /lib.so --so-pin ***** --init-pin --pin ***** -p *****",
            redacted(&args)
        );
    }

    #[test]
    fn scans_key_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_credential(dir.path(), "b");
        write_credential(dir.path(), "a");
        write_file(dir.path(), "readme.txt", b"not a key");

        let descriptors = CredentialDescriptor::scan_dir(dir.path()).unwrap();
        let aliases: Vec<&str> = descriptors.iter().map(|d| d.alias.as_str()).collect();
        assert_eq!(vec!["a", "b"], aliases);
        assert_eq!(dir.path().join("a.crt"), descriptors[0].cert_file);
    }

    #[test]
    fn soft_token_provider_opens_single_session() {
        test::init_logging();
        let library = Arc::new(MockTokenLibrary::new());
        library.add_slot(0, &["one"]);
        let registry = Arc::new(ProviderRegistry::new(library.clone()));

        let runner = Arc::new(ScriptedCommandRunner::uninitialized());
        let provider = SoftTokenProvider::new(bootstrap(&[], &runner), registry.clone());

        let sessions = provider.open().unwrap();
        assert_eq!(1, sessions.len());
        assert_eq!("SoftHsm", sessions[0].name());
        assert_eq!(vec![None], library.opened_indexes());
        assert_eq!(vec!["SoftHsm".to_string()], registry.names());
    }
}
