use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use hsmcred::{
    config::{Config, TokenConfig},
    factory::CredentialFactory,
    provisioning::CredentialDescriptor,
    test::{self, MockTokenLibrary},
    token::{Certificate, ProviderRegistry},
};

#[allow(dead_code)]
pub fn init_logging() {
    let _ = stderrlog::new().verbosity(3).init();
}

#[allow(dead_code)]
pub fn certificate(common_name: &str) -> Certificate {
    Certificate::from_pem(&test::self_signed_certificate_pem(common_name)).unwrap()
}

/// Parses the `[token]` part of a configuration file.
#[allow(dead_code)]
pub fn token_config(toml: &str) -> TokenConfig {
    let config: Config = toml::from_str(toml).unwrap();
    config.verify().unwrap();
    config.token
}

#[allow(dead_code)]
pub fn factory(config: TokenConfig, library: &Arc<MockTokenLibrary>) -> CredentialFactory {
    CredentialFactory::new(config, Arc::new(ProviderRegistry::new(library.clone())))
}

#[allow(dead_code)]
pub fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::File::create(&path).unwrap().write_all(content).unwrap();
    path
}

/// Writes `<alias>.key` and, if asked, `<alias>.crt` into `dir`.
#[allow(dead_code)]
pub fn write_credential(dir: &Path, alias: &str, with_cert: bool) -> CredentialDescriptor {
    let key = write_file(dir, &format!("{}.key", alias), &test::private_key_pem());
    let cert = dir.join(format!("{}.crt", alias));
    if with_cert {
        write_file(dir, &format!("{}.crt", alias), &test::self_signed_certificate_pem(alias));
    }
    CredentialDescriptor::new(alias, key, cert)
}
