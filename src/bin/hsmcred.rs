use std::{path::PathBuf, process, sync::Arc};

use clap::{Parser, Subcommand};
use hsmcred::{
    Error,
    config::Config,
    constants::*,
    factory::CredentialFactory,
    token::{ProviderRegistry, pkcs11::Pkcs11Library},
};

/// Opens the PKCS#11 sessions of a configuration and checks its credential.
#[derive(Parser)]
#[command(name = HSMCRED_APP, version = HSMCRED_VERSION)]
struct Options {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = HSMCRED_DEFAULT_CONFIG_FILE, env = HSMCRED_ENV_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the sessions opened for the configured token
    Providers,

    /// Build the configured credential and resolve its key once
    Check,
}

fn main() {
    let options = Options::parse();
    match Config::create(&options.config) {
        Ok(config) => {
            if let Err(e) = run(options.command, &config) {
                eprintln!("{}", e);
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn run(command: Command, config: &Config) -> Result<(), Error> {
    let registry = Arc::new(ProviderRegistry::new(Arc::new(Pkcs11Library::new())));
    let factory = CredentialFactory::new(config.token.clone(), registry);
    let provider = factory.create_provider()?;

    match command {
        Command::Providers => {
            println!("{} provider", provider.kind());
            for name in factory.registry().names() {
                if let Some(session) = factory.registry().get(&name) {
                    println!("{}: {:?}", name, session);
                }
            }
        }
        Command::Check => {
            let credential = config
                .credential
                .as_ref()
                .ok_or_else(|| Error::configuration("no [credential] section in the configuration"))?;
            let credential = provider.credential(credential.spec()?)?;
            let key = credential.resolve_key()?;
            println!(
                "{}: {} key from session '{}' (liveness {:?})",
                credential.alias(),
                key.algorithm(),
                credential.current_session().unwrap_or_default(),
                credential.liveness()
            );
        }
    }

    Ok(())
}
