pub const HSMCRED_APP: &str = "hsmcred";
pub const HSMCRED_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HSMCRED_DEFAULT_CONFIG_FILE: &str = "./defaults/hsmcred.conf";

pub const HSMCRED_ENV_CONFIG: &str = "HSMCRED_CONFIG";
pub const HSMCRED_ENV_LOG_LEVEL: &str = "HSMCRED_LOG_LEVEL";
pub const HSMCRED_ENV_PKCS11_TOOL: &str = "HSMCRED_PKCS11_TOOL";

/// The command line utility used to provision software tokens.
pub const PKCS11_TOOL: &str = "pkcs11-tool";

/// Base of the CKA_ID values given to provisioned keys, incremented by the position of the key.
pub const PROVISIONED_KEY_ID_BASE: u16 = 0xaaaa;

/// Both of these must appear in the `pkcs11-tool -T` output of a token that still needs initializing.
pub const SOFTHSM_UNINITIALIZED_SLOT_MARKER: &str = "Slot 0 (0x0)";
pub const SOFTHSM_UNINITIALIZED_STATE_MARKER: &str = "token state:   uninitialized";

/// Data signed by the liveness probe. Never leaves the token's signing operation.
pub const PROBE_DATA: &[u8] = &[0u8; 32];
