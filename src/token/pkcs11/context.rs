use std::{fmt, path::Path};

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    session::Session,
    slot::Slot,
};
use log::{debug, error};

use crate::token::{ProviderConfig, TokenError};

/// A loaded and initialized PKCS#11 library.
///
/// Each library must be initialized only once by a single application, however many sessions
/// are opened with it. [super::Pkcs11Library] therefore keeps one context per library file
/// name, so that two paths pointing at copies of the same library do not both get loaded.
pub(super) struct Pkcs11Context {
    lib_file_name: String,
    pkcs11: Pkcs11,
}

impl Pkcs11Context {
    pub fn load(lib_path: &Path) -> Result<Self, TokenError> {
        let lib_file_name = lib_file_name(lib_path)?;

        let pkcs11 = Pkcs11::new(lib_path).map_err(|err| {
            error!("Failed to load PKCS#11 library '{}': {}", lib_path.display(), err);
            TokenError::Load(format!("Failed to load PKCS#11 library '{}': {}", lib_path.display(), err))
        })?;

        pkcs11.initialize(CInitializeArgs::OsThreads).map_err(|err| {
            error!("Failed to initialize PKCS#11 library '{}': {}", lib_file_name, err);
            TokenError::Load(format!("Failed to initialize PKCS#11 library '{}': {}", lib_file_name, err))
        })?;

        debug!("Loaded and initialized PKCS#11 library '{}'", lib_file_name);
        Ok(Pkcs11Context { lib_file_name, pkcs11 })
    }

    pub fn lib_file_name(&self) -> &str {
        &self.lib_file_name
    }

    /// Finds the slot for a provider configuration.
    ///
    /// An explicit `slot` is a slot id, looked up among all slots. Otherwise the slot list
    /// index (0 if absent) points into the list of slots that hold a token.
    pub fn select_slot(&self, config: &ProviderConfig) -> Result<Slot, TokenError> {
        if let Some(slot) = config.slot() {
            let slot_id = slot
                .parse::<u64>()
                .map_err(|_| TokenError::Load(format!("Invalid slot '{}'", slot)))?;

            return self
                .pkcs11
                .get_all_slots()
                .map_err(|err| self.load_error("get slots", err))?
                .into_iter()
                .find(|candidate| candidate.id() == slot_id)
                .ok_or_else(|| TokenError::Load(format!("No slot with id {} in '{}'", slot_id, self.lib_file_name)));
        }

        let index = config.slot_list_index().unwrap_or(0) as usize;
        self.pkcs11
            .get_slots_with_token()
            .map_err(|err| self.load_error("get slots with token", err))?
            .get(index)
            .copied()
            .ok_or_else(|| {
                TokenError::Load(format!(
                    "No token at slot list index {} in '{}'",
                    index, self.lib_file_name
                ))
            })
    }

    pub fn open_session(&self, slot: Slot) -> Result<Session, TokenError> {
        self.pkcs11
            .open_rw_session(slot)
            .map_err(|err| self.load_error("open session", err))
    }

    fn load_error(&self, action: &str, err: cryptoki::error::Error) -> TokenError {
        TokenError::Load(format!("Failed to {} with '{}': {}", action, self.lib_file_name, err))
    }
}

impl fmt::Debug for Pkcs11Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Context")
            .field("lib_file_name", &self.lib_file_name)
            .finish()
    }
}

pub(super) fn lib_file_name(lib_path: &Path) -> Result<String, TokenError> {
    lib_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            TokenError::Load(format!(
                "PKCS#11 library path '{}' does not point to a file",
                lib_path.display()
            ))
        })
}
