//! Helper functions and a mock token library for testing hsmcred.

use std::{
    collections::BTreeMap,
    fmt, io,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    nid::Nid,
    pkey::PKey,
    rsa::Rsa,
    x509::{X509Builder, X509NameBuilder},
};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    config::Config,
    constants::{SOFTHSM_UNINITIALIZED_SLOT_MARKER, SOFTHSM_UNINITIALIZED_STATE_MARKER},
    pool::SessionSelector,
    provisioning::CommandRunner,
    token::{KeyAlgorithm, KeyHandle, ProviderConfig, TokenError, TokenLibrary, TokenSession},
};

pub fn init_logging() {
    // Just creates a test config so we can initialize logging, then forgets about it
    let _ = Config::test().init_logging();
}

//------------ Certificates --------------------------------------------------

pub fn private_key_pem() -> Vec<u8> {
    let rsa = Rsa::generate(2048).unwrap();
    rsa.private_key_to_pem().unwrap()
}

pub fn self_signed_certificate_pem(common_name: &str) -> Vec<u8> {
    let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
    let name = name.build();

    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(365).unwrap()).unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();

    builder.build().to_pem().unwrap()
}

//------------ FixedSelector -------------------------------------------------

/// Always selects the session at the given position, or the last one if there are fewer.
pub struct FixedSelector(pub usize);

impl SessionSelector for FixedSelector {
    fn select(&mut self, sessions: &[&str]) -> usize {
        self.0.min(sessions.len().saturating_sub(1))
    }
}

//------------ MockTokenLibrary ----------------------------------------------

pub enum FnIdx {
    OpenSession,
    FetchKey,
    ProbeKey,
    Count,
}

#[derive(Debug)]
pub struct MockCallCounts {
    call_counts: RwLock<Vec<u32>>,
}

impl MockCallCounts {
    pub fn new() -> Self {
        Self {
            call_counts: RwLock::new(vec![0; FnIdx::Count as usize]),
        }
    }

    pub fn get(&self, fn_idx: FnIdx) -> u32 {
        self.call_counts.read().unwrap()[fn_idx as usize]
    }

    pub fn inc(&self, fn_idx: FnIdx) {
        self.call_counts.write().unwrap()[fn_idx as usize] += 1;
    }
}

impl Default for MockCallCounts {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct MockState {
    slots: RwLock<BTreeMap<u32, Vec<(String, KeyAlgorithm)>>>,
    opened_indexes: RwLock<Vec<Option<u32>>>,
    generation: AtomicU64,
    corrupt_certificates: AtomicBool,
    fail_probes: AtomicBool,
    counts: MockCallCounts,
}

/// An in-memory token library with numbered slots holding RSA keys by alias.
///
/// Sessions are opened at the slot list index of the provider configuration, or at the `slot`
/// number if one is given, or at the lowest slot otherwise. Calling [MockTokenLibrary::reset]
/// acts like a token reset: all sessions opened before it fail their probes from then on.
#[derive(Debug, Default)]
pub struct MockTokenLibrary {
    state: Arc<MockState>,
}

impl MockTokenLibrary {
    pub const PIN: &'static str = "1234";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_slot(&self, index: u32, aliases: &[&str]) {
        let keys = aliases.iter().map(|alias| (alias.to_string(), KeyAlgorithm::Rsa)).collect();
        self.state.slots.write().unwrap().insert(index, keys);
    }

    pub fn add_slot_with_algorithm(&self, index: u32, alias: &str, algorithm: KeyAlgorithm) {
        self.state
            .slots
            .write()
            .unwrap()
            .insert(index, vec![(alias.to_string(), algorithm)]);
    }

    pub fn remove_slot(&self, index: u32) {
        self.state.slots.write().unwrap().remove(&index);
    }

    pub fn reset(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn corrupt_certificates(&self, corrupt: bool) {
        self.state.corrupt_certificates.store(corrupt, Ordering::SeqCst);
    }

    pub fn fail_probes(&self, fail: bool) {
        self.state.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// The number of attempts to open a session, successful or not.
    pub fn open_count(&self) -> u32 {
        self.state.counts.get(FnIdx::OpenSession)
    }

    pub fn fetch_count(&self) -> u32 {
        self.state.counts.get(FnIdx::FetchKey)
    }

    pub fn probe_count(&self) -> u32 {
        self.state.counts.get(FnIdx::ProbeKey)
    }

    /// The slot list index of every open attempt, in order.
    pub fn opened_indexes(&self) -> Vec<Option<u32>> {
        self.state.opened_indexes.read().unwrap().clone()
    }
}

impl TokenLibrary for MockTokenLibrary {
    fn open_session(&self, config: &ProviderConfig) -> Result<Arc<dyn TokenSession>, TokenError> {
        self.state.counts.inc(FnIdx::OpenSession);
        self.state.opened_indexes.write().unwrap().push(config.slot_list_index());

        let slots = self.state.slots.read().unwrap();
        let slot = match (config.slot_list_index(), config.slot()) {
            (Some(index), _) => Some(index),
            (None, Some(slot)) => slot.parse::<u32>().ok(),
            (None, None) => slots.keys().next().copied(),
        };

        match slot {
            Some(slot) if slots.contains_key(&slot) => Ok(Arc::new(MockSession {
                name: config.name().to_string(),
                slot,
                generation: self.state.generation.load(Ordering::SeqCst),
                state: self.state.clone(),
            })),
            _ => Err(TokenError::Load(format!(
                "CKR_SLOT_ID_INVALID: no token present for '{}'",
                config.name()
            ))),
        }
    }
}

pub struct MockSession {
    name: String,
    slot: u32,
    generation: u64,
    state: Arc<MockState>,
}

impl fmt::Debug for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSession")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .finish()
    }
}

impl TokenSession for MockSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_key(&self, alias: &str, pin: &SecretString) -> Result<KeyHandle, TokenError> {
        self.state.counts.inc(FnIdx::FetchKey);

        if pin.expose_secret() != MockTokenLibrary::PIN {
            return Err(TokenError::Auth("CKR_PIN_INCORRECT".to_string()));
        }

        let slots = self.state.slots.read().unwrap();
        let keys = slots
            .get(&self.slot)
            .ok_or_else(|| TokenError::Device("CKR_DEVICE_REMOVED".to_string()))?;

        let position = keys
            .iter()
            .position(|(label, _)| label == alias)
            .ok_or_else(|| TokenError::NotFound(alias.to_string()))?;

        if self.state.corrupt_certificates.load(Ordering::SeqCst) {
            return Err(TokenError::Format(format!(
                "certificate object for '{}' is not valid DER",
                alias
            )));
        }

        let object = u64::from(self.slot) * 100 + position as u64;
        Ok(KeyHandle::new(object, keys[position].1.clone()))
    }

    fn probe_key(&self, _key: &KeyHandle) -> Result<(), TokenError> {
        self.state.counts.inc(FnIdx::ProbeKey);

        if self.state.fail_probes.load(Ordering::SeqCst)
            || self.generation != self.state.generation.load(Ordering::SeqCst)
        {
            Err(TokenError::Device("CKR_SESSION_HANDLE_INVALID".to_string()))
        } else {
            Ok(())
        }
    }
}

//------------ ScriptedCommandRunner -----------------------------------------

/// Records every command and answers with the first scripted response whose trigger argument
/// appears in the command line. Commands without a matching trigger succeed with no output.
#[derive(Default)]
pub struct ScriptedCommandRunner {
    responses: Vec<(String, Result<String, String>)>,
    calls: RwLock<Vec<Vec<String>>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner for a SoftHSM token that still has to be initialized.
    pub fn uninitialized() -> Self {
        Self::new().respond_to("-T", Ok(&uninitialized_token_listing()))
    }

    pub fn respond_to(mut self, trigger: &str, response: Result<&str, &str>) -> Self {
        let response = response.map(str::to_string).map_err(str::to_string);
        self.responses.push((trigger.to_string(), response));
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.read().unwrap().clone()
    }

    /// The recorded calls that contain the given argument.
    pub fn calls_with(&self, arg: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|call| call.iter().any(|a| a == arg))
            .collect()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn run(&self, _program: &str, args: &[String]) -> io::Result<String> {
        self.calls.write().unwrap().push(args.to_vec());

        let response = self
            .responses
            .iter()
            .find(|(trigger, _)| args.iter().any(|arg| arg == trigger))
            .map(|(_, response)| response.clone());

        match response {
            Some(Ok(output)) => Ok(output),
            Some(Err(msg)) => Err(io::Error::other(msg)),
            None => Ok(String::new()),
        }
    }
}

pub fn uninitialized_token_listing() -> String {
    format!(
        "Available slots:\n{}\n  token label        : \n  {}\n",
        SOFTHSM_UNINITIALIZED_SLOT_MARKER, SOFTHSM_UNINITIALIZED_STATE_MARKER
    )
}
