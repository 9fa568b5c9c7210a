use std::sync::{Arc, RwLock};

use log::{debug, error, info};

use crate::{
    error::Error,
    token::{ProviderConfig, ProviderRegistry, TokenError, TokenSession},
};

//------------ SlotRangeSpec -------------------------------------------------

/// Which sessions to open against a token library.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlotRangeSpec {
    library: String,
    name: String,
    slot: Option<String>,
    start_index: Option<u32>,
    max_range: Option<u32>,
}

impl SlotRangeSpec {
    pub fn new(library: &str, name: &str) -> Self {
        SlotRangeSpec {
            library: library.to_string(),
            name: name.to_string(),
            slot: None,
            start_index: None,
            max_range: None,
        }
    }

    pub fn with_slot(mut self, slot: Option<&str>) -> Self {
        self.slot = slot.map(str::to_string);
        self
    }

    pub fn with_start_index(mut self, start_index: Option<u32>) -> Self {
        self.start_index = start_index;
        self
    }

    pub fn with_max_range(mut self, max_range: Option<u32>) -> Self {
        self.max_range = max_range;
        self
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> Option<&str> {
        self.slot.as_deref()
    }

    pub fn start_index(&self) -> Option<u32> {
        self.start_index
    }

    pub fn max_range(&self) -> Option<u32> {
        self.max_range
    }
}

//------------ SlotDiscoverer ------------------------------------------------

/// Opens either exactly one session, or every session in a contiguous range of slot list
/// indices up to the first index that cannot be opened.
#[derive(Debug)]
pub struct SlotDiscoverer {
    spec: SlotRangeSpec,
    registry: Arc<ProviderRegistry>,
    registered: RwLock<Vec<String>>,
}

impl SlotDiscoverer {
    pub fn new(spec: SlotRangeSpec, registry: Arc<ProviderRegistry>) -> Result<Self, Error> {
        let name: String = spec.name.chars().filter(|c| !c.is_whitespace()).collect();
        if name.is_empty() {
            return Err(Error::configuration("'name' must not be empty"));
        }

        if spec.slot.is_some() && (spec.start_index.is_some() || spec.max_range.is_some()) {
            return Err(Error::Configuration(format!(
                "Provider '{}' configures both a slot and a slot list index, use one or the other",
                name
            )));
        }

        let spec = SlotRangeSpec { name, ..spec };
        Ok(SlotDiscoverer {
            spec,
            registry,
            registered: RwLock::new(Vec::new()),
        })
    }

    pub fn spec(&self) -> &SlotRangeSpec {
        &self.spec
    }

    /// Opens the sessions described by the spec, in slot list index order.
    ///
    /// Asking for one specific session fails with [Error::ProviderLoad] if it cannot be opened.
    /// Probing a range never fails, it returns what could be opened before the first failure.
    ///
    /// Sessions registered by an earlier discovery are removed from the registry first, so
    /// that slots which have gone away since are no longer listed there.
    pub fn discover(&self) -> Result<Vec<Arc<dyn TokenSession>>, Error> {
        let mut registered = self.registered.write().unwrap();
        for name in registered.drain(..) {
            if self.registry.remove(&name).is_some() {
                debug!("[{}] Removed provider {}", self.spec.name, name);
            }
        }

        let sessions = match (self.spec.start_index, self.spec.max_range) {
            (None, None) => self.open_one(None)?,
            (Some(index), None) => self.open_one(Some(index))?,
            (start, Some(max_range)) => self.open_range(start.unwrap_or(0), max_range),
        };

        registered.extend(sessions.iter().map(|session| session.name().to_string()));
        Ok(sessions)
    }

    fn open_one(&self, index: Option<u32>) -> Result<Vec<Arc<dyn TokenSession>>, Error> {
        self.open(index).map(|session| vec![session]).map_err(|err| {
            Error::ProviderLoad(format!(
                "Failed to load the specified PKCS#11 provider '{}': {}",
                self.spec.name, err
            ))
        })
    }

    fn open_range(&self, start: u32, max_range: u32) -> Vec<Arc<dyn TokenSession>> {
        let mut sessions = Vec::new();
        let end = start.saturating_add(max_range);

        for index in start..end {
            match self.open(Some(index)) {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    info!(
                        "[{}] Slot list index {} not available ({}), stop probing",
                        self.spec.name, index, err
                    );
                    break;
                }
            }
        }

        info!(
            "[{}] Loaded {} out of a maximum of {} PKCS#11 slots",
            self.spec.name,
            sessions.len(),
            max_range
        );
        sessions
    }

    fn open(&self, index: Option<u32>) -> Result<Arc<dyn TokenSession>, TokenError> {
        let config = ProviderConfig::new(&self.spec.library, &self.provider_name(index))
            .with_slot(self.spec.slot.as_deref())
            .with_slot_list_index(index);

        self.registry.open(&config).map_err(|err| {
            error!(
                "Failed to open PKCS#11 session '{}' with slot list index {:?}: {}",
                config.name(),
                index,
                err
            );
            err
        })
    }

    /// Sessions opened as part of a range get the index appended to keep their names apart.
    fn provider_name(&self, index: Option<u32>) -> String {
        match (index, self.spec.max_range) {
            (Some(index), Some(_)) => format!("{}-{}", self.spec.name, index),
            _ => self.spec.name.clone(),
        }
    }
}

//------------ Tests ---------------------------------------------------------
