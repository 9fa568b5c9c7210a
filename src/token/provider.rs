use std::{fmt, fs, path::Path, str::FromStr};

use crate::error::Error;

//------------ ProviderConfig ------------------------------------------------

/// The settings used to open one session against a token library.
///
/// Renders to, and parses from, the line based configuration text understood by token libraries:
///
/// ```text
/// library=/usr/lib/softhsm/libsofthsm2.so
/// name=MyHsm-0
/// slotListIndex=0
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderConfig {
    library: String,
    name: String,
    slot: Option<String>,
    slot_list_index: Option<u32>,
}

impl ProviderConfig {
    pub fn new(library: &str, name: &str) -> Self {
        ProviderConfig {
            library: library.to_string(),
            name: name.to_string(),
            slot: None,
            slot_list_index: None,
        }
    }

    pub fn with_slot(mut self, slot: Option<&str>) -> Self {
        self.slot = slot.map(str::to_string);
        self
    }

    pub fn with_slot_list_index(mut self, index: Option<u32>) -> Self {
        self.slot_list_index = index;
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

    pub fn slot_list_index(&self) -> Option<u32> {
        self.slot_list_index
    }

    pub fn to_config_text(&self) -> String {
        let mut text = format!("library={}\nname={}\n", self.library, self.name);
        if let Some(slot) = &self.slot {
            text.push_str(&format!("slot={}\n", slot));
        }
        if let Some(index) = self.slot_list_index {
            text.push_str(&format!("slotListIndex={}\n", index));
        }
        text
    }

    /// Reads an externally provided configuration file.
    pub fn read(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::ProviderLoad(format!("Cannot read provider configuration '{}': {}", path.display(), e))
        })?;
        ProviderConfig::from_str(&text)
            .map_err(|e| Error::ProviderLoad(format!("Invalid provider configuration '{}': {}", path.display(), e)))
    }
}

impl fmt::Display for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "library='{}', name='{}', slot='{}', slotListIndex='{}'",
            self.library,
            self.name,
            self.slot.as_deref().unwrap_or("none"),
            self.slot_list_index.map(|i| i.to_string()).unwrap_or_else(|| "none".to_string())
        )
    }
}

impl FromStr for ProviderConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut library = None;
        let mut name = None;
        let mut slot = None;
        let mut slot_list_index = None;

        for (nr, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected 'key = value'", nr + 1))?;
            let value = value.trim().to_string();

            match key.trim() {
                "library" => library = Some(value),
                "name" => name = Some(value),
                "slot" => slot = Some(value),
                "slotListIndex" => {
                    let index = value
                        .parse::<u32>()
                        .map_err(|_| format!("line {}: invalid slotListIndex '{}'", nr + 1, value))?;
                    slot_list_index = Some(index);
                }
                other => return Err(format!("line {}: unsupported setting '{}'", nr + 1, other)),
            }
        }

        Ok(ProviderConfig {
            library: library.ok_or("missing 'library'")?,
            name: name.ok_or("missing 'name'")?,
            slot,
            slot_list_index,
        })
    }
}

//------------ Tests ---------------------------------------------------------
