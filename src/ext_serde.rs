//! Defines helper methods for deserializing configuration values.

use std::{path::PathBuf, str::FromStr};

use log::LevelFilter;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, de};

pub fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

/// Trims the string, an empty string counts as absent.
pub fn de_opt_string<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let some = Option::<String>::deserialize(d)?;
    Ok(some.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
}

pub fn de_opt_path<'de, D>(d: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(de_opt_string(d)?.map(PathBuf::from))
}

/// Accepts a number or a string holding one, so that slots may be written either way.
pub fn de_opt_slot<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Slot {
        Number(u64),
        Text(String),
    }

    match Option::<Slot>::deserialize(d)? {
        None => Ok(None),
        Some(Slot::Number(nr)) => Ok(Some(nr.to_string())),
        Some(Slot::Text(text)) => Ok(Some(text.trim().to_string()).filter(|s| !s.is_empty())),
    }
}

pub fn de_opt_secret<'de, D>(d: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(de_opt_string(d)?.map(SecretString::new))
}
