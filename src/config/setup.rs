use crate::core::{RestoreError, Result};
use std::path::PathBuf;

pub const ENV_NICE_ADJUSTMENT: &str = "NICE_ADJUSTMENT";
pub const ENV_IONICE_CLASS: &str = "IONICE_CLASS";
pub const ENV_IONICE_CLASS_DATA: &str = "IONICE_CLASS_DATA";

/// CPU scheduling priority applied to the transfer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NiceSettings {
    pub adjustment: i32,
}

/// I/O scheduling class applied to the transfer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoNiceSettings {
    pub class: u8,
    pub class_data: Option<u8>,
}

/// Host-independent options used to connect to a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOptions {
    /// Directory holding the repository credentials
    pub secret_dir: PathBuf,

    /// Scratch space for the transfer engine
    pub scratch_dir: PathBuf,

    /// Keep a local repository cache between runs
    pub enable_cache: bool,

    pub nice: Option<NiceSettings>,

    pub ionice: Option<IoNiceSettings>,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            secret_dir: PathBuf::from("/etc/repository/secret"),
            scratch_dir: PathBuf::from("/tmp"),
            enable_cache: true,
            nice: None,
            ionice: None,
        }
    }
}

impl SetupOptions {
    /// Apply nice/ionice settings from the process environment.
    pub fn with_env_priorities(self) -> Result<Self> {
        self.with_priorities_from(|key| std::env::var(key).ok())
    }

    /// Apply nice/ionice settings through an arbitrary variable lookup.
    pub fn with_priorities_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.nice = nice_settings_from(&lookup)?;
        self.ionice = ionice_settings_from(&lookup)?;
        Ok(self)
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn nice_settings_from<F>(lookup: &F) -> Result<Option<NiceSettings>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = non_empty(lookup, ENV_NICE_ADJUSTMENT) else {
        return Ok(None);
    };
    let adjustment = raw.parse::<i32>().map_err(|err| {
        RestoreError::Config(format!("invalid {ENV_NICE_ADJUSTMENT} '{raw}': {err}"))
    })?;
    if !(-20..=19).contains(&adjustment) {
        return Err(RestoreError::Config(format!(
            "{ENV_NICE_ADJUSTMENT} must be within -20..=19, got {adjustment}"
        )));
    }
    Ok(Some(NiceSettings { adjustment }))
}

fn ionice_settings_from<F>(lookup: &F) -> Result<Option<IoNiceSettings>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw_class) = non_empty(lookup, ENV_IONICE_CLASS) else {
        return Ok(None);
    };
    let class = raw_class.parse::<u8>().map_err(|err| {
        RestoreError::Config(format!("invalid {ENV_IONICE_CLASS} '{raw_class}': {err}"))
    })?;
    if class > 3 {
        return Err(RestoreError::Config(format!(
            "{ENV_IONICE_CLASS} must be within 0..=3, got {class}"
        )));
    }
    let class_data = match non_empty(lookup, ENV_IONICE_CLASS_DATA) {
        Some(raw) => {
            let data = raw.parse::<u8>().map_err(|err| {
                RestoreError::Config(format!("invalid {ENV_IONICE_CLASS_DATA} '{raw}': {err}"))
            })?;
            if data > 7 {
                return Err(RestoreError::Config(format!(
                    "{ENV_IONICE_CLASS_DATA} must be within 0..=7, got {data}"
                )));
            }
            Some(data)
        }
        None => None,
    };
    Ok(Some(IoNiceSettings { class, class_data }))
}
