//! Layered settings loading.
//!
//! Loading flow (later layers win):
//! 1. Compiled [`ChorusSettings::default()`]
//! 2. Optional JSON file (`--config` / `CHORUS_CONFIG`)
//! 3. `CHORUS_*` environment variables, `__` separating nested keys
//!    (`CHORUS_BROKER__URL`, `CHORUS_DELIVERY__LOG__BATCH_SIZE`)
//!
//! The merged result is validated before it is returned.

use std::path::Path;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::ChorusSettings;

/// Prefix of every settings environment variable.
pub const ENV_PREFIX: &str = "CHORUS_";

/// Build the provider stack without extracting it.
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(ChorusSettings::default()));
    if let Some(path) = path {
        figment = figment.merge(Json::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate settings.
///
/// An explicitly named file must exist; without one only defaults and the
/// environment are consulted.
pub fn load_settings(path: Option<&Path>) -> Result<ChorusSettings> {
    if let Some(path) = path {
        if !path.exists() {
            return Err(SettingsError::invalid(
                "config",
                format!("settings file {} does not exist", path.display()),
            ));
        }
        debug!(?path, "loading settings file");
    }
    let settings: ChorusSettings = figment(path).extract()?;
    settings.validate()?;
    Ok(settings)
}
