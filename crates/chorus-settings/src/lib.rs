//! # chorus-settings
//!
//! Configuration for a chorus server process, constructed once at startup
//! and passed explicitly to the components that need it.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`ChorusSettings::default()`])
//! 2. **JSON file** named on the command line or by `CHORUS_CONFIG`
//! 3. **Environment variables** `CHORUS_*` (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{figment, load_settings, ENV_PREFIX};
pub use types::*;
