//! # parley-settings
//!
//! Layered configuration for the chat client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ParleySettings::default()`]
//! 2. **User file**: `~/.parley/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PARLEY_*` overrides (highest priority)
//!
//! ```no_run
//! let settings = parley_settings::load_settings().unwrap_or_default();
//! println!("typing idle window: {:?}", settings.typing.idle_timeout());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, read_settings_file,
    settings_path,
};
pub use types::*;
