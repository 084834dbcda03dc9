//! # nodelink-settings
//!
//! Layered configuration for the broker and the node.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`NodelinkSettings::default()`]
//! 2. **User file**: `~/.nodelink/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `NODELINK_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
