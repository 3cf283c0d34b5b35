//! Relay settings: compiled defaults, an optional JSON file, then environment
//! overrides.

mod errors;
mod loader;
mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, parse_bool,
    parse_u16_range, parse_u64_range, relay_home, settings_path,
};
pub use types::*;
