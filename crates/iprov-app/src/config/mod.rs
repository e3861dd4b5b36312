//! Configuration file parsing for the provider
//!
//! Supports:
//! - `config.toml` - Backend, port pool, control floor, agent, stream and
//!   supervisor settings plus per-device overrides

pub mod settings;
pub mod types;

pub use settings::{load_settings, CONFIG_FILENAME};
pub use types::*;
