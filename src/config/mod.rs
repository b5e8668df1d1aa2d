//! # Configuration Module
//!
//! Client configuration loading. Values come from, in increasing priority:
//! - built-in defaults
//! - configuration files (config/default.toml, config/{environment}.toml)
//! - environment variables (prefixed with APP__), with .env files loaded via dotenvy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chat_realtime::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Realtime endpoint: {}", settings.realtime.url);
//! ```

mod settings;

pub use settings::*;
