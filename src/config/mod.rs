//! Configuration — TOML-loaded settings with serde defaults.

pub mod settings;

pub use settings::Settings;
