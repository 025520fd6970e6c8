//! Embedded templates for boxrun files.

/// Default `boxrun.toml` configuration.
pub(crate) const BOXRUN_TOML: &str = include_str!("boxrun.toml");
