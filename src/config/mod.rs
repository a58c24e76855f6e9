//! Configuration for taskdeck.
//!
//! ## config.kdl - User-editable settings
//!
//! Located at `<config-dir>/config.kdl`, where `<config-dir>` is the first of:
//! - `--config-dir` (or any explicit directory the host passes)
//! - `TASKDECK_CONFIG_DIR`
//! - `~/.config/taskdeck` (platform config directory)
//! - `./.taskdeck`
//!
//! Contains window geometry, user preferences, the database URL and the
//! provider/model selection for each agent purpose. Comments and unknown
//! nodes survive every edit.
//!
//! ## .env - Local environment overrides
//!
//! A dotenv-format file in the working directory. It is read on every
//! settings lookup and never exported into the process environment.
//!
//! ## Precedence
//!
//! runtime override > process environment > .env > config.kdl > defaults
//!
//! Use [`SettingsProvider::instance`] (or [`global`]) for all reads; see the
//! [`resolver`] module.

pub mod document;
pub mod env;
pub mod resolver;
pub mod schema;

use std::sync::OnceLock;

pub use document::{DocumentStore, EditTransaction, LoadOutcome};
pub use env::{EnvLookup, ProcessEnv, TypedEnvironment};
pub use resolver::{
    AgentSettings, AgentsSettings, ConfigPaths, DatabaseSettings, Resolved, RuntimeOverrides,
    Settings, SettingsProvider, UserSettings, ValueSource, WindowSettings, mask_secret,
};
pub use schema::{AgentSelection, ConfigDocument, Theme};

use crate::{Error, Result};

static GLOBAL: OnceLock<SettingsProvider> = OnceLock::new();

/// Process-wide provider.
///
/// Uses the provider passed to [`install`] if one was installed first,
/// otherwise one over [`ConfigPaths::discover`].
pub fn global() -> &'static SettingsProvider {
    GLOBAL.get_or_init(|| SettingsProvider::new(ConfigPaths::discover(None)))
}

/// Install the process-wide provider. Fails once [`global`] has been used.
pub fn install(provider: SettingsProvider) -> Result<&'static SettingsProvider> {
    GLOBAL
        .set(provider)
        .map_err(|_| Error::InvalidInput("settings provider is already installed".to_string()))?;
    Ok(global())
}
