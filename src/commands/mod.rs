//! Command implementations for the taskdeck CLI.
//!
//! Each command reads through the [`SettingsProvider`] and returns a result
//! type that renders as JSON or as human-readable text.

use std::path::PathBuf;

use serde::Serialize;

use crate::Result;
use crate::cli::Section;
use crate::config::env::{EnvOrigin, EnvValueType};
use crate::config::{
    AgentsSettings, DatabaseSettings, LoadOutcome, Resolved, SettingsProvider, UserSettings,
    WindowSettings, mask_secret,
};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

fn line<T: std::fmt::Display>(out: &mut String, key: &str, resolved: &Resolved<T>) {
    out.push_str(&format!("{} = {} ({})\n", key, resolved.value, resolved.source));
}

// === show ===

#[derive(Serialize)]
pub struct ShowResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<AgentsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowSettings>,
}

impl Output for ShowResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = String::new();

        if let Some(agents) = &self.agents {
            for (purpose, selection) in &agents.purposes {
                line(&mut out, &format!("agents.{}.provider", purpose), &selection.provider);
                line(&mut out, &format!("agents.{}.model", purpose), &selection.model);
            }
            for (provider, key) in &agents.api_keys {
                out.push_str(&format!(
                    "api-key.{} = {} ({})\n",
                    provider,
                    mask_secret(&key.value),
                    key.source
                ));
            }
            line(&mut out, "agents.ollama-base-url", &agents.ollama_base_url);
            line(&mut out, "agents.offline", &agents.offline);
            line(&mut out, "agents.timeout-secs", &agents.timeout_secs);
        }

        if let Some(user) = &self.user {
            line(&mut out, "user.theme", &user.theme);
            line(&mut out, "user.language", &user.language);
            line(&mut out, "user.confirm-delete", &user.confirm_delete);
            line(&mut out, "user.debug", &user.debug);
        }

        if let Some(database) = &self.database {
            line(&mut out, "database.url", &database.url);
        }

        if let Some(window) = &self.window {
            out.push_str(&format!("window.width = {}\n", window.width));
            out.push_str(&format!("window.height = {}\n", window.height));
            if let Some(x) = window.x {
                out.push_str(&format!("window.x = {}\n", x));
            }
            if let Some(y) = window.y {
                out.push_str(&format!("window.y = {}\n", y));
            }
            out.push_str(&format!("window.maximized = {}\n", window.maximized));
        }

        out.trim_end().to_string()
    }
}

/// Resolve settings, optionally limited to one section.
pub fn show(provider: &SettingsProvider, section: Option<Section>) -> Result<ShowResult> {
    let settings = provider.instance()?;
    let wants = |s: Section| section.is_none_or(|only| only == s);

    Ok(ShowResult {
        agents: wants(Section::Agents).then(|| settings.agents_settings()),
        user: wants(Section::User).then(|| settings.user_settings()),
        database: wants(Section::Database).then(|| settings.database_settings()),
        window: wants(Section::Window).then(|| settings.window_settings()),
    })
}

// === get ===

#[derive(Serialize)]
pub struct GetResult {
    pub key: String,
    /// `None` when an optional setting is not stored
    pub value: Option<String>,
}

impl Output for GetResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match &self.value {
            Some(value) => format!("{} = {}", self.key, value),
            None => format!("{} is not set", self.key),
        }
    }
}

/// Read one value from config.kdl.
pub fn get(provider: &SettingsProvider, key: &str) -> Result<GetResult> {
    let value = provider.store()?.read().get(key)?;
    Ok(GetResult {
        key: key.to_string(),
        value: value.map(|v| v.to_string()),
    })
}

// === set ===

#[derive(Serialize)]
pub struct SetResult {
    pub key: String,
    pub previous: Option<String>,
    pub value: Option<String>,
    /// Whether config.kdl was rewritten
    pub changed: bool,
    pub document: PathBuf,
}

impl Output for SetResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "(unset)".to_string());
        if self.changed {
            format!(
                "{}: {} -> {}\nSaved {}",
                self.key,
                show(&self.previous),
                show(&self.value),
                self.document.display()
            )
        } else {
            format!("{} unchanged ({})", self.key, show(&self.value))
        }
    }
}

/// Write one value to config.kdl and invalidate cached settings.
pub fn set(provider: &SettingsProvider, key: &str, value: &str) -> Result<SetResult> {
    let store = provider.store()?;
    let previous = store.read().get(key)?.map(|v| v.to_string());
    let revision = store.revision();

    store.update(|doc| doc.set(key, value))?;
    provider.invalidate();

    Ok(SetResult {
        key: key.to_string(),
        previous,
        value: store.read().get(key)?.map(|v| v.to_string()),
        changed: store.revision() != revision,
        document: store.path().to_path_buf(),
    })
}

// === path ===

#[derive(Serialize)]
pub struct PathResult {
    pub config_dir: PathBuf,
    pub document: PathBuf,
    pub env_file: Option<PathBuf>,
    pub env_file_exists: bool,
    /// How the document was obtained: loaded, created or recovered
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

impl Output for PathResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!(
            "config dir: {}\ndocument:   {} ({})",
            self.config_dir.display(),
            self.document.display(),
            self.status
        );
        if let Some(backup) = &self.backup {
            out.push_str(&format!("\nbackup:     {}", backup.display()));
        }
        match &self.env_file {
            Some(path) if self.env_file_exists => {
                out.push_str(&format!("\nenv file:   {}", path.display()))
            }
            Some(path) => out.push_str(&format!("\nenv file:   {} (missing)", path.display())),
            None => out.push_str("\nenv file:   (none)"),
        }
        out
    }
}

/// Report where settings are read from.
pub fn path(provider: &SettingsProvider) -> Result<PathResult> {
    let store = provider.store()?;
    let paths = provider.paths();
    let (status, backup) = match store.last_load() {
        LoadOutcome::Loaded => ("loaded", None),
        LoadOutcome::Created => ("created", None),
        LoadOutcome::Recovered { backup, .. } => ("recovered", Some(backup)),
    };

    Ok(PathResult {
        config_dir: paths.config_dir().to_path_buf(),
        document: store.path().to_path_buf(),
        env_file: paths.env_file.clone(),
        env_file_exists: paths.env_file.as_ref().is_some_and(|p| p.exists()),
        status: status.to_string(),
        backup,
    })
}

// === env ===

#[derive(Serialize)]
pub struct EnvEntry {
    pub name: &'static str,
    pub category: String,
    pub value_type: EnvValueType,
    pub required: bool,
    /// Resolved value; secrets are masked
    pub value: Option<String>,
    pub origin: Option<EnvOrigin>,
    pub description: &'static str,
}

#[derive(Serialize)]
pub struct EnvResult {
    pub variables: Vec<EnvEntry>,
    pub missing_required: Vec<&'static str>,
}

impl Output for EnvResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = String::new();
        for entry in &self.variables {
            let value = match (&entry.value, entry.origin) {
                (Some(value), Some(origin)) => format!("{} ({})", value, origin_label(origin)),
                (Some(value), None) => value.clone(),
                (None, _) if entry.required => "(missing, required)".to_string(),
                (None, _) => "(unset)".to_string(),
            };
            out.push_str(&format!("{} = {}\n", entry.name, value));
        }
        out.trim_end().to_string()
    }
}

fn origin_label(origin: EnvOrigin) -> &'static str {
    match origin {
        EnvOrigin::Process => "process",
        EnvOrigin::File => "file",
        EnvOrigin::Default => "default",
    }
}

/// Snapshot every recognised environment variable.
pub fn env(provider: &SettingsProvider) -> Result<EnvResult> {
    let snapshot = provider.instance()?.environment();

    let variables = snapshot
        .entries()
        .map(|(def, value)| EnvEntry {
            name: def.name,
            category: def.category.to_string(),
            value_type: def.value_type,
            required: def.required,
            value: value.map(|v| {
                let shown = v.value.to_string();
                if def.value_type == EnvValueType::Secret {
                    mask_secret(&shown)
                } else {
                    shown
                }
            }),
            origin: value.map(|v| v.origin),
            description: def.description,
        })
        .collect();

    Ok(EnvResult {
        variables,
        missing_required: snapshot.missing_required().to_vec(),
    })
}
