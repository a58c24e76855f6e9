//! Recognised environment variables and the typed snapshot built from them.
//!
//! [`ENV_VARS`] is the static registry: every variable taskdeck reads, with
//! its category, declared type, default and description. A
//! [`TypedEnvironment`] is resolved from that registry on demand:
//!
//! 1. Process environment (through an [`EnvLookup`])
//! 2. Local override file (dotenv format, e.g. `./.env`)
//! 3. Registry default
//!
//! Snapshots are never cached. Build a new one whenever a value is needed so
//! that changes to the environment are visible immediately.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

/// Database connection string.
pub const DATABASE_URL: &str = "DATABASE_URL";
/// API key for the OpenAI provider.
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
/// API key for the Anthropic provider.
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
/// API key for the Gemini provider.
pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
/// Base URL of a local Ollama server.
pub const OLLAMA_BASE_URL: &str = "OLLAMA_BASE_URL";
/// UI theme override.
pub const TASKDECK_THEME: &str = "TASKDECK_THEME";
/// Debug mode flag.
pub const TASKDECK_DEBUG: &str = "TASKDECK_DEBUG";
/// Disables remote LLM providers.
pub const TASKDECK_OFFLINE: &str = "TASKDECK_OFFLINE";
/// Timeout for a single agent request, in seconds.
pub const TASKDECK_AGENT_TIMEOUT_SECS: &str = "TASKDECK_AGENT_TIMEOUT_SECS";
/// Directory holding config.kdl.
pub const TASKDECK_CONFIG_DIR: &str = "TASKDECK_CONFIG_DIR";

/// Grouping used when listing variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvCategory {
    Database,
    Providers,
    Agents,
    User,
    Features,
    Paths,
}

impl EnvCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvCategory::Database => "database",
            EnvCategory::Providers => "providers",
            EnvCategory::Agents => "agents",
            EnvCategory::User => "user",
            EnvCategory::Features => "features",
            EnvCategory::Paths => "paths",
        }
    }
}

impl fmt::Display for EnvCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared type of a variable; raw strings are coerced to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvValueType {
    String,
    /// A string that must never be printed in full
    Secret,
    Bool,
    Integer,
    Path,
}

impl EnvValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvValueType::String => "string",
            EnvValueType::Secret => "secret",
            EnvValueType::Bool => "bool",
            EnvValueType::Integer => "integer",
            EnvValueType::Path => "path",
        }
    }
}

impl fmt::Display for EnvValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata for one recognised environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvVarDefinition {
    pub name: &'static str,
    pub category: EnvCategory,
    /// Missing required variables are reported as warnings, never as errors.
    pub required: bool,
    pub value_type: EnvValueType,
    pub default: Option<&'static str>,
    pub description: &'static str,
}

/// Every environment variable taskdeck reads.
///
/// Variables that also live in config.kdl (`DATABASE_URL`, `TASKDECK_THEME`)
/// have no default here, otherwise the document could never win.
pub static ENV_VARS: &[EnvVarDefinition] = &[
    EnvVarDefinition {
        name: DATABASE_URL,
        category: EnvCategory::Database,
        required: false,
        value_type: EnvValueType::String,
        default: None,
        description: "Database connection string (overrides database.url)",
    },
    EnvVarDefinition {
        name: OPENAI_API_KEY,
        category: EnvCategory::Providers,
        required: true,
        value_type: EnvValueType::Secret,
        default: None,
        description: "API key for the OpenAI provider",
    },
    EnvVarDefinition {
        name: ANTHROPIC_API_KEY,
        category: EnvCategory::Providers,
        required: false,
        value_type: EnvValueType::Secret,
        default: None,
        description: "API key for the Anthropic provider",
    },
    EnvVarDefinition {
        name: GEMINI_API_KEY,
        category: EnvCategory::Providers,
        required: false,
        value_type: EnvValueType::Secret,
        default: None,
        description: "API key for the Gemini provider",
    },
    EnvVarDefinition {
        name: OLLAMA_BASE_URL,
        category: EnvCategory::Providers,
        required: false,
        value_type: EnvValueType::String,
        default: Some("http://localhost:11434"),
        description: "Base URL of a local Ollama server",
    },
    EnvVarDefinition {
        name: TASKDECK_THEME,
        category: EnvCategory::User,
        required: false,
        value_type: EnvValueType::String,
        default: None,
        description: "UI theme: light, dark or system (overrides user.theme)",
    },
    EnvVarDefinition {
        name: TASKDECK_DEBUG,
        category: EnvCategory::Features,
        required: false,
        value_type: EnvValueType::Bool,
        default: Some("false"),
        description: "Enable debug behaviour",
    },
    EnvVarDefinition {
        name: TASKDECK_OFFLINE,
        category: EnvCategory::Features,
        required: false,
        value_type: EnvValueType::Bool,
        default: Some("false"),
        description: "Disable remote LLM providers",
    },
    EnvVarDefinition {
        name: TASKDECK_AGENT_TIMEOUT_SECS,
        category: EnvCategory::Agents,
        required: false,
        value_type: EnvValueType::Integer,
        default: Some("60"),
        description: "Timeout for a single agent request, in seconds",
    },
    EnvVarDefinition {
        name: TASKDECK_CONFIG_DIR,
        category: EnvCategory::Paths,
        required: false,
        value_type: EnvValueType::Path,
        default: None,
        description: "Directory holding config.kdl",
    },
];

/// Look up a variable's definition by name.
pub fn definition(name: &str) -> Option<&'static EnvVarDefinition> {
    ENV_VARS.iter().find(|def| def.name == name)
}

/// A coerced variable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TypedValue {
    String(String),
    Bool(bool),
    Integer(i64),
    Path(PathBuf),
}

impl TypedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            TypedValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            TypedValue::Path(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::String(s) => write!(f, "{}", s),
            TypedValue::Bool(b) => write!(f, "{}", b),
            TypedValue::Integer(i) => write!(f, "{}", i),
            TypedValue::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Where a resolved variable came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvOrigin {
    Process,
    File,
    Default,
}

/// A resolved variable and its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvValue {
    pub value: TypedValue,
    pub origin: EnvOrigin,
}

/// Source of raw environment values.
///
/// [`ProcessEnv`] reads the real process environment. Hosts that embed
/// taskdeck (and tests) can inject their own lookup.
pub trait EnvLookup: Send + Sync {
    /// Raw value of `name`, or `None` when unset.
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Parse a boolean flag, case-insensitive.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn coerce(value_type: EnvValueType, raw: &str) -> Option<TypedValue> {
    match value_type {
        EnvValueType::String | EnvValueType::Secret => Some(TypedValue::String(raw.to_string())),
        EnvValueType::Bool => parse_bool(raw).map(TypedValue::Bool),
        EnvValueType::Integer => raw.parse::<i64>().ok().map(TypedValue::Integer),
        EnvValueType::Path => Some(TypedValue::Path(PathBuf::from(raw))),
    }
}

fn default_value(def: &EnvVarDefinition) -> Option<EnvValue> {
    def.default
        .and_then(|raw| coerce(def.value_type, raw))
        .map(|value| EnvValue {
            value,
            origin: EnvOrigin::Default,
        })
}

fn resolve_definition(
    def: &EnvVarDefinition,
    raw: Option<(String, EnvOrigin)>,
) -> Option<EnvValue> {
    let Some((raw, origin)) = raw else {
        return default_value(def);
    };

    // An explicitly blank variable means "unset": no fallback to the default.
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    match coerce(def.value_type, trimmed) {
        Some(value) => Some(EnvValue { value, origin }),
        None => {
            warn!(
                event = "settings.env.invalid_value",
                name = def.name,
                expected = %def.value_type,
                "Ignoring environment value that does not match its declared type"
            );
            default_value(def)
        }
    }
}

/// Read a dotenv-style override file without touching the process environment.
///
/// A missing file is silent. An unreadable or malformed file is logged and
/// whatever parsed before the problem is kept.
fn read_env_file(path: &Path) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return vars,
        Err(e) => {
            warn!(
                event = "settings.env_file.unreadable",
                path = %path.display(),
                error = %e,
                "Ignoring unreadable environment override file"
            );
            return vars;
        }
    };

    for item in iter {
        match item {
            Ok((name, value)) => {
                vars.insert(name, value);
            }
            Err(e) => {
                warn!(
                    event = "settings.env_file.invalid_line",
                    path = %path.display(),
                    error = %e,
                    "Stopped reading environment override file at an invalid line"
                );
                break;
            }
        }
    }

    vars
}

/// One resolved, typed value per registered variable.
///
/// Construction never fails: a variable that cannot be resolved is simply
/// absent. Required variables without a value are listed in
/// [`missing_required`](Self::missing_required).
#[derive(Debug, Clone, Default)]
pub struct TypedEnvironment {
    values: HashMap<&'static str, EnvValue>,
    missing_required: Vec<&'static str>,
}

impl TypedEnvironment {
    /// Snapshot the process environment plus an optional override file.
    pub fn load(env_file: Option<&Path>) -> Self {
        Self::load_with(&ProcessEnv, env_file)
    }

    /// Snapshot an arbitrary environment plus an optional override file.
    pub fn load_with(lookup: &dyn EnvLookup, env_file: Option<&Path>) -> Self {
        let file_vars = env_file.map(read_env_file).unwrap_or_default();
        let mut snapshot = Self::default();

        for def in ENV_VARS {
            let raw = lookup
                .var(def.name)
                .map(|v| (v, EnvOrigin::Process))
                .or_else(|| file_vars.get(def.name).map(|v| (v.clone(), EnvOrigin::File)));

            match resolve_definition(def, raw) {
                Some(value) => {
                    snapshot.values.insert(def.name, value);
                }
                None if def.required => snapshot.missing_required.push(def.name),
                None => {}
            }
        }

        snapshot
    }

    /// Resolved value and origin for `name`.
    pub fn get(&self, name: &str) -> Option<&EnvValue> {
        self.values.get(name)
    }

    /// Resolved value for `name`; `None` means "unset" (or not registered).
    pub fn resolve(&self, name: &str) -> Option<TypedValue> {
        self.get(name).map(|v| v.value.clone())
    }

    pub fn string(&self, name: &str) -> Option<(&str, EnvOrigin)> {
        let v = self.get(name)?;
        v.value.as_str().map(|s| (s, v.origin))
    }

    pub fn bool(&self, name: &str) -> Option<(bool, EnvOrigin)> {
        let v = self.get(name)?;
        v.value.as_bool().map(|b| (b, v.origin))
    }

    pub fn integer(&self, name: &str) -> Option<(i64, EnvOrigin)> {
        let v = self.get(name)?;
        v.value.as_integer().map(|i| (i, v.origin))
    }

    pub fn path(&self, name: &str) -> Option<(&Path, EnvOrigin)> {
        let v = self.get(name)?;
        v.value.as_path().map(|p| (p, v.origin))
    }

    pub fn database_url(&self) -> Option<&str> {
        self.string(DATABASE_URL).map(|(s, _)| s)
    }

    pub fn openai_api_key(&self) -> Option<&str> {
        self.string(OPENAI_API_KEY).map(|(s, _)| s)
    }

    pub fn debug(&self) -> Option<bool> {
        self.bool(TASKDECK_DEBUG).map(|(b, _)| b)
    }

    pub fn offline(&self) -> Option<bool> {
        self.bool(TASKDECK_OFFLINE).map(|(b, _)| b)
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.path(TASKDECK_CONFIG_DIR).map(|(p, _)| p)
    }

    /// Required variables that resolved to nothing.
    pub fn missing_required(&self) -> &[&'static str] {
        &self.missing_required
    }

    /// Every registered variable with its resolved value, in registry order.
    pub fn entries(&self) -> impl Iterator<Item = (&'static EnvVarDefinition, Option<&EnvValue>)> {
        ENV_VARS.iter().map(|def| (def, self.values.get(def.name)))
    }
}
