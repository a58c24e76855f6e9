//! Unified precedence resolution for settings.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Runtime overrides supplied by the host ([`RuntimeOverrides`])
//! 2. Environment: process variables, then the local `.env` file
//! 3. config.kdl
//! 4. Registry and built-in defaults
//!
//! [`Settings`] is the read path for every consumer. It never caches resolved
//! values: each projection takes a fresh environment snapshot and reads the
//! current document, so an exported variable is visible on the next call.
//! [`SettingsProvider`] owns the façade's lifecycle (lazy construction,
//! explicit invalidation).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::Result;
use crate::config::document::DocumentStore;
use crate::config::env::{
    self, EnvLookup, EnvOrigin, ProcessEnv, TypedEnvironment, ANTHROPIC_API_KEY,
    GEMINI_API_KEY, OLLAMA_BASE_URL, OPENAI_API_KEY,
};
use crate::config::schema::{
    AgentSelection, BUILTIN_PURPOSES, ConfigDocument, Theme, builtin_selection,
};

/// File name of the persisted document inside the config directory.
pub const DOCUMENT_FILE_NAME: &str = "config.kdl";

/// Default local override file, relative to the working directory.
pub const DEFAULT_ENV_FILE: &str = ".env";

const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 60;

/// Provider name to the variable holding its API key.
const PROVIDER_KEYS: &[(&str, &str)] = &[
    ("anthropic", ANTHROPIC_API_KEY),
    ("gemini", GEMINI_API_KEY),
    ("openai", OPENAI_API_KEY),
];

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Runtime override supplied by the host
    Override,
    /// Process environment variable
    Env(String),
    /// Local `.env` override file
    EnvFile(String),
    /// config.kdl
    Document,
    /// Registry or built-in default
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::Override => write!(f, "override"),
            ValueSource::Env(name) => write!(f, "env:{}", name),
            ValueSource::EnvFile(name) => write!(f, "env-file:{}", name),
            ValueSource::Document => write!(f, "document"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

impl Serialize for ValueSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl ValueSource {
    fn from_env(name: &str, origin: EnvOrigin) -> Self {
        match origin {
            EnvOrigin::Process => ValueSource::Env(name.to_string()),
            EnvOrigin::File => ValueSource::EnvFile(name.to_string()),
            EnvOrigin::Default => ValueSource::Default,
        }
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    /// Create a new resolved value.
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Pick the highest-precedence value for one field.
///
/// An environment value that only came from the registry default ranks
/// below the document.
fn resolve_field<T>(
    overridden: Option<T>,
    env: Option<(T, EnvOrigin)>,
    env_name: &str,
    document: Option<T>,
    fallback: impl FnOnce() -> T,
) -> Resolved<T> {
    if let Some(value) = overridden {
        return Resolved::new(value, ValueSource::Override);
    }

    let registry_default = match env {
        Some((value, EnvOrigin::Default)) => Some(value),
        Some((value, origin)) => {
            return Resolved::new(value, ValueSource::from_env(env_name, origin));
        }
        None => None,
    };

    if let Some(value) = document {
        return Resolved::new(value, ValueSource::Document);
    }

    Resolved::new(registry_default.unwrap_or_else(fallback), ValueSource::Default)
}

/// Mask a secret for display, keeping at most four characters at each end.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        let head: String = chars.iter().take(4.min(chars.len() / 2)).collect();
        format!("{}...", head)
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

/// Runtime overrides, the highest precedence tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeOverrides {
    pub database_url: Option<String>,
    pub theme: Option<Theme>,
    pub language: Option<String>,
    pub debug: Option<bool>,
    pub offline: Option<bool>,
    /// Purpose to provider/model selection
    pub agents: BTreeMap<String, AgentSelection>,
    /// Provider name to API key
    pub api_keys: BTreeMap<String, String>,
}

impl RuntimeOverrides {
    /// Create empty overrides.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_theme(mut self, theme: Theme) -> Self {
        self.theme = Some(theme);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = Some(offline);
        self
    }

    /// Select the provider and model used for one agent purpose.
    pub fn with_agent(
        mut self,
        purpose: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.agents
            .insert(purpose.into(), AgentSelection::new(provider, model));
        self
    }

    pub fn with_api_key(mut self, provider: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider.into(), key.into());
        self
    }

    /// Whether no override is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Provider and model resolved for one agent purpose.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSettings {
    pub provider: Resolved<String>,
    pub model: Resolved<String>,
}

/// Everything the agent layer reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentsSettings {
    /// Purpose to selection; always includes the built-in purposes
    pub purposes: BTreeMap<String, AgentSettings>,
    /// Provider name to API key, for providers that have one
    #[serde(serialize_with = "serialize_masked")]
    pub api_keys: BTreeMap<String, Resolved<String>>,
    pub ollama_base_url: Resolved<String>,
    pub offline: Resolved<bool>,
    pub timeout_secs: Resolved<u64>,
}

impl AgentsSettings {
    pub fn purpose(&self, purpose: &str) -> Option<&AgentSettings> {
        self.purposes.get(purpose)
    }

    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.api_keys.get(provider).map(|r| r.value.as_str())
    }
}

fn serialize_masked<S: Serializer>(
    keys: &BTreeMap<String, Resolved<String>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let masked: BTreeMap<&str, Resolved<String>> = keys
        .iter()
        .map(|(provider, key)| {
            (
                provider.as_str(),
                Resolved::new(mask_secret(&key.value), key.source.clone()),
            )
        })
        .collect();
    masked.serialize(serializer)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSettings {
    pub theme: Resolved<Theme>,
    pub language: Resolved<String>,
    pub confirm_delete: Resolved<bool>,
    pub debug: Resolved<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseSettings {
    pub url: Resolved<String>,
}

/// Window geometry. Only the document holds these values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowSettings {
    pub width: u32,
    pub height: u32,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub maximized: bool,
}

/// Read-only settings façade.
///
/// Obtain one from [`SettingsProvider::instance`]. Projections are computed
/// per call from the current overrides, a fresh environment snapshot and the
/// store's canonical document.
pub struct Settings {
    store: Arc<DocumentStore>,
    overrides: RuntimeOverrides,
    env: Arc<dyn EnvLookup>,
    env_file: Option<PathBuf>,
    generation: u64,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("document", &self.store.path())
            .field("env_file", &self.env_file)
            .field("overrides", &self.overrides)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Settings {
    /// Build a façade directly over a store, bypassing the provider.
    pub fn new(
        store: Arc<DocumentStore>,
        overrides: RuntimeOverrides,
        env: Arc<dyn EnvLookup>,
        env_file: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            overrides,
            env,
            env_file,
            generation: 0,
        }
    }

    /// Fresh snapshot of the environment tier.
    pub fn environment(&self) -> TypedEnvironment {
        TypedEnvironment::load_with(self.env.as_ref(), self.env_file.as_deref())
    }

    /// Current canonical document.
    pub fn document(&self) -> ConfigDocument {
        self.store.read()
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn overrides(&self) -> &RuntimeOverrides {
        &self.overrides
    }

    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }

    /// Provider generation this façade was built for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn agents_settings(&self) -> AgentsSettings {
        let snapshot = self.environment();
        let document = self.document();

        let mut names: Vec<&str> = BUILTIN_PURPOSES.to_vec();
        names.extend(document.agents.keys().map(String::as_str));
        names.extend(self.overrides.agents.keys().map(String::as_str));
        names.sort_unstable();
        names.dedup();

        let purposes = names
            .into_iter()
            .map(|purpose| {
                let (selection, source) = if let Some(s) = self.overrides.agents.get(purpose) {
                    (s.clone(), ValueSource::Override)
                } else if let Some(s) = document.agents.get(purpose) {
                    (s.clone(), ValueSource::Document)
                } else {
                    (builtin_selection(purpose).unwrap_or_default(), ValueSource::Default)
                };
                let settings = AgentSettings {
                    provider: Resolved::new(selection.provider, source.clone()),
                    model: Resolved::new(selection.model, source),
                };
                (purpose.to_string(), settings)
            })
            .collect();

        let mut api_keys = BTreeMap::new();
        for (provider, var) in PROVIDER_KEYS {
            let resolved = if let Some(key) = self.overrides.api_keys.get(*provider) {
                Some(Resolved::new(key.clone(), ValueSource::Override))
            } else {
                snapshot.string(var).map(|(key, origin)| {
                    Resolved::new(key.to_string(), ValueSource::from_env(var, origin))
                })
            };
            if let Some(resolved) = resolved {
                api_keys.insert(provider.to_string(), resolved);
            }
        }

        let timeout_env = snapshot
            .integer(env::TASKDECK_AGENT_TIMEOUT_SECS)
            .and_then(|(secs, origin)| match u64::try_from(secs) {
                Ok(secs) => Some((secs, origin)),
                Err(_) => {
                    warn!(
                        event = "settings.env.invalid_value",
                        name = env::TASKDECK_AGENT_TIMEOUT_SECS,
                        value = secs,
                        "Ignoring negative agent timeout"
                    );
                    None
                }
            });

        AgentsSettings {
            purposes,
            api_keys,
            ollama_base_url: resolve_field(
                None,
                snapshot.string(OLLAMA_BASE_URL).map(|(url, origin)| (url.to_string(), origin)),
                OLLAMA_BASE_URL,
                None,
                || DEFAULT_OLLAMA_BASE_URL.to_string(),
            ),
            offline: resolve_field(
                self.overrides.offline,
                snapshot.bool(env::TASKDECK_OFFLINE),
                env::TASKDECK_OFFLINE,
                None,
                || false,
            ),
            timeout_secs: resolve_field(
                None,
                timeout_env,
                env::TASKDECK_AGENT_TIMEOUT_SECS,
                None,
                || DEFAULT_AGENT_TIMEOUT_SECS,
            ),
        }
    }

    pub fn user_settings(&self) -> UserSettings {
        let snapshot = self.environment();
        let document = self.document();

        let theme_env = snapshot
            .string(env::TASKDECK_THEME)
            .and_then(|(raw, origin)| match Theme::parse(raw) {
                Some(theme) => Some((theme, origin)),
                None => {
                    warn!(
                        event = "settings.env.invalid_value",
                        name = env::TASKDECK_THEME,
                        value = raw,
                        "Ignoring unknown theme"
                    );
                    None
                }
            });

        UserSettings {
            theme: resolve_field(
                self.overrides.theme,
                theme_env,
                env::TASKDECK_THEME,
                Some(document.user.theme),
                Theme::default,
            ),
            language: resolve_field(
                self.overrides.language.clone(),
                None,
                "",
                Some(document.user.language),
                || "en".to_string(),
            ),
            confirm_delete: resolve_field(
                None,
                None,
                "",
                Some(document.user.confirm_delete),
                || true,
            ),
            debug: resolve_field(
                self.overrides.debug,
                snapshot.bool(env::TASKDECK_DEBUG),
                env::TASKDECK_DEBUG,
                None,
                || false,
            ),
        }
    }

    pub fn database_settings(&self) -> DatabaseSettings {
        let snapshot = self.environment();
        let document = self.document();

        DatabaseSettings {
            url: resolve_field(
                self.overrides.database_url.clone(),
                snapshot
                    .string(env::DATABASE_URL)
                    .map(|(url, origin)| (url.to_string(), origin)),
                env::DATABASE_URL,
                Some(document.database.url),
                || crate::config::schema::DEFAULT_DATABASE_URL.to_string(),
            ),
        }
    }

    pub fn window_settings(&self) -> WindowSettings {
        let window = self.document().window;
        WindowSettings {
            width: window.width,
            height: window.height,
            x: window.x,
            y: window.y,
            maximized: window.maximized,
        }
    }
}

/// Locations of the persisted document and the local override file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub document: PathBuf,
    pub env_file: Option<PathBuf>,
}

impl ConfigPaths {
    /// Document at `document`, no override file.
    pub fn new(document: impl Into<PathBuf>) -> Self {
        Self {
            document: document.into(),
            env_file: None,
        }
    }

    pub fn with_env_file(mut self, env_file: impl Into<PathBuf>) -> Self {
        self.env_file = Some(env_file.into());
        self
    }

    /// Standard locations.
    ///
    /// The config directory is, in order: `explicit_dir`,
    /// `TASKDECK_CONFIG_DIR`, the platform config directory, `./.taskdeck`.
    /// The override file is `./.env`.
    pub fn discover(explicit_dir: Option<&Path>) -> Self {
        let env_file = PathBuf::from(DEFAULT_ENV_FILE);
        let dir = match explicit_dir {
            Some(dir) => dir.to_path_buf(),
            None => TypedEnvironment::load(Some(&env_file))
                .config_dir()
                .map(Path::to_path_buf)
                .or_else(|| dirs::config_dir().map(|d| d.join("taskdeck")))
                .unwrap_or_else(|| PathBuf::from(".taskdeck")),
        };
        Self::new(dir.join(DOCUMENT_FILE_NAME)).with_env_file(env_file)
    }

    /// Directory holding the document.
    pub fn config_dir(&self) -> &Path {
        self.document.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Owner of the settings façade lifecycle.
///
/// [`instance`](Self::instance) constructs the façade on first use and
/// returns the same `Arc` until [`invalidate`](Self::invalidate) drops it.
/// Handles returned earlier stay valid; they keep reading through the
/// shared document store.
pub struct SettingsProvider {
    paths: ConfigPaths,
    env: Arc<dyn EnvLookup>,
    overrides: Mutex<RuntimeOverrides>,
    current: Mutex<Option<Arc<Settings>>>,
    store: Mutex<Option<Arc<DocumentStore>>>,
    /// Set by `invalidate`; the next build re-reads the document from disk
    stale: AtomicBool,
    generation: AtomicU64,
}

impl std::fmt::Debug for SettingsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsProvider")
            .field("paths", &self.paths)
            .field("generation", &self.generation())
            .finish()
    }
}

impl SettingsProvider {
    /// Provider over `paths`, reading the real process environment.
    pub fn new(paths: ConfigPaths) -> Self {
        Self {
            paths,
            env: Arc::new(ProcessEnv),
            overrides: Mutex::new(RuntimeOverrides::default()),
            current: Mutex::new(None),
            store: Mutex::new(None),
            stale: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Read environment variables from `env` instead of the process.
    pub fn with_env(mut self, env: impl EnvLookup + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn with_overrides(self, overrides: RuntimeOverrides) -> Self {
        *lock(&self.overrides) = overrides;
        self
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Current façade, building it if needed.
    pub fn instance(&self) -> Result<Arc<Settings>> {
        let mut current = lock(&self.current);
        if let Some(settings) = current.as_ref() {
            return Ok(Arc::clone(settings));
        }

        let store = self.store()?;
        if self.stale.load(Ordering::SeqCst) {
            // Stays stale until a reload succeeds.
            match store.reload() {
                Ok(_) => self.stale.store(false, Ordering::SeqCst),
                Err(e) => warn!(
                    event = "settings.document.reload_failed",
                    path = %store.path().display(),
                    error = %e,
                    "Keeping the in-memory document"
                ),
            }
        }

        let settings = Settings {
            store,
            overrides: lock(&self.overrides).clone(),
            env: Arc::clone(&self.env),
            env_file: self.paths.env_file.clone(),
            generation: self.generation(),
        };

        for name in settings.environment().missing_required() {
            warn!(
                event = "settings.env.required_missing",
                name = *name,
                "Required environment variable is not set"
            );
        }

        let settings = Arc::new(settings);
        *current = Some(Arc::clone(&settings));
        debug!(event = "settings.instance.built", generation = settings.generation);
        Ok(settings)
    }

    /// Drop the cached façade. The next [`instance`](Self::instance)
    /// re-reads the document and takes a new generation.
    pub fn invalidate(&self) {
        let mut current = lock(&self.current);
        *current = None;
        self.stale.store(true, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(event = "settings.instance.invalidated", generation);
    }

    /// Replace the runtime overrides and invalidate.
    pub fn set_overrides(&self, overrides: RuntimeOverrides) {
        *lock(&self.overrides) = overrides;
        self.invalidate();
    }

    /// Number of invalidations so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Shared document store, opened on first use.
    pub fn store(&self) -> Result<Arc<DocumentStore>> {
        let mut store = lock(&self.store);
        if let Some(store) = store.as_ref() {
            return Ok(Arc::clone(store));
        }
        let opened = Arc::new(DocumentStore::open(&self.paths.document)?);
        *store = Some(Arc::clone(&opened));
        Ok(opened)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env::{DATABASE_URL, TASKDECK_CONFIG_DIR, TASKDECK_DEBUG, TASKDECK_THEME};
    use crate::test_utils::{MapEnv, TestEnv};
    use serial_test::serial;

    const DOC_A: &str = r#"database {
    url "sqlite:///a.db"
}
user {
    theme "light"
    language "de"
}
agents {
    summary {
        provider "ollama"
        model "llama3"
    }
}
"#;

    // ==================== ValueSource Tests ====================

    #[test]
    fn test_value_source_display() {
        assert_eq!(ValueSource::Override.to_string(), "override");
        assert_eq!(ValueSource::Env("FOO".to_string()).to_string(), "env:FOO");
        assert_eq!(
            ValueSource::EnvFile("FOO".to_string()).to_string(),
            "env-file:FOO"
        );
        assert_eq!(ValueSource::Document.to_string(), "document");
        assert_eq!(ValueSource::Default.to_string(), "default");
    }

    #[test]
    fn test_value_source_serializes_as_string() {
        let resolved = Resolved::new(true, ValueSource::Env("X".into()));
        let json = serde_json::to_string(&resolved).unwrap();
        assert_eq!(json, r#"{"value":true,"source":"env:X"}"#);
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk-abcdefghijklmnop"), "sk-a...mnop");
        assert_eq!(mask_secret("short"), "sh...");
        assert_eq!(mask_secret(""), "...");
    }

    // ==================== Precedence Tests ====================

    #[test]
    fn test_database_url_from_document() {
        let env = TestEnv::new();
        env.write_document(DOC_A);

        let settings = env.provider().instance().unwrap();
        let db = settings.database_settings();

        assert_eq!(db.url.value, "sqlite:///a.db");
        assert_eq!(db.url.source, ValueSource::Document);
    }

    #[test]
    fn test_env_file_beats_document_and_process_beats_env_file() {
        let env = TestEnv::new();
        env.write_document(DOC_A);
        env.write_env_file("DATABASE_URL=sqlite:///b.db\n");

        let settings = env.provider().instance().unwrap();
        let url = settings.database_settings().url;
        assert_eq!(url.value, "sqlite:///b.db");
        assert_eq!(url.source, ValueSource::EnvFile(DATABASE_URL.to_string()));

        // Same façade, no rebuild.
        env.env.set(DATABASE_URL, "postgres://c");
        let url = settings.database_settings().url;
        assert_eq!(url.value, "postgres://c");
        assert_eq!(url.source, ValueSource::Env(DATABASE_URL.to_string()));
    }

    #[test]
    fn test_override_beats_everything() {
        let env = TestEnv::new();
        env.write_document(DOC_A);
        env.write_env_file("DATABASE_URL=sqlite:///b.db\n");
        env.env.set(DATABASE_URL, "postgres://c");

        let provider = env
            .provider()
            .with_overrides(RuntimeOverrides::new().with_database_url("sqlite:///d.db"));
        let url = provider.instance().unwrap().database_settings().url;

        assert_eq!(url.value, "sqlite:///d.db");
        assert_eq!(url.source, ValueSource::Override);
    }

    #[test]
    fn test_blank_env_value_falls_through_to_document() {
        let env = TestEnv::new();
        env.write_document(DOC_A);
        env.env.set(DATABASE_URL, "   ");

        let url = env.provider().instance().unwrap().database_settings().url;

        assert_eq!(url.value, "sqlite:///a.db");
        assert_eq!(url.source, ValueSource::Document);
    }

    #[test]
    fn test_user_settings_precedence() {
        let env = TestEnv::new();
        env.write_document(DOC_A);
        env.env.set(TASKDECK_THEME, "dark");
        env.env.set(TASKDECK_DEBUG, "yes");

        let provider = env.provider();
        let user = provider.instance().unwrap().user_settings();
        assert_eq!(user.theme.value, Theme::Dark);
        assert_eq!(user.theme.source, ValueSource::Env(TASKDECK_THEME.to_string()));
        assert_eq!(user.language.value, "de");
        assert_eq!(user.language.source, ValueSource::Document);
        assert!(user.confirm_delete.value);
        assert!(user.debug.value);

        provider.set_overrides(RuntimeOverrides::new().with_theme(Theme::Light).with_debug(false));
        let user = provider.instance().unwrap().user_settings();
        assert_eq!(user.theme.value, Theme::Light);
        assert_eq!(user.theme.source, ValueSource::Override);
        assert!(!user.debug.value);
    }

    #[test]
    fn test_invalid_env_theme_is_ignored() {
        let env = TestEnv::new();
        env.write_document(DOC_A);
        env.env.set(TASKDECK_THEME, "neon");

        let theme = env.provider().instance().unwrap().user_settings().theme;

        assert_eq!(theme.value, Theme::Light);
        assert_eq!(theme.source, ValueSource::Document);
    }

    #[test]
    fn test_registry_defaults_rank_below_document_but_apply() {
        let env = TestEnv::new();

        let agents = env.provider().instance().unwrap().agents_settings();

        assert_eq!(agents.ollama_base_url.value, "http://localhost:11434");
        assert_eq!(agents.ollama_base_url.source, ValueSource::Default);
        assert!(!agents.offline.value);
        assert_eq!(agents.timeout_secs.value, 60);
    }

    #[test]
    fn test_agents_settings_merge_purposes() {
        let env = TestEnv::new();
        env.write_document(DOC_A);
        env.env.set(OPENAI_API_KEY, "sk-from-process-env");

        let provider = env.provider().with_overrides(
            RuntimeOverrides::new()
                .with_agent("triage", "anthropic", "claude-3-haiku")
                .with_api_key("anthropic", "ak-override"),
        );
        let agents = provider.instance().unwrap().agents_settings();

        let one_liner = agents.purpose("one-liner").unwrap();
        assert_eq!(one_liner.model.value, "gpt-4o-mini");
        assert_eq!(one_liner.model.source, ValueSource::Default);

        let summary = agents.purpose("summary").unwrap();
        assert_eq!(summary.provider.value, "ollama");
        assert_eq!(summary.model.source, ValueSource::Document);

        let triage = agents.purpose("triage").unwrap();
        assert_eq!(triage.provider.value, "anthropic");
        assert_eq!(triage.provider.source, ValueSource::Override);

        assert_eq!(agents.api_key("openai"), Some("sk-from-process-env"));
        assert_eq!(agents.api_key("anthropic"), Some("ak-override"));
        assert_eq!(agents.api_key("gemini"), None);
    }

    #[test]
    fn test_api_keys_are_masked_when_serialized() {
        let env = TestEnv::new();
        env.env.set(OPENAI_API_KEY, "sk-abcdefghijklmnop");

        let agents = env.provider().instance().unwrap().agents_settings();
        let json = serde_json::to_string(&agents).unwrap();

        assert!(!json.contains("sk-abcdefghijklmnop"));
        assert!(json.contains("sk-a...mnop"));
    }

    #[test]
    fn test_window_settings_come_from_document() {
        let env = TestEnv::new();
        env.write_document("window {\n    width 640\n    y -20\n}\n");

        let window = env.provider().instance().unwrap().window_settings();

        assert_eq!(window.width, 640);
        assert_eq!(window.height, 800);
        assert_eq!(window.y, Some(-20));
    }

    #[test]
    #[serial]
    fn test_process_environment_change_is_visible_immediately() {
        // SAFETY: We're in a test environment and this test runs serially
        unsafe { std::env::remove_var(DATABASE_URL) };

        let env = TestEnv::new();
        env.write_document(DOC_A);
        env.write_env_file("DATABASE_URL=sqlite:///b.db\n");
        let provider = SettingsProvider::new(env.paths());
        let settings = provider.instance().unwrap();

        assert_eq!(settings.database_settings().url.value, "sqlite:///b.db");

        unsafe { std::env::set_var(DATABASE_URL, "postgres://c") };
        let url = settings.database_settings().url;
        unsafe { std::env::remove_var(DATABASE_URL) };

        assert_eq!(url.value, "postgres://c");
        assert_eq!(url.source, ValueSource::Env(DATABASE_URL.to_string()));
    }

    // ==================== Lifecycle Tests ====================

    #[test]
    fn test_instance_is_shared_until_invalidated() {
        let env = TestEnv::new();
        let provider = env.provider();

        let first = provider.instance().unwrap();
        let second = provider.instance().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.generation(), 0);

        provider.invalidate();
        let third = provider.instance().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.generation(), 1);
        assert_eq!(provider.generation(), 1);
    }

    #[test]
    fn test_invalidate_rereads_document_from_disk() {
        let env = TestEnv::new();
        let provider = env.provider();
        let settings = provider.instance().unwrap();
        assert_eq!(settings.user_settings().theme.value, Theme::System);

        env.write_document("user {\n    theme \"dark\"\n}\n");
        assert_eq!(settings.user_settings().theme.value, Theme::System);

        provider.invalidate();
        let theme = provider.instance().unwrap().user_settings().theme;
        assert_eq!(theme.value, Theme::Dark);
    }

    #[test]
    fn test_edits_through_store_are_visible() {
        let env = TestEnv::new();
        let provider = env.provider();
        let store = provider.store().unwrap();

        store
            .update(|doc| {
                doc.user.language = "fr".to_string();
                Ok(())
            })
            .unwrap();

        let settings = provider.instance().unwrap();
        assert!(Arc::ptr_eq(settings.store(), &store));
        assert_eq!(settings.user_settings().language.value, "fr");
    }

    #[test]
    fn test_concurrent_instance_builds_once() {
        let env = TestEnv::new();
        let provider = Arc::new(env.provider());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = Arc::clone(&provider);
                std::thread::spawn(move || provider.instance().unwrap())
            })
            .collect();
        let instances: Vec<Arc<Settings>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        for instance in &instances[1..] {
            assert!(Arc::ptr_eq(&instances[0], instance));
        }
    }

    #[test]
    fn test_failed_reload_keeps_provider_stale() {
        let env = TestEnv::new();
        let provider = env.provider();
        let store = provider.store().unwrap();
        provider.instance().unwrap();

        let txn = store.edit().unwrap();
        provider.invalidate();
        provider.instance().unwrap();
        assert!(provider.stale.load(Ordering::SeqCst));
        drop(txn);

        env.write_document("user {\n    theme \"dark\"\n}\n");
        provider.invalidate();
        let theme = provider.instance().unwrap().user_settings().theme;
        assert_eq!(theme.value, Theme::Dark);
        assert!(!provider.stale.load(Ordering::SeqCst));
    }

    // ==================== Logging Tests ====================

    /// Shared buffer the fmt layer writes JSON lines into.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&lock(&self.0)).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn build_with_captured_logs(env: &TestEnv) -> String {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::with_default(subscriber, || env.provider().instance().unwrap());
        logs.contents()
    }

    #[test]
    fn test_missing_required_variable_is_logged() {
        let env = TestEnv::new();
        let logs = build_with_captured_logs(&env);
        assert!(logs.contains("settings.env.required_missing"), "{logs}");
        assert!(logs.contains(OPENAI_API_KEY), "{logs}");
    }

    #[test]
    fn test_present_required_variable_is_not_logged() {
        let env = TestEnv::new();
        env.env.set(OPENAI_API_KEY, "sk-test");
        let logs = build_with_captured_logs(&env);
        assert!(!logs.contains("settings.env.required_missing"), "{logs}");
    }

    #[test]
    fn test_live_map_env_is_shared_with_provider() {
        let map = MapEnv::new();
        let env = TestEnv::new();
        let provider = SettingsProvider::new(env.paths()).with_env(map.clone());
        let settings = provider.instance().unwrap();

        map.set(TASKDECK_DEBUG, "on");
        assert!(settings.user_settings().debug.value);
        map.remove(TASKDECK_DEBUG);
        assert!(!settings.user_settings().debug.value);
    }

    // ==================== Path Tests ====================

    #[test]
    fn test_discover_prefers_explicit_dir() {
        let env = TestEnv::new();
        let paths = ConfigPaths::discover(Some(env.config_path()));

        assert_eq!(paths.document, env.config_path().join("config.kdl"));
        assert_eq!(paths.config_dir(), env.config_path());
        assert_eq!(paths.env_file, Some(PathBuf::from(".env")));
    }

    #[test]
    #[serial]
    fn test_discover_uses_config_dir_variable() {
        let env = TestEnv::new();
        // SAFETY: We're in a test environment and this test runs serially
        unsafe { std::env::set_var(TASKDECK_CONFIG_DIR, env.config_path()) };
        let paths = ConfigPaths::discover(None);
        unsafe { std::env::remove_var(TASKDECK_CONFIG_DIR) };

        assert_eq!(paths.document, env.config_path().join("config.kdl"));
    }
}
