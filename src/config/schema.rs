//! KDL schema for config.kdl.
//!
//! This module provides:
//! - [`ConfigDocument`], the typed record of every recognised setting
//! - Parsing from a [`KdlDocument`] (lenient: bad values fall back to defaults)
//! - Dotted-key access (`user.theme`, `agents.one-liner.model`)
//! - A field-by-field diff between two documents
//!
//! # KDL Schema
//!
//! ```kdl
//! window {
//!     width 1280
//!     height 800
//!     maximized #false
//! }
//! user {
//!     theme "system"      // "light" | "dark" | "system"
//!     language "en"
//!     confirm-delete #true
//! }
//! database {
//!     url "sqlite:///taskdeck.db"
//! }
//! agents {
//!     one-liner {
//!         provider "openai"
//!         model "gpt-4o-mini"
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::env::parse_bool;
use crate::{Error, Result};

/// Written to disk when no document exists yet.
pub const DEFAULT_DOCUMENT: &str = r#"// taskdeck settings
//
// Environment variables (DATABASE_URL, TASKDECK_THEME, ...) take precedence
// over the values in this file.

window {
    width 1280
    height 800
    maximized #false
}

user {
    theme "system" // "light" | "dark" | "system"
    language "en"
    confirm-delete #true
}

database {
    url "sqlite:///taskdeck.db"
}

// Provider and model used for each agent purpose
agents {
    one-liner {
        provider "openai"
        model "gpt-4o-mini"
    }
    summary {
        provider "openai"
        model "gpt-4o"
    }
    planner {
        provider "anthropic"
        model "claude-3-5-sonnet-latest"
    }
}
"#;

/// Default database connection string.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:///taskdeck.db";

/// UI colour theme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    /// Follow the operating system preference
    #[default]
    System,
}

impl Theme {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            "system" => Some(Theme::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::System => "system",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main window geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSection {
    pub width: u32,
    pub height: u32,
    /// Last known position; unset until the window has been moved
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub maximized: bool,
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
            x: None,
            y: None,
            maximized: false,
        }
    }
}

/// User preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSection {
    pub theme: Theme,
    pub language: String,
    pub confirm_delete: bool,
}

impl Default for UserSection {
    fn default() -> Self {
        Self {
            theme: Theme::System,
            language: "en".to_string(),
            confirm_delete: true,
        }
    }
}

/// Database connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

/// Provider and model used for one agent purpose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSelection {
    pub provider: String,
    pub model: String,
}

impl AgentSelection {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Built-in selection for a purpose, used when the document has none.
pub fn builtin_selection(purpose: &str) -> Option<AgentSelection> {
    match purpose {
        "one-liner" => Some(AgentSelection::new("openai", "gpt-4o-mini")),
        "summary" => Some(AgentSelection::new("openai", "gpt-4o")),
        "planner" => Some(AgentSelection::new("anthropic", "claude-3-5-sonnet-latest")),
        _ => None,
    }
}

/// Purposes that always resolve, whether or not the document mentions them.
pub const BUILTIN_PURPOSES: &[&str] = &["one-liner", "summary", "planner"];

/// Dotted path to one leaf setting, e.g. `agents.one-liner.model`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse a dotted key. Purpose names may not contain dots.
    pub fn parse(key: &str) -> Result<Self> {
        let segments: Vec<&str> = key.split('.').collect();
        if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
            return Err(Error::UnknownSetting(key.to_string()));
        }
        Ok(Self::new(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Value of one leaf setting as stored in KDL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Bool(bool),
}

impl FieldValue {
    pub fn to_kdl(&self) -> KdlValue {
        match self {
            FieldValue::String(s) => KdlValue::String(s.clone()),
            FieldValue::Integer(i) => KdlValue::Integer(i128::from(*i)),
            FieldValue::Bool(b) => KdlValue::Bool(*b),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(s) => write!(f, "{}", s),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// One leaf that differs between two documents.
///
/// `value: None` means the leaf was cleared and should be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub path: FieldPath,
    pub value: Option<FieldValue>,
}

/// Every recognised setting in config.kdl.
///
/// Edit transactions hand out a mutable clone of this record; the changed
/// leaves are found with [`ConfigDocument::diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub window: WindowSection,
    pub user: UserSection,
    pub database: DatabaseSection,
    /// Selections keyed by purpose name
    pub agents: BTreeMap<String, AgentSelection>,
}

impl ConfigDocument {
    /// Document matching [`DEFAULT_DOCUMENT`].
    pub fn defaults() -> Self {
        let mut doc = Self::default();
        for purpose in BUILTIN_PURPOSES {
            if let Some(selection) = builtin_selection(purpose) {
                doc.agents.insert(purpose.to_string(), selection);
            }
        }
        doc
    }

    /// Parse settings from a KDL document.
    ///
    /// Missing sections and leaves keep their defaults; values of the wrong
    /// type are logged and ignored. Unknown nodes are ignored here and left
    /// alone on disk.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        let mut config = Self::default();

        if let Some(window) = section(doc, "window") {
            if let Some(v) = leaf_integer(window, "window", "width") {
                set_or_warn(&mut config.window.width, u32::try_from(v).ok(), "window.width");
            }
            if let Some(v) = leaf_integer(window, "window", "height") {
                set_or_warn(&mut config.window.height, u32::try_from(v).ok(), "window.height");
            }
            if let Some(v) = leaf_integer(window, "window", "x") {
                config.window.x = i32::try_from(v).ok();
            }
            if let Some(v) = leaf_integer(window, "window", "y") {
                config.window.y = i32::try_from(v).ok();
            }
            if let Some(v) = leaf_bool(window, "window", "maximized") {
                config.window.maximized = v;
            }
        }

        if let Some(user) = section(doc, "user") {
            if let Some(s) = leaf_string(user, "user", "theme") {
                set_or_warn(&mut config.user.theme, Theme::parse(&s), "user.theme");
            }
            if let Some(s) = leaf_string(user, "user", "language") {
                config.user.language = s;
            }
            if let Some(v) = leaf_bool(user, "user", "confirm-delete") {
                config.user.confirm_delete = v;
            }
        }

        if let Some(database) = section(doc, "database") {
            if let Some(s) = leaf_string(database, "database", "url") {
                config.database.url = s;
            }
        }

        if let Some(agents) = section(doc, "agents") {
            for node in agents.nodes() {
                let purpose = node.name().value();
                let Some(children) = node.children() else {
                    continue;
                };
                let mut selection = builtin_selection(purpose).unwrap_or_default();
                if let Some(s) = leaf_string(children, purpose, "provider") {
                    selection.provider = s;
                }
                if let Some(s) = leaf_string(children, purpose, "model") {
                    selection.model = s;
                }
                config.agents.insert(purpose.to_string(), selection);
            }
        }

        config
    }

    /// Flatten every set leaf into `path -> value`.
    ///
    /// Fields are listed explicitly; optional fields appear only when set.
    pub fn leaves(&self) -> BTreeMap<FieldPath, FieldValue> {
        let mut leaves = BTreeMap::new();
        let mut put = |path: &[&str], value: FieldValue| {
            leaves.insert(FieldPath::new(path.iter().copied()), value);
        };

        put(&["window", "width"], FieldValue::Integer(i64::from(self.window.width)));
        put(&["window", "height"], FieldValue::Integer(i64::from(self.window.height)));
        if let Some(x) = self.window.x {
            put(&["window", "x"], FieldValue::Integer(i64::from(x)));
        }
        if let Some(y) = self.window.y {
            put(&["window", "y"], FieldValue::Integer(i64::from(y)));
        }
        put(&["window", "maximized"], FieldValue::Bool(self.window.maximized));

        put(&["user", "theme"], FieldValue::String(self.user.theme.as_str().to_string()));
        put(&["user", "language"], FieldValue::String(self.user.language.clone()));
        put(&["user", "confirm-delete"], FieldValue::Bool(self.user.confirm_delete));

        put(&["database", "url"], FieldValue::String(self.database.url.clone()));

        // Unset selection fields stay out of the file.
        for (purpose, selection) in &self.agents {
            if !selection.provider.is_empty() {
                put(
                    &["agents", purpose.as_str(), "provider"],
                    FieldValue::String(selection.provider.clone()),
                );
            }
            if !selection.model.is_empty() {
                put(
                    &["agents", purpose.as_str(), "model"],
                    FieldValue::String(selection.model.clone()),
                );
            }
        }

        leaves
    }

    /// Leaves that differ from `before` to `self`.
    pub fn diff(&self, before: &ConfigDocument) -> Vec<FieldChange> {
        let old = before.leaves();
        let new = self.leaves();

        let mut changes: Vec<FieldChange> = new
            .iter()
            .filter(|(path, value)| old.get(*path) != Some(*value))
            .map(|(path, value)| FieldChange {
                path: path.clone(),
                value: Some(value.clone()),
            })
            .collect();

        changes.extend(
            old.keys()
                .filter(|path| !new.contains_key(*path))
                .map(|path| FieldChange {
                    path: path.clone(),
                    value: None,
                }),
        );

        changes
    }

    /// Apply one change produced by [`diff`](Self::diff).
    pub fn apply(&mut self, change: &FieldChange) -> Result<()> {
        let key = change.path.to_string();
        match (&change.value, change.path.segments()) {
            (Some(value), _) => self.set(&key, &value.to_string()),
            (None, [section, purpose, field]) if section == "agents" => {
                if let Some(selection) = self.agents.get_mut(purpose) {
                    if field == "provider" {
                        selection.provider.clear();
                    } else {
                        selection.model.clear();
                    }
                    if selection.provider.is_empty() && selection.model.is_empty() {
                        self.agents.remove(purpose);
                    }
                }
                Ok(())
            }
            (None, _) => self.set(&key, ""),
        }
    }

    /// Current value of a dotted key.
    pub fn get(&self, key: &str) -> Result<Option<FieldValue>> {
        let path = FieldPath::parse(key)?;
        validate_path(&path)?;
        Ok(self.leaves().remove(&path))
    }

    /// Set a dotted key from its textual form.
    ///
    /// The empty string clears optional fields (`window.x`, `window.y`).
    pub fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        let path = FieldPath::parse(key)?;
        let segments: Vec<&str> = path.segments().iter().map(String::as_str).collect();
        let raw = raw.trim();

        match segments.as_slice() {
            ["window", "width"] => self.window.width = parse_number(key, raw)?,
            ["window", "height"] => self.window.height = parse_number(key, raw)?,
            ["window", "x"] => self.window.x = parse_optional_number(key, raw)?,
            ["window", "y"] => self.window.y = parse_optional_number(key, raw)?,
            ["window", "maximized"] => self.window.maximized = parse_flag(key, raw)?,
            ["user", "theme"] => {
                self.user.theme = Theme::parse(raw).ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Invalid theme: '{}'. Expected 'light', 'dark' or 'system'.",
                        raw
                    ))
                })?
            }
            ["user", "language"] => self.user.language = non_empty(key, raw)?,
            ["user", "confirm-delete"] => self.user.confirm_delete = parse_flag(key, raw)?,
            ["database", "url"] => self.database.url = non_empty(key, raw)?,
            ["agents", purpose, field @ ("provider" | "model")] => {
                let value = non_empty(key, raw)?;
                let selection = self
                    .agents
                    .entry(purpose.to_string())
                    .or_insert_with(|| builtin_selection(purpose).unwrap_or_default());
                if *field == "provider" {
                    selection.provider = value;
                } else {
                    selection.model = value;
                }
            }
            _ => return Err(Error::UnknownSetting(key.to_string())),
        }

        Ok(())
    }
}

fn validate_path(path: &FieldPath) -> Result<()> {
    let segments: Vec<&str> = path.segments().iter().map(String::as_str).collect();
    match segments.as_slice() {
        ["window", "width" | "height" | "x" | "y" | "maximized"]
        | ["user", "theme" | "language" | "confirm-delete"]
        | ["database", "url"]
        | ["agents", _, "provider" | "model"] => Ok(()),
        _ => Err(Error::UnknownSetting(path.to_string())),
    }
}

fn set_or_warn<T>(slot: &mut T, value: Option<T>, key: &str) {
    match value {
        Some(v) => *slot = v,
        None => warn!(
            event = "config.document.invalid_value",
            key,
            "Ignoring invalid value in config document, using default"
        ),
    }
}

fn section<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlDocument> {
    doc.get(name).and_then(KdlNode::children)
}

fn leaf_value<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlValue> {
    doc.get(name)
        .and_then(|node| node.entries().iter().find(|e| e.name().is_none()))
        .map(|entry| entry.value())
}

fn leaf_string(doc: &KdlDocument, section: &str, name: &str) -> Option<String> {
    let value = leaf_value(doc, name)?;
    match value.as_string() {
        Some(s) => Some(s.to_string()),
        None => {
            warn_type(section, name, "string");
            None
        }
    }
}

fn leaf_integer(doc: &KdlDocument, section: &str, name: &str) -> Option<i128> {
    let value = leaf_value(doc, name)?;
    match value.as_integer() {
        Some(i) => Some(i),
        None => {
            warn_type(section, name, "integer");
            None
        }
    }
}

fn leaf_bool(doc: &KdlDocument, section: &str, name: &str) -> Option<bool> {
    let value = leaf_value(doc, name)?;
    match value.as_bool() {
        Some(b) => Some(b),
        None => {
            warn_type(section, name, "boolean");
            None
        }
    }
}

fn warn_type(section: &str, name: &str, expected: &str) {
    warn!(
        event = "config.document.invalid_value",
        key = %format!("{}.{}", section, name),
        expected,
        "Ignoring config value of the wrong type"
    );
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::InvalidInput(format!("{} expects a number, got '{}'", key, raw)))
}

fn parse_optional_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<Option<T>> {
    if raw.is_empty() {
        return Ok(None);
    }
    parse_number(key, raw).map(Some)
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    parse_bool(raw)
        .ok_or_else(|| Error::InvalidInput(format!("{} expects true or false, got '{}'", key, raw)))
}

fn non_empty(key: &str, raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::InvalidInput(format!("{} cannot be empty", key)));
    }
    Ok(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Theme Tests ====================

    #[test]
    fn test_theme_parse() {
        assert_eq!(Theme::parse("dark"), Some(Theme::Dark));
        assert_eq!(Theme::parse("LIGHT"), Some(Theme::Light));
        assert_eq!(Theme::parse("System"), Some(Theme::System));
        assert_eq!(Theme::parse("neon"), None);
    }

    #[test]
    fn test_theme_display() {
        assert_eq!(format!("{}", Theme::Dark), "dark");
        assert_eq!(Theme::default(), Theme::System);
    }

    // ==================== Parsing Tests ====================

    #[test]
    fn test_default_document_matches_defaults() {
        let doc: KdlDocument = DEFAULT_DOCUMENT.parse().unwrap();
        assert_eq!(ConfigDocument::from_kdl(&doc), ConfigDocument::defaults());
    }

    #[test]
    fn test_from_kdl_empty() {
        let doc = KdlDocument::new();
        assert_eq!(ConfigDocument::from_kdl(&doc), ConfigDocument::default());
    }

    #[test]
    fn test_from_kdl_full() {
        let kdl = r#"
            window {
                width 1024
                height 768
                x 10
                y 20
                maximized #true
            }
            user {
                theme "dark"
                language "de"
                confirm-delete #false
            }
            database {
                url "sqlite:///a.db"
            }
            agents {
                one-liner {
                    provider "ollama"
                    model "llama3"
                }
            }
        "#;
        let doc: KdlDocument = kdl.parse().unwrap();
        let config = ConfigDocument::from_kdl(&doc);

        assert_eq!(config.window.width, 1024);
        assert_eq!(config.window.x, Some(10));
        assert!(config.window.maximized);
        assert_eq!(config.user.theme, Theme::Dark);
        assert_eq!(config.user.language, "de");
        assert!(!config.user.confirm_delete);
        assert_eq!(config.database.url, "sqlite:///a.db");
        assert_eq!(
            config.agents.get("one-liner"),
            Some(&AgentSelection::new("ollama", "llama3"))
        );
    }

    #[test]
    fn test_from_kdl_partial_agent_keeps_builtin_fields() {
        let kdl = r#"
            agents {
                summary {
                    model "gpt-4o-mini"
                }
            }
        "#;
        let doc: KdlDocument = kdl.parse().unwrap();
        let config = ConfigDocument::from_kdl(&doc);

        assert_eq!(
            config.agents.get("summary"),
            Some(&AgentSelection::new("openai", "gpt-4o-mini"))
        );
    }

    #[test]
    fn test_from_kdl_wrong_types_fall_back() {
        let kdl = r#"
            window {
                width "wide"
            }
            user {
                theme "neon"
                confirm-delete "yes"
            }
        "#;
        let doc: KdlDocument = kdl.parse().unwrap();
        let config = ConfigDocument::from_kdl(&doc);

        assert_eq!(config.window.width, 1280);
        assert_eq!(config.user.theme, Theme::System);
        assert!(config.user.confirm_delete);
    }

    #[test]
    fn test_from_kdl_ignores_unknown_nodes() {
        let kdl = r#"
            plugins {
                enabled "calendar"
            }
            user {
                theme "light"
                font-size 14
            }
        "#;
        let doc: KdlDocument = kdl.parse().unwrap();
        let config = ConfigDocument::from_kdl(&doc);
        assert_eq!(config.user.theme, Theme::Light);
    }

    // ==================== Diff Tests ====================

    #[test]
    fn test_diff_identical_is_empty() {
        let doc = ConfigDocument::defaults();
        assert!(doc.clone().diff(&doc).is_empty());
    }

    #[test]
    fn test_diff_single_field() {
        let before = ConfigDocument::defaults();
        let mut after = before.clone();
        after.user.theme = Theme::Dark;

        let changes = after.diff(&before);

        assert_eq!(
            changes,
            vec![FieldChange {
                path: FieldPath::new(["user", "theme"]),
                value: Some(FieldValue::String("dark".to_string())),
            }]
        );
    }

    #[test]
    fn test_diff_cleared_optional_field() {
        let mut before = ConfigDocument::defaults();
        before.window.x = Some(5);
        let mut after = before.clone();
        after.window.x = None;

        let changes = after.diff(&before);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path.to_string(), "window.x");
        assert_eq!(changes[0].value, None);
    }

    #[test]
    fn test_diff_new_agent_purpose() {
        let before = ConfigDocument::defaults();
        let mut after = before.clone();
        after
            .agents
            .insert("triage".to_string(), AgentSelection::new("gemini", "gemini-1.5-flash"));

        let paths: Vec<String> = after.diff(&before).iter().map(|c| c.path.to_string()).collect();
        assert_eq!(paths, vec!["agents.triage.model", "agents.triage.provider"]);
    }

    #[test]
    fn test_apply_replays_diff() {
        let before = ConfigDocument::defaults();
        let mut after = before.clone();
        after.user.theme = Theme::Dark;
        after.window.x = Some(7);
        after.agents.remove("planner");

        let mut replayed = before.clone();
        for change in after.diff(&before) {
            replayed.apply(&change).unwrap();
        }

        assert_eq!(replayed, after);
    }

    // ==================== Dotted Key Tests ====================

    #[test]
    fn test_set_and_get() {
        let mut doc = ConfigDocument::defaults();

        doc.set("user.theme", "Dark").unwrap();
        doc.set("window.width", "900").unwrap();
        doc.set("window.x", "-40").unwrap();
        doc.set("agents.one-liner.model", "gpt-4.1-mini").unwrap();

        assert_eq!(doc.user.theme, Theme::Dark);
        assert_eq!(doc.window.width, 900);
        assert_eq!(doc.window.x, Some(-40));
        assert_eq!(
            doc.get("agents.one-liner.model").unwrap(),
            Some(FieldValue::String("gpt-4.1-mini".to_string()))
        );
    }

    #[test]
    fn test_set_clears_optional() {
        let mut doc = ConfigDocument::defaults();
        doc.set("window.y", "3").unwrap();
        doc.set("window.y", "").unwrap();
        assert_eq!(doc.window.y, None);
        assert_eq!(doc.get("window.y").unwrap(), None);
    }

    #[test]
    fn test_set_new_purpose_starts_from_empty_selection() {
        let mut doc = ConfigDocument::defaults();
        doc.set("agents.triage.provider", "ollama").unwrap();
        assert_eq!(doc.agents["triage"].provider, "ollama");
        assert_eq!(doc.agents["triage"].model, "");
        assert_eq!(doc.get("agents.triage.model").unwrap(), None);
    }

    #[test]
    fn test_leaves_skip_empty_selection_fields() {
        let before = ConfigDocument::defaults();
        let mut after = before.clone();
        after.set("agents.triage.provider", "ollama").unwrap();

        let paths: Vec<String> = after.diff(&before).iter().map(|c| c.path.to_string()).collect();
        assert_eq!(paths, vec!["agents.triage.provider"]);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut doc = ConfigDocument::defaults();
        assert!(matches!(doc.set("user.theme", "neon"), Err(Error::InvalidInput(_))));
        assert!(matches!(doc.set("window.width", "-1"), Err(Error::InvalidInput(_))));
        assert!(matches!(doc.set("database.url", " "), Err(Error::InvalidInput(_))));
        assert_eq!(doc, ConfigDocument::defaults());
    }

    #[test]
    fn test_unknown_keys() {
        let mut doc = ConfigDocument::defaults();
        assert!(matches!(doc.set("user.font", "x"), Err(Error::UnknownSetting(_))));
        assert!(matches!(doc.get("theme"), Err(Error::UnknownSetting(_))));
        assert!(matches!(doc.get("user..theme"), Err(Error::UnknownSetting(_))));
    }
}
