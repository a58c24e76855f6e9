//! Common test utilities for taskdeck integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't touch the
//! user's `~/.config/taskdeck/` directory or inherit their environment.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
pub use tempfile::TempDir;

/// Every variable taskdeck reads; cleared for each spawned command.
pub const TASKDECK_VARS: &[&str] = &[
    "DATABASE_URL",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "OLLAMA_BASE_URL",
    "TASKDECK_THEME",
    "TASKDECK_DEBUG",
    "TASKDECK_OFFLINE",
    "TASKDECK_AGENT_TIMEOUT_SECS",
    "TASKDECK_CONFIG_DIR",
];

/// A test environment with isolated directories.
///
/// - `work_dir`: working directory of spawned commands (holds `.env`)
/// - `config_dir`: holds config.kdl (via `TASKDECK_CONFIG_DIR`)
pub struct TestEnv {
    pub work_dir: TempDir,
    pub config_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            work_dir: TempDir::new().unwrap(),
            config_dir: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the taskdeck binary with an isolated environment.
    ///
    /// Sets `TASKDECK_CONFIG_DIR` per-command for parallel safety.
    pub fn taskdeck(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_taskdeck"));
        cmd.current_dir(self.work_dir.path());
        for name in TASKDECK_VARS {
            cmd.env_remove(name);
        }
        cmd.env_remove("RUST_LOG");
        cmd.env("TASKDECK_CONFIG_DIR", self.config_dir.path());
        cmd
    }

    pub fn config_path(&self) -> &Path {
        self.config_dir.path()
    }

    pub fn document_path(&self) -> PathBuf {
        self.config_dir.path().join("config.kdl")
    }

    pub fn write_document(&self, content: &str) {
        std::fs::write(self.document_path(), content).unwrap();
    }

    pub fn read_document(&self) -> String {
        std::fs::read_to_string(self.document_path()).unwrap()
    }

    /// Write `.env` in the working directory.
    pub fn write_env_file(&self, content: &str) {
        std::fs::write(self.work_dir.path().join(".env"), content).unwrap();
    }

    /// Run a command that must succeed and parse its JSON output.
    pub fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.taskdeck().args(args).assert().success().get_output().stdout.clone();
        serde_json::from_slice(&output).unwrap()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
