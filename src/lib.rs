//! Taskdeck - configuration resolution and service lifecycle core.
//!
//! Every application-level operation reads settings through the
//! [`config::Settings`] façade and obtains shared services from the
//! [`container::ServiceContainer`]. The pieces, leaves first:
//!
//! - [`config::env`] - registry of recognised environment variables and the typed snapshot
//! - [`config::document`] - the persisted `config.kdl` document and its edit transactions
//! - [`config::resolver`] - precedence resolution (override > environment > document)
//! - [`container`] - lazily built, invalidatable service cache
//! - [`storage`] - unit of work over the application database

pub mod cli;
pub mod commands;
pub mod config;
pub mod container;
pub mod logging;
pub mod services;
pub mod storage;


/// Library-level error type for taskdeck operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config document error: {0}")]
    Kdl(#[from] kdl::KdlError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    #[error("An edit transaction is already open on {0}")]
    EditInProgress(String),

    #[error("Edit transaction aborted: a nested edit scope exited without committing")]
    EditAborted,

    #[error("No service registered for {0}")]
    ServiceNotRegistered(&'static str),

    #[error("Service dependency cycle while constructing {0}")]
    ServiceCycle(&'static str),

    #[error("Unsupported database URL '{0}': only sqlite URLs are supported")]
    UnsupportedDatabase(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for taskdeck operations.
pub type Result<T> = std::result::Result<T, Error>;
