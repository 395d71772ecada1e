// src/error.rs

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Rejected input, caught before any core state is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("All fields are required (missing: {0})")]
    MissingField(&'static str),

    #[error("Port must be a positive number, got '{0}'")]
    InvalidPort(String),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Server '{0}' is not running")]
    NotRunning(String),

    #[error("Failed to launch server '{id}': {source}")]
    Launch {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("Server '{0}' was stopped while its process was being launched")]
    StartAborted(String),

    #[error("Failed to stop server '{id}': {source}")]
    Kill {
        id: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    /// Not-found and state-precondition failures are the "returned false"
    /// outcomes; everything else came from the OS.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning(_) | Self::NotRunning(_) | Self::StartAborted(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("invalid port number: {0}")]
    InvalidPort(String),

    #[error("derived address '{address}' is not a valid IPv6 address")]
    InvalidAddress { address: String },

    #[error("failed to get main interface: {0}")]
    Uplink(String),

    #[error("failed to create VLAN interface {name}: {reason}")]
    CreateLink { name: String, reason: String },

    #[error("failed to bring up VLAN interface {name}: {reason}")]
    LinkUp { name: String, reason: String },

    #[error("failed to add IPv6 address {address} to {name}: {reason}")]
    AssignAddress {
        name: String,
        address: String,
        reason: String,
    },

    #[error("failed to remove VLAN interface {name}: {reason}")]
    DeleteLink { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed snapshot {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("could not determine home directory; set PSM_STATE_PATH")]
    NoHomeDir,
}
