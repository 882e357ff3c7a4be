//! Error types for the Node Disk Operator
//!
//! Provides structured error types for device discovery, identifier
//! derivation, the BlockDevice store and the add-event engine.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes / Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Resource {kind}/{name} changed since it was read")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Device Hierarchy Errors
    // =========================================================================
    #[error("Parent device {parent} of {device} not found in device hierarchy")]
    MissingParent { device: String, parent: String },

    #[error("Unreachable state while processing {device}: {reason}")]
    UnreachableState { device: String, reason: String },

    #[error("Unable to derive {scheme} identifier for device {device}")]
    IdentityUnavailable { device: String, scheme: String },

    // =========================================================================
    // Hardware Errors
    // =========================================================================
    #[error("Hardware discovery failed: {0}")]
    HardwareDiscovery(String),

    #[error("Partitioning failed for {device}: {reason}")]
    Partitioning { device: String, reason: String },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error while handling a device event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::ResourceExists { .. } | Error::Conflict { .. } | Error::Io(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Parent event not observed yet
            Error::MissingParent { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Logic or data-model bugs, and destructive operations - never retried
            Error::UnreachableState { .. }
            | Error::IdentityUnavailable { .. }
            | Error::Partitioning { .. } => ErrorAction::NoRequeue,

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::Metrics(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is a store lookup miss
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    /// Check if this error reports a broken internal invariant
    pub fn is_internal_consistency(&self) -> bool {
        matches!(self, Error::UnreachableState { .. })
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
