use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Stage;

/// Serializable summary of a failed build, as reported to the invoking build system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorShape {
    pub error_message: String,
    pub error_type: String,
    pub stage: Option<Stage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Package update or install failures.
    Provisioning,
    /// Missing or malformed credentials and rewrite prefixes.
    Authentication,
    /// Unresolvable or conflicting manifest entries.
    Resolution,
    /// Entrypoint metadata that did not survive the build.
    Metadata,
    Configuration,
    Internal,
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    #[error("Build secret missing or empty: {source_name}")]
    MissingSecret { source_name: String },

    #[error("Invalid URL prefix {prefix}: {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    #[error("Invalid manifest entry on line {line}: {reason}")]
    InvalidManifest { line: usize, reason: String },

    #[error("Conflicting requirements for {package}: {first} and {second}")]
    ConstraintConflict {
        package: String,
        first: String,
        second: String,
    },

    #[error("Stage {stage} failed: {reason}")]
    StageFailed { stage: Stage, reason: String },

    #[error("Entrypoint metadata mismatch: expected {expected}, found {found}")]
    EntrypointMismatch { expected: String, found: String },

    #[error("Build secret found in artifact: {location}")]
    SecretLeak { location: String },

    #[error("Invalid source archive: {reason}")]
    InvalidSource { reason: String },

    #[error("Source too large: {size} bytes (max: {max_size})")]
    SourceTooLarge { size: u64, max_size: u64 },

    #[error("Docker error: {message}")]
    DockerError { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {reason}")]
    InternalError { reason: String },
}

impl BuildError {
    pub fn to_error_shape(&self) -> ErrorShape {
        ErrorShape {
            error_message: self.to_string(),
            error_type: self.error_type().to_string(),
            stage: self.stage(),
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            BuildError::ConfigError { .. } => "ConfigurationError",
            BuildError::MissingSecret { .. } => "MissingCredential",
            BuildError::InvalidPrefix { .. } => "InvalidRewritePrefix",
            BuildError::InvalidManifest { .. } => "InvalidManifest",
            BuildError::ConstraintConflict { .. } => "DependencyConflict",
            BuildError::StageFailed { .. } => "StageFailed",
            BuildError::EntrypointMismatch { .. } => "EntrypointMismatch",
            BuildError::SecretLeak { .. } => "SecretLeak",
            BuildError::InvalidSource { .. } => "InvalidSource",
            BuildError::SourceTooLarge { .. } => "SourceTooLarge",
            BuildError::DockerError { .. } => "DockerError",
            BuildError::Io(_) => "IoError",
            BuildError::InternalError { .. } => "InternalError",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            BuildError::MissingSecret { .. } | BuildError::InvalidPrefix { .. } => {
                ErrorCategory::Authentication
            }
            BuildError::InvalidManifest { .. } | BuildError::ConstraintConflict { .. } => {
                ErrorCategory::Resolution
            }
            BuildError::StageFailed { stage, .. } => match stage {
                Stage::DependencyInstall => ErrorCategory::Resolution,
                Stage::CredentialRewrite => ErrorCategory::Authentication,
                Stage::Entrypoint => ErrorCategory::Metadata,
                _ => ErrorCategory::Provisioning,
            },
            BuildError::EntrypointMismatch { .. } => ErrorCategory::Metadata,
            BuildError::DockerError { .. } => ErrorCategory::Provisioning,
            BuildError::ConfigError { .. }
            | BuildError::InvalidSource { .. }
            | BuildError::SourceTooLarge { .. } => ErrorCategory::Configuration,
            BuildError::SecretLeak { .. } | BuildError::Io(_) | BuildError::InternalError { .. } => {
                ErrorCategory::Internal
            }
        }
    }

    /// Stage the error is attributed to when the build system reports it.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BuildError::StageFailed { stage, .. } => Some(*stage),
            BuildError::MissingSecret { .. } | BuildError::InvalidPrefix { .. } => {
                Some(Stage::CredentialRewrite)
            }
            BuildError::InvalidManifest { .. } | BuildError::ConstraintConflict { .. } => {
                Some(Stage::DependencyInstall)
            }
            BuildError::InvalidSource { .. } | BuildError::SourceTooLarge { .. } => {
                Some(Stage::SourceCopy)
            }
            BuildError::EntrypointMismatch { .. } => Some(Stage::Entrypoint),
            _ => None,
        }
    }
}
