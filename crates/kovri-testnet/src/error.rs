//! Error types for the testnet crate.
//!
//! Every failure the provisioning engine can report is a [`TestnetError`].
//! Reports never carry the error itself; they carry its [`ErrorKind`] and
//! rendered message so that outcomes stay serialisable.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Result type for testnet operations.
pub type Result<T> = std::result::Result<T, TestnetError>;

/// Errors that can occur while provisioning or tearing down a testnet.
#[derive(Debug, Error)]
pub enum TestnetError {
    /// A configuration field was malformed.
    #[error("invalid configuration field `{field}`: {reason}")]
    ConfigValidation {
        /// Canonical name of the offending field.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// More instances were requested than the naming scheme can address.
    #[error("cannot plan {requested} instances: naming capacity is {capacity}")]
    PlanOverflow {
        /// Total instances requested.
        requested: u64,
        /// Maximum number of distinct instance names.
        capacity: u64,
    },

    /// Building an image failed.
    #[error("failed to build image {image}: {reason}")]
    ImageBuild {
        /// The image reference that was being built.
        image: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Pulling an image failed.
    #[error("failed to pull image {image}: {reason}")]
    ImagePull {
        /// The image reference that was being pulled.
        image: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Building the repository binaries failed.
    #[error("failed to build repository binaries: {0}")]
    RepoBuild(String),

    /// An instance workspace directory could not be created.
    #[error("failed to create workspace {path}: {reason}")]
    WorkspaceCreation {
        /// Directory that could not be created.
        path: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A log pipe could not be created or opened.
    #[error("failed to create log pipe {path}: {reason}")]
    PipeCreation {
        /// Pipe path.
        path: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Container start failed.
    #[error("failed to start container {name}: {reason}")]
    ContainerStart {
        /// The container name.
        name: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Container stop failed.
    #[error("failed to stop container {name}: {reason}")]
    ContainerStop {
        /// The container name.
        name: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Container removal failed.
    #[error("failed to remove container {name}: {reason}")]
    ContainerRemove {
        /// The container name.
        name: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The runtime has no container with this name.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The container exists but is not running.
    #[error("container is not running: {0}")]
    ContainerNotRunning(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// The starting state.
        from: String,
        /// The target state.
        to: String,
    },

    /// Generic container runtime failure.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Docker API error.
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TestnetError {
    /// Creates a configuration validation error.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an image build failed error.
    pub fn image_build_failed(image: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ImageBuild {
            image: image.into(),
            reason: reason.into(),
        }
    }

    /// Creates an image pull failed error.
    pub fn image_pull_failed(image: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ImagePull {
            image: image.into(),
            reason: reason.into(),
        }
    }

    /// Creates a workspace creation error.
    pub fn workspace_creation_failed(path: &Path, reason: impl Into<String>) -> Self {
        Self::WorkspaceCreation {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a pipe creation error.
    pub fn pipe_creation_failed(path: &Path, reason: impl Into<String>) -> Self {
        Self::PipeCreation {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a container start failed error.
    pub fn container_start_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContainerStart {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a container stop failed error.
    pub fn container_stop_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContainerStop {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a container remove failed error.
    pub fn container_remove_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContainerRemove {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a container not found error.
    pub fn container_not_found(name: impl Into<String>) -> Self {
        Self::ContainerNotFound(name.into())
    }

    /// Creates an invalid state transition error.
    pub fn invalid_state_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Creates a generic runtime error.
    pub fn runtime(reason: impl Into<String>) -> Self {
        Self::Runtime(reason.into())
    }

    /// Returns the reportable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigValidation { .. } => ErrorKind::ConfigValidation,
            Self::PlanOverflow { .. } => ErrorKind::PlanOverflow,
            Self::ImageBuild { .. } => ErrorKind::ImageBuild,
            Self::ImagePull { .. } => ErrorKind::ImagePull,
            Self::RepoBuild(_) => ErrorKind::RepoBuild,
            Self::WorkspaceCreation { .. } => ErrorKind::WorkspaceCreation,
            Self::PipeCreation { .. } => ErrorKind::PipeCreation,
            Self::ContainerStart { .. } => ErrorKind::ContainerStart,
            Self::ContainerStop { .. } => ErrorKind::ContainerStop,
            Self::ContainerRemove { .. } => ErrorKind::ContainerRemove,
            Self::ContainerNotFound(_) | Self::ContainerNotRunning(_) => ErrorKind::Runtime,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidState,
            Self::Runtime(_) | Self::DockerApi(_) => ErrorKind::Runtime,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Returns true if this error aborts a whole provisioning run.
    ///
    /// Everything else is isolated to the instance or resource it concerns.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::ConfigValidation { .. }
                | Self::PlanOverflow { .. }
                | Self::ImageBuild { .. }
                | Self::ImagePull { .. }
                | Self::RepoBuild(_)
        )
    }

    /// Returns true if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_))
    }

    /// Returns true if the target container already is where a stop would
    /// leave it.
    pub fn is_already_stopped(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_) | Self::ContainerNotRunning(_))
    }
}

impl From<serde_json::Error> for TestnetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for TestnetError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Serialisable classification of a [`TestnetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad configuration field.
    ConfigValidation,
    /// Instance count exceeds naming capacity.
    PlanOverflow,
    /// Image build failure.
    ImageBuild,
    /// Image pull failure.
    ImagePull,
    /// Repository binary build failure.
    RepoBuild,
    /// Workspace directory failure.
    WorkspaceCreation,
    /// Log pipe failure.
    PipeCreation,
    /// Container start failure.
    ContainerStart,
    /// Container stop failure.
    ContainerStop,
    /// Container removal failure.
    ContainerRemove,
    /// Illegal lifecycle transition.
    InvalidState,
    /// Other runtime failure.
    Runtime,
    /// Filesystem failure.
    Io,
    /// Encoding failure.
    Serialization,
}

impl ErrorKind {
    /// Returns the error kind name as used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigValidation => "ConfigValidationError",
            Self::PlanOverflow => "PlanOverflowError",
            Self::ImageBuild => "ImageBuildError",
            Self::ImagePull => "ImagePullError",
            Self::RepoBuild => "RepoBuildError",
            Self::WorkspaceCreation => "WorkspaceCreationError",
            Self::PipeCreation => "PipeCreationError",
            Self::ContainerStart => "ContainerStartError",
            Self::ContainerStop => "ContainerStopError",
            Self::ContainerRemove => "ContainerRemoveError",
            Self::InvalidState => "InvalidStateError",
            Self::Runtime => "RuntimeError",
            Self::Io => "IoError",
            Self::Serialization => "SerializationError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TestnetError::config("nb_base", "not a number");
        assert_eq!(
            err.to_string(),
            "invalid configuration field `nb_base`: not a number"
        );

        let err = TestnetError::PlanOverflow {
            requested: 1200,
            capacity: 1000,
        };
        assert_eq!(
            err.to_string(),
            "cannot plan 1200 instances: naming capacity is 1000"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            TestnetError::image_pull_failed("img", "404").kind(),
            ErrorKind::ImagePull
        );
        assert_eq!(
            TestnetError::container_start_failed("kovri_001", "boom").kind(),
            ErrorKind::ContainerStart
        );
        assert_eq!(ErrorKind::ContainerStart.to_string(), "ContainerStartError");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TestnetError::image_build_failed("img", "x").is_fatal_to_run());
        assert!(TestnetError::RepoBuild("make failed".into()).is_fatal_to_run());
        assert!(!TestnetError::container_start_failed("n", "x").is_fatal_to_run());
        assert!(!TestnetError::pipe_creation_failed(Path::new("/tmp/p"), "x").is_fatal_to_run());
    }

    #[test]
    fn test_already_stopped() {
        assert!(TestnetError::container_not_found("n").is_already_stopped());
        assert!(TestnetError::ContainerNotRunning("n".into()).is_already_stopped());
        assert!(!TestnetError::runtime("boom").is_already_stopped());
    }
}
