//! Container runtime trait definition.
//!
//! This module defines the seam between the provisioning engine and the
//! container runtime, along with the types exchanged across it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::container::{BuildSpec, ContainerImage, RunSpec};
use crate::error::Result;

/// Stream of raw log chunks from a container's standard streams.
pub type LogStream = BoxStream<'static, Result<Vec<u8>>>;

/// Core trait for container runtimes.
///
/// Every operation addresses containers by name. Implementations normalise
/// "no such container" into [`TestnetError::ContainerNotFound`] and "not
/// running" into [`TestnetError::ContainerNotRunning`] so that callers can
/// treat them as benign during stop and remove.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: instance tasks call into the same
/// runtime concurrently.
///
/// [`TestnetError::ContainerNotFound`]: crate::error::TestnetError::ContainerNotFound
/// [`TestnetError::ContainerNotRunning`]: crate::error::TestnetError::ContainerNotRunning
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Returns true if the image is present locally.
    async fn image_exists(&self, image: &ContainerImage) -> Result<bool>;

    /// Pulls an image from its registry.
    async fn pull_image(&self, image: &ContainerImage) -> Result<()>;

    /// Builds an image from a build file and tags it, replacing any image
    /// previously carrying that tag.
    async fn build_image(&self, image: &ContainerImage, build: &BuildSpec) -> Result<()>;

    /// Creates the named bridge network unless it already exists.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Removes the named network.
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Creates and starts a container, returning its ID.
    async fn create_and_start(&self, spec: &RunSpec) -> Result<String>;

    /// Sends the graceful stop signal and waits until the container exits.
    ///
    /// There is no built-in deadline; callers bound the wait.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Forcefully terminates a container.
    async fn kill(&self, name: &str) -> Result<()>;

    /// Removes a container, killing it first if it still runs.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Inspects a container.
    async fn inspect(&self, name: &str) -> Result<ContainerInfo>;

    /// Lists all containers, running or not, whose name starts with `prefix`.
    async fn list_containers(&self, prefix: &str) -> Result<Vec<ContainerInfo>>;

    /// Runs a one-shot container to completion and removes it.
    async fn run_to_completion(&self, spec: &RunSpec) -> Result<RunOutput>;

    /// Follows the standard streams of a container.
    ///
    /// The stream ends when the container stops.
    fn log_stream(&self, name: &str) -> LogStream;
}

/// Runtime view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container ID assigned by the runtime.
    pub id: String,

    /// Container name without any leading slash.
    pub name: String,

    /// Whether the container is running.
    pub running: bool,

    /// Exit code, once the container has exited.
    pub exit_code: Option<i64>,
}

/// Result of a one-shot container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    /// Exit code.
    pub exit_code: i64,

    /// Combined stdout and stderr.
    pub output: String,
}

impl RunOutput {
    /// Returns true if the command succeeded.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the last `lines` lines of output.
    pub fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.output.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}
