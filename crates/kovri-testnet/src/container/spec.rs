//! Container specification types.
//!
//! This module provides image references and the runtime-neutral
//! description of a container to launch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Container image reference.
///
/// Represents an image with optional registry, tag, and digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerImage {
    /// Full image reference (registry/repository:tag@digest).
    reference: String,
}

impl ContainerImage {
    /// Creates a new container image from a reference string.
    ///
    /// # Examples
    ///
    /// ```
    /// use kovri_testnet::container::ContainerImage;
    ///
    /// let image = ContainerImage::new("geti2p/kovri:b1d505b2");
    /// assert_eq!(image.reference(), "geti2p/kovri:b1d505b2");
    /// assert_eq!(image.tag(), Some("b1d505b2"));
    /// ```
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }

    /// Returns the full image reference.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Returns the image name (without tag or digest).
    pub fn name(&self) -> &str {
        let without_digest = self.reference.split('@').next().unwrap_or(&self.reference);
        match self.tag_separator(without_digest) {
            Some(idx) => &without_digest[..idx],
            None => without_digest,
        }
    }

    /// Returns the image tag if present.
    pub fn tag(&self) -> Option<&str> {
        let without_digest = self.reference.split('@').next()?;
        self.tag_separator(without_digest)
            .map(|idx| &without_digest[idx + 1..])
    }

    /// Returns the tag or digest to pull, defaulting to `latest`.
    pub fn pull_tag(&self) -> &str {
        match (self.digest(), self.tag()) {
            (Some(digest), _) => digest,
            (None, Some(tag)) => tag,
            (None, None) => "latest",
        }
    }

    /// Returns the image digest if present.
    pub fn digest(&self) -> Option<&str> {
        self.reference.split_once('@').map(|(_, digest)| digest)
    }

    /// Returns the registry if specified.
    pub fn registry(&self) -> Option<&str> {
        let name = self.name();
        let (first, _) = name.split_once('/')?;
        // A registry host contains a dot or a port, or is localhost.
        if first.contains('.') || first.contains(':') || first == "localhost" {
            Some(first)
        } else {
            None
        }
    }

    /// A `:` after the last `/` separates the tag; earlier ones belong to a
    /// registry port.
    fn tag_separator(&self, without_digest: &str) -> Option<usize> {
        let last_slash = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
        without_digest[last_slash..]
            .rfind(':')
            .map(|idx| idx + last_slash)
    }
}

impl std::fmt::Display for ContainerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reference)
    }
}

impl From<&str> for ContainerImage {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContainerImage {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// How an image is built from source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build file to use.
    pub build_file: PathBuf,

    /// Build context directory.
    pub context: PathBuf,
}

impl BuildSpec {
    /// Creates a new build specification.
    pub fn new(build_file: impl Into<PathBuf>, context: impl Into<PathBuf>) -> Self {
        Self {
            build_file: build_file.into(),
            context: context.into(),
        }
    }
}

/// Bind mount from the host into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Source path on the host.
    pub source: PathBuf,

    /// Target path in the container.
    pub target: String,

    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl BindMount {
    /// Creates a new read-write bind mount.
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    /// Sets the mount to read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Returns the bind string understood by the container runtime.
    pub fn as_bind(&self) -> String {
        let mut bind = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Everything the runtime needs to launch one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Container name.
    pub name: String,

    /// Image to run.
    pub image: ContainerImage,

    /// Command and arguments.
    pub command: Vec<String>,

    /// Working directory inside the container.
    pub working_dir: Option<String>,

    /// Bind mounts.
    pub mounts: Vec<BindMount>,

    /// Network to attach to.
    pub network: Option<String>,

    /// Labels applied to the container.
    pub labels: BTreeMap<String, String>,

    /// Whether the runtime should keep no logs for this container.
    pub discard_logs: bool,
}

impl RunSpec {
    /// Creates a new run specification.
    pub fn new(name: impl Into<String>, image: ContainerImage) -> Self {
        Self {
            name: name.into(),
            image,
            command: Vec::new(),
            working_dir: None,
            mounts: Vec::new(),
            network: None,
            labels: BTreeMap::new(),
            discard_logs: false,
        }
    }

    /// Sets the command.
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds a bind mount.
    pub fn mount(mut self, mount: BindMount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Sets the network.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Adds a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets whether logs are discarded.
    pub fn discard_logs(mut self, discard: bool) -> Self {
        self.discard_logs = discard;
        self
    }
}
