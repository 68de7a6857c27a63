//! Cleanup reconciliation.
//!
//! [`CleanupReconciler`] removes everything a previous run of a network left
//! behind: containers named `<network>_*` and instance directories named
//! `<network>_<NNN>` (with the log pipes inside them). It is best effort:
//! every resource is attempted and failures are collected, never raised.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::container::{ContainerHandle, ContainerLifecycleManager};
use crate::error::{ErrorKind, TestnetError};
use crate::plan::parse_instance_name;
use crate::runtime::ContainerInfo;

/// A resource that could not be cleaned up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// Container name or directory path.
    pub resource: String,
    /// Kind of error.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
}

impl CleanupFailure {
    fn new(resource: impl Into<String>, err: &TestnetError) -> Self {
        Self {
            resource: resource.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// What a cleanup pass removed and what it could not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Network that was cleaned.
    pub network: String,
    /// Containers removed, sorted.
    pub containers_removed: Vec<String>,
    /// Directories removed, sorted.
    pub directories_removed: Vec<PathBuf>,
    /// Failures, in the order they happened.
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Returns true if nothing was removed and nothing failed.
    pub fn is_empty(&self) -> bool {
        self.containers_removed.is_empty()
            && self.directories_removed.is_empty()
            && self.failures.is_empty()
    }

    /// Returns true if every discovered resource was removed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Records a failure against a resource.
    pub fn record_failure(&mut self, resource: impl Into<String>, err: &TestnetError) {
        let failure = CleanupFailure::new(resource, err);
        warn!(
            resource = %failure.resource,
            kind = %failure.kind,
            error = %failure.message,
            "Cleanup failure"
        );
        self.failures.push(failure);
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cleanup of {}: {} container(s), {} director(y/ies) removed, {} failure(s)",
            self.network,
            self.containers_removed.len(),
            self.directories_removed.len(),
            self.failures.len()
        )?;
        for failure in &self.failures {
            writeln!(f, "  {} {}: {}", failure.kind, failure.resource, failure.message)?;
        }
        Ok(())
    }
}

/// Removes the leftovers of a previous run.
pub struct CleanupReconciler {
    lifecycle: Arc<ContainerLifecycleManager>,
    stop_timeout: Duration,
    concurrency: usize,
}

impl CleanupReconciler {
    /// Creates a reconciler.
    pub fn new(
        lifecycle: Arc<ContainerLifecycleManager>,
        stop_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            lifecycle,
            stop_timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Removes all containers prefixed `<network>_` and all instance
    /// directories of `network` below `workspace`.
    ///
    /// Containers and directories are matched independently; either may
    /// exist without the other.
    pub async fn reconcile(&self, network: &str, workspace: &Path) -> CleanupReport {
        info!(network = %network, workspace = %workspace.display(), "Reconciling previous run");

        let mut report = CleanupReport {
            network: network.to_string(),
            ..CleanupReport::default()
        };

        let prefix = format!("{network}_");
        match self.lifecycle.runtime().list_containers(&prefix).await {
            Ok(containers) => {
                let results: Vec<_> = stream::iter(containers)
                    .map(|container| self.remove_container(container))
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;

                for (name, result) in results {
                    match result {
                        Ok(()) => report.containers_removed.push(name),
                        Err(errors) => {
                            for err in errors {
                                report.record_failure(&name, &err);
                            }
                        }
                    }
                }
            }
            Err(e) => report.record_failure(format!("containers {prefix}*"), &e),
        }

        self.remove_directories(network, workspace, &mut report).await;

        // Names that never got a container are not listed by the runtime.
        self.lifecycle.forget_prefix(&prefix).await;

        report.containers_removed.sort();
        report.directories_removed.sort();

        info!(
            network = %network,
            containers = report.containers_removed.len(),
            directories = report.directories_removed.len(),
            failures = report.failures.len(),
            "Reconciliation finished"
        );
        report
    }

    /// Stops then removes one container. A failed stop does not prevent the
    /// removal attempt.
    async fn remove_container(
        &self,
        container: ContainerInfo,
    ) -> (String, std::result::Result<(), Vec<TestnetError>>) {
        let handle = ContainerHandle::discovered(&container.name, &container.id);
        let mut errors = Vec::new();

        if let Err(e) = self.lifecycle.stop(&handle, self.stop_timeout).await {
            errors.push(e);
        }

        match self.lifecycle.remove(&handle).await {
            Ok(()) if errors.is_empty() => {
                debug!(container = %container.name, "Removed stale container");
                (container.name, Ok(()))
            }
            Ok(()) => (container.name, Err(errors)),
            Err(e) => {
                errors.push(e);
                (container.name, Err(errors))
            }
        }
    }

    async fn remove_directories(&self, network: &str, workspace: &Path, report: &mut CleanupReport) {
        let mut entries = match tokio::fs::read_dir(workspace).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(workspace = %workspace.display(), "Workspace absent, no directories to remove");
                return;
            }
            Err(e) => {
                report.record_failure(workspace.display().to_string(), &e.into());
                return;
            }
        };

        let mut candidates = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if parse_instance_name(network, name).is_none() {
                        continue;
                    }
                    match entry.file_type().await {
                        Ok(kind) if kind.is_dir() => candidates.push(entry.path()),
                        Ok(_) => {}
                        Err(e) => report.record_failure(entry.path().display().to_string(), &e.into()),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    report.record_failure(workspace.display().to_string(), &e.into());
                    break;
                }
            }
        }

        for path in candidates {
            let target = path.clone();
            let result = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&target)).await;
            match result {
                Ok(Ok(())) => report.directories_removed.push(path),
                Ok(Err(e)) => report.record_failure(path.display().to_string(), &e.into()),
                Err(e) => report.record_failure(
                    path.display().to_string(),
                    &TestnetError::runtime(e.to_string()),
                ),
            }
        }
    }
}
