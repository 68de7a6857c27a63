//! Run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::cleanup::CleanupReport;
use crate::container::InstanceState;
use crate::error::{ErrorKind, TestnetError};
use crate::image::ImageReport;
use crate::plan::{RunState, Variant};

/// Overall outcome of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every instance and the web container are running.
    Running,

    /// At least one instance runs, others failed.
    RunningPartial {
        /// Names of the failed containers.
        failed: Vec<String>,
    },

    /// No instance could be started.
    Failed,
}

impl RunStatus {
    /// Returns true if at least one instance runs.
    pub fn is_running(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("Running"),
            Self::RunningPartial { .. } => f.write_str("Running (partial)"),
            Self::Failed => f.write_str("Failed"),
        }
    }
}

/// Error attached to a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    /// Error kind.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
}

impl From<&TestnetError> for OutcomeError {
    fn from(err: &TestnetError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Final state of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceOutcome {
    /// Instance name.
    pub name: String,
    /// Plan index.
    pub index: u32,
    /// Variant.
    pub variant: Variant,
    /// Final lifecycle state.
    pub state: InstanceState,
    /// Container ID when started.
    pub container_id: Option<String>,
    /// Log pipe path when one was created.
    pub log_pipe: Option<PathBuf>,
    /// Failure, if any.
    pub error: Option<OutcomeError>,
}

impl InstanceOutcome {
    /// Returns true if the instance is running.
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

/// Outcome of the web container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebOutcome {
    /// Container name.
    pub name: String,
    /// Final lifecycle state.
    pub state: InstanceState,
    /// Container ID when started.
    pub container_id: Option<String>,
    /// Failure, if any.
    pub error: Option<OutcomeError>,
}

/// Structured result of [`provision`](crate::TestnetOrchestrator::provision).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestnetReport {
    /// Network name.
    pub network: String,
    /// Run state after provisioning.
    pub state: RunState,
    /// Overall status.
    pub status: RunStatus,
    /// How each image was obtained.
    pub images: Vec<ImageReport>,
    /// Per-instance outcomes, in plan order.
    pub instances: Vec<InstanceOutcome>,
    /// Web container outcome.
    pub web: Option<WebOutcome>,
    /// Cleanup performed before provisioning.
    pub cleanup: Option<CleanupReport>,
    /// Provisioning start.
    pub started_at: DateTime<Utc>,
    /// Provisioning end.
    pub finished_at: DateTime<Utc>,
}

impl TestnetReport {
    /// Derives the overall status from instance and web outcomes.
    pub fn status_of(instances: &[InstanceOutcome], web: Option<&WebOutcome>) -> RunStatus {
        if !instances.iter().any(InstanceOutcome::is_running) {
            return RunStatus::Failed;
        }

        let failed: Vec<String> = instances
            .iter()
            .filter(|i| !i.is_running())
            .map(|i| i.name.clone())
            .chain(
                web.filter(|w| !w.state.is_running())
                    .map(|w| w.name.clone()),
            )
            .collect();

        if failed.is_empty() {
            RunStatus::Running
        } else {
            RunStatus::RunningPartial { failed }
        }
    }

    /// Outcome of the named instance.
    pub fn instance(&self, name: &str) -> Option<&InstanceOutcome> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Instances that did not reach `Running`.
    pub fn failed_instances(&self) -> impl Iterator<Item = &InstanceOutcome> {
        self.instances.iter().filter(|i| !i.is_running())
    }

    /// Number of running instances.
    pub fn running_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_running()).count()
    }
}

impl fmt::Display for TestnetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "testnet {}: {} ({}/{} instances running)",
            self.network,
            self.status,
            self.running_count(),
            self.instances.len()
        )?;

        for image in &self.images {
            writeln!(f, "  image {}: {:?}", image.image, image.outcome)?;
        }

        for instance in &self.instances {
            write!(f, "  {} [{}]: {}", instance.name, instance.variant, instance.state)?;
            if let Some(err) = &instance.error {
                write!(f, " ({}: {})", err.kind, err.message)?;
            }
            writeln!(f)?;
        }

        if let Some(web) = &self.web {
            write!(f, "  {} [web]: {}", web.name, web.state)?;
            if let Some(err) = &web.error {
                write!(f, " ({}: {})", err.kind, err.message)?;
            }
            writeln!(f)?;
        }

        if let Some(cleanup) = &self.cleanup {
            write!(f, "  {cleanup}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, state: InstanceState) -> InstanceOutcome {
        InstanceOutcome {
            name: name.to_string(),
            index: 0,
            variant: Variant::Base,
            state,
            container_id: None,
            log_pipe: None,
            error: None,
        }
    }

    fn failed() -> InstanceState {
        InstanceState::Failed {
            reason: "boom".to_string(),
        }
    }

    #[test]
    fn test_status_of() {
        let all = [
            outcome("t_000", InstanceState::Running),
            outcome("t_001", InstanceState::Running),
        ];
        assert_eq!(TestnetReport::status_of(&all, None), RunStatus::Running);

        let partial = [outcome("t_000", InstanceState::Running), outcome("t_001", failed())];
        assert_eq!(
            TestnetReport::status_of(&partial, None),
            RunStatus::RunningPartial {
                failed: vec!["t_001".to_string()]
            }
        );

        let none = [outcome("t_000", failed())];
        assert_eq!(TestnetReport::status_of(&none, None), RunStatus::Failed);
    }

    #[test]
    fn test_web_failure_makes_partial() {
        let instances = [outcome("t_000", InstanceState::Running)];
        let web = WebOutcome {
            name: "t_web".to_string(),
            state: failed(),
            container_id: None,
            error: None,
        };
        assert_eq!(
            TestnetReport::status_of(&instances, Some(&web)),
            RunStatus::RunningPartial {
                failed: vec!["t_web".to_string()]
            }
        );
    }

    #[test]
    fn test_status_display_and_json() {
        assert_eq!(
            RunStatus::RunningPartial { failed: vec![] }.to_string(),
            "Running (partial)"
        );

        let json = serde_json::to_value(RunStatus::RunningPartial {
            failed: vec!["t_001".to_string()],
        })
        .unwrap();
        assert_eq!(json["status"], "running_partial");
        assert_eq!(json["failed"][0], "t_001");
    }

    #[test]
    fn test_outcome_error_from() {
        let err = TestnetError::container_start_failed("t_001", "simulated");
        let outcome = OutcomeError::from(&err);
        assert_eq!(outcome.kind, ErrorKind::ContainerStart);
        assert!(outcome.message.contains("t_001"));
    }
}
