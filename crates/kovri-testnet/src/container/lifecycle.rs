//! Container lifecycle management.
//!
//! [`ContainerLifecycleManager`] is the only component that starts, stops and
//! removes workload containers. It tracks a per-container state machine and
//! keeps a bounded history of transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::container::RunSpec;
use crate::error::{Result, TestnetError};
use crate::runtime::{ContainerInfo, ContainerRuntime, RunOutput};

/// Handle to a started container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Container ID assigned by the runtime.
    pub id: String,

    /// Container name.
    pub name: String,

    /// When this manager started the container, if it did.
    pub started_at: Option<DateTime<Utc>>,
}

impl ContainerHandle {
    /// Creates a handle for a container found on the runtime rather than
    /// started by this manager.
    pub fn discovered(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            started_at: None,
        }
    }

    /// Returns the short container ID (first 12 characters).
    pub fn short_id(&self) -> &str {
        if self.id.len() > 12 {
            &self.id[..12]
        } else {
            &self.id
        }
    }
}

/// Per-container lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceState {
    /// No container exists yet.
    NotCreated,

    /// The container is being created and started.
    Starting,

    /// The container is running.
    Running,

    /// A stop is in progress.
    Stopping,

    /// The container has exited.
    Stopped,

    /// The runtime no longer knows the container.
    Removed,

    /// An operation on the container failed.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

impl InstanceState {
    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: &InstanceState) -> bool {
        use InstanceState::*;

        matches!(
            (self, next),
            (NotCreated | Removed | Failed { .. }, Starting)
                | (Starting, Running)
                | (Starting, Failed { .. })
                | (Running, Stopping)
                | (Running, Failed { .. })
                | (Stopping, Stopped)
                | (Stopping, Failed { .. })
                | (Stopped, Removed)
                | (Failed { .. }, Stopping)
                | (Failed { .. }, Removed)
        )
    }

    /// Returns the state name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotCreated => "NotCreated",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Removed => "Removed",
            Self::Failed { .. } => "Failed",
        }
    }

    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if this is the failed state.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a stop completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The container exited within the grace period.
    Graceful,
    /// The container was killed, immediately or after the grace period.
    Forced,
    /// The container was not running.
    AlreadyStopped,
}

/// Recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Container name.
    pub name: String,

    /// State entered.
    pub state: InstanceState,

    /// When the state was entered.
    pub at: DateTime<Utc>,
}

/// Starts, stops and removes containers through a [`ContainerRuntime`].
pub struct ContainerLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,

    /// Current state per container name.
    states: Arc<RwLock<HashMap<String, InstanceState>>>,

    /// Event history.
    events: Arc<RwLock<Vec<LifecycleEvent>>>,

    /// Maximum events to keep in history.
    max_events: usize,
}

impl ContainerLifecycleManager {
    /// Creates a lifecycle manager on top of a runtime.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            states: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(Vec::new())),
            max_events: 10_000,
        }
    }

    /// Sets the event history limit.
    pub fn with_event_limit(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Returns the underlying runtime.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Starts a container.
    ///
    /// Safe to call concurrently for different names.
    /// A name that is still live (starting, running or stopping) is a
    /// collision and fails like any other start.
    pub async fn start(&self, spec: &RunSpec) -> Result<ContainerHandle> {
        if let Err(e) = self.transition(&spec.name, InstanceState::Starting).await {
            warn!(container = %spec.name, error = %e, "Container name already in use");
            return Err(TestnetError::container_start_failed(
                &spec.name,
                format!("name already in use: {e}"),
            ));
        }
        debug!(container = %spec.name, image = %spec.image, "Starting container");

        match self.runtime.create_and_start(spec).await {
            Ok(id) => {
                self.transition(&spec.name, InstanceState::Running).await?;
                info!(container = %spec.name, id = %id, "Container running");
                Ok(ContainerHandle {
                    id,
                    name: spec.name.clone(),
                    started_at: Some(Utc::now()),
                })
            }
            Err(e) => {
                let err = match e {
                    TestnetError::ContainerStart { .. } => e,
                    other => TestnetError::container_start_failed(&spec.name, other.to_string()),
                };
                self.fail(&spec.name, &err).await;
                Err(err)
            }
        }
    }

    /// Stops a container, killing it if it outlives `timeout`.
    ///
    /// A zero timeout kills immediately. Running past the grace period is
    /// reported as [`StopOutcome::Forced`], not as an error.
    pub async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<StopOutcome> {
        let name = handle.name.as_str();
        self.adopt(name, InstanceState::Running).await;

        if matches!(
            self.state(name).await,
            InstanceState::Stopped | InstanceState::Removed
        ) {
            return Ok(StopOutcome::AlreadyStopped);
        }
        self.transition(name, InstanceState::Stopping).await?;

        let result = if timeout.is_zero() {
            self.force(name).await
        } else {
            match tokio::time::timeout(timeout, self.runtime.stop(name)).await {
                Ok(Ok(())) => Ok(StopOutcome::Graceful),
                Ok(Err(e)) if e.is_already_stopped() => Ok(StopOutcome::AlreadyStopped),
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    warn!(
                        container = %name,
                        timeout_secs = timeout.as_secs_f64(),
                        "Grace period expired, killing container"
                    );
                    self.force(name).await
                }
            }
        };

        match result {
            Ok(outcome) => {
                self.transition(name, InstanceState::Stopped).await?;
                info!(container = %name, outcome = ?outcome, "Container stopped");
                Ok(outcome)
            }
            Err(e) => {
                let err = TestnetError::container_stop_failed(name, e.to_string());
                self.fail(name, &err).await;
                Err(err)
            }
        }
    }

    async fn force(&self, name: &str) -> Result<StopOutcome> {
        match self.runtime.kill(name).await {
            Ok(()) => Ok(StopOutcome::Forced),
            Err(e) if e.is_already_stopped() => Ok(StopOutcome::AlreadyStopped),
            Err(e) => Err(e),
        }
    }

    /// Removes a stopped or failed container.
    ///
    /// Removing a container the runtime does not know is not an error.
    pub async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let name = handle.name.as_str();
        self.adopt(name, InstanceState::Stopped).await;

        let current = self.state(name).await;
        if current == InstanceState::Removed {
            return Ok(());
        }
        if !current.can_transition_to(&InstanceState::Removed) {
            return Err(TestnetError::invalid_state_transition(
                current.name(),
                InstanceState::Removed.name(),
            ));
        }

        match self.runtime.remove(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(container = %name, "Container already gone");
            }
            Err(e) => {
                return Err(match e {
                    TestnetError::ContainerRemove { .. } => e,
                    other => TestnetError::container_remove_failed(name, other.to_string()),
                });
            }
        }

        self.transition(name, InstanceState::Removed).await
    }

    /// Inspects a container.
    pub async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerInfo> {
        self.runtime.inspect(&handle.name).await
    }

    /// Runs a one-shot container to completion.
    pub async fn run_once(&self, spec: &RunSpec) -> Result<RunOutput> {
        info!(container = %spec.name, command = ?spec.command, "Running one-shot container");
        let output = self.runtime.run_to_completion(spec).await?;
        debug!(container = %spec.name, exit_code = output.exit_code, "One-shot container finished");
        Ok(output)
    }

    /// Returns the current state of a container.
    pub async fn state(&self, name: &str) -> InstanceState {
        self.states
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or(InstanceState::NotCreated)
    }

    /// Stops tracking every container whose name starts with `prefix`,
    /// except those still live. Returns the number of names dropped.
    pub async fn forget_prefix(&self, prefix: &str) -> usize {
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|name, state| {
            !name.starts_with(prefix)
                || matches!(
                    state,
                    InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
                )
        });
        let dropped = before - states.len();
        if dropped > 0 {
            debug!(prefix = %prefix, dropped, "Forgot container states");
        }
        dropped
    }

    /// Returns all tracked states.
    pub async fn states(&self) -> HashMap<String, InstanceState> {
        self.states.read().await.clone()
    }

    /// Gets events for a container.
    pub async fn events_for(&self, name: &str) -> Vec<LifecycleEvent> {
        let events = self.events.read().await;
        events.iter().filter(|e| e.name == name).cloned().collect()
    }

    async fn transition(&self, name: &str, next: InstanceState) -> Result<()> {
        {
            let mut states = self.states.write().await;
            let current = states.get(name).cloned().unwrap_or(InstanceState::NotCreated);
            if !current.can_transition_to(&next) {
                return Err(TestnetError::invalid_state_transition(
                    current.name(),
                    next.name(),
                ));
            }
            states.insert(name.to_string(), next.clone());
        }
        self.record_event(name, next).await;
        Ok(())
    }

    async fn fail(&self, name: &str, err: &TestnetError) {
        let failed = InstanceState::Failed {
            reason: err.to_string(),
        };
        if let Err(e) = self.transition(name, failed).await {
            warn!(container = %name, error = %e, "Could not record failure");
        }
    }

    /// Starts tracking a container this manager did not start.
    async fn adopt(&self, name: &str, assumed: InstanceState) {
        let adopted = {
            let mut states = self.states.write().await;
            if states.contains_key(name) {
                false
            } else {
                states.insert(name.to_string(), assumed.clone());
                true
            }
        };
        if adopted {
            debug!(container = %name, state = %assumed, "Tracking discovered container");
            self.record_event(name, assumed).await;
        }
    }

    async fn record_event(&self, name: &str, state: InstanceState) {
        let mut events = self.events.write().await;
        events.push(LifecycleEvent {
            name: name.to_string(),
            state,
            at: Utc::now(),
        });

        // Trim if necessary
        if events.len() > self.max_events {
            let drain_count = events.len() - self.max_events;
            events.drain(..drain_count);
        }
    }
}

impl std::fmt::Debug for ContainerLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLifecycleManager")
            .field("runtime", &self.runtime.name())
            .field("max_events", &self.max_events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerImage;
    use crate::error::ErrorKind;
    use crate::runtime::MockRuntime;
    use std::time::Instant;

    fn setup() -> (Arc<MockRuntime>, ContainerLifecycleManager) {
        let runtime = Arc::new(MockRuntime::new().with_image("geti2p/kovri"));
        let manager = ContainerLifecycleManager::new(runtime.clone());
        (runtime, manager)
    }

    fn spec(name: &str) -> RunSpec {
        RunSpec::new(name, ContainerImage::new("geti2p/kovri"))
    }

    #[test]
    fn test_state_transitions() {
        use InstanceState::*;

        assert!(NotCreated.can_transition_to(&Starting));
        assert!(Starting.can_transition_to(&Running));
        assert!(Running.can_transition_to(&Stopping));
        assert!(Stopping.can_transition_to(&Stopped));
        assert!(Stopped.can_transition_to(&Removed));
        assert!(Removed.can_transition_to(&Starting));
        assert!(Failed {
            reason: "x".to_string()
        }
        .can_transition_to(&Starting));

        let failed = Failed {
            reason: "x".to_string(),
        };
        assert!(Starting.can_transition_to(&failed));
        assert!(Running.can_transition_to(&failed));
        assert!(!NotCreated.can_transition_to(&failed));
        assert!(!Running.can_transition_to(&Starting));
        assert!(!Stopped.can_transition_to(&Running));
    }

    #[test]
    fn test_short_id() {
        let handle = ContainerHandle::discovered("net_000", "abc123def456789012345678");
        assert_eq!(handle.short_id(), "abc123def456");
        assert!(handle.started_at.is_none());
    }

    #[tokio::test]
    async fn test_start_stop_remove() {
        let (runtime, manager) = setup();

        let handle = manager.start(&spec("net_000")).await.unwrap();
        assert!(manager.state("net_000").await.is_running());
        assert!(runtime.is_running("net_000"));

        let outcome = manager
            .stop(&handle, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(manager.state("net_000").await, InstanceState::Stopped);

        manager.remove(&handle).await.unwrap();
        assert_eq!(manager.state("net_000").await, InstanceState::Removed);
        assert!(runtime.container_names().is_empty());

        // Idempotent
        manager.remove(&handle).await.unwrap();
        assert_eq!(manager.events_for("net_000").await.len(), 5);
    }

    #[tokio::test]
    async fn test_start_failure_isolated() {
        let (runtime, manager) = setup();
        runtime.fail_start("net_001");

        manager.start(&spec("net_000")).await.unwrap();
        let err = manager.start(&spec("net_001")).await.unwrap_err();

        assert!(matches!(err, TestnetError::ContainerStart { .. }));
        assert!(manager.state("net_001").await.is_failed());
        assert!(manager.state("net_000").await.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_failed_start() {
        let (runtime, manager) = setup();
        runtime.fail_start("net_001");
        manager.start(&spec("net_001")).await.unwrap_err();

        runtime.allow_start("net_001");
        manager.start(&spec("net_001")).await.unwrap();
        assert!(manager.state("net_001").await.is_running());
    }

    #[tokio::test]
    async fn test_start_of_live_name_is_start_error() {
        let (runtime, manager) = setup();
        manager.start(&spec("net_000")).await.unwrap();

        let err = manager.start(&spec("net_000")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerStart);
        assert!(manager.state("net_000").await.is_running());
        assert!(runtime.is_running("net_000"));
    }

    #[tokio::test]
    async fn test_forget_prefix_keeps_live_containers() {
        let (runtime, manager) = setup();
        runtime.fail_start("net_001");
        let handle = manager.start(&spec("net_000")).await.unwrap();
        manager.start(&spec("net_001")).await.unwrap_err();
        manager.start(&spec("other_000")).await.unwrap();

        assert_eq!(manager.forget_prefix("net_").await, 1);
        assert_eq!(manager.state("net_001").await, InstanceState::NotCreated);
        assert!(manager.state("net_000").await.is_running());

        manager.stop(&handle, Duration::ZERO).await.unwrap();
        assert_eq!(manager.forget_prefix("net_").await, 1);
        assert!(manager.state("other_000").await.is_running());
    }

    #[tokio::test]
    async fn test_zero_timeout_kills_immediately() {
        let (runtime, manager) = setup();
        let handle = manager.start(&spec("net_000")).await.unwrap();
        runtime.set_unresponsive("net_000");

        let begin = Instant::now();
        let outcome = manager.stop(&handle, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_grace_period_expiry_forces() {
        let (runtime, manager) = setup();
        let handle = manager.start(&spec("net_000")).await.unwrap();
        runtime.set_unresponsive("net_000");

        let outcome = manager
            .stop(&handle, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert!(!runtime.is_running("net_000"));
    }

    #[tokio::test]
    async fn test_stop_discovered_stopped_container() {
        let (runtime, manager) = setup();
        runtime.seed_container("net_007", false);

        let handle = ContainerHandle::discovered("net_007", "id");
        let outcome = manager.stop(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyStopped);
        manager.remove(&handle).await.unwrap();
        assert!(runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_remove_running_rejected() {
        let (_runtime, manager) = setup();
        let handle = manager.start(&spec("net_000")).await.unwrap();

        let err = manager.remove(&handle).await.unwrap_err();
        assert!(matches!(err, TestnetError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_remove_failure_reported() {
        let (runtime, manager) = setup();
        let handle = manager.start(&spec("net_000")).await.unwrap();
        manager.stop(&handle, Duration::ZERO).await.unwrap();
        runtime.fail_remove("net_000");

        let err = manager.remove(&handle).await.unwrap_err();
        assert!(matches!(err, TestnetError::ContainerRemove { .. }));
        assert_eq!(manager.state("net_000").await, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_event_limit() {
        let runtime = Arc::new(MockRuntime::new().with_image("geti2p/kovri"));
        let manager = ContainerLifecycleManager::new(runtime).with_event_limit(3);

        for i in 0..4 {
            manager.start(&spec(&format!("net_00{i}"))).await.unwrap();
        }
        assert_eq!(manager.events.read().await.len(), 3);
    }
}
