//! Testnet orchestration.
//!
//! [`TestnetOrchestrator`] is the top-level control loop. A provisioning run
//! validates and plans the configuration, optionally reconciles the previous
//! run of the same network, makes the images available, and then brings up
//! every planned instance on a bounded pool of tasks.
//!
//! # Failure policy
//!
//! Configuration, planning, image, repository build and network errors abort
//! the run before any instance task is dispatched and are returned as
//! errors. Failures inside an instance task (workspace, pipe, utility step,
//! container start) only fail that instance and are reported in the
//! [`TestnetReport`]. Runs of the same network are serialised; runs of
//! different networks proceed independently.

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanupReconciler, CleanupReport};
use crate::compose::{self, COMPOSE_FILE};
use crate::config::TestnetConfig;
use crate::container::{
    BuildSpec, ContainerHandle, ContainerImage, ContainerLifecycleManager, InstanceState,
};
use crate::error::{Result, TestnetError};
use crate::image::{ImageProvider, ImageReport};
use crate::logpipe::{LogPipeHandle, LogPipeManager, LogReader, PipeStats};
use crate::plan::{self, repo_build_run_spec, web_run_spec, InstanceSpec, RunState, Testnet};
use crate::report::{InstanceOutcome, OutcomeError, TestnetReport, WebOutcome};
use crate::runtime::ContainerRuntime;

/// Lines of one-shot output kept in error messages.
const OUTPUT_TAIL_LINES: usize = 20;

/// The most recent run of a network.
struct ActiveRun {
    testnet: Testnet,
    pipes: Arc<LogPipeManager>,
}

/// Shared by every task of one provisioning run.
struct RunContext {
    config: TestnetConfig,
    image: ContainerImage,
    lifecycle: Arc<ContainerLifecycleManager>,
    pipes: Arc<LogPipeManager>,
}

/// Provisions and tears down testnets.
pub struct TestnetOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    lifecycle: Arc<ContainerLifecycleManager>,
    images: ImageProvider,
    barriers: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    runs: RwLock<HashMap<String, ActiveRun>>,
}

impl TestnetOrchestrator {
    /// Creates an orchestrator on top of a container runtime.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            lifecycle: Arc::new(ContainerLifecycleManager::new(Arc::clone(&runtime))),
            images: ImageProvider::new(Arc::clone(&runtime)),
            runtime,
            barriers: StdMutex::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the container runtime.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Returns the lifecycle manager shared by all runs.
    pub fn lifecycle(&self) -> &Arc<ContainerLifecycleManager> {
        &self.lifecycle
    }

    /// Provisions a testnet.
    ///
    /// Returns the per-instance report once every instance task has finished.
    /// An `Err` means nothing was started.
    pub async fn provision(&self, config: TestnetConfig) -> Result<TestnetReport> {
        let started_at = Utc::now();

        config.validate()?;
        let plan = plan::plan(&config)?;

        let barrier = self.barrier(&config.network);
        let _exclusive = barrier.lock().await;

        if let Some(previous) = self.runs.write().await.remove(&config.network) {
            debug!(network = %config.network, "Releasing log forwarders of previous run");
            previous.pipes.release_all().await;
        }

        info!(
            network = %config.network,
            instances = plan.len(),
            cleanup = config.cleanup,
            log_mode = ?config.log_mode(),
            "Provisioning testnet"
        );

        let pipes = Arc::new(LogPipeManager::new(config.log_mode()));
        let mut testnet = Testnet::new(config, plan);
        testnet.transition(RunState::Provisioning)?;

        let result = self.run_provisioning(&testnet, &pipes).await;

        let outcome = match result {
            Ok(mut report) => {
                let next = if report.status.is_running() {
                    RunState::Running
                } else {
                    RunState::Failed
                };
                testnet.transition(next)?;
                report.state = testnet.state();
                report.started_at = started_at;
                report.finished_at = Utc::now();
                info!(
                    network = %report.network,
                    status = %report.status,
                    running = report.running_count(),
                    "Provisioning finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(network = %testnet.config().network, error = %e, "Provisioning aborted");
                testnet.transition(RunState::Failed)?;
                Err(e)
            }
        };

        let network = testnet.config().network.clone();
        self.runs
            .write()
            .await
            .insert(network, ActiveRun { testnet, pipes });

        outcome
    }

    async fn run_provisioning(
        &self,
        testnet: &Testnet,
        pipes: &Arc<LogPipeManager>,
    ) -> Result<TestnetReport> {
        let config = testnet.config();
        let plan = testnet.plan();

        let cleanup = if config.cleanup {
            Some(self.reconciler(config).reconcile(&config.network, &config.workspace).await)
        } else {
            None
        };

        let images = self.ensure_images(config).await?;

        if config.build_repo_bins {
            self.build_repo_bins(config).await?;
        }

        self.runtime.ensure_network(&config.network).await?;

        tokio::fs::create_dir_all(&config.workspace)
            .await
            .map_err(|e| TestnetError::workspace_creation_failed(&config.workspace, e.to_string()))?;

        if config.write_compose_file {
            let path = config.workspace.join(COMPOSE_FILE);
            tokio::fs::write(&path, compose::render(config, plan)?).await?;
            info!(path = %path.display(), "Wrote compose file");
        }

        let ctx = Arc::new(RunContext {
            config: config.clone(),
            image: config.node_image(),
            lifecycle: Arc::clone(&self.lifecycle),
            pipes: Arc::clone(pipes),
        });

        let mut instances: Vec<InstanceOutcome> = plan
            .iter()
            .map(|instance| InstanceOutcome {
                name: instance.name.clone(),
                index: instance.index,
                variant: instance.variant,
                state: InstanceState::NotCreated,
                container_id: None,
                log_pipe: None,
                error: None,
            })
            .collect();

        // Every workspace and pipe exists before the first container starts.
        let prepared = run_bounded(plan.instances().to_vec(), config.concurrency, |instance| {
            let ctx = Arc::clone(&ctx);
            async move { prepare_instance(&ctx, &instance).await }
        })
        .await;

        let mut ready = Vec::new();
        for ((outcome, instance), result) in instances.iter_mut().zip(plan).zip(prepared) {
            match result {
                Ok(pipe) => {
                    outcome.log_pipe = pipe.as_ref().map(|p| p.path().to_path_buf());
                    ready.push((outcome.index, instance.clone(), pipe));
                }
                Err(e) => record_failure(outcome, &e),
            }
        }

        let started = run_bounded(ready.clone(), config.concurrency, |(_, instance, pipe)| {
            let ctx = Arc::clone(&ctx);
            async move { start_instance(&ctx, &instance, pipe.as_ref()).await }
        })
        .await;

        for ((index, _, _), result) in ready.iter().zip(started) {
            let Some(outcome) = instances.get_mut(*index as usize) else {
                continue;
            };
            match result {
                Ok(handle) => {
                    outcome.state = InstanceState::Running;
                    outcome.container_id = Some(handle.id);
                }
                Err(e) => record_failure(outcome, &e),
            }
        }

        let web = self.start_web(config).await;
        let status = TestnetReport::status_of(&instances, Some(&web));

        Ok(TestnetReport {
            network: config.network.clone(),
            state: testnet.state(),
            status,
            images,
            instances,
            web: Some(web),
            cleanup,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        })
    }

    async fn ensure_images(&self, config: &TestnetConfig) -> Result<Vec<ImageReport>> {
        let wanted = [
            (config.node_image(), &config.dockerfile, config.build_image),
            (config.web_image(), &config.web_dockerfile, config.build_web_image),
        ];

        let mut reports = Vec::with_capacity(wanted.len());
        for (image, build_file, build_requested) in wanted {
            let build = BuildSpec::new(config.build_file_path(build_file), &config.repo);
            let outcome = self.images.ensure(&image, &build, build_requested).await?;
            info!(image = %image, outcome = ?outcome, "Image ready");
            reports.push(ImageReport {
                image: image.reference().to_string(),
                outcome,
            });
        }
        Ok(reports)
    }

    async fn build_repo_bins(&self, config: &TestnetConfig) -> Result<()> {
        let spec = repo_build_run_spec(config);
        let output = self
            .lifecycle
            .run_once(&spec)
            .await
            .map_err(|e| TestnetError::RepoBuild(e.to_string()))?;

        if !output.success() {
            return Err(TestnetError::RepoBuild(format!(
                "`{}` exited with code {}:\n{}",
                config.repo_build_command,
                output.exit_code,
                output.tail(OUTPUT_TAIL_LINES)
            )));
        }
        info!(repo = %config.repo.display(), "Built repository binaries");
        Ok(())
    }

    async fn start_web(&self, config: &TestnetConfig) -> WebOutcome {
        let spec = web_run_spec(config);
        match self.lifecycle.start(&spec).await {
            Ok(handle) => WebOutcome {
                name: spec.name,
                state: InstanceState::Running,
                container_id: Some(handle.id),
                error: None,
            },
            Err(e) => {
                warn!(container = %spec.name, error = %e, "Web container failed to start");
                WebOutcome {
                    name: spec.name,
                    state: InstanceState::Failed {
                        reason: e.to_string(),
                    },
                    container_id: None,
                    error: Some(OutcomeError::from(&e)),
                }
            }
        }
    }

    /// Tears down the testnet of `config.network`.
    ///
    /// Stops log forwarding, removes every container and instance directory
    /// of the network and removes the network itself. Failures are collected
    /// in the returned report.
    pub async fn teardown(&self, config: &TestnetConfig) -> Result<CleanupReport> {
        let barrier = self.barrier(&config.network);
        let exclusive = barrier.lock().await;

        let previous = self.runs.write().await.remove(&config.network);
        let (mut testnet, pipes) = match previous {
            Some(run) if run.testnet.state().can_transition_to(RunState::CleaningUp) => {
                (run.testnet, run.pipes)
            }
            Some(run) => {
                run.pipes.release_all().await;
                (
                    Testnet::new(config.clone(), teardown_plan(config)),
                    Arc::new(LogPipeManager::new(config.log_mode())),
                )
            }
            None => (
                Testnet::new(config.clone(), teardown_plan(config)),
                Arc::new(LogPipeManager::new(config.log_mode())),
            ),
        };

        info!(network = %config.network, from = %testnet.state(), "Tearing down testnet");
        testnet.transition(RunState::CleaningUp)?;
        pipes.release_all().await;

        let mut report = self
            .reconciler(config)
            .reconcile(&config.network, &config.workspace)
            .await;

        if let Err(e) = self.runtime.remove_network(&config.network).await {
            report.record_failure(format!("network {}", config.network), &e);
        }

        testnet.transition(RunState::Stopped)?;
        self.runs.write().await.insert(
            config.network.clone(),
            ActiveRun {
                testnet,
                pipes: Arc::new(LogPipeManager::new(config.log_mode())),
            },
        );

        info!(
            network = %config.network,
            containers = report.containers_removed.len(),
            failures = report.failures.len(),
            "Teardown finished"
        );

        drop(exclusive);
        self.prune_barrier(&config.network, barrier);
        Ok(report)
    }

    /// Run state of the most recent run of `network`.
    pub async fn state(&self, network: &str) -> Option<RunState> {
        self.runs
            .read()
            .await
            .get(network)
            .map(|run| run.testnet.state())
    }

    /// Attaches a reader to the log pipe of `instance`.
    ///
    /// The reader only observes output produced after attachment.
    pub async fn attach_logs(&self, network: &str, instance: &str) -> Result<LogReader> {
        let handle = self.pipe_handle(network, instance).await?;
        let runs = self.runs.read().await;
        let run = runs
            .get(network)
            .ok_or_else(|| TestnetError::container_not_found(instance))?;
        run.pipes.attach(&handle)
    }

    /// Byte counters of the log pipe of `instance`.
    pub async fn pipe_stats(&self, network: &str, instance: &str) -> Result<PipeStats> {
        Ok(self.pipe_handle(network, instance).await?.stats())
    }

    async fn pipe_handle(&self, network: &str, instance: &str) -> Result<LogPipeHandle> {
        let runs = self.runs.read().await;
        let run = runs
            .get(network)
            .ok_or_else(|| TestnetError::container_not_found(instance))?;
        let spec = run
            .testnet
            .plan()
            .find(instance)
            .ok_or_else(|| TestnetError::container_not_found(instance))?;

        run.pipes.handle(&spec.log_pipe).await.ok_or_else(|| {
            TestnetError::pipe_creation_failed(&spec.log_pipe, "no log pipe for this instance")
        })
    }

    fn reconciler(&self, config: &TestnetConfig) -> CleanupReconciler {
        CleanupReconciler::new(
            Arc::clone(&self.lifecycle),
            config.stop_timeout(),
            config.concurrency,
        )
    }

    fn barrier(&self, network: &str) -> Arc<Mutex<()>> {
        let mut barriers = self.barriers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(barriers.entry(network.to_string()).or_default())
    }

    /// Drops the barrier of `network` unless another caller holds or awaits it.
    fn prune_barrier(&self, network: &str, barrier: Arc<Mutex<()>>) {
        let mut barriers = self.barriers.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&barrier) == 2 {
            barriers.remove(network);
        }
    }
}

impl std::fmt::Debug for TestnetOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestnetOrchestrator")
            .field("runtime", &self.runtime.name())
            .finish_non_exhaustive()
    }
}

/// Creates the workspace directory and log pipe of one instance.
async fn prepare_instance(ctx: &RunContext, instance: &InstanceSpec) -> Result<Option<LogPipeHandle>> {
    tokio::fs::create_dir_all(&instance.workspace)
        .await
        .map_err(|e| TestnetError::workspace_creation_failed(&instance.workspace, e.to_string()))?;

    let pipe = ctx.pipes.create(&instance.log_pipe).await?;
    debug!(instance = %instance.name, pipe = pipe.is_some(), "Instance workspace ready");
    Ok(pipe)
}

/// Runs the utility step, starts the node container and starts forwarding
/// its output.
async fn start_instance(
    ctx: &RunContext,
    instance: &InstanceSpec,
    pipe: Option<&LogPipeHandle>,
) -> Result<ContainerHandle> {
    if let Some(util) = instance.util_run_spec(&ctx.config, &ctx.image) {
        let output = ctx.lifecycle.run_once(&util).await?;
        if !output.success() {
            return Err(TestnetError::container_start_failed(
                &util.name,
                format!(
                    "utility step exited with code {}:\n{}",
                    output.exit_code,
                    output.tail(OUTPUT_TAIL_LINES)
                ),
            ));
        }
    }

    let handle = ctx
        .lifecycle
        .start(&instance.run_spec(&ctx.config, &ctx.image))
        .await?;

    if let Some(pipe) = pipe {
        let logs = ctx.lifecycle.runtime().log_stream(&instance.name);
        ctx.pipes.forward(pipe, logs).await;
    }
    Ok(handle)
}

fn record_failure(outcome: &mut InstanceOutcome, err: &TestnetError) {
    warn!(instance = %outcome.name, kind = %err.kind(), error = %err, "Instance failed");
    outcome.state = InstanceState::Failed {
        reason: err.to_string(),
    };
    outcome.error = Some(OutcomeError::from(err));
}

/// Plan recorded for a teardown. Cleanup only needs the network name and
/// workspace, so a config that no longer plans still tears down.
fn teardown_plan(config: &TestnetConfig) -> plan::Plan {
    plan::plan(config).unwrap_or_else(|e| {
        debug!(network = %config.network, error = %e, "Tearing down without a plan");
        plan::Plan::empty(&config.network, &config.workspace)
    })
}

/// Runs `task` for every item on at most `limit` concurrent tasks.
///
/// Results are returned in item order. A task that panics yields an error
/// for its item instead of being dropped.
async fn run_bounded<I, T, F, Fut>(items: Vec<I>, limit: usize, task: F) -> Vec<Result<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.clamp(1, Semaphore::MAX_PERMITS)));
    let mut set = JoinSet::new();
    let count = items.len();

    for (slot, item) in items.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let fut = task(item);
        set.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => fut.await,
                Err(e) => Err(TestnetError::runtime(e.to_string())),
            };
            (slot, result)
        });
    }

    let mut results: Vec<Option<Result<T>>> = (0..count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((slot, result)) => {
                if let Some(entry) = results.get_mut(slot) {
                    *entry = Some(result);
                }
            }
            Err(e) => warn!(error = %e, "Instance task aborted"),
        }
    }

    results
        .into_iter()
        .map(|result| result.unwrap_or_else(|| Err(TestnetError::runtime("instance task aborted"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use std::path::Path;

    const NODE_IMAGE: &str = "geti2p/kovri:b1d505b2";
    const WEB_IMAGE: &str = "httpd:2.4";

    fn runtime() -> Arc<MockRuntime> {
        Arc::new(MockRuntime::new().with_image(NODE_IMAGE).with_image(WEB_IMAGE))
    }

    fn config(workspace: &Path, nb_base: u32, nb_fw: u32) -> TestnetConfig {
        TestnetConfig {
            workspace: workspace.to_path_buf(),
            network: "testnet".to_string(),
            nb_base,
            nb_fw,
            util_args: String::new(),
            ..TestnetConfig::default()
        }
    }

    #[tokio::test]
    async fn test_provision_and_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime();
        let orchestrator = TestnetOrchestrator::new(runtime.clone());
        let config = config(dir.path(), 2, 1);

        let report = orchestrator.provision(config.clone()).await.unwrap();
        assert_eq!(report.status, crate::report::RunStatus::Running);
        assert_eq!(report.state, RunState::Running);
        assert_eq!(report.running_count(), 3);
        assert!(runtime.has_network("testnet"));
        assert_eq!(orchestrator.state("testnet").await, Some(RunState::Running));

        let cleanup = orchestrator.teardown(&config).await.unwrap();
        assert_eq!(cleanup.containers_removed.len(), 4);
        assert_eq!(cleanup.directories_removed.len(), 3);
        assert!(cleanup.is_clean());
        assert!(runtime.container_names().is_empty());
        assert!(!runtime.has_network("testnet"));
        assert_eq!(orchestrator.state("testnet").await, Some(RunState::Stopped));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = TestnetOrchestrator::new(runtime());
        let config = TestnetConfig {
            concurrency: 0,
            ..config(dir.path(), 1, 0)
        };

        let err = orchestrator.provision(config).await.unwrap_err();
        assert!(matches!(err, TestnetError::ConfigValidation { .. }));
        assert_eq!(orchestrator.state("testnet").await, None);
    }

    #[tokio::test]
    async fn test_plan_overflow_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime();
        runtime.seed_container("testnet_000", true);
        let orchestrator = TestnetOrchestrator::new(runtime.clone());
        let config = TestnetConfig {
            cleanup: true,
            ..config(dir.path(), 1000, 1)
        };

        let err = orchestrator.provision(config).await.unwrap_err();
        assert!(matches!(err, TestnetError::PlanOverflow { .. }));
        assert!(runtime.is_running("testnet_000"));
    }

    #[tokio::test]
    async fn test_concurrency_one_still_provisions_all() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime();
        let orchestrator = TestnetOrchestrator::new(runtime.clone());
        let config = TestnetConfig {
            concurrency: 1,
            ..config(dir.path(), 3, 2)
        };

        let report = orchestrator.provision(config).await.unwrap();
        assert_eq!(report.running_count(), 5);
        let names: Vec<_> = report.instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["testnet_000", "testnet_001", "testnet_002", "testnet_003", "testnet_004"]
        );
    }

    #[tokio::test]
    async fn test_compose_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = TestnetOrchestrator::new(runtime());
        let config = TestnetConfig {
            write_compose_file: true,
            ..config(dir.path(), 1, 0)
        };

        orchestrator.provision(config).await.unwrap();
        let yaml = std::fs::read_to_string(dir.path().join(COMPOSE_FILE)).unwrap();
        assert!(yaml.contains("testnet_000"));
    }

    #[tokio::test]
    async fn test_unknown_instance_logs() {
        let orchestrator = TestnetOrchestrator::new(runtime());
        let err = orchestrator.attach_logs("testnet", "testnet_000").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_teardown_releases_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = TestnetOrchestrator::new(runtime());
        let config = config(dir.path(), 1, 0);

        orchestrator.provision(config.clone()).await.unwrap();
        assert_eq!(orchestrator.barriers.lock().unwrap().len(), 1);

        orchestrator.teardown(&config).await.unwrap();
        assert!(orchestrator.barriers.lock().unwrap().is_empty());

        // A new pass over the network still works.
        let report = orchestrator.provision(config).await.unwrap();
        assert!(report.status.is_running());
    }

    #[tokio::test]
    async fn test_teardown_of_unplannable_config() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime();
        runtime.seed_container("testnet_000", true);
        std::fs::create_dir(dir.path().join("testnet_000")).unwrap();
        let orchestrator = TestnetOrchestrator::new(runtime.clone());

        let report = orchestrator
            .teardown(&config(dir.path(), 1000, 1))
            .await
            .unwrap();
        assert_eq!(report.containers_removed, vec!["testnet_000"]);
        assert_eq!(report.directories_removed.len(), 1);
        assert!(runtime.container_names().is_empty());
        assert_eq!(orchestrator.state("testnet").await, Some(RunState::Stopped));
    }

    #[tokio::test]
    async fn test_run_bounded_keeps_order() {
        let results = run_bounded(vec![3u64, 1, 2], 2, |delay| async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay * 10)).await;
            if delay == 1 {
                Err(TestnetError::runtime("one"))
            } else {
                Ok(delay)
            }
        })
        .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &3);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &2);
    }
}
