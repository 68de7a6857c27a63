//! In-memory container runtime for tests.
//!
//! [`MockRuntime`] keeps containers, images and networks in memory and lets
//! tests inject faults: unpullable images, failing builds, failing starts,
//! containers that ignore the stop signal and failing removals.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::container::{BuildSpec, ContainerImage, RunSpec};
use crate::error::{Result, TestnetError};
use crate::logpipe::{is_fifo, LOG_PIPE_FILE};
use crate::runtime::r#trait::{ContainerInfo, ContainerRuntime, LogStream, RunOutput};

/// What the runtime observed when a container was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRecord {
    /// Container name.
    pub name: String,
    /// Every bind-mount source existed.
    pub mounts_ready: bool,
    /// A log pipe existed in one of the mounted directories.
    pub pipe_ready: bool,
}

#[derive(Debug)]
struct MockContainer {
    id: String,
    running: bool,
    exit_code: Option<i64>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

impl MockContainer {
    fn halt(&mut self, exit_code: i64) {
        self.running = false;
        self.exit_code = Some(exit_code);
        self.subscribers.clear();
    }

    fn info(&self, name: &str) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            name: name.to_string(),
            running: self.running,
            exit_code: self.exit_code,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    images: HashSet<String>,
    pullable: HashSet<String>,
    unbuildable: HashSet<String>,
    networks: BTreeSet<String>,
    containers: BTreeMap<String, MockContainer>,
    fail_start: HashSet<String>,
    unresponsive: HashSet<String>,
    fail_remove: HashSet<String>,
    fail_listing: bool,
    exit_codes: HashMap<String, i64>,
    starts: Vec<StartRecord>,
    one_shots: Vec<String>,
    pulls: Vec<String>,
    builds: Vec<String>,
    next_id: u64,
}

impl MockState {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:064x}", self.next_id)
    }

    fn container_mut(&mut self, name: &str) -> Result<&mut MockContainer> {
        self.containers
            .get_mut(name)
            .ok_or_else(|| TestnetError::container_not_found(name))
    }
}

/// In-memory [`ContainerRuntime`].
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    /// Creates an empty runtime with no images.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes an image present locally.
    pub fn with_image(self, reference: &str) -> Self {
        self.state().images.insert(reference.to_string());
        self
    }

    /// Makes an image available from the registry.
    pub fn with_pullable(self, reference: &str) -> Self {
        self.state().pullable.insert(reference.to_string());
        self
    }

    /// Makes builds of an image fail.
    pub fn fail_build(&self, reference: &str) {
        self.state().unbuildable.insert(reference.to_string());
    }

    /// Makes starting the named container fail.
    pub fn fail_start(&self, name: &str) {
        self.state().fail_start.insert(name.to_string());
    }

    /// Clears an injected start failure.
    pub fn allow_start(&self, name: &str) {
        self.state().fail_start.remove(name);
    }

    /// Makes the named container ignore the graceful stop signal.
    pub fn set_unresponsive(&self, name: &str) {
        self.state().unresponsive.insert(name.to_string());
    }

    /// Makes removing the named container fail.
    pub fn fail_remove(&self, name: &str) {
        self.state().fail_remove.insert(name.to_string());
    }

    /// Clears an injected removal failure.
    pub fn allow_remove(&self, name: &str) {
        self.state().fail_remove.remove(name);
    }

    /// Makes container listing fail.
    pub fn fail_listing(&self) {
        self.state().fail_listing = true;
    }

    /// Sets the exit code of a one-shot container.
    pub fn set_exit_code(&self, name: &str, code: i64) {
        self.state().exit_codes.insert(name.to_string(), code);
    }

    /// Adds a container left behind by an earlier run.
    pub fn seed_container(&self, name: &str, running: bool) {
        let mut state = self.state();
        let id = state.allocate_id();
        state.containers.insert(
            name.to_string(),
            MockContainer {
                id,
                running,
                exit_code: (!running).then_some(0),
                subscribers: Vec::new(),
            },
        );
    }

    /// Emits a log chunk on a container's standard streams.
    ///
    /// Returns the number of followers that received it.
    pub fn emit_log(&self, name: &str, chunk: &[u8]) -> usize {
        let mut state = self.state();
        let Some(container) = state.containers.get_mut(name) else {
            return 0;
        };
        container
            .subscribers
            .retain(|tx| tx.unbounded_send(chunk.to_vec()).is_ok());
        container.subscribers.len()
    }

    /// Names of started containers, in start order.
    pub fn started(&self) -> Vec<String> {
        self.state().starts.iter().map(|s| s.name.clone()).collect()
    }

    /// Observations made at each start.
    pub fn start_records(&self) -> Vec<StartRecord> {
        self.state().starts.clone()
    }

    /// Names of one-shot containers that ran.
    pub fn one_shots(&self) -> Vec<String> {
        self.state().one_shots.clone()
    }

    /// Names of existing containers.
    pub fn container_names(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    /// Returns true if the named container exists and runs.
    pub fn is_running(&self, name: &str) -> bool {
        self.state()
            .containers
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    /// Images pulled so far.
    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }

    /// Images built so far.
    pub fn builds(&self) -> Vec<String> {
        self.state().builds.clone()
    }

    /// Returns true if the network exists.
    pub fn has_network(&self, name: &str) -> bool {
        self.state().networks.contains(name)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn image_exists(&self, image: &ContainerImage) -> Result<bool> {
        Ok(self.state().images.contains(image.reference()))
    }

    async fn pull_image(&self, image: &ContainerImage) -> Result<()> {
        let mut state = self.state();
        if !state.pullable.contains(image.reference()) {
            return Err(TestnetError::image_pull_failed(
                image.reference(),
                "manifest unknown",
            ));
        }
        state.pulls.push(image.reference().to_string());
        state.images.insert(image.reference().to_string());
        Ok(())
    }

    async fn build_image(&self, image: &ContainerImage, _build: &BuildSpec) -> Result<()> {
        let mut state = self.state();
        if state.unbuildable.contains(image.reference()) {
            return Err(TestnetError::image_build_failed(
                image.reference(),
                "build step failed",
            ));
        }
        state.builds.push(image.reference().to_string());
        state.images.insert(image.reference().to_string());
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.state().networks.insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.state().networks.remove(name);
        Ok(())
    }

    async fn create_and_start(&self, spec: &RunSpec) -> Result<String> {
        let mounts_ready = spec.mounts.iter().all(|m| m.source.exists());
        let pipe_ready = spec
            .mounts
            .iter()
            .any(|m| is_fifo(&m.source.join(LOG_PIPE_FILE)));

        let mut state = self.state();
        if state.fail_start.contains(&spec.name) {
            return Err(TestnetError::container_start_failed(
                &spec.name,
                "simulated runtime fault",
            ));
        }
        if !state.images.contains(spec.image.reference()) {
            return Err(TestnetError::container_start_failed(
                &spec.name,
                format!("no such image: {}", spec.image),
            ));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(TestnetError::container_start_failed(
                &spec.name,
                "name already in use",
            ));
        }

        let id = state.allocate_id();
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                running: true,
                exit_code: None,
                subscribers: Vec::new(),
            },
        );
        state.starts.push(StartRecord {
            name: spec.name.clone(),
            mounts_ready,
            pipe_ready,
        });
        Ok(id)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state();
            let unresponsive = state.unresponsive.contains(name);
            let container = state.container_mut(name)?;
            if !container.running {
                return Err(TestnetError::ContainerNotRunning(name.to_string()));
            }
            if !unresponsive {
                container.halt(0);
                return Ok(());
            }
        }
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        let container = state.container_mut(name)?;
        if !container.running {
            return Err(TestnetError::ContainerNotRunning(name.to_string()));
        }
        container.halt(137);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_remove.contains(name) {
            return Err(TestnetError::container_remove_failed(name, "device or resource busy"));
        }
        state
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TestnetError::container_not_found(name))
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        let mut state = self.state();
        Ok(state.container_mut(name)?.info(name))
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<ContainerInfo>> {
        let state = self.state();
        if state.fail_listing {
            return Err(TestnetError::runtime("listing containers failed"));
        }
        Ok(state
            .containers
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, c)| c.info(name))
            .collect())
    }

    async fn run_to_completion(&self, spec: &RunSpec) -> Result<RunOutput> {
        let mut state = self.state();
        if state.fail_start.contains(&spec.name) {
            return Err(TestnetError::container_start_failed(
                &spec.name,
                "simulated runtime fault",
            ));
        }
        state.one_shots.push(spec.name.clone());
        let exit_code = state.exit_codes.get(&spec.name).copied().unwrap_or(0);
        Ok(RunOutput {
            exit_code,
            output: format!("{}\n", spec.command.join(" ")),
        })
    }

    fn log_stream(&self, name: &str) -> LogStream {
        let mut state = self.state();
        match state.containers.get_mut(name) {
            Some(container) if container.running => {
                let (tx, rx) = mpsc::unbounded();
                container.subscribers.push(tx);
                rx.map(Ok).boxed()
            }
            Some(_) => futures::stream::empty().boxed(),
            None => {
                futures::stream::once(futures::future::ready(Err(
                    TestnetError::container_not_found(name),
                )))
                .boxed()
            }
        }
    }
}
