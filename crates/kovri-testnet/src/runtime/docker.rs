//! Docker runtime implementation.
//!
//! This module talks to the Docker Engine API (via bollard) for everything
//! except image builds, which go through the `docker build` toolchain.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, HostConfigLogConfig};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::container::{BuildSpec, ContainerImage, RunSpec};
use crate::error::{Result, TestnetError};
use crate::plan::LABEL_NETWORK;
use crate::runtime::r#trait::{ContainerInfo, ContainerRuntime, LogStream, RunOutput};

/// Container runtime backed by a local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    docker_binary: String,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;

        // Verify connection
        let version = docker.version().await?;

        info!(
            version = version.version.as_deref().unwrap_or("unknown"),
            "Connected to Docker daemon"
        );

        Ok(Self {
            docker,
            docker_binary: "docker".to_string(),
        })
    }

    /// Sets the CLI used for image builds.
    pub fn with_docker_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker_binary = binary.into();
        self
    }

    fn container_config(spec: &RunSpec) -> Config<String> {
        let host_config = HostConfig {
            binds: Some(spec.mounts.iter().map(|m| m.as_bind()).collect()),
            network_mode: spec.network.clone(),
            log_config: spec.discard_logs.then(|| HostConfigLogConfig {
                typ: Some("none".to_string()),
                config: None,
            }),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.reference().to_string()),
            hostname: Some(spec.name.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn create(&self, spec: &RunSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(|e| TestnetError::container_start_failed(&spec.name, e.to_string()))?;

        for warning in &response.warnings {
            warn!(container = %spec.name, warning = %warning, "Container created with warning");
        }

        Ok(response.id)
    }

    async fn collect_logs(&self, name: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(name, Some(options));
        let mut output = String::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(log) => output.push_str(&log.to_string()),
                Err(e) => {
                    debug!(container = %name, error = %e, "Failed to read container logs");
                    break;
                }
            }
        }

        output
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn image_exists(&self, image: &ContainerImage) -> Result<bool> {
        match self.docker.inspect_image(image.reference()).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &ContainerImage) -> Result<()> {
        info!(image = %image, "Pulling image");

        let options = CreateImageOptions {
            from_image: image.name(),
            tag: image.pull_tag(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                    if let Some(error) = info.error {
                        return Err(TestnetError::image_pull_failed(image.reference(), error));
                    }
                }
                Err(e) => {
                    return Err(TestnetError::image_pull_failed(image.reference(), e.to_string()));
                }
            }
        }

        Ok(())
    }

    async fn build_image(&self, image: &ContainerImage, build: &BuildSpec) -> Result<()> {
        info!(
            image = %image,
            build_file = %build.build_file.display(),
            "Building image"
        );

        let output = Command::new(&self.docker_binary)
            .arg("build")
            .arg("-f")
            .arg(&build.build_file)
            .arg("-t")
            .arg(image.reference())
            .arg("--no-cache")
            .arg(&build.context)
            .output()
            .await
            .map_err(|e| {
                TestnetError::image_build_failed(
                    image.reference(),
                    format!("failed to run {}: {e}", self.docker_binary),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let reason = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
            return Err(TestnetError::image_build_failed(
                image.reference(),
                format!("build exited with {}: {reason}", output.status),
            ));
        }

        info!(image = %image, "Built image");
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        let filters: HashMap<String, Vec<String>> =
            [("name".to_string(), vec![name.to_string()])]
                .into_iter()
                .collect();

        let options = ListNetworksOptions { filters };
        let existing = self.docker.list_networks(Some(options)).await?;

        // The name filter matches substrings.
        if existing.iter().any(|n| n.name.as_deref() == Some(name)) {
            debug!(network = %name, "Using existing network");
            return Ok(());
        }

        let labels: HashMap<&str, &str> = [(LABEL_NETWORK, name)].into_iter().collect();
        let config = CreateNetworkOptions {
            name,
            driver: "bridge",
            labels,
            ..Default::default()
        };

        let response = self.docker.create_network(config).await?;
        info!(network = %name, id = ?response.id, "Created network");
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        match self.docker.remove_network(name).await {
            Ok(()) => {
                info!(network = %name, "Removed network");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_and_start(&self, spec: &RunSpec) -> Result<String> {
        let id = self.create(spec).await?;

        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| TestnetError::container_start_failed(&spec.name, e.to_string()))?;

        info!(container = %spec.name, id = %id, "Started container");
        Ok(id)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGTERM" };
        self.docker
            .kill_container(name, Some(options))
            .await
            .map_err(|e| normalize(name, e))?;

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.docker.wait_container(name, Some(options));
        match wait.next().await {
            None | Some(Ok(_)) => Ok(()),
            // Non-zero exit codes surface as errors.
            Some(Err(DockerError::DockerContainerWaitError { .. })) => Ok(()),
            Some(Err(e)) => Err(normalize(name, e)),
        }
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        self.docker
            .kill_container(name, Some(options))
            .await
            .map_err(|e| normalize(name, e))?;

        debug!(container = %name, "Killed container");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| match normalize(name, e) {
                TestnetError::DockerApi(e) => TestnetError::container_remove_failed(name, e.to_string()),
                other => other,
            })?;

        info!(container = %name, "Removed container");
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        let response = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| normalize(name, e))?;

        let state = response.state.unwrap_or_default();
        Ok(ContainerInfo {
            id: response.id.unwrap_or_default(),
            name: response
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            running: state.running.unwrap_or(false),
            exit_code: if state.running == Some(true) {
                None
            } else {
                state.exit_code
            },
        })
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<ContainerInfo>> {
        let filters: HashMap<String, Vec<String>> =
            [("name".to_string(), vec![prefix.to_string()])]
                .into_iter()
                .collect();

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self.docker.list_containers(Some(options)).await?;

        let mut containers: Vec<ContainerInfo> = summaries
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .find(|n| n.starts_with(prefix))?;
                Some(ContainerInfo {
                    id: summary.id.unwrap_or_default(),
                    name,
                    running: summary.state.as_deref() == Some("running"),
                    exit_code: None,
                })
            })
            .collect();

        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    async fn run_to_completion(&self, spec: &RunSpec) -> Result<RunOutput> {
        let id = self.create(spec).await?;

        let outcome: Result<RunOutput> = async {
            self.docker
                .start_container(&id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| TestnetError::container_start_failed(&spec.name, e.to_string()))?;

            debug!(container = %spec.name, "Waiting for one-shot container");

            let options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait = self.docker.wait_container(&id, Some(options));
            let exit_code = match wait.next().await {
                Some(Ok(response)) => response.status_code,
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => return Err(normalize(&spec.name, e)),
                None => {
                    return Err(TestnetError::runtime(format!(
                        "no exit status for {}",
                        spec.name
                    )))
                }
            };

            Ok(RunOutput {
                exit_code,
                output: self.collect_logs(&id).await,
            })
        }
        .await;

        if let Err(e) = self.remove(&id).await {
            warn!(container = %spec.name, error = %e, "Failed to remove one-shot container");
        }

        outcome
    }

    fn log_stream(&self, name: &str) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self.docker.logs(name, Some(options));
        let name = name.to_string();
        stream
            .map(move |chunk| match chunk {
                Ok(output) => Ok(output.into_bytes().to_vec()),
                Err(e) => Err(normalize(&name, e)),
            })
            .boxed()
    }
}

/// Maps Docker "not found" and "not modified / conflict" responses.
fn normalize(name: &str, err: DockerError) -> TestnetError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => TestnetError::container_not_found(name),
        DockerError::DockerResponseServerError {
            status_code: 304 | 409,
            ..
        } => TestnetError::ContainerNotRunning(name.to_string()),
        other => TestnetError::DockerApi(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::BindMount;

    #[test]
    fn test_container_config() {
        let spec = RunSpec::new("kovri-testnet_000", ContainerImage::new("geti2p/kovri"))
            .command(["kovri", "--floodfill", "1"])
            .mount(BindMount::new("/tmp/ws/kovri-testnet_000", "/home/kovri/.kovri"))
            .network("kovri-testnet")
            .label("kovri.instance", "kovri-testnet_000")
            .discard_logs(true);

        let config = DockerRuntime::container_config(&spec);
        assert_eq!(config.image.as_deref(), Some("geti2p/kovri"));
        assert_eq!(
            config.cmd,
            Some(vec![
                "kovri".to_string(),
                "--floodfill".to_string(),
                "1".to_string()
            ])
        );

        let host = config.host_config.unwrap();
        assert_eq!(
            host.binds,
            Some(vec![
                "/tmp/ws/kovri-testnet_000:/home/kovri/.kovri".to_string()
            ])
        );
        assert_eq!(host.network_mode.as_deref(), Some("kovri-testnet"));
        assert_eq!(host.log_config.unwrap().typ.as_deref(), Some("none"));
    }

    #[test]
    fn test_normalize_errors() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(normalize("c", not_found).is_not_found());

        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "is not running".to_string(),
        };
        assert!(normalize("c", conflict).is_already_stopped());

        let server = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(matches!(normalize("c", server), TestnetError::DockerApi(_)));
    }
}
