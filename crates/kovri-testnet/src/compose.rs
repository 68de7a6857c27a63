//! Compose export.
//!
//! Renders the planned testnet as a docker-compose file so a run can be
//! inspected or reproduced without this engine. Output is deterministic for
//! a given configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::TestnetConfig;
use crate::container::RunSpec;
use crate::error::Result;
use crate::plan::{web_run_spec, Plan};

/// File name of the exported compose file inside the workspace.
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Renders the compose YAML for `plan`.
pub fn render(config: &TestnetConfig, plan: &Plan) -> Result<String> {
    let mut compose = ComposeFile::new();
    compose.add_network(plan.network());

    let image = config.node_image();
    for instance in plan {
        compose.add_service(&instance.run_spec(config, &image));
    }
    compose.add_service(&web_run_spec(config));

    Ok(serde_yaml::to_string(&compose)?)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ComposeFile {
    version: String,
    services: BTreeMap<String, ComposeService>,
    networks: BTreeMap<String, ComposeNetwork>,
}

impl ComposeFile {
    fn new() -> Self {
        Self {
            version: "3.8".to_string(),
            ..Default::default()
        }
    }

    fn add_service(&mut self, spec: &RunSpec) {
        let service = ComposeService {
            image: spec.image.reference().to_string(),
            container_name: spec.name.clone(),
            command: spec.command.clone(),
            working_dir: spec.working_dir.clone(),
            volumes: spec.mounts.iter().map(|m| m.as_bind()).collect(),
            networks: spec.network.iter().cloned().collect(),
            labels: spec.labels.clone(),
            logging: spec.discard_logs.then(|| ComposeLogging {
                driver: "none".to_string(),
            }),
        };
        self.services.insert(spec.name.clone(), service);
    }

    fn add_network(&mut self, name: &str) {
        self.networks.insert(
            name.to_string(),
            ComposeNetwork {
                driver: "bridge".to_string(),
            },
        );
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ComposeService {
    image: String,
    container_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    networks: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logging: Option<ComposeLogging>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ComposeNetwork {
    driver: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ComposeLogging {
    driver: String,
}
