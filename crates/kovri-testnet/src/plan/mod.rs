//! Instance planning.
//!
//! [`plan`] expands a [`TestnetConfig`] into the ordered list of instances a
//! run provisions. Planning is pure: the same configuration always yields the
//! same plan, which is what lets cleanup find the resources of a previous run
//! by name alone.
//!
//! Names are `<network>_<NNN>` with a fixed three digit suffix; external log
//! pollers rely on this layout (`cat <workspace>/<network>_010/log_pipe`).

mod instance;
mod testnet;

pub use instance::{InstanceSpec, Variant};
pub use testnet::{RunState, StateChange, Testnet};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::TestnetConfig;
use crate::container::{BindMount, RunSpec};
use crate::error::{Result, TestnetError};
use crate::logpipe::LOG_PIPE_FILE;

/// Width of the zero-padded index suffix.
pub const NAME_WIDTH: usize = 3;

/// Number of distinct instance names per network.
pub const NAME_CAPACITY: u64 = 1000;

/// Label naming the testnet a container belongs to.
pub const LABEL_NETWORK: &str = "kovri.testnet";

/// Label naming the instance a container belongs to.
pub const LABEL_INSTANCE: &str = "kovri.instance";

/// Label carrying the instance variant.
pub const LABEL_VARIANT: &str = "kovri.variant";

/// Label carrying the container role (node, util, web, build).
pub const LABEL_ROLE: &str = "kovri.role";

/// Returns the name of instance `index` in `network`.
pub fn instance_name(network: &str, index: u32) -> String {
    format!("{network}_{index:0width$}", width = NAME_WIDTH)
}

/// Parses an instance name back into its index.
///
/// Only exact `<network>_<NNN>` names match, so web and utility containers
/// or unrelated directories are never mistaken for instances.
pub fn parse_instance_name(network: &str, name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(network)?.strip_prefix('_')?;
    if suffix.len() != NAME_WIDTH || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Name of the web container of `network`.
pub fn web_container_name(network: &str) -> String {
    format!("{network}_web")
}

/// Name of the one-shot repository build container of `network`.
pub fn build_container_name(network: &str) -> String {
    format!("{network}_build")
}

/// Splits an argument string on whitespace.
pub fn split_args(args: &str) -> Vec<String> {
    args.split_whitespace().map(String::from).collect()
}

/// The ordered instances of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    network: String,
    workspace: PathBuf,
    instances: Vec<InstanceSpec>,
}

impl Plan {
    /// A plan with no instances.
    pub fn empty(network: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            network: network.into(),
            workspace: workspace.into(),
            instances: Vec::new(),
        }
    }

    /// Network the plan belongs to.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Workspace root.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Planned instances, ordered by index.
    pub fn instances(&self) -> &[InstanceSpec] {
        &self.instances
    }

    /// Iterates over the planned instances.
    pub fn iter(&self) -> std::slice::Iter<'_, InstanceSpec> {
        self.instances.iter()
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if nothing is planned.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance at `index`.
    pub fn get(&self, index: u32) -> Option<&InstanceSpec> {
        self.instances.get(index as usize)
    }

    /// Instance named `name`.
    pub fn find(&self, name: &str) -> Option<&InstanceSpec> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Instance names in order.
    pub fn names(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.name.as_str()).collect()
    }

    /// Number of instances of `variant`.
    pub fn count(&self, variant: Variant) -> usize {
        self.instances.iter().filter(|i| i.variant == variant).count()
    }
}

impl<'a> IntoIterator for &'a Plan {
    type Item = &'a InstanceSpec;
    type IntoIter = std::slice::Iter<'a, InstanceSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.instances.iter()
    }
}

/// Expands a configuration into its instance plan.
///
/// Base instances come first at indices `0..nb_base`, followed by
/// firewalled instances.
pub fn plan(config: &TestnetConfig) -> Result<Plan> {
    let requested = config.instance_count();
    if requested == 0 {
        return Err(TestnetError::config(
            "nb_base",
            "at least one instance (nb_base + nb_fw) is required",
        ));
    }
    if requested > NAME_CAPACITY {
        return Err(TestnetError::PlanOverflow {
            requested,
            capacity: NAME_CAPACITY,
        });
    }

    let base_args = split_args(&config.bin_args);
    let fw_args = split_args(&config.fw_bin_args);

    let variants = std::iter::repeat(Variant::Base)
        .take(config.nb_base as usize)
        .chain(std::iter::repeat(Variant::Firewalled).take(config.nb_fw as usize));

    let instances = variants
        .zip(0u32..)
        .map(|(variant, index)| {
            let name = instance_name(&config.network, index);
            let workspace = config.workspace.join(&name);
            let args = match variant {
                Variant::Base => base_args.clone(),
                Variant::Firewalled => fw_args.clone(),
            };
            InstanceSpec {
                index,
                variant,
                log_pipe: workspace.join(LOG_PIPE_FILE),
                workspace,
                name,
                args,
            }
        })
        .collect();

    Ok(Plan {
        network: config.network.clone(),
        workspace: config.workspace.clone(),
        instances,
    })
}

/// Launch specification of the web container serving the workspace root.
pub fn web_run_spec(config: &TestnetConfig) -> RunSpec {
    RunSpec::new(web_container_name(&config.network), config.web_image())
        .mount(BindMount::new(&config.workspace, &config.web_root).read_only())
        .network(&config.network)
        .label(LABEL_NETWORK, &config.network)
        .label(LABEL_ROLE, "web")
        .discard_logs(config.log_mode().discards())
}

/// Launch specification of the one-shot repository build.
pub fn repo_build_run_spec(config: &TestnetConfig) -> RunSpec {
    RunSpec::new(build_container_name(&config.network), config.node_image())
        .command(["sh", "-c", config.repo_build_command.as_str()])
        .working_dir(&config.repo_mount)
        .mount(BindMount::new(&config.repo, &config.repo_mount))
        .label(LABEL_NETWORK, &config.network)
        .label(LABEL_ROLE, "build")
}
