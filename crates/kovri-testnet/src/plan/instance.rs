//! Instance specifications.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::TestnetConfig;
use crate::container::{BindMount, ContainerImage, RunSpec};
use crate::plan::{LABEL_INSTANCE, LABEL_NETWORK, LABEL_ROLE, LABEL_VARIANT};

/// The role of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Regular node.
    Base,

    /// Node with restricted connectivity, used to exercise firewall
    /// traversal.
    Firewalled,
}

impl Variant {
    /// Returns the name of this variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Firewalled => "firewalled",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One planned node instance.
///
/// Immutable once planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Ordinal index, unique within a run.
    pub index: u32,

    /// Variant of this instance.
    pub variant: Variant,

    /// Container and directory name, `<network>_<NNN>`.
    pub name: String,

    /// Instance workspace directory.
    pub workspace: PathBuf,

    /// Log pipe path inside the workspace.
    pub log_pipe: PathBuf,

    /// Arguments passed to the node binary.
    pub args: Vec<String>,
}

impl InstanceSpec {
    /// Name of this instance's one-shot utility container.
    pub fn util_name(&self) -> String {
        format!("{}_util", self.name)
    }

    /// Launch specification for the node container.
    pub fn run_spec(&self, config: &TestnetConfig, image: &ContainerImage) -> RunSpec {
        let command = std::iter::once(config.node_binary_path()).chain(self.args.iter().cloned());

        let mut spec = RunSpec::new(&self.name, image.clone())
            .command(command)
            .mount(BindMount::new(&self.workspace, &config.container_data_dir))
            .network(&config.network)
            .label(LABEL_NETWORK, &config.network)
            .label(LABEL_INSTANCE, &self.name)
            .label(LABEL_VARIANT, self.variant.name())
            .label(LABEL_ROLE, "node")
            .discard_logs(config.log_mode().discards());

        if config.use_repo_bins {
            spec = spec.mount(BindMount::new(&config.repo, &config.repo_mount).read_only());
        }
        spec
    }

    /// Launch specification for the utility step, or `None` when no utility
    /// arguments are configured.
    pub fn util_run_spec(&self, config: &TestnetConfig, image: &ContainerImage) -> Option<RunSpec> {
        let args = super::split_args(&config.util_args);
        if args.is_empty() {
            return None;
        }

        let command = std::iter::once(config.util_binary_path()).chain(args);
        let mut spec = RunSpec::new(self.util_name(), image.clone())
            .command(command)
            .working_dir(&config.container_data_dir)
            .mount(BindMount::new(&self.workspace, &config.container_data_dir))
            .label(LABEL_NETWORK, &config.network)
            .label(LABEL_INSTANCE, &self.name)
            .label(LABEL_ROLE, "util");

        if config.use_repo_bins {
            spec = spec.mount(BindMount::new(&config.repo, &config.repo_mount).read_only());
        }
        Some(spec)
    }
}
