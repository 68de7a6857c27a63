//! Testnet configuration and form intake.
//!
//! [`TestnetConfig`] is the typed result of a submitted configuration. It can
//! be deserialised directly (every field has a default) or produced from raw
//! form fields through [`TestnetConfig::from_fields`], which applies one
//! canonical parse rule per option.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::container::ContainerImage;
use crate::error::{Result, TestnetError};
use crate::logpipe::LogMode;

/// Prefix used by the original configuration form for every field name.
const FORM_PREFIX: &str = "kovri_";

/// Values that mark a checkbox as checked.
const TRUE_TOKENS: &[&str] = &["y", "yes", "on", "true", "1", "checked"];

/// Upper bound on concurrent instance tasks.
pub const MAX_CONCURRENCY: usize = 1024;

/// Configuration of one testnet run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestnetConfig {
    /// Root directory holding one subdirectory per instance.
    pub workspace: PathBuf,

    /// Network name; namespaces every container, directory and network.
    pub network: String,

    /// Local source repository (build context and repo binaries).
    pub repo: PathBuf,

    /// Node image reference.
    pub image: String,

    /// Web image reference.
    pub web_image: String,

    /// Build file for the node image.
    pub dockerfile: String,

    /// Build file for the web image.
    pub web_dockerfile: String,

    /// Arguments for base instances.
    pub bin_args: String,

    /// Arguments for firewalled instances.
    pub fw_bin_args: String,

    /// Arguments for the per-instance utility step.
    pub util_args: String,

    /// Number of base instances.
    pub nb_base: u32,

    /// Number of firewalled instances.
    pub nb_fw: u32,

    /// Stop grace period in seconds (0 = immediate kill).
    pub stop_timeout: u64,

    /// Build the node image instead of pulling it.
    pub build_image: bool,

    /// Build the web image instead of pulling it.
    pub build_web_image: bool,

    /// Run the node binary from the mounted repository.
    pub use_repo_bins: bool,

    /// Build the repository binaries inside a container first.
    pub build_repo_bins: bool,

    /// Remove the previous run of this network before provisioning.
    pub cleanup: bool,

    /// Stream instance logs through named pipes.
    pub use_named_pipes: bool,

    /// Discard instance logs entirely.
    pub disable_monitoring: bool,

    /// Maximum number of instances provisioned concurrently.
    pub concurrency: usize,

    /// Mount target of the instance workspace inside the container.
    pub container_data_dir: String,

    /// Node binary name.
    pub node_binary: String,

    /// Utility binary name.
    pub util_binary: String,

    /// Mount target of the repository inside the container.
    pub repo_mount: String,

    /// Shell command building the repository binaries.
    pub repo_build_command: String,

    /// Directory inside the repository that holds the build files.
    pub build_file_dir: PathBuf,

    /// Document root of the web container.
    pub web_root: String,

    /// Write `<workspace>/docker-compose.yml` when provisioning.
    pub write_compose_file: bool,
}

impl Default for TestnetConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("/tmp/kovri/contrib/testnet/testnet"),
            network: "kovri-testnet".to_string(),
            repo: PathBuf::from("/tmp/kovri"),
            image: "geti2p/kovri:b1d505b2".to_string(),
            web_image: "httpd:2.4".to_string(),
            dockerfile: "Dockerfile.alpine".to_string(),
            web_dockerfile: "Dockerfile.apache".to_string(),
            bin_args: "--floodfill 1 --enable-su3-verification 0 --log-auto-flush 1 --enable-https 0"
                .to_string(),
            fw_bin_args: "--floodfill 0 --enable-su3-verification 0 --log-auto-flush 1".to_string(),
            util_args: "--floodfill 1 --bandwidth P".to_string(),
            nb_base: 1,
            nb_fw: 0,
            stop_timeout: 0,
            build_image: false,
            build_web_image: false,
            use_repo_bins: false,
            build_repo_bins: false,
            cleanup: false,
            use_named_pipes: true,
            disable_monitoring: false,
            concurrency: 8,
            container_data_dir: "/home/kovri/.kovri".to_string(),
            node_binary: "kovri".to_string(),
            util_binary: "kovri-util".to_string(),
            repo_mount: "/home/kovri/kovri".to_string(),
            repo_build_command: "make".to_string(),
            build_file_dir: PathBuf::from("contrib/docker"),
            web_root: "/usr/local/apache2/htdocs".to_string(),
            write_compose_file: false,
        }
    }
}

impl TestnetConfig {
    /// Builds a configuration from a full form submission.
    ///
    /// Absent fields keep their defaults, except boolean flags, which are
    /// `false` unless their checkbox value is present. Unknown fields are
    /// ignored. The result is validated.
    pub fn from_fields<I, K, V>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self {
            use_named_pipes: false,
            ..Self::default()
        };
        config.apply_fields(fields)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies individual fields on top of this configuration.
    ///
    /// Unlike [`from_fields`](Self::from_fields), absent booleans are left
    /// untouched. Does not validate.
    pub fn apply_fields<I, K, V>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in fields {
            let key = key.as_ref().trim();
            let name = key.strip_prefix(FORM_PREFIX).unwrap_or(key);
            self.apply_field(name, value.as_ref().trim())?;
        }
        Ok(())
    }

    fn apply_field(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "workspace" => self.workspace = PathBuf::from(non_empty(name, value)?),
            "network" => self.network = non_empty(name, value)?,
            "repo" => self.repo = PathBuf::from(non_empty(name, value)?),
            "image" => self.image = non_empty(name, value)?,
            "web_image" => self.web_image = non_empty(name, value)?,
            "dockerfile" => self.dockerfile = non_empty(name, value)?,
            "web_dockerfile" => self.web_dockerfile = non_empty(name, value)?,
            "bin_args" => self.bin_args = value.to_string(),
            "fw_bin_args" => self.fw_bin_args = value.to_string(),
            "util_args" => self.util_args = value.to_string(),
            "nb_base" => self.nb_base = parse_count(name, value)?,
            "nb_fw" => self.nb_fw = parse_count(name, value)?,
            "stop_timeout" => {
                self.stop_timeout = value.parse().map_err(|_| {
                    TestnetError::config(name, format!("`{value}` is not a number of seconds"))
                })?
            }
            "concurrency" => self.concurrency = parse_count(name, value)? as usize,
            "build_image" => self.build_image = is_checked(value),
            "build_web_image" => self.build_web_image = is_checked(value),
            "use_repo_bins" => self.use_repo_bins = is_checked(value),
            "build_repo_bins" => self.build_repo_bins = is_checked(value),
            "cleanup" => self.cleanup = is_checked(value),
            "use_named_pipes" => self.use_named_pipes = is_checked(value),
            "disable_monitoring" => self.disable_monitoring = is_checked(value),
            "write_compose_file" => self.write_compose_file = is_checked(value),
            other => debug!(field = %other, "Ignoring unknown configuration field"),
        }
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.workspace.as_os_str().is_empty() {
            return Err(TestnetError::config("workspace", "must not be empty"));
        }
        if self.repo.as_os_str().is_empty() {
            return Err(TestnetError::config("repo", "must not be empty"));
        }
        validate_network_name(&self.network)?;

        for (field, reference) in [("image", &self.image), ("web_image", &self.web_image)] {
            if reference.trim().is_empty() {
                return Err(TestnetError::config(field, "must not be empty"));
            }
            if reference.chars().any(char::is_whitespace) {
                return Err(TestnetError::config(field, "must not contain whitespace"));
            }
        }

        if self.build_image && self.dockerfile.trim().is_empty() {
            return Err(TestnetError::config("dockerfile", "required when building the image"));
        }
        if self.build_web_image && self.web_dockerfile.trim().is_empty() {
            return Err(TestnetError::config(
                "web_dockerfile",
                "required when building the web image",
            ));
        }

        if self.instance_count() == 0 {
            return Err(TestnetError::config(
                "nb_base",
                "at least one instance (nb_base + nb_fw) is required",
            ));
        }

        if self.concurrency == 0 {
            return Err(TestnetError::config("concurrency", "must be at least 1"));
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(TestnetError::config(
                "concurrency",
                format!("must be at most {MAX_CONCURRENCY}"),
            ));
        }

        Ok(())
    }

    /// Total number of instances requested.
    pub fn instance_count(&self) -> u64 {
        u64::from(self.nb_base) + u64::from(self.nb_fw)
    }

    /// Stop grace period.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }

    /// How instance logs are handled.
    pub fn log_mode(&self) -> LogMode {
        if self.disable_monitoring {
            LogMode::Discard
        } else if self.use_named_pipes {
            LogMode::NamedPipes
        } else {
            LogMode::RuntimeDefault
        }
    }

    /// Node image.
    pub fn node_image(&self) -> ContainerImage {
        ContainerImage::new(&self.image)
    }

    /// Web image.
    pub fn web_image(&self) -> ContainerImage {
        ContainerImage::new(&self.web_image)
    }

    /// Resolves a build file name against the repository build-file directory.
    pub fn build_file_path(&self, build_file: &str) -> PathBuf {
        let path = Path::new(build_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo.join(&self.build_file_dir).join(path)
        }
    }

    /// Path of the node binary inside the container.
    pub fn node_binary_path(&self) -> String {
        self.binary_path(&self.node_binary)
    }

    /// Path of the utility binary inside the container.
    pub fn util_binary_path(&self) -> String {
        self.binary_path(&self.util_binary)
    }

    fn binary_path(&self, binary: &str) -> String {
        if self.use_repo_bins {
            format!("{}/build/{}", self.repo_mount.trim_end_matches('/'), binary)
        } else {
            binary.to_string()
        }
    }

    /// Whether the repository has to be mounted into node containers.
    pub fn mounts_repo(&self) -> bool {
        self.use_repo_bins || self.build_repo_bins
    }
}

fn non_empty(field: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        Err(TestnetError::config(field, "must not be empty"))
    } else {
        Ok(value.to_string())
    }
}

fn parse_count(field: &str, value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| TestnetError::config(field, format!("`{value}` is not a non-negative integer")))
}

fn is_checked(value: &str) -> bool {
    TRUE_TOKENS
        .iter()
        .any(|token| token.eq_ignore_ascii_case(value))
}

/// Network names become container-name prefixes, so they follow the
/// container runtime's naming rules.
fn validate_network_name(network: &str) -> Result<()> {
    let mut chars = network.chars();
    match chars.next() {
        None => return Err(TestnetError::config("network", "must not be empty")),
        Some(c) if !c.is_ascii_alphanumeric() => {
            return Err(TestnetError::config(
                "network",
                "must start with an ASCII letter or digit",
            ))
        }
        Some(_) => {}
    }
    if let Some(c) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))) {
        return Err(TestnetError::config(
            "network",
            format!("invalid character `{c}`"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn field_of(err: TestnetError) -> String {
        match err {
            TestnetError::ConfigValidation { field, .. } => field,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_form_uses_defaults() {
        let config = TestnetConfig::from_fields(Vec::<(&str, &str)>::new()).unwrap();
        assert_eq!(config.network, "kovri-testnet");
        assert_eq!(config.nb_base, 1);
        assert_eq!(config.nb_fw, 0);
        assert!(!config.use_named_pipes);
        assert!(!config.cleanup);
    }

    #[test]
    fn test_prefixed_and_bare_names() {
        let config = TestnetConfig::from_fields([
            ("kovri_nb_base", "3"),
            ("nb_fw", "2"),
            ("kovri_network", "testnet"),
            ("kovri_cleanup", "y"),
            ("use_named_pipes", "on"),
        ])
        .unwrap();

        assert_eq!(config.nb_base, 3);
        assert_eq!(config.nb_fw, 2);
        assert_eq!(config.network, "testnet");
        assert!(config.cleanup);
        assert!(config.use_named_pipes);
        assert!(!config.build_image);
    }

    #[test]
    fn test_checkbox_tokens() {
        for token in ["y", "YES", "On", "true", "1", "checked"] {
            assert!(is_checked(token), "{token} should be checked");
        }
        for token in ["", "n", "no", "off", "0"] {
            assert!(!is_checked(token), "{token} should not be checked");
        }
    }

    #[test]
    fn test_negative_count_rejected() {
        let err = TestnetConfig::from_fields([("kovri_nb_fw", "-1")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigValidation);
        assert_eq!(field_of(err), "nb_fw");
    }

    #[test]
    fn test_zero_instances_rejected() {
        let err = TestnetConfig::from_fields([("nb_base", "0"), ("nb_fw", "0")]).unwrap_err();
        assert_eq!(field_of(err), "nb_base");
    }

    #[test]
    fn test_concurrency_bounds() {
        let err = TestnetConfig::from_fields([("concurrency", "0")]).unwrap_err();
        assert_eq!(field_of(err), "concurrency");

        let too_many = (MAX_CONCURRENCY + 1).to_string();
        let err = TestnetConfig::from_fields([("concurrency", too_many.as_str())]).unwrap_err();
        assert_eq!(field_of(err), "concurrency");

        let max = MAX_CONCURRENCY.to_string();
        let config = TestnetConfig::from_fields([("concurrency", max.as_str())]).unwrap();
        assert_eq!(config.concurrency, MAX_CONCURRENCY);

        let huge = TestnetConfig {
            concurrency: usize::MAX,
            ..TestnetConfig::default()
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_empty_path_rejected() {
        let err = TestnetConfig::from_fields([("kovri_workspace", "  ")]).unwrap_err();
        assert_eq!(field_of(err), "workspace");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let config =
            TestnetConfig::from_fields([("kovri_instances", "12"), ("submit", "Configure")])
                .unwrap();
        assert_eq!(config.nb_base, 1);
    }

    #[test]
    fn test_invalid_network_name() {
        let err = TestnetConfig::from_fields([("network", "bad name")]).unwrap_err();
        assert_eq!(field_of(err), "network");

        let err = TestnetConfig::from_fields([("network", "-leading")]).unwrap_err();
        assert_eq!(field_of(err), "network");
    }

    #[test]
    fn test_apply_fields_keeps_absent_flags() {
        let mut config = TestnetConfig {
            cleanup: true,
            ..TestnetConfig::default()
        };
        config.apply_fields([("nb_base", "4")]).unwrap();
        assert!(config.cleanup);
        assert!(config.use_named_pipes);
        assert_eq!(config.nb_base, 4);
    }

    #[test]
    fn test_stop_timeout() {
        let config = TestnetConfig::from_fields([("kovri_stop_timeout", "15")]).unwrap();
        assert_eq!(config.stop_timeout(), Duration::from_secs(15));

        let err = TestnetConfig::from_fields([("stop_timeout", "soon")]).unwrap_err();
        assert_eq!(field_of(err), "stop_timeout");
    }

    #[test]
    fn test_log_mode() {
        let mut config = TestnetConfig::default();
        assert_eq!(config.log_mode(), LogMode::NamedPipes);
        config.use_named_pipes = false;
        assert_eq!(config.log_mode(), LogMode::RuntimeDefault);
        config.use_named_pipes = true;
        config.disable_monitoring = true;
        assert_eq!(config.log_mode(), LogMode::Discard);
    }

    #[test]
    fn test_build_file_resolution() {
        let config = TestnetConfig::default();
        assert_eq!(
            config.build_file_path("Dockerfile.alpine"),
            PathBuf::from("/tmp/kovri/contrib/docker/Dockerfile.alpine")
        );
        assert_eq!(
            config.build_file_path("/opt/Dockerfile"),
            PathBuf::from("/opt/Dockerfile")
        );
    }

    #[test]
    fn test_node_binary_path() {
        let mut config = TestnetConfig::default();
        assert_eq!(config.node_binary_path(), "kovri");
        config.use_repo_bins = true;
        assert_eq!(config.node_binary_path(), "/home/kovri/kovri/build/kovri");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: TestnetConfig =
            serde_json::from_str(r#"{"nb_base": 5, "network": "net"}"#).unwrap();
        assert_eq!(config.nb_base, 5);
        assert_eq!(config.network, "net");
        assert_eq!(config.image, TestnetConfig::default().image);
    }
}
