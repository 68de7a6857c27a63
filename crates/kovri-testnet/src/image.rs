//! Image provisioning.
//!
//! [`ImageProvider`] makes sure an image is available locally before any
//! container uses it, either by building it from a build file or by pulling
//! it when it is missing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::container::{BuildSpec, ContainerImage};
use crate::error::{Result, TestnetError};
use crate::runtime::ContainerRuntime;

/// How an image was made available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageOutcome {
    /// Already present locally.
    Present,
    /// Pulled from its registry.
    Pulled,
    /// Built from source.
    Built,
}

/// Image outcome as reported for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReport {
    /// Image reference.
    pub image: String,
    /// How it was obtained.
    pub outcome: ImageOutcome,
}

/// Ensures images exist locally.
pub struct ImageProvider {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageProvider {
    /// Creates a provider on top of a runtime.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Ensures `image` exists.
    ///
    /// With `build_requested` the image is always rebuilt from `build` and
    /// replaces whatever carried the tag before. Otherwise a local image is
    /// used as is and a missing one is pulled.
    pub async fn ensure(
        &self,
        image: &ContainerImage,
        build: &BuildSpec,
        build_requested: bool,
    ) -> Result<ImageOutcome> {
        if build_requested {
            self.build(image, build).await?;
            return Ok(ImageOutcome::Built);
        }

        match self.runtime.image_exists(image).await {
            Ok(true) => {
                debug!(image = %image, "Image present");
                return Ok(ImageOutcome::Present);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(image = %image, error = %e, "Could not check for local image, pulling");
            }
        }

        self.runtime.pull_image(image).await.map_err(|e| match e {
            TestnetError::ImagePull { .. } => e,
            other => TestnetError::image_pull_failed(image.reference(), other.to_string()),
        })?;

        info!(image = %image, "Pulled image");
        Ok(ImageOutcome::Pulled)
    }

    async fn build(&self, image: &ContainerImage, build: &BuildSpec) -> Result<()> {
        match tokio::fs::metadata(&build.build_file).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(TestnetError::image_build_failed(
                    image.reference(),
                    format!("{} is not a file", build.build_file.display()),
                ))
            }
            Err(e) => {
                return Err(TestnetError::image_build_failed(
                    image.reference(),
                    format!("build file {}: {e}", build.build_file.display()),
                ))
            }
        }

        self.runtime
            .build_image(image, build)
            .await
            .map_err(|e| match e {
                TestnetError::ImageBuild { .. } => e,
                other => TestnetError::image_build_failed(image.reference(), other.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn image() -> ContainerImage {
        ContainerImage::new("geti2p/kovri:b1d505b2")
    }

    fn no_build() -> BuildSpec {
        BuildSpec::new("/nonexistent/Dockerfile", "/nonexistent")
    }

    #[tokio::test]
    async fn test_present_image_is_kept() {
        let runtime = Arc::new(MockRuntime::new().with_image("geti2p/kovri:b1d505b2"));
        let provider = ImageProvider::new(runtime.clone());

        let outcome = provider.ensure(&image(), &no_build(), false).await.unwrap();
        assert_eq!(outcome, ImageOutcome::Present);
        assert!(runtime.pulls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_image_is_pulled() {
        let runtime = Arc::new(MockRuntime::new().with_pullable("geti2p/kovri:b1d505b2"));
        let provider = ImageProvider::new(runtime.clone());

        let outcome = provider.ensure(&image(), &no_build(), false).await.unwrap();
        assert_eq!(outcome, ImageOutcome::Pulled);
        assert_eq!(runtime.pulls(), vec!["geti2p/kovri:b1d505b2"]);
    }

    #[tokio::test]
    async fn test_unpullable_image_fails() {
        let provider = ImageProvider::new(Arc::new(MockRuntime::new()));

        let err = provider.ensure(&image(), &no_build(), false).await.unwrap_err();
        assert!(matches!(err, TestnetError::ImagePull { .. }));
        assert!(err.is_fatal_to_run());
    }

    #[tokio::test]
    async fn test_build_replaces_present_image() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile.alpine");
        std::fs::write(&dockerfile, "FROM alpine\n").unwrap();

        let runtime = Arc::new(MockRuntime::new().with_image("geti2p/kovri:b1d505b2"));
        let provider = ImageProvider::new(runtime.clone());

        let build = BuildSpec::new(&dockerfile, dir.path());
        let outcome = provider.ensure(&image(), &build, true).await.unwrap();
        assert_eq!(outcome, ImageOutcome::Built);
        assert_eq!(runtime.builds(), vec!["geti2p/kovri:b1d505b2"]);
    }

    #[tokio::test]
    async fn test_build_requires_build_file() {
        let provider = ImageProvider::new(Arc::new(MockRuntime::new()));

        let err = provider.ensure(&image(), &no_build(), true).await.unwrap_err();
        assert!(matches!(err, TestnetError::ImageBuild { .. }));
    }

    #[tokio::test]
    async fn test_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile");
        std::fs::write(&dockerfile, "FROM alpine\n").unwrap();

        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_build("geti2p/kovri:b1d505b2");
        let provider = ImageProvider::new(runtime);

        let build = BuildSpec::new(&dockerfile, dir.path());
        let err = provider.ensure(&image(), &build, true).await.unwrap_err();
        assert!(matches!(err, TestnetError::ImageBuild { .. }));
    }
}
