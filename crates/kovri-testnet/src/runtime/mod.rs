//! Container runtimes.
//!
//! This module defines the [`ContainerRuntime`] trait and its
//! implementations.

mod docker;
#[cfg(any(test, feature = "test-util"))]
mod mock;
mod r#trait;

pub use docker::DockerRuntime;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockRuntime, StartRecord};
pub use r#trait::{ContainerInfo, ContainerRuntime, LogStream, RunOutput};
