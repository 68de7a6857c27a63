//! Provisioning engine for local kovri test networks.
//!
//! This crate turns a testnet configuration into a set of running node
//! containers on one host, each with its own workspace directory and a named
//! pipe carrying its log output, and removes everything again on request.
//!
//! # Overview
//!
//! A provisioning run:
//! - **Validates** the configuration ([`config`])
//! - **Plans** the ordered list of instances ([`plan`])
//! - **Reconciles** the previous run of the same network, if asked ([`cleanup`])
//! - **Provides images** by pulling or building them ([`image`])
//! - **Starts instances** on a bounded pool of tasks, creating each workspace
//!   and log pipe before its container ([`orchestrator`], [`logpipe`],
//!   [`container`])
//! - **Reports** the outcome of every instance ([`report`])
//!
//! # Architecture
//!
//! - [`runtime`]: Container runtime trait and the Docker implementation
//! - [`container`]: Launch specifications and lifecycle management
//! - [`logpipe`]: Named pipes and non-blocking log forwarding
//! - [`compose`]: docker-compose export of a plan
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kovri_testnet::{DockerRuntime, TestnetConfig, TestnetOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Arc::new(DockerRuntime::connect().await?);
//!     let orchestrator = TestnetOrchestrator::new(runtime);
//!
//!     let config = TestnetConfig {
//!         network: "testnet".to_string(),
//!         nb_base: 2,
//!         nb_fw: 1,
//!         cleanup: true,
//!         ..TestnetConfig::default()
//!     };
//!
//!     let report = orchestrator.provision(config.clone()).await?;
//!     println!("{report}");
//!
//!     // `cat <workspace>/testnet_001/log_pipe` now follows instance 1
//!
//!     orchestrator.teardown(&config).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cleanup;
pub mod compose;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod logpipe;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod runtime;

// Re-export commonly used types at the crate root
pub use cleanup::{CleanupFailure, CleanupReconciler, CleanupReport};
pub use config::TestnetConfig;
pub use container::{ContainerHandle, ContainerImage, ContainerLifecycleManager, InstanceState, StopOutcome};
pub use error::{ErrorKind, Result, TestnetError};
pub use image::{ImageOutcome, ImageProvider};
pub use logpipe::{LogMode, LogPipeManager, LogReader, WriteOutcome};
pub use orchestrator::TestnetOrchestrator;
pub use plan::{plan, InstanceSpec, Plan, RunState, Testnet, Variant};
pub use report::{InstanceOutcome, RunStatus, TestnetReport};
pub use runtime::{ContainerRuntime, DockerRuntime};
