//! Container specifications and lifecycle.
//!
//! This module provides image references, launch specifications and the
//! lifecycle manager that drives containers through the runtime.

mod lifecycle;
mod spec;

pub use lifecycle::{
    ContainerHandle, ContainerLifecycleManager, InstanceState, LifecycleEvent, StopOutcome,
};
pub use spec::{BindMount, BuildSpec, ContainerImage, RunSpec};
