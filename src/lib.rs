// LOADFLOW: Programmable HTTP Load Generator
// Copyright (c) 2024 Bugb Technologies

//! # loadflow
//!
//! Drives a declarative flow — a tree of request, condition, and loop
//! steps — against a target endpoint with many concurrent simulated
//! users, collecting throughput and latency metrics along the way.

#![warn(
    missing_docs,
    rust_2018_idioms,
    unused_qualifications,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod flow;
pub mod identity;
pub mod interpolate;
pub mod interpreter;
pub mod metrics;
pub mod network;
pub mod orchestrator;
pub mod simulator;

pub use crate::config::ContainerConfig;
pub use crate::error::{Error, Result};
pub use crate::flow::FlowMap;
pub use crate::orchestrator::Orchestrator;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports for embedding loadflow as a library.
pub mod prelude {
    pub use crate::config::ContainerConfig;
    pub use crate::context::Context;
    pub use crate::error::{Error, Result};
    pub use crate::flow::{FlowMap, Step};
    pub use crate::metrics::Snapshot;
    pub use crate::orchestrator::Orchestrator;
}
