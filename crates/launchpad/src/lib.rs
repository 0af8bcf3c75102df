//! A library for running generated Node.js backends in throwaway sandboxes.
//!
//! Launchpad takes a generated project bundle (source files, setup commands,
//! dependencies and environment defaults), materializes it into a fresh
//! workspace, installs and builds it, starts the server on a random port and
//! keeps it up for a retention window before reaping it.
//!
//! # Features
//!
//! - **Isolated workspaces** - One scratch directory per project, confined file writes.
//! - **Setup pipeline** - Fail-fast install and build, best-effort setup commands.
//! - **Strict commands** - Setup commands are tokenized without a shell and checked against an allow-list.
//! - **Readiness detection** - Servers are ready when their output shows a readiness phrase.
//! - **Run registry** - Status checks, explicit stops and automatic reaping per project.
//! - **TOML configuration** - Commands, timeouts, ports and readiness phrases.

pub use bundle::{
    BundleError, BundleSource, FsBundleSource, GeneratedBundle, MemoryBundleSource,
    StoredGeneration,
};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use process::{LaunchError, LaunchState, ProcessError};
pub use runner::{Orchestrator, RunRegistry};
pub use types::{CommandResult, HealthCheckResult, RunReport, StatusReport, StepReport};
pub use workspace::{Workspace, WorkspaceError};

pub mod bundle;
pub mod config;
pub mod process;
pub mod runner;
pub mod types;
pub mod workspace;
