//! High-level commands for hoist operations.
//!
//! These combine configuration, local state and the deploy components into
//! one call for the CLI.

pub mod deploy;

pub use deploy::{DeployCommand, DeployOptions, DeploySettings};
