//! Core library for the workspace gate: an authenticating, workspace-aware
//! reverse proxy fronting ephemeral development-workspace pods over HTTP
//! and SSH.

pub mod config;
pub mod identity;
pub mod metrics;
pub mod oauth;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod ssh;
pub mod supervisor;
pub mod watcher;

pub use config::Config;
pub use registry::{HostMapping, Registry};
