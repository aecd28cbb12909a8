//! Host-side agent for a cloud development environment platform.
//!
//! The agent runs five activities on behalf of an external workflow engine:
//! fetching a repository, building a root filesystem from a Dockerfile,
//! checking out a branch and inspecting its config, running prebuild tasks,
//! and starting/stopping long-lived workspaces. Every activity boots a
//! short-lived Firecracker microVM, drives it over SSH, and releases all
//! host resources (VMM process, tap device, IP block, drive files) on every
//! exit path.

pub mod activities;
pub mod config;
pub mod db;
pub mod error;
pub mod net;
pub mod ssh;
pub mod vm;

mod cmd;

pub use activities::Agent;
pub use config::AgentConfig;
pub use error::AgentError;
