//! osoba - label-driven GitHub issue automation
//!
//! Watches a repository's issues and pull requests for status labels, claims
//! them by swapping labels, and runs an AI coding agent for each phase in a
//! dedicated git worktree and tmux window.

pub mod agent;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod github;
pub mod labels;
pub mod shutdown;
pub mod subprocess;
pub mod telemetry;
pub mod template;
pub mod tmux;
pub mod transition;
pub mod watcher;
pub mod worktree;

#[cfg(test)]
mod testing;
