pub mod config;
pub mod db;
pub mod dirsize;
pub mod docker;
pub mod executor;
pub mod git;
pub mod github;
pub mod maintenance;
pub mod queue;
pub mod reconcile;
pub mod runtime;
pub mod scheduler;
pub mod sync;
pub mod types;
pub mod webhook;

pub use types::*;
