//! Side-effecting bindings: filesystem, subprocesses, network stores.

pub mod auth;
pub mod cache;
pub mod config;
pub mod fs;
pub mod git;
pub mod hooks;
pub mod metrics;
pub mod objstore;
pub mod paths;
pub mod process;
pub mod source;
pub mod state_store;
pub mod terraform;
