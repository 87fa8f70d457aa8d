//! tfmux: supervise a small set of long-lived command sessions and share
//! their output with many remote viewers.

pub mod build_info;
pub mod config;
pub mod handlers;
pub mod process;
pub mod server;
pub mod shutdown;
pub mod signal;
