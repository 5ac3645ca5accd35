//! Kernel module - job queue infrastructure and process plumbing.

pub mod jobs;
pub mod scheduled_tasks;
pub mod shutdown;

pub use shutdown::install_shutdown_handler;
