// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
mod reactor;
pub mod response;
pub mod server;
pub mod signals;
pub mod slab;
pub mod static_files;
pub mod sync;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use config::ServerConfig;
pub use error::{EtudeError, EtudeResult};
pub use metrics::{ServerStats, StatsSnapshot};
pub use server::{Server, ServerHandle};
