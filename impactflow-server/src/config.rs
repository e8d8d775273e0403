//! Command-line and environment configuration.

use clap::Parser;
use impactflow_realtime::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "impactflow-server")]
#[command(about = "Realtime collaboration server for ImpactFlow projects")]
pub struct Cli {
    /// Address to listen on
    #[arg(long = "bind", env = "IMPACTFLOW_BIND", default_value = "127.0.0.1:3001")]
    pub bind_addr: String,

    /// Frames a connection may have queued before it is evicted as lagging
    #[arg(long, env = "IMPACTFLOW_RELIABLE_CAPACITY", default_value_t = 1024)]
    pub reliable_capacity: usize,

    /// Per-connection capacity of the lossy cursor lane
    #[arg(long, env = "IMPACTFLOW_VOLATILE_CAPACITY", default_value_t = 32)]
    pub volatile_capacity: usize,

    /// Largest accepted inbound frame, in bytes
    #[arg(long, env = "IMPACTFLOW_MAX_FRAME_BYTES", default_value_t = 1024 * 1024)]
    pub max_frame_bytes: usize,

    /// Do not publish metricsUpdated after task mutations
    #[arg(long, env = "IMPACTFLOW_NO_TASK_METRICS")]
    pub no_task_metrics: bool,

    /// Log filter, in env_logger syntax
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            reliable_capacity: self.reliable_capacity,
            volatile_capacity: self.volatile_capacity,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}
