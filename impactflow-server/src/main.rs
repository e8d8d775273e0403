mod config;

use std::sync::Arc;
use clap::Parser;
use impactflow_realtime::{MetricsProvider, NoMetrics, RealtimeServer, TaskTally};
use log::info;

use crate::config::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::Builder::new().parse_filters(&cli.log_level).init();

    info!("Starting ImpactFlow realtime server...");

    let provider: Arc<dyn MetricsProvider> = if cli.no_task_metrics {
        Arc::new(NoMetrics)
    } else {
        Arc::new(TaskTally::new())
    };
    let server = RealtimeServer::with_metrics(cli.server_config(), provider);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
