use std::sync::Arc;
use tokio::sync::watch;

use pod_checkpointer::checkpoint::CheckpointStore;
use pod_checkpointer::client::{AgentClient, ClusterClient};
use pod_checkpointer::config::loader::{config_path_from_args, load_runtime_config};
use pod_checkpointer::orchestrator::CheckpointController;
use pod_checkpointer::system::spawn_shutdown_listener;
use pod_checkpointer::{log_event, LogCollector};

#[tokio::main]
async fn main() -> pod_checkpointer::Result<()> {
    // =========================================================================
    // CONFIGURATION - FAILS FAST, BEFORE ANYTHING ELSE
    // =========================================================================
    let config_path = config_path_from_args(std::env::args());
    let config = match load_runtime_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[Main] ERROR: {}", e);
            return Err(e.into());
        }
    };

    // =========================================================================
    // LOGGING
    // =========================================================================
    let log_collector = LogCollector::new(config.log_dir.clone(), config.log_level_filter())
        .map_err(|e| format!("LogCollector initialization failed: {}", e))?;
    if let Err(e) = log_collector.install() {
        eprintln!("[Main] WARNING: Failed to set LogCollector as global logger: {}", e);
    }
    log_event!(
        "[Main] pod-checkpointer {} starting on node {}",
        pod_checkpointer::VERSION,
        config.node_name
    );

    // =========================================================================
    // CLIENTS AND STORE - CONSTRUCTION FAILURES ARE FATAL
    // =========================================================================
    let cluster = ClusterClient::from_config(&config).map_err(|e| {
        log::error!("[Main] Cannot construct cluster client: {}", e);
        e
    })?;
    let agent = AgentClient::from_config(&config).map_err(|e| {
        log::error!("[Main] Cannot construct node agent client: {}", e);
        e
    })?;
    let store = CheckpointStore::open(&config.checkpoint_dir, &config.manifest_dir).map_err(|e| {
        log::error!("[Main] Cannot open checkpoint store: {}", e);
        e
    })?;

    let controller = CheckpointController::new(&config, Arc::new(cluster), Arc::new(agent), store);

    // =========================================================================
    // RECONCILE UNTIL SIGNALLED
    // =========================================================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = spawn_shutdown_listener(shutdown_tx);

    controller.run(shutdown_rx).await;
    signal_task.abort();

    // =========================================================================
    // SHUTDOWN
    // =========================================================================
    log_event!("[Main] Shutdown complete");
    if let Err(e) = log_collector.wait_for_empty().await {
        eprintln!("[Main] WARNING: Failed to flush logs: {}", e);
    }
    Ok(())
}
