/// System module: host identity, process signals, polling helpers

pub mod wait;

use tokio::sync::watch;

/// Log a lifecycle or per-tick event; routed to the events log as well as the full log.
#[macro_export]
macro_rules! log_event {
    ($($arg:tt)*) => {{
        $crate::log::info!(target: $crate::log_collector::EVENTS_TARGET, $($arg)*);
    }}
}

/// Kernel hostname of this node.
pub fn node_hostname() -> Result<String, String> {
    nix::unistd::gethostname()
        .map_err(|e| format!("Failed to read hostname: {}", e))?
        .into_string()
        .map_err(|raw| format!("Hostname is not valid UTF-8: {:?}", raw))
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("[System] Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("[System] SIGINT received"),
        _ = term.recv() => log::info!("[System] SIGTERM received"),
    }
}

/// Spawn a task that flips `shutdown` to true on the first signal.
pub fn spawn_shutdown_listener(shutdown: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown.send(true);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_hostname_is_non_empty() {
        let host = node_hostname().unwrap();
        assert!(!host.is_empty());
    }
}
