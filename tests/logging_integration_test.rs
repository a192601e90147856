use std::fs;
use std::path::Path;
use tempfile::TempDir;

use pod_checkpointer::{log_event, LogCollector};

fn read_all(dir: &Path) -> String {
    fs::read_dir(dir)
        .expect("log dir must exist")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "log"))
        .map(|e| fs::read_to_string(e.path()).unwrap_or_default())
        .collect()
}

/// Integration test for the global logger
///
/// Tests that:
/// 1. LogCollector installs as the `log` backend
/// 2. Ordinary records reach the full log only
/// 3. `log_event!` records reach both the full and events logs
/// 4. Records below the configured level are dropped
#[tokio::test]
async fn test_global_logger_routes_events() {
    let tmp = TempDir::new().unwrap();
    let collector = LogCollector::new(Some(tmp.path().to_path_buf()), log::LevelFilter::Info)
        .expect("Failed to initialize LogCollector");
    collector.install().expect("logger already installed");

    log::info!("[Test] ordinary line");
    log::debug!("[Test] filtered line");
    log_event!("[Test] tick {} mode={}", 7, "synced");

    collector.wait_for_empty().await.expect("flush failed");

    let full = read_all(&tmp.path().join("full"));
    assert!(full.contains("[INFO] [Test] ordinary line"));
    assert!(full.contains("[Test] tick 7 mode=synced"));
    assert!(!full.contains("filtered line"));

    let events = read_all(&tmp.path().join("events"));
    assert!(events.contains("[Test] tick 7 mode=synced"));
    assert!(!events.contains("ordinary line"));
}
