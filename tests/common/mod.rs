//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use nodexec::{EngineConfig, ExecutionCoordinator, GraphNode, Notification};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Engine config rooted in a temp dir, with fast polling and no platform
/// overrides
pub fn test_config(root: &Path) -> EngineConfig {
    EngineConfig {
        shm_root: root.join("shm"),
        poll_interval_ms: 2,
        platform_overrides: Vec::new(),
        ..Default::default()
    }
}

pub fn shared_config(root: &Path) -> Arc<EngineConfig> {
    Arc::new(test_config(root))
}

/// Start one invocation and block until its notification arrives
pub fn run_once(coordinator: &mut ExecutionCoordinator, node: &mut GraphNode) -> Notification {
    let notifications = coordinator.subscribe();
    coordinator.start(node).expect("start should succeed");
    coordinator.wait_timeout(node, test_timeout());
    notifications
        .recv_timeout(test_timeout())
        .expect("invocation should produce a notification")
}

/// Files left in the shm root
pub fn shm_files(root: &Path) -> Vec<String> {
    match std::fs::read_dir(root.join("shm")) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect(),
        Err(_) => Vec::new(),
    }
}
