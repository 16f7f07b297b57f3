//! nodexec demo - runs one sample node under each isolation mode
//!
//! Usage: `nodexec-demo [config.toml|config.json]`

use nodexec::{
    ElementType, EngineConfig, ExecutionCoordinator, GraphNode, IsolationMode, NodeHandle, NodeId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn sample_node(id: u32, mode: IsolationMode) -> GraphNode {
    GraphNode::new(NodeId(id), "Gradient")
        .with_label(format!("gradient_{}", mode.label().to_lowercase()))
        .with_isolation(mode)
        .with_widget("size", 512)
        .with_widget("gain", 2.0)
        .with_output("image")
        .with_output("summary")
        .with_compute(|ctx| {
            let size = ctx.value("size").and_then(|v| v.as_int()).unwrap_or(256) as usize;
            let gain = ctx.value("gain").and_then(|v| v.as_float()).unwrap_or(1.0) as f32;

            let mut image = ctx.alloc_array(vec![size, size], ElementType::F32, "image")?;
            let data: Vec<f32> = (0..size * size)
                .map(|i| ((i % size) + (i / size)) as f32 * gain)
                .collect();
            image.copy_from_slice(&data)?;
            ctx.set_shared("image", image)?;

            ctx.set_data("summary", format!("{}x{} gradient, gain {}", size, size, gain))?;
            ctx.set_widget_value("gain", f64::from(gain) * 0.5)?;
            Ok(0)
        })
}

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = EngineConfig::load_or_default(config_path.as_deref());
    let _log_guard = nodexec::logging::init(&config.logging);
    config.ensure_shm_root()?;

    tracing::info!("Starting nodexec demo (shm root {})", config.shm_root.display());
    let config = Arc::new(config);

    for (id, mode) in [IsolationMode::Inline, IsolationMode::Thread, IsolationMode::Process]
        .into_iter()
        .enumerate()
    {
        let mut node = sample_node(id as u32 + 1, mode);
        let mut coordinator = ExecutionCoordinator::with_default_spawner(&node, config.clone());
        let notifications = coordinator.subscribe();
        coordinator.start(&mut node)?;

        // owner event loop
        let notification = loop {
            coordinator.poll(&mut node);
            if let Ok(n) = notifications.try_recv() {
                break n;
            }
            if !coordinator.phase().is_active() {
                anyhow::bail!("{} ended without a notification", node.label());
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        let shape = node
            .output("image")
            .and_then(|v| v.as_array())
            .map(|a| a.shape().to_vec());
        tracing::info!(
            "{} [{}] -> {:?} in {:?}, image {:?}, summary {:?}, gain now {:?}",
            node.label(),
            coordinator.mode(),
            notification.kind,
            notification.elapsed,
            shape,
            node.output("summary").and_then(|v| v.as_str()),
            node.widget_value("gain"),
        );
    }

    Ok(())
}
