//! Replay of a drained output queue onto the node.
//!
//! Replay is split in two:
//! - [`prepare`] turns events into ready-to-apply operations. Proxies are
//!   mapped back into arrays and segments are assembled here. It touches no
//!   node state, so process mode runs it on a helper thread.
//! - [`apply`] runs on the owner's thread and performs the operations in
//!   emission order. A failing operation is logged and counted; the rest are
//!   still applied.

use crate::node::NodeHandle;
use crate::proxy::{assemble_segments, BufferProxy};
use crate::queue::{DataPayload, OutputEvent};
use crate::types::{Value, WidgetKwargs};
use std::path::PathBuf;

/// One node mutation ready to apply
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOp {
    SetData { port: String, value: Value },
    ModifyWidget { widget: String, kwargs: WidgetKwargs },
    Requeue(bool),
    ReturnCode(i32),
}

/// Operations plus the regions they were read from
#[derive(Debug, Default)]
pub struct ReplayPlan {
    pub ops: Vec<ReplayOp>,
    /// Regions that can be deleted once the plan is applied
    pub consumed: Vec<PathBuf>,
    /// Segmented outputs dropped because their pieces did not assemble
    pub skipped_outputs: usize,
    /// Whole-array outputs whose backing data could not be read back; each
    /// counts as a replay failure
    pub unreadable_outputs: usize,
}

/// Result of applying a plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Last return code found in the queue
    pub return_code: Option<i32>,
    /// Operations that failed to apply
    pub failures: usize,
}

struct SegmentGroup {
    port: String,
    array_id: u64,
    segments: Vec<BufferProxy>,
}

/// Reconstruct data and order the operations.
///
/// Whole arrays are published at their position in the queue. Segmented
/// arrays are published after every other operation, once per port and array.
pub fn prepare(events: Vec<OutputEvent>) -> ReplayPlan {
    let mut plan = ReplayPlan::default();
    let mut groups: Vec<SegmentGroup> = Vec::new();

    for event in events {
        match event {
            OutputEvent::ReturnCode(code) => plan.ops.push(ReplayOp::ReturnCode(code)),
            OutputEvent::Requeue(flag) => plan.ops.push(ReplayOp::Requeue(flag)),
            OutputEvent::WidgetModify { widget, kwargs } => {
                plan.ops.push(ReplayOp::ModifyWidget { widget, kwargs })
            }
            OutputEvent::DataSet {
                port,
                payload: DataPayload::Value(value),
            } => plan.ops.push(ReplayOp::SetData { port, value }),
            OutputEvent::DataSet {
                port,
                payload: DataPayload::Proxy(proxy),
            } => {
                if let Some(handle) = proxy.backing_handle() {
                    plan.consumed.push(handle.to_path_buf());
                }

                if let Some(info) = proxy.segment() {
                    let array_id = info.array_id;
                    match groups
                        .iter_mut()
                        .find(|g| g.port == port && g.array_id == array_id)
                    {
                        Some(group) => group.segments.push(proxy),
                        None => groups.push(SegmentGroup {
                            port,
                            array_id,
                            segments: vec![proxy],
                        }),
                    }
                    continue;
                }

                match proxy.to_array() {
                    Ok(array) => plan.ops.push(ReplayOp::SetData {
                        port,
                        value: Value::Array(array),
                    }),
                    Err(e) => {
                        tracing::error!("Cannot read back output '{}': {}", port, e);
                        plan.unreadable_outputs += 1;
                    }
                }
            }
        }
    }

    for group in groups {
        match assemble_segments(&group.segments) {
            Ok(array) => {
                tracing::debug!(
                    "Assembled {} segments for output '{}'",
                    group.segments.len(),
                    group.port
                );
                plan.ops.push(ReplayOp::SetData {
                    port: group.port,
                    value: Value::Array(array),
                });
            }
            Err(e) => {
                tracing::error!("Skipping output '{}': {}", group.port, e);
                plan.skipped_outputs += 1;
            }
        }
    }

    plan
}

/// Apply a plan to the node on the owner's thread
pub fn apply(plan: ReplayPlan, node: &mut dyn NodeHandle) -> ReplayOutcome {
    let mut outcome = ReplayOutcome {
        return_code: None,
        failures: plan.unreadable_outputs,
    };
    let title = node.title().to_string();
    let label = node.label().to_string();

    for op in plan.ops {
        let result = match op {
            ReplayOp::ReturnCode(code) => {
                outcome.return_code = Some(code);
                Ok(())
            }
            ReplayOp::Requeue(flag) => {
                node.mark_for_requeue(flag);
                Ok(())
            }
            ReplayOp::ModifyWidget { widget, kwargs } => {
                tracing::debug!("{}:{} replay widget-modify '{}'", title, label, widget);
                node.modify_widget(&widget, kwargs)
            }
            ReplayOp::SetData { port, value } => {
                tracing::debug!("{}:{} replay data-set '{}'", title, label, port);
                node.set_data(&port, value)
            }
        };

        if let Err(e) = result {
            tracing::error!("{}:{} replay failed: {}", title, label, e);
            outcome.failures += 1;
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::node::{GraphNode, NodeId};
    use crate::types::NdArray;

    fn widget(name: &str, key: &str, val: i64) -> OutputEvent {
        let mut kwargs = WidgetKwargs::new();
        kwargs.insert(key.to_string(), Value::Int(val));
        OutputEvent::WidgetModify {
            widget: name.to_string(),
            kwargs,
        }
    }

    #[test]
    fn test_widget_modifications_apply_in_order() {
        let mut node = GraphNode::new(NodeId(1), "Test").with_widget("a", 0);
        let plan = prepare(vec![
            widget("a", "val", 1),
            widget("a", "val", 2),
            OutputEvent::ReturnCode(0),
        ]);
        let outcome = apply(plan, &mut node);

        assert_eq!(outcome, ReplayOutcome { return_code: Some(0), failures: 0 });
        assert_eq!(node.widget_log().len(), 2);
        assert_eq!(node.widget_log()[0].1["val"], Value::Int(1));
        assert_eq!(node.widget_value("a"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_bad_entry_does_not_stop_replay() {
        let mut node = GraphNode::new(NodeId(1), "Test")
            .with_widget("a", 0)
            .with_output("out");
        let plan = prepare(vec![
            widget("gone", "val", 1),
            OutputEvent::DataSet {
                port: "out".to_string(),
                payload: DataPayload::Value(Value::Int(5)),
            },
            OutputEvent::Requeue(true),
            OutputEvent::ReturnCode(0),
        ]);
        let outcome = apply(plan, &mut node);

        assert_eq!(outcome.failures, 1);
        assert_eq!(node.output("out"), Some(&Value::Int(5)));
        assert!(node.requeue_requested());
    }

    #[test]
    fn test_segments_published_after_other_ops() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = TransferConfig::with_root(dir.path());
        t.single_region_limit = 16;
        t.segment_bytes = 8;
        let a = NdArray::from_vec(vec![3, 2], vec![1u32, 2, 3, 4, 5, 6]).unwrap();
        let proxies = BufferProxy::from_array(&a, NodeId(1), "big", None, &t).unwrap();
        assert_eq!(proxies.len(), 3);

        let mut events: Vec<OutputEvent> = proxies
            .into_iter()
            .rev()
            .map(|p| OutputEvent::DataSet {
                port: "big".to_string(),
                payload: DataPayload::Proxy(p),
            })
            .collect();
        events.push(OutputEvent::ReturnCode(0));

        let plan = prepare(events);
        assert_eq!(plan.consumed.len(), 3);
        assert_eq!(plan.skipped_outputs, 0);
        assert_eq!(plan.ops[0], ReplayOp::ReturnCode(0));
        assert_eq!(
            plan.ops[1],
            ReplayOp::SetData {
                port: "big".to_string(),
                value: Value::Array(a)
            }
        );
    }

    #[test]
    fn test_incomplete_segments_skip_port_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = TransferConfig::with_root(dir.path());
        t.single_region_limit = 16;
        t.segment_bytes = 8;
        let a = NdArray::from_vec(vec![6], vec![1u32, 2, 3, 4, 5, 6]).unwrap();
        let mut proxies = BufferProxy::from_array(&a, NodeId(1), "big", None, &t).unwrap();
        proxies.pop();

        let mut events: Vec<OutputEvent> = proxies
            .into_iter()
            .map(|p| OutputEvent::DataSet {
                port: "big".to_string(),
                payload: DataPayload::Proxy(p),
            })
            .collect();
        events.push(OutputEvent::DataSet {
            port: "small".to_string(),
            payload: DataPayload::Value(Value::Int(1)),
        });

        let plan = prepare(events);
        assert_eq!(plan.skipped_outputs, 1);
        assert_eq!(
            plan.ops,
            vec![ReplayOp::SetData {
                port: "small".to_string(),
                value: Value::Int(1)
            }]
        );
    }

    #[test]
    fn test_unavailable_region_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = TransferConfig::with_root(dir.path());
        t.direct_transfer_threshold = 1;
        let a = NdArray::from_vec(vec![2], vec![1u8, 2]).unwrap();
        let proxy = BufferProxy::from_array(&a, NodeId(1), "out", None, &t).unwrap().remove(0);
        std::fs::remove_file(proxy.backing_handle().unwrap()).unwrap();

        let plan = prepare(vec![
            OutputEvent::DataSet {
                port: "out".to_string(),
                payload: DataPayload::Proxy(proxy),
            },
            OutputEvent::ReturnCode(0),
        ]);
        assert_eq!(plan.skipped_outputs, 0);
        assert_eq!(plan.unreadable_outputs, 1);
        assert_eq!(plan.ops, vec![ReplayOp::ReturnCode(0)]);

        let mut node = GraphNode::new(NodeId(1), "Test").with_output("out");
        let outcome = apply(plan, &mut node);
        assert_eq!(outcome, ReplayOutcome { return_code: Some(0), failures: 1 });
        assert!(node.output("out").is_none());
    }
}
