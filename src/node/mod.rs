//! The node interface the engine consumes from the graph layer.
//!
//! The graph (canvas, editor, persistence) lives outside this crate. It hands
//! the engine a [`NodeHandle`]: something that can produce the node's
//! callables, snapshot its inputs and parameters, and accept published data,
//! widget changes and requeue requests. All mutating methods are only ever
//! called on the thread that owns the node.
//!
//! [`GraphNode`] is a plain in-memory implementation used by the demo binary
//! and the tests, and a reference for graph layers embedding the engine.

pub mod id;
pub mod port;

pub use id::NodeId;
pub use port::OutputPort;

use crate::context::ComputeContext;
use crate::error::{ExecError, Result};
use crate::types::{IsolationMode, ParamSnapshot, Value, WidgetKwargs, WIDGET_VALUE_ATTR};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// User computation. Returns a node return code (0 for success).
pub type ComputeFn = Arc<dyn Fn(&mut ComputeContext) -> anyhow::Result<i32> + Send + Sync>;

/// User validation, run on the owner's thread with full access to the node.
/// Negative codes abort the invocation, positive codes are warnings.
pub type ValidateFn = Arc<dyn Fn(&mut dyn NodeHandle) -> anyhow::Result<i32> + Send + Sync>;

/// What the engine needs from a graph node.
pub trait NodeHandle {
    /// Stable identifier.
    fn id(&self) -> NodeId;

    /// Node type name, used in logs.
    fn title(&self) -> &str;

    /// User-facing label, used in logs.
    fn label(&self) -> &str;

    /// Isolation mode the node declares, if any. `None` defers to the
    /// engine's configured default.
    fn isolation_preference(&self) -> Option<IsolationMode>;

    fn compute_callable(&self) -> ComputeFn;

    fn validate_callable(&self) -> ValidateFn;

    /// Values currently on the input ports.
    fn input_snapshot(&self) -> BTreeMap<String, Value>;

    /// Widget parameters buffered for a computation that cannot reach them.
    fn param_snapshot(&self) -> ParamSnapshot;

    fn output_ports(&self) -> &BTreeMap<String, OutputPort>;

    /// Publish data on an output port.
    fn set_data(&mut self, port: &str, value: Value) -> Result<()>;

    /// Record wall time spent in one invocation.
    fn append_elapsed_time(&mut self, elapsed: Duration);

    /// Apply attribute changes to a widget.
    fn modify_widget(&mut self, widget: &str, kwargs: WidgetKwargs) -> Result<()>;

    /// Ask the graph to run this node again.
    fn mark_for_requeue(&mut self, flag: bool);
}

fn default_compute() -> ComputeFn {
    Arc::new(|_ctx: &mut ComputeContext| -> anyhow::Result<i32> { Ok(0) })
}

fn default_validate() -> ValidateFn {
    Arc::new(|_node: &mut dyn NodeHandle| -> anyhow::Result<i32> { Ok(0) })
}

/// In-memory node with ports, widgets and timing history.
pub struct GraphNode {
    id: NodeId,
    title: String,
    label: String,
    isolation: Option<IsolationMode>,
    compute: ComputeFn,
    validate: ValidateFn,
    inputs: BTreeMap<String, Value>,
    outputs: BTreeMap<String, OutputPort>,
    widgets: ParamSnapshot,
    elapsed: Vec<Duration>,
    requeue: bool,
    /// Every widget modification in application order, for inspection.
    widget_log: Vec<(String, WidgetKwargs)>,
}

impl GraphNode {
    pub fn new(id: NodeId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            label: String::new(),
            isolation: None,
            compute: default_compute(),
            validate: default_validate(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            widgets: ParamSnapshot::new(),
            elapsed: Vec::new(),
            requeue: false,
            widget_log: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_isolation(mut self, mode: IsolationMode) -> Self {
        self.isolation = Some(mode);
        self
    }

    pub fn with_compute<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ComputeContext) -> anyhow::Result<i32> + Send + Sync + 'static,
    {
        self.compute = Arc::new(f);
        self
    }

    pub fn with_validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut dyn NodeHandle) -> anyhow::Result<i32> + Send + Sync + 'static,
    {
        self.validate = Arc::new(f);
        self
    }

    pub fn with_input(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(port.into(), value.into());
        self
    }

    pub fn with_output(mut self, port: impl Into<String>) -> Self {
        self.outputs.insert(port.into(), OutputPort::new());
        self
    }

    /// Add a widget whose main value is `val`.
    pub fn with_widget(mut self, name: impl Into<String>, val: impl Into<Value>) -> Self {
        let mut attrs = WidgetKwargs::new();
        attrs.insert(WIDGET_VALUE_ATTR.to_string(), val.into());
        self.widgets.insert(name.into(), attrs);
        self
    }

    pub fn set_input(&mut self, port: impl Into<String>, value: impl Into<Value>) {
        self.inputs.insert(port.into(), value.into());
    }

    pub fn set_isolation(&mut self, mode: IsolationMode) {
        self.isolation = Some(mode);
    }

    /// Data currently on an output port.
    pub fn output(&self, port: &str) -> Option<&Value> {
        self.outputs.get(port).and_then(|p| p.data.as_ref())
    }

    pub fn widget(&self, name: &str) -> Option<&WidgetKwargs> {
        self.widgets.get(name)
    }

    pub fn widget_value(&self, name: &str) -> Option<&Value> {
        self.widgets.get(name).and_then(|w| w.get(WIDGET_VALUE_ATTR))
    }

    pub fn widget_log(&self) -> &[(String, WidgetKwargs)] {
        &self.widget_log
    }

    pub fn elapsed_times(&self) -> &[Duration] {
        &self.elapsed
    }

    pub fn requeue_requested(&self) -> bool {
        self.requeue
    }
}

impl NodeHandle for GraphNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn isolation_preference(&self) -> Option<IsolationMode> {
        self.isolation
    }

    fn compute_callable(&self) -> ComputeFn {
        self.compute.clone()
    }

    fn validate_callable(&self) -> ValidateFn {
        self.validate.clone()
    }

    fn input_snapshot(&self) -> BTreeMap<String, Value> {
        self.inputs.clone()
    }

    fn param_snapshot(&self) -> ParamSnapshot {
        self.widgets.clone()
    }

    fn output_ports(&self) -> &BTreeMap<String, OutputPort> {
        &self.outputs
    }

    fn set_data(&mut self, port: &str, value: Value) -> Result<()> {
        let slot = self
            .outputs
            .get_mut(port)
            .ok_or_else(|| ExecError::UnknownPort(port.to_string()))?;
        slot.publish(value);
        Ok(())
    }

    fn append_elapsed_time(&mut self, elapsed: Duration) {
        self.elapsed.push(elapsed);
    }

    fn modify_widget(&mut self, widget: &str, kwargs: WidgetKwargs) -> Result<()> {
        let attrs = self
            .widgets
            .get_mut(widget)
            .ok_or_else(|| ExecError::UnknownWidget(widget.to_string()))?;

        // `val` goes last so bounds set in the same call apply first
        let mut value = None;
        for (key, v) in &kwargs {
            if key == WIDGET_VALUE_ATTR {
                value = Some(v.clone());
            } else {
                attrs.insert(key.clone(), v.clone());
            }
        }
        if let Some(v) = value {
            attrs.insert(WIDGET_VALUE_ATTR.to_string(), v);
        }

        self.widget_log.push((widget.to_string(), kwargs));
        Ok(())
    }

    fn mark_for_requeue(&mut self, flag: bool) {
        self.requeue = flag;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_data_unknown_port() {
        let mut node = GraphNode::new(NodeId(1), "Test").with_output("out");
        assert!(node.set_data("out", Value::Int(1)).is_ok());
        assert!(matches!(
            node.set_data("missing", Value::Int(1)),
            Err(ExecError::UnknownPort(_))
        ));
        assert_eq!(node.output("out"), Some(&Value::Int(1)));
        assert!(node.output_ports()["out"].has_changed);
    }

    #[test]
    fn test_modify_widget_applies_val_last() {
        let mut node = GraphNode::new(NodeId(1), "Test").with_widget("gain", 1.0);
        let mut kwargs = WidgetKwargs::new();
        kwargs.insert("max".to_string(), Value::Float(10.0));
        kwargs.insert("val".to_string(), Value::Float(5.0));
        node.modify_widget("gain", kwargs).unwrap();

        assert_eq!(node.widget_value("gain"), Some(&Value::Float(5.0)));
        assert_eq!(node.widget("gain").unwrap()["max"], Value::Float(10.0));
        assert_eq!(node.widget_log().len(), 1);
    }

    #[test]
    fn test_modify_unknown_widget() {
        let mut node = GraphNode::new(NodeId(1), "Test");
        assert!(matches!(
            node.modify_widget("nope", WidgetKwargs::new()),
            Err(ExecError::UnknownWidget(_))
        ));
    }

    #[test]
    fn test_snapshots_are_copies() {
        let node = GraphNode::new(NodeId(2), "Test")
            .with_input("in", 3)
            .with_widget("n", 4);
        let inputs = node.input_snapshot();
        let params = node.param_snapshot();
        assert_eq!(inputs["in"], Value::Int(3));
        assert_eq!(params["n"]["val"], Value::Int(4));
    }
}
