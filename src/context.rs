//! What a compute callable sees while it runs.
//!
//! The context carries a frozen copy of the node's inputs and widget
//! parameters and turns every write into an [`OutputEvent`]. Nothing here
//! touches the live node; the coordinator applies the events afterwards on the
//! owner's thread.

use crate::config::TransferConfig;
use crate::error::{ExecError, Result};
use crate::node::NodeId;
use crate::proxy::{BufferProxy, SharedArray};
use crate::queue::{DataPayload, OutputEvent, OutputQueue};
use crate::types::{ElementType, IsolationMode, NdArray, ParamSnapshot, Value, WidgetKwargs, WIDGET_VALUE_ATTR};
use std::collections::BTreeMap;

/// Node API available inside `compute()`
pub struct ComputeContext {
    node: NodeId,
    title: String,
    label: String,
    mode: IsolationMode,
    inputs: BTreeMap<String, Value>,
    params: ParamSnapshot,
    queue: OutputQueue,
    transfer: TransferConfig,
}

impl ComputeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeId,
        title: impl Into<String>,
        label: impl Into<String>,
        mode: IsolationMode,
        inputs: BTreeMap<String, Value>,
        params: ParamSnapshot,
        queue: OutputQueue,
        transfer: TransferConfig,
    ) -> Self {
        Self {
            node,
            title: title.into(),
            label: label.into(),
            mode,
            inputs,
            params,
            queue,
            transfer,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Isolation mode this computation runs under
    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    pub fn queue(&self) -> &OutputQueue {
        &self.queue
    }

    /// Value on an input port at the time the invocation started
    pub fn input(&self, port: &str) -> Option<&Value> {
        self.inputs.get(port)
    }

    pub fn input_array(&self, port: &str) -> Option<&NdArray> {
        self.input(port).and_then(Value::as_array)
    }

    /// Buffered widget attribute
    pub fn param(&self, widget: &str, attr: &str) -> Option<&Value> {
        self.params.get(widget).and_then(|w| w.get(attr))
    }

    /// Buffered main value of a widget
    pub fn value(&self, widget: &str) -> Option<&Value> {
        self.param(widget, WIDGET_VALUE_ATTR)
    }

    /// Publish `value` on an output port.
    ///
    /// In process mode arrays are moved through buffer proxies. If that
    /// transfer fails the output is dropped and logged; the computation
    /// carries on.
    pub fn set_data(&mut self, port: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        match value {
            Value::Array(array) if self.mode == IsolationMode::Process => {
                let proxies = BufferProxy::from_array(&array, self.node, port, None, &self.transfer);
                self.publish_proxies(port, proxies)
            }
            other => self.queue.append(OutputEvent::DataSet {
                port: port.to_string(),
                payload: DataPayload::Value(other),
            }),
        }
    }

    /// Publish an array built with [`ComputeContext::alloc_array`]
    pub fn set_shared(&mut self, port: &str, shared: SharedArray) -> Result<()> {
        if self.mode == IsolationMode::Process {
            let proxies = BufferProxy::from_shared(shared, self.node, port, &self.transfer);
            return self.publish_proxies(port, proxies);
        }
        let array = shared.into_array()?;
        self.set_data(port, array)
    }

    fn publish_proxies(&mut self, port: &str, proxies: Result<Vec<BufferProxy>>) -> Result<()> {
        let proxies = match proxies {
            Ok(proxies) => proxies,
            Err(e @ ExecError::BackingRegionUnavailable { .. })
            | Err(e @ ExecError::BufferTooLargeForSingleRegion { .. }) => {
                tracing::error!(
                    "{}:{} dropping output '{}': {}",
                    self.title,
                    self.label,
                    port,
                    e
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for proxy in proxies {
            self.queue.append(OutputEvent::DataSet {
                port: port.to_string(),
                payload: DataPayload::Proxy(proxy),
            })?;
        }
        Ok(())
    }

    /// Writable output array.
    ///
    /// In process mode it is backed by a region named after `name`, so
    /// publishing it with [`ComputeContext::set_shared`] does not copy.
    pub fn alloc_array(&self, shape: Vec<usize>, element_type: ElementType, name: &str) -> Result<SharedArray> {
        match self.mode {
            IsolationMode::Process => {
                SharedArray::allocate(shape, element_type, self.node, name, &self.transfer)
            }
            _ => Ok(SharedArray::heap(shape, element_type)),
        }
    }

    /// Queue attribute changes for a widget
    pub fn modify_widget(&mut self, widget: &str, kwargs: WidgetKwargs) -> Result<()> {
        self.queue.append(OutputEvent::WidgetModify {
            widget: widget.to_string(),
            kwargs,
        })
    }

    /// Queue a change of a widget's main value
    pub fn set_widget_value(&mut self, widget: &str, value: impl Into<Value>) -> Result<()> {
        let mut kwargs = WidgetKwargs::new();
        kwargs.insert(WIDGET_VALUE_ATTR.to_string(), value.into());
        self.modify_widget(widget, kwargs)
    }

    /// Ask for the node to run again after this invocation
    pub fn set_requeue(&mut self, flag: bool) -> Result<()> {
        self.queue.append(OutputEvent::Requeue(flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyKind;

    fn context(mode: IsolationMode, root: &std::path::Path) -> ComputeContext {
        let mut params = ParamSnapshot::new();
        let mut gain = WidgetKwargs::new();
        gain.insert("val".to_string(), Value::Float(2.5));
        gain.insert("max".to_string(), Value::Float(10.0));
        params.insert("gain".to_string(), gain);

        let mut inputs = BTreeMap::new();
        inputs.insert("in".to_string(), Value::Int(4));

        let mut transfer = TransferConfig::with_root(root);
        transfer.direct_transfer_threshold = 16;

        ComputeContext::new(
            NodeId(8),
            "Scale",
            "scale1",
            mode,
            inputs,
            params,
            OutputQueue::in_memory(),
            transfer,
        )
    }

    #[test]
    fn test_reads_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(IsolationMode::Thread, dir.path());
        assert_eq!(ctx.input("in"), Some(&Value::Int(4)));
        assert_eq!(ctx.value("gain"), Some(&Value::Float(2.5)));
        assert_eq!(ctx.param("gain", "max"), Some(&Value::Float(10.0)));
        assert!(ctx.param("gain", "min").is_none());
        assert!(ctx.input_array("in").is_none());
    }

    #[test]
    fn test_thread_mode_sends_arrays_by_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(IsolationMode::Thread, dir.path());
        let a = NdArray::zeros(vec![64], ElementType::F32);
        ctx.set_data("out", a.clone()).unwrap();

        let events = ctx.queue().drain().unwrap();
        assert_eq!(
            events,
            vec![OutputEvent::DataSet {
                port: "out".to_string(),
                payload: DataPayload::Value(Value::Array(a)),
            }]
        );
    }

    #[test]
    fn test_process_mode_proxies_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(IsolationMode::Process, dir.path());
        ctx.set_data("out", NdArray::zeros(vec![64], ElementType::F32)).unwrap();
        ctx.set_data("label", "done").unwrap();

        let events = ctx.queue().drain().unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            OutputEvent::DataSet {
                payload: DataPayload::Proxy(p),
                ..
            } => assert_eq!(p.kind(), ProxyKind::MappedArray),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_alloc_array_in_process_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(IsolationMode::Process, dir.path());
        let mut shared = ctx.alloc_array(vec![8], ElementType::U32, "local").unwrap();
        assert!(shared.handle().is_some());
        shared.copy_from_slice(&[1u32, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let handle = shared.handle().map(|h| h.to_path_buf());
        ctx.set_shared("out", shared).unwrap();

        let events = ctx.queue().drain().unwrap();
        let OutputEvent::DataSet {
            payload: DataPayload::Proxy(proxy),
            ..
        } = &events[0]
        else {
            panic!("expected proxy");
        };
        assert_eq!(proxy.backing_handle().map(|h| h.to_path_buf()), handle);
        assert_eq!(proxy.to_array().unwrap().to_vec::<u32>().unwrap()[7], 8);
    }

    #[test]
    fn test_widget_and_requeue_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(IsolationMode::Inline, dir.path());
        ctx.set_widget_value("gain", 3.0).unwrap();
        ctx.set_requeue(true).unwrap();
        let tags: Vec<_> = ctx.queue().drain().unwrap().iter().map(|e| e.tag()).collect();
        assert_eq!(tags, vec!["widget-modify", "requeue"]);
    }
}
