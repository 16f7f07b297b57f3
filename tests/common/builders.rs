//! Test node builders

use nodexec::types::WidgetKwargs;
use nodexec::{ElementType, GraphNode, IsolationMode, NdArray, NodeId, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const ALL_MODES: [IsolationMode; 3] = [
    IsolationMode::Inline,
    IsolationMode::Thread,
    IsolationMode::Process,
];

/// Node with an `out` port, an `a` widget and a compute that returns 0
pub fn basic_node(id: u32, mode: IsolationMode) -> GraphNode {
    GraphNode::new(NodeId(id), "Basic")
        .with_label(format!("basic{}", id))
        .with_isolation(mode)
        .with_output("out")
        .with_widget("a", 0)
}

/// Node whose compute returns `code` after publishing `out`
pub fn returning_node(id: u32, mode: IsolationMode, code: i32) -> GraphNode {
    basic_node(id, mode).with_compute(move |ctx| {
        ctx.set_data("out", "computed")?;
        Ok(code)
    })
}

/// Node whose compute counts its calls
pub fn counting_node(id: u32, mode: IsolationMode, calls: Arc<AtomicUsize>) -> GraphNode {
    basic_node(id, mode).with_compute(move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    })
}

/// Node publishing a deterministic f32 array of `shape` on `out`
pub fn array_node(id: u32, mode: IsolationMode, shape: Vec<usize>) -> GraphNode {
    basic_node(id, mode).with_compute(move |ctx| {
        ctx.set_data("out", gradient(&shape))?;
        Ok(0)
    })
}

/// Deterministic f32 array
pub fn gradient(shape: &[usize]) -> NdArray {
    let len: usize = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|i| (i % 1000) as f32 * 0.25).collect();
    NdArray::from_vec(shape.to_vec(), data).unwrap()
}

pub fn kwargs_val(val: impl Into<Value>) -> WidgetKwargs {
    let mut kwargs = WidgetKwargs::new();
    kwargs.insert("val".to_string(), val.into());
    kwargs
}

pub fn zeros_f64(len: usize) -> NdArray {
    NdArray::zeros(vec![len], ElementType::F64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_shape() {
        let a = gradient(&[4, 5]);
        assert_eq!(a.shape(), &[4, 5]);
        assert_eq!(a.to_vec::<f32>().unwrap()[3], 0.75);
    }
}
