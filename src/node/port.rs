//! Output ports as seen by the engine.
//!
//! The graph owns the ports; the engine only publishes into them and reads
//! back the change flag the graph uses to decide what to propagate.

use crate::types::Value;

/// An output port slot: its latest data and whether it changed this run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputPort {
    pub has_changed: bool,
    pub data: Option<Value>,
}

impl OutputPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store new data and raise the change flag.
    pub fn publish(&mut self, value: Value) {
        self.data = Some(value);
        self.has_changed = true;
    }

    /// Clear the change flag after downstream nodes consumed the data.
    pub fn acknowledge(&mut self) {
        self.has_changed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_marks_changed() {
        let mut port = OutputPort::new();
        assert!(!port.has_changed);
        port.publish(Value::Int(3));
        assert!(port.has_changed);
        assert_eq!(port.data, Some(Value::Int(3)));
        port.acknowledge();
        assert!(!port.has_changed);
        assert_eq!(port.data, Some(Value::Int(3)));
    }
}
