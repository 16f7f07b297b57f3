//! Core data types for the execution engine
//!
//! This module contains the value types that flow out of a node's computation
//! and the numeric array type that the buffer proxies know how to move across
//! process boundaries.
//!
//! # Main Types
//!
//! - [`ElementType`] - Numeric type tag of an array element (u8 .. f64)
//! - [`Element`] - Rust scalar types that map onto an [`ElementType`]
//! - [`NdArray`] - Dense, C-ordered n-dimensional numeric array
//! - [`Value`] - Payload of a port or widget attribute
//! - [`IsolationMode`] - How a node's compute callable is scheduled
//!
//! # Array Storage
//!
//! An [`NdArray`] either owns its bytes on the heap or is a read-only view over
//! a memory-mapped backing region. Mapped arrays are produced when a buffer
//! proxy is reconstructed; cloning either kind only bumps a reference count.

use crate::error::{ExecError, Result};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Return code of a successful computation
pub const RETURN_SUCCESS: i32 = 0;

/// Return code recorded for any failed computation or replay
pub const RETURN_COMPUTE_ERROR: i32 = -1;

/// Widget attribute updates keyed by attribute name
pub type WidgetKwargs = BTreeMap<String, Value>;

/// Buffered widget parameters: widget name -> attribute name -> value
pub type ParamSnapshot = BTreeMap<String, WidgetKwargs>;

/// Attribute holding a widget's main value
pub const WIDGET_VALUE_ATTR: &str = "val";

// ==================== Isolation Mode ====================

/// Scheduling discipline for a node's compute callable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Separate OS process, outputs travel through the output queue log
    #[default]
    Process,
    /// Separate thread in the same address space
    Thread,
    /// Synchronously on the caller's own control flow
    Inline,
}

impl IsolationMode {
    /// Short label used in status text and logs
    pub fn label(&self) -> &'static str {
        match self {
            IsolationMode::Process => "Process",
            IsolationMode::Thread => "Thread",
            IsolationMode::Inline => "Inline",
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ==================== Element Types ====================

/// Numeric type tag of an array element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ElementType {
    /// Returns the size in bytes of one element
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "u8",
            ElementType::I8 => "i8",
            ElementType::U16 => "u16",
            ElementType::I16 => "i16",
            ElementType::U32 => "u32",
            ElementType::I32 => "i32",
            ElementType::U64 => "u64",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Scalar types that can be stored in an [`NdArray`]
pub trait Element: Copy + Send + Sync + 'static {
    /// Tag recorded alongside the bytes
    const ELEMENT_TYPE: ElementType;

    /// Write the native-endian bytes of `self` into `out`
    fn write_bytes(self, out: &mut [u8]);

    /// Read a value from native-endian bytes
    fn read_bytes(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const ELEMENT_TYPE: ElementType = ElementType::$tag;

                #[inline]
                fn write_bytes(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }

                #[inline]
                fn read_bytes(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(buf)
                }
            }
        )*
    };
}

impl_element! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

/// Encode a slice of elements into native-endian bytes
pub fn encode_elements<T: Element>(data: &[T], out: &mut [u8]) {
    let size = T::ELEMENT_TYPE.size_bytes();
    for (value, chunk) in data.iter().zip(out.chunks_exact_mut(size)) {
        value.write_bytes(chunk);
    }
}

// ==================== NdArray ====================

#[derive(Clone)]
enum Storage {
    Owned(Arc<[u8]>),
    Mapped(Arc<Mmap>),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Owned(bytes) => &bytes[..],
            Storage::Mapped(map) => &map[..],
        }
    }
}

/// Dense, C-ordered n-dimensional numeric array
#[derive(Clone)]
pub struct NdArray {
    shape: Vec<usize>,
    element_type: ElementType,
    storage: Storage,
}

impl NdArray {
    /// Build an array from typed elements
    pub fn from_vec<T: Element>(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        let expected = element_count(&shape);
        if data.len() != expected {
            return Err(ExecError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let mut bytes = vec![0u8; expected * T::ELEMENT_TYPE.size_bytes()];
        encode_elements(&data, &mut bytes);
        Ok(Self {
            shape,
            element_type: T::ELEMENT_TYPE,
            storage: Storage::Owned(bytes.into()),
        })
    }

    /// Build an array from raw native-endian bytes
    pub fn from_bytes(shape: Vec<usize>, element_type: ElementType, bytes: Vec<u8>) -> Result<Self> {
        let expected = element_count(&shape) * element_type.size_bytes();
        if bytes.len() != expected {
            return Err(ExecError::ShapeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            shape,
            element_type,
            storage: Storage::Owned(bytes.into()),
        })
    }

    /// Zero-filled array
    pub fn zeros(shape: Vec<usize>, element_type: ElementType) -> Self {
        let len = element_count(&shape) * element_type.size_bytes();
        Self {
            shape,
            element_type,
            storage: Storage::Owned(vec![0u8; len].into()),
        }
    }

    /// Read-only view over a mapped region. The map must hold exactly the
    /// array's bytes.
    pub(crate) fn mapped(shape: Vec<usize>, element_type: ElementType, map: Arc<Mmap>) -> Result<Self> {
        let expected = element_count(&shape) * element_type.size_bytes();
        if map.len() != expected {
            return Err(ExecError::ShapeMismatch {
                expected,
                actual: map.len(),
            });
        }
        Ok(Self {
            shape,
            element_type,
            storage: Storage::Mapped(map),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the data in bytes
    pub fn nbytes(&self) -> usize {
        self.storage.bytes().len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.storage.bytes()
    }

    /// Whether the data lives in a mapped backing region
    pub fn is_mapped(&self) -> bool {
        matches!(self.storage, Storage::Mapped(_))
    }

    /// Decode the elements into a typed vector
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::ELEMENT_TYPE != self.element_type {
            return Err(ExecError::ElementTypeMismatch {
                actual: self.element_type,
                requested: T::ELEMENT_TYPE,
            });
        }
        let size = self.element_type.size_bytes();
        Ok(self
            .as_bytes()
            .chunks_exact(size)
            .map(T::read_bytes)
            .collect())
    }

    /// Reshape without touching the data
    pub fn reshape(mut self, shape: Vec<usize>) -> Result<Self> {
        let expected = element_count(&shape);
        if expected != self.len() {
            return Err(ExecError::ShapeMismatch {
                expected,
                actual: self.len(),
            });
        }
        self.shape = shape;
        Ok(self)
    }
}

/// Product of the dimension sizes (1 for a scalar shape)
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl PartialEq for NdArray {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.element_type == other.element_type
            && self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("shape", &self.shape)
            .field("element_type", &self.element_type)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Wire form of an array when it travels inline through the output queue.
#[derive(Serialize, Deserialize)]
struct NdArrayRepr {
    shape: Vec<usize>,
    element_type: ElementType,
    bytes: Vec<u8>,
}

impl Serialize for NdArray {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        NdArrayRepr {
            shape: self.shape.clone(),
            element_type: self.element_type,
            bytes: self.as_bytes().to_vec(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NdArray {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = NdArrayRepr::deserialize(deserializer)?;
        NdArray::from_bytes(repr.shape, repr.element_type, repr.bytes)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Value ====================

/// Payload of a port or a widget attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Array(NdArray),
}

impl Value {
    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::Array(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(ElementType::U8.size_bytes(), 1);
        assert_eq!(ElementType::I16.size_bytes(), 2);
        assert_eq!(ElementType::F32.size_bytes(), 4);
        assert_eq!(ElementType::F64.size_bytes(), 8);
    }

    #[test]
    fn test_ndarray_from_vec() {
        let a = NdArray::from_vec(vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.len(), 6);
        assert_eq!(a.nbytes(), 24);
        assert_eq!(a.element_type(), ElementType::F32);
        assert_eq!(a.to_vec::<f32>().unwrap()[4], 5.0);
        assert!(!a.is_mapped());
    }

    #[test]
    fn test_ndarray_shape_mismatch() {
        let err = NdArray::from_vec(vec![2, 2], vec![1u8, 2, 3]).unwrap_err();
        assert!(matches!(err, ExecError::ShapeMismatch { expected: 4, actual: 3 }));
    }

    #[test]
    fn test_ndarray_wrong_element_type() {
        let a = NdArray::from_vec(vec![2], vec![1i32, 2]).unwrap();
        assert!(matches!(
            a.to_vec::<f64>(),
            Err(ExecError::ElementTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_ndarray_reshape() {
        let a = NdArray::zeros(vec![4, 4], ElementType::U16);
        let b = a.clone().reshape(vec![16]).unwrap();
        assert_eq!(b.shape(), &[16]);
        assert_eq!(b.as_bytes(), a.as_bytes());
        assert!(a.reshape(vec![5]).is_err());
    }

    #[test]
    fn test_value_serializes_inline_array() {
        let a = NdArray::from_vec(vec![3], vec![7i64, 8, 9]).unwrap();
        let v = Value::List(vec![Value::Array(a.clone()), Value::from("x")]);
        let bytes = bincode::serialize(&v).unwrap();
        let back: Value = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_isolation_mode_serde_names() {
        let json = serde_json::to_string(&IsolationMode::Thread).unwrap();
        assert_eq!(json, "\"thread\"");
        let mode: IsolationMode = serde_json::from_str("\"inline\"").unwrap();
        assert_eq!(mode, IsolationMode::Inline);
    }
}
