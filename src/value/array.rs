//! Ordered dynamic array payload.
//!
//! Pure storage operations: reference-count traffic for values entering or
//! leaving the array is the caller's responsibility (values are `Copy`), so
//! these operations never touch the heap and are safe under the payload
//! lock. Removed values are handed back so the caller can release them.

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// Array payload: contiguous value buffer with geometric growth.
#[derive(Debug, Default)]
pub struct Array {
    data: Vec<Value>,
}

/// Resolves a language-level index against `len`: negative indices count
/// from the end; a non-integer index is rejected before range checking.
pub fn resolve_index(len: usize, index: &Value) -> VmResult<usize> {
    let i = match *index {
        Value::Int(i) => i,
        Value::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            f as i64
        }
        _ => return Err(VmError::IndexNotInteger),
    };
    let adjusted = if i < 0 { i + len as i64 } else { i };
    if adjusted < 0 || adjusted >= len as i64 {
        return Err(VmError::IndexOutOfBounds { index: i });
    }
    Ok(adjusted as usize)
}

impl Array {
    /// Creates an empty array.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Creates an array over an already-counted value buffer.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { data: values }
    }

    /// Grows capacity to `max(current * 3 / 2, requested)` when needed.
    fn grow_for(&mut self, extra: usize) {
        let needed = self.data.len() + extra;
        if needed > self.data.capacity() {
            let geometric = self.data.capacity() + self.data.capacity() / 2;
            let target = geometric.max(needed);
            self.data.reserve_exact(target - self.data.len());
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.data.get(index).copied()
    }

    /// Replaces the element at `index`, returning the previous value.
    pub fn set(&mut self, index: usize, value: Value) -> Option<Value> {
        let slot = self.data.get_mut(index)?;
        Some(std::mem::replace(slot, value))
    }

    /// Appends one value.
    pub fn push(&mut self, value: Value) {
        self.grow_for(1);
        self.data.push(value);
    }

    /// Appends many values.
    pub fn extend(&mut self, values: &[Value]) {
        self.grow_for(values.len());
        self.data.extend_from_slice(values);
    }

    /// Inserts values at `index`, shifting the tail.
    pub fn insert_at(&mut self, index: usize, values: &[Value]) -> VmResult<()> {
        if index > self.data.len() {
            return Err(VmError::IndexOutOfBounds {
                index: index as i64,
            });
        }
        self.grow_for(values.len());
        for (off, v) in values.iter().enumerate() {
            self.data.insert(index + off, *v);
        }
        Ok(())
    }

    /// Removes `count` elements starting at `index`, returning them for the
    /// caller to release.
    pub fn delete_range(&mut self, index: usize, count: usize) -> VmResult<Vec<Value>> {
        if index > self.data.len() || index + count > self.data.len() {
            return Err(VmError::IndexOutOfBounds {
                index: index as i64,
            });
        }
        Ok(self.data.drain(index..index + count).collect())
    }

    /// Removes all elements, returning them for the caller to release.
    pub fn clear(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.data)
    }

    /// Resizes to `len`, filling with null; returns any removed tail.
    pub fn resize(&mut self, len: usize) -> Vec<Value> {
        if len < self.data.len() {
            self.data.drain(len..).collect()
        } else {
            self.grow_for(len - self.data.len());
            self.data.resize(len, Value::Null);
            Vec::new()
        }
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [Value] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_get_set() {
        let mut a = Array::new();
        a.push(Value::Int(1));
        a.push(Value::Int(2));
        assert_eq!(a.len(), 2);
        assert!(matches!(a.get(1), Some(Value::Int(2))));
        let old = a.set(0, Value::Int(9)).unwrap();
        assert!(matches!(old, Value::Int(1)));
        assert!(matches!(a.get(0), Some(Value::Int(9))));
    }

    #[test]
    fn test_resolve_index_negative() {
        // -len maps to 0; -len-1 fails
        assert_eq!(resolve_index(3, &Value::Int(-3)).unwrap(), 0);
        assert!(resolve_index(3, &Value::Int(-4)).is_err());
        assert_eq!(resolve_index(3, &Value::Int(2)).unwrap(), 2);
        assert!(resolve_index(3, &Value::Int(3)).is_err());
    }

    #[test]
    fn test_resolve_index_types() {
        assert_eq!(resolve_index(4, &Value::Float(2.0)).unwrap(), 2);
        assert!(matches!(
            resolve_index(4, &Value::Float(2.5)),
            Err(VmError::IndexNotInteger)
        ));
        assert!(matches!(
            resolve_index(4, &Value::Bool(true)),
            Err(VmError::IndexNotInteger)
        ));
    }

    #[test]
    fn test_insert_delete_range() {
        let mut a = Array::from_values(vec![Value::Int(1), Value::Int(4)]);
        a.insert_at(1, &[Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(a.len(), 4);
        let removed = a.delete_range(1, 2).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(matches!(a.get(1), Some(Value::Int(4))));
        assert!(a.delete_range(1, 5).is_err());
    }

    #[test]
    fn test_geometric_growth() {
        let mut a = Array::new();
        for i in 0..100 {
            a.push(Value::Int(i));
        }
        assert!(a.capacity() >= 100);
        assert_eq!(a.len(), 100);
    }
}
