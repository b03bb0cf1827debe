//! Object payload: hashed fields, a prototype link, and a freeze flag.
//!
//! A frozen object silently refuses attribute and index writes, matching
//! the behaviour scripts observe through the store opcodes.

use crate::value::table::{Table, TableKey};
use crate::value::Value;

/// Object payload.
#[derive(Debug, Default)]
pub struct Object {
    fields: Table,
    prototype: Value,
    frozen: bool,
}

impl Object {
    /// Creates an object with the given prototype (null for none). The
    /// caller holds the prototype's reference.
    pub fn new(prototype: Value) -> Self {
        Self {
            fields: Table::new(),
            prototype,
            frozen: false,
        }
    }

    pub fn prototype(&self) -> Value {
        self.prototype
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freezes the object; writes become no-ops from here on.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn get(&self, key: &TableKey) -> Option<Value> {
        self.fields.get(key)
    }

    /// Stores a field unless frozen. Returns `Err(())` when frozen (the
    /// write is dropped and the caller keeps ownership of the new pair),
    /// otherwise the displaced pair as for [`Table::insert`].
    #[allow(clippy::result_unit_err)]
    pub fn set(
        &mut self,
        key: TableKey,
        key_value: Value,
        value: Value,
    ) -> Result<Option<(Value, Value)>, ()> {
        if self.frozen {
            return Err(());
        }
        Ok(self.fields.insert(key, key_value, value))
    }

    /// Deletes a field unless frozen; `None` when frozen or absent.
    pub fn delete(&mut self, key: &TableKey) -> Option<(Value, Value)> {
        if self.frozen {
            return None;
        }
        self.fields.remove(key)
    }

    /// Clears all fields and detaches the prototype, returning everything
    /// the caller must release (including the old prototype value).
    pub fn clear(&mut self) -> Vec<Value> {
        let mut dropped = self.fields.clear();
        dropped.push(std::mem::take(&mut self.prototype));
        dropped
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Visits fields and the prototype (collector mark phase).
    pub fn for_each<F: FnMut(&Value, &Value)>(&self, mut f: F) {
        self.fields.for_each(&mut f);
        f(&Value::Null, &self.prototype);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let mut o = Object::new(Value::Null);
        let key = TableKey::from_str("name".into());
        o.set(key.clone(), Value::Null, Value::Int(5)).unwrap();
        assert!(matches!(o.get(&key), Some(Value::Int(5))));
        assert!(o.delete(&key).is_some());
        assert!(o.get(&key).is_none());
    }

    #[test]
    fn test_frozen_refuses_writes() {
        let mut o = Object::new(Value::Null);
        let key = TableKey::from_str("a".into());
        o.set(key.clone(), Value::Null, Value::Int(1)).unwrap();
        o.freeze();
        assert!(o.set(key.clone(), Value::Null, Value::Int(2)).is_err());
        assert!(o.delete(&key).is_none());
        assert!(matches!(o.get(&key), Some(Value::Int(1))));
    }
}
