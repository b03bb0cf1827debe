//! Opaque payload: host-native data with a destructor, a prototype, and a
//! list of entities the opaque keeps alive.

use std::any::Any;

use crate::heap::EntityId;
use crate::value::Value;

/// Destructor run when the opaque is destroyed (or "graced" by the
/// collector just before the world goes away).
pub type OpaqueDestructor = fn(&mut dyn Any);

/// Opaque payload.
pub struct Opaque {
    data: Option<Box<dyn Any + Send>>,
    destructor: Option<OpaqueDestructor>,
    prototype: Value,
    /// Entities kept alive on behalf of the host data.
    refs: Vec<EntityId>,
}

impl std::fmt::Debug for Opaque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opaque")
            .field("has_data", &self.data.is_some())
            .field("has_destructor", &self.destructor.is_some())
            .field("refs", &self.refs.len())
            .finish()
    }
}

impl Opaque {
    /// Creates an opaque over host data. The caller holds the prototype's
    /// reference and the references behind `refs`.
    pub fn new(
        data: Box<dyn Any + Send>,
        destructor: Option<OpaqueDestructor>,
        prototype: Value,
        refs: Vec<EntityId>,
    ) -> Self {
        Self {
            data: Some(data),
            destructor,
            prototype,
            refs,
        }
    }

    pub fn prototype(&self) -> Value {
        self.prototype
    }

    pub fn refs(&self) -> &[EntityId] {
        &self.refs
    }

    /// Borrows the host data, if not yet destroyed.
    pub fn data(&self) -> Option<&(dyn Any + Send)> {
        self.data.as_deref()
    }

    /// Mutably borrows the host data, if not yet destroyed.
    pub fn data_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.data.as_deref_mut()
    }

    /// Runs the destructor over the host data, at most once. Safe to call
    /// again; later calls are no-ops.
    pub fn grace(&mut self) {
        if let Some(mut data) = self.data.take() {
            if let Some(dtor) = self.destructor.take() {
                dtor(data.as_mut());
            }
        }
    }

    /// Destroys the payload, returning the prototype and kept entities for
    /// the caller to release. Runs the destructor if it has not run yet.
    pub fn clear(&mut self) -> (Value, Vec<EntityId>) {
        self.grace();
        (
            std::mem::take(&mut self.prototype),
            std::mem::take(&mut self.refs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    fn count_drop(_data: &mut dyn Any) {
        DROPS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_grace_runs_destructor_once() {
        DROPS.store(0, Ordering::SeqCst);
        let mut o = Opaque::new(Box::new(41u32), Some(count_drop), Value::Null, Vec::new());
        assert!(o.data().is_some());
        o.grace();
        o.grace();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        assert!(o.data().is_none());
    }

    #[test]
    fn test_data_downcast() {
        let mut o = Opaque::new(Box::new(7i64), None, Value::Null, Vec::new());
        let v = o.data_mut().unwrap().downcast_mut::<i64>().unwrap();
        *v += 1;
        assert_eq!(*o.data().unwrap().downcast_ref::<i64>().unwrap(), 8);
    }

    #[test]
    fn test_clear_returns_holdings() {
        DROPS.store(0, Ordering::SeqCst);
        let id = EntityId::from_raw(3);
        let mut o = Opaque::new(Box::new(()), Some(count_drop), Value::Null, vec![id]);
        let (_proto, refs) = o.clear();
        assert_eq!(refs, vec![id]);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }
}
