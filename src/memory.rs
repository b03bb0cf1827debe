//! Allocator façade for the Unc VM.
//!
//! Wraps the host allocator behind a byte-accounting layer. Each charge is
//! tagged with an [`AllocPurpose`] so debug builds and the collector can
//! group allocations. The façade owns the allocation *contract* — live-byte
//! totals and the entity-load threshold that triggers collection — while the
//! backing storage is the process allocator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Purpose tag attached to every accounted allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocPurpose {
    /// Untagged scratch memory.
    Other,
    /// Entity headers and payload shells.
    Entity,
    /// String payloads.
    String,
    /// Blob payloads.
    Blob,
    /// Array payloads.
    Array,
    /// Table buckets and nodes.
    Table,
    /// Register, value, frame and marker stacks.
    Stack,
    /// Program code and data sections.
    Program,
    /// Growable byte buffers.
    Strbuf,
}

const PURPOSE_COUNT: usize = 9;

impl AllocPurpose {
    fn slot(self) -> usize {
        match self {
            AllocPurpose::Other => 0,
            AllocPurpose::Entity => 1,
            AllocPurpose::String => 2,
            AllocPurpose::Blob => 3,
            AllocPurpose::Array => 4,
            AllocPurpose::Table => 5,
            AllocPurpose::Stack => 6,
            AllocPurpose::Program => 7,
            AllocPurpose::Strbuf => 8,
        }
    }
}

/// Collector tuning carried by the world.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Whether the tracing collector may run at all.
    pub enabled: bool,
    /// Per-view entity-load threshold that triggers a collection on wake.
    pub entity_limit: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entity_limit: 800,
        }
    }
}

/// Byte-accounting façade over the host allocator.
///
/// Totals are approximate by design: only shrinks are debited eagerly, and
/// concurrent charges are not fenced against each other beyond atomicity of
/// each counter.
#[derive(Debug)]
pub struct Alloc {
    total: AtomicUsize,
    by_purpose: [AtomicUsize; PURPOSE_COUNT],
    gc_enabled: AtomicBool,
    entity_limit: AtomicUsize,
}

impl Alloc {
    /// Creates a new façade with the given collector configuration.
    pub fn new(gc: GcConfig) -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self {
            total: AtomicUsize::new(0),
            by_purpose: [ZERO; PURPOSE_COUNT],
            gc_enabled: AtomicBool::new(gc.enabled),
            entity_limit: AtomicUsize::new(gc.entity_limit),
        }
    }

    /// Records a size change for an allocation of the given purpose.
    pub fn charge(&self, purpose: AllocPurpose, old_size: usize, new_size: usize) {
        if new_size >= old_size {
            let grow = new_size - old_size;
            self.total.fetch_add(grow, Ordering::Relaxed);
            self.by_purpose[purpose.slot()].fetch_add(grow, Ordering::Relaxed);
        } else {
            let shrink = old_size - new_size;
            self.total.fetch_sub(shrink, Ordering::Relaxed);
            self.by_purpose[purpose.slot()].fetch_sub(shrink, Ordering::Relaxed);
        }
    }

    /// Returns the approximate live-byte total.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Returns the approximate live bytes for one purpose.
    pub fn total_for(&self, purpose: AllocPurpose) -> usize {
        self.by_purpose[purpose.slot()].load(Ordering::Relaxed)
    }

    /// Whether the collector is currently enabled.
    pub fn gc_enabled(&self) -> bool {
        self.gc_enabled.load(Ordering::Relaxed)
    }

    /// Enables or disables the collector.
    pub fn set_gc_enabled(&self, enabled: bool) {
        self.gc_enabled.store(enabled, Ordering::Relaxed);
    }

    /// The per-view entity-load threshold.
    pub fn entity_limit(&self) -> usize {
        self.entity_limit.load(Ordering::Relaxed)
    }

    /// Updates the entity-load threshold.
    pub fn set_entity_limit(&self, limit: usize) {
        self.entity_limit.store(limit.max(1), Ordering::Relaxed);
    }
}

/// Rounds a stack size up to one less than a power of two, the shape the
/// sweep pass shrinks view stacks toward.
pub fn suggest_stack_size(len: usize) -> usize {
    let mut s = len + 7;
    let mut j = 1;
    while s & (s + 1) != 0 {
        s |= s >> j;
        j <<= 1;
    }
    s + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_and_debit() {
        let alloc = Alloc::new(GcConfig::default());
        alloc.charge(AllocPurpose::Array, 0, 128);
        alloc.charge(AllocPurpose::Blob, 0, 64);
        assert_eq!(alloc.total(), 192);
        assert_eq!(alloc.total_for(AllocPurpose::Array), 128);
        alloc.charge(AllocPurpose::Array, 128, 32);
        assert_eq!(alloc.total(), 96);
        assert_eq!(alloc.total_for(AllocPurpose::Array), 32);
    }

    #[test]
    fn test_suggest_stack_size() {
        // always >= input, always a power of two minus one, plus one
        for n in [0usize, 1, 5, 8, 9, 100, 1000, 4096] {
            let s = suggest_stack_size(n);
            assert!(s >= n);
            assert_eq!((s) & (s - 1), 0, "{s} not a power of two");
        }
        assert_eq!(suggest_stack_size(0), 8);
        assert_eq!(suggest_stack_size(9), 16);
    }

    #[test]
    fn test_gc_tuning() {
        let alloc = Alloc::new(GcConfig::default());
        assert!(alloc.gc_enabled());
        assert_eq!(alloc.entity_limit(), 800);
        alloc.set_gc_enabled(false);
        alloc.set_entity_limit(16);
        assert!(!alloc.gc_enabled());
        assert_eq!(alloc.entity_limit(), 16);
    }
}
