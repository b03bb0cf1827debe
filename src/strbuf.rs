//! Growable byte buffer used by the formatter and the error machinery.

use crate::memory::{Alloc, AllocPurpose};

/// A growable byte buffer with its size accounted through the allocator
/// façade.
#[derive(Debug)]
pub struct Strbuf<'a> {
    alloc: &'a Alloc,
    data: Vec<u8>,
}

impl<'a> Strbuf<'a> {
    /// Creates an empty buffer.
    pub fn new(alloc: &'a Alloc) -> Self {
        Self {
            alloc,
            data: Vec::new(),
        }
    }

    /// Creates a buffer with reserved capacity.
    pub fn with_capacity(alloc: &'a Alloc, capacity: usize) -> Self {
        let mut buf = Self::new(alloc);
        buf.reserve(capacity);
        buf
    }

    fn recharge(&mut self, old_cap: usize) {
        let new_cap = self.data.capacity();
        if new_cap != old_cap {
            self.alloc.charge(AllocPurpose::Strbuf, old_cap, new_cap);
        }
    }

    /// Ensures room for at least `extra` more bytes.
    pub fn reserve(&mut self, extra: usize) {
        let old = self.data.capacity();
        self.data.reserve(extra);
        self.recharge(old);
    }

    /// Appends a single byte.
    pub fn push(&mut self, byte: u8) {
        let old = self.data.capacity();
        self.data.push(byte);
        self.recharge(old);
    }

    /// Appends a byte slice.
    pub fn append(&mut self, bytes: &[u8]) {
        let old = self.data.capacity();
        self.data.extend_from_slice(bytes);
        self.recharge(old);
    }

    /// Appends `count` copies of `byte`.
    pub fn fill(&mut self, byte: u8, count: usize) {
        let old = self.data.capacity();
        self.data.resize(self.data.len() + count, byte);
        self.recharge(old);
    }

    /// Appends a byte slice in reverse order.
    pub fn append_reversed(&mut self, bytes: &[u8]) {
        let old = self.data.capacity();
        self.data.extend(bytes.iter().rev());
        self.recharge(old);
    }

    /// Shrinks the backing storage to the current length.
    pub fn compact(&mut self) {
        let old = self.data.capacity();
        self.data.shrink_to_fit();
        self.recharge(old);
    }

    /// Swaps contents with another buffer.
    pub fn swap(&mut self, other: &mut Strbuf<'a>) {
        std::mem::swap(&mut self.data, &mut other.data);
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no bytes have been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrows the written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the buffer, returning the bytes and debiting the account.
    pub fn into_bytes(mut self) -> Vec<u8> {
        let old = self.data.capacity();
        self.alloc.charge(AllocPurpose::Strbuf, old, 0);
        std::mem::take(&mut self.data)
    }
}

impl Drop for Strbuf<'_> {
    fn drop(&mut self) {
        self.alloc
            .charge(AllocPurpose::Strbuf, self.data.capacity(), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GcConfig;

    #[test]
    fn test_append_and_fill() {
        let alloc = Alloc::new(GcConfig::default());
        let mut buf = Strbuf::new(&alloc);
        buf.append(b"abc");
        buf.push(b'd');
        buf.fill(b'x', 3);
        assert_eq!(buf.as_bytes(), b"abcdxxx");
        assert!(alloc.total_for(crate::memory::AllocPurpose::Strbuf) >= 7);
    }

    #[test]
    fn test_append_reversed_and_swap() {
        let alloc = Alloc::new(GcConfig::default());
        let mut a = Strbuf::new(&alloc);
        let mut b = Strbuf::new(&alloc);
        a.append_reversed(b"123");
        b.append(b"zz");
        a.swap(&mut b);
        assert_eq!(a.as_bytes(), b"zz");
        assert_eq!(b.as_bytes(), b"321");
    }

    #[test]
    fn test_account_released_on_drop() {
        let alloc = Alloc::new(GcConfig::default());
        {
            let mut buf = Strbuf::with_capacity(&alloc, 64);
            buf.append(b"data");
        }
        assert_eq!(alloc.total_for(crate::memory::AllocPurpose::Strbuf), 0);
    }
}
