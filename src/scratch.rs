//! Per-thread scratch copies of records.
//!
//! The copying accessors exist so that callers can read record bytes even
//! though the arena may be remapped between calls. The scratch grows to the
//! largest record this thread has touched and never shrinks; its part ranges
//! alias the buffer and are replaced by the next copy into it.

use std::cell::RefCell;
use std::ops::Range;

#[derive(Debug, Clone, Default)]
struct Parts {
    len: usize,
    key: Range<usize>,
    val: Range<usize>,
}

/// This thread's copy of the most recently accessed record.
pub struct Scratch {
    buf: Vec<u8>,
    parts: Parts,
}

impl Scratch {
    /// Header, key and value bytes of the copied record.
    #[inline]
    pub fn hkv(&self) -> &[u8] {
        &self.buf[..self.parts.len]
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.buf[self.parts.key.clone()]
    }

    #[inline]
    pub fn val(&self) -> &[u8] {
        &self.buf[self.parts.val.clone()]
    }

    /// Value bytes, mutable. Rewriting them only changes the store after a
    /// `set_uid_hkv` call re-persists the copy.
    #[inline]
    pub fn val_mut(&mut self) -> &mut [u8] {
        let range = self.parts.val.clone();
        &mut self.buf[range]
    }

    /// Total record length, header included.
    #[inline]
    pub fn len(&self) -> usize {
        self.parts.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.len == 0
    }

    pub(crate) fn load(&mut self, hkv: &[u8], key: Range<usize>, val: Range<usize>) {
        if self.buf.len() < hkv.len() {
            self.buf.resize(hkv.len(), 0);
        }
        self.buf[..hkv.len()].copy_from_slice(hkv);
        self.parts = Parts {
            len: hkv.len(),
            key,
            val,
        };
    }
}

thread_local! {
    static SCRATCH: RefCell<Scratch> = RefCell::new(Scratch {
        buf: Vec::new(),
        parts: Parts::default(),
    });
}

/// Runs `f` with this thread's scratch record. `f` must not call back into a
/// copying store accessor on the same thread.
pub fn with<T>(f: impl FnOnce(&Scratch) -> T) -> T {
    SCRATCH.with(|s| f(&s.borrow()))
}

/// Runs `f` with this thread's scratch record, mutable. Same re-entry rule as
/// [`with`].
pub fn with_mut<T>(f: impl FnOnce(&mut Scratch) -> T) -> T {
    SCRATCH.with(|s| f(&mut s.borrow_mut()))
}
