use crate::backend::{GrowableRegion, Region};
use crate::Result;

/// A `Vec` backed region. Useful for tests and heap-only stores.
pub struct MemoryRegion {
    data: Vec<u8>,
}

impl Region for MemoryRegion {
    #[inline]
    fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl GrowableRegion for MemoryRegion {
    fn create(len: usize) -> Result<Self> {
        Ok(Self {
            data: vec![0u8; len],
        })
    }

    #[inline]
    fn resize_impl(&mut self, new_len: usize) -> Result<()> {
        self.data.resize(new_len, 0u8);
        Ok(())
    }
}
