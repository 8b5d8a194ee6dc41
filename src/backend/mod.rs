use crate::Result;

pub mod anon;
pub mod memory;

/// A contiguous byte region backing one of the store's growable areas.
pub trait Region {
    /// Should return the whole region in bytes.
    fn data(&self) -> &[u8];
    /// Should return the whole region in bytes mutable.
    fn data_mut(&mut self) -> &mut [u8];

    /// Returns the current region size in bytes.
    #[inline]
    fn len(&self) -> usize {
        self.data().len()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `Region` extending trait to define regions that can dynamically grow in
/// place. Regions never shrink while in use; they are dropped whole.
pub trait GrowableRegion: Region {
    /// Creates a region of exactly `len` zeroed bytes.
    fn create(len: usize) -> Result<Self>
    where
        Self: Sized;

    /// Function needed to be implemented to support resizing for regions.
    /// Bytes past the old size must read as zero afterwards.
    fn resize_impl(&mut self, new_len: usize) -> Result<()>;

    #[inline]
    fn grow(&mut self, additional: usize) -> Result<()> {
        let new_len = self
            .len()
            .checked_add(additional)
            .expect("region size overflow");
        self.resize_impl(new_len)
    }
}
