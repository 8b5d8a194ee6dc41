use crate::backend::{GrowableRegion, Region};
use crate::Result;
use memmap2::{MmapMut, MmapOptions, RemapOptions};

/// An anonymous mapping grown in place with mremap. Growth may move the base
/// address; nothing in the store holds pointers across a grow.
///
/// Mapping failures are fatal: all callers sit below an operation that has
/// already committed to growing, so there is nothing sane to unwind to.
pub struct AnonRegion {
    map: Option<MmapMut>,
}

impl AnonRegion {
    fn map_anon(len: usize) -> MmapMut {
        MmapOptions::new()
            .len(len)
            .map_anon()
            .expect("anonymous mmap() failed")
    }
}

impl Region for AnonRegion {
    #[inline]
    fn data(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    #[inline]
    fn data_mut(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }
}

impl GrowableRegion for AnonRegion {
    fn create(len: usize) -> Result<Self> {
        let map = (len > 0).then(|| Self::map_anon(len));
        Ok(Self { map })
    }

    fn resize_impl(&mut self, new_len: usize) -> Result<()> {
        match self.map.as_mut() {
            Some(map) => unsafe {
                map.remap(new_len, RemapOptions::new().may_move(true))
                    .expect("mremap() failed");
            },
            None => self.map = Some(Self::map_anon(new_len)),
        }
        Ok(())
    }
}
