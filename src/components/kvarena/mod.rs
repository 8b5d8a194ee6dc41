//! The record arena: one contiguous byte area holding every encoded record,
//! addressed by 32 bit offsets.

use log::debug;

use crate::backend::{GrowableRegion, Region};
use crate::utils::{pages_for, PAGE_BYTES};
use crate::{Error, Result};

/// Offset 0 is reserved as the "no record" sentinel.
pub const KV_OFF_NONE: u32 = 0;

/// Append-only byte arena grown by whole pages. Records are never moved or
/// freed; offsets handed out are stable for the life of the instance.
pub struct KvArena<R> {
    region: R,
    used: u32,
    limit: u32,
}

impl<R: GrowableRegion> KvArena<R> {
    /// `limit` caps the arena size in bytes; 0 means uncapped (up to 4 GiB).
    pub fn new(limit: u32) -> Result<Self> {
        Ok(Self {
            region: R::create(PAGE_BYTES)?,
            // offset 0 stays unused so it can mean "empty cell"
            used: 1,
            limit,
        })
    }

    /// Bytes allocated, used or not.
    #[inline]
    pub fn size(&self) -> u32 {
        self.region.len() as u32
    }

    /// Bytes written, the reserved byte 0 included.
    #[inline]
    pub fn used(&self) -> u32 {
        self.used
    }

    /// `true` once the arena has grown past the caller's cap. Checked before
    /// inserts so that neither arena growth nor sheet splits can happen past
    /// the cap.
    #[inline]
    pub fn over_limit(&self) -> bool {
        self.limit > 0 && self.size() > self.limit
    }

    /// Reserves `want` bytes, growing the region when needed, and returns the
    /// offset of the reservation.
    pub fn reserve(&mut self, want: usize) -> Result<u32> {
        let offset = self.used;
        let free = self.size() as usize - self.used as usize;
        if want > free {
            let growth = pages_for(want);
            let new_size = self.size() as u64 + growth as u64;
            if new_size > u32::MAX as u64 {
                return Err(Error::ArenaCapped);
            }
            debug!("record arena grows by {growth} bytes to {new_size}");
            self.region.grow(growth)?;
        }
        self.used += want as u32;
        Ok(offset)
    }

    /// Bytes from `offset` to the end of the region. Valid only until the
    /// next `reserve`.
    #[inline]
    pub fn bytes(&self, offset: u32) -> &[u8] {
        &self.region.data()[offset as usize..]
    }

    #[inline]
    pub fn bytes_mut(&mut self, offset: u32) -> &mut [u8] {
        &mut self.region.data_mut()[offset as usize..]
    }
}
