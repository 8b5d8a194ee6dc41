//! N independent instances striped behind one facade.
//!
//! Each shard pairs an instance with its own spinlock, so parallel callers
//! contend per shard instead of on one big lock. Key scoped calls pick the
//! shard from hash lane 3 and stamp it into the returned UID. A store wide
//! lock serializes construction, destruction, reboot and instance swapping.
//!
//! With locking disabled at construction the caller must serialize access
//! itself; the facade then behaves like a plain array of instances.

use std::cell::UnsafeCell;

use log::warn;

use crate::backend::anon::AnonRegion;
use crate::backend::GrowableRegion;
use crate::components::counts::{Cursor, Direction};
use crate::components::instance::{HkvRef, Instance, Uid};
use crate::hash;
use crate::scratch::Scratch;
use crate::spinlock::{LockStatus, SpinLock};
use crate::{Error, Result};

/// Most instances an ensemble may stripe over; keeps the UID within 8 bytes
/// and the total record space at 256 * 4 GiB.
pub const INSTANCES_MAX: usize = 256;

/// Serializes ensemble lifetime operations across the whole process.
static ENSEMBLE_LOCK: SpinLock = SpinLock::new();

struct Shard<R> {
    lock: SpinLock,
    cdb: UnsafeCell<Box<Instance<R>>>,
}

pub struct Ensemble<R = AnonRegion> {
    shards: Vec<Shard<R>>,
    locked: bool,
}

// Safety: every mutating entry point takes the owning shard's lock first (or,
// with locking disabled, documents that the caller serializes access), so the
// UnsafeCell contents are never touched concurrently.
unsafe impl<R: Send> Send for Ensemble<R> {}
unsafe impl<R: Send> Sync for Ensemble<R> {}

impl<R: GrowableRegion> Ensemble<R> {
    /// Creates `count` instances, each sized for its share of
    /// `keys_at_start` and `kv_limit` (0 = uncapped). `locked` enables the
    /// per shard spinlocks.
    pub fn new(keys_at_start: u32, kv_limit: u64, count: u32, locked: bool) -> Result<Self> {
        if count == 0 || count as usize > INSTANCES_MAX {
            warn!("ensemble of {count} instances not representable");
            return Err(Error::Initialization);
        }

        let status = ENSEMBLE_LOCK.acquire()?;
        let shard_kv_limit = (kv_limit / count as u64).min(u32::MAX as u64) as u32;
        let shards: Result<Vec<Shard<R>>> = (0..count)
            .map(|_| {
                Ok(Shard {
                    lock: SpinLock::new(),
                    cdb: UnsafeCell::new(Box::new(Instance::new(
                        keys_at_start / count,
                        shard_kv_limit,
                    )?)),
                })
            })
            .collect();
        if status == LockStatus::Taken {
            ENSEMBLE_LOCK.release();
        }

        Ok(Self {
            shards: shards?,
            locked,
        })
    }

    #[inline]
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Shard of the prepared key.
    #[inline]
    fn shard_of(&self) -> usize {
        hash::with_prepared(|p| p.hash.shard() as usize % self.shards.len())
    }

    fn lock_shard(&self, shard: usize) -> Result<Option<LockStatus>> {
        if !self.locked {
            return Ok(None);
        }
        Ok(Some(self.shards[shard].lock.acquire()?))
    }

    fn unlock_shard(&self, shard: usize, status: Option<LockStatus>) {
        if let Some(LockStatus::Taken) = status {
            self.shards[shard].lock.release();
        }
    }

    /// Shared view of a shard's instance. Caller must hold the shard lock or
    /// otherwise serialize access.
    fn instance(&self, shard: usize) -> &Instance<R> {
        unsafe { &**self.shards[shard].cdb.get() }
    }

    /// Exclusive view of a shard's instance. Same locking contract.
    #[allow(clippy::mut_from_ref)]
    fn instance_mut(&self, shard: usize) -> &mut Instance<R> {
        unsafe { &mut **self.shards[shard].cdb.get() }
    }

    /// Appends the prepared key with `val` to its shard; the returned UID
    /// carries the shard id.
    pub fn put_val(&self, val: &[u8]) -> Result<Uid> {
        let shard = self.shard_of();
        let status = self.lock_shard(shard)?;
        let uid = self.instance_mut(shard).put_val(val);
        self.unlock_shard(shard, status);
        Ok(uid?.with_instance(shard as u8))
    }

    /// UID of the prepared key, or `None`.
    pub fn get_uid(&self) -> Result<Option<Uid>> {
        let shard = self.shard_of();
        let status = self.lock_shard(shard)?;
        let uid = self.instance_mut(shard).get_uid();
        self.unlock_shard(shard, status);
        Ok(uid.map(|uid| uid.with_instance(shard as u8)))
    }

    /// Copies the record addressed by `uid` into this thread's scratch and
    /// runs `read` on it.
    pub fn get_uid_hkv<T>(
        &self,
        uid: Uid,
        read: impl FnOnce(&Scratch) -> T,
    ) -> Result<Option<T>> {
        let shard = uid.instance() as usize;
        let status = self.lock_shard(shard)?;
        let out = self.instance(shard).get_uid_hkv(uid, read);
        self.unlock_shard(shard, status);
        Ok(out)
    }

    /// Re-persists this thread's scratch copy over the record addressed by
    /// `uid`. Call only after a `get_uid_hkv` of the same record.
    pub fn set_uid_hkv(&self, uid: Uid) -> Result<()> {
        let shard = uid.instance() as usize;
        let status = self.lock_shard(shard)?;
        let res = self.instance_mut(shard).set_uid_hkv(uid);
        self.unlock_shard(shard, status);
        res
    }

    /// Increments the prepared key's counter on `list` in its shard.
    pub fn increment(&self, list: u32) -> Result<u64> {
        let shard = self.shard_of();
        let status = self.lock_shard(shard)?;
        let count = self.instance_mut(shard).increment(list);
        self.unlock_shard(shard, status);
        count
    }

    /// Direct record view of the prepared key, leaving the shard lock HELD.
    /// The view aliases remappable bytes, which is exactly why the lock
    /// stays taken: call [`Ensemble::get_hkv_raw_unlock`] when done with it
    /// and before any further use of this shard.
    pub fn get_hkv_raw_locked(&self) -> Result<Option<HkvRef<'_>>> {
        let shard = self.shard_of();
        self.lock_shard(shard)?;
        Ok(self.instance(shard).get_hkv_raw())
    }

    /// Releases the shard lock taken by [`Ensemble::get_hkv_raw_locked`].
    pub fn get_hkv_raw_unlock(&self) {
        let shard = self.shard_of();
        if self.locked {
            self.shards[shard].lock.release();
        }
    }

    /// Direct record view by UID, leaving the shard lock held; pair with
    /// [`Ensemble::get_uid_hkv_raw_unlock`].
    pub fn get_uid_hkv_raw_locked(&self, uid: Uid) -> Result<Option<HkvRef<'_>>> {
        let shard = uid.instance() as usize;
        self.lock_shard(shard)?;
        Ok(self.instance(shard).get_uid_hkv_raw(uid))
    }

    pub fn get_uid_hkv_raw_unlock(&self, uid: Uid) {
        let shard = uid.instance() as usize;
        if self.locked {
            self.shards[shard].lock.release();
        }
    }

    /// Steps a walk over `list` of `shard`. Walking takes no locks: walking
    /// while updating cannot enumerate reliably, so the caller quiesces
    /// mutation instead.
    pub fn walk<T>(
        &self,
        shard: u32,
        list: u32,
        direction: Direction,
        cursor: Cursor,
        read: impl FnOnce(u64, &Scratch) -> T,
    ) -> (Cursor, Option<T>) {
        if shard as usize >= self.shards.len() {
            return (Cursor::START, None);
        }
        self.instance(shard as usize).walk(list, direction, cursor, read)
    }

    /// Record bytes used by one shard's arena; 0 for an invalid shard.
    pub fn kv_used(&self, shard: u32) -> u32 {
        if shard as usize >= self.shards.len() {
            return 0;
        }
        self.instance(shard as usize).kv_used()
    }

    /// Reboots every instance to its construction sizing, under the
    /// ensemble lock with every shard lock held.
    pub fn reboot(&self) -> Result<()> {
        let status = ENSEMBLE_LOCK.acquire()?;
        let result = self.reboot_under_lock();
        if status == LockStatus::Taken {
            ENSEMBLE_LOCK.release();
        }
        result
    }

    fn reboot_under_lock(&self) -> Result<()> {
        let mut held = Vec::with_capacity(self.shards.len());
        for shard in 0..self.shards.len() {
            match self.lock_shard(shard) {
                Ok(status) => held.push(status),
                Err(err) => {
                    for (shard, status) in held.into_iter().enumerate().rev() {
                        self.unlock_shard(shard, status);
                    }
                    return Err(err);
                }
            }
        }

        let mut result = Ok(());
        for shard in 0..self.shards.len() {
            if let Err(err) = self.instance_mut(shard).reboot() {
                result = Err(err);
                break;
            }
        }

        for (shard, status) in held.into_iter().enumerate().rev() {
            self.unlock_shard(shard, status);
        }
        result
    }

    /// Exchanges the backing instances of `self` and `other` pairwise, each
    /// pair under both shards' locks. Lets a freshly built (say, unlocked)
    /// ensemble replace a live one without pausing readers beyond one shard
    /// critical section.
    pub fn swap_instances(&self, other: &Ensemble<R>) -> Result<()> {
        assert_eq!(
            self.shards.len(),
            other.shards.len(),
            "cannot swap ensembles with differing instance counts"
        );

        let status = ENSEMBLE_LOCK.acquire()?;
        let mut result = Ok(());
        for shard in 0..self.shards.len() {
            let ours = match self.lock_shard(shard) {
                Ok(s) => s,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            let theirs = match other.lock_shard(shard) {
                Ok(s) => s,
                Err(err) => {
                    self.unlock_shard(shard, ours);
                    result = Err(err);
                    break;
                }
            };

            unsafe {
                std::mem::swap(
                    &mut *self.shards[shard].cdb.get(),
                    &mut *other.shards[shard].cdb.get(),
                );
            }

            other.unlock_shard(shard, theirs);
            self.unlock_shard(shard, ours);
        }
        if status == LockStatus::Taken {
            ENSEMBLE_LOCK.release();
        }
        result
    }
}

impl<R> Drop for Ensemble<R> {
    fn drop(&mut self) {
        // instance teardown serialized like construction; a wedged lock must
        // not leak every region, so teardown proceeds regardless
        let status = ENSEMBLE_LOCK.acquire();
        self.shards.clear();
        if status == Ok(LockStatus::Taken) {
            ENSEMBLE_LOCK.release();
        }
    }
}
