//! The store instance: one sheet index, sheet store, record arena and count
//! table, plus the probing, counting and walking logic tying them together.
//!
//! All mutation on an instance must be externally serialized (the ensemble
//! does this with per shard spinlocks). The caller prepares a key with
//! [`crate::hash::prepare`] before any key scoped call.

use std::cell::Cell;

use log::warn;

use crate::backend::anon::AnonRegion;
use crate::backend::GrowableRegion;
use crate::components::counts::{
    CountTable, Cursor, Direction, Link, COUNT_NONE, LINK_BYTES, LISTS,
};
use crate::components::hkv::{self, Layout};
use crate::components::kvarena::{KvArena, KV_OFF_NONE};
use crate::components::sheets::{
    CellEntry, SheetIndex, SheetStore, CELLS_PER_ROW, CELLS_PER_ROW_BITS, KEYS_PER_SHEET,
    ROWS_PER_SHEET, ROWS_PER_SHEET_BITS, SHEETS_MAX,
};
use crate::hash::{self, Prepared};
use crate::scratch::{self, Scratch};
use crate::{Error, Result};

const UID_BUCKET_SHIFT: u32 = 8;
const UID_ROW_SHIFT: u32 = UID_BUCKET_SHIFT + 16;
const UID_CELL_SHIFT: u32 = UID_ROW_SHIFT + ROWS_PER_SHEET_BITS;

// the packed uid must stay within 5 bytes
const _: () = assert!(UID_CELL_SHIFT + CELLS_PER_ROW_BITS == 40);

/// Compact logical address of a key: `instance:8 | bucket:16 | row:12 |
/// cell:4`, packed from bit 0. A UID survives sheet splits and region
/// remaps; the all-ones value is the "no key" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid(u64);

impl Uid {
    pub const NONE: Uid = Uid(u64::MAX);

    fn pack(bucket: usize, row: usize, cell: usize) -> Self {
        Uid(((bucket as u64) << UID_BUCKET_SHIFT)
            | ((row as u64) << UID_ROW_SHIFT)
            | ((cell as u64) << UID_CELL_SHIFT))
    }

    /// Ensemble shard owning the key; 0 at instance level.
    #[inline]
    pub fn instance(&self) -> u8 {
        self.0 as u8
    }

    #[inline]
    pub fn bucket(&self) -> usize {
        (self.0 >> UID_BUCKET_SHIFT) as usize & 0xffff
    }

    #[inline]
    pub fn row(&self) -> usize {
        (self.0 >> UID_ROW_SHIFT) as usize & (ROWS_PER_SHEET - 1)
    }

    #[inline]
    pub fn cell(&self) -> usize {
        (self.0 >> UID_CELL_SHIFT) as usize & (CELLS_PER_ROW - 1)
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Uid(raw)
    }

    pub(crate) fn with_instance(self, instance: u8) -> Self {
        Uid((self.0 & !0xff) | instance as u64)
    }
}

/// Borrowed view of one record in the arena: header, key and value bytes.
/// The borrow ends at the next mutating call, so the view can never outlive
/// a remap.
#[derive(Debug, Clone, Copy)]
pub struct HkvRef<'a> {
    bytes: &'a [u8],
    layout: Layout,
}

impl<'a> HkvRef<'a> {
    #[inline]
    pub fn hkv(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline]
    pub fn key(&self) -> &'a [u8] {
        &self.bytes[self.layout.key_range()]
    }

    #[inline]
    pub fn val(&self) -> &'a [u8] {
        &self.bytes[self.layout.val_range()]
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.layout.total_len()
    }
}

/// One store: up to ~2^29 keys addressing up to 4 GiB of record bytes.
pub struct Instance<R = AnonRegion> {
    index: SheetIndex,
    sheets: SheetStore<R>,
    kv: KvArena<R>,
    counts: CountTable<R>,
    cells_used: u32,
    splits: u32,
    split_keys: u64,
    keylen_misses: Cell<u64>,
    memcmp_misses: Cell<u64>,
    keys_at_start: u32,
    kv_limit: u32,
}

impl<R: GrowableRegion> Instance<R> {
    /// `keys_at_start` pre-sizes the sheets (two cells per expected key);
    /// `kv_limit` caps the record arena in bytes, 0 meaning uncapped.
    pub fn new(keys_at_start: u32, kv_limit: u32) -> Result<Self> {
        let initial_sheets = (keys_at_start / KEYS_PER_SHEET as u32 * 2)
            .clamp(1, SHEETS_MAX as u32);
        Ok(Self {
            index: SheetIndex::new(initial_sheets),
            sheets: SheetStore::new(initial_sheets)?,
            kv: KvArena::new(kv_limit)?,
            counts: CountTable::new()?,
            cells_used: 0,
            splits: 0,
            split_keys: 0,
            keylen_misses: Cell::new(0),
            memcmp_misses: Cell::new(0),
            keys_at_start,
            kv_limit,
        })
    }

    /// Releases all three regions and starts over at the construction
    /// sizing.
    pub fn reboot(&mut self) -> Result<()> {
        *self = Self::new(self.keys_at_start, self.kv_limit)?;
        Ok(())
    }

    fn hkv_at(&self, off: u32) -> HkvRef<'_> {
        let tail = self.kv.bytes(off);
        let layout = hkv::decode(tail);
        HkvRef {
            bytes: &tail[..layout.total_len()],
            layout,
        }
    }

    fn match_cell(&self, sheet: u16, row: usize, cell: usize, p: &Prepared) -> Option<u32> {
        let entry = self.sheets.cell(sheet, row, cell);
        if entry.kv_off == KV_OFF_NONE
            || entry.hash_lo != p.hash.lo()
            || entry.hash_hi != p.hash.hi()
        {
            return None;
        }
        let record = self.hkv_at(entry.kv_off);
        if record.key().len() != p.key.len() {
            self.keylen_misses.set(self.keylen_misses.get() + 1);
            return None;
        }
        if record.key() != &p.key[..] {
            self.memcmp_misses.set(self.memcmp_misses.get() + 1);
            return None;
        }
        Some(entry.kv_off)
    }

    /// Locates the prepared key: (row, cell, record offset).
    fn find(&self) -> Option<(usize, usize, u32)> {
        hash::with_prepared(|p| {
            let sheet = self.index.get(SheetIndex::bucket_of(p.hash.hi()));
            debug_assert!((sheet as u32) < self.sheets.count());
            let (row_1, row_2) = (p.hash.row_1(), p.hash.row_2());
            for cell in 0..CELLS_PER_ROW {
                for row in [row_1, row_2] {
                    if let Some(off) = self.match_cell(sheet, row, cell, p) {
                        return Some((row, cell, off));
                    }
                }
            }
            None
        })
    }

    /// Appends the prepared key with `val`, returning its UID. When the key
    /// already exists its UID is returned and the stored value stays
    /// untouched.
    pub fn put_val(&mut self, val: &[u8]) -> Result<Uid> {
        match self.get_uid() {
            Some(uid) => Ok(uid),
            None => self.insert(val),
        }
    }

    fn insert(&mut self, val: &[u8]) -> Result<Uid> {
        if self.kv.over_limit() {
            warn!(
                "record arena past its {} byte cap; refusing insert",
                self.kv_limit
            );
            return Err(Error::ArenaCapped);
        }

        let (key_hash, key_len) = hash::with_prepared(|p| (p.hash, p.key.len()));
        let header_len = hkv::header_len_for(key_len, val.len())?;
        let total = header_len + key_len + val.len();

        loop {
            let bucket = SheetIndex::bucket_of(key_hash.hi());
            let sheet = self.index.get(bucket);
            let (row_1, row_2) = (key_hash.row_1(), key_hash.row_2());
            let (used_1, free_1) = self.sheets.row_usage(sheet, row_1);
            let (used_2, free_2) = self.sheets.row_usage(sheet, row_2);

            if free_1.is_none() && free_2.is_none() {
                if self.sheets.count() as usize >= SHEETS_MAX {
                    warn!("both rows full at the {SHEETS_MAX} sheet cap; shard exhausted");
                    return Err(Error::ShardFull);
                }
                let (_, examined, _) = self.sheets.split(&mut self.index, sheet)?;
                self.splits += 1;
                self.split_keys += examined as u64;
                // the bucket may resolve to the new sheet now; redo the scan
                continue;
            }

            // the emptier row wins, row 1 on a tie; first free cell in it
            let (row, cell) = if used_1 <= used_2 {
                (row_1, free_1.expect("row 1 has a free cell"))
            } else {
                (row_2, free_2.expect("row 2 has a free cell"))
            };

            let off = self.kv.reserve(total)?;
            let written =
                hash::with_prepared(|p| hkv::encode(&p.key, val, self.kv.bytes_mut(off)))?;
            debug_assert_eq!(written, total);

            self.sheets.set_cell(
                sheet,
                row,
                cell,
                CellEntry {
                    hash_lo: key_hash.lo(),
                    hash_hi: key_hash.hi(),
                    kv_off: off,
                },
            );
            self.cells_used += 1;
            return Ok(Uid::pack(bucket, row, cell));
        }
    }

    /// UID of the prepared key, or `None` if it is not stored.
    pub fn get_uid(&self) -> Option<Uid> {
        let (row, cell, _) = self.find()?;
        let bucket = hash::with_prepared(|p| SheetIndex::bucket_of(p.hash.hi()));
        Some(Uid::pack(bucket, row, cell))
    }

    /// Direct view of the prepared key's record. Valid until the next
    /// mutating call.
    pub fn get_hkv_raw(&self) -> Option<HkvRef<'_>> {
        let (_, _, off) = self.find()?;
        Some(self.hkv_at(off))
    }

    fn uid_kv_off(&self, uid: Uid) -> Option<u32> {
        let bucket = uid.bucket();
        assert!(bucket < SHEETS_MAX, "uid bucket {bucket} out of range");
        let sheet = self.index.get(bucket);
        assert!(
            (sheet as u32) < self.sheets.count(),
            "uid bucket {bucket} resolves to unmapped sheet {sheet}"
        );
        let off = self.sheets.kv_off(sheet, uid.row(), uid.cell());
        (off != KV_OFF_NONE).then_some(off)
    }

    /// Direct view of the record addressed by `uid`. Valid until the next
    /// mutating call.
    pub fn get_uid_hkv_raw(&self, uid: Uid) -> Option<HkvRef<'_>> {
        self.uid_kv_off(uid).map(|off| self.hkv_at(off))
    }

    fn copy_to_scratch(&self, off: u32) {
        let record = self.hkv_at(off);
        scratch::with_mut(|s| {
            s.load(
                record.hkv(),
                record.layout.key_range(),
                record.layout.val_range(),
            )
        });
    }

    /// Copies the record addressed by `uid` into this thread's scratch and
    /// runs `read` on it. The scratch copy stays valid across remaps, unlike
    /// the raw views.
    pub fn get_uid_hkv<T>(&self, uid: Uid, read: impl FnOnce(&Scratch) -> T) -> Option<T> {
        let off = self.uid_kv_off(uid)?;
        self.copy_to_scratch(off);
        Some(scratch::with(read))
    }

    /// Writes this thread's scratch copy back over the record addressed by
    /// `uid`. The copy must be exactly as long as the stored record; call
    /// only after a `get_uid_hkv` of the same record.
    pub fn set_uid_hkv(&mut self, uid: Uid) -> Result<()> {
        let Some(off) = self.uid_kv_off(uid) else {
            return Ok(());
        };
        let stored = self.hkv_at(off).total_len();
        scratch::with(|s| {
            if s.len() != stored {
                warn!(
                    "scratch record is {} bytes but the stored record is {stored}; not persisted",
                    s.len()
                );
                return Err(Error::KeyInvalid);
            }
            self.kv.bytes_mut(off)[..stored].copy_from_slice(s.hkv());
            Ok(())
        })
    }

    fn link_of(&self, off: u32) -> Link {
        Link::read(self.hkv_at(off).val())
    }

    fn set_link(&mut self, off: u32, link: Link) {
        let range = hkv::decode(self.kv.bytes(off)).val_range();
        link.write(&mut self.kv.bytes_mut(off)[range]);
    }

    /// Increments the prepared key's counter on `list` and returns the new
    /// count, keeping the list's count nodes sorted. A missing key is
    /// created with a fresh 12 byte link value at count 1; a key whose value
    /// is anything else cannot be counted.
    pub fn increment(&mut self, list: u32) -> Result<u64> {
        assert!((list as usize) < LISTS, "count list {list} out of range");
        match self.find() {
            None => self.bootstrap_counter(list),
            Some((_, _, off)) => self.increment_existing(list, off),
        }
    }

    /// First increment of a key: store it with an empty link, then hang it
    /// off the list's count 1 node (creating that node if need be).
    fn bootstrap_counter(&mut self, list: u32) -> Result<u64> {
        self.insert(&[0u8; LINK_BYTES])?;
        let (_, _, this_off) = self.find().expect("inserted key must be locatable");
        let lowest = self.counts.lo(list);

        if lowest == COUNT_NONE {
            let node = self.counts.acquire()?;
            self.set_link(
                this_off,
                Link {
                    count_idx: node,
                    next_hkv: KV_OFF_NONE,
                    prev_hkv: KV_OFF_NONE,
                },
            );
            self.counts.set_count(node, 1);
            self.counts.set_next(node, COUNT_NONE);
            self.counts.set_prev(node, COUNT_NONE);
            self.counts.set_head(node, this_off);
            self.counts.set_lo(list, node);
            self.counts.set_hi(list, node);
        } else if self.counts.count(lowest) > 1 {
            // every existing count is above 1; splice a count 1 node below
            let node = self.counts.acquire()?;
            self.set_link(
                this_off,
                Link {
                    count_idx: node,
                    next_hkv: KV_OFF_NONE,
                    prev_hkv: KV_OFF_NONE,
                },
            );
            self.counts.set_count(node, 1);
            self.counts.set_next(node, lowest);
            self.counts.set_prev(node, COUNT_NONE);
            self.counts.set_head(node, this_off);
            self.counts.set_lo(list, node);
            self.counts.set_prev(lowest, node);
        } else {
            // join the count 1 chain as its new head
            let head_off = self.counts.head(lowest);
            debug_assert_ne!(head_off, KV_OFF_NONE);
            let mut head_link = self.link_of(head_off);
            debug_assert_eq!(head_link.prev_hkv, KV_OFF_NONE);
            head_link.prev_hkv = this_off;
            self.set_link(head_off, head_link);
            self.set_link(
                this_off,
                Link {
                    count_idx: lowest,
                    next_hkv: head_off,
                    prev_hkv: KV_OFF_NONE,
                },
            );
            self.counts.set_head(lowest, this_off);
        }
        Ok(1)
    }

    fn increment_existing(&mut self, list: u32, this_off: u32) -> Result<u64> {
        let layout = hkv::decode(self.kv.bytes(this_off));
        if layout.val_len != LINK_BYTES {
            warn!(
                "increment on a key with a {} byte value; not a counter",
                layout.val_len
            );
            return Err(Error::NotACounter);
        }

        let this_link = self.link_of(this_off);
        let this_c = this_link.count_idx;
        if this_c == COUNT_NONE || this_c >= self.counts.size() {
            warn!(
                "increment on a key referencing count node {this_c} of {}; not a counter",
                self.counts.size()
            );
            return Err(Error::NotACounter);
        }

        let next_c = self.counts.next(this_c);
        let count_new = self.counts.count(this_c) + 1;

        // lone climbing key: bump its node in place, no list surgery
        if self.counts.head(this_c) == this_off
            && this_link.next_hkv == KV_OFF_NONE
            && (next_c == COUNT_NONE || self.counts.count(next_c) > count_new)
        {
            self.counts.set_count(this_c, count_new);
            return Ok(count_new);
        }

        // unlink the record from its current count's chain
        let next_hkv = this_link.next_hkv;
        let prev_hkv = this_link.prev_hkv;
        let prev_c = self.counts.prev(this_c);

        if next_hkv != KV_OFF_NONE {
            let mut link = self.link_of(next_hkv);
            debug_assert_eq!(link.prev_hkv, this_off);
            link.prev_hkv = prev_hkv;
            self.set_link(next_hkv, link);
        }
        if prev_hkv != KV_OFF_NONE {
            let mut link = self.link_of(prev_hkv);
            debug_assert_eq!(link.next_hkv, this_off);
            link.next_hkv = next_hkv;
            self.set_link(prev_hkv, link);
        }
        if self.counts.head(this_c) == this_off {
            self.counts.set_head(this_c, next_hkv);
        }

        if self.counts.head(this_c) == KV_OFF_NONE {
            // chain drained: free the node and stitch its neighbours
            self.counts.release(this_c);
            if next_c != COUNT_NONE {
                self.counts.set_prev(next_c, prev_c);
            } else if self.counts.hi(list) == this_c {
                self.counts.set_hi(list, prev_c);
            }
            if prev_c != COUNT_NONE {
                self.counts.set_next(prev_c, next_c);
            } else if self.counts.lo(list) == this_c {
                self.counts.set_lo(list, next_c);
            }
        }

        // link the record into the target count
        if next_c == COUNT_NONE {
            // no higher count exists; append a terminal node.
            // this_c cannot have been freed here: a drained chain with no
            // higher count is exactly the in-place bump above.
            let node = self.counts.acquire()?;
            self.set_link(
                this_off,
                Link {
                    count_idx: node,
                    next_hkv: KV_OFF_NONE,
                    prev_hkv: KV_OFF_NONE,
                },
            );
            self.counts.set_hi(list, node);
            self.counts.set_count(node, count_new);
            self.counts.set_next(node, COUNT_NONE);
            self.counts.set_prev(node, this_c);
            self.counts.set_head(node, this_off);
            self.counts.set_next(this_c, node);
        } else if self.counts.count(next_c) == count_new {
            // the next node is the target count; become its chain head
            let head_off = self.counts.head(next_c);
            self.set_link(
                this_off,
                Link {
                    count_idx: next_c,
                    next_hkv: head_off,
                    prev_hkv: KV_OFF_NONE,
                },
            );
            let mut head_link = self.link_of(head_off);
            debug_assert_eq!(head_link.prev_hkv, KV_OFF_NONE);
            head_link.prev_hkv = this_off;
            self.set_link(head_off, head_link);
            self.counts.set_head(next_c, this_off);
        } else {
            // the next node overshoots; splice a new node in between
            let after = next_c;
            let node = self.counts.acquire()?;
            self.set_link(
                this_off,
                Link {
                    count_idx: node,
                    next_hkv: KV_OFF_NONE,
                    prev_hkv: KV_OFF_NONE,
                },
            );
            self.counts.set_count(node, count_new);
            self.counts.set_next(node, after);
            self.counts.set_prev(node, this_c);
            self.counts.set_head(node, this_off);
            self.counts.set_next(this_c, node);
            self.counts.set_prev(after, node);
        }

        Ok(count_new)
    }

    /// Scrutinizes a walk position, which may have come from outside the
    /// crate: the count node and record must be in range and the record's
    /// embedded link must reference that very node.
    fn cursor_check(&self, count_idx: u32, hkv_off: u32) -> Result<()> {
        if count_idx == COUNT_NONE || hkv_off == KV_OFF_NONE {
            return Ok(());
        }
        if count_idx >= self.counts.size() {
            return Err(Error::CursorInvalid);
        }
        if hkv_off >= self.kv.used() {
            return Err(Error::CursorInvalid);
        }
        let tail = self.kv.bytes(hkv_off);
        let header_len = hkv::header_len(tail);
        if hkv_off as usize + header_len > self.kv.used() as usize {
            return Err(Error::CursorInvalid);
        }
        let layout = hkv::decode(tail);
        if hkv_off as usize + layout.total_len() > self.kv.used() as usize {
            return Err(Error::CursorInvalid);
        }
        if layout.val_len != LINK_BYTES {
            return Err(Error::CursorInvalid);
        }
        if Link::read(&tail[layout.val_range()]).count_idx != count_idx {
            return Err(Error::CursorInvalid);
        }
        Ok(())
    }

    /// Steps the walk over `list`, running `read` on the count and scratch
    /// copy of the record walked to. Returns the advanced cursor and `None`
    /// once the end is reached (or on any bad cursor). Walking while
    /// incrementing is undefined; quiesce mutation first.
    pub fn walk<T>(
        &self,
        list: u32,
        direction: Direction,
        cursor: Cursor,
        read: impl FnOnce(u64, &Scratch) -> T,
    ) -> (Cursor, Option<T>) {
        let mut count_idx = cursor.count_idx;
        let mut hkv_off = cursor.hkv_off;

        if count_idx == COUNT_NONE {
            if list as usize >= LISTS {
                warn!("walk on count list {list} of {LISTS}");
                return (Cursor::START, None);
            }
            count_idx = match direction {
                Direction::HiToLo => self.counts.hi(list),
                Direction::LoToHi => self.counts.lo(list),
            };
            hkv_off = if count_idx == COUNT_NONE {
                KV_OFF_NONE
            } else {
                self.counts.head(count_idx)
            };
        }

        let mut out = None;
        if count_idx != COUNT_NONE {
            if hkv_off != KV_OFF_NONE {
                if self.cursor_check(count_idx, hkv_off).is_err() {
                    return (Cursor::START, None);
                }
                let next_hkv = self.link_of(hkv_off).next_hkv;
                if self.cursor_check(count_idx, next_hkv).is_err() {
                    return (Cursor::START, None);
                }

                self.copy_to_scratch(hkv_off);
                let count = self.counts.count(count_idx);
                out = Some(scratch::with(|s| read(count, s)));
                hkv_off = next_hkv;
            }
            if hkv_off == KV_OFF_NONE {
                // chain exhausted; preload the next count's head
                count_idx = match direction {
                    Direction::HiToLo => self.counts.prev(count_idx),
                    Direction::LoToHi => self.counts.next(count_idx),
                };
                hkv_off = if count_idx == COUNT_NONE {
                    KV_OFF_NONE
                } else {
                    self.counts.head(count_idx)
                };
            }
        }

        (
            Cursor {
                count_idx,
                hkv_off,
            },
            out,
        )
    }

    /// Asserts cell/index/record agreement for every populated cell.
    pub fn validate(&self) {
        for sheet in 0..self.sheets.count() as u16 {
            for row in 0..ROWS_PER_SHEET {
                for cell in 0..CELLS_PER_ROW {
                    let entry = self.sheets.cell(sheet, row, cell);
                    if entry.kv_off == KV_OFF_NONE {
                        continue;
                    }
                    let resolved = self.index.get(SheetIndex::bucket_of(entry.hash_hi));
                    assert_eq!(
                        resolved, sheet,
                        "cell ({sheet},{row},{cell}) belongs to sheet {resolved}"
                    );
                    assert!(entry.kv_off < self.kv.used());
                }
            }
        }
    }

    #[inline]
    pub fn kv_used(&self) -> u32 {
        self.kv.used()
    }

    #[inline]
    pub fn kv_size(&self) -> u32 {
        self.kv.size()
    }

    #[inline]
    pub fn cells_used(&self) -> u32 {
        self.cells_used
    }

    #[inline]
    pub fn cells_size(&self) -> u32 {
        self.sheets.count() * KEYS_PER_SHEET as u32
    }

    #[inline]
    pub fn sheet_count(&self) -> u32 {
        self.sheets.count()
    }

    /// Times one sheet split into two.
    #[inline]
    pub fn splits(&self) -> u32 {
        self.splits
    }

    /// Accumulated cells examined over all splits.
    #[inline]
    pub fn split_keys(&self) -> u64 {
        self.split_keys
    }

    /// Times a tag matched but the key length did not.
    #[inline]
    pub fn keylen_misses(&self) -> u64 {
        self.keylen_misses.get()
    }

    /// Times the key length matched but the key bytes did not.
    #[inline]
    pub fn memcmp_misses(&self) -> u64 {
        self.memcmp_misses.get()
    }

    #[inline]
    pub fn counts_used(&self) -> u32 {
        self.counts.used()
    }

    #[inline]
    pub fn counts_free(&self) -> u32 {
        self.counts.free()
    }

    #[inline]
    pub fn counts_size(&self) -> u32 {
        self.counts.size()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryRegion;
    use crate::hash::prepare;
    use rand::seq::SliceRandom;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    type MemInstance = Instance<MemoryRegion>;

    fn new_store() -> MemInstance {
        Instance::new(0, 0).unwrap()
    }

    fn walk_all(cdb: &MemInstance, list: u32, direction: Direction) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        let mut cursor = Cursor::START;
        loop {
            let (next, item) =
                cdb.walk(list, direction, cursor, |count, s| (count, s.key().to_vec()));
            if let Some(item) = item {
                out.push(item);
            }
            if next.at_end() {
                return out;
            }
            cursor = next;
        }
    }

    #[test]
    fn uid_packing() {
        let uid = Uid::pack(0x1234, 0xabc, 0xf).with_instance(7);
        assert_eq!(uid.instance(), 7);
        assert_eq!(uid.bucket(), 0x1234);
        assert_eq!(uid.row(), 0xabc);
        assert_eq!(uid.cell(), 0xf);
        assert!(!uid.is_none());
        assert!(Uid::NONE.is_none());
        assert_eq!(Uid::from_u64(uid.as_u64()), uid);
    }

    #[test]
    fn put_and_get() {
        let mut cdb = new_store();
        prepare(b"abc");
        let uid = cdb.put_val(b"ABC").unwrap();
        assert!(!uid.is_none());

        prepare(b"abc");
        assert_eq!(cdb.get_uid(), Some(uid));
        assert_eq!(
            cdb.get_uid_hkv(uid, |s| s.val().to_vec()).unwrap(),
            b"ABC".to_vec()
        );
        assert_eq!(
            cdb.get_uid_hkv(uid, |s| s.key().to_vec()).unwrap(),
            b"abc".to_vec()
        );

        prepare(b"other");
        assert_eq!(cdb.get_uid(), None);
        assert!(cdb.get_hkv_raw().is_none());
    }

    #[test]
    fn raw_views_agree() {
        let mut cdb = new_store();
        prepare(b"night");
        let uid = cdb.put_val(b"owl").unwrap();

        prepare(b"night");
        let by_key = cdb.get_hkv_raw().unwrap().hkv().to_vec();
        let by_uid = cdb.get_uid_hkv_raw(uid).unwrap().hkv().to_vec();
        assert_eq!(by_key, by_uid);
        assert_eq!(cdb.get_uid_hkv_raw(uid).unwrap().val(), b"owl");
    }

    #[test]
    fn existing_key_is_not_updated() {
        let mut cdb = new_store();
        prepare(b"key");
        let uid = cdb.put_val(b"first").unwrap();
        prepare(b"key");
        assert_eq!(cdb.put_val(b"second").unwrap(), uid);
        assert_eq!(
            cdb.get_uid_hkv(uid, |s| s.val().to_vec()).unwrap(),
            b"first".to_vec()
        );
        assert_eq!(cdb.cells_used(), 1);
    }

    #[test]
    fn record_bytes_follow_header_widths() {
        let mut cdb = new_store();

        let before = cdb.kv_used();
        prepare(&[b'a'; 7]);
        cdb.put_val(&[b'v'; 15]).unwrap();
        assert_eq!(cdb.kv_used() - before, 1 + 7 + 15);

        let before = cdb.kv_used();
        prepare(&[b'b'; 8]);
        cdb.put_val(b"v").unwrap();
        assert_eq!(cdb.kv_used() - before, 3 + 8 + 1);

        let before = cdb.kv_used();
        prepare(&[b'c'; 128]);
        cdb.put_val(b"v").unwrap();
        assert_eq!(cdb.kv_used() - before, 5 + 128 + 1);

        let before = cdb.kv_used();
        prepare(&[b'd'; 65_536]);
        cdb.put_val(&[b'v'; 65_536]).unwrap();
        assert_eq!(cdb.kv_used() - before, 8 + 65_536 + 65_536);
    }

    #[test]
    fn rejects_empty_key() {
        let mut cdb = new_store();
        prepare(b"");
        assert_eq!(cdb.put_val(b"v"), Err(Error::KeyInvalid));
    }

    #[test]
    fn arena_cap_latches() {
        let mut cdb: MemInstance = Instance::new(0, 8192).unwrap();
        prepare(b"filler");
        cdb.put_val(&[0u8; 3 * 4096]).unwrap();
        assert!(cdb.kv_size() > 8192);

        prepare(b"straw");
        assert_eq!(cdb.put_val(b"x"), Err(Error::ArenaCapped));

        // reads still work past the cap
        prepare(b"filler");
        assert!(cdb.get_uid().is_some());
    }

    #[test]
    fn counter_sequence() {
        let mut cdb = new_store();
        for want in 1..=100u64 {
            prepare(b"lone");
            assert_eq!(cdb.increment(0).unwrap(), want);
        }
        // a lone climbing key bumps its node in place
        assert_eq!(cdb.counts_used(), 1);
    }

    #[test]
    fn not_a_counter() {
        let mut cdb = new_store();
        prepare(b"plain");
        cdb.put_val(b"not twelve").unwrap();
        prepare(b"plain");
        assert_eq!(cdb.increment(0), Err(Error::NotACounter));
    }

    #[test]
    fn three_key_count_sort() {
        let mut cdb = new_store();
        for _ in 0..4 {
            prepare(b"k1");
            cdb.increment(0).unwrap();
        }
        for _ in 0..2 {
            prepare(b"k2");
            cdb.increment(0).unwrap();
        }
        for _ in 0..2 {
            prepare(b"k3");
            cdb.increment(0).unwrap();
        }

        let down = walk_all(&cdb, 0, Direction::HiToLo);
        assert_eq!(down.len(), 3);
        assert_eq!(down[0], (4, b"k1".to_vec()));
        assert_eq!((down[1].0, down[2].0), (2, 2));
        let mut pair = vec![down[1].1.clone(), down[2].1.clone()];
        pair.sort();
        assert_eq!(pair, vec![b"k2".to_vec(), b"k3".to_vec()]);

        let up = walk_all(&cdb, 0, Direction::LoToHi);
        assert_eq!(up.len(), 3);
        assert_eq!((up[0].0, up[1].0), (2, 2));
        assert_eq!(up[2], (4, b"k1".to_vec()));
    }

    #[test]
    fn runaway_counter() {
        let mut cdb = new_store();
        for key in [b"k1", b"k2", b"k3"] {
            prepare(key);
            assert_eq!(cdb.increment(0).unwrap(), 1);
        }

        for round in 2..=1001u64 {
            prepare(b"k1");
            assert_eq!(cdb.increment(0).unwrap(), round);

            let down = walk_all(&cdb, 0, Direction::HiToLo);
            assert_eq!(down.len(), 3);
            assert_eq!(down[0], (round, b"k1".to_vec()));
            assert_eq!((down[1].0, down[2].0), (1, 1));
        }

        // one node for count 1 holding two keys, one for count 1001
        assert_eq!(cdb.counts_used(), 2);
    }

    #[test]
    fn lists_are_independent() {
        let mut cdb = new_store();
        prepare(b"a");
        cdb.increment(3).unwrap();
        prepare(b"b");
        cdb.increment(9).unwrap();
        prepare(b"b");
        cdb.increment(9).unwrap();

        assert_eq!(walk_all(&cdb, 3, Direction::LoToHi), vec![(1, b"a".to_vec())]);
        assert_eq!(walk_all(&cdb, 9, Direction::HiToLo), vec![(2, b"b".to_vec())]);
        assert!(walk_all(&cdb, 0, Direction::LoToHi).is_empty());
    }

    #[test]
    fn random_counts_walk_sorted() {
        let mut cdb = new_store();
        let mut rng = StdRng::seed_from_u64(42);

        let expect: Vec<(Vec<u8>, u64)> = (0..40)
            .map(|i| (format!("key-{i}").into_bytes(), rng.gen_range(1..=30u64)))
            .collect();

        let mut ops: Vec<usize> = expect
            .iter()
            .enumerate()
            .flat_map(|(i, (_, n))| std::iter::repeat(i).take(*n as usize))
            .collect();
        ops.shuffle(&mut rng);
        for i in ops {
            prepare(&expect[i].0);
            cdb.increment(0).unwrap();
        }

        let up = walk_all(&cdb, 0, Direction::LoToHi);
        assert_eq!(up.len(), expect.len());
        assert!(up.windows(2).all(|w| w[0].0 <= w[1].0));

        let down = walk_all(&cdb, 0, Direction::HiToLo);
        assert_eq!(down.len(), expect.len());
        assert!(down.windows(2).all(|w| w[0].0 >= w[1].0));

        let mut got: Vec<(Vec<u8>, u64)> = up.into_iter().map(|(c, k)| (k, c)).collect();
        got.sort();
        let mut want = expect;
        want.sort();
        assert_eq!(got, want);
    }

    #[test]
    fn uids_survive_splits() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut cdb = new_store();
        let total = 200_000u32;
        let mut uids = Vec::with_capacity(100_000);
        for i in 0..total {
            let key = format!("key-{i:06}");
            prepare(key.as_bytes());
            let uid = cdb.put_val(&i.to_le_bytes()).unwrap();
            if i < 100_000 {
                uids.push(uid);
            }
        }
        assert!(cdb.splits() >= 3, "only {} splits", cdb.splits());
        assert!(cdb.sheet_count() >= 4);
        assert_eq!(cdb.cells_used(), total);
        cdb.validate();

        for (i, uid) in uids.iter().enumerate() {
            let (key, val) = cdb
                .get_uid_hkv(*uid, |s| (s.key().to_vec(), s.val().to_vec()))
                .unwrap();
            assert_eq!(key, format!("key-{i:06}").into_bytes());
            assert_eq!(val, (i as u32).to_le_bytes());
        }
    }

    #[test]
    fn nearly_full_rows_do_not_split() {
        let mut cdb = new_store();
        prepare(b"squeezed");
        let (lo, hi, row_1, row_2) =
            hash::with_prepared(|p| (p.hash.lo(), p.hash.hi(), p.hash.row_1(), p.hash.row_2()));

        // leave exactly one free cell in each candidate row; tags are chosen
        // not to collide with the key's own
        let filler = CellEntry {
            hash_lo: lo.wrapping_add(1),
            hash_hi: hi.wrapping_add(1),
            kv_off: 1,
        };
        for cell in 0..CELLS_PER_ROW - 1 {
            cdb.sheets.set_cell(0, row_1, cell, filler);
            cdb.sheets.set_cell(0, row_2, cell, filler);
        }

        prepare(b"squeezed");
        let uid = cdb.put_val(b"in").unwrap();
        assert_eq!(cdb.splits(), 0);
        assert_eq!(cdb.sheet_count(), 1);
        assert!(uid.row() == row_1 || uid.row() == row_2);
        assert_eq!(uid.cell(), CELLS_PER_ROW - 1);
    }

    #[test]
    fn reboot_starts_over() {
        let mut cdb = new_store();
        prepare(b"gone");
        cdb.put_val(b"soon").unwrap();
        prepare(b"cnt");
        cdb.increment(0).unwrap();

        cdb.reboot().unwrap();
        assert_eq!(cdb.kv_used(), 1);
        assert_eq!(cdb.cells_used(), 0);
        assert_eq!(cdb.counts_used(), 0);
        assert_eq!(cdb.sheet_count(), 1);
        assert_eq!(cdb.splits(), 0);
        prepare(b"gone");
        assert_eq!(cdb.get_uid(), None);

        prepare(b"fresh");
        cdb.put_val(b"value").unwrap();
        prepare(b"fresh");
        assert!(cdb.get_uid().is_some());
    }

    #[test]
    fn walk_rejects_garbage_cursors() {
        let mut cdb = new_store();
        prepare(b"k");
        cdb.increment(0).unwrap();

        // count node out of range
        let cursor = Cursor {
            count_idx: 999,
            hkv_off: 1,
        };
        let (next, item) = cdb.walk(0, Direction::LoToHi, cursor, |c, _| c);
        assert!(item.is_none());
        assert!(next.at_end());

        // record offset out of range
        let cursor = Cursor {
            count_idx: 1,
            hkv_off: u32::MAX - 7,
        };
        let (next, item) = cdb.walk(0, Direction::LoToHi, cursor, |c, _| c);
        assert!(item.is_none());
        assert!(next.at_end());

        // record that is not a counter
        let plain_off = cdb.kv_used();
        prepare(b"plain");
        cdb.put_val(b"12345").unwrap();
        let cursor = Cursor {
            count_idx: 1,
            hkv_off: plain_off,
        };
        let (next, item) = cdb.walk(0, Direction::LoToHi, cursor, |c, _| c);
        assert!(item.is_none());
        assert!(next.at_end());

        // counter record whose link references a different node
        let cursor = Cursor {
            count_idx: 2,
            hkv_off: 1,
        };
        let (next, item) = cdb.walk(0, Direction::LoToHi, cursor, |c, _| c);
        assert!(item.is_none());
        assert!(next.at_end());

        // the honest walk still works afterwards
        let all = walk_all(&cdb, 0, Direction::LoToHi);
        assert_eq!(all, vec![(1, b"k".to_vec())]);
    }

    #[test]
    fn walk_empty_list_ends_immediately() {
        let cdb = new_store();
        let (next, item) = cdb.walk(5, Direction::HiToLo, Cursor::START, |c, _| c);
        assert!(item.is_none());
        assert!(next.at_end());
    }

    #[test]
    fn scratch_writeback() {
        let mut cdb = new_store();
        prepare(b"mut");
        let uid = cdb.put_val(b"aaaa").unwrap();

        // unchanged scratch re-persist is a no-op
        cdb.get_uid_hkv(uid, |_| ()).unwrap();
        cdb.set_uid_hkv(uid).unwrap();
        assert_eq!(
            cdb.get_uid_hkv(uid, |s| s.val().to_vec()).unwrap(),
            b"aaaa".to_vec()
        );

        // same length rewrite sticks
        cdb.get_uid_hkv(uid, |_| ()).unwrap();
        scratch::with_mut(|s| s.val_mut().copy_from_slice(b"bbbb"));
        cdb.set_uid_hkv(uid).unwrap();
        assert_eq!(
            cdb.get_uid_hkv(uid, |s| s.val().to_vec()).unwrap(),
            b"bbbb".to_vec()
        );

        // a stale, differently sized scratch is refused
        prepare(b"longer");
        let other = cdb.put_val(b"cccccccc").unwrap();
        cdb.get_uid_hkv(other, |_| ()).unwrap();
        assert_eq!(cdb.set_uid_hkv(uid), Err(Error::KeyInvalid));
    }
}
