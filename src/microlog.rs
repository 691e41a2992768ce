//! Micro-log: a ring of cache-line-sized persistent-memory blocks that makes
//! each index update durable before it appears in the shardmap.
//!
//! The ring lives directly in the mapped file — [`Microlog::attach`] borrows
//! a byte region of exactly [`Microlog::region_bytes`] bytes (a small meta
//! cache line followed by `2^logorder` [`BLOCK_BYTES`]-sized blocks) and
//! reads/writes through it. A commit steals the low two bits of every
//! payload cell to carry a two-bit generation tag, rotated once per full
//! trip around the ring; the stolen bits are folded into the block's last
//! cell (`savebits`) so [`Microlog::read`] can recover the exact payload
//! bytes. [`Microlog::valid`] lets a reader recognize a block that reached
//! persistence without a checksum: cells tagged odd form a set whose count
//! is a multiple of [`LINECELLS`], which only happens once every cache line
//! in the block carries a uniform tag.
//!
//! The ring's `head`/`tail`/generation counter are themselves kept in the
//! meta cache line ahead of the blocks, flushed with the same `clwb`+`sfence`
//! discipline as the payload — a direct, simpler reading of spec.md §4.7's
//! "the tail is written by commit, read by unify" than reconstructing the
//! pointer purely from per-block tag scanning on every reopen.

use crate::pmem;

pub const BLOCKCELLS: usize = 32;
pub const LINECELLS: usize = 8;
pub const CELLBYTES: usize = 8;
pub const BLOCK_BYTES: usize = BLOCKCELLS * CELLBYTES;

/// Max payload size a single commit can carry: every cell but the last is
/// available, and the last holds `savebits`.
pub const MAX_PAYLOAD: usize = (BLOCKCELLS - 1) * CELLBYTES;

/// One cache line reserved ahead of the ring for `{head, tail, counter}`.
const META_BYTES: usize = 64;

/// A micro-log ring attached to a byte region of a mapped file.
pub struct Microlog<'a> {
    logorder: u32,
    meta: &'a mut [u8],
    data: &'a mut [u8],
}

impl<'a> Microlog<'a> {
    /// Total bytes a ring of `2^logorder` blocks needs, meta line included.
    pub fn region_bytes(logorder: u32) -> usize {
        META_BYTES + (1usize << logorder) * BLOCK_BYTES
    }

    /// Zero a freshly mapped region before the first [`Microlog::attach`].
    pub fn format(region: &mut [u8]) {
        region.fill(0);
    }

    /// Attach to a region previously formatted (or reopened from disk).
    /// `region` must be exactly [`Microlog::region_bytes`]`(logorder)` long.
    pub fn attach(region: &'a mut [u8], logorder: u32) -> Microlog<'a> {
        let (meta, data) = region.split_at_mut(META_BYTES);
        Microlog { logorder, meta, data }
    }

    pub fn logsize(&self) -> u32 {
        1u32 << self.logorder
    }

    fn logmask(&self) -> u32 {
        self.logsize() - 1
    }

    pub fn head(&self) -> u32 {
        u32::from_le_bytes(self.meta[0..4].try_into().unwrap())
    }

    pub fn tail(&self) -> u32 {
        u32::from_le_bytes(self.meta[4..8].try_into().unwrap())
    }

    fn counter(&self) -> u64 {
        u64::from_le_bytes(self.meta[8..16].try_into().unwrap())
    }

    fn flush_meta(&self) {
        unsafe { pmem::clwb(self.meta.as_ptr(), META_BYTES) };
        pmem::sfence();
    }

    fn set_head(&mut self, v: u32) {
        self.meta[0..4].copy_from_slice(&v.to_le_bytes());
        self.flush_meta();
    }

    fn set_tail_and_counter(&mut self, tail: u32, counter: u64) {
        self.meta[4..8].copy_from_slice(&tail.to_le_bytes());
        self.meta[8..16].copy_from_slice(&counter.to_le_bytes());
        self.flush_meta();
    }

    fn block_offset(&self, i: u32) -> usize {
        i as usize * BLOCK_BYTES
    }

    /// Pending, uncommitted-to-in-place entry count.
    pub fn burst(&self) -> u32 {
        self.tail().wrapping_sub(self.head()) & self.logmask()
    }

    /// Whether the ring has exactly one free slot left (the one always
    /// reserved for the sentinel "unify" marker).
    pub fn is_almost_full(&self) -> bool {
        self.burst() == self.logsize() - 1
    }

    /// Durably append `payload` (at most [`MAX_PAYLOAD`] bytes) and return
    /// the ring index it landed at. Every payload cell is flushed and an
    /// `sfence` issued before returning, so the entry is durable by the
    /// time the caller sees the index.
    pub fn commit(&mut self, payload: &[u8]) -> u32 {
        assert!(payload.len() <= MAX_PAYLOAD, "microlog: payload too large for one block");
        let cells = (payload.len() + CELLBYTES - 1) / CELLBYTES;
        debug_assert!(cells < BLOCKCELLS);

        let i = self.tail();
        let counter = self.counter();
        let tag = (counter >> self.logorder) & 3;
        let block_off = self.block_offset(i);

        let mut savebits: u64 = 0;
        for cell in 0..cells {
            let start = cell * CELLBYTES;
            let end = (start + CELLBYTES).min(payload.len());
            let mut bytes = [0u8; CELLBYTES];
            bytes[..end - start].copy_from_slice(&payload[start..end]);
            let raw = u64::from_le_bytes(bytes);
            savebits |= (raw & 3) << (62 - 2 * cell as u64);
            let val = (raw & !3) | tag;
            let off = block_off + cell * CELLBYTES;
            self.data[off..off + CELLBYTES].copy_from_slice(&val.to_le_bytes());
        }
        let last_off = block_off + (BLOCKCELLS - 1) * CELLBYTES;
        let last_val = savebits | tag;
        self.data[last_off..last_off + CELLBYTES].copy_from_slice(&last_val.to_le_bytes());

        for line in (0..BLOCKCELLS).step_by(LINECELLS) {
            let ptr = self.data[block_off + line * CELLBYTES..].as_ptr();
            unsafe { pmem::clwb(ptr, LINECELLS * CELLBYTES) };
        }
        pmem::sfence();

        let new_tail = (i + 1) & self.logmask();
        self.set_tail_and_counter(new_tail, counter + 1);
        i
    }

    /// Reverse a commit's tag-stealing and return the original payload
    /// bytes (padded to a whole number of cells).
    pub fn read(&self, i: u32) -> Vec<u8> {
        let block_off = self.block_offset(i);
        let last_off = block_off + (BLOCKCELLS - 1) * CELLBYTES;
        let savebits = u64::from_le_bytes(self.data[last_off..last_off + CELLBYTES].try_into().unwrap());
        let mut out = Vec::with_capacity(MAX_PAYLOAD);
        for cell in 0..BLOCKCELLS - 1 {
            let off = block_off + cell * CELLBYTES;
            let raw = u64::from_le_bytes(self.data[off..off + CELLBYTES].try_into().unwrap());
            let shift = 62 - 2 * cell as u64;
            let low2 = (savebits >> shift) & 3;
            let restored = (raw & !3) | low2;
            out.extend_from_slice(&restored.to_le_bytes());
        }
        out
    }

    /// Whether block `i` reached persistence: true iff the count of cells
    /// with an odd low bit is a multiple of a cache line's cell count.
    pub fn valid(&self, i: u32) -> bool {
        let block_off = self.block_offset(i);
        let mut sum = 0u32;
        for cell in 0..BLOCKCELLS {
            let off = block_off + cell * CELLBYTES;
            let raw = u64::from_le_bytes(self.data[off..off + CELLBYTES].try_into().unwrap());
            sum += (raw & 1) as u32;
        }
        sum % LINECELLS as u32 == 0
    }

    /// Retire entries `[head, tail)` after `unify` has applied them.
    pub fn advance_head(&mut self) {
        let t = self.tail();
        self.set_head(t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(logorder: u32) -> Vec<u8> {
        vec![0u8; Microlog::region_bytes(logorder)]
    }

    #[test]
    fn commit_then_read_round_trips() {
        let mut bytes = region(4);
        Microlog::format(&mut bytes);
        let mut log = Microlog::attach(&mut bytes, 4);
        let payload = b"hello shardmap, this is a log entry";
        let i = log.commit(payload);
        assert!(log.valid(i));
        let back = log.read(i);
        assert_eq!(&back[..payload.len()], &payload[..]);
    }

    #[test]
    fn burst_tracks_pending_entries() {
        let mut bytes = region(3);
        Microlog::format(&mut bytes);
        let mut log = Microlog::attach(&mut bytes, 3);
        assert_eq!(log.burst(), 0);
        log.commit(b"a");
        log.commit(b"b");
        assert_eq!(log.burst(), 2);
        log.advance_head();
        assert_eq!(log.burst(), 0);
    }

    #[test]
    fn ring_wraps_without_losing_validity() {
        let mut bytes = region(2); // logsize = 4
        Microlog::format(&mut bytes);
        let mut log = Microlog::attach(&mut bytes, 2);
        for n in 0..10u8 {
            let i = log.commit(&[n; 8]);
            assert!(log.valid(i));
            if log.is_almost_full() {
                log.advance_head();
            }
        }
    }

    #[test]
    fn reattaching_preserves_head_and_tail() {
        let mut bytes = region(3);
        Microlog::format(&mut bytes);
        {
            let mut log = Microlog::attach(&mut bytes, 3);
            log.commit(b"x");
            log.commit(b"y");
        }
        let log = Microlog::attach(&mut bytes, 3);
        assert_eq!(log.burst(), 2);
    }
}
