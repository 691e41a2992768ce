//! Record block: a slotted, self-compacting arena for fixed-`reclen`
//! key/value entries inside one block of bytes.
//!
//! Layout, growing from both ends toward a shrinking gap in the middle:
//!
//! ```text
//! [ header(12) | tabent[0] tabent[1] ... | ... gap ... | ...rec(n-1) rec(n-2) ... rec(0) ]
//! ```
//!
//! The header tracks `size` (block length), `used` (bytes consumed by
//! records, including holes), `free` (key-text bytes sitting in holes),
//! `count` (live + hole entries) and `holes`. Entry `i`'s record occupies
//! `reclen + table[i].len` bytes; entry 0 sits nearest the end of the
//! block, entry `count-1` sits nearest the gap. A hole is an entry whose
//! `tabent.hash` is [`HOLECODE`]; `create` reuses the smallest run of
//! adjacent holes that fits rather than always appending, so repeated
//! insert/delete cycles don't waste space.
//!
//! Two flavors of record share this layout and differ only in how a
//! stored key region is interpreted: [`Fixed`] treats the whole stored
//! key region as the comparison key; [`VarTail`] treats the first byte of
//! the payload as a tail length `varlen`, and only the leading
//! `storedlen - varlen` bytes of the key region are compared — the rest
//! is value data borrowed from the key's tail. Both are monomorphizations
//! of [`RecordBlock`] over a `const VARTAIL: bool`, so neither pays for
//! branches the other doesn't need. [`RecordOps`] is the trait a
//! `Keymap` programs against so it does not need to know which flavor it
//! holds.

use crate::error::{Result, ShardmapError};

pub const HOLECODE: u8 = 0xff;
pub const MAXNAME: usize = 255;
const HEADER_SIZE: usize = 12;
const TABENT_SIZE: usize = 2;

fn get_u16(block: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([block[off], block[off + 1]])
}

fn set_u16(block: &mut [u8], off: usize, v: u16) {
    let b = v.to_le_bytes();
    block[off] = b[0];
    block[off + 1] = b[1];
}

fn rb_hash(lowhash: u16) -> u8 {
    (lowhash % 255) as u8
}

/// Largest key-region length a `create` could currently succeed with,
/// capped at [`MAXNAME`]. Pure function of the raw block bytes, so a
/// `bigmap::BlockSource` can call it without holding a live [`RecordBlock`].
pub fn big_of(block: &[u8], reclen: usize) -> u8 {
    let size = get_u16(block, 0) as usize;
    let used = get_u16(block, 2) as usize;
    let free = get_u16(block, 4) as usize;
    let holes = get_u16(block, 8) as usize;
    let count = get_u16(block, 6) as usize;
    let overhead = reclen + TABENT_SIZE;
    let gap = size - used - (HEADER_SIZE + count * TABENT_SIZE);
    let big = if holes > 0 {
        gap + free
    } else if gap > overhead {
        gap - overhead
    } else {
        0
    };
    big.min(MAXNAME) as u8
}

/// Operations every record-block flavor supports. `create`'s `tail` is the
/// value-data suffix borrowed from the key region; [`Fixed`] requires it
/// empty, [`VarTail`] stores its length in `payload[0]`.
pub trait RecordOps {
    fn init(&mut self);
    fn big(&self) -> u8;
    fn lookup(&self, key: &[u8], lowhash: u16) -> Option<&[u8]>;
    fn create(&mut self, key: &[u8], tail: &[u8], lowhash: u16, payload: &[u8]) -> Result<usize>;
    fn delete(&mut self, key: &[u8], lowhash: u16) -> Result<()>;
    fn walk(&self, f: &mut dyn FnMut(&[u8], &[u8]));
    fn check(&self) -> usize;
}

/// A record block, borrowed for the duration of one operation.
/// `VARTAIL = false` is [`Fixed`]; `VARTAIL = true` is [`VarTail`].
pub struct RecordBlock<'a, const VARTAIL: bool> {
    block: &'a mut [u8],
    reclen: usize,
}

pub type Fixed<'a> = RecordBlock<'a, false>;
pub type VarTail<'a> = RecordBlock<'a, true>;

impl<'a, const VARTAIL: bool> RecordBlock<'a, VARTAIL> {
    pub fn new(block: &'a mut [u8], reclen: usize) -> Self {
        RecordBlock { block, reclen }
    }

    fn size(&self) -> usize {
        get_u16(self.block, 0) as usize
    }
    fn used(&self) -> usize {
        get_u16(self.block, 2) as usize
    }
    fn set_used(&mut self, v: usize) {
        set_u16(self.block, 2, v as u16)
    }
    fn free_space(&self) -> usize {
        get_u16(self.block, 4) as usize
    }
    fn set_free_space(&mut self, v: usize) {
        set_u16(self.block, 4, v as u16)
    }
    fn count(&self) -> usize {
        get_u16(self.block, 6) as usize
    }
    fn set_count(&mut self, v: usize) {
        set_u16(self.block, 6, v as u16)
    }
    fn holes(&self) -> usize {
        get_u16(self.block, 8) as usize
    }
    fn set_holes(&mut self, v: usize) {
        set_u16(self.block, 8, v as u16)
    }

    fn tabent(&self, i: usize) -> (u8, u8) {
        let off = HEADER_SIZE + i * TABENT_SIZE;
        (self.block[off], self.block[off + 1])
    }
    fn set_tabent(&mut self, i: usize, hash: u8, len: u8) {
        let off = HEADER_SIZE + i * TABENT_SIZE;
        self.block[off] = hash;
        self.block[off + 1] = len;
    }

    fn gap(&self) -> usize {
        self.size() - self.used() - (HEADER_SIZE + self.count() * TABENT_SIZE)
    }

    /// Split a stored key-region length into `(real keylen, tail len)`.
    /// `Fixed` has no tail; `VarTail` reads `varlen` from `payload[0]`.
    fn split_storedlen(payload: &[u8], storedlen: usize) -> (usize, usize) {
        if VARTAIL {
            let varlen = payload[0] as usize;
            (storedlen - varlen, varlen)
        } else {
            (storedlen, 0)
        }
    }

    /// Read-only existence check against a block's bytes, without requiring
    /// a mutable borrow. Used to pick which of several same-`lowhash`
    /// candidates is the real match (e.g. before committing to the mutable
    /// borrow `delete` needs) while only holding a shared borrow of the
    /// record-block region.
    pub fn peek(block: &[u8], reclen: usize, key: &[u8], lowhash: u16) -> bool {
        let hash = rb_hash(lowhash);
        let count = get_u16(block, 6) as usize;
        let mut rec = get_u16(block, 0) as usize;
        for i in 0..count {
            let off = HEADER_SIZE + i * TABENT_SIZE;
            let h = block[off];
            let storedlen = block[off + 1] as usize;
            rec -= reclen + storedlen;
            if h != hash {
                continue;
            }
            let payload = &block[rec..rec + reclen];
            let (keylen, _tail) = Self::split_storedlen(payload, storedlen);
            if keylen == key.len() && &block[rec + reclen..rec + reclen + keylen] == key {
                return true;
            }
        }
        false
    }
}

impl<'a, const VARTAIL: bool> RecordOps for RecordBlock<'a, VARTAIL> {
    fn init(&mut self) {
        let size = self.block.len() as u16;
        set_u16(self.block, 0, size);
        self.set_used(0);
        self.set_free_space(0);
        self.set_count(0);
        self.set_holes(0);
        self.block[10] = b'R';
        self.block[11] = b'B';
    }

    fn big(&self) -> u8 {
        big_of(self.block, self.reclen)
    }

    fn lookup(&self, key: &[u8], lowhash: u16) -> Option<&[u8]> {
        let hash = rb_hash(lowhash);
        let reclen = self.reclen;
        let mut rec = self.size();
        for i in 0..self.count() {
            let (h, len) = self.tabent(i);
            let storedlen = len as usize;
            rec -= reclen + storedlen;
            if h != hash {
                continue;
            }
            let payload = &self.block[rec..rec + reclen];
            let (keylen, _tail) = Self::split_storedlen(payload, storedlen);
            if keylen == key.len() && &self.block[rec + reclen..rec + reclen + keylen] == key {
                return Some(payload);
            }
        }
        None
    }

    fn create(&mut self, key: &[u8], tail: &[u8], lowhash: u16, payload: &[u8]) -> Result<usize> {
        let reclen = self.reclen;
        if VARTAIL {
            debug_assert_eq!(payload[0] as usize, tail.len());
        } else {
            debug_assert!(tail.is_empty(), "rb: Fixed records carry no tail");
        }
        debug_assert_eq!(payload.len(), reclen);
        let newlen = key.len() + tail.len();
        if newlen > MAXNAME {
            return Err(ShardmapError::Corrupt("rb: key+tail longer than maxname"));
        }

        let gap = self.gap();

        if gap >= reclen + newlen + TABENT_SIZE {
            let used = self.used() + reclen + newlen;
            self.set_used(used);
            let rec_off = self.size() - used;
            let pos = self.count();
            self.set_count(pos + 1);
            self.set_tabent(pos, rb_hash(lowhash), newlen as u8);
            self.block[rec_off..rec_off + reclen].copy_from_slice(payload);
            self.block[rec_off + reclen..rec_off + reclen + key.len()].copy_from_slice(key);
            self.block[rec_off + reclen + key.len()..rec_off + reclen + newlen].copy_from_slice(tail);
            return Ok(rec_off);
        }

        if self.holes() == 0 || gap + self.free_space() < newlen {
            return Err(ShardmapError::NoSpace);
        }

        let last = self.count() - 1;
        let last_re = self.size() - self.used();
        let need0 = newlen as isize - gap as isize;

        let mut pos = last;
        let mut rec = last_re;
        let mut holespace: isize = 0;
        let mut use_entry = last;
        let mut found_keylen = 0usize;
        loop {
            let (h, len) = self.tabent(pos);
            let keylen = len as usize;
            if h == HOLECODE {
                holespace += keylen as isize;
                if holespace >= need0 {
                    use_entry = pos;
                    found_keylen = keylen;
                    break;
                }
            } else if pos == 0 {
                return Err(ShardmapError::Corrupt("rb: no reusable hole found"));
            }
            rec += reclen + keylen;
            if pos == 0 {
                return Err(ShardmapError::Corrupt("rb: hole scan exhausted block"));
            }
            pos -= 1;
        }

        holespace -= found_keylen as isize;
        let mut need = newlen as isize - found_keylen as isize;
        let final_rec;

        if need > 0 {
            // Selected hole is too small: shrink other holes between here and
            // the gap and shift real records down to grow it.
            let mut movedown = need - holespace;
            if movedown < 0 {
                movedown = 0;
            }
            self.set_used((self.used() as isize + movedown) as usize);

            let mut rec2 = last_re;
            let mut pos2 = last;
            loop {
                let (h, len) = self.tabent(pos2);
                let keylen = len as usize;
                if pos2 == use_entry {
                    break;
                }
                if h == HOLECODE {
                    let mut shrunk = keylen as isize - need;
                    if shrunk < 0 {
                        shrunk = 0;
                    }
                    let shrink = keylen as isize - shrunk;
                    self.set_tabent(pos2, HOLECODE, shrunk as u8);
                    self.set_free_space((self.free_space() as isize - shrink) as usize);
                    movedown += shrink;
                    need -= shrink;
                } else {
                    let src = rec2;
                    let len_bytes = reclen + keylen;
                    let dest = (rec2 as isize - movedown) as usize;
                    self.block.copy_within(src..src + len_bytes, dest);
                }
                rec2 += reclen + keylen;
                pos2 -= 1;
            }
            final_rec = (rec2 as isize - movedown) as usize;
        } else if need < 0 {
            // Selected hole is too big: shift real records up to absorb the
            // excess into the next hole found moving toward the gap, or
            // shrink the gap itself if none is found before the last entry.
            let mut moveup = (-need) as usize;
            need = 0;
            let use_re = (rec as isize + moveup as isize) as usize;
            let mut pos2 = use_entry;
            let mut rec2 = rec;
            if use_entry < last {
                loop {
                    pos2 += 1;
                    let (h, len) = self.tabent(pos2);
                    let keylen = len as usize;
                    rec2 -= reclen + keylen;
                    if h == HOLECODE {
                        let grown = keylen + moveup;
                        debug_assert!(grown <= MAXNAME);
                        self.set_tabent(pos2, HOLECODE, grown as u8);
                        self.set_free_space(self.free_space() + moveup);
                        moveup = 0;
                        break;
                    }
                    let src = rec2;
                    let len_bytes = reclen + keylen;
                    self.block.copy_within(src..src + len_bytes, src + moveup);
                    if pos2 == last {
                        break;
                    }
                }
            }
            if pos2 == last {
                self.set_used(self.used() - moveup);
            }
            final_rec = use_re;
        } else {
            final_rec = rec;
        }

        self.set_free_space(self.free_space() - found_keylen);
        self.set_holes(self.holes() - 1);
        self.set_tabent(use_entry, rb_hash(lowhash), newlen as u8);
        self.block[final_rec..final_rec + reclen].copy_from_slice(payload);
        self.block[final_rec + reclen..final_rec + reclen + key.len()].copy_from_slice(key);
        self.block[final_rec + reclen + key.len()..final_rec + reclen + newlen].copy_from_slice(tail);
        Ok(final_rec)
    }

    fn delete(&mut self, key: &[u8], lowhash: u16) -> Result<()> {
        let hash = rb_hash(lowhash);
        let reclen = self.reclen;
        let mut rec = self.size();
        for i in 0..self.count() {
            let (h, len) = self.tabent(i);
            let storedlen = len as usize;
            rec -= reclen + storedlen;
            if h != hash {
                continue;
            }
            let payload = &self.block[rec..rec + reclen];
            let (keylen, _tail) = Self::split_storedlen(payload, storedlen);
            if keylen == key.len() && &self.block[rec + reclen..rec + reclen + keylen] == key {
                self.set_tabent(i, HOLECODE, storedlen as u8);
                self.set_free_space(self.free_space() + storedlen);
                self.set_holes(self.holes() + 1);
                if i == self.count() - 1 {
                    self.trim_trailing_holes(i);
                }
                return Ok(());
            }
        }
        Err(ShardmapError::NotFound)
    }

    fn walk(&self, f: &mut dyn FnMut(&[u8], &[u8])) {
        let reclen = self.reclen;
        let mut rec = self.size();
        for i in 0..self.count() {
            let (h, len) = self.tabent(i);
            let storedlen = len as usize;
            rec -= reclen + storedlen;
            if h != HOLECODE {
                let payload = &self.block[rec..rec + reclen];
                let (keylen, _tail) = Self::split_storedlen(payload, storedlen);
                f(&self.block[rec + reclen..rec + reclen + keylen], payload);
            }
        }
    }

    fn check(&self) -> usize {
        let reclen = self.reclen;
        let count = self.count();
        let max_entries = (self.size() - HEADER_SIZE) / (reclen + TABENT_SIZE + 1);
        let mut errs = 0usize;
        let mut effective_count = count;
        if count > max_entries {
            errs += 1;
            log::warn!("rb: too many entries ({count}, max {max_entries})");
            effective_count = max_entries;
        }

        let table_top = HEADER_SIZE + effective_count * TABENT_SIZE;
        let mut rec = self.size();
        let mut scan_hole_count = 0usize;
        let mut scan_hole_space = 0usize;
        let mut scan_entry_space = 0usize;

        for i in 0..effective_count {
            let (h, len) = self.tabent(i);
            let keylen = len as usize;
            rec -= reclen + keylen;
            if rec < table_top {
                errs += 1;
                log::warn!("rb: entries overlap table");
                break;
            }
            if h == HOLECODE {
                scan_hole_space += keylen;
                scan_hole_count += 1;
            } else {
                scan_entry_space += keylen;
            }
        }

        if self.holes() != scan_hole_count {
            errs += 1;
            log::warn!("rb: holes count ({}) wrong, found {}", self.holes(), scan_hole_count);
        }
        if self.free_space() > self.used().saturating_sub(reclen * effective_count) {
            errs += 1;
            log::warn!("rb: free space exceeds total record space");
        }
        if reclen * effective_count + scan_entry_space != self.used().saturating_sub(self.free_space()) {
            errs += 1;
            log::warn!("rb: entry space accounting mismatch");
        }
        if scan_hole_space != self.free_space() {
            errs += 1;
            log::warn!("rb: hole space accounting mismatch");
        }
        errs
    }
}

impl<'a, const VARTAIL: bool> RecordBlock<'a, VARTAIL> {
    fn trim_trailing_holes(&mut self, start: usize) {
        let reclen = self.reclen;
        let mut i = start;
        loop {
            let (_, len) = self.tabent(i);
            let keylen = len as usize;
            self.set_count(i);
            self.set_free_space(self.free_space() - keylen);
            self.set_used(self.used() - (reclen + keylen));
            self.set_holes(self.holes() - 1);
            if i == 0 {
                break;
            }
            i -= 1;
            let (h, _) = self.tabent(i);
            if h != HOLECODE {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECLEN: usize = 4;

    fn new_block(size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    #[test]
    fn init_then_lookup_miss_is_none() {
        let mut bytes = new_block(256);
        let mut rb = Fixed::new(&mut bytes, RECLEN);
        rb.init();
        assert_eq!(rb.lookup(b"nope", 0), None);
        assert_eq!(rb.big(), rb.big().min(MAXNAME as u8));
    }

    #[test]
    fn create_then_lookup_round_trips() {
        let mut bytes = new_block(256);
        let mut rb = Fixed::new(&mut bytes, RECLEN);
        rb.init();
        rb.create(b"alpha", &[], 10, &[1, 2, 3, 4]).unwrap();
        rb.create(b"beta", &[], 20, &[5, 6, 7, 8]).unwrap();
        assert_eq!(rb.lookup(b"alpha", 10), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(rb.lookup(b"beta", 20), Some(&[5u8, 6, 7, 8][..]));
        assert_eq!(rb.check(), 0);
    }

    #[test]
    fn delete_trims_trailing_hole() {
        let mut bytes = new_block(256);
        let mut rb = Fixed::new(&mut bytes, RECLEN);
        rb.init();
        rb.create(b"alpha", &[], 10, &[1, 2, 3, 4]).unwrap();
        rb.create(b"beta", &[], 20, &[5, 6, 7, 8]).unwrap();
        rb.delete(b"beta", 20).unwrap();
        assert_eq!(rb.lookup(b"beta", 20), None);
        assert_eq!(rb.lookup(b"alpha", 10), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(rb.check(), 0);
    }

    #[test]
    fn delete_then_create_reuses_hole() {
        let mut bytes = new_block(256);
        let mut rb = Fixed::new(&mut bytes, RECLEN);
        rb.init();
        rb.create(b"alpha", &[], 1, &[1, 2, 3, 4]).unwrap();
        rb.create(b"beta", &[], 2, &[5, 6, 7, 8]).unwrap();
        rb.create(b"gamma", &[], 3, &[9, 10, 11, 12]).unwrap();
        rb.delete(b"beta", 2).unwrap();
        rb.create(b"delta", &[], 4, &[13, 14, 15, 16]).unwrap();
        assert_eq!(rb.lookup(b"delta", 4), Some(&[13u8, 14, 15, 16][..]));
        assert_eq!(rb.lookup(b"alpha", 1), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(rb.lookup(b"gamma", 3), Some(&[9u8, 10, 11, 12][..]));
        assert_eq!(rb.check(), 0);
    }

    #[test]
    fn create_fails_with_no_space_when_block_is_full() {
        let mut bytes = new_block(32);
        let mut rb = Fixed::new(&mut bytes, RECLEN);
        rb.init();
        let mut n = 0;
        loop {
            match rb.create(format!("k{n}").as_bytes(), &[], n as u16, &[0, 0, 0, 0]) {
                Ok(_) => n += 1,
                Err(ShardmapError::NoSpace) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(n > 0);
        assert_eq!(rb.check(), 0);
    }

    #[test]
    fn vartail_lookup_ignores_the_borrowed_suffix() {
        let mut bytes = new_block(256);
        let mut rb = VarTail::new(&mut bytes, RECLEN);
        rb.init();
        // "keytail" stored as key region; real key is "key", tail is "tail" (4
        // bytes) folded into the value via payload[0] = 4.
        rb.create(b"key", b"tail", 7, &[4, 0, 0, 0]).unwrap();
        assert_eq!(rb.lookup(b"key", 7), Some(&[4u8, 0, 0, 0][..]));
        assert_eq!(rb.lookup(b"keytail", 7), None);
        assert_eq!(rb.check(), 0);
    }

    #[test]
    fn vartail_delete_then_lookup_misses() {
        let mut bytes = new_block(256);
        let mut rb = VarTail::new(&mut bytes, RECLEN);
        rb.init();
        rb.create(b"k", b"xx", 1, &[2, 0, 0, 0]).unwrap();
        rb.delete(b"k", 1).unwrap();
        assert_eq!(rb.lookup(b"k", 1), None);
        assert_eq!(rb.check(), 0);
    }
}
