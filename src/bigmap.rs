//! Free-space radix trie.
//!
//! Tracks, for every record block in the keymap's record-block space, the
//! largest record that could still be created in it — without scanning the
//! block itself. The trie is built *in* that same address space: map blocks
//! and record (data) blocks share one flat array of `loc_t`-addressed
//! blocks, and [`is_maploc`] tells them apart by position alone. Each map
//! block holds `2^blockbits` byte slots, one per child in the level below;
//! a slot's value is the child's current "biggest insertable record" bound,
//! capped at [`MAX_LEN`].
//!
//! This module owns no bytes itself — [`BlockSource`] is the seam to
//! whatever actually backs block storage (the record-block allocator, in
//! practice), mirroring the original's `ext_bigmap_*` import functions.
//! `try_alloc`/`free` walk and update the trie exactly as the original's
//! `bigmap_try`/`bigmap_free` do; only the byte-access plumbing changed.

use crate::error::{Result, ShardmapError};

pub type Loc = u32;

/// Sentinel meaning "no block loaded here yet".
pub const LOC_NONE: Loc = u32::MAX;

/// Hard cap on trie depth; matches `bigmap_maxlevels` — at `blockbits = 8`
/// this already covers `2^80` blocks, so the cap is never reached in
/// practice, only guarded against.
pub const BIGMAP_MAX_LEVELS: usize = 10;

/// Saturating "biggest free span" value: a slot holding this means "large
/// enough for any record this keymap will ever store".
pub const MAX_LEN: u8 = 255;

/// Byte-level access to the block address space the trie is built over.
///
/// A "map byte" is one slot of a map block: `map_byte(loc, at)` reads slot
/// `at` of the map block at `loc`. A "record big" is the actual biggest
/// insertable-record bound for a data block, computed by scanning that
/// block's free list — this is what a freshly allocated leaf's bound comes
/// from before the trie has cached anything for it.
pub trait BlockSource {
    fn map_byte(&self, loc: Loc, at: usize) -> u8;
    fn set_map_byte(&mut self, loc: Loc, at: usize, value: u8);
    /// Zero an entire map block's slots before `set_map_byte`-ing the
    /// initial ones in; mirrors the original's `memset` in
    /// `add_new_map_block`.
    fn zero_map_block(&mut self, loc: Loc);
    /// Biggest record size that can currently be created in the data block
    /// at `loc`, computed from that block's own free-list bookkeeping.
    fn record_big(&self, loc: Loc) -> u8;
    /// Number of blocks currently backed by storage.
    fn block_count(&self) -> Loc;
    /// Extend storage by exactly one block and return its location, which
    /// must equal the previous `block_count()`.
    fn grow_by_one_block(&mut self) -> Result<Loc>;
}

#[derive(Clone, Copy, Debug)]
struct Level {
    loc: Loc,
    start: u32,
    at: u32,
    wrap: u32,
    big: u8,
}

impl Default for Level {
    fn default() -> Self {
        Level { loc: LOC_NONE, start: 0, at: 0, wrap: 0, big: 0 }
    }
}

/// The free-space trie itself. Holds only trie state (current path cursor,
/// level count, block count) — never record bytes.
pub struct BigMap {
    blockbits: u32,
    blocks: Loc,
    levels: usize,
    path: [Level; BIGMAP_MAX_LEVELS + 1],
    partial_path: bool,
    big: u8,
}

impl BigMap {
    /// Build trie state for a record-block space that already has `blocks`
    /// blocks in it (0 for a brand new keymap). Does not touch storage;
    /// callers whose space is non-empty must have already loaded the on-disk
    /// map blocks through other means (the trie's path cursor is rebuilt
    /// lazily by [`BigMap::try_alloc`]/[`BigMap::free`] as they walk it).
    pub fn open(blockbits: u32, blocks: Loc) -> Self {
        let mut map = BigMap {
            blockbits,
            blocks,
            levels: maplevels(blocks, blockbits),
            path: [Level::default(); BIGMAP_MAX_LEVELS + 1],
            partial_path: false,
            big: 0,
        };
        map.set_sentinel();
        map
    }

    /// Number of record/map blocks currently backing this trie.
    pub fn block_count(&self) -> Loc {
        self.blocks
    }

    fn set_sentinel(&mut self) {
        self.path[self.levels] = Level::default();
        self.big = MAX_LEN;
    }

    fn read_level_byte(&self, source: &dyn BlockSource, level: usize, at: usize) -> u8 {
        if level == self.levels {
            self.big
        } else {
            source.map_byte(self.path[level].loc, at)
        }
    }

    fn write_level_byte(&mut self, source: &mut dyn BlockSource, level: usize, at: usize, value: u8) {
        if level == self.levels {
            self.big = value;
        } else {
            let loc = self.path[level].loc;
            source.set_map_byte(loc, at, value);
        }
    }

    fn level_load(&mut self, source: &mut dyn BlockSource, level: usize, loc: Loc, wrap: u32) -> Result<()> {
        if loc == self.blocks {
            let got = source.grow_by_one_block()?;
            debug_assert_eq!(got, loc, "grow_by_one_block must hand back the next block in sequence");
            self.blocks += 1;
        }
        self.path[level] = Level { loc, start: 0, at: 0, wrap, big: 0 };
        Ok(())
    }

    fn add_new_rec_block(&mut self, source: &mut dyn BlockSource) -> Result<()> {
        self.level_load(source, 0, self.blocks, 0)
    }

    fn add_new_map_block(&mut self, source: &mut dyn BlockSource, level: usize, init: &[u8]) -> Result<()> {
        self.level_load(source, level, self.blocks, init.len() as u32)?;
        let loc = self.path[level].loc;
        source.zero_map_block(loc);
        for (i, &b) in init.iter().enumerate() {
            source.set_map_byte(loc, i, b);
        }
        Ok(())
    }

    fn add_map_level(&mut self) -> usize {
        let level = self.levels;
        self.path[level] = Level::default();
        self.levels += 1;
        level
    }

    /// Point the record-block path cursor at `loc`, growing storage for it
    /// first if it is the next never-before-seen block.
    pub fn load_record_block(&mut self, source: &mut dyn BlockSource, loc: Loc) -> Result<()> {
        if self.path[0].loc != loc {
            self.level_load(source, 0, loc, 0)?;
        }
        Ok(())
    }

    /// The record block currently addressed by the path cursor (valid right
    /// after a successful [`BigMap::try_alloc`]).
    pub fn current_record_loc(&self) -> Loc {
        self.path[0].loc
    }

    /// Point the leaf cursor at `loc` without validating the intermediate
    /// levels above it; used when reopening an existing keymap to resume
    /// appends at the block that was current when it was last written.
    /// The next [`BigMap::try_alloc`]/[`BigMap::free`] call that needs the
    /// full path reloads it first (`partial_path`).
    pub fn resume_at(&mut self, loc: Loc) {
        self.path[0].loc = loc;
        self.partial_path = true;
    }

    fn mapblock_load(&mut self, source: &mut dyn BlockSource, level: usize, ith: u32, stridebits: u32) -> Result<()> {
        let loc = ith_to_maploc(level as u32, self.blockbits, stridebits, ith);
        if self.path[level].loc != loc {
            self.level_load(source, level, loc, 0)?;
        }
        self.path[level].wrap = bigmap_wrap(self.blocks, self.blockbits, stridebits, ith);
        Ok(())
    }

    fn path_load(&mut self, source: &mut dyn BlockSource, loc: Loc) -> Result<()> {
        let levels = self.levels;
        let blockbits = self.blockbits;
        let blockmask = (1u32 << blockbits) - 1;
        let mut ith = loc;
        let mut stridebits = blockbits;
        for level in 1..levels {
            let at = ith & blockmask;
            ith >>= blockbits;
            self.mapblock_load(source, level, ith, stridebits)?;
            self.path[level].start = at;
            self.path[level].at = at;
            stridebits += blockbits;
        }
        self.partial_path = false;
        Ok(())
    }

    fn map_new_block(&mut self, source: &mut dyn BlockSource) -> Result<()> {
        let loc = self.blocks;
        self.add_new_rec_block(source)?;

        let blockbits = self.blockbits;
        let blocksize = 1u32 << blockbits;
        let newblocks = nextloc(blockbits, loc) - loc;
        let mut newcount = 1u32;
        debug_assert!(newblocks <= blocksize);

        let mut level = 1usize;
        let mut stridebits = blockbits;
        while level < self.levels {
            let stridemask = (1u32 << stridebits) - 1;
            if (loc & stridemask) == 0 {
                self.add_new_map_block(source, level, &[MAX_LEN])?;
                if level == 1 {
                    self.path[level].wrap = newblocks;
                }
                newcount += 1;
            } else {
                let ith = loc >> stridebits;
                let rightmost = (loc >> (stridebits - blockbits)) & (blocksize - 1);
                let wrap = bigmap_wrap(self.blocks, blockbits, stridebits, ith);
                let new_loc = ith_to_maploc(level as u32, blockbits, stridebits, ith);
                if self.path[level].loc != new_loc {
                    self.level_load(source, level, new_loc, wrap)?;
                    self.path[level].start = rightmost;
                    self.path[level].at = rightmost;
                } else {
                    debug_assert_eq!(self.path[level].at, self.path[level].start);
                    self.path[level].start = 0;
                    self.path[level].at = rightmost;
                    self.path[level].wrap = wrap;
                }
                let at = self.path[level].at as usize;
                let plevel_loc = self.path[level].loc;
                source.set_map_byte(plevel_loc, at, MAX_LEN);
            }
            debug_assert!(self.path[level].wrap > 0);
            level += 1;
            stridebits += blockbits;
        }

        if loc == 1u32 << (stridebits - blockbits) {
            let level = self.add_map_level();
            let big = self.big;
            self.add_new_map_block(source, level, &[big, MAX_LEN])?;
            self.path[level].at = 1;
            self.path[level].big = big;
            self.set_sentinel();
            newcount += 1;
        }

        debug_assert_eq!(newcount, newblocks);
        self.big = MAX_LEN;
        Ok(())
    }

    /// Find (and leave the path cursor at) a record block with at least
    /// `big` bytes of known free space, for a record of length `len`. `big`
    /// is the caller's best current estimate of the block's remaining free
    /// space — pass the value from a just-failed create attempt, or `len -
    /// 1` if nothing better is known.
    ///
    /// Returns the chosen block's location. Growing the record-block space
    /// by one block (and, as needed, adding map levels) happens internally
    /// when no existing block has room.
    pub fn try_alloc(&mut self, source: &mut dyn BlockSource, len: u32, big: u32) -> Result<Loc> {
        debug_assert_eq!(self.levels, maplevels(self.blocks, self.blockbits));
        debug_assert!(len > big);

        if self.levels <= 1 {
            let level = self.add_map_level();
            self.add_new_map_block(source, level, &[big as u8, 0, MAX_LEN])?;
            self.add_new_rec_block(source)?;
            self.path[level].big = big as u8;
            self.path[level].at = 2;
            self.set_sentinel();
            return Ok(self.path[0].loc);
        }

        let blockbits = self.blockbits;
        let mut level = 1usize;
        let mut stridebits = blockbits;

        if self.partial_path {
            let loc0 = self.path[0].loc;
            self.path_load(source, loc0)?;
        }

        {
            let at = self.path[level].at as usize;
            let loc = self.path[level].loc;
            source.set_map_byte(loc, at, big as u8);
        }

        // `skip_rescan` mirrors the original's inner-loop `continue`: pushing
        // down to a freshly loaded child level must scan it from its current
        // cursor as-is, without first re-running the "seen big enough
        // already, restart this level's scan" check below — that check only
        // applies when a level is revisited after its child was exhausted.
        let mut skip_rescan = false;

        'outer: loop {
            debug_assert_eq!(stridebits, level as u32 * blockbits);

            if !skip_rescan && self.path[level].big as u32 >= len {
                self.path[level].at = self.path[level].start;
                self.path[level].big = 0;
            }
            skip_rescan = false;

            loop {
                let loc = self.path[level].loc;
                let at = self.path[level].at;
                let bound = source.map_byte(loc, at as usize) as u32;

                if len <= bound {
                    let ith = ((loc >> stridebits) << blockbits) + at;
                    level -= 1;
                    if level == 0 {
                        self.load_record_block(source, ith)?;
                        return Ok(self.path[0].loc);
                    }
                    stridebits -= blockbits;
                    self.mapblock_load(source, level, ith, stridebits)?;
                    skip_rescan = true;
                    continue 'outer;
                }

                if (self.path[level].big as u32) < bound {
                    self.path[level].big = bound as u8;
                }

                self.path[level].at += 1;
                if self.path[level].at == self.path[level].wrap {
                    self.path[level].at = 0;
                }
                if self.path[level].at == self.path[level].start {
                    break;
                }
            }

            let bound_big = self.path[level].big;
            let at_in_parent = ((self.path[level].loc >> stridebits) & ((1u32 << blockbits) - 1)) as usize;
            debug_assert_eq!(self.path[level + 1].at as usize, at_in_parent);
            self.write_level_byte(source, level + 1, at_in_parent, bound_big);
            level += 1;
            if level == self.levels {
                self.map_new_block(source)?;
                return Ok(self.path[0].loc);
            }
            stridebits += blockbits;
        }
    }

    /// Record that the block at `loc` now has at least `big` bytes of free
    /// space (following a delete). Updates only the portion of the path
    /// affected; if the cursor isn't already positioned under `loc`, marks
    /// the path partial so the next [`BigMap::try_alloc`] reloads it.
    pub fn free(&mut self, source: &mut dyn BlockSource, loc: Loc, big: u8) -> Result<()> {
        let blockbits = self.blockbits;
        let blockmask = (1u32 << blockbits) - 1;
        let levels = self.levels;
        let mut ith = loc;
        let mut stridebits = blockbits;
        for level in 1..levels {
            let at = ith & blockmask;
            ith >>= blockbits;
            self.mapblock_load(source, level, ith, stridebits)?;
            let cur = source.map_byte(self.path[level].loc, at as usize);
            if cur >= big {
                self.partial_path = true;
                return Ok(());
            }
            let level_loc = self.path[level].loc;
            source.set_map_byte(level_loc, at as usize, big);
            self.path[level].start = at;
            self.path[level].at = at;
            stridebits += blockbits;
        }
        self.big = big;
        Ok(())
    }

    /// Recompute every parent slot from the children it actually covers.
    /// Returns `(mismatches, slack)`:
    ///
    /// - `mismatches` counts parent slots that *under*-estimate their
    ///   child's actual maximum (`parent_val < big`) — the real §8
    ///   invariant ("every parent slot ≥ actual child max"), mirroring
    ///   `examples/original_source/bigmap.c`'s mismatch print. This must
    ///   be zero after any sequence of operations.
    /// - `slack` sums each parent's *over*-estimate (`parent_val > big`);
    ///   `map_new_block` seeds a freshly allocated block's parent slot to
    ///   `MAX_LEN` before anything has been written to it (see
    ///   `map_new_block`), so this is normally nonzero and is a capacity
    ///   diagnostic, not a correctness check.
    ///
    /// Not on any hot path; used by tests and `Keymap::check`.
    pub fn audit(&self, source: &dyn BlockSource) -> (usize, usize) {
        let blockbits = self.blockbits;
        let blocksize = 1usize << blockbits;
        let blocks = self.blocks;
        let levels = maplevels(blocks, blockbits);
        let mut mismatches = 0usize;
        let mut slack = 0usize;
        let mut stridebits = blockbits;
        for level in 1..levels {
            let stride = 1u32 << stridebits;
            let maps = (blocks + stride - 1) >> stridebits;
            for i in 0..maps {
                let wrap = bigmap_wrap(blocks, blockbits, stridebits, i);
                for j in 0..wrap {
                    let child_ith = (i << blockbits) + j;
                    let m = ith_to_maploc(level as u32 - 1, blockbits, stridebits - blockbits, child_ith);
                    let mut big = 0u8;
                    if level > 1 {
                        for k in 0..blocksize {
                            big = big.max(source.map_byte(m, k));
                        }
                    } else if is_maploc(m, blockbits) {
                        if source.map_byte(i, j as usize) != 0 {
                            continue;
                        }
                    } else {
                        big = source.record_big(m);
                    }
                    let parent_val = source.map_byte(i, j as usize);
                    if parent_val < big {
                        mismatches += (big - parent_val) as usize;
                    } else {
                        slack += (parent_val - big) as usize;
                    }
                }
            }
            stridebits += blockbits;
        }
        (mismatches, slack)
    }

    /// §8's `bigmap_check`: count of parent slots that under-estimate
    /// their child's actual maximum. Zero means healthy.
    pub fn check(&self, source: &dyn BlockSource) -> usize {
        self.audit(source).0
    }

    /// Sum of each parent slot's over-estimate relative to its child's
    /// actual maximum. A capacity diagnostic, not a correctness check —
    /// see `audit`.
    pub fn slack(&self, source: &dyn BlockSource) -> usize {
        self.audit(source).1
    }
}

fn ith_to_maploc(level: u32, blockbits: u32, stridebits: u32, ith: u32) -> Loc {
    if ith == 0 && level > 1 {
        level + (1u32 << (stridebits - blockbits))
    } else {
        level + (ith << stridebits)
    }
}

fn bigmap_wrap(blocks: Loc, blockbits: u32, stridebits: u32, ith: u32) -> u32 {
    let blocksize = 1u32 << blockbits;
    let last = blocks >> stridebits;
    if ith < last {
        return blocksize;
    }
    let subbits = stridebits - blockbits;
    let submask = (1u32 << subbits) - 1;
    ((blocks + submask) >> subbits) - (last << blockbits)
}

/// Whether `loc` holds a map block (vs. a data block), determined purely
/// from its position: the offset of a map block modulo the lowest-level
/// stride equals its level.
pub fn is_maploc(loc: Loc, blockbits: u32) -> bool {
    let stride = 1u32 << blockbits;
    let level = loc & (stride - 1);
    match level {
        0 => return false,
        1 => return true,
        _ => {}
    }
    let stridebits = blockbits * (level - 2);
    if stridebits >= 32 - blockbits {
        return false;
    }
    let stride = stride << stridebits;
    if loc < stride {
        false
    } else if loc == stride + level {
        true
    } else {
        (loc & ((stride << blockbits) - 1)) == level
    }
}

fn nextloc(blockbits: u32, loc: Loc) -> Loc {
    let mut loc = loc;
    let mut stridebits = blockbits;
    let mut level = 1u32;
    while level < BIGMAP_MAX_LEVELS as u32 {
        let stride = 1u32 << stridebits;
        loc += 1;
        if loc < stride {
            if (loc >> (stridebits - blockbits)) != 1 {
                break;
            }
        } else if (loc & (stride - 1)) != level {
            break;
        }
        level += 1;
        stridebits += blockbits;
    }
    loc
}

fn maplevels(blocks: Loc, blockbits: u32) -> usize {
    let mut stride: Loc = 1;
    for level in 1..BIGMAP_MAX_LEVELS {
        if blocks <= stride {
            return level;
        }
        stride <<= blockbits;
    }
    unreachable!("block count exceeds the maximum bigmap depth")
}
