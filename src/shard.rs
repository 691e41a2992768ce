//! In-memory chained hash table for one slice of the key space.
//!
//! Bucket `i` of `2^tablebits` buckets is `table[i]`; overflow entries for
//! collisions live at indices `[2^tablebits, top)` in the same array,
//! allocated from a free list threaded through the same cells (an
//! index-based arena, not raw pointers — freed overflow nodes are never
//! actually deallocated, just pushed onto `free`). Each slot packs
//! `{link, loc, lowhash}` into one `u64` cell via a [`Tripack`]; `link == 0`
//! ([`ENDLIST`]) terminates a chain, and a bucket head holding the literal
//! value 1 ([`NOENTRY`]) means that bucket has never been used.
//!
//! A shard only ever sees the low `lowbits` of a key's hash — the bucket
//! index already accounts for the next `tablebits` bits, and everything
//! above that is implied by which shard this is.

use crate::bitpack::Tripack;
use crate::error::{Result, ShardmapError};
use crate::tier::Tier;

pub const ENDLIST: u32 = 0;
pub const NOENTRY: u64 = 1;

pub struct Shard {
    trio: Tripack,
    table: Vec<u64>,
    tablebits: u8,
    lowbits: u8,
    used: u32,
    top: u32,
    free: u32,
    count: u32,
    limit: u32,
}

impl Shard {
    /// `linkbits` sizes the overflow arena (`2^linkbits` slots); `locbits`
    /// and `lowbits` must match the owning tier's geometry
    /// (`lowbits == tier.sigbits - tablebits`). `loadfactor` is the
    /// fraction of `2^tablebits` entries a shard may hold before it must
    /// split.
    pub fn new(tablebits: u8, linkbits: u8, locbits: u8, lowbits: u8, loadfactor: f32) -> Self {
        assert!(tablebits <= linkbits, "shard: tablebits must not exceed linkbits");
        let trio = Tripack::new(linkbits as u32, locbits as u32);
        let buckets = 1u32 << tablebits;
        let top = 1u32 << linkbits;
        let limit = (loadfactor * buckets as f32) as u32;
        Shard {
            trio,
            table: vec![NOENTRY; top as usize],
            tablebits,
            lowbits,
            used: buckets,
            top,
            free: ENDLIST,
            count: 0,
            limit,
        }
    }

    pub fn buckets(&self) -> u32 {
        1u32 << self.tablebits
    }

    pub fn tablebits(&self) -> u8 {
        self.tablebits
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn bucket_used(&self, bucket: u32) -> bool {
        self.table[bucket as usize] != NOENTRY
    }

    fn next_entry(&self, link: u32) -> u32 {
        self.trio.first(self.table[link as usize]) as u32
    }

    fn set_link(&mut self, prev: u32, link: u32) {
        self.table[prev as usize] = self.trio.set_first(self.table[prev as usize], link as u64);
    }

    fn bucket_of(&self, hash: u64) -> u32 {
        let mask = (1u64 << self.tablebits) - 1;
        ((hash >> self.lowbits) & mask) as u32
    }

    fn lowhash_of(&self, hash: u64) -> u64 {
        hash & ((1u64 << self.lowbits) - 1)
    }

    /// Insert a fresh `(hash, loc)` media entry. `hash` carries the full
    /// significant-bit hash (bucket bits plus the stored low bits); the
    /// bucket bits are stripped internally.
    pub fn insert(&mut self, hash: u64, loc: u32) -> Result<()> {
        let bucket = self.bucket_of(hash);
        let lowhash = self.lowhash_of(hash);
        let mut next = ENDLIST;
        if self.bucket_used(bucket) {
            if self.free != ENDLIST {
                next = self.free;
                self.free = self.next_entry(self.free);
            } else {
                if self.used == self.top {
                    return Err(ShardmapError::ShardOverflow);
                }
                next = self.used;
                self.used += 1;
            }
            self.table[next as usize] = self.table[bucket as usize];
        }
        self.table[bucket as usize] = self.trio.pack(next as u64, loc as u64, lowhash);
        self.count += 1;
        Ok(())
    }

    /// Remove the entry matching the exact `(hash, loc)` pair — this pair
    /// uniquely identifies one media insertion, so there is at most one
    /// match.
    pub fn remove(&mut self, hash: u64, loc: u32) -> Result<()> {
        let bucket = self.bucket_of(hash);
        if !self.bucket_used(bucket) {
            return Err(ShardmapError::NotFound);
        }
        let lowhash = self.lowhash_of(hash);

        let entry = self.table[bucket as usize];
        let next = self.trio.first(entry) as u32;
        if self.trio.second(entry) == loc as u64 && self.trio.third(entry) == lowhash {
            self.count -= 1;
            if next == ENDLIST {
                self.table[bucket as usize] = NOENTRY;
            } else {
                self.table[bucket as usize] = self.table[next as usize];
                let head = self.free;
                self.set_link(next, head);
                self.free = next;
            }
            return Ok(());
        }

        let mut prev = bucket;
        let mut link = next;
        while link != ENDLIST {
            let entry = self.table[link as usize];
            let nxt = self.trio.first(entry) as u32;
            if self.trio.second(entry) == loc as u64 && self.trio.third(entry) == lowhash {
                self.set_link(prev, nxt);
                let head = self.free;
                self.set_link(link, head);
                self.free = link;
                self.count -= 1;
                return Ok(());
            }
            prev = link;
            link = nxt;
        }
        Err(ShardmapError::NotFound)
    }

    /// Walk every candidate `loc` whose `lowhash` matches, in chain order,
    /// until `on_candidate` returns `true` (found) or the chain ends. The
    /// caller performs the authoritative key comparison against the
    /// referenced record block; `lowhash` collisions are expected.
    pub fn find_candidates(&self, hash: u64, mut on_candidate: impl FnMut(u32) -> bool) -> bool {
        let bucket = self.bucket_of(hash);
        if !self.bucket_used(bucket) {
            return false;
        }
        let lowhash = self.lowhash_of(hash);
        let mut link = bucket;
        loop {
            let entry = self.table[link as usize];
            if self.trio.third(entry) == lowhash {
                let loc = self.trio.second(entry) as u32;
                if on_candidate(loc) {
                    return true;
                }
            }
            let next = self.trio.first(entry) as u32;
            if next == ENDLIST {
                break;
            }
            link = next;
        }
        false
    }

    fn walk_bucket(&self, bucket: u32, f: &mut impl FnMut(u64, u32)) {
        let mut link = bucket;
        loop {
            let entry = self.table[link as usize];
            let (next, loc, lowhash) = self.trio.unpack(entry);
            let key = ((bucket as u64) << self.lowbits) | lowhash;
            f(key, loc as u32);
            if next == 0 {
                break;
            }
            link = next as u32;
        }
    }

    /// Visit every live `(key, loc)` pair, `key` being the sigbits-wide
    /// value this shard's tier stores (bucket bits plus stored low bits).
    pub fn walk(&self, mut f: impl FnMut(u64, u32)) {
        for bucket in 0..self.buckets() {
            if self.bucket_used(bucket) {
                self.walk_bucket(bucket, &mut f);
            }
        }
    }

    /// Rebuild this shard's in-memory state by replaying its media log.
    /// `mediacount` is the tier's current cell count for shard `ix` (cell 0
    /// is the magic cell, so replay starts at 1).
    pub fn load_from_media(&mut self, tier: &Tier, shardmap: &[u8], ix: u32, mediacount: u32) -> Result<()> {
        const HIGH64: u64 = 1u64 << 63;
        for j in 1..mediacount {
            let raw = tier.at(shardmap, ix, j);
            let is_insert = raw & HIGH64 == 0;
            let entry = raw & !HIGH64;
            if entry == 0 && j + 1 < mediacount && tier.at(shardmap, ix, j + 1) & !HIGH64 == 0 {
                return Err(ShardmapError::Corrupt("shard: two successive null media entries"));
            }
            let (key, loc) = tier.duo.unpack(entry);
            let loc = loc as u32;
            if is_insert {
                self.insert(key, loc)?;
            } else {
                // A tombstone can legitimately target an entry a later
                // flatten already squashed; ignore rather than treat as
                // corruption.
                let _ = self.remove(key, loc);
            }
        }
        Ok(())
    }

    /// Rewrite `ix`'s media region to hold only live entries in bucket
    /// order, squeezing out tombstones. Returns the new media cell count
    /// (including the magic cell).
    pub fn flatten(&self, tier: &mut Tier, shardmap: &mut [u8], ix: u32) -> u32 {
        let mut i = 1u32;
        self.walk(|key, loc| {
            let cell = tier.duo.pack(key, loc as u64);
            tier.store(shardmap, ix, i, cell);
            i += 1;
        });
        tier.countbuf[ix as usize] = i;
        i
    }

    /// Copy every live entry whose bucket falls in
    /// `[part * 2^(tablebits - more_shards), (part + 1) * 2^(tablebits - more_shards))`
    /// into `out`. Used to split one shard's bucket range into
    /// `2^more_shards` descendant shards during reshard.
    pub fn reshard_part(&self, out: &mut Shard, more_shards: u32, part: u32) {
        let partbits = self.tablebits as u32 - more_shards;
        let start = part << partbits;
        let end = (part + 1) << partbits;
        for bucket in start..end {
            if self.bucket_used(bucket) {
                self.walk_bucket(bucket, &mut |key, loc| {
                    let _ = out.insert(key, loc);
                });
            }
        }
    }

    /// Recompute chain lengths and total live count, logging a warning per
    /// mismatch. Used by tests and `Keymap::check`, not on any hot path.
    pub fn check(&self) -> usize {
        let mut errs = 0usize;
        let mut total = 0u32;
        for bucket in 0..self.buckets() {
            if !self.bucket_used(bucket) {
                continue;
            }
            let mut link = bucket;
            let mut steps = 0u32;
            loop {
                total += 1;
                steps += 1;
                if steps > self.used {
                    errs += 1;
                    log::warn!("shard: chain from bucket {bucket} does not terminate");
                    break;
                }
                let next = self.next_entry(link);
                if next == ENDLIST {
                    break;
                }
                link = next;
            }
        }
        if total != self.count {
            errs += 1;
            log::warn!("shard: count mismatch ({total} visited, {} recorded)", self.count);
        }
        errs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_shard() -> Shard {
        // tablebits=4, linkbits=8, locbits=20, lowbits = 64-8-20 = 36
        Shard::new(4, 8, 20, 36, 4.0)
    }

    #[test]
    fn insert_then_find_round_trips() {
        let mut shard = new_shard();
        shard.insert(0xABCDEF, 7).unwrap();
        let mut found = None;
        shard.find_candidates(0xABCDEF, |loc| {
            found = Some(loc);
            true
        });
        assert_eq!(found, Some(7));
        assert_eq!(shard.check(), 0);
    }

    #[test]
    fn remove_then_find_misses() {
        let mut shard = new_shard();
        shard.insert(42, 1).unwrap();
        shard.remove(42, 1).unwrap();
        assert!(!shard.find_candidates(42, |_| true));
        assert!(matches!(shard.remove(42, 1), Err(ShardmapError::NotFound)));
    }

    #[test]
    fn collision_chain_walks_all_entries() {
        let mut shard = new_shard();
        // Same bucket (low 4 bits of `hash >> lowbits` equal), distinct lowhash.
        let base = 3u64 << 36;
        shard.insert(base | 1, 10).unwrap();
        shard.insert(base | 2, 20).unwrap();
        shard.insert(base | 3, 30).unwrap();
        let mut seen = Vec::new();
        shard.walk(|_key, loc| seen.push(loc));
        seen.sort();
        assert_eq!(seen, vec![10, 20, 30]);
        assert_eq!(shard.check(), 0);
    }

    #[test]
    fn removing_head_of_chain_splices_correctly() {
        let mut shard = new_shard();
        let base = 1u64 << 36;
        shard.insert(base | 1, 10).unwrap();
        shard.insert(base | 2, 20).unwrap();
        shard.remove(base | 1, 10).unwrap();
        let mut found = None;
        shard.find_candidates(base | 2, |loc| {
            found = Some(loc);
            true
        });
        assert_eq!(found, Some(20));
        assert_eq!(shard.count(), 1);
        assert_eq!(shard.check(), 0);
    }
}
