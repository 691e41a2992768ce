//! End-to-end scenarios, one test per spec.md §8 "End-to-end scenarios"
//! entry. Scenario 6 (bigmap level transition) walks private trie-internal
//! functions (`nextloc`, `maplevels`) that aren't part of the public API, so
//! it lives as a unit test in `src/bigmap.rs` instead
//! (`bigmap_level_transition_visits_every_record_location_once`); the five
//! here are reachable through `Keymap`'s public surface alone.

use shardmap::{Keymap, ShardmapError, ShardmapOptions};
use tempfile::NamedTempFile;

/// Small deterministic PRNG (xorshift32) so key generation here doesn't pull
/// in a dependency the rest of the crate has no other use for.
struct Rng(u32);

impl Rng {
    fn new(seed: u32) -> Self {
        Rng(seed | 1)
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn range(&mut self, lo: usize, hi_inclusive: usize) -> usize {
        lo + (self.next_u32() as usize) % (hi_inclusive - lo + 1)
    }

    fn ascii_key(&mut self, min_len: usize, max_len: usize) -> Vec<u8> {
        let len = self.range(min_len, max_len);
        (0..len).map(|_| b'a' + (self.next_u32() % 26) as u8).collect()
    }
}

#[test]
fn scenario_1_tiny_map_churn() {
    let file = NamedTempFile::new().unwrap();
    let options = ShardmapOptions::new().with_blockbits(6).with_reclen(4).with_tablebits(4).with_maxtablebits(8);
    let mut km = Keymap::create(file.path(), options).unwrap();
    let mut rng = Rng::new(0xc0ffee);
    let mut live: Vec<Vec<u8>> = Vec::new();

    for _cycle in 0..1000 {
        // Model "for every current block, 50% chance delete its first live
        // entry" as deleting roughly half of the currently tracked live
        // keys — `Keymap`'s public surface has no per-block key iterator
        // to pick a block's literal first entry from outside the crate.
        let mut survivors = Vec::with_capacity(live.len());
        for key in live.drain(..) {
            if rng.next_u32() % 2 == 0 {
                km.remove(&key).expect("tracked key must still be present");
            } else {
                survivors.push(key);
            }
        }
        live = survivors;

        let before = km.block_count();
        let mut attempts = 0;
        while km.block_count() == before {
            let key = rng.ascii_key(1, 5);
            if km.insert(&key, &[0u8; 4], false).is_ok() {
                live.push(key);
            }
            attempts += 1;
            assert!(attempts < 100_000, "cycle never allocated a new block");
        }
    }

    let blocks = km.block_count();
    assert!(km.bigmap_slack() as u64 <= blocks as u64 * 64, "bigmap slack exceeds blocks*blocksize");
    for key in &live {
        assert!(km.lookup(key).is_some(), "surviving key {key:?} failed to round-trip");
    }
}

#[test]
fn scenario_2_unique_insert() {
    let file = NamedTempFile::new().unwrap();
    let mut km = Keymap::create(file.path(), ShardmapOptions::new().with_reclen(8)).unwrap();

    km.insert(b"foo", &[0u8; 8], true).unwrap();
    let record = km.lookup(b"foo").unwrap();

    assert!(matches!(km.insert(b"foo", &[0u8; 8], true), Err(ShardmapError::AlreadyExists)));
    assert_eq!(km.lookup(b"foo").unwrap(), record);
}

#[test]
fn scenario_3_delete_then_miss() {
    let file = NamedTempFile::new().unwrap();
    let mut km = Keymap::create(file.path(), ShardmapOptions::new().with_reclen(8)).unwrap();

    let mut recorded = Vec::new();
    for n in 0..100u32 {
        let key = n.to_string();
        let data = [(n % 256) as u8; 8];
        km.insert(key.as_bytes(), &data, true).unwrap();
        recorded.push((key, data));
    }

    km.remove(b"50").unwrap();
    assert_eq!(km.lookup(b"50"), None);
    assert!(matches!(km.remove(b"50"), Err(ShardmapError::NotFound)));
    assert_eq!(km.lookup(b"49"), Some(recorded[49].1.to_vec()));
}

#[test]
fn scenario_4_crash_resume() {
    let file = NamedTempFile::new().unwrap();
    let options = ShardmapOptions::new().with_reclen(8);

    {
        let mut km = Keymap::create(file.path(), options).unwrap();
        for n in 0..1000u32 {
            km.insert(n.to_string().as_bytes(), &[(n % 256) as u8; 8], true).unwrap();
        }
        km.unify().unwrap();
        for n in 1000..1100u32 {
            km.insert(n.to_string().as_bytes(), &[(n % 256) as u8; 8], true).unwrap();
        }
        km.close(); // discard in-memory state without an explicit final unify
    }

    let mut km = Keymap::open(file.path(), options).unwrap();
    for n in 0..1100u32 {
        let expected = vec![(n % 256) as u8; 8];
        assert_eq!(km.lookup(n.to_string().as_bytes()), Some(expected), "key {n} missing after reopen");
    }
    assert_eq!(km.lookup(b"1100"), None);
}

#[test]
fn scenario_5_reshard_correctness() {
    let file = NamedTempFile::new().unwrap();
    let options = ShardmapOptions::new().with_reclen(8).with_tablebits(4).with_maxtablebits(4).with_reshard(1);
    let mut km = Keymap::create(file.path(), options).unwrap();

    let mut keys = Vec::new();
    let mut n = 0u32;
    // tablebits == maxtablebits, so the shard can never rehash in place —
    // every overflow past the load factor forces `grow_map`.
    while !km.is_resharding() {
        let key = n.to_string();
        km.insert(key.as_bytes(), &[(n % 256) as u8; 8], true).unwrap();
        keys.push(key);
        n += 1;
        assert!(n < 100_000, "grow_map never triggered");
    }

    assert!(km.is_resharding());
    for key in &keys {
        let n: u32 = key.parse().unwrap();
        assert_eq!(km.lookup(key.as_bytes()), Some(vec![(n % 256) as u8; 8]), "key {key} missing mid-reshard");
    }

    // Drive enough further inserts to retire every pending shard group.
    while km.is_resharding() {
        let key = n.to_string();
        km.insert(key.as_bytes(), &[(n % 256) as u8; 8], true).unwrap();
        keys.push(key);
        n += 1;
        assert!(n < 100_000, "reshard never completed");
    }

    for key in &keys {
        let n: u32 = key.parse().unwrap();
        assert_eq!(km.lookup(key.as_bytes()), Some(vec![(n % 256) as u8; 8]), "key {key} missing after reshard");
    }
    assert!(!km.is_resharding());
}

/// spec.md §9's open question on `rehash`'s `reshard_part(0, 0)` path:
/// with `shards == 1` and `tablebits < maxtablebits`, growth happens by
/// in-place bucket doubling, never by `grow_map` — `is_resharding()` must
/// stay false throughout, and every previously inserted key must still be
/// found once the shard's bucket count has grown several times over.
#[test]
fn scenario_5_rehash_single_shard() {
    let file = NamedTempFile::new().unwrap();
    let options = ShardmapOptions::new().with_reclen(8).with_tablebits(2).with_maxtablebits(10).with_rehash(1);
    let mut km = Keymap::create(file.path(), options).unwrap();

    let mut keys = Vec::new();
    for n in 0..500u32 {
        let key = n.to_string();
        km.insert(key.as_bytes(), &[(n % 256) as u8; 8], true).unwrap();
        keys.push(key);
        assert!(!km.is_resharding(), "single shard should grow by rehash, not grow_map, below maxtablebits");
    }

    for key in &keys {
        let n: u32 = key.parse().unwrap();
        assert_eq!(km.lookup(key.as_bytes()), Some(vec![(n % 256) as u8; 8]), "key {key} missing after rehash growth");
    }
}
