//! Top-level orchestrator: owns the file, the two tiers, the in-memory
//! shard pointer array, the record-block space, the free-space trie and
//! the micro-log, and drives the incremental reshard/rehash state machine.
//!
//! Geometry lives in three places that must stay consistent: the
//! persistent [`Header`] (on-disk, byte-exact per spec), the [`Layout`]
//! (recomputed whenever a tier is added or dropped), and this struct's
//! in-memory mirrors (`upper`, `lower`, `tablebits`). A `Keymap` is
//! single-threaded cooperative, per spec.md §5 — callers needing
//! concurrent access must serialize it themselves.

use std::fs::File;
use std::path::Path;

use crate::bigmap::{BigMap, BlockSource, Loc};
use crate::error::{Result, ShardmapError};
use crate::hash::{HashKey, SipHashKey};
use crate::header::{Header, TierHead};
use crate::layout::{Layout, MappedFile};
use crate::microlog::Microlog;
use crate::options::ShardmapOptions;
use crate::rb::{self, Fixed, RecordOps, VarTail};
use crate::shard::Shard;
use crate::tier::Tier;

const HEADER_BYTES: usize = std::mem::size_of::<Header>();

/// Indices into the current [`Layout`] for every region spec.md §6 names.
/// Lower-tier regions are `None` outside the Resharding state.
#[derive(Clone, Debug, Default)]
struct Regions {
    header: usize,
    rbspace: usize,
    lower_log: Option<usize>,
    lower_countmap: Option<usize>,
    lower_shardmap: Option<usize>,
    upper_log: usize,
    upper_countmap: usize,
    upper_shardmap: usize,
}

/// Plan the on-disk region order of spec.md §6 for a given tier geometry,
/// without touching any storage. Called both at creation and whenever a
/// tier is added or dropped.
fn plan_layout(
    lower: Option<&TierHead>,
    upper: &TierHead,
    rbspace_bytes: u64,
    logorder: u32,
) -> (Layout, Regions) {
    let mut layout = Layout::new();
    let mut regions = Regions::default();

    regions.header = layout.add(HEADER_BYTES as u64, 3);
    regions.rbspace = layout.add(rbspace_bytes, 12);

    if let Some(lower) = lower {
        let lt = Tier::from_head(lower);
        regions.lower_log = Some(layout.add(Microlog::region_bytes(logorder) as u64, 6));
        regions.lower_countmap = Some(layout.add(lt.countmap_size(), 3));
        regions.lower_shardmap = Some(layout.add(lt.shardmap_size(), 12));
    }

    let ut = Tier::from_head(upper);
    regions.upper_log = layout.add(Microlog::region_bytes(logorder) as u64, 6);
    regions.upper_countmap = layout.add(ut.countmap_size(), 3);
    regions.upper_shardmap = layout.add(ut.shardmap_size(), 12);

    (layout, regions)
}

/// `loc`s the free-space trie and record-block allocator share: a view of
/// the `rbspace` region as an array of `2^blockbits`-byte blocks.
struct RbBlocks<'a> {
    bytes: &'a mut [u8],
    blockbits: u32,
    reclen: usize,
    blocks: &'a mut u32,
}

impl<'a> RbBlocks<'a> {
    fn block_range(&self, loc: Loc) -> std::ops::Range<usize> {
        let off = (loc as usize) << self.blockbits;
        off..off + (1usize << self.blockbits)
    }
}

impl<'a> BlockSource for RbBlocks<'a> {
    fn map_byte(&self, loc: Loc, at: usize) -> u8 {
        self.bytes[self.block_range(loc).start + at]
    }

    fn set_map_byte(&mut self, loc: Loc, at: usize, value: u8) {
        let start = self.block_range(loc).start;
        self.bytes[start + at] = value;
    }

    fn zero_map_block(&mut self, loc: Loc) {
        let r = self.block_range(loc);
        self.bytes[r].fill(0);
    }

    fn record_big(&self, loc: Loc) -> u8 {
        let r = self.block_range(loc);
        rb::big_of(&self.bytes[r], self.reclen)
    }

    fn block_count(&self) -> Loc {
        *self.blocks
    }

    fn grow_by_one_block(&mut self) -> Result<Loc> {
        let loc = *self.blocks;
        let needed = self.block_range(loc).end;
        if needed > self.bytes.len() {
            return Err(ShardmapError::TooManyBlocks { blocks: loc, max: (self.bytes.len() >> self.blockbits) as u32 });
        }
        *self.blocks += 1;
        Ok(loc)
    }
}

/// An embedded, persistent key→value store. See the crate-level docs for
/// the on-disk format and the module docs above for the geometry state
/// machine.
pub struct Keymap<H: HashKey = SipHashKey> {
    file: File,
    mapped: MappedFile,
    regions: Regions,
    header: Header,
    options: ShardmapOptions,
    hasher: H,
    rbspace_bytes: u64,

    upper: Tier,
    lower: Option<Tier>,
    /// Uniform bucket-bit count shared by every currently resident upper
    /// shard. Only a lone shard (`shards() == 1`) can grow this on its own
    /// (`rehash`); once sharded, growth always proceeds by `reshard`.
    tablebits: u8,
    /// Snapshot of `tablebits` the (demoted) lower tier's shards were built
    /// with, valid only while `lower.is_some()`.
    lower_tablebits: u8,

    map: Vec<Option<Shard>>,
    /// One flag per lower-tier shard group, set once its entries have been
    /// split into the corresponding upper shards.
    migrated: Vec<bool>,
    pending: u32,

    bigmap: BigMap,
    microlog: Option<Microlog<'static>>,
}

/// Total hash bits this crate stores per tier below the bit consumed by
/// bucket/shard routing, minus one reserved as the media cell's delete
/// flag (bit 63). Chosen generously; not part of the persisted format.
const RESERVED_DELETE_BIT: u32 = 1;

impl Keymap<SipHashKey> {
    /// Create a fresh keymap backed by `path`, truncating/overwriting any
    /// existing file.
    pub fn create<P: AsRef<Path>>(path: P, options: ShardmapOptions) -> Result<Self> {
        Self::create_with_hasher(path, options, SipHashKey)
    }

    /// Open an existing keymap previously created with [`Keymap::create`].
    pub fn open<P: AsRef<Path>>(path: P, options: ShardmapOptions) -> Result<Self> {
        Self::open_with_hasher(path, options, SipHashKey)
    }
}

impl<H: HashKey> Keymap<H> {
    pub fn create_with_hasher<P: AsRef<Path>>(path: P, options: ShardmapOptions, hasher: H) -> Result<Self> {
        let file = File::options().read(true).write(true).create(true).truncate(true).open(path)?;

        let rbspace_bytes: u64 = 1 << 30; // spec.md §6's "1 GiB logical address space"
        let capacity_blocks = rbspace_bytes >> options.blockbits();
        let locbits = (64 - capacity_blocks.leading_zeros()).max(1) as u8;
        let sigbits = (63 - RESERVED_DELETE_BIT - locbits as u32) as u8;
        let stridebits = options.logorder().max(13) as u8 + 7; // generous per-shard media region

        let upper_head = options.initial_upper(locbits, sigbits, stridebits);
        let mut header = options.to_header(locbits, sigbits, stridebits);
        header.blocks = 0;

        let (layout, regions) = plan_layout(None, &upper_head, rbspace_bytes, options.logorder());
        let mapped = MappedFile::do_maps(&file, layout)?;

        let mut keymap = Keymap {
            file,
            mapped,
            regions,
            header,
            options,
            hasher,
            rbspace_bytes,
            upper: Tier::from_head(&upper_head),
            lower: None,
            tablebits: options.tablebits(),
            lower_tablebits: 0,
            map: vec![None; 1usize << upper_head.mapbits],
            migrated: Vec::new(),
            pending: 0,
            bigmap: BigMap::open(options.blockbits() as u32, 0),
            microlog: None,
        };

        {
            let region = keymap.mapped.region_mut(keymap.regions.upper_log);
            Microlog::format(region);
        }
        keymap.attach_microlog();

        // Bootstrap the first record block: `BigMap::current_record_loc`
        // only returns a usable location once the trie has allocated at
        // least one block (and, per the trie's own bookkeeping, block 0 is
        // claimed as a map block rather than a data block), so the very
        // first insert needs one up front.
        let first_loc = {
            let blockbits = keymap.options.blockbits() as u32;
            let reclen = keymap.options.reclen();
            let bytes = keymap.mapped.region_mut(keymap.regions.rbspace);
            let mut blocks = RbBlocks { bytes, blockbits, reclen, blocks: &mut keymap.header.blocks };
            keymap.bigmap.try_alloc(&mut blocks, 1, 0)?
        };
        keymap.with_block(first_loc, |rb| rb.init());

        keymap.write_header();
        Ok(keymap)
    }

    pub fn open_with_hasher<P: AsRef<Path>>(path: P, options: ShardmapOptions, hasher: H) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let header_bytes = {
            use std::io::Read;
            let mut f = File::open(path.as_ref())?;
            let mut buf = vec![0u8; HEADER_BYTES];
            f.read_exact(&mut buf)?;
            buf
        };
        let header = Header::from_bytes(&header_bytes);
        if !header.is_valid_magic() {
            return Err(ShardmapError::Corrupt("keymap: bad header magic"));
        }

        let lower_head = if header.lower.is_empty() { None } else { Some(header.lower) };
        let rbspace_bytes: u64 = 1 << 30;
        let (layout, regions) = plan_layout(lower_head.as_ref(), &header.upper, rbspace_bytes, options.logorder());
        let mapped = MappedFile::do_maps(&file, layout)?;

        let upper = Tier::from_head(&header.upper);
        let lower = lower_head.map(|h| Tier::from_head(&h));
        let shards = upper.shards();
        let lower_groups = lower.as_ref().map(|l| l.shards()).unwrap_or(0);

        let mut keymap = Keymap {
            file,
            mapped,
            regions,
            header,
            options,
            hasher,
            rbspace_bytes,
            upper,
            lower,
            tablebits: options.tablebits(),
            lower_tablebits: 0,
            map: vec![None; shards as usize],
            migrated: vec![false; lower_groups as usize],
            pending: lower_groups,
            bigmap: BigMap::open(options.blockbits() as u32, header.blocks),
            microlog: None,
        };
        keymap.attach_microlog();
        keymap.resume_bigmap_cursor();
        // Fold any log entries committed but not yet applied before a crash
        // back into the durable shardmap/countmap.
        keymap.unify()?;
        Ok(keymap)
    }

    /// A freshly-opened [`BigMap`] knows the total block count but has no
    /// path cursor loaded — it was only ever built incrementally in memory
    /// by [`BigMap::try_alloc`]/[`BigMap::free`]. Point it at the last
    /// allocated record (non-map) block so the next `try_alloc` reloads the
    /// full ancestor path via [`BigMap::resume_at`]'s `partial_path` flag
    /// instead of reading an unset, invalid location.
    fn resume_bigmap_cursor(&mut self) {
        let blocks = self.bigmap.block_count();
        if blocks == 0 {
            return;
        }
        let blockbits = self.options.blockbits() as u32;
        let mut loc = blocks - 1;
        while crate::bigmap::is_maploc(loc, blockbits) && loc > 0 {
            loc -= 1;
        }
        self.bigmap.resume_at(loc);
    }

    fn attach_microlog(&mut self) {
        let logorder = self.options.logorder();
        let region = self.mapped.region_mut(self.regions.upper_log);
        // SAFETY: `region` borrows `self.mapped`, which outlives `self.microlog`
        // for the lifetime of this `Keymap`; it is never remapped without
        // first dropping and recreating `self.microlog` (see `relayout`).
        let region: &'static mut [u8] = unsafe { std::mem::transmute(region) };
        self.microlog = Some(Microlog::attach(region, logorder));
    }

    fn write_header(&mut self) {
        self.header.blocks = self.bigmap.block_count();
        let header = self.header;
        let region = self.mapped.region_mut(self.regions.header);
        header.write_to(region);
    }

    fn shard_geom(locbits: u8, sigbits: u8, tablebits: u8) -> (u8, u8) {
        let lowbits = sigbits - tablebits;
        let linkbits = 64 - locbits - lowbits;
        (linkbits, lowbits)
    }

    fn new_shard(&self, tier: &Tier, tablebits: u8) -> Shard {
        let (linkbits, lowbits) = Self::shard_geom(tier.locbits, tier.sigbits, tablebits);
        Shard::new(tablebits, linkbits, lowbits, tier.locbits, self.options.loadfactor())
    }

    fn hash_of(&self, key: &[u8]) -> u64 {
        self.hasher.hash(key)
    }

    fn upper_index(&self, hash: u64) -> u32 {
        let mask = (1u64 << self.upper.mapbits) - 1;
        ((hash >> self.upper.sigbits) & mask) as u32
    }

    /// Run a closure against the record block at `loc`, dispatching to the
    /// `Fixed` or `VarTail` flavor configured for this keymap.
    fn with_block<R>(&mut self, loc: Loc, f: impl FnOnce(&mut dyn RecordOps) -> R) -> R {
        let reclen = self.options.reclen();
        let vartail = self.options.vartail();
        let blockbits = self.options.blockbits() as usize;
        let off = (loc as usize) << blockbits;
        let bytes = &mut self.mapped.region_mut(self.regions.rbspace)[off..off + (1 << blockbits)];
        if vartail {
            let mut rb = VarTail::new(bytes, reclen);
            f(&mut rb)
        } else {
            let mut rb = Fixed::new(bytes, reclen);
            f(&mut rb)
        }
    }

    // A free function over the individual fields `RbBlocks` borrows, rather
    // than a `&mut self` method: a method call ties its returned borrow to
    // the whole of `self` for as long as the `RbBlocks` lives, which blocks
    // a caller from also touching `self.bigmap` (a field `RbBlocks` never
    // reaches into) in the same scope. Borrowing `mapped`/`header_blocks`
    // directly at the call site lets the two stay disjoint.
    fn rb_blocks<'a>(mapped: &'a mut MappedFile, rbspace: usize, header_blocks: &'a mut u32, blockbits: u32, reclen: usize) -> RbBlocks<'a> {
        let bytes = mapped.region_mut(rbspace);
        RbBlocks { bytes, blockbits, reclen, blocks: header_blocks }
    }

    /// Ensure the upper shard covering `ix` is resident, splitting it out
    /// of the lower tier first if it hasn't been resharded yet.
    fn populate(&mut self, ix: u32) -> Result<()> {
        if self.map[ix as usize].is_some() {
            return Ok(());
        }
        if self.lower.is_some() {
            let lower = self.lower.as_ref().unwrap();
            let more_bits = self.upper.mapbits - lower.mapbits;
            let group = ix >> more_bits;
            if !self.migrated[group as usize] {
                self.split_group(group)?;
                return Ok(());
            }
        }
        self.load_upper_shard(ix);
        Ok(())
    }

    fn load_upper_shard(&mut self, ix: u32) {
        let mut shard = self.new_shard(&self.upper.clone(), self.tablebits);
        let mediacount = self.upper.countbuf.get(ix as usize).copied().unwrap_or(1);
        let upper = self.upper.clone();
        let shardmap = self.mapped.region(self.regions.upper_shardmap);
        shard.load_from_media(&upper, shardmap, ix, mediacount).expect("upper shard media corrupt");
        self.map[ix as usize] = Some(shard);
    }

    fn split_group(&mut self, group: u32) -> Result<()> {
        let lower = self.lower.clone().expect("split_group called without a lower tier");
        let more_bits = self.upper.mapbits - lower.mapbits;

        let mut src = self.new_shard(&lower, self.lower_tablebits);
        let mediacount = lower.countbuf.get(group as usize).copied().unwrap_or(1);
        let lower_shardmap = self.mapped.region(self.regions.lower_shardmap.unwrap());
        src.load_from_media(&lower, lower_shardmap, group, mediacount)?;

        for part in 0..(1u32 << more_bits) {
            let ix = (group << more_bits) + part;
            let mut dst = self.new_shard(&self.upper.clone(), self.tablebits);
            src.reshard_part(&mut dst, more_bits, part);

            let shardmap = self.mapped.region_mut(self.regions.upper_shardmap);
            self.upper.imprint(shardmap, ix);
            let shardmap = self.mapped.region_mut(self.regions.upper_shardmap);
            let cnt = dst.flatten(&mut self.upper, shardmap, ix);
            self.upper.countbuf[ix as usize] = cnt;
            self.map[ix as usize] = Some(dst);
        }

        self.migrated[group as usize] = true;
        self.pending -= 1;
        log::debug!("split_group: group={group} done, pending={}", self.pending);
        if self.pending == 0 {
            self.drop_tier()?;
        }
        Ok(())
    }

    fn drop_tier(&mut self) -> Result<()> {
        log::debug!("drop_tier: retiring lower tier");
        self.lower = None;
        self.migrated.clear();
        self.header.lower = TierHead::default();
        // Stale lower region stays allocated on disk; only `header.lower`
        // is consulted to decide whether one is live.
        self.write_header();
        Ok(())
    }

    /// Grow the map by `more` bits: the current upper tier is demoted to
    /// `lower`, and a fresh, larger upper tier is planned and mapped.
    fn grow_map(&mut self, more: u8) -> Result<()> {
        log::debug!("grow_map: mapbits {} -> {}", self.upper.mapbits, self.upper.mapbits + more);
        // `relayout` below copies the *media* shardmap into the new lower
        // tier's region; any insert/delete committed to the micro-log since
        // the last unify lives only in the in-memory shard that `grow_map`
        // is about to demote and rebuild from that media. Unify first so
        // the copy reflects the current in-memory state.
        self.unify()?;
        let old_upper_head = self.header.upper;
        let new_mapbits = old_upper_head.mapbits + more;
        let new_sigbits = old_upper_head.sigbits - more;
        let new_upper_head =
            TierHead { mapbits: new_mapbits, stridebits: old_upper_head.stridebits, locbits: old_upper_head.locbits, sigbits: new_sigbits, maploc: 0 };

        let (layout, regions) = plan_layout(Some(&old_upper_head), &new_upper_head, self.rbspace_bytes, self.options.logorder());
        self.relayout(layout, regions)?;

        self.header.lower = old_upper_head;
        self.header.upper = new_upper_head;
        self.lower = Some(self.upper.clone());
        self.lower_tablebits = self.tablebits;
        self.tablebits = self.options.tablebits();
        self.upper = Tier::from_head(&new_upper_head);
        self.map = vec![None; 1usize << new_mapbits];
        self.migrated = vec![false; 1usize << old_upper_head.mapbits];
        self.pending = 1u32 << old_upper_head.mapbits;

        self.write_header();
        Ok(())
    }

    /// Remap the file under a new region layout, copying every region that
    /// exists under both the old and new plan to its new offset. `new_regions`'
    /// upper-tier regions are freshly allocated (left zeroed); the lower-tier
    /// regions (if the new plan has them) receive the bytes of the *old*
    /// plan's upper-tier regions, since `grow_map` demotes upper to lower.
    fn relayout(&mut self, mut new_layout: Layout, new_regions: Regions) -> Result<()> {
        let old_regions = self.regions.clone();
        let old_lower_head = if self.header.lower.is_empty() { None } else { Some(self.header.lower) };
        let old_upper_head = self.header.upper;

        new_layout.compute();
        let new_total = new_layout.total_size();

        let mut staged: Vec<(usize, Vec<u8>)> = Vec::new();
        staged.push((new_regions.header, self.mapped.region(old_regions.header).to_vec()));
        staged.push((new_regions.rbspace, self.mapped.region(old_regions.rbspace).to_vec()));

        // The old upper tier becomes the new lower tier (used only when
        // growing, never when dropping — `drop_tier` doesn't call this).
        if let (Some(lr), Some(old_lower)) = (new_regions.lower_log, old_lower_head) {
            let _ = old_lower; // old lower regions, if any, are not carried forward; see drop_tier.
            let ol = old_regions.upper_log;
            staged.push((lr, self.mapped.region(ol).to_vec()));
        }
        if let Some(cm) = new_regions.lower_countmap {
            staged.push((cm, self.mapped.region(old_regions.upper_countmap).to_vec()));
        }
        if let Some(sm) = new_regions.lower_shardmap {
            staged.push((sm, self.mapped.region(old_regions.upper_shardmap).to_vec()));
        }
        let _ = old_upper_head;

        self.microlog = None; // drop the borrow before remapping
        self.file.set_len(new_total)?;
        let old_mapped = std::mem::replace(&mut self.mapped, MappedFile::do_maps(&self.file, new_layout)?);
        drop(old_mapped);

        for (idx, bytes) in staged {
            self.mapped.region_mut(idx)[..bytes.len()].copy_from_slice(&bytes);
        }

        self.regions = new_regions;
        self.attach_microlog();
        Ok(())
    }

    /// Single-shard in-place bucket growth, used while `shards() == 1` and
    /// `tablebits < maxtablebits`. No new tier is created.
    fn rehash(&mut self, bits: u8) -> Result<()> {
        let new_tablebits = (self.tablebits + bits).min(self.options.maxtablebits());
        log::debug!("rehash: tablebits {} -> {new_tablebits}", self.tablebits);
        let old = self.map[0].take().expect("rehash requires the single shard to be resident");
        let mut grown = self.new_shard(&self.upper.clone(), new_tablebits);
        old.reshard_part(&mut grown, 0, 0);
        self.tablebits = new_tablebits;
        self.map[0] = Some(grown);
        Ok(())
    }

    fn insert_and_grow(&mut self, ix: u32, hash: u64, loc: Loc) -> Result<()> {
        {
            let shard = self.map[ix as usize].as_mut().unwrap();
            if shard.count() < shard.limit() {
                shard.insert(hash, loc)?;
                return Ok(());
            }
        }
        if self.upper.shards() == 1 && self.tablebits < self.options.maxtablebits() {
            self.rehash(self.options.rehash())?;
        } else if self.pending == 0 {
            self.grow_map(self.options.reshard())?;
        }
        // If a reshard is already in flight (`pending > 0`), the target
        // shard's group may already have been split into this tier and
        // still be over `limit` — another `grow_map` can't start until the
        // current one drains. Re-resolving and inserting directly (rather
        // than recursing back through the `count < limit` gate) matches
        // spec.md §4.6 step 3 and lets the shard temporarily exceed its
        // soft split threshold instead of looping forever.
        let new_ix = self.upper_index(hash);
        self.populate(new_ix)?;
        self.map[new_ix as usize].as_mut().unwrap().insert(hash, loc)?;
        Ok(())
    }

    /// Insert `key` with fixed-size `data` (must be exactly `reclen`
    /// bytes). `unique = true` rejects the insert if `key` already exists.
    pub fn insert(&mut self, key: &[u8], data: &[u8], unique: bool) -> Result<()> {
        self.insert_tail(key, &[], data, unique)
    }

    /// Insert with an explicit value tail borrowed from the key region;
    /// requires `ShardmapOptions::with_vartail(true)`.
    pub fn insert_tail(&mut self, key: &[u8], tail: &[u8], data: &[u8], unique: bool) -> Result<()> {
        if key.len() + tail.len() > rb::MAXNAME {
            return Err(ShardmapError::Corrupt("keymap: key+tail longer than maxname"));
        }
        let hash = self.hash_of(key);
        let ix = self.upper_index(hash);
        self.populate(ix)?;

        if unique && self.lookup(key).is_some() {
            return Err(ShardmapError::AlreadyExists);
        }

        if self.microlog_mut().is_almost_full() {
            self.unify()?;
        }

        loop {
            let loc = self.bigmap.current_record_loc();
            let create_result = self.with_block(loc, |rb| rb.create(key, tail, lowhash_of(hash), data));
            match create_result {
                Ok(offset) => {
                    // `insert_and_grow` may trigger a reshard or rehash, which
                    // changes `self.upper`'s sigbits/mapbits (though never the
                    // total hash-significant bit width — see `full_mask`).
                    // The committed shard index and packed cell must reflect
                    // the tier geometry the entry actually lands under, so
                    // both are (re)computed after the call, not before.
                    self.insert_and_grow(ix, hash & full_mask(self.upper.mapbits, self.upper.sigbits), loc)?;
                    let final_ix = self.upper_index(hash);
                    let packed = self.upper.duo.pack(hash & sigmask(self.upper.sigbits), loc as u64);
                    self.commit_insert(final_ix, loc, packed);
                    let _ = offset;
                    return Ok(());
                }
                Err(ShardmapError::NoSpace) => {
                    if self.microlog_mut().burst() > 0 {
                        self.unify()?;
                    }
                    let big = {
                        let loc = self.bigmap.current_record_loc();
                        let blockbits = self.options.blockbits() as usize;
                        let region = self.mapped.region(self.regions.rbspace);
                        let off = (loc as usize) << blockbits;
                        rb::big_of(&region[off..off + (1 << blockbits)], self.options.reclen())
                    };
                    // `big` is `rb::big_of` on the block that just returned
                    // `NoSpace`, which guarantees `big < newlen` exactly
                    // (the fast-path and hole-reuse checks in `create` are
                    // the mirror image of `big_of`'s own computation) — no
                    // extra lower bound is needed or safe to mix in here.
                    let new_loc = {
                        let blockbits = self.options.blockbits() as u32;
                        let reclen = self.options.reclen();
                        let rbspace = self.regions.rbspace;
                        let mut blocks = Self::rb_blocks(&mut self.mapped, rbspace, &mut self.header.blocks, blockbits, reclen);
                        self.bigmap.try_alloc(&mut blocks, (key.len() + tail.len()) as u32, big as u32)?
                    };
                    let is_fresh = {
                        let blockbits = self.options.blockbits() as usize;
                        let region = self.mapped.region(self.regions.rbspace);
                        let off = (new_loc as usize) << blockbits;
                        region[off..off + 12].iter().all(|&b| b == 0)
                    };
                    if is_fresh {
                        self.with_block(new_loc, |rb| rb.init());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn commit_insert(&mut self, ix: u32, loc: Loc, packed: u64) {
        let payload = encode_entry(ix, packed, false);
        let log = self.microlog_mut();
        log.commit(&payload);
    }

    fn commit_delete(&mut self, ix: u32, loc: Loc, packed: u64) {
        let payload = encode_entry(ix, packed, true);
        let log = self.microlog_mut();
        log.commit(&payload);
        let _ = loc;
    }

    fn microlog_mut(&mut self) -> &mut Microlog<'static> {
        self.microlog.as_mut().expect("microlog not attached")
    }

    /// Point lookup. Returns the fixed `reclen` record bytes.
    ///
    /// A shard only stores `lowhash`, so more than one candidate `loc` can
    /// share it; each is tried in chain order until one's record block
    /// confirms the actual key bytes match.
    pub fn lookup(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let hash = self.hash_of(key);
        let ix = self.upper_index(hash);
        if self.populate(ix).is_err() {
            return None;
        }
        let lowhash16 = lowhash_of(hash);
        let candidate_hash = hash & full_mask(self.upper.mapbits, self.upper.sigbits);
        let mut candidates = Vec::new();
        {
            let shard = self.map[ix as usize].as_ref().unwrap();
            shard.find_candidates(candidate_hash, |loc| {
                candidates.push(loc);
                false
            });
        }
        for loc in candidates {
            if let Some(rec) = self.with_block(loc, |rb| rb.lookup(key, lowhash16).map(|p| p.to_vec())) {
                return Some(rec);
            }
        }
        None
    }

    /// Delete `key`. Returns `Err(NotFound)` if absent.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let hash = self.hash_of(key);
        let ix = self.upper_index(hash);
        self.populate(ix)?;
        let lowhash16 = lowhash_of(hash);
        let candidate_hash = hash & full_mask(self.upper.mapbits, self.upper.sigbits);

        let mut target: Option<Loc> = None;
        {
            let shard = self.map[ix as usize].as_ref().unwrap();
            shard.find_candidates(candidate_hash, |loc| {
                let hit = self.with_block_peek(loc, key, lowhash16);
                if hit {
                    target = Some(loc);
                    true
                } else {
                    false
                }
            });
        }
        let loc = target.ok_or(ShardmapError::NotFound)?;
        self.with_block(loc, |rb| rb.delete(key, lowhash16))?;
        self.map[ix as usize].as_mut().unwrap().remove(candidate_hash, loc)?;

        let big = {
            let blockbits = self.options.blockbits() as usize;
            let region = self.mapped.region(self.regions.rbspace);
            let off = (loc as usize) << blockbits;
            rb::big_of(&region[off..off + (1 << blockbits)], self.options.reclen())
        };
        {
            let blockbits = self.options.blockbits() as u32;
            let reclen = self.options.reclen();
            let rbspace = self.regions.rbspace;
            let mut blocks = Self::rb_blocks(&mut self.mapped, rbspace, &mut self.header.blocks, blockbits, reclen);
            self.bigmap.free(&mut blocks, loc, big)?;
        }
        let packed = self.upper.duo.pack(hash & sigmask(self.upper.sigbits), loc as u64);
        self.commit_delete(ix, loc, packed);
        Ok(())
    }

    fn with_block_peek(&self, loc: Loc, key: &[u8], lowhash16: u16) -> bool {
        let blockbits = self.options.blockbits() as usize;
        let vartail = self.options.vartail();
        let reclen = self.options.reclen();
        let region = self.mapped.region(self.regions.rbspace);
        let off = (loc as usize) << blockbits;
        let bytes = &region[off..off + (1 << blockbits)];
        if vartail {
            crate::rb::VarTail::peek(bytes, reclen, key, lowhash16)
        } else {
            crate::rb::Fixed::peek(bytes, reclen, key, lowhash16)
        }
    }

    /// Stream every pending micro-log entry into its tier's durable
    /// shardmap/countmap, then retire the log.
    pub fn unify(&mut self) -> Result<()> {
        let (head, tail) = {
            let log = self.microlog_mut();
            (log.head(), log.tail())
        };
        if head == tail {
            return Ok(());
        }
        log::debug!("unify: applying {} pending entries", self.microlog.as_ref().unwrap().burst());

        let mut i = head;
        while i != tail {
            let payload = self.microlog_mut().read(i);
            let (ix, packed, is_delete) = decode_entry(&payload);
            // Deletes must still be streamed to the media log, with the
            // cell's own delete flag (bit 63) set, exactly like an insert —
            // otherwise a key deleted after its insert was already unified
            // would reappear the next time this shard is rebuilt from media
            // (e.g. after a crash, or a later reshard/rehash replay).
            let cell = if is_delete { packed | (1u64 << 63) } else { packed };
            let entry_at = self.upper.countbuf[ix as usize];
            let shardmap = self.mapped.region_mut(self.regions.upper_shardmap);
            self.upper.store(shardmap, ix, entry_at, cell);
            self.upper.countbuf[ix as usize] = entry_at + 1;
            i = (i + 1) & (self.microlog.as_ref().unwrap().logsize() - 1);
        }

        for (ix, &count) in self.upper.countbuf.clone().iter().enumerate() {
            let region = self.mapped.region_mut(self.regions.upper_countmap);
            let off = ix * 4;
            region[off..off + 4].copy_from_slice(&count.to_le_bytes());
        }

        self.microlog_mut().advance_head();
        self.write_header();
        Ok(())
    }

    /// Audit every resident shard; returns the total mismatch count (0 means
    /// healthy). Not on any hot path.
    pub fn check(&mut self) -> usize {
        let mut errs = 0;
        for shard in self.map.iter().flatten() {
            errs += shard.check();
        }
        errs
    }

    /// Number of record blocks (data + free-space-map blocks) currently
    /// backing this keymap. Exposed for tests and external audits, per
    /// spec.md §8's boundary/invariant properties.
    pub fn block_count(&self) -> u32 {
        self.bigmap.block_count()
    }

    /// Whether a `grow_map` is in progress: a lower tier still has shard
    /// groups pending migration into the upper tier.
    pub fn is_resharding(&self) -> bool {
        self.lower.is_some()
    }

    /// Run [`rb::RecordOps::check`] over every non-map block, returning the
    /// total mismatch count. Not on any hot path.
    pub fn rb_check_all(&mut self) -> usize {
        let blockbits = self.options.blockbits() as u32;
        let blocks = self.block_count();
        let mut errs = 0;
        for loc in 0..blocks {
            if crate::bigmap::is_maploc(loc, blockbits) {
                continue;
            }
            errs += self.with_block(loc, |rb| rb.check());
        }
        errs
    }

    /// spec.md §8's `bigmap_check`: count of free-space trie parent slots
    /// that under-estimate their child's actual maximum. Zero means every
    /// ancestor slot bounds its subtree correctly. Not on any hot path.
    pub fn bigmap_check(&mut self) -> usize {
        let blockbits = self.options.blockbits() as u32;
        let reclen = self.options.reclen();
        let rbspace = self.regions.rbspace;
        let blocks = Self::rb_blocks(&mut self.mapped, rbspace, &mut self.header.blocks, blockbits, reclen);
        self.bigmap.check(&blocks)
    }

    /// Sum of each free-space trie parent slot's over-estimate relative to
    /// its child's actual maximum. Normally nonzero — a newly allocated
    /// block's parent slot is seeded optimistically before anything is
    /// written to it — so this is a capacity diagnostic, not the §8
    /// correctness check (`bigmap_check`). Not on any hot path.
    pub fn bigmap_slack(&mut self) -> usize {
        let blockbits = self.options.blockbits() as u32;
        let reclen = self.options.reclen();
        let rbspace = self.regions.rbspace;
        let blocks = Self::rb_blocks(&mut self.mapped, rbspace, &mut self.header.blocks, blockbits, reclen);
        self.bigmap.slack(&blocks)
    }

    /// Sum of `count` across every currently resident shard. Compared
    /// against [`Keymap::walk_live_count`] in tests to check spec.md §8's
    /// "record-block live count equals sum_shards(count)" invariant.
    pub fn total_shard_entries(&self) -> u32 {
        self.map.iter().flatten().map(|s| s.count()).sum()
    }

    /// Count every live (non-hole) entry across every non-map record block
    /// by walking each block's table directly. Not on any hot path.
    pub fn walk_live_count(&mut self) -> u32 {
        let blockbits = self.options.blockbits() as u32;
        let blocks = self.block_count();
        let mut total = 0u32;
        for loc in 0..blocks {
            if crate::bigmap::is_maploc(loc, blockbits) {
                continue;
            }
            self.with_block(loc, |rb| {
                rb.walk(&mut |_key, _payload| total += 1);
            });
        }
        total
    }

    /// Drop in-memory structures, leaving persistent regions on disk.
    pub fn close(self) {
        drop(self);
    }
}

fn sigmask(sigbits: u8) -> u64 {
    (1u64 << sigbits) - 1
}

fn full_mask(mapbits: u8, sigbits: u8) -> u64 {
    (1u64 << (mapbits as u32 + sigbits as u32)) - 1
}

/// Stable, block-local filter hash stored in a record block's `tabent`.
/// Deliberately independent of tier `sigbits`: a reshard/rehash changes
/// `sigbits` in-place, but record-block bytes are never rewritten, so this
/// must stay a pure function of the raw hash for `lookup`/`delete` issued
/// after a geometry change to still find entries created before it.
fn lowhash_of(hash: u64) -> u16 {
    hash as u16
}

/// Encode a micro-log payload: `ix` (u32) + packed cell (u64) + a delete
/// flag folded into the packed cell's top bit (mirrors the media cell's
/// own delete-flag convention, so `unify` can reuse `tier.store` directly).
fn encode_entry(ix: u32, packed: u64, is_delete: bool) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&ix.to_le_bytes());
    let flagged = if is_delete { packed | (1u64 << 63) } else { packed };
    out[4..12].copy_from_slice(&flagged.to_le_bytes());
    out
}

fn decode_entry(payload: &[u8]) -> (u32, u64, bool) {
    let ix = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let raw = u64::from_le_bytes(payload[4..12].try_into().unwrap());
    let is_delete = raw & (1u64 << 63) != 0;
    (ix, raw & !(1u64 << 63), is_delete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn small_options() -> ShardmapOptions {
        ShardmapOptions::new().with_blockbits(10).with_tablebits(3).with_maxtablebits(3).with_reshard(1).with_rehash(1).with_reclen(16).with_logorder(4)
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let file = NamedTempFile::new().unwrap();
        let mut km = Keymap::create(file.path(), small_options()).unwrap();
        km.insert(b"foo", &[7u8; 16], true).unwrap();
        assert_eq!(km.lookup(b"foo"), Some(vec![7u8; 16]));
    }

    #[test]
    fn unique_insert_rejects_duplicate() {
        let file = NamedTempFile::new().unwrap();
        let mut km = Keymap::create(file.path(), small_options()).unwrap();
        km.insert(b"foo", &[0u8; 16], true).unwrap();
        assert!(matches!(km.insert(b"foo", &[1u8; 16], true), Err(ShardmapError::AlreadyExists)));
        assert_eq!(km.lookup(b"foo"), Some(vec![0u8; 16]));
    }

    #[test]
    fn delete_then_miss() {
        let file = NamedTempFile::new().unwrap();
        let mut km = Keymap::create(file.path(), small_options()).unwrap();
        for n in 0..20u32 {
            km.insert(n.to_string().as_bytes(), &[n as u8; 16], true).unwrap();
        }
        km.remove(b"5").unwrap();
        assert_eq!(km.lookup(b"5"), None);
        assert!(matches!(km.remove(b"5"), Err(ShardmapError::NotFound)));
        assert_eq!(km.lookup(b"4"), Some(vec![4u8; 16]));
    }
}
