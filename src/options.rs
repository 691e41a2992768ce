//! Builder for the configuration a fresh keymap is created with.
//!
//! Mirrors the persistent [`Header`](crate::header::Header) fields a caller
//! is allowed to choose at creation time; everything else (current
//! `blocks`, tier geometry) is derived or grows at runtime. Consuming
//! builder style, `with_*` methods taking and returning `self` by value.

use crate::header::{Header, TierHead, MAGIC, VERSION};

#[derive(Clone, Copy, Debug)]
pub struct ShardmapOptions {
    blockbits: u8,
    tablebits: u8,
    maxtablebits: u8,
    reshard: u8,
    rehash: u8,
    loadfactor: f32,
    reclen: usize,
    logorder: u32,
    vartail: bool,
}

impl Default for ShardmapOptions {
    fn default() -> Self {
        ShardmapOptions {
            blockbits: 14,
            tablebits: 9,
            maxtablebits: 19,
            reshard: 1,
            rehash: 2,
            loadfactor: 1.0,
            reclen: 100,
            logorder: 10,
            vartail: false,
        }
    }
}

impl ShardmapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `2^blockbits` bytes per record block.
    pub fn with_blockbits(mut self, blockbits: u8) -> Self {
        self.blockbits = blockbits;
        self
    }

    /// Initial per-shard bucket count is `2^tablebits`.
    pub fn with_tablebits(mut self, tablebits: u8) -> Self {
        self.tablebits = tablebits;
        self
    }

    /// A single shard rehashes in place (no new tier) until `tablebits`
    /// reaches this ceiling; beyond it, growth proceeds by resharding.
    pub fn with_maxtablebits(mut self, maxtablebits: u8) -> Self {
        self.maxtablebits = maxtablebits;
        self
    }

    /// `log2` of the number of descendant shards a single reshard step
    /// creates.
    pub fn with_reshard(mut self, reshard: u8) -> Self {
        self.reshard = reshard;
        self
    }

    /// `log2` of the bucket-count growth a single-tier rehash applies.
    pub fn with_rehash(mut self, rehash: u8) -> Self {
        self.rehash = rehash;
        self
    }

    /// Fraction of `2^tablebits` entries a shard may hold before it must
    /// split or rehash.
    pub fn with_loadfactor(mut self, loadfactor: f32) -> Self {
        self.loadfactor = loadfactor;
        self
    }

    /// Fixed payload size of every record.
    pub fn with_reclen(mut self, reclen: usize) -> Self {
        self.reclen = reclen;
        self
    }

    /// `log2` of the micro-log ring's block count.
    pub fn with_logorder(mut self, logorder: u32) -> Self {
        self.logorder = logorder;
        self
    }

    /// Use `VarTail` records, where a prefix of the stored key region is
    /// actually a value tail (see [`crate::rb::VarTail`]), instead of
    /// plain `Fixed` records. Not persisted in the header — a process
    /// reopening a keymap must supply the same setting it was created with.
    pub fn with_vartail(mut self, vartail: bool) -> Self {
        self.vartail = vartail;
        self
    }

    pub fn vartail(&self) -> bool {
        self.vartail
    }

    pub fn blockbits(&self) -> u8 {
        self.blockbits
    }

    pub fn tablebits(&self) -> u8 {
        self.tablebits
    }

    pub fn maxtablebits(&self) -> u8 {
        self.maxtablebits
    }

    pub fn reshard(&self) -> u8 {
        self.reshard
    }

    pub fn rehash(&self) -> u8 {
        self.rehash
    }

    pub fn reclen(&self) -> usize {
        self.reclen
    }

    pub fn loadfactor(&self) -> f32 {
        self.loadfactor
    }

    pub fn logorder(&self) -> u32 {
        self.logorder
    }

    /// Geometry for a brand-new keymap's single shard: one shard
    /// (`mapbits = 0`) covering the whole hash space.
    pub fn initial_upper(&self, locbits: u8, sigbits: u8, stridebits: u8) -> TierHead {
        TierHead { mapbits: 0, stridebits, locbits, sigbits, maploc: 0 }
    }

    /// Build the persistent header a fresh file starts from.
    pub fn to_header(&self, locbits: u8, sigbits: u8, stridebits: u8) -> Header {
        let mut header = Header {
            magic: MAGIC,
            version: VERSION,
            blockbits: self.blockbits,
            tablebits: self.tablebits,
            maxtablebits: self.maxtablebits,
            reshard: self.reshard,
            rehash: self.rehash,
            loadfactor: 0,
            blocks: 0,
            upper: self.initial_upper(locbits, sigbits, stridebits),
            lower: TierHead::default(),
        };
        header.set_loadfactor(self.loadfactor);
        header
    }
}
