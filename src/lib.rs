//! Shardmap: an embedded, persistent key→value store optimized for small
//! records, high insert throughput, and O(1) point lookup.
//!
//! Keys are byte strings up to 255 bytes; values are fixed-size records
//! (`reclen`, default 100 bytes) with an optional variable-length tail
//! borrowed from the key (see [`rb::VarTail`]). The store is backed by a
//! single file mapped into the process address space; updates are made
//! durable through a small persistent-memory ring log ([`microlog`]) that is
//! periodically folded ("unified") into in-place structures by
//! [`Keymap::unify`].
//!
//! The engineering core lives in four modules:
//!
//! - [`keymap`] — the sharded, extensible hash index (`Keymap`, [`tier`],
//!   [`shard`]): a two-tier hash whose shards grow and split incrementally
//!   while the index stays online.
//! - [`rb`] — the record-block allocator: slotted in-block storage with
//!   hole reclamation.
//! - [`bigmap`] — a radix trie over blocks tracking the largest insertable
//!   record per block, for O(log N) "find a block with enough room".
//! - [`microlog`] — the crash-consistent commit protocol: non-temporal
//!   stores into a cache-line-aligned ring, applied in batches by `unify`.
//!
//! This crate is single-threaded cooperative per [`Keymap`] instance (see
//! the module docs on [`keymap`]); external concurrent use requires external
//! mutual exclusion. It does not provide multi-writer concurrency,
//! cross-table transactions, range queries, in-place variable-length value
//! replacement, or networked access — see `SPEC_FULL.md` for the full list
//! of non-goals.
//!
//! ```no_run
//! use shardmap::{Keymap, ShardmapOptions};
//!
//! let options = ShardmapOptions::new().with_reclen(16);
//! let mut km = Keymap::create("/tmp/example.shardmap", options)?;
//! km.insert(b"hello", &[0u8; 16], true)?;
//! assert!(km.lookup(b"hello").is_some());
//! # Ok::<(), shardmap::ShardmapError>(())
//! ```

pub mod bigmap;
pub mod bitpack;
pub mod error;
pub mod hash;
pub mod header;
pub mod keymap;
pub mod layout;
pub mod microlog;
pub mod options;
pub mod pmem;
pub mod rb;
pub mod shard;
pub mod tier;

pub use error::{Result, ShardmapError};
pub use hash::{AHashKey, HashKey, SipHashKey};
pub use keymap::Keymap;
pub use options::ShardmapOptions;
