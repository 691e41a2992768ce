use thiserror::Error;

/// Errors the core can produce.
///
/// `NotFound` and `AlreadyExists` are ordinary, expected outcomes callers
/// branch on. `NoSpace` is transient and internal — `Keymap::insert` handles
/// it itself by consulting the free-space map and retrying; it only escapes
/// to a caller if the whole record-block space is exhausted, at which point
/// it becomes `TooManyBlocks`. `Corrupt`, `ShardOverflow` and `IoError` mark
/// a `Keymap` that should not be used further.
#[derive(Error, Debug)]
pub enum ShardmapError {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    AlreadyExists,

    #[error("record block has no space for a record of this size")]
    NoSpace,

    #[error("structural invariant violated: {0}")]
    Corrupt(&'static str),

    #[error("record-block region exhausted (blocks={blocks}, max={max})")]
    TooManyBlocks { blocks: u32, max: u32 },

    #[error("shard bucket array exhausted (used == top, no free entries)")]
    ShardOverflow,

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShardmapError>;
