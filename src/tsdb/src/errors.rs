use common_base::influxql::DataType;
use thiserror::Error;

/// IndexError enumerates the failure kinds surfaced by the storage engine.
/// Ambient propagation stays on anyhow; call sites that have to act on a
/// specific kind use `downcast_ref`.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("input field \"{field}\" on measurement \"{measurement}\" is type {new}, already exists as type {existing}")]
    FieldTypeConflict {
        measurement: String,
        field: String,
        new: DataType,
        existing: DataType,
    },

    #[error("max field count (255) reached on measurement \"{measurement}\"")]
    FieldOverflow { measurement: String },

    #[error("field id {0} is not mapped in the codec")]
    UnmappedFieldId(u8),

    #[error("malformed series key: {0}")]
    MalformedKey(String),

    #[error("invalid tag predicate: {0}")]
    InvalidPredicate(String),

    #[error("engine is closed")]
    EngineClosed,

    #[error("shard is disabled")]
    ShardDisabled,

    #[error("operation cancelled")]
    Cancelled,

    #[error("max-values-per-tag limit exceeded ({n}/{max}): measurement={measurement} tag={tag}")]
    MaxValuesPerTagExceeded {
        measurement: String,
        tag: String,
        n: u64,
        max: u64,
    },

    #[error("max-select-series limit exceeded ({n}/{max})")]
    MaxSelectSeriesExceeded { n: u64, max: u64 },

    #[error("series file exceeds max size")]
    SeriesFileMaxSize,

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("short buffer")]
    ShortBuffer,
}

impl IndexError {
    /// is_limit reports whether the error is a per-point admission limit,
    /// which the write path converts into a dropped point rather than a
    /// batch failure.
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            IndexError::MaxValuesPerTagExceeded { .. } | IndexError::SeriesFileMaxSize
        )
    }
}

/// PartialWriteError reports a write batch that succeeded for some points
/// and dropped others.
#[derive(Debug, Error)]
#[error("partial write: {reason} dropped={dropped}")]
pub struct PartialWriteError {
    pub reason: String,
    pub dropped: usize,
}
