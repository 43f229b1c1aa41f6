use serde::{Deserialize, Serialize};

/// DEFAULT_MAX_VALUES_PER_TAG is the default cap on distinct values for a
/// single tag key within a measurement. 0 disables the limit.
pub const DEFAULT_MAX_VALUES_PER_TAG: u64 = 100_000;

/// DEFAULT_MAX_SERIES_FILE_SIZE is the default cap on series file growth.
pub const DEFAULT_MAX_SERIES_FILE_SIZE: u64 = 32 * (1 << 30); // 32GB

/// DEFAULT_MAX_LOG_FILE_SIZE is the log size at which a log file is sealed
/// and scheduled for compaction.
pub const DEFAULT_MAX_LOG_FILE_SIZE: u64 = 1 << 20; // 1MB

/// DEFAULT_MAX_LOG_FILE_RECORDS is the record count at which a log file is
/// sealed and scheduled for compaction.
pub const DEFAULT_MAX_LOG_FILE_RECORDS: u64 = 4096;

/// IndexType selects the index backend a shard is constructed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    InMem,
    Tsi1,
}

/// Config holds the shard-level configuration inputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub max_values_per_tag: u64,
    pub max_series_file_size: u64,
    /// Cap on series matched by a single predicate evaluation. 0 = unlimited.
    pub max_select_series: u64,
    pub max_log_file_size: u64,
    pub max_log_file_records: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_values_per_tag: DEFAULT_MAX_VALUES_PER_TAG,
            max_series_file_size: DEFAULT_MAX_SERIES_FILE_SIZE,
            max_select_series: 0,
            max_log_file_size: DEFAULT_MAX_LOG_FILE_SIZE,
            max_log_file_records: DEFAULT_MAX_LOG_FILE_RECORDS,
        }
    }
}

/// EngineOptions carries construction-time options for a shard.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub index_type: IndexType,
    pub config: Config,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            index_type: IndexType::Tsi1,
            config: Config::default(),
        }
    }
}
