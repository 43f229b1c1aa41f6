pub mod compact;
pub mod index;
pub mod index_file;
pub mod log_file;
pub mod measurement_block;
pub mod series_block;
pub mod tag_block;

use crate::index::{BoxMeasurementIterator, BoxSeriesIdIterator};

/// LOG_FILE_EXT is the extension of mutable L0 log files.
pub const LOG_FILE_EXT: &'static str = ".tsi.log";

/// INDEX_FILE_EXT is the extension of immutable L1+ index files.
pub const INDEX_FILE_EXT: &'static str = ".tsi";

/// BUILDING_FILE_SUFFIX marks a compaction output that is not yet live.
/// A partial .building file is ignored on open.
pub const BUILDING_FILE_SUFFIX: &'static str = ".building";

/// CORRUPT_FILE_SUFFIX quarantines an index file that failed to open.
pub const CORRUPT_FILE_SUFFIX: &'static str = ".corrupt";

/// TagKeyElem is a tag key with its tombstone state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagKeyElem {
    pub key: Vec<u8>,
    pub deleted: bool,
}

/// TagValueElem is a tag value with its tombstone state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagValueElem {
    pub value: Vec<u8>,
    pub deleted: bool,
}

/// FileLayer is the read interface shared by log files and index files.
/// The index merges layers newest-first, so an element from a newer layer
/// shadows the same element in older layers.
pub trait FileLayer: Send + Sync {
    /// sequence orders layers; higher sequences are newer.
    fn sequence(&self) -> u64;

    fn measurement_iterator(&self) -> BoxMeasurementIterator;

    /// measurement_elem returns this layer's record for a measurement, if
    /// the layer mentions it at all.
    fn measurement_elem(&self, name: &[u8]) -> Option<crate::index::MeasurementElem>;

    /// measurement_series_id_iterator yields the raw posting list of a
    /// measurement in this layer; the caller filters tombstoned series.
    fn measurement_series_id_iterator(&self, name: &[u8]) -> BoxSeriesIdIterator;

    /// has_tag_value reports whether this layer has a posting list for
    /// (key, value), tombstoned series included.
    fn has_tag_value(&self, name: &[u8], key: &[u8], value: &[u8]) -> bool;

    fn tag_keys(&self, name: &[u8]) -> Vec<TagKeyElem>;

    fn tag_values(&self, name: &[u8], key: &[u8]) -> Vec<TagValueElem>;

    fn tag_value_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> BoxSeriesIdIterator;
}

/// append_hash_index serializes a robin-hood hash index over (key, value)
/// entries: `u64be capacity ‖ capacity × u64be value`, 0 = empty slot.
/// Readers re-derive the key for a slot from the value, so only values are
/// stored.
pub(crate) fn append_hash_index(dst: &mut Vec<u8>, entries: &[(Vec<u8>, u64)]) {
    let mut m: tsidb_utils::rhh::HashMap<u64> =
        tsidb_utils::rhh::HashMap::new(tsidb_utils::rhh::Options {
            capacity: entries.len() as u64,
            load_factor: 90,
        });
    for (key, value) in entries {
        m.put(key, *value);
    }

    dst.extend_from_slice(&m.cap().to_be_bytes());
    for i in 0..m.cap() {
        let value = m.elem(i).map(|(_, v)| *v).unwrap_or(0);
        dst.extend_from_slice(&value.to_be_bytes());
    }
}

/// read_hash_index_capacity reads the slot count of a serialized hash index.
pub(crate) fn read_hash_index_capacity(hash_data: &[u8]) -> Option<u64> {
    if hash_data.len() < 8 {
        return None;
    }
    Some(u64::from_be_bytes(hash_data[0..8].try_into().unwrap()))
}

/// read_hash_index_slot reads slot i of a serialized hash index.
pub(crate) fn read_hash_index_slot(hash_data: &[u8], i: u64) -> Option<u64> {
    let at = 8 + (i as usize) * 8;
    if hash_data.len() < at + 8 {
        return None;
    }
    Some(u64::from_be_bytes(hash_data[at..at + 8].try_into().unwrap()))
}

/// merge_tag_keys merges per-layer tag key lists (each sorted); the first
/// (newest) layer wins on duplicates.
pub fn merge_tag_keys(lists: Vec<Vec<TagKeyElem>>) -> Vec<TagKeyElem> {
    let mut out: Vec<TagKeyElem> = Vec::new();
    let mut seen: std::collections::BTreeMap<Vec<u8>, usize> = std::collections::BTreeMap::new();
    for list in lists {
        for elem in list {
            if !seen.contains_key(&elem.key) {
                seen.insert(elem.key.clone(), out.len());
                out.push(elem);
            }
        }
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// merge_tag_values merges per-layer tag value lists (each sorted); the
/// first (newest) layer wins on duplicates.
pub fn merge_tag_values(lists: Vec<Vec<TagValueElem>>) -> Vec<TagValueElem> {
    let mut out: Vec<TagValueElem> = Vec::new();
    let mut seen: std::collections::BTreeMap<Vec<u8>, usize> = std::collections::BTreeMap::new();
    for list in lists {
        for elem in list {
            if !seen.contains_key(&elem.value) {
                seen.insert(elem.value.clone(), out.len());
                out.push(elem);
            }
        }
    }
    out.sort_by(|a, b| a.value.cmp(&b.value));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_tag_keys_newest_wins() {
        let newest = vec![TagKeyElem {
            key: b"host".to_vec(),
            deleted: true,
        }];
        let oldest = vec![
            TagKeyElem {
                key: b"host".to_vec(),
                deleted: false,
            },
            TagKeyElem {
                key: b"region".to_vec(),
                deleted: false,
            },
        ];

        let merged = merge_tag_keys(vec![newest, oldest]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key, b"host".to_vec());
        assert!(merged[0].deleted);
        assert_eq!(merged[1].key, b"region".to_vec());
    }
}
