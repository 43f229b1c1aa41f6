use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hasher;
use std::sync::Arc;

use common_base::point::Tags;
use parking_lot::RwLock;
use tracing::warn;
use tsidb_storage::file::WritableFile;
use tsidb_storage::{StorageOperator, Writable};
use twox_hash::XxHash32;

use crate::config::Config;
use crate::errors::IndexError;
use crate::index::tsi1::{FileLayer, TagKeyElem, TagValueElem};
use crate::index::{
    BoxMeasurementIterator, BoxSeriesIdIterator, MeasurementElem, MeasurementSliceIterator,
    SeriesIdSliceIterator,
};
use crate::series::series_file::SeriesFile;
use crate::series::series_key::parse_series_key;

/// LOG_FILE_MAGIC identifies a TSI log file.
pub const LOG_FILE_MAGIC: &'static str = "TLG1";

/// LOG_FILE_VERSION is the current log format version.
pub const LOG_FILE_VERSION: u16 = 1;

/// Header: magic + version.
pub const LOG_FILE_HEADER_SIZE: usize = 4 + 2;

/// Record tags.
const LOG_ENTRY_SERIES_CREATE: u8 = 1;
const LOG_ENTRY_SERIES_DELETE: u8 = 2;
const LOG_ENTRY_MEASUREMENT_DELETE: u8 = 3;

/// LogEntry is a single mutation captured by the L0 layer.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEntry {
    SeriesCreate { key: Vec<u8> },
    SeriesDelete { id: u64, ts: i64 },
    MeasurementDelete { name: Vec<u8> },
}

impl LogEntry {
    fn tag(&self) -> u8 {
        match self {
            LogEntry::SeriesCreate { .. } => LOG_ENTRY_SERIES_CREATE,
            LogEntry::SeriesDelete { .. } => LOG_ENTRY_SERIES_DELETE,
            LogEntry::MeasurementDelete { .. } => LOG_ENTRY_MEASUREMENT_DELETE,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            LogEntry::SeriesCreate { key } => key.clone(),
            LogEntry::SeriesDelete { id, ts } => {
                let mut buf = Vec::with_capacity(16);
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&(*ts as u64).to_be_bytes());
                buf
            }
            LogEntry::MeasurementDelete { name } => name.clone(),
        }
    }

    /// encode frames the entry:
    /// u32be length ‖ u8 tag ‖ payload ‖ u32be checksum(length‖tag‖payload).
    /// The length covers everything after itself, checksum included.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let length = (1 + payload.len() + 4) as u32;

        let mut buf = Vec::with_capacity(4 + length as usize);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.push(self.tag());
        buf.extend_from_slice(&payload);

        let checksum = log_checksum(&buf);
        buf.extend_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// decode reads one framed entry from the front of buf, returning it and
    /// the total bytes consumed. Truncation or a checksum mismatch is a
    /// Corrupt error; the caller truncates the file there.
    pub fn decode(buf: &[u8]) -> anyhow::Result<(LogEntry, usize)> {
        if buf.len() < 4 {
            return Err(IndexError::Corrupt("log record truncated".to_string()).into());
        }
        let length = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if length < 5 || buf.len() < 4 + length {
            return Err(IndexError::Corrupt("log record truncated".to_string()).into());
        }

        let record = &buf[..4 + length];
        let checksum =
            u32::from_be_bytes(record[record.len() - 4..].try_into().unwrap());
        if log_checksum(&record[..record.len() - 4]) != checksum {
            return Err(IndexError::Corrupt("log record checksum mismatch".to_string()).into());
        }

        let tag = record[4];
        let payload = &record[5..record.len() - 4];
        let entry = match tag {
            LOG_ENTRY_SERIES_CREATE => LogEntry::SeriesCreate {
                key: payload.to_vec(),
            },
            LOG_ENTRY_SERIES_DELETE => {
                if payload.len() != 16 {
                    return Err(
                        IndexError::Corrupt("series delete payload size".to_string()).into()
                    );
                }
                LogEntry::SeriesDelete {
                    id: u64::from_be_bytes(payload[0..8].try_into().unwrap()),
                    ts: u64::from_be_bytes(payload[8..16].try_into().unwrap()) as i64,
                }
            }
            LOG_ENTRY_MEASUREMENT_DELETE => LogEntry::MeasurementDelete {
                name: payload.to_vec(),
            },
            other => {
                return Err(IndexError::Corrupt(format!("unknown log tag {}", other)).into())
            }
        };

        Ok((entry, 4 + length))
    }
}

fn log_checksum(data: &[u8]) -> u32 {
    let mut h = XxHash32::with_seed(0);
    h.write(data);
    h.finish() as u32
}

struct LogTagKey {
    tag_values: BTreeMap<Vec<u8>, BTreeSet<u64>>,
}

struct LogMeasurement {
    deleted: bool,
    series_ids: BTreeSet<u64>,
    tag_set: BTreeMap<Vec<u8>, LogTagKey>,
}

impl LogMeasurement {
    fn new() -> Self {
        Self {
            deleted: false,
            series_ids: BTreeSet::new(),
            tag_set: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct LogData {
    size: u64,
    record_n: u64,
    mms: BTreeMap<Vec<u8>, LogMeasurement>,
    /// id → (name, tags) for entries created through this log.
    series: BTreeMap<u64, (Vec<u8>, Tags)>,
}

impl LogData {
    fn add_series(&mut self, id: u64, name: &[u8], tags: &Tags) {
        let mm = self
            .mms
            .entry(name.to_vec())
            .or_insert_with(LogMeasurement::new);
        mm.deleted = false;
        mm.series_ids.insert(id);
        for tag in tags.iter() {
            mm.tag_set
                .entry(tag.key.clone())
                .or_insert_with(|| LogTagKey {
                    tag_values: BTreeMap::new(),
                })
                .tag_values
                .entry(tag.value.clone())
                .or_insert_with(BTreeSet::new)
                .insert(id);
        }
        self.series.insert(id, (name.to_vec(), tags.clone()));
    }

    fn delete_series(&mut self, id: u64) {
        let (name, tags) = match self.series.remove(&id) {
            Some(v) => v,
            None => return, // created in an older layer
        };
        if let Some(mm) = self.mms.get_mut(&name) {
            mm.series_ids.remove(&id);
            for tag in tags.iter() {
                let mut remove_key = false;
                if let Some(tk) = mm.tag_set.get_mut(&tag.key) {
                    let mut remove_value = false;
                    if let Some(ids) = tk.tag_values.get_mut(&tag.value) {
                        ids.remove(&id);
                        remove_value = ids.is_empty();
                    }
                    if remove_value {
                        tk.tag_values.remove(&tag.value);
                    }
                    remove_key = tk.tag_values.is_empty();
                }
                if remove_key {
                    mm.tag_set.remove(&tag.key);
                }
            }
        }
    }

    fn delete_measurement(&mut self, name: &[u8]) {
        let mm = self
            .mms
            .entry(name.to_vec())
            .or_insert_with(LogMeasurement::new);
        mm.deleted = true;
        let ids: Vec<u64> = mm.series_ids.iter().copied().collect();
        mm.series_ids.clear();
        mm.tag_set.clear();
        for id in ids {
            self.series.remove(&id);
        }
    }
}

/// LogFile is the mutable L0 index layer: an append-only record log plus an
/// in-memory projection of the creates and drops it contains.
pub struct LogFile {
    op: StorageOperator,
    sequence: u64,

    data: RwLock<LogData>,
    w: tokio::sync::Mutex<WritableFile>,
}

impl LogFile {
    /// open reads and replays the log at the operator's path, creating it
    /// (with a fresh header) if absent. The first unreadable record
    /// truncates the file: recovery, not failure. Series ids are resolved
    /// through the series file; deletes feed its tombstone set.
    pub async fn open(
        op: StorageOperator,
        sequence: u64,
        sfile: &Arc<SeriesFile>,
    ) -> anyhow::Result<Self> {
        let path = op.path().to_string();

        let exists = op.exist().await?;
        let mut data = LogData::default();

        if exists {
            let buf = tokio::fs::read(&path).await?;
            let valid_len = Self::replay(&buf, &mut data, sfile);
            if (valid_len as usize) < buf.len() {
                warn!(
                    path = path.as_str(),
                    valid = valid_len,
                    total = buf.len(),
                    "truncating log file tail"
                );
                let f = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .await?;
                f.set_len(valid_len).await?;
                f.sync_all().await?;
            }
            data.size = valid_len;
        }

        let mut w = WritableFile::open(&path).await?;
        if data.size < LOG_FILE_HEADER_SIZE as u64 {
            // New or fully truncated file: write a fresh header.
            let mut header = Vec::with_capacity(LOG_FILE_HEADER_SIZE);
            header.extend_from_slice(LOG_FILE_MAGIC.as_bytes());
            header.extend_from_slice(&LOG_FILE_VERSION.to_be_bytes());
            w.append(&header).await?;
            w.sync().await?;
            data.size = LOG_FILE_HEADER_SIZE as u64;
        }

        Ok(Self {
            op,
            sequence,
            data: RwLock::new(data),
            w: tokio::sync::Mutex::new(w),
        })
    }

    /// replay scans records front to back, applying them to the projection.
    /// Returns the byte length of the valid prefix.
    fn replay(buf: &[u8], data: &mut LogData, sfile: &Arc<SeriesFile>) -> u64 {
        if buf.len() < LOG_FILE_HEADER_SIZE
            || &buf[..4] != LOG_FILE_MAGIC.as_bytes()
            || u16::from_be_bytes([buf[4], buf[5]]) != LOG_FILE_VERSION
        {
            return 0;
        }

        let mut pos = LOG_FILE_HEADER_SIZE;
        while pos < buf.len() {
            let (entry, n) = match LogEntry::decode(&buf[pos..]) {
                Ok(v) => v,
                Err(_) => break,
            };

            match &entry {
                LogEntry::SeriesCreate { key } => match parse_series_key(key) {
                    Ok((name, tags)) => {
                        // The create is only meaningful if the key committed
                        // to the series file before the log record.
                        match sfile.offset_of(key) {
                            Some(id) => {
                                let name = name.to_vec();
                                data.add_series(id, &name, &tags);
                            }
                            None => {
                                warn!("log create without series file entry; skipping");
                            }
                        }
                    }
                    Err(_) => {
                        warn!("malformed series key in log; skipping record");
                    }
                },
                LogEntry::SeriesDelete { id, ts: _ } => {
                    sfile.delete_series_id(*id);
                    data.delete_series(*id);
                }
                LogEntry::MeasurementDelete { name } => {
                    data.delete_measurement(name);
                }
            }

            data.record_n += 1;
            pos += n;
        }

        pos as u64
    }

    pub fn path(&self) -> &str {
        self.op.path()
    }

    pub fn op(&self) -> &StorageOperator {
        &self.op
    }

    pub fn size(&self) -> u64 {
        self.data.read().size
    }

    pub fn record_n(&self) -> u64 {
        self.data.read().record_n
    }

    /// is_over_threshold reports whether the log should be sealed and
    /// compacted into an index file.
    pub fn is_over_threshold(&self, config: &Config) -> bool {
        let data = self.data.read();
        data.size >= config.max_log_file_size || data.record_n >= config.max_log_file_records
    }

    async fn append(&self, entry: &LogEntry) -> anyhow::Result<u64> {
        let buf = entry.encode();
        let mut w = self.w.lock().await;
        w.append(&buf).await?;
        w.sync().await?;
        Ok(buf.len() as u64)
    }

    /// append_series_create logs a series create and projects it.
    pub async fn append_series_create(
        &self,
        id: u64,
        key: &[u8],
        name: &[u8],
        tags: &Tags,
    ) -> anyhow::Result<()> {
        let n = self
            .append(&LogEntry::SeriesCreate { key: key.to_vec() })
            .await?;

        let mut data = self.data.write();
        data.add_series(id, name, tags);
        data.size += n;
        data.record_n += 1;
        Ok(())
    }

    /// append_series_delete logs a series tombstone and projects it.
    pub async fn append_series_delete(&self, id: u64, ts: i64) -> anyhow::Result<()> {
        let n = self.append(&LogEntry::SeriesDelete { id, ts }).await?;

        let mut data = self.data.write();
        data.delete_series(id);
        data.size += n;
        data.record_n += 1;
        Ok(())
    }

    /// append_measurement_delete logs a measurement tombstone and projects it.
    pub async fn append_measurement_delete(&self, name: &[u8]) -> anyhow::Result<()> {
        let n = self
            .append(&LogEntry::MeasurementDelete {
                name: name.to_vec(),
            })
            .await?;

        let mut data = self.data.write();
        data.delete_measurement(name);
        data.size += n;
        data.record_n += 1;
        Ok(())
    }

    /// flush syncs outstanding appends.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let mut w = self.w.lock().await;
        w.flush().await?;
        w.sync().await?;
        Ok(())
    }

    /// has_series_id reports whether this log created the series.
    pub fn has_series_id(&self, id: u64) -> bool {
        self.data.read().series.contains_key(&id)
    }

    /// measurement_names returns the live measurements this log mentions.
    pub fn measurement_names(&self) -> Vec<(Vec<u8>, bool)> {
        let data = self.data.read();
        data.mms
            .iter()
            .map(|(name, mm)| (name.clone(), mm.deleted))
            .collect()
    }
}

impl FileLayer for LogFile {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn measurement_iterator(&self) -> BoxMeasurementIterator {
        let data = self.data.read();
        let elems = data
            .mms
            .iter()
            .map(|(name, mm)| MeasurementElem {
                name: name.clone(),
                deleted: mm.deleted,
            })
            .collect();
        Box::new(MeasurementSliceIterator::new(elems))
    }

    fn measurement_elem(&self, name: &[u8]) -> Option<MeasurementElem> {
        let data = self.data.read();
        data.mms.get(name).map(|mm| MeasurementElem {
            name: name.to_vec(),
            deleted: mm.deleted,
        })
    }

    fn measurement_series_id_iterator(&self, name: &[u8]) -> BoxSeriesIdIterator {
        let data = self.data.read();
        let ids = data
            .mms
            .get(name)
            .map(|mm| mm.series_ids.iter().copied().collect())
            .unwrap_or_default();
        Box::new(SeriesIdSliceIterator::new(ids))
    }

    fn has_tag_value(&self, name: &[u8], key: &[u8], value: &[u8]) -> bool {
        let data = self.data.read();
        data.mms
            .get(name)
            .and_then(|mm| mm.tag_set.get(key))
            .map(|tk| tk.tag_values.contains_key(value))
            .unwrap_or(false)
    }

    fn tag_keys(&self, name: &[u8]) -> Vec<TagKeyElem> {
        let data = self.data.read();
        data.mms
            .get(name)
            .map(|mm| {
                mm.tag_set
                    .keys()
                    .map(|key| TagKeyElem {
                        key: key.clone(),
                        deleted: false,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn tag_values(&self, name: &[u8], key: &[u8]) -> Vec<TagValueElem> {
        let data = self.data.read();
        data.mms
            .get(name)
            .and_then(|mm| mm.tag_set.get(key))
            .map(|tk| {
                tk.tag_values
                    .keys()
                    .map(|value| TagValueElem {
                        value: value.clone(),
                        deleted: false,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn tag_value_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> BoxSeriesIdIterator {
        let data = self.data.read();
        let ids = data
            .mms
            .get(name)
            .and_then(|mm| mm.tag_set.get(key))
            .and_then(|tk| tk.tag_values.get(value))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        Box::new(SeriesIdSliceIterator::new(ids))
    }
}
