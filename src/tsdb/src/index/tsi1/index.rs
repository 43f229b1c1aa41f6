use std::sync::Arc;

use common_base::iterator::TryIterator;
use common_base::point::Tags;
use futures::TryStreamExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tsidb_storage::{path_join, StorageOperator};

use crate::config::Config;
use crate::index::tsi1::compact::compact_index_files;
use crate::index::tsi1::index_file::IndexFile;
use crate::index::tsi1::log_file::LogFile;
use crate::index::tsi1::{
    merge_tag_keys, merge_tag_values, FileLayer, CORRUPT_FILE_SUFFIX, INDEX_FILE_EXT,
    LOG_FILE_EXT,
};
use crate::index::{
    filter_undeleted, merge_measurement_iterators, merge_series_id_iterators,
    BoxSeriesIdIterator, Index, SeriesIdSliceIterator,
};
use crate::series::series_file::SeriesFile;
use tsidb_utils::estimator::hll::Plus;
use tsidb_utils::estimator::Sketch;

/// FileSet is the live set of index layers, newest first within each kind.
/// Logs are always newer than index files: compaction folds every log into
/// a fresh index file and starts a new active log above it.
struct FileSet {
    /// logs[0] is the active log.
    logs: Vec<Arc<LogFile>>,
    files: Vec<Arc<IndexFile>>,
    next_sequence: u64,
}

impl FileSet {
    fn layers(&self) -> Vec<Arc<dyn FileLayer>> {
        let mut layers: Vec<Arc<dyn FileLayer>> = Vec::new();
        for log in &self.logs {
            layers.push(log.clone());
        }
        for file in &self.files {
            layers.push(file.clone());
        }
        layers
    }
}

/// Tsi1Index is the log-structured index backend: an append-only log layer
/// (L0) over immutable memory-mapped index files (L1).
pub struct Tsi1Index {
    sfile: Arc<SeriesFile>,
    op: StorageOperator,
    config: Config,

    fs: RwLock<Option<FileSet>>,
    /// Serializes compactions and log rollovers.
    compacting: tokio::sync::Mutex<()>,

    m_sketch: Mutex<Plus>,
    m_t_sketch: Mutex<Plus>,
    s_sketch: Mutex<Plus>,
    s_t_sketch: Mutex<Plus>,
}

impl Tsi1Index {
    pub fn new(sfile: Arc<SeriesFile>, op: StorageOperator, config: &Config) -> Self {
        Self {
            sfile,
            op,
            config: config.clone(),
            fs: RwLock::new(None),
            compacting: tokio::sync::Mutex::new(()),
            m_sketch: Mutex::new(Plus::new().expect("default precision")),
            m_t_sketch: Mutex::new(Plus::new().expect("default precision")),
            s_sketch: Mutex::new(Plus::new().expect("default precision")),
            s_t_sketch: Mutex::new(Plus::new().expect("default precision")),
        }
    }

    /// dir_path is the index directory with a trailing slash, which the
    /// storage operator requires for directory operations.
    fn dir_path(&self) -> String {
        let path = self.op.path();
        if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        }
    }

    fn file_path(&self, sequence: u64, ext: &str) -> String {
        path_join(self.op.path(), &format!("{:04}{}", sequence, ext))
    }

    fn layers(&self) -> Vec<Arc<dyn FileLayer>> {
        self.fs
            .read()
            .as_ref()
            .map(|fs| fs.layers())
            .unwrap_or_default()
    }

    fn active_log(&self) -> anyhow::Result<Arc<LogFile>> {
        self.fs
            .read()
            .as_ref()
            .and_then(|fs| fs.logs.first().cloned())
            .ok_or_else(|| anyhow!("index is not open"))
    }

    /// measurement_state resolves a measurement across layers, newest
    /// first. Returns Some(deleted) if any layer mentions it.
    fn measurement_state(&self, name: &[u8]) -> Option<bool> {
        for layer in self.layers() {
            if let Some(elem) = layer.measurement_elem(name) {
                return Some(elem.deleted);
            }
        }
        None
    }

    /// has_series reports whether the id is present in any layer, so a
    /// series file entry whose log record was lost gets re-indexed.
    fn has_series(&self, id: u64, key: &[u8]) -> bool {
        for layer in self.fs.read().as_ref().map(|fs| fs.logs.clone()).unwrap_or_default() {
            if layer.has_series_id(id) {
                return true;
            }
        }
        for file in self.fs.read().as_ref().map(|fs| fs.files.clone()).unwrap_or_default() {
            if file.lookup_series(key, &self.sfile) == Some(id) {
                return true;
            }
        }
        false
    }

    /// live_series_ids returns the merged, tombstone-filtered ids of a
    /// measurement.
    fn live_series_ids(&self, name: &[u8]) -> anyhow::Result<Vec<u64>> {
        let layers = self.layers();
        let mut itr = filter_undeleted(
            merge_series_id_iterators(
                layers
                    .iter()
                    .map(|l| l.measurement_series_id_iterator(name))
                    .collect(),
            ),
            self.sfile.clone(),
        );
        let mut ids = Vec::new();
        while let Some(elem) = itr.try_next()? {
            ids.push(elem.series_id);
        }
        Ok(ids)
    }
}

#[async_trait]
impl Index for Tsi1Index {
    async fn open(&self) -> anyhow::Result<()> {
        let dir = self.op.to_op(&self.dir_path());
        dir.create_dir().await?;

        // Discover log and index files by sequence.
        let mut log_seqs: Vec<u64> = Vec::new();
        let mut file_seqs: Vec<u64> = Vec::new();
        let mut lister = dir.list().await?;
        while let Some(entry) = lister.try_next().await? {
            let name = entry.name().trim_end_matches('/').to_string();
            if let Some(stem) = name.strip_suffix(LOG_FILE_EXT) {
                if let Ok(seq) = stem.parse::<u64>() {
                    log_seqs.push(seq);
                }
            } else if let Some(stem) = name.strip_suffix(INDEX_FILE_EXT) {
                if let Ok(seq) = stem.parse::<u64>() {
                    file_seqs.push(seq);
                }
            }
            // `.building` leftovers and `.corrupt` quarantines are ignored.
        }
        log_seqs.sort_unstable();
        file_seqs.sort_unstable();

        let mut next_sequence = log_seqs
            .iter()
            .chain(file_seqs.iter())
            .copied()
            .max()
            .unwrap_or(0)
            + 1;

        // Open index files oldest to newest; quarantine failures.
        let mut files: Vec<Arc<IndexFile>> = Vec::new();
        for seq in &file_seqs {
            let path = self.file_path(*seq, INDEX_FILE_EXT);
            let op = self.op.to_op(&path);
            match IndexFile::open(op.clone(), *seq).await {
                Ok(f) => files.push(Arc::new(f)),
                Err(e) => {
                    let quarantine = format!("{}{}", path, CORRUPT_FILE_SUFFIX);
                    warn!(path = path.as_str(), error = %e, "quarantining corrupt index file");
                    op.rename(&quarantine).await?;
                }
            }
        }
        files.reverse(); // newest first

        // Replay logs oldest to newest so tombstones land in order.
        let mut logs: Vec<Arc<LogFile>> = Vec::new();
        for seq in &log_seqs {
            let path = self.file_path(*seq, LOG_FILE_EXT);
            let log = LogFile::open(self.op.to_op(&path), *seq, &self.sfile).await?;
            logs.push(Arc::new(log));
        }
        logs.reverse(); // newest first

        // Ensure an active log exists.
        if logs.is_empty() {
            let path = self.file_path(next_sequence, LOG_FILE_EXT);
            let log = LogFile::open(self.op.to_op(&path), next_sequence, &self.sfile).await?;
            next_sequence += 1;
            logs.insert(0, Arc::new(log));
        }

        // Seed sketches: persisted measurement sketches from index files,
        // log contributions, and series sketches from the series file.
        {
            let mut m = self.m_sketch.lock();
            let mut mt = self.m_t_sketch.lock();
            for file in &files {
                file.merge_measurement_sketches(&mut m, &mut mt)?;
            }
            for log in &logs {
                for (name, deleted) in log.measurement_names() {
                    if deleted {
                        mt.add(&name);
                    } else {
                        m.add(&name);
                    }
                }
            }
        }
        {
            let mut s = self.s_sketch.lock();
            let mut st = self.s_t_sketch.lock();
            self.sfile.visit_series(|id, key| {
                if self.sfile.is_deleted(id) {
                    st.add(key);
                } else {
                    s.add(key);
                }
                Ok(())
            })?;
        }

        *self.fs.write() = Some(FileSet {
            logs,
            files,
            next_sequence,
        });

        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let log = match self.fs.read().as_ref().and_then(|fs| fs.logs.first().cloned()) {
            Some(log) => log,
            None => return Ok(()),
        };
        log.flush().await?;
        *self.fs.write() = None;
        Ok(())
    }

    async fn create_series_if_not_exists(
        &self,
        key: &[u8],
        name: &[u8],
        tags: &Tags,
    ) -> anyhow::Result<u64> {
        // Series already live and indexed: nothing to do.
        if let Some(id) = self.sfile.offset_of(key) {
            if self.has_series(id, key) {
                return Ok(id);
            }
        }

        let id = self.sfile.create_series_list_if_not_exists(&[key]).await?[0];

        let log = self.active_log()?;
        log.append_series_create(id, key, name, tags).await?;

        self.s_sketch.lock().add(key);
        self.m_sketch.lock().add(name);

        Ok(id)
    }

    async fn drop_series(&self, keys: &[&[u8]], ts: i64) -> anyhow::Result<()> {
        let log = self.active_log()?;
        for key in keys {
            let id = match self.sfile.offset_of(key) {
                Some(id) => id,
                None => continue,
            };

            // The tombstone is durable in the log before it becomes
            // observable through the series file.
            log.append_series_delete(id, ts).await?;
            self.sfile.delete_series_id(id);
            self.s_t_sketch.lock().add(key);
        }
        Ok(())
    }

    async fn drop_measurement(&self, name: &[u8]) -> anyhow::Result<()> {
        let log = self.active_log()?;

        for id in self.live_series_ids(name)? {
            let key = self.sfile.series_key(id).map(|k| k.to_vec());
            log.append_series_delete(id, common_base::influxql::MAX_TIME).await?;
            self.sfile.delete_series_id(id);
            if let Some(key) = key {
                self.s_t_sketch.lock().add(&key);
            }
        }

        log.append_measurement_delete(name).await?;
        self.m_t_sketch.lock().add(name);
        Ok(())
    }

    fn series_n(&self) -> u64 {
        self.sfile.series_count()
    }

    fn measurement_exists(&self, name: &[u8]) -> anyhow::Result<bool> {
        match self.measurement_state(name) {
            Some(deleted) => Ok(!deleted && !self.live_series_ids(name)?.is_empty()),
            None => Ok(false),
        }
    }

    fn measurement_names(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        let layers = self.layers();
        let mut itr = merge_measurement_iterators(
            layers.iter().map(|l| l.measurement_iterator()).collect(),
        );

        let mut names = Vec::new();
        while let Some(elem) = itr.try_next()? {
            if elem.deleted {
                continue;
            }
            if !self.live_series_ids(&elem.name)?.is_empty() {
                names.push(elem.name);
            }
        }
        Ok(names)
    }

    fn measurement_series_id_iterator(
        &self,
        name: &[u8],
    ) -> anyhow::Result<BoxSeriesIdIterator> {
        if self.measurement_state(name) == Some(true) {
            return Ok(Box::new(SeriesIdSliceIterator::empty()));
        }
        let layers = self.layers();
        Ok(filter_undeleted(
            merge_series_id_iterators(
                layers
                    .iter()
                    .map(|l| l.measurement_series_id_iterator(name))
                    .collect(),
            ),
            self.sfile.clone(),
        ))
    }

    fn tag_key_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
    ) -> anyhow::Result<BoxSeriesIdIterator> {
        let layers = self.layers();
        let mut itrs: Vec<BoxSeriesIdIterator> = Vec::new();
        for layer in &layers {
            for value_elem in layer.tag_values(name, key) {
                if !value_elem.deleted {
                    itrs.push(layer.tag_value_series_id_iterator(name, key, &value_elem.value));
                }
            }
        }
        Ok(filter_undeleted(
            merge_series_id_iterators(itrs),
            self.sfile.clone(),
        ))
    }

    fn tag_value_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> anyhow::Result<BoxSeriesIdIterator> {
        let layers = self.layers();
        Ok(filter_undeleted(
            merge_series_id_iterators(
                layers
                    .iter()
                    .map(|l| l.tag_value_series_id_iterator(name, key, value))
                    .collect(),
            ),
            self.sfile.clone(),
        ))
    }

    fn tag_keys(&self, name: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let layers = self.layers();
        Ok(
            merge_tag_keys(layers.iter().map(|l| l.tag_keys(name)).collect())
                .into_iter()
                .filter(|e| !e.deleted)
                .map(|e| e.key)
                .collect(),
        )
    }

    fn tag_values(&self, name: &[u8], key: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let layers = self.layers();
        Ok(
            merge_tag_values(layers.iter().map(|l| l.tag_values(name, key)).collect())
                .into_iter()
                .filter(|e| !e.deleted)
                .map(|e| e.value)
                .collect(),
        )
    }

    fn has_tag_value(&self, name: &[u8], key: &[u8], value: &[u8]) -> anyhow::Result<bool> {
        for layer in self.layers() {
            if layer.has_tag_value(name, key, value) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn tag_value_cardinality(&self, name: &[u8], key: &[u8]) -> anyhow::Result<u64> {
        Ok(self.tag_values(name, key)?.len() as u64)
    }

    fn measurement_sketch_counts(&self) -> anyhow::Result<(u64, u64)> {
        Ok((self.m_sketch.lock().count(), self.m_t_sketch.lock().count()))
    }

    fn series_sketch_counts(&self) -> anyhow::Result<(u64, u64)> {
        Ok((self.s_sketch.lock().count(), self.s_t_sketch.lock().count()))
    }

    fn compaction_needed(&self) -> bool {
        let fs = self.fs.read();
        match fs.as_ref() {
            Some(fs) => {
                fs.logs
                    .first()
                    .map(|l| l.is_over_threshold(&self.config))
                    .unwrap_or(false)
                    || fs.logs.len() > 1
                    || fs.files.len() > 1
            }
            None => false,
        }
    }

    /// compact folds every log and index file into one new index file when
    /// the active log holds records (or older layers are stacked up), then
    /// deletes the superseded files.
    async fn compact(&self, token: CancellationToken) -> anyhow::Result<()> {
        let _guard = self.compacting.lock().await;

        // Snapshot the current set and decide whether to run.
        let (logs, files, file_seq, log_seq) = {
            let mut fs = self.fs.write();
            let fs = match fs.as_mut() {
                Some(fs) => fs,
                None => return Ok(()),
            };

            let active_over = fs
                .logs
                .first()
                .map(|l| l.is_over_threshold(&self.config) || l.record_n() > 0)
                .unwrap_or(false);
            let stacked = fs.logs.len() > 1 || fs.files.len() > 1;
            if !active_over && !stacked {
                return Ok(());
            }

            let file_seq = fs.next_sequence;
            let log_seq = fs.next_sequence + 1;
            fs.next_sequence += 2;
            (fs.logs.clone(), fs.files.clone(), file_seq, log_seq)
        };

        // Roll a fresh active log above the layers being compacted so
        // concurrent writes keep landing in the index.
        let new_log = Arc::new(
            LogFile::open(
                self.op.to_op(&self.file_path(log_seq, LOG_FILE_EXT)),
                log_seq,
                &self.sfile,
            )
            .await?,
        );
        {
            let mut fs = self.fs.write();
            if let Some(fs) = fs.as_mut() {
                fs.logs.insert(0, new_log.clone());
            }
        }

        let dst = self.op.to_op(&self.file_path(file_seq, INDEX_FILE_EXT));
        compact_index_files(dst.clone(), &logs, &files, &self.sfile, &token).await?;

        let new_file = Arc::new(IndexFile::open(dst, file_seq).await?);

        // Swap: the new file replaces everything it merged.
        {
            let mut fs = self.fs.write();
            if let Some(fs) = fs.as_mut() {
                fs.logs.retain(|l| l.sequence() == new_log.sequence());
                fs.files = vec![new_file];
            }
        }

        // Old layers are closed and deleted only after the new file is live.
        for log in &logs {
            log.op().delete().await?;
        }
        for file in &files {
            file.op().delete().await?;
        }

        info!(sequence = file_seq, "index compaction complete");
        Ok(())
    }
}
