use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common_base::influxql::{DataType, Expr, MAX_TIME, MIN_TIME};
use common_base::point::{Point, TIME_TAG};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tsidb_storage::{path_join, StorageOperator};

use crate::config::EngineOptions;
use crate::engine::{EncodedPoint, PointStore};
use crate::errors::{IndexError, PartialWriteError};
use crate::field::measurement_field::FIELDS_FILE_NAME;
use crate::field::{MeasurementFieldSet, MeasurementFields};
use crate::index::eval::{self, TagSet};
use crate::index::{cancellable, new_index, BoxSeriesIdIterator, Index};
use crate::series::series_file::{SeriesFile, SERIES_FILE_NAME};
use crate::series::series_key::encode_series_key;

/// MONITOR_STAT_INTERVAL is the cadence of the disk-size walk.
const MONITOR_STAT_INTERVAL: Duration = Duration::from_secs(30);

/// MONITOR_CARDINALITY_INTERVAL is the cadence of tag cardinality checks.
const MONITOR_CARDINALITY_INTERVAL: Duration = Duration::from_secs(60);

/// INDEX_DIR_NAME is the shard subdirectory holding TSI files.
const INDEX_DIR_NAME: &'static str = "index";

/// FieldCreate is a pending field registration discovered during write
/// validation and applied after the whole batch validates.
#[derive(Clone, Debug)]
pub struct FieldCreate {
    pub measurement: Vec<u8>,
    pub name: String,
    pub data_type: DataType,
}

/// ShardStatistics are the shard's monotonic write counters plus the
/// monitored disk size.
#[derive(Default)]
pub struct ShardStatistics {
    pub write_req: AtomicU64,
    pub write_req_ok: AtomicU64,
    pub write_req_err: AtomicU64,
    pub write_points_ok: AtomicU64,
    pub write_points_err: AtomicU64,
    pub write_points_dropped: AtomicU64,
    pub fields_created: AtomicU64,
    pub series_created: AtomicU64,
    pub disk_bytes: AtomicU64,
}

/// ShardStats is a point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub write_req: u64,
    pub write_req_ok: u64,
    pub write_req_err: u64,
    pub write_points_ok: u64,
    pub write_points_err: u64,
    pub write_points_dropped: u64,
    pub fields_created: u64,
    pub series_created: u64,
    pub disk_bytes: u64,
}

struct ShardState {
    sfile: Arc<SeriesFile>,
    index: Arc<dyn Index>,
    fields: Arc<MeasurementFieldSet>,
    engine: Arc<dyn PointStore>,
    closing: CancellationToken,
    monitor: JoinHandle<()>,
}

/// Shard orchestrates one time window's storage: write admission, series
/// and field creation, limits, deletes, snapshots, and statistics.
///
/// States: Closed → OpenDisabled → OpenEnabled. Writes and queries succeed
/// only while open and enabled.
pub struct Shard {
    id: u64,
    path: String,
    wal_path: String,
    database: String,
    retention_policy: String,
    opt: EngineOptions,
    engine: Arc<dyn PointStore>,

    state: tokio::sync::RwLock<Option<ShardState>>,
    enabled: Arc<AtomicBool>,
    stats: Arc<ShardStatistics>,
    snapshot_seq: AtomicU64,
}

impl Shard {
    pub fn new(
        id: u64,
        path: &str,
        wal_path: &str,
        database: &str,
        retention_policy: &str,
        engine: Arc<dyn PointStore>,
        opt: EngineOptions,
    ) -> Self {
        Self {
            id,
            path: path.to_string(),
            wal_path: wal_path.to_string(),
            database: database.to_string(),
            retention_policy: retention_policy.to_string(),
            opt,
            engine,
            state: tokio::sync::RwLock::new(None),
            enabled: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ShardStatistics::default()),
            snapshot_seq: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn retention_policy(&self) -> &str {
        &self.retention_policy
    }

    /// statistics returns a snapshot of the shard counters.
    pub fn statistics(&self) -> ShardStats {
        let s = &self.stats;
        ShardStats {
            write_req: s.write_req.load(Ordering::Relaxed),
            write_req_ok: s.write_req_ok.load(Ordering::Relaxed),
            write_req_err: s.write_req_err.load(Ordering::Relaxed),
            write_points_ok: s.write_points_ok.load(Ordering::Relaxed),
            write_points_err: s.write_points_err.load(Ordering::Relaxed),
            write_points_dropped: s.write_points_dropped.load(Ordering::Relaxed),
            fields_created: s.fields_created.load(Ordering::Relaxed),
            series_created: s.series_created.load(Ordering::Relaxed),
            disk_bytes: s.disk_bytes.load(Ordering::Relaxed),
        }
    }

    /// open loads the series file, field set, and index, starts the monitor
    /// task, and opens the point store. Idempotent.
    pub async fn open(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.path).await?;
        tokio::fs::create_dir_all(&self.wal_path).await?;

        let sfile_path = path_join(&self.path, SERIES_FILE_NAME);
        let sfile = Arc::new(
            SeriesFile::open(
                StorageOperator::root(&sfile_path)?,
                self.opt.config.max_series_file_size,
            )
            .await?,
        );

        let fields = Arc::new(MeasurementFieldSet::new(StorageOperator::root(
            &path_join(&self.path, FIELDS_FILE_NAME),
        )?));
        fields.load().await?;

        let index_op = StorageOperator::root(&path_join(&self.path, INDEX_DIR_NAME))?;
        let index = new_index(
            self.opt.index_type,
            sfile.clone(),
            index_op,
            &self.opt.config,
        )
        .await
        .map_err(|e| anyhow!("index open: {}", e))?;

        self.engine
            .open()
            .await
            .map_err(|e| anyhow!("engine init: {}", e))?;

        let closing = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            index.clone(),
            self.stats.clone(),
            self.opt.clone(),
            self.path.clone(),
            self.wal_path.clone(),
            self.database.clone(),
            self.id,
            self.enabled.clone(),
            closing.clone(),
        ));

        *state = Some(ShardState {
            sfile,
            index,
            fields,
            engine: self.engine.clone(),
            closing,
            monitor,
        });

        info!(shard = self.id, path = self.path.as_str(), "shard opened");
        Ok(())
    }

    /// close flushes the index log, stops the monitor, and releases maps.
    /// Idempotent.
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        let s = match state.take() {
            Some(s) => s,
            None => return Ok(()),
        };

        s.closing.cancel();
        s.monitor.abort();
        s.engine.close().await?;
        s.index.close().await?;
        s.sfile.close().await?;

        info!(shard = self.id, "shard closed");
        Ok(())
    }

    /// set_enabled gates writes, queries, and background compactions.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ready<'a>(&self, state: &'a Option<ShardState>) -> anyhow::Result<&'a ShardState> {
        let s = state.as_ref().ok_or(IndexError::EngineClosed)?;
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(IndexError::ShardDisabled.into());
        }
        Ok(s)
    }

    /// write_points validates and indexes a batch, then hands the surviving
    /// points to the point store. Per-point limit and schema drops are
    /// reported as a PartialWriteError after the rest of the batch commits;
    /// structural failures abort the batch.
    pub async fn write_points(&self, points: Vec<Point>) -> anyhow::Result<()> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;

        self.stats.write_req.fetch_add(1, Ordering::Relaxed);

        let result = self.write_points_inner(s, points).await;
        match &result {
            Ok(()) => {
                self.stats.write_req_ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.downcast_ref::<PartialWriteError>().is_some() => {
                self.stats.write_req_ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.write_req_err.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn write_points_inner(
        &self,
        s: &ShardState,
        points: Vec<Point>,
    ) -> anyhow::Result<()> {
        let (points, field_creates, partial) =
            self.validate_series_and_fields(s, points).await?;

        self.stats
            .fields_created
            .fetch_add(field_creates.len() as u64, Ordering::Relaxed);
        self.create_fields_and_measurements(s, &field_creates).await?;

        // Encode fields with the (now extended) codec snapshots and hand
        // the batch to the point store.
        let mut encoded = Vec::with_capacity(points.len());
        for p in &points {
            let mf = s.fields.create_fields_if_not_exists(p.name());
            let codec = mf.codec();
            let fields = codec.encode_fields(p.fields(), p.name())?;
            encoded.push(EncodedPoint {
                series_key: encode_series_key(p.name(), p.tags()),
                timestamp: p.time(),
                fields,
            });
        }

        if let Err(e) = s.engine.write_points(&encoded).await {
            self.stats
                .write_points_err
                .fetch_add(encoded.len() as u64, Ordering::Relaxed);
            return Err(anyhow!("engine: {}", e));
        }
        self.stats
            .write_points_ok
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);

        match partial {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// validate_series_and_fields checks which series and fields are new,
    /// enforcing limits and reserved names. It returns the surviving
    /// points, the fields to create, and the accumulated partial-write
    /// error, if any.
    async fn validate_series_and_fields(
        &self,
        s: &ShardState,
        points: Vec<Point>,
    ) -> anyhow::Result<(Vec<Point>, Vec<FieldCreate>, Option<PartialWriteError>)> {
        let max_values_per_tag = self.opt.config.max_values_per_tag;
        let mut dropped = 0_usize;
        let mut reason = String::new();

        // Validate that new points would not exceed the tag value limit;
        // points that would are dropped, not fatal.
        let mut admitted = Vec::with_capacity(points.len());
        for p in points {
            if max_values_per_tag > 0 && s.index.measurement_exists(p.name())? {
                let mut drop_point = false;
                for tag in p.tags().iter() {
                    // An already-known value cannot raise cardinality.
                    if s.index.has_tag_value(p.name(), &tag.key, &tag.value)? {
                        continue;
                    }
                    let n = s.index.tag_value_cardinality(p.name(), &tag.key)?;
                    if n >= max_values_per_tag {
                        drop_point = true;
                        reason = IndexError::MaxValuesPerTagExceeded {
                            measurement: String::from_utf8_lossy(p.name()).to_string(),
                            tag: String::from_utf8_lossy(&tag.key).to_string(),
                            n,
                            max: max_values_per_tag,
                        }
                        .to_string();
                        break;
                    }
                }
                if drop_point {
                    self.stats
                        .write_points_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    dropped += 1;
                    continue;
                }
            }
            admitted.push(p);
        }

        let mut out = Vec::with_capacity(admitted.len());
        let mut field_creates: Vec<FieldCreate> = Vec::new();

        for mut p in admitted {
            // The time tag and field are reserved.
            if p.tags_mut().remove(TIME_TAG) {
                warn!(
                    measurement = %String::from_utf8_lossy(p.name()),
                    "dropping tag 'time'"
                );
            }
            if p.fields_mut().remove("time").is_some() {
                warn!(
                    measurement = %String::from_utf8_lossy(p.name()),
                    "dropping field 'time'"
                );
            }
            if p.fields().is_empty() {
                continue;
            }

            let key = encode_series_key(p.name(), p.tags());
            let before_n = s.index.series_n();
            match s
                .index
                .create_series_if_not_exists(&key, p.name(), p.tags())
                .await
            {
                Ok(_id) => {
                    if s.index.series_n() > before_n {
                        self.stats.series_created.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    // Limit errors drop the point; anything else is fatal.
                    match e.downcast_ref::<IndexError>() {
                        Some(ie) if ie.is_limit() => {
                            self.stats
                                .write_points_dropped
                                .fetch_add(1, Ordering::Relaxed);
                            dropped += 1;
                            reason = format!("db={}: {}", self.database, ie);
                            continue;
                        }
                        _ => return Err(e),
                    }
                }
            }

            // Verify field types and note the fields to be created.
            let mf = s.fields.fields(p.name());
            for (field_name, value) in p.fields() {
                let field_type = value.data_type();
                if let Some(f) = mf.as_ref().and_then(|mf| mf.field_by_name(field_name)) {
                    if f.data_type != field_type {
                        // A real type collision is fatal for the batch.
                        return Err(IndexError::FieldTypeConflict {
                            measurement: String::from_utf8_lossy(p.name()).to_string(),
                            field: field_name.clone(),
                            new: field_type,
                            existing: f.data_type,
                        }
                        .into());
                    }
                    continue;
                }
                field_creates.push(FieldCreate {
                    measurement: p.name().to_vec(),
                    name: field_name.clone(),
                    data_type: field_type,
                });
            }

            out.push(p);
        }

        let partial = if dropped > 0 {
            Some(PartialWriteError { reason, dropped })
        } else {
            None
        };
        Ok((out, field_creates, partial))
    }

    async fn create_fields_and_measurements(
        &self,
        s: &ShardState,
        field_creates: &[FieldCreate],
    ) -> anyhow::Result<()> {
        if field_creates.is_empty() {
            return Ok(());
        }

        for fc in field_creates {
            let mf = s.fields.create_fields_if_not_exists(&fc.measurement);
            mf.create_field_if_not_exists(&fc.name, fc.data_type)?;
        }

        s.fields.save().await
    }

    /// delete_series_range tombstones series over [min, max]. Storage
    /// reclaim is delegated to the point store; the index entry is dropped
    /// only when the range covers all representable time.
    pub async fn delete_series_range(
        &self,
        keys: Vec<Vec<u8>>,
        min: i64,
        max: i64,
    ) -> anyhow::Result<()> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;

        let key_refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        s.engine.delete_series_range(&key_refs, min, max).await?;

        if min <= MIN_TIME && max >= MAX_TIME {
            s.index.drop_series(&key_refs, max).await?;
        }
        Ok(())
    }

    /// delete_series tombstones series across all time.
    pub async fn delete_series(&self, keys: Vec<Vec<u8>>) -> anyhow::Result<()> {
        self.delete_series_range(keys, i64::MIN, i64::MAX).await
    }

    /// delete_measurement drops a measurement and all of its series.
    pub async fn delete_measurement(&self, name: &[u8]) -> anyhow::Result<()> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;

        s.engine.delete_measurement(name).await?;
        s.index.drop_measurement(name).await?;
        s.fields.delete(name);
        s.fields.save().await?;
        Ok(())
    }

    /// series_n returns the exact live series count.
    pub async fn series_n(&self) -> anyhow::Result<u64> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;
        Ok(s.index.series_n())
    }

    /// measurement_fields returns the field schema of a measurement.
    pub async fn measurement_fields(
        &self,
        name: &[u8],
    ) -> anyhow::Result<Option<Arc<MeasurementFields>>> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;
        Ok(s.fields.fields(name))
    }

    /// measurements_by_expr returns the sorted measurements matching an
    /// optional tag predicate and whether the predicate was resolvable.
    pub async fn measurements_by_expr(
        &self,
        expr: Option<&Expr>,
    ) -> anyhow::Result<(Vec<Vec<u8>>, bool)> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;

        match expr {
            Some(expr) => eval::measurements_by_expr(s.index.as_ref(), expr),
            None => Ok((s.index.measurement_names()?, false)),
        }
    }

    /// measurement_series_by_expr returns a cancellable iterator over a
    /// measurement's series matching an optional predicate, with residual
    /// filters attached.
    pub async fn measurement_series_by_expr(
        &self,
        name: &[u8],
        expr: Option<&Expr>,
        token: CancellationToken,
    ) -> anyhow::Result<BoxSeriesIdIterator> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;
        let itr = eval::measurement_series_by_expr_iterator(s.index.as_ref(), name, expr)?;
        Ok(cancellable(itr, token))
    }

    /// tag_sets returns the sorted group-by composites for a measurement.
    pub async fn tag_sets(
        &self,
        name: &[u8],
        dimensions: &[String],
        condition: Option<&Expr>,
    ) -> anyhow::Result<Vec<TagSet>> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;
        eval::tag_sets(
            s.index.as_ref(),
            &s.sfile,
            name,
            dimensions,
            condition,
            self.opt.config.max_select_series,
        )
    }

    /// tag_keys returns the sorted tag keys of a measurement.
    pub async fn tag_keys(&self, name: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;
        s.index.tag_keys(name)
    }

    /// tag_values returns the sorted values of a measurement's tag key.
    pub async fn tag_values(&self, name: &[u8], key: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;
        s.index.tag_values(name, key)
    }

    /// compact forces index maintenance (log → index file for TSI).
    pub async fn compact(&self, token: CancellationToken) -> anyhow::Result<()> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;
        s.index.compact(token).await
    }

    /// series_sketch_counts returns (live, tombstoned) estimates.
    pub async fn series_sketch_counts(&self) -> anyhow::Result<(u64, u64)> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;
        s.index.series_sketch_counts()
    }

    /// measurement_sketch_counts returns (live, tombstoned) estimates.
    pub async fn measurement_sketch_counts(&self) -> anyhow::Result<(u64, u64)> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;
        s.index.measurement_sketch_counts()
    }

    /// disk_size walks the shard and WAL directories.
    pub async fn disk_size(&self) -> anyhow::Result<u64> {
        Ok(dir_size(&self.path).await? + dir_size(&self.wal_path).await?)
    }

    /// last_modified returns the newest mtime under the shard directory.
    pub async fn last_modified(&self) -> anyhow::Result<SystemTime> {
        let mut latest = UNIX_EPOCH;
        for path in list_files_recursive(&self.path).await? {
            let meta = tokio::fs::metadata(&path).await?;
            if let Ok(modified) = meta.modified() {
                if modified > latest {
                    latest = modified;
                }
            }
        }
        Ok(latest)
    }

    /// create_snapshot hardlinks the shard's live files into a fresh
    /// snapshot directory and returns its path.
    pub async fn create_snapshot(&self) -> anyhow::Result<PathBuf> {
        let state = self.state.read().await;
        let s = self.ready(&state)?;

        // Quiesce the log tail so links capture complete records.
        s.sfile.close().await?;

        let seq = self.snapshot_seq.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dst_root = PathBuf::from(&self.path).join(format!(".snapshot-{}-{}", nanos, seq));
        tokio::fs::create_dir_all(dst_root.join(INDEX_DIR_NAME)).await?;

        for rel in self.persisted_files().await? {
            let src = PathBuf::from(&self.path).join(&rel);
            let dst = dst_root.join(&rel);
            tokio::fs::hard_link(&src, &dst).await?;
        }

        Ok(dst_root)
    }

    /// persisted_files lists the shard-relative index state files.
    async fn persisted_files(&self) -> anyhow::Result<Vec<String>> {
        let mut files = Vec::new();
        for name in [SERIES_FILE_NAME.to_string(), format!("{}.map", SERIES_FILE_NAME)] {
            if tokio::fs::try_exists(Path::new(&self.path).join(&name)).await? {
                files.push(name);
            }
        }
        if tokio::fs::try_exists(Path::new(&self.path).join(FIELDS_FILE_NAME)).await? {
            files.push(FIELDS_FILE_NAME.to_string());
        }

        let index_dir = Path::new(&self.path).join(INDEX_DIR_NAME);
        if tokio::fs::try_exists(&index_dir).await? {
            let mut rd = tokio::fs::read_dir(&index_dir).await?;
            while let Some(entry) = rd.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(crate::index::tsi1::INDEX_FILE_EXT)
                    || name.ends_with(crate::index::tsi1::LOG_FILE_EXT)
                {
                    files.push(format!("{}/{}", INDEX_DIR_NAME, name));
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// write_to streams a consistent snapshot of the shard's index state:
    /// `u16be path len ‖ path ‖ u64be size ‖ bytes` per file. Returns the
    /// total byte count written.
    pub async fn write_to<W: AsyncWrite + Send + Unpin>(
        &self,
        w: &mut W,
    ) -> anyhow::Result<u64> {
        let snapshot = self.create_snapshot().await?;

        // Stream the snapshot's own contents: the live directory can gain
        // files (compaction) while we write.
        let mut rels: Vec<String> = Vec::new();
        for path in list_files_recursive(snapshot.to_str().unwrap_or_default()).await? {
            if let Ok(rel) = path.strip_prefix(&snapshot) {
                rels.push(rel.to_string_lossy().to_string());
            }
        }
        rels.sort();

        let mut n = 0_u64;
        let result = async {
            for rel in rels {
                let src = snapshot.join(&rel);
                let data = tokio::fs::read(&src).await?;

                w.write_u16(rel.len() as u16).await?;
                w.write_all(rel.as_bytes()).await?;
                w.write_u64(data.len() as u64).await?;
                w.write_all(&data).await?;
                n += 2 + rel.len() as u64 + 8 + data.len() as u64;
            }
            w.flush().await?;
            Ok::<u64, anyhow::Error>(n)
        }
        .await;

        let _ = tokio::fs::remove_dir_all(&snapshot).await;
        result
    }

    /// restore replaces the shard's index state from a write_to stream
    /// rooted at base_path, then reopens the shard.
    pub async fn restore<R: AsyncRead + Send + Unpin>(
        &self,
        r: &mut R,
        base_path: &str,
    ) -> anyhow::Result<()> {
        self.close().await?;

        loop {
            let path_len = match r.read_u16().await {
                Ok(v) => v as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let mut rel = vec![0_u8; path_len];
            r.read_exact(&mut rel).await.map_err(corrupt_stream)?;
            let rel = String::from_utf8(rel)
                .map_err(|_| IndexError::Corrupt("snapshot path".to_string()))?;
            if rel.contains("..") {
                return Err(IndexError::Corrupt("snapshot path escapes base".to_string()).into());
            }

            let size = r.read_u64().await.map_err(corrupt_stream)?;
            let mut data = vec![0_u8; size as usize];
            r.read_exact(&mut data).await.map_err(corrupt_stream)?;

            let dst = Path::new(base_path).join(&rel);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dst, &data).await?;
        }

        self.open().await
    }
}

fn corrupt_stream(e: std::io::Error) -> anyhow::Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        IndexError::Corrupt("truncated snapshot stream".to_string()).into()
    } else {
        e.into()
    }
}

/// dir_size sums file sizes under a directory tree.
async fn dir_size(root: &str) -> anyhow::Result<u64> {
    let mut total = 0_u64;
    for path in list_files_recursive(root).await? {
        total += tokio::fs::metadata(&path).await?.len();
    }
    Ok(total)
}

async fn list_files_recursive(root: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![PathBuf::from(root)];
    while let Some(dir) = stack.pop() {
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let ft = entry.file_type().await?;
            if ft.is_dir() {
                stack.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

/// monitor is the shard's single background worker: it recomputes disk
/// usage and warns as tag keys approach the max-values-per-tag limit.
/// Warnings fire once per threshold level per (measurement, tag key).
#[allow(clippy::too_many_arguments)]
async fn monitor(
    index: Arc<dyn Index>,
    stats: Arc<ShardStatistics>,
    opt: EngineOptions,
    path: String,
    wal_path: String,
    database: String,
    shard_id: u64,
    enabled: Arc<AtomicBool>,
    closing: CancellationToken,
) {
    let start = tokio::time::Instant::now();
    let mut size_tick =
        tokio::time::interval_at(start + MONITOR_STAT_INTERVAL, MONITOR_STAT_INTERVAL);
    let mut cardinality_tick = tokio::time::interval_at(
        start + MONITOR_CARDINALITY_INTERVAL,
        MONITOR_CARDINALITY_INTERVAL,
    );

    let mut warned: HashMap<(Vec<u8>, Vec<u8>), u8> = HashMap::new();

    loop {
        tokio::select! {
            _ = closing.cancelled() => return,
            _ = size_tick.tick() => {
                let total = async {
                    Ok::<u64, anyhow::Error>(dir_size(&path).await? + dir_size(&wal_path).await?)
                }
                .await;
                match total {
                    Ok(n) => stats.disk_bytes.store(n, Ordering::Relaxed),
                    Err(e) => error!(shard = shard_id, error = %e, "error collecting shard size"),
                }

                // Sealed or oversized logs get folded into an index file.
                // Disabling the shard pauses this.
                if enabled.load(Ordering::SeqCst) && index.compaction_needed() {
                    if let Err(e) = index.compact(closing.clone()).await {
                        error!(shard = shard_id, error = %e, "index compaction failed");
                    }
                }
            }
            _ = cardinality_tick.tick() => {
                let max = opt.config.max_values_per_tag;
                if max == 0 {
                    continue;
                }

                let names = match index.measurement_names() {
                    Ok(names) => names,
                    Err(e) => {
                        error!(shard = shard_id, error = %e, "error walking measurements");
                        continue;
                    }
                };
                for name in names {
                    let keys = match index.tag_keys(&name) {
                        Ok(keys) => keys,
                        Err(_) => continue,
                    };
                    for key in keys {
                        let n = match index.tag_value_cardinality(&name, &key) {
                            Ok(n) => n,
                            Err(_) => continue,
                        };
                        let perc = ((n * 100) / max).min(100);
                        let level = match perc {
                            80..=84 => 1_u8,
                            85..=89 => 2,
                            90..=100 => 3,
                            _ => 0,
                        };
                        if level == 0 {
                            continue;
                        }
                        let entry = warned.entry((name.clone(), key.clone())).or_insert(0);
                        if *entry < level {
                            *entry = level;
                            warn!(
                                shard = shard_id,
                                db = database.as_str(),
                                measurement = %String::from_utf8_lossy(&name),
                                tag = %String::from_utf8_lossy(&key),
                                percent = perc,
                                n,
                                max,
                                "max-values-per-tag limit approaching"
                            );
                        }
                    }
                }
            }
        }
    }
}
