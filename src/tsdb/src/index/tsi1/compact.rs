use std::collections::BTreeMap;
use std::sync::Arc;

use common_base::iterator::TryIterator;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tsidb_storage::StorageOperator;

use crate::common::Section;
use crate::errors::IndexError;
use crate::index::tsi1::index_file::{IndexFile, IndexFileTrailer, INDEX_FILE_MAGIC};
use crate::index::tsi1::log_file::LogFile;
use crate::index::tsi1::measurement_block::MeasurementBlockWriter;
use crate::index::tsi1::series_block::SeriesBlockWriter;
use crate::index::tsi1::tag_block::TagBlockWriter;
use crate::index::tsi1::{
    merge_tag_keys, merge_tag_values, FileLayer, BUILDING_FILE_SUFFIX,
};
use crate::index::{merge_measurement_iterators, merge_series_id_iterators, BoxSeriesIdIterator};
use crate::series::series_file::SeriesFile;
use crate::series::series_key::compare_series_keys;
use tsidb_utils::estimator::hll::Plus;
use tsidb_utils::estimator::Sketch;

struct CompactedMeasurement {
    name: Vec<u8>,
    deleted: bool,
    ids: Vec<u64>,
    tags: BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u64>>>,
}

/// compact_index_files merges log and index layers into a new immutable
/// index file at dst. The output is staged under a `.building` suffix,
/// fsynced, then renamed into place, so a restart mid-compaction leaves
/// either the old state or the complete new file. Tombstoned series are
/// dropped from every posting list; tombstoned measurements are carried
/// with their flag so they keep shadowing older files.
pub async fn compact_index_files(
    dst: StorageOperator,
    logs: &[Arc<LogFile>],
    files: &[Arc<IndexFile>],
    sfile: &Arc<SeriesFile>,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    // Layers ordered newest first: every log precedes every index file.
    let mut layers: Vec<&dyn FileLayer> = Vec::with_capacity(logs.len() + files.len());
    let mut logs_sorted: Vec<&Arc<LogFile>> = logs.iter().collect();
    logs_sorted.sort_by_key(|l| std::cmp::Reverse(l.sequence()));
    let mut files_sorted: Vec<&Arc<IndexFile>> = files.iter().collect();
    files_sorted.sort_by_key(|f| std::cmp::Reverse(f.sequence()));
    for log in &logs_sorted {
        layers.push(log.as_ref());
    }
    for file in &files_sorted {
        layers.push(file.as_ref());
    }

    // Pass 1: merge every layer into per-measurement structures.
    let measurements = collect_measurements(&layers, sfile, token)?;

    // Pass 2: assemble the file: magic, series block, tag blocks,
    // measurement block, sketches, trailer.
    let mut buf: Vec<u8> = Vec::new();
    buf.extend_from_slice(INDEX_FILE_MAGIC.as_bytes());

    let mut trailer = IndexFileTrailer::default();

    // Series block first, keys in series-key order.
    let mut series_entries: Vec<(Vec<u8>, u64)> = Vec::new();
    for mm in &measurements {
        for id in &mm.ids {
            if let Some(key) = sfile.series_key(*id) {
                series_entries.push((key.to_vec(), *id));
            }
        }
    }
    series_entries.sort_by(|a, b| compare_series_keys(&a.0, &b.0));

    let mut sblk = SeriesBlockWriter::new();
    for (key, id) in &series_entries {
        sblk.add(key, *id);
    }
    trailer.series_block = sblk.append_to(&mut buf);

    // One tag block per live measurement, then the measurement block.
    let mut mblk = MeasurementBlockWriter::new();
    for mm in &measurements {
        if token.is_cancelled() {
            return Err(IndexError::Cancelled.into());
        }

        let mut tag_section = Section::default();
        if !mm.deleted && !mm.tags.is_empty() {
            let mut tblk = TagBlockWriter::new();
            for (key, values) in &mm.tags {
                for (value, ids) in values {
                    tblk.add_tag_value(key, value, ids.clone());
                }
            }
            tag_section = tblk.append_to(&mut buf);
        }

        mblk.add(&mm.name, mm.deleted, tag_section, mm.ids.clone());
    }
    trailer.measurement_block = mblk.append_to(&mut buf);

    // Sketches: merge the source files' sketches, then add what the log
    // layers contributed.
    let mut sketch = Plus::new()?;
    let mut t_sketch = Plus::new()?;
    for file in &files_sorted {
        file.merge_measurement_sketches(&mut sketch, &mut t_sketch)?;
    }
    for mm in &measurements {
        if mm.deleted {
            t_sketch.add(&mm.name);
        } else {
            sketch.add(&mm.name);
        }
    }

    let sketch_offset = buf.len() as u64;
    let encoded = sketch.encode()?;
    buf.extend_from_slice(&encoded);
    trailer.sketch = Section::new(sketch_offset, encoded.len() as u64);

    let t_sketch_offset = buf.len() as u64;
    let encoded = t_sketch.encode()?;
    buf.extend_from_slice(&encoded);
    trailer.t_sketch = Section::new(t_sketch_offset, encoded.len() as u64);

    trailer.append_to(&mut buf);

    // Stage, fsync, rename.
    let building_path = format!("{}{}", dst.path(), BUILDING_FILE_SUFFIX);
    {
        let mut f = tokio::fs::File::create(&building_path).await?;
        f.write_all(&buf).await?;
        f.sync_all().await?;
    }
    tokio::fs::rename(&building_path, dst.path()).await?;

    info!(
        path = dst.path(),
        measurements = measurements.len(),
        series = series_entries.len(),
        bytes = buf.len(),
        "compacted index file"
    );

    Ok(())
}

/// collect_measurements merges the layers into fully materialized
/// measurement structures with tombstoned series filtered out.
fn collect_measurements(
    layers: &[&dyn FileLayer],
    sfile: &Arc<SeriesFile>,
    token: &CancellationToken,
) -> anyhow::Result<Vec<CompactedMeasurement>> {
    let mut out = Vec::new();

    let mut mitr =
        merge_measurement_iterators(layers.iter().map(|l| l.measurement_iterator()).collect());

    while let Some(elem) = mitr.try_next()? {
        if token.is_cancelled() {
            return Err(IndexError::Cancelled.into());
        }

        if elem.deleted {
            out.push(CompactedMeasurement {
                name: elem.name,
                deleted: true,
                ids: Vec::new(),
                tags: BTreeMap::new(),
            });
            continue;
        }

        let ids = collect_live_ids(
            layers
                .iter()
                .map(|l| l.measurement_series_id_iterator(&elem.name))
                .collect(),
            sfile,
        )?;
        if ids.is_empty() {
            // Every series was dropped without an explicit measurement
            // tombstone; nothing to carry forward.
            continue;
        }

        let mut tags: BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u64>>> = BTreeMap::new();
        let keys = merge_tag_keys(layers.iter().map(|l| l.tag_keys(&elem.name)).collect());
        for key_elem in keys {
            if key_elem.deleted {
                continue;
            }
            let values = merge_tag_values(
                layers
                    .iter()
                    .map(|l| l.tag_values(&elem.name, &key_elem.key))
                    .collect(),
            );

            let mut value_map = BTreeMap::new();
            for value_elem in values {
                if value_elem.deleted {
                    continue;
                }
                let ids = collect_live_ids(
                    layers
                        .iter()
                        .map(|l| {
                            l.tag_value_series_id_iterator(
                                &elem.name,
                                &key_elem.key,
                                &value_elem.value,
                            )
                        })
                        .collect(),
                    sfile,
                )?;
                if !ids.is_empty() {
                    value_map.insert(value_elem.value, ids);
                }
            }
            if !value_map.is_empty() {
                tags.insert(key_elem.key, value_map);
            }
        }

        out.push(CompactedMeasurement {
            name: elem.name,
            deleted: false,
            ids,
            tags,
        });
    }

    Ok(out)
}

/// collect_live_ids merges posting iterators and filters tombstoned series.
fn collect_live_ids(
    itrs: Vec<BoxSeriesIdIterator>,
    sfile: &Arc<SeriesFile>,
) -> anyhow::Result<Vec<u64>> {
    let mut itr = merge_series_id_iterators(itrs);
    let mut ids = Vec::new();
    while let Some(elem) = itr.try_next()? {
        if !sfile.is_deleted(elem.series_id) {
            ids.push(elem.series_id);
        }
    }
    Ok(ids)
}
