use std::sync::Arc;

use parking_lot::Mutex;
use tsidb_storage::mmap::MmapFile;
use tsidb_storage::StorageOperator;

use crate::common::Section;
use crate::errors::IndexError;
use crate::index::tsi1::measurement_block::MeasurementBlock;
use crate::index::tsi1::series_block::SeriesBlock;
use crate::index::tsi1::tag_block::TagBlock;
use crate::index::tsi1::{FileLayer, TagKeyElem, TagValueElem};
use crate::index::{
    BoxMeasurementIterator, BoxSeriesIdIterator, MeasurementElem, MeasurementSliceIterator,
    SeriesIdSliceIterator,
};
use crate::series::series_file::SeriesFile;
use tsidb_utils::estimator::hll::Plus;
use tsidb_utils::estimator::Sketch;

/// INDEX_FILE_MAGIC identifies a TSI index file.
pub const INDEX_FILE_MAGIC: &'static str = "TSI1";

/// INDEX_FILE_VERSION is the current index file version.
pub const INDEX_FILE_VERSION: u16 = 1;

/// Trailer: sections for {measurement block, series block, measurement
/// sketch, tombstone sketch} followed by the version.
pub const INDEX_FILE_TRAILER_SIZE: usize = Section::SIZE * 4 + 2;

/// IndexFileTrailer locates the file's sections.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexFileTrailer {
    pub measurement_block: Section,
    pub series_block: Section,
    pub sketch: Section,
    pub t_sketch: Section,
}

impl IndexFileTrailer {
    /// read_from parses the trailer from the end of the file data.
    pub fn read_from(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < INDEX_FILE_MAGIC.len() + INDEX_FILE_TRAILER_SIZE {
            return Err(IndexError::Corrupt("index file trailer size".to_string()).into());
        }

        let version = u16::from_be_bytes(data[data.len() - 2..].try_into().unwrap());
        if version != INDEX_FILE_VERSION {
            return Err(
                IndexError::Corrupt(format!("unsupported index file version {}", version)).into(),
            );
        }

        let buf = &data[data.len() - INDEX_FILE_TRAILER_SIZE..];
        let (measurement_block, buf) = Section::read_from(buf)?;
        let (series_block, buf) = Section::read_from(buf)?;
        let (sketch, buf) = Section::read_from(buf)?;
        let (t_sketch, _) = Section::read_from(buf)?;

        Ok(Self {
            measurement_block,
            series_block,
            sketch,
            t_sketch,
        })
    }

    /// append_to writes the trailer onto the end of a file buffer.
    pub fn append_to(&self, dst: &mut Vec<u8>) {
        for section in [
            &self.measurement_block,
            &self.series_block,
            &self.sketch,
            &self.t_sketch,
        ] {
            dst.extend_from_slice(&section.offset.to_be_bytes());
            dst.extend_from_slice(&section.size.to_be_bytes());
        }
        dst.extend_from_slice(&INDEX_FILE_VERSION.to_be_bytes());
    }
}

/// IndexFile is an immutable, memory-mapped L1 index layer.
pub struct IndexFile {
    op: StorageOperator,
    sequence: u64,

    mmap: Arc<MmapFile>,
    sblk: SeriesBlock,
    mblk: MeasurementBlock,

    sketch: Mutex<Plus>,
    t_sketch: Mutex<Plus>,
}

impl IndexFile {
    /// open maps the file and parses its blocks. Any structural failure is
    /// a Corrupt error; the caller quarantines the file.
    pub async fn open(op: StorageOperator, sequence: u64) -> anyhow::Result<Self> {
        let mmap = Arc::new(MmapFile::open(op.path()).await?);
        let data = mmap.as_slice();

        if data.len() < INDEX_FILE_MAGIC.len()
            || &data[..INDEX_FILE_MAGIC.len()] != INDEX_FILE_MAGIC.as_bytes()
        {
            return Err(IndexError::Corrupt("invalid index file magic".to_string()).into());
        }

        let trailer = IndexFileTrailer::read_from(data)?;

        let sblk = SeriesBlock::new(mmap.clone(), trailer.series_block)?;
        let mblk = MeasurementBlock::new(mmap.clone(), trailer.measurement_block)?;

        let sketch = Plus::decode(trailer.sketch.slice_of(data)?)?;
        let t_sketch = Plus::decode(trailer.t_sketch.slice_of(data)?)?;

        Ok(Self {
            op,
            sequence,
            mmap,
            sblk,
            mblk,
            sketch: Mutex::new(sketch),
            t_sketch: Mutex::new(t_sketch),
        })
    }

    pub fn path(&self) -> &str {
        self.op.path()
    }

    pub fn op(&self) -> &StorageOperator {
        &self.op
    }

    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// lookup_series resolves a key to its series id through this file.
    pub fn lookup_series(&self, key: &[u8], sfile: &SeriesFile) -> Option<u64> {
        self.sblk.lookup(key, sfile)
    }

    /// series_keys returns every key in the series block.
    pub fn series_keys(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        self.sblk.keys()
    }

    /// measurement_sketch_counts returns (live, tombstoned) estimates.
    pub fn measurement_sketch_counts(&self) -> (u64, u64) {
        (self.sketch.lock().count(), self.t_sketch.lock().count())
    }

    /// merge_measurement_sketches merges this file's sketches into the
    /// given accumulators.
    pub fn merge_measurement_sketches(
        &self,
        live: &mut Plus,
        tombstone: &mut Plus,
    ) -> anyhow::Result<()> {
        live.merge(&self.sketch.lock())?;
        tombstone.merge(&self.t_sketch.lock())?;
        Ok(())
    }

    fn tag_block(&self, name: &[u8]) -> anyhow::Result<Option<TagBlock>> {
        let elem = match self.mblk.elem(name)? {
            Some(e) => e,
            None => return Ok(None),
        };
        if elem.deleted || elem.tag_block.size == 0 {
            return Ok(None);
        }
        Ok(Some(TagBlock::new(self.mmap.clone(), elem.tag_block)?))
    }
}

impl FileLayer for IndexFile {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn measurement_iterator(&self) -> BoxMeasurementIterator {
        let elems = match self.mblk.elems() {
            Ok(elems) => elems
                .into_iter()
                .map(|e| MeasurementElem {
                    name: e.name,
                    deleted: e.deleted,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        Box::new(MeasurementSliceIterator::new(elems))
    }

    fn measurement_elem(&self, name: &[u8]) -> Option<MeasurementElem> {
        match self.mblk.elem(name) {
            Ok(Some(e)) => Some(MeasurementElem {
                name: e.name,
                deleted: e.deleted,
            }),
            _ => None,
        }
    }

    fn measurement_series_id_iterator(&self, name: &[u8]) -> BoxSeriesIdIterator {
        let ids = match self.mblk.elem(name) {
            Ok(Some(e)) if !e.deleted => e.series_ids,
            _ => Vec::new(),
        };
        Box::new(SeriesIdSliceIterator::new(ids))
    }

    fn has_tag_value(&self, name: &[u8], key: &[u8], value: &[u8]) -> bool {
        match self.tag_block(name) {
            Ok(Some(blk)) => !blk
                .tag_value_series_ids(key, value)
                .unwrap_or_default()
                .is_empty(),
            _ => false,
        }
    }

    fn tag_keys(&self, name: &[u8]) -> Vec<TagKeyElem> {
        match self.tag_block(name) {
            Ok(Some(blk)) => blk
                .tag_keys()
                .unwrap_or_default()
                .into_iter()
                .map(|key| TagKeyElem {
                    key,
                    deleted: false,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn tag_values(&self, name: &[u8], key: &[u8]) -> Vec<TagValueElem> {
        match self.tag_block(name) {
            Ok(Some(blk)) => blk
                .tag_values(key)
                .unwrap_or_default()
                .into_iter()
                .map(|value| TagValueElem {
                    value,
                    deleted: false,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn tag_value_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> BoxSeriesIdIterator {
        let ids = match self.tag_block(name) {
            Ok(Some(blk)) => blk.tag_value_series_ids(key, value).unwrap_or_default(),
            _ => Vec::new(),
        };
        Box::new(SeriesIdSliceIterator::new(ids))
    }
}
