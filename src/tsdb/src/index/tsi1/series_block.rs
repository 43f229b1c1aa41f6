use std::sync::Arc;

use tsidb_storage::mmap::MmapFile;
use tsidb_utils::rhh::{dist, hash_key};

use crate::common::Section;
use crate::errors::IndexError;
use crate::index::tsi1::{append_hash_index, read_hash_index_capacity, read_hash_index_slot};
use crate::series::series_file::SeriesFile;
use crate::series::series_key::read_series_key;

/// The series block is a concatenation of encoded series keys plus a hash
/// index keyed by series key. Hash slot values are series ids; since a
/// series id is its series file offset, probes compare the candidate's key
/// through the series file.
///
/// Block layout: `keys ‖ hash index ‖ internal trailer{data, hash}`.

/// Internal trailer: data section + hash section.
pub const SERIES_BLOCK_TRAILER_SIZE: usize = Section::SIZE * 2;

/// SeriesBlockWriter accumulates (key, id) pairs and encodes the block.
pub struct SeriesBlockWriter {
    entries: Vec<(Vec<u8>, u64)>,
}

impl SeriesBlockWriter {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// add registers a series. Keys must be added in series-key order.
    pub fn add(&mut self, key: &[u8], id: u64) {
        self.entries.push((key.to_vec(), id));
    }

    pub fn series_n(&self) -> usize {
        self.entries.len()
    }

    /// append_to encodes the block onto dst, returning the block's section
    /// relative to the start of dst's file.
    pub fn append_to(&self, dst: &mut Vec<u8>) -> Section {
        let block_offset = dst.len() as u64;

        // Data section: concatenated keys.
        let data_offset = dst.len() as u64;
        for (key, _) in &self.entries {
            dst.extend_from_slice(key);
        }
        let data = Section::new(data_offset - block_offset, dst.len() as u64 - data_offset);

        // Hash index: key → series id.
        let hash_offset = dst.len() as u64;
        append_hash_index(dst, &self.entries);
        let hash = Section::new(hash_offset - block_offset, dst.len() as u64 - hash_offset);

        // Internal trailer.
        dst.extend_from_slice(&data.offset.to_be_bytes());
        dst.extend_from_slice(&data.size.to_be_bytes());
        dst.extend_from_slice(&hash.offset.to_be_bytes());
        dst.extend_from_slice(&hash.size.to_be_bytes());

        Section::new(block_offset, dst.len() as u64 - block_offset)
    }
}

/// SeriesBlock is a read-only view over a series block within a mapped
/// index file.
pub struct SeriesBlock {
    mmap: Arc<MmapFile>,
    section: Section,
    data: Section,
    hash: Section,
}

impl SeriesBlock {
    /// new parses the block's internal trailer. Sections inside are
    /// block-relative; the view keeps them file-absolute.
    pub fn new(mmap: Arc<MmapFile>, section: Section) -> anyhow::Result<Self> {
        let buf = section.slice_of(mmap.as_slice())?;
        if buf.len() < SERIES_BLOCK_TRAILER_SIZE {
            return Err(IndexError::Corrupt("series block trailer".to_string()).into());
        }

        let trailer = &buf[buf.len() - SERIES_BLOCK_TRAILER_SIZE..];
        let (mut data, trailer) = Section::read_from(trailer)?;
        let (mut hash, _) = Section::read_from(trailer)?;
        data.offset += section.offset;
        hash.offset += section.offset;

        let block = Self {
            mmap,
            section,
            data,
            hash,
        };
        // Validate sections eagerly so later reads cannot run off the map.
        block.data.slice_of(block.mmap.as_slice())?;
        block.hash.slice_of(block.mmap.as_slice())?;
        Ok(block)
    }

    pub fn section(&self) -> Section {
        self.section
    }

    /// lookup probes the hash index for a key, comparing candidates through
    /// the series file, and returns the series id.
    pub fn lookup(&self, key: &[u8], sfile: &SeriesFile) -> Option<u64> {
        let hash_data = self.hash.slice_of(self.mmap.as_slice()).ok()?;
        let capacity = read_hash_index_capacity(hash_data)?;
        if capacity == 0 {
            return None;
        }
        let mask = capacity - 1;

        let hash = hash_key(key);
        let mut pos = hash & mask;
        let mut d = 0_u64;
        loop {
            let id = read_hash_index_slot(hash_data, pos)?;
            if id == 0 {
                return None;
            }

            if let Some(candidate) = sfile.series_key(id) {
                if candidate == key {
                    return Some(id);
                }
                // Halt once we've probed further than the candidate did.
                if d > dist(hash_key(candidate), pos, capacity) {
                    return None;
                }
            }

            pos = (pos + 1) & mask;
            d += 1;
            if d > capacity {
                return None;
            }
        }
    }

    /// keys walks the data section, yielding every encoded key.
    pub fn keys(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut buf = self.data.slice_of(self.mmap.as_slice())?;
        let mut out = Vec::new();
        while !buf.is_empty() {
            let (key, rest) = read_series_key(buf)?;
            out.push(key.to_vec());
            buf = rest;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use common_base::point::Tags;
    use tsidb_storage::StorageOperator;

    use super::*;
    use crate::series::series_file::SERIES_FILE_NAME;
    use crate::series::series_key::encode_series_key;

    #[tokio::test]
    async fn test_write_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join(SERIES_FILE_NAME);
        let op = StorageOperator::root(path.to_str().unwrap()).unwrap();
        let sfile = SeriesFile::open(op, 1 << 20).await.unwrap();

        let mut keys = Vec::new();
        for host in ["a", "b", "c"] {
            let tags = Tags::from_pairs(vec![(b"host".as_slice(), host.as_bytes())]);
            keys.push(encode_series_key(b"cpu", &tags));
        }
        let key_refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let ids = sfile
            .create_series_list_if_not_exists(&key_refs)
            .await
            .unwrap();

        let mut w = SeriesBlockWriter::new();
        for (key, id) in keys.iter().zip(&ids) {
            w.add(key, *id);
        }

        let mut file_buf = vec![0_u8; 4]; // stand-in for the magic
        let section = w.append_to(&mut file_buf);

        let blk_path = dir.as_ref().join("series_block_test");
        tokio::fs::write(&blk_path, &file_buf).await.unwrap();
        let mmap = Arc::new(MmapFile::open(&blk_path).await.unwrap());

        let blk = SeriesBlock::new(mmap, section).unwrap();
        for (key, id) in keys.iter().zip(&ids) {
            assert_eq!(blk.lookup(key, &sfile), Some(*id));
        }
        let missing = encode_series_key(b"cpu", &Tags::from_pairs(vec![(b"host".as_slice(), b"z".as_slice())]));
        assert_eq!(blk.lookup(&missing, &sfile), None);

        assert_eq!(blk.keys().unwrap(), keys);
    }
}
