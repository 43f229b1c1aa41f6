use std::collections::BTreeMap;
use std::sync::Arc;

use tsidb_storage::mmap::MmapFile;
use tsidb_utils::rhh::{dist, hash_key};

use crate::codec::varint::{append_uvarint, VarInt};
use crate::common::Section;
use crate::errors::IndexError;
use crate::index::tsi1::{append_hash_index, read_hash_index_capacity, read_hash_index_slot};

/// A tag block holds one measurement's inverted tag index.
///
/// Layout:
/// ```text
/// 0x00 padding (no meaningful offset is zero)
/// for each tag key, sorted:
///     value records, sorted by value:
///         uvarint vlen ‖ value ‖ uvarint series n ‖ n × u64be series id
///     value hash index: value → value record offset
///     key record: uvarint klen ‖ key ‖ u64be value index offset ‖
///                 u64be value index size ‖ uvarint value count
/// key hash index: key → key record offset
/// internal trailer: {data section, hash section}
/// ```
/// All offsets are block-relative.

pub const TAG_BLOCK_TRAILER_SIZE: usize = Section::SIZE * 2;

/// TagBlockWriter accumulates a measurement's tag set and encodes the block.
pub struct TagBlockWriter {
    sets: BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u64>>>,
}

impl TagBlockWriter {
    pub fn new() -> Self {
        Self {
            sets: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// add_tag_value registers a posting list. Ids must be ascending.
    pub fn add_tag_value(&mut self, key: &[u8], value: &[u8], ids: Vec<u64>) {
        self.sets
            .entry(key.to_vec())
            .or_insert_with(BTreeMap::new)
            .insert(value.to_vec(), ids);
    }

    /// append_to encodes the block onto dst and returns its section.
    pub fn append_to(&self, dst: &mut Vec<u8>) -> Section {
        let block_offset = dst.len() as u64;
        let rel = |abs: u64| abs - block_offset;

        // Padding byte.
        dst.push(0);

        let mut key_entries: Vec<(Vec<u8>, u64)> = Vec::with_capacity(self.sets.len());

        for (key, values) in &self.sets {
            // Value records.
            let mut value_entries: Vec<(Vec<u8>, u64)> = Vec::with_capacity(values.len());
            for (value, ids) in values {
                value_entries.push((value.clone(), rel(dst.len() as u64)));
                append_uvarint(dst, value.len() as u64);
                dst.extend_from_slice(value);
                append_uvarint(dst, ids.len() as u64);
                for id in ids {
                    dst.extend_from_slice(&id.to_be_bytes());
                }
            }

            // Per-key value hash index.
            let value_index_offset = rel(dst.len() as u64);
            append_hash_index(dst, &value_entries);
            let value_index_size = rel(dst.len() as u64) - value_index_offset;

            // Key record.
            key_entries.push((key.clone(), rel(dst.len() as u64)));
            append_uvarint(dst, key.len() as u64);
            dst.extend_from_slice(key);
            dst.extend_from_slice(&value_index_offset.to_be_bytes());
            dst.extend_from_slice(&value_index_size.to_be_bytes());
            append_uvarint(dst, values.len() as u64);
        }

        let data = Section::new(0, rel(dst.len() as u64));

        // Key hash index.
        let hash_offset = rel(dst.len() as u64);
        append_hash_index(dst, &key_entries);
        let hash = Section::new(hash_offset, rel(dst.len() as u64) - hash_offset);

        // Internal trailer.
        dst.extend_from_slice(&data.offset.to_be_bytes());
        dst.extend_from_slice(&data.size.to_be_bytes());
        dst.extend_from_slice(&hash.offset.to_be_bytes());
        dst.extend_from_slice(&hash.size.to_be_bytes());

        Section::new(block_offset, dst.len() as u64 - block_offset)
    }
}

struct TagBlockKeyElem {
    value_index: Section,
    value_n: u64,
}

/// TagBlock is a read-only view over one measurement's tag block.
pub struct TagBlock {
    mmap: Arc<MmapFile>,
    section: Section,
    hash: Section,
}

impl TagBlock {
    pub fn new(mmap: Arc<MmapFile>, section: Section) -> anyhow::Result<Self> {
        let buf = section.slice_of(mmap.as_slice())?;
        if buf.len() < TAG_BLOCK_TRAILER_SIZE + 1 {
            return Err(IndexError::Corrupt("tag block trailer".to_string()).into());
        }

        let trailer = &buf[buf.len() - TAG_BLOCK_TRAILER_SIZE..];
        let (_data, trailer) = Section::read_from(trailer)?;
        let (mut hash, _) = Section::read_from(trailer)?;
        hash.offset += section.offset;

        let block = Self {
            mmap,
            section,
            hash,
        };
        block.hash.slice_of(block.mmap.as_slice())?;
        Ok(block)
    }

    fn block(&self) -> &[u8] {
        // Sections were validated in new().
        self.section
            .slice_of(self.mmap.as_slice())
            .expect("validated section")
    }

    /// parse_key_record reads a key record at a block-relative offset.
    fn parse_key_record(&self, offset: u64) -> anyhow::Result<(&[u8], TagBlockKeyElem)> {
        let buf = self.block();
        let at = offset as usize;
        if at == 0 || at >= buf.len() {
            return Err(IndexError::Corrupt("tag key record offset".to_string()).into());
        }
        let buf = &buf[at..];

        let (klen, n) =
            u64::decode_var(buf).ok_or(IndexError::Corrupt("tag key len".to_string()))?;
        let buf = &buf[n..];
        if buf.len() < klen as usize + 16 {
            return Err(IndexError::ShortBuffer.into());
        }
        let key = &buf[..klen as usize];
        let buf = &buf[klen as usize..];

        let value_index_offset = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let value_index_size = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let buf = &buf[16..];
        let (value_n, _) =
            u64::decode_var(buf).ok_or(IndexError::Corrupt("tag value count".to_string()))?;

        Ok((
            key,
            TagBlockKeyElem {
                value_index: Section::new(value_index_offset, value_index_size),
                value_n,
            },
        ))
    }

    /// parse_value_record reads a value record at a block-relative offset.
    fn parse_value_record(&self, offset: u64) -> anyhow::Result<(&[u8], Vec<u64>)> {
        let buf = self.block();
        let at = offset as usize;
        if at == 0 || at >= buf.len() {
            return Err(IndexError::Corrupt("tag value record offset".to_string()).into());
        }
        let buf = &buf[at..];

        let (vlen, n) =
            u64::decode_var(buf).ok_or(IndexError::Corrupt("tag value len".to_string()))?;
        let buf = &buf[n..];
        if buf.len() < vlen as usize {
            return Err(IndexError::ShortBuffer.into());
        }
        let value = &buf[..vlen as usize];
        let buf = &buf[vlen as usize..];

        let (id_n, n) =
            u64::decode_var(buf).ok_or(IndexError::Corrupt("posting count".to_string()))?;
        let buf = &buf[n..];
        if buf.len() < id_n as usize * 8 {
            return Err(IndexError::ShortBuffer.into());
        }
        let mut ids = Vec::with_capacity(id_n as usize);
        for i in 0..id_n as usize {
            ids.push(u64::from_be_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap()));
        }

        Ok((value, ids))
    }

    fn key_elem(&self, key: &[u8]) -> anyhow::Result<Option<TagBlockKeyElem>> {
        let hash_data = self.hash.slice_of(self.mmap.as_slice())?;
        let capacity = match read_hash_index_capacity(hash_data) {
            Some(c) if c > 0 => c,
            _ => return Ok(None),
        };
        let mask = capacity - 1;

        let hash = hash_key(key);
        let mut pos = hash & mask;
        let mut d = 0_u64;
        loop {
            let offset = match read_hash_index_slot(hash_data, pos) {
                Some(v) => v,
                None => return Ok(None),
            };
            if offset == 0 {
                return Ok(None);
            }

            let (candidate, elem) = self.parse_key_record(offset)?;
            if candidate == key {
                return Ok(Some(elem));
            }
            if d > dist(hash_key(candidate), pos, capacity) {
                return Ok(None);
            }

            pos = (pos + 1) & mask;
            d += 1;
            if d > capacity {
                return Ok(None);
            }
        }
    }

    /// has_tag_key reports whether the measurement carries the key.
    pub fn has_tag_key(&self, key: &[u8]) -> anyhow::Result<bool> {
        Ok(self.key_elem(key)?.is_some())
    }

    /// tag_keys returns all tag keys, sorted.
    pub fn tag_keys(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        let hash_data = self.hash.slice_of(self.mmap.as_slice())?;
        let capacity = read_hash_index_capacity(hash_data).unwrap_or(0);

        let mut keys = Vec::new();
        for i in 0..capacity {
            if let Some(offset) = read_hash_index_slot(hash_data, i) {
                if offset != 0 {
                    let (key, _) = self.parse_key_record(offset)?;
                    keys.push(key.to_vec());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// tag_values returns all values of a key, sorted.
    pub fn tag_values(&self, key: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let elem = match self.key_elem(key)? {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };

        let mut abs = elem.value_index;
        abs.offset += self.section.offset;
        let hash_data = abs.slice_of(self.mmap.as_slice())?;
        let capacity = read_hash_index_capacity(hash_data).unwrap_or(0);

        let mut values = Vec::with_capacity(elem.value_n as usize);
        for i in 0..capacity {
            if let Some(offset) = read_hash_index_slot(hash_data, i) {
                if offset != 0 {
                    let (value, _) = self.parse_value_record(offset)?;
                    values.push(value.to_vec());
                }
            }
        }
        values.sort();
        Ok(values)
    }

    /// tag_value_series_ids returns the posting list for (key, value).
    pub fn tag_value_series_ids(&self, key: &[u8], value: &[u8]) -> anyhow::Result<Vec<u64>> {
        let elem = match self.key_elem(key)? {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };

        let mut abs = elem.value_index;
        abs.offset += self.section.offset;
        let hash_data = abs.slice_of(self.mmap.as_slice())?;
        let capacity = match read_hash_index_capacity(hash_data) {
            Some(c) if c > 0 => c,
            _ => return Ok(Vec::new()),
        };
        let mask = capacity - 1;

        let hash = hash_key(value);
        let mut pos = hash & mask;
        let mut d = 0_u64;
        loop {
            let offset = match read_hash_index_slot(hash_data, pos) {
                Some(v) => v,
                None => return Ok(Vec::new()),
            };
            if offset == 0 {
                return Ok(Vec::new());
            }

            let (candidate, ids) = self.parse_value_record(offset)?;
            if candidate == value {
                return Ok(ids);
            }
            if d > dist(hash_key(candidate), pos, capacity) {
                return Ok(Vec::new());
            }

            pos = (pos + 1) & mask;
            d += 1;
            if d > capacity {
                return Ok(Vec::new());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn build_block(w: &TagBlockWriter, dir: &std::path::Path) -> TagBlock {
        let mut buf = vec![0_u8; 4];
        let section = w.append_to(&mut buf);

        let path = dir.join("tag_block_test");
        tokio::fs::write(&path, &buf).await.unwrap();
        let mmap = Arc::new(MmapFile::open(&path).await.unwrap());
        TagBlock::new(mmap, section).unwrap()
    }

    #[tokio::test]
    async fn test_write_and_lookup() {
        let dir = tempfile::tempdir().unwrap();

        let mut w = TagBlockWriter::new();
        w.add_tag_value(b"host", b"a", vec![1, 5]);
        w.add_tag_value(b"host", b"b", vec![2]);
        w.add_tag_value(b"region", b"us", vec![1, 2, 5]);

        let blk = build_block(&w, dir.as_ref()).await;

        assert_eq!(blk.tag_keys().unwrap(), vec![b"host".to_vec(), b"region".to_vec()]);
        assert_eq!(
            blk.tag_values(b"host").unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(blk.tag_value_series_ids(b"host", b"a").unwrap(), vec![1, 5]);
        assert_eq!(blk.tag_value_series_ids(b"host", b"b").unwrap(), vec![2]);
        assert_eq!(
            blk.tag_value_series_ids(b"region", b"us").unwrap(),
            vec![1, 2, 5]
        );

        assert!(blk.has_tag_key(b"host").unwrap());
        assert!(!blk.has_tag_key(b"nope").unwrap());
        assert!(blk.tag_value_series_ids(b"host", b"z").unwrap().is_empty());
        assert!(blk.tag_values(b"nope").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_many_values_probe_correctly() {
        let dir = tempfile::tempdir().unwrap();

        let mut w = TagBlockWriter::new();
        for i in 0..500_u64 {
            w.add_tag_value(b"host", format!("host-{:03}", i).as_bytes(), vec![i + 1]);
        }
        let blk = build_block(&w, dir.as_ref()).await;

        assert_eq!(blk.tag_values(b"host").unwrap().len(), 500);
        for i in 0..500_u64 {
            let ids = blk
                .tag_value_series_ids(b"host", format!("host-{:03}", i).as_bytes())
                .unwrap();
            assert_eq!(ids, vec![i + 1]);
        }
    }
}
