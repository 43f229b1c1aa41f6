use std::collections::BTreeMap;
use std::sync::Arc;

use tsidb_storage::mmap::MmapFile;
use tsidb_utils::rhh::{dist, hash_key};

use crate::codec::varint::{append_uvarint, VarInt};
use crate::common::Section;
use crate::errors::IndexError;
use crate::index::tsi1::{append_hash_index, read_hash_index_capacity, read_hash_index_slot};

/// Measurement flag constants.
pub const MEASUREMENT_TOMBSTONE_FLAG: u8 = 0x01;

/// 1 byte offset for the block to ensure non-zero offsets.
pub const MEASUREMENT_FILL_SIZE: usize = 1;

/// Internal trailer: data section + hash section.
pub const MEASUREMENT_BLOCK_TRAILER_SIZE: usize = Section::SIZE * 2;

/// The measurement block lists every measurement with its tag block
/// location and series posting list.
///
/// Layout:
/// ```text
/// 0x00 padding
/// for each measurement, sorted by name:
///     u8 flags ‖ u64be tag block offset ‖ u64be tag block size ‖
///     uvarint name len ‖ name ‖ uvarint series n ‖ n × u64be series id
/// hash index: name → record offset
/// internal trailer: {data section, hash section}
/// ```
/// Record offsets are block-relative; tag block sections are file-absolute.

struct MeasurementRecord {
    deleted: bool,
    tag_block: Section,
    series_ids: Vec<u64>,
}

/// MeasurementBlockWriter accumulates measurements and encodes the block.
pub struct MeasurementBlockWriter {
    mms: BTreeMap<Vec<u8>, MeasurementRecord>,
}

impl MeasurementBlockWriter {
    pub fn new() -> Self {
        Self {
            mms: BTreeMap::new(),
        }
    }

    /// add registers a measurement with its tag block section and postings.
    pub fn add(&mut self, name: &[u8], deleted: bool, tag_block: Section, series_ids: Vec<u64>) {
        self.mms.insert(
            name.to_vec(),
            MeasurementRecord {
                deleted,
                tag_block,
                series_ids,
            },
        );
    }

    /// append_to encodes the block onto dst and returns its section.
    pub fn append_to(&self, dst: &mut Vec<u8>) -> Section {
        let block_offset = dst.len() as u64;
        let rel = |abs: u64| abs - block_offset;

        // Padding byte.
        dst.push(0);

        let mut entries: Vec<(Vec<u8>, u64)> = Vec::with_capacity(self.mms.len());
        for (name, mm) in &self.mms {
            entries.push((name.clone(), rel(dst.len() as u64)));

            let mut flags = 0_u8;
            if mm.deleted {
                flags |= MEASUREMENT_TOMBSTONE_FLAG;
            }
            dst.push(flags);
            dst.extend_from_slice(&mm.tag_block.offset.to_be_bytes());
            dst.extend_from_slice(&mm.tag_block.size.to_be_bytes());
            append_uvarint(dst, name.len() as u64);
            dst.extend_from_slice(name);
            append_uvarint(dst, mm.series_ids.len() as u64);
            for id in &mm.series_ids {
                dst.extend_from_slice(&id.to_be_bytes());
            }
        }

        let data = Section::new(0, rel(dst.len() as u64));

        let hash_offset = rel(dst.len() as u64);
        append_hash_index(dst, &entries);
        let hash = Section::new(hash_offset, rel(dst.len() as u64) - hash_offset);

        dst.extend_from_slice(&data.offset.to_be_bytes());
        dst.extend_from_slice(&data.size.to_be_bytes());
        dst.extend_from_slice(&hash.offset.to_be_bytes());
        dst.extend_from_slice(&hash.size.to_be_bytes());

        Section::new(block_offset, dst.len() as u64 - block_offset)
    }
}

/// MeasurementBlockElem is a decoded measurement record.
#[derive(Clone, Debug)]
pub struct MeasurementBlockElem {
    pub name: Vec<u8>,
    pub deleted: bool,
    pub tag_block: Section,
    pub series_ids: Vec<u64>,
    /// Encoded size, for sequential iteration.
    size: usize,
}

impl MeasurementBlockElem {
    /// decode parses one record from the front of buf.
    fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let start = buf.len();
        if buf.len() < 17 {
            return Err(IndexError::ShortBuffer.into());
        }

        let flags = buf[0];
        let tag_offset = u64::from_be_bytes(buf[1..9].try_into().unwrap());
        let tag_size = u64::from_be_bytes(buf[9..17].try_into().unwrap());
        let buf = &buf[17..];

        let (name_len, n) =
            u64::decode_var(buf).ok_or(IndexError::Corrupt("measurement name len".to_string()))?;
        let buf = &buf[n..];
        if buf.len() < name_len as usize {
            return Err(IndexError::ShortBuffer.into());
        }
        let name = buf[..name_len as usize].to_vec();
        let buf = &buf[name_len as usize..];

        let (series_n, n) =
            u64::decode_var(buf).ok_or(IndexError::Corrupt("measurement series n".to_string()))?;
        let buf = &buf[n..];
        if buf.len() < series_n as usize * 8 {
            return Err(IndexError::ShortBuffer.into());
        }
        let mut series_ids = Vec::with_capacity(series_n as usize);
        for i in 0..series_n as usize {
            series_ids.push(u64::from_be_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap()));
        }
        let buf = &buf[series_n as usize * 8..];

        Ok(Self {
            name,
            deleted: flags & MEASUREMENT_TOMBSTONE_FLAG != 0,
            tag_block: Section::new(tag_offset, tag_size),
            series_ids,
            size: start - buf.len(),
        })
    }
}

/// MeasurementBlock is a read-only view over the measurement block.
pub struct MeasurementBlock {
    mmap: Arc<MmapFile>,
    data: Section,
    hash: Section,
}

impl MeasurementBlock {
    pub fn new(mmap: Arc<MmapFile>, section: Section) -> anyhow::Result<Self> {
        let buf = section.slice_of(mmap.as_slice())?;
        if buf.len() < MEASUREMENT_BLOCK_TRAILER_SIZE + MEASUREMENT_FILL_SIZE {
            return Err(IndexError::Corrupt("measurement block trailer".to_string()).into());
        }

        let trailer = &buf[buf.len() - MEASUREMENT_BLOCK_TRAILER_SIZE..];
        let (mut data, trailer) = Section::read_from(trailer)?;
        let (mut hash, _) = Section::read_from(trailer)?;
        data.offset += section.offset;
        hash.offset += section.offset;

        let block = Self { mmap, data, hash };
        block.data.slice_of(block.mmap.as_slice())?;
        block.hash.slice_of(block.mmap.as_slice())?;
        Ok(block)
    }

    /// elem looks a measurement up by name.
    pub fn elem(&self, name: &[u8]) -> anyhow::Result<Option<MeasurementBlockElem>> {
        let data = self.data.slice_of(self.mmap.as_slice())?;
        let hash_data = self.hash.slice_of(self.mmap.as_slice())?;
        let capacity = match read_hash_index_capacity(hash_data) {
            Some(c) if c > 0 => c,
            _ => return Ok(None),
        };
        let mask = capacity - 1;

        let hash = hash_key(name);
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
            if offset as usize >= data.len() {
                return Err(IndexError::Corrupt("measurement offset".to_string()).into());
            }

            let elem = MeasurementBlockElem::decode(&data[offset as usize..])?;
            if elem.name == name {
                return Ok(Some(elem));
            }
            if d > dist(hash_key(&elem.name), pos, capacity) {
                return Ok(None);
            }

            pos = (pos + 1) & mask;
            d += 1;
            if d > capacity {
                return Ok(None);
            }
        }
    }

    /// elems walks all measurement records in name order.
    pub fn elems(&self) -> anyhow::Result<Vec<MeasurementBlockElem>> {
        let data = self.data.slice_of(self.mmap.as_slice())?;
        let mut buf = &data[MEASUREMENT_FILL_SIZE..];

        let mut out = Vec::new();
        while !buf.is_empty() {
            let elem = MeasurementBlockElem::decode(buf)?;
            buf = &buf[elem.size..];
            out.push(elem);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_lookup() {
        let dir = tempfile::tempdir().unwrap();

        let mut w = MeasurementBlockWriter::new();
        w.add(b"cpu", false, Section::new(100, 50), vec![1, 9, 30]);
        w.add(b"mem", true, Section::new(150, 20), vec![]);
        w.add(b"disk", false, Section::new(170, 25), vec![4]);

        let mut buf = vec![0_u8; 4];
        let section = w.append_to(&mut buf);

        let path = dir.as_ref().join("measurement_block_test");
        tokio::fs::write(&path, &buf).await.unwrap();
        let mmap = Arc::new(MmapFile::open(&path).await.unwrap());
        let blk = MeasurementBlock::new(mmap, section).unwrap();

        let cpu = blk.elem(b"cpu").unwrap().unwrap();
        assert!(!cpu.deleted);
        assert_eq!(cpu.tag_block, Section::new(100, 50));
        assert_eq!(cpu.series_ids, vec![1, 9, 30]);

        let mem = blk.elem(b"mem").unwrap().unwrap();
        assert!(mem.deleted);
        assert!(mem.series_ids.is_empty());

        assert!(blk.elem(b"nope").unwrap().is_none());

        let elems = blk.elems().unwrap();
        let names: Vec<Vec<u8>> = elems.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![b"cpu".to_vec(), b"disk".to_vec(), b"mem".to_vec()]);
    }
}
