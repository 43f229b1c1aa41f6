use std::collections::HashSet;

use tsidb_storage::mmap::MmapFile;
use tsidb_storage::StorageOperator;
use tsidb_utils::rhh;
use tsidb_utils::rhh::{dist, hash_key};

use crate::series::series_key::read_series_key;

/// SERIES_MAP_LOAD_FACTOR is the load factor the on-disk map is sized for.
const SERIES_MAP_LOAD_FACTOR: u64 = 90;

/// Header: entry count + the series file offset the map covers up to.
const SERIES_MAP_COUNT_SIZE: usize = 8;
const SERIES_MAP_MAX_OFFSET_SIZE: usize = 8;
pub(crate) const SERIES_MAP_HEADER_SIZE: usize = SERIES_MAP_COUNT_SIZE + SERIES_MAP_MAX_OFFSET_SIZE;

/// Each slot holds the key hash and the series file offset.
pub(crate) const SERIES_MAP_ELEM_SIZE: usize = 8 + 8;

/// SeriesIndex maps series keys to series file offsets. It is a read-only
/// on-disk robin-hood map covering everything up to `max_offset`, plus an
/// in-memory overflow for keys appended since the last rebuild, plus the
/// tombstone set for deleted series ids.
pub struct SeriesIndex {
    data: Option<MmapFile>,
    n: u64,
    max_offset: u64,
    capacity: u64,
    mask: u64,

    inmem: rhh::HashMap<u64>,
    tombstones: HashSet<u64>,
}

impl SeriesIndex {
    /// open reads the on-disk map header if the map file exists. Keys written
    /// after the map's max offset are indexed by the caller via `insert`.
    pub async fn open(op: StorageOperator) -> anyhow::Result<Self> {
        let mut idx = Self {
            data: None,
            n: 0,
            max_offset: 1,
            capacity: 0,
            mask: 0,
            inmem: rhh::HashMap::new(rhh::Options::default()),
            tombstones: HashSet::new(),
        };

        if op.exist().await? {
            let data = MmapFile::open(op.path()).await?;
            if data.len() >= SERIES_MAP_HEADER_SIZE {
                let buf = data.as_slice();
                idx.n = u64::from_le_bytes(buf[0..8].try_into().unwrap());
                idx.max_offset = u64::from_le_bytes(buf[8..16].try_into().unwrap());
                idx.capacity =
                    ((data.len() - SERIES_MAP_HEADER_SIZE) / SERIES_MAP_ELEM_SIZE) as u64;
                idx.mask = idx.capacity.wrapping_sub(1);
                idx.data = Some(data);
            }
        }

        Ok(idx)
    }

    /// count returns the number of keys in the index, on-disk and in-memory.
    /// A recreated key counts twice; the caller nets out tombstones.
    pub fn count(&self) -> u64 {
        self.n + self.inmem.len()
    }

    pub fn tombstone_count(&self) -> u64 {
        self.tombstones.len() as u64
    }

    /// in_mem_count returns the number of keys appended since the last rebuild.
    pub fn in_mem_count(&self) -> u64 {
        self.inmem.len()
    }

    /// max_offset returns the series file offset the on-disk map covers up to.
    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    /// insert records a key appended to the series file at `offset`.
    pub fn insert(&mut self, key: &[u8], offset: u64) {
        self.inmem.put(key, offset);
    }

    pub fn delete(&mut self, id: u64) {
        self.tombstones.insert(id);
    }

    pub fn is_deleted(&self, id: u64) -> bool {
        self.tombstones.contains(&id)
    }

    /// find_offset_by_key resolves a key to its live series id. Tombstoned
    /// ids read as absent so a recreate assigns a fresh id. The in-memory
    /// overflow is consulted first: it shadows the on-disk map after a
    /// recreate.
    pub fn find_offset_by_key(&self, series_data: &[u8], key: &[u8]) -> Option<u64> {
        if let Some(offset) = self.inmem.get(key) {
            if !self.is_deleted(*offset) {
                return Some(*offset);
            }
            return None;
        }

        let offset = self.on_disk_offset(series_data, key)?;
        if self.is_deleted(offset) {
            return None;
        }
        Some(offset)
    }

    fn on_disk_offset(&self, series_data: &[u8], key: &[u8]) -> Option<u64> {
        let data = self.data.as_ref()?.as_slice();
        if self.capacity == 0 {
            return None;
        }

        let hash = hash_key(key);
        let mut pos = hash & self.mask;
        let mut d = 0_u64;
        loop {
            let at = SERIES_MAP_HEADER_SIZE + (pos as usize) * SERIES_MAP_ELEM_SIZE;
            let elem = &data[at..at + SERIES_MAP_ELEM_SIZE];

            let h = u64::from_le_bytes(elem[0..8].try_into().unwrap());
            if h == 0 || d > dist(h, pos, self.capacity) {
                return None;
            }
            if h == hash {
                let v = u64::from_le_bytes(elem[8..16].try_into().unwrap());
                if let Some(stored) = series_key_at(series_data, v) {
                    if stored == key {
                        return Some(v);
                    }
                }
            }

            pos = (pos + 1) & self.mask;
            d += 1;
            if d > self.capacity {
                return None;
            }
        }
    }

    /// adopt_tombstones moves the tombstone set from a prior index into
    /// this one, used when swapping in a freshly rebuilt map.
    pub(crate) fn adopt_tombstones(&mut self, from: &mut SeriesIndex) {
        self.tombstones = std::mem::take(&mut from.tombstones);
    }
}

/// series_key_at reads the full encoded key at a series file offset.
fn series_key_at(series_data: &[u8], offset: u64) -> Option<&[u8]> {
    if offset == 0 || offset as usize >= series_data.len() {
        return None;
    }
    read_series_key(&series_data[offset as usize..])
        .ok()
        .map(|(key, _)| key)
}

/// encode_series_map builds the on-disk map image for all keys in the
/// series file data (offset 1 through the end of `src`).
pub(crate) fn encode_series_map(src: &[u8]) -> Vec<u8> {
    // Index every key so duplicates (recreated series) collapse to the
    // newest offset before sizing the table.
    let mut m = rhh::HashMap::new(rhh::Options {
        capacity: 256,
        load_factor: SERIES_MAP_LOAD_FACTOR,
    });

    let mut offset = 1_u64;
    let mut b = &src[1.min(src.len())..];
    while !b.is_empty() {
        let (key, rest) = match read_series_key(b) {
            Ok(v) => v,
            Err(_) => break,
        };
        m.put(key, offset);
        offset += key.len() as u64;
        b = rest;
    }

    let capacity = m.cap();
    let mut buf =
        vec![0_u8; SERIES_MAP_HEADER_SIZE + (capacity as usize) * SERIES_MAP_ELEM_SIZE];
    buf[0..8].copy_from_slice(&m.len().to_le_bytes());
    buf[8..16].copy_from_slice(&(src.len() as u64).to_le_bytes());

    for i in 0..capacity {
        if let Some((key, v)) = m.elem(i) {
            let at = SERIES_MAP_HEADER_SIZE + (i as usize) * SERIES_MAP_ELEM_SIZE;
            buf[at..at + 8].copy_from_slice(&hash_key(key).to_le_bytes());
            buf[at + 8..at + 16].copy_from_slice(&v.to_le_bytes());
        }
    }

    buf
}
