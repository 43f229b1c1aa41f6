use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common_base::point::Tags;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tsidb_storage::file::WritableFile;
use tsidb_storage::mmap::MmapFile;
use tsidb_storage::{StorageOperator, Writable};

use crate::errors::IndexError;
use crate::series::series_index::{encode_series_map, SeriesIndex};
use crate::series::series_key::{parse_series_key, read_series_key};

/// SERIES_FILE_NAME is the file name of the series file within a shard dir.
pub const SERIES_FILE_NAME: &'static str = "series.sfile";

/// SERIES_MAP_SUFFIX is appended to the series file name for the on-disk map.
pub const SERIES_MAP_SUFFIX: &'static str = ".map";

/// DEFAULT_MAX_SERIES_FILE_SIZE is the maximum size of the series file.
pub const DEFAULT_MAX_SERIES_FILE_SIZE: u64 = 32 * (1 << 30); // 32GB

/// SERIES_MAP_THRESHOLD is the number of series to hold in the in-memory
/// series map before compacting and rebuilding the on-disk map.
pub const SERIES_MAP_THRESHOLD: u64 = 100_000;

/// SeriesFile is the append-only file of all distinct series keys in a
/// shard. A series id is the byte offset of its key in this file; offset 0
/// holds a padding byte so id 0 always means "absent". Ids are never reused:
/// recreating a deleted series appends the key again at a new offset.
///
/// Reads go straight to a fixed-size memory map that observes appends
/// without remapping; only the key→offset index takes a lock.
pub struct SeriesFile {
    op: StorageOperator,
    max_size: u64,

    data: Arc<MmapFile>,
    size: AtomicU64,
    index: RwLock<SeriesIndex>,

    /// Single appender; also serializes map rebuilds.
    append: tokio::sync::Mutex<WritableFile>,
}

impl SeriesFile {
    /// open maps the series file, ensuring the offset-0 padding byte exists,
    /// and indexes any keys appended since the on-disk map was built.
    pub async fn open(op: StorageOperator, max_size: u64) -> anyhow::Result<Self> {
        let path = op.path().to_string();

        let mut file = WritableFile::open(&path).await?;
        let mut size = tokio::fs::metadata(&path).await?.len();
        if size == 0 {
            file.append(&[0]).await?;
            file.sync().await?;
            size = 1;
        }

        let data = MmapFile::open_sized(&path, max_size as usize).await?;

        let mut index =
            SeriesIndex::open(op.to_op(&format!("{}{}", path, SERIES_MAP_SUFFIX))).await?;

        // Index all keys created after the on-disk map.
        let mut offset = index.max_offset();
        while offset < size {
            let buf = &data.as_slice()[offset as usize..size as usize];
            let (key, _) = read_series_key(buf)?;
            let len = key.len() as u64;
            index.insert(key, offset);
            offset += len;
        }

        Ok(Self {
            op,
            max_size,
            data: Arc::new(data),
            size: AtomicU64::new(size),
            index: RwLock::new(index),
            append: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &str {
        self.op.path()
    }

    /// size returns the number of committed bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// series_count returns the exact number of live series.
    pub fn series_count(&self) -> u64 {
        let index = self.index.read();
        index.count() - index.tombstone_count()
    }

    /// create_series_list_if_not_exists resolves or appends the given keys,
    /// returning the series id for each. Keys must be canonically encoded.
    pub async fn create_series_list_if_not_exists(
        &self,
        keys: &[&[u8]],
    ) -> anyhow::Result<Vec<u64>> {
        let mut offsets = vec![0_u64; keys.len()];

        // Find existing series under the read lock.
        let mut create_required = false;
        {
            let size = self.size();
            let index = self.index.read();
            for (i, key) in keys.iter().enumerate() {
                offsets[i] = index
                    .find_offset_by_key(&self.data.as_slice()[..size as usize], key)
                    .unwrap_or(0);
                if offsets[i] == 0 {
                    create_required = true;
                }
            }
        }
        if !create_required {
            return Ok(offsets);
        }

        // Appends are serialized; re-check each key before writing it.
        let mut file = self.append.lock().await;
        let mut size = self.size();
        let mut new_key_ranges = Vec::new();
        let mut pending: std::collections::HashMap<&[u8], u64> = std::collections::HashMap::new();

        for (i, key) in keys.iter().enumerate() {
            if offsets[i] != 0 {
                continue;
            }

            // A duplicate key earlier in this batch already has an offset.
            if let Some(offset) = pending.get(*key) {
                offsets[i] = *offset;
                continue;
            }

            // Re-attempt lookup now that we're the only appender.
            if let Some(offset) = self
                .index
                .read()
                .find_offset_by_key(&self.data.as_slice()[..size as usize], key)
            {
                offsets[i] = offset;
                continue;
            }

            if size + key.len() as u64 > self.max_size {
                return Err(IndexError::SeriesFileMaxSize.into());
            }

            file.append(key).await?;
            offsets[i] = size;
            new_key_ranges.push((i, size));
            pending.insert(*key, size);
            size += key.len() as u64;
        }

        file.sync().await?;

        // Publish: index the new keys, then advance the committed size.
        {
            let mut index = self.index.write();
            for (i, offset) in &new_key_ranges {
                index.insert(keys[*i], *offset);
            }
        }
        self.size.store(size, Ordering::Release);

        // Rebuild the on-disk map once the overflow crosses the threshold.
        if self.index.read().in_mem_count() >= SERIES_MAP_THRESHOLD {
            self.compact_series_map(size).await?;
        }

        Ok(offsets)
    }

    /// compact_series_map rebuilds the on-disk key→offset map covering all
    /// data up to `size`. Must be called with the append lock held.
    async fn compact_series_map(&self, size: u64) -> anyhow::Result<()> {
        let map_path = format!("{}{}", self.op.path(), SERIES_MAP_SUFFIX);
        let buf = encode_series_map(&self.data.as_slice()[..size as usize]);

        // Write the new map beside the old one; rename only after fsync so
        // a failure partway leaves the previous map intact.
        let tmp_path = format!("{}.compacting", map_path);
        {
            let mut f = tokio::fs::File::create(&tmp_path).await?;
            f.write_all(&buf).await?;
            f.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &map_path).await?;

        let mut next = SeriesIndex::open(self.op.to_op(&map_path)).await?;
        let mut index = self.index.write();
        next.adopt_tombstones(&mut index);
        *index = next;

        Ok(())
    }

    /// offset_of returns the live series id for an encoded key, or None.
    pub fn offset_of(&self, key: &[u8]) -> Option<u64> {
        let size = self.size() as usize;
        let index = self.index.read();
        index.find_offset_by_key(&self.data.as_slice()[..size], key)
    }

    pub fn has_series(&self, key: &[u8]) -> bool {
        self.offset_of(key).is_some()
    }

    /// series_key returns the encoded key stored at a series id, including
    /// its length prefix. Tombstoned ids still resolve; deletion is logical.
    pub fn series_key(&self, offset: u64) -> Option<&[u8]> {
        let size = self.size();
        if offset == 0 || offset >= size {
            return None;
        }
        let buf = &self.data.as_slice()[offset as usize..size as usize];
        read_series_key(buf).ok().map(|(key, _)| key)
    }

    /// series returns the parsed name and tags for a series id.
    pub fn series(&self, offset: u64) -> Option<(&[u8], Tags)> {
        let key = self.series_key(offset)?;
        parse_series_key(key).ok()
    }

    /// delete_series_id flags a series as deleted. Reclaim is logical only;
    /// the key bytes stay in the file.
    pub fn delete_series_id(&self, id: u64) {
        self.index.write().delete(id);
    }

    pub fn is_deleted(&self, id: u64) -> bool {
        self.index.read().is_deleted(id)
    }

    /// visit_series walks every key in the file in id order, tombstoned or
    /// not, invoking f with (id, encoded key).
    pub fn visit_series<F>(&self, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(u64, &[u8]) -> anyhow::Result<()>,
    {
        let size = self.size() as usize;
        let mut offset = 1_usize;
        while offset < size {
            let (key, _) = read_series_key(&self.data.as_slice()[offset..size])?;
            f(offset as u64, key)?;
            offset += key.len();
        }
        Ok(())
    }

    /// close flushes the append handle. Maps are released on drop.
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut file = self.append.lock().await;
        file.flush().await?;
        file.sync().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common_base::point::Tags;
    use tsidb_storage::StorageOperator;

    use super::*;
    use crate::series::series_key::encode_series_key;

    async fn open_series_file(dir: &std::path::Path) -> SeriesFile {
        let path = dir.join(SERIES_FILE_NAME);
        let op = StorageOperator::root(path.to_str().unwrap()).unwrap();
        SeriesFile::open(op, 1 << 20).await.unwrap()
    }

    fn key(name: &[u8], pairs: Vec<(&[u8], &[u8])>) -> Vec<u8> {
        encode_series_key(name, &Tags::from_pairs(pairs))
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let f = open_series_file(dir.as_ref()).await;

        let k1 = key(b"cpu", vec![(b"host", b"a")]);
        let k2 = key(b"cpu", vec![(b"host", b"b")]);

        let ids = f
            .create_series_list_if_not_exists(&[&k1, &k2])
            .await
            .unwrap();
        assert_ne!(ids[0], 0);
        assert_ne!(ids[1], 0);
        assert_ne!(ids[0], ids[1]);

        // Idempotent.
        let again = f
            .create_series_list_if_not_exists(&[&k2, &k1])
            .await
            .unwrap();
        assert_eq!(again, vec![ids[1], ids[0]]);

        assert_eq!(f.series_count(), 2);
        assert_eq!(f.series_key(ids[0]), Some(k1.as_slice()));
        assert_eq!(f.offset_of(&k2), Some(ids[1]));

        let (name, tags) = f.series(ids[1]).unwrap();
        assert_eq!(name, b"cpu");
        assert_eq!(tags.get(b"host"), Some(b"b".as_slice()));
    }

    #[tokio::test]
    async fn test_id_equals_file_offset_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let k1 = key(b"cpu", vec![(b"host", b"a")]);

        let ids = {
            let f = open_series_file(dir.as_ref()).await;
            let ids = f.create_series_list_if_not_exists(&[&k1]).await.unwrap();
            // First key lands right after the padding byte.
            assert_eq!(ids[0], 1);
            f.close().await.unwrap();
            ids
        };

        let f = open_series_file(dir.as_ref()).await;
        assert_eq!(f.series_count(), 1);
        assert_eq!(f.offset_of(&k1), Some(ids[0]));
    }

    #[tokio::test]
    async fn test_delete_then_recreate_assigns_larger_id() {
        let dir = tempfile::tempdir().unwrap();
        let f = open_series_file(dir.as_ref()).await;

        let k1 = key(b"cpu", vec![(b"host", b"a")]);
        let old = f.create_series_list_if_not_exists(&[&k1]).await.unwrap()[0];

        f.delete_series_id(old);
        assert!(f.is_deleted(old));
        assert_eq!(f.offset_of(&k1), None);
        assert_eq!(f.series_count(), 0);

        let new = f.create_series_list_if_not_exists(&[&k1]).await.unwrap()[0];
        assert!(new > old, "recreated id {} must exceed {}", new, old);
        assert_eq!(f.series_count(), 1);
    }

    #[tokio::test]
    async fn test_max_size_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join(SERIES_FILE_NAME);
        let op = StorageOperator::root(path.to_str().unwrap()).unwrap();
        let f = SeriesFile::open(op, 32).await.unwrap();

        let k1 = key(b"a-very-long-measurement-name", vec![(b"host", b"a")]);
        let err = f.create_series_list_if_not_exists(&[&k1]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::SeriesFileMaxSize)
        ));
    }

    #[tokio::test]
    async fn test_visit_series_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let f = open_series_file(dir.as_ref()).await;

        let k1 = key(b"cpu", vec![(b"host", b"a")]);
        let k2 = key(b"mem", vec![]);
        f.create_series_list_if_not_exists(&[&k1, &k2])
            .await
            .unwrap();

        let mut seen = Vec::new();
        f.visit_series(|id, key| {
            seen.push((id, key.to_vec()));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen.len(), 2);
        assert!(seen[0].0 < seen[1].0);
        assert_eq!(seen[0].1, k1);
        assert_eq!(seen[1].1, k2);
    }
}
