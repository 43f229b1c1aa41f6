use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use common_base::point::Tags;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::index::{
    BoxSeriesIdIterator, Index, SeriesIdSliceIterator,
};
use crate::series::series_file::SeriesFile;
use crate::series::series_key::parse_series_key;
use tsidb_utils::estimator::hll::Plus;
use tsidb_utils::estimator::Sketch;

/// MeasurementEntry holds a measurement's live series ids and its inverted
/// tag index. Ownership is arena-style: entries hold ids only, and the
/// series themselves live in the index's series table.
struct MeasurementEntry {
    /// All live series ids, ascending.
    series_ids: Vec<u64>,
    /// tag key → tag value → sorted posting list.
    series_by_tag_kv: BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u64>>>,
}

impl MeasurementEntry {
    fn new() -> Self {
        Self {
            series_ids: Vec::new(),
            series_by_tag_kv: BTreeMap::new(),
        }
    }

    fn add_series(&mut self, id: u64, tags: &Tags) {
        insert_sorted(&mut self.series_ids, id);
        for tag in tags.iter() {
            let values = self
                .series_by_tag_kv
                .entry(tag.key.clone())
                .or_insert_with(BTreeMap::new);
            let ids = values.entry(tag.value.clone()).or_insert_with(Vec::new);
            insert_sorted(ids, id);
        }
    }

    fn drop_series(&mut self, id: u64, tags: &Tags) {
        if let Ok(i) = self.series_ids.binary_search(&id) {
            self.series_ids.remove(i);
        }

        for tag in tags.iter() {
            let mut remove_key = false;
            if let Some(values) = self.series_by_tag_kv.get_mut(&tag.key) {
                let mut remove_value = false;
                if let Some(ids) = values.get_mut(&tag.value) {
                    if let Ok(i) = ids.binary_search(&id) {
                        ids.remove(i);
                    }
                    remove_value = ids.is_empty();
                }
                if remove_value {
                    values.remove(&tag.value);
                }
                remove_key = values.is_empty();
            }
            if remove_key {
                self.series_by_tag_kv.remove(&tag.key);
            }
        }
    }
}

/// insert_sorted appends the id, sorting in place only when the new id is
/// not already the largest. New ids are normally file offsets and therefore
/// the largest seen, so the common case is a plain append.
fn insert_sorted(ids: &mut Vec<u64>, id: u64) {
    match ids.last() {
        None => ids.push(id),
        Some(&last) if id > last => ids.push(id),
        _ => {
            if let Err(i) = ids.binary_search(&id) {
                ids.insert(i, id);
            }
        }
    }
}

struct SeriesEntry {
    name: Vec<u8>,
    tags: Tags,
}

#[derive(Default)]
struct Inner {
    measurements: HashMap<Vec<u8>, MeasurementEntry>,
    /// series key → live id.
    series: HashMap<Vec<u8>, u64>,
    series_by_id: HashMap<u64, SeriesEntry>,
}

impl Inner {
    fn insert_series(&mut self, id: u64, key: &[u8], name: &[u8], tags: &Tags) {
        // A recreated key replaces its older id everywhere.
        if let Some(&old) = self.series.get(key) {
            if old == id {
                return;
            }
            self.remove_series(old);
        }

        self.series.insert(key.to_vec(), id);
        self.series_by_id.insert(
            id,
            SeriesEntry {
                name: name.to_vec(),
                tags: tags.clone(),
            },
        );

        self.measurements
            .entry(name.to_vec())
            .or_insert_with(MeasurementEntry::new)
            .add_series(id, tags);
    }

    /// remove_series drops an id from all structures. Returns the name of
    /// the measurement that became empty, if any.
    fn remove_series(&mut self, id: u64) -> Option<Vec<u8>> {
        let entry = self.series_by_id.remove(&id)?;

        // Only clear the key mapping if it still points at this id; a
        // recreate may already have repointed it.
        let key = entry_key(&entry);
        if self.series.get(key.as_slice()) == Some(&id) {
            self.series.remove(key.as_slice());
        }

        let mut emptied = None;
        if let Some(mm) = self.measurements.get_mut(&entry.name) {
            mm.drop_series(id, &entry.tags);
            if mm.series_ids.is_empty() {
                self.measurements.remove(&entry.name);
                emptied = Some(entry.name.clone());
            }
        }
        emptied
    }
}

fn entry_key(entry: &SeriesEntry) -> Vec<u8> {
    crate::series::series_key::encode_series_key(&entry.name, &entry.tags)
}

/// InMemIndex is the authoritative live index backend. It persists nothing
/// itself: the series file is its durable backing, and the structures are
/// rebuilt from it on open.
pub struct InMemIndex {
    sfile: Arc<SeriesFile>,
    inner: RwLock<Inner>,

    s_sketch: Mutex<Plus>,
    s_t_sketch: Mutex<Plus>,
    m_sketch: Mutex<Plus>,
    m_t_sketch: Mutex<Plus>,
}

impl InMemIndex {
    pub fn new(sfile: Arc<SeriesFile>) -> Self {
        Self {
            sfile,
            inner: RwLock::new(Inner::default()),
            s_sketch: Mutex::new(Plus::new().expect("default precision")),
            s_t_sketch: Mutex::new(Plus::new().expect("default precision")),
            m_sketch: Mutex::new(Plus::new().expect("default precision")),
            m_t_sketch: Mutex::new(Plus::new().expect("default precision")),
        }
    }
}

#[async_trait]
impl Index for InMemIndex {
    async fn open(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        let mut malformed = 0_usize;
        self.sfile.visit_series(|id, key| {
            if self.sfile.is_deleted(id) {
                return Ok(());
            }
            match parse_series_key(key) {
                Ok((name, tags)) => {
                    let name = name.to_vec();
                    inner.insert_series(id, key, &name, &tags);
                    self.m_sketch.lock().add(&name);
                    self.s_sketch.lock().add(key);
                }
                Err(_) => malformed += 1,
            }
            Ok(())
        })?;
        if malformed > 0 {
            warn!(count = malformed, "skipped malformed series keys on open");
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_series_if_not_exists(
        &self,
        key: &[u8],
        name: &[u8],
        tags: &Tags,
    ) -> anyhow::Result<u64> {
        // Fast path: series already live.
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.series.get(key) {
                return Ok(id);
            }
        }

        let ids = self.sfile.create_series_list_if_not_exists(&[key]).await?;
        let id = ids[0];

        let mut inner = self.inner.write();
        let is_new_measurement = !inner.measurements.contains_key(name);
        inner.insert_series(id, key, name, tags);
        drop(inner);

        if is_new_measurement {
            self.m_sketch.lock().add(name);
        }
        self.s_sketch.lock().add(key);

        Ok(id)
    }

    async fn drop_series(&self, keys: &[&[u8]], _ts: i64) -> anyhow::Result<()> {
        for key in keys {
            let id = {
                let inner = self.inner.read();
                match inner.series.get(*key) {
                    Some(&id) => id,
                    None => continue,
                }
            };

            self.sfile.delete_series_id(id);

            let emptied = {
                let mut inner = self.inner.write();
                inner.remove_series(id)
            };
            self.s_t_sketch.lock().add(key);
            if let Some(name) = emptied {
                self.m_t_sketch.lock().add(&name);
            }
        }
        Ok(())
    }

    async fn drop_measurement(&self, name: &[u8]) -> anyhow::Result<()> {
        let ids: Vec<u64> = {
            let inner = self.inner.read();
            match inner.measurements.get(name) {
                Some(mm) => mm.series_ids.clone(),
                None => return Ok(()),
            }
        };

        {
            let mut inner = self.inner.write();
            for id in &ids {
                self.sfile.delete_series_id(*id);
                if let Some(entry) = inner.series_by_id.get(id) {
                    self.s_t_sketch.lock().add(&entry_key(entry));
                }
                inner.remove_series(*id);
            }
            inner.measurements.remove(name);
        }
        self.m_t_sketch.lock().add(name);

        Ok(())
    }

    fn series_n(&self) -> u64 {
        self.inner.read().series_by_id.len() as u64
    }

    fn measurement_exists(&self, name: &[u8]) -> anyhow::Result<bool> {
        Ok(self.inner.read().measurements.contains_key(name))
    }

    fn measurement_names(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        let inner = self.inner.read();
        let mut names: Vec<Vec<u8>> = inner.measurements.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn measurement_series_id_iterator(
        &self,
        name: &[u8],
    ) -> anyhow::Result<BoxSeriesIdIterator> {
        let inner = self.inner.read();
        let ids = inner
            .measurements
            .get(name)
            .map(|mm| mm.series_ids.clone())
            .unwrap_or_default();
        Ok(Box::new(SeriesIdSliceIterator::new(ids)))
    }

    fn tag_key_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
    ) -> anyhow::Result<BoxSeriesIdIterator> {
        let inner = self.inner.read();
        let mut ids = Vec::new();
        if let Some(values) = inner
            .measurements
            .get(name)
            .and_then(|mm| mm.series_by_tag_kv.get(key))
        {
            for posting in values.values() {
                ids.extend_from_slice(posting);
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(Box::new(SeriesIdSliceIterator::new(ids)))
    }

    fn tag_value_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> anyhow::Result<BoxSeriesIdIterator> {
        let inner = self.inner.read();
        let ids = inner
            .measurements
            .get(name)
            .and_then(|mm| mm.series_by_tag_kv.get(key))
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(SeriesIdSliceIterator::new(ids)))
    }

    fn tag_keys(&self, name: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let inner = self.inner.read();
        Ok(inner
            .measurements
            .get(name)
            .map(|mm| mm.series_by_tag_kv.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn tag_values(&self, name: &[u8], key: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let inner = self.inner.read();
        Ok(inner
            .measurements
            .get(name)
            .and_then(|mm| mm.series_by_tag_kv.get(key))
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn has_tag_value(&self, name: &[u8], key: &[u8], value: &[u8]) -> anyhow::Result<bool> {
        let inner = self.inner.read();
        Ok(inner
            .measurements
            .get(name)
            .and_then(|mm| mm.series_by_tag_kv.get(key))
            .map(|values| values.contains_key(value))
            .unwrap_or(false))
    }

    fn tag_value_cardinality(&self, name: &[u8], key: &[u8]) -> anyhow::Result<u64> {
        let inner = self.inner.read();
        Ok(inner
            .measurements
            .get(name)
            .and_then(|mm| mm.series_by_tag_kv.get(key))
            .map(|values| values.len() as u64)
            .unwrap_or(0))
    }

    fn measurement_sketch_counts(&self) -> anyhow::Result<(u64, u64)> {
        Ok((self.m_sketch.lock().count(), self.m_t_sketch.lock().count()))
    }

    fn series_sketch_counts(&self) -> anyhow::Result<(u64, u64)> {
        Ok((self.s_sketch.lock().count(), self.s_t_sketch.lock().count()))
    }

    fn compaction_needed(&self) -> bool {
        false
    }

    async fn compact(&self, _token: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common_base::iterator::TryIterator;
    use tsidb_storage::StorageOperator;

    use super::*;
    use crate::series::series_file::SERIES_FILE_NAME;
    use crate::series::series_key::encode_series_key;

    async fn open_index(dir: &std::path::Path) -> (Arc<SeriesFile>, InMemIndex) {
        let path = dir.join(SERIES_FILE_NAME);
        let op = StorageOperator::root(path.to_str().unwrap()).unwrap();
        let sfile = Arc::new(SeriesFile::open(op, 1 << 20).await.unwrap());
        let index = InMemIndex::new(sfile.clone());
        index.open().await.unwrap();
        (sfile, index)
    }

    async fn create(index: &InMemIndex, name: &[u8], pairs: Vec<(&[u8], &[u8])>) -> u64 {
        let tags = Tags::from_pairs(pairs);
        let key = encode_series_key(name, &tags);
        index
            .create_series_if_not_exists(&key, name, &tags)
            .await
            .unwrap()
    }

    fn collect(mut itr: BoxSeriesIdIterator) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(e) = itr.try_next().unwrap() {
            out.push(e.series_id);
        }
        out
    }

    #[tokio::test]
    async fn test_create_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let (_sfile, index) = open_index(dir.as_ref()).await;

        let id1 = create(&index, b"cpu", vec![(b"host", b"a"), (b"region", b"us")]).await;
        let id2 = create(&index, b"cpu", vec![(b"host", b"b"), (b"region", b"us")]).await;
        let id3 = create(&index, b"mem", vec![(b"host", b"a")]).await;

        assert_eq!(index.series_n(), 3);
        assert_eq!(
            index.measurement_names().unwrap(),
            vec![b"cpu".to_vec(), b"mem".to_vec()]
        );

        assert_eq!(
            collect(index.measurement_series_id_iterator(b"cpu").unwrap()),
            vec![id1, id2]
        );
        assert_eq!(
            collect(
                index
                    .tag_value_series_id_iterator(b"cpu", b"region", b"us")
                    .unwrap()
            ),
            vec![id1, id2]
        );
        assert_eq!(
            collect(
                index
                    .tag_value_series_id_iterator(b"cpu", b"host", b"a")
                    .unwrap()
            ),
            vec![id1]
        );
        assert_eq!(
            collect(index.tag_key_series_id_iterator(b"mem", b"host").unwrap()),
            vec![id3]
        );

        assert_eq!(
            index.tag_keys(b"cpu").unwrap(),
            vec![b"host".to_vec(), b"region".to_vec()]
        );
        assert_eq!(index.tag_value_cardinality(b"cpu", b"host").unwrap(), 2);
        assert!(index.has_tag_value(b"cpu", b"host", b"a").unwrap());
        assert!(!index.has_tag_value(b"cpu", b"host", b"z").unwrap());
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_sfile, index) = open_index(dir.as_ref()).await;

        let id1 = create(&index, b"cpu", vec![(b"host", b"a")]).await;
        let id2 = create(&index, b"cpu", vec![(b"host", b"a")]).await;
        assert_eq!(id1, id2);
        assert_eq!(index.series_n(), 1);
    }

    #[tokio::test]
    async fn test_drop_series_removes_postings_and_empty_measurement() {
        let dir = tempfile::tempdir().unwrap();
        let (sfile, index) = open_index(dir.as_ref()).await;

        let tags = Tags::from_pairs(vec![(b"host".as_slice(), b"a".as_slice())]);
        let key = encode_series_key(b"cpu", &tags);
        let id = index
            .create_series_if_not_exists(&key, b"cpu", &tags)
            .await
            .unwrap();

        index.drop_series(&[key.as_slice()], 0).await.unwrap();

        assert_eq!(index.series_n(), 0);
        assert!(!index.measurement_exists(b"cpu").unwrap());
        assert!(collect(index.measurement_series_id_iterator(b"cpu").unwrap()).is_empty());
        assert!(sfile.is_deleted(id));
    }

    #[tokio::test]
    async fn test_drop_then_recreate_gets_new_id() {
        let dir = tempfile::tempdir().unwrap();
        let (_sfile, index) = open_index(dir.as_ref()).await;

        let old = create(&index, b"cpu", vec![(b"host", b"a")]).await;
        let tags = Tags::from_pairs(vec![(b"host".as_slice(), b"a".as_slice())]);
        let key = encode_series_key(b"cpu", &tags);
        index.drop_series(&[key.as_slice()], 0).await.unwrap();

        let new = create(&index, b"cpu", vec![(b"host", b"a")]).await;
        assert!(new > old);
        assert_eq!(
            collect(index.measurement_series_id_iterator(b"cpu").unwrap()),
            vec![new]
        );
    }

    #[tokio::test]
    async fn test_rebuild_from_series_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (sfile, index) = open_index(dir.as_ref()).await;
            create(&index, b"cpu", vec![(b"host", b"a")]).await;
            create(&index, b"mem", vec![]).await;
            sfile.close().await.unwrap();
        }

        let (_sfile, index) = open_index(dir.as_ref()).await;
        assert_eq!(index.series_n(), 2);
        assert!(index.measurement_exists(b"cpu").unwrap());
        assert!(index.measurement_exists(b"mem").unwrap());
    }

    #[tokio::test]
    async fn test_drop_measurement() {
        let dir = tempfile::tempdir().unwrap();
        let (_sfile, index) = open_index(dir.as_ref()).await;

        create(&index, b"cpu", vec![(b"host", b"a")]).await;
        create(&index, b"cpu", vec![(b"host", b"b")]).await;
        create(&index, b"mem", vec![]).await;

        index.drop_measurement(b"cpu").await.unwrap();
        assert!(!index.measurement_exists(b"cpu").unwrap());
        assert_eq!(index.series_n(), 1);
        assert_eq!(index.measurement_names().unwrap(), vec![b"mem".to_vec()]);
    }
}
