use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::series::series_key::parse_series_key_measurement;

/// EncodedPoint is the write-path handoff record: a canonical series key,
/// a timestamp, and the field payload encoded by the measurement's codec.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedPoint {
    pub series_key: Vec<u8>,
    pub timestamp: i64,
    pub fields: Vec<u8>,
}

/// PointStore is the durable point storage engine a shard delegates to.
/// Its internals (value block compression, TSM files, the point WAL) are
/// outside the index subsystem; the shard only depends on this interface.
#[async_trait]
pub trait PointStore: Send + Sync {
    async fn open(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;

    /// write_points persists a batch of encoded points.
    async fn write_points(&self, points: &[EncodedPoint]) -> anyhow::Result<()>;

    /// delete_series_range removes stored values for the given series keys
    /// within [min, max].
    async fn delete_series_range(
        &self,
        keys: &[&[u8]],
        min: i64,
        max: i64,
    ) -> anyhow::Result<()>;

    /// delete_measurement removes all stored values of a measurement.
    async fn delete_measurement(&self, name: &[u8]) -> anyhow::Result<()>;
}

/// MemPointStore keeps points in memory. It exists so the shard and its
/// tests have a collaborator; production deployments plug in a real engine.
#[derive(Default)]
pub struct MemPointStore {
    data: RwLock<BTreeMap<Vec<u8>, BTreeMap<i64, Vec<u8>>>>,
}

impl MemPointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// point_n returns the number of stored points.
    pub fn point_n(&self) -> usize {
        self.data.read().values().map(|s| s.len()).sum()
    }

    /// values returns the stored (timestamp, fields) pairs for a series key.
    pub fn values(&self, series_key: &[u8]) -> Vec<(i64, Vec<u8>)> {
        self.data
            .read()
            .get(series_key)
            .map(|s| s.iter().map(|(t, v)| (*t, v.clone())).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PointStore for MemPointStore {
    async fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn write_points(&self, points: &[EncodedPoint]) -> anyhow::Result<()> {
        let mut data = self.data.write();
        for p in points {
            data.entry(p.series_key.clone())
                .or_insert_with(BTreeMap::new)
                .insert(p.timestamp, p.fields.clone());
        }
        Ok(())
    }

    async fn delete_series_range(
        &self,
        keys: &[&[u8]],
        min: i64,
        max: i64,
    ) -> anyhow::Result<()> {
        let mut data = self.data.write();
        for key in keys {
            if let Some(series) = data.get_mut(*key) {
                series.retain(|t, _| *t < min || *t > max);
                if series.is_empty() {
                    data.remove(*key);
                }
            }
        }
        Ok(())
    }

    async fn delete_measurement(&self, name: &[u8]) -> anyhow::Result<()> {
        let mut data = self.data.write();
        data.retain(|key, _| {
            parse_series_key_measurement(key)
                .map(|m| m != name)
                .unwrap_or(true)
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_store_write_delete() {
        let store = MemPointStore::new();
        let key = crate::series::series_key::encode_series_key(
            b"cpu",
            &common_base::point::Tags::default(),
        );

        store
            .write_points(&[
                EncodedPoint {
                    series_key: key.clone(),
                    timestamp: 1,
                    fields: vec![1],
                },
                EncodedPoint {
                    series_key: key.clone(),
                    timestamp: 5,
                    fields: vec![2],
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.point_n(), 2);

        store
            .delete_series_range(&[key.as_slice()], 2, 10)
            .await
            .unwrap();
        assert_eq!(store.values(&key), vec![(1, vec![1])]);

        store.delete_measurement(b"cpu").await.unwrap();
        assert_eq!(store.point_n(), 0);
    }
}
