pub mod eval;
pub mod inmem;
pub mod tsi1;

use std::sync::Arc;

use common_base::influxql::{BinaryOp, Expr};
use common_base::iterator::TryIterator;
use common_base::point::Tags;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, IndexType};
use crate::errors::IndexError;
use crate::series::series_file::SeriesFile;
use tsidb_storage::StorageOperator;

/// SeriesIdElem couples a series id with an optional residual expression:
/// the sub-predicate the index could not resolve (typically a field
/// comparison) which travels with the id for downstream evaluation.
#[derive(Clone, Debug, Default)]
pub struct SeriesIdElem {
    pub series_id: u64,
    pub expr: Option<Arc<Expr>>,
}

impl SeriesIdElem {
    pub fn new(series_id: u64) -> Self {
        Self {
            series_id,
            expr: None,
        }
    }
}

/// BoxSeriesIdIterator yields (series id, residual) pairs in ascending id
/// order.
pub type BoxSeriesIdIterator = Box<dyn TryIterator<Item = SeriesIdElem> + Send>;

/// MeasurementElem is a measurement name with its tombstone state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeasurementElem {
    pub name: Vec<u8>,
    pub deleted: bool,
}

/// BoxMeasurementIterator yields measurements in ascending name order.
pub type BoxMeasurementIterator = Box<dyn TryIterator<Item = MeasurementElem> + Send>;

/// Index is the seam between the shard and its index backend. The backend
/// is selected at construction time by `IndexType`.
#[async_trait]
pub trait Index: Send + Sync {
    async fn open(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;

    /// create_series_if_not_exists indexes a series, returning its id.
    async fn create_series_if_not_exists(
        &self,
        key: &[u8],
        name: &[u8],
        tags: &Tags,
    ) -> anyhow::Result<u64>;

    /// drop_series tombstones series by key at the given timestamp.
    async fn drop_series(&self, keys: &[&[u8]], ts: i64) -> anyhow::Result<()>;

    /// drop_measurement tombstones a measurement and all its series.
    async fn drop_measurement(&self, name: &[u8]) -> anyhow::Result<()>;

    /// series_n returns the exact number of live series.
    fn series_n(&self) -> u64;

    fn measurement_exists(&self, name: &[u8]) -> anyhow::Result<bool>;

    /// measurement_names returns all live measurement names in sorted order.
    fn measurement_names(&self) -> anyhow::Result<Vec<Vec<u8>>>;

    /// measurement_series_id_iterator returns all live series ids of a
    /// measurement in ascending order.
    fn measurement_series_id_iterator(&self, name: &[u8])
        -> anyhow::Result<BoxSeriesIdIterator>;

    /// tag_key_series_id_iterator returns ids of series carrying the key.
    fn tag_key_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
    ) -> anyhow::Result<BoxSeriesIdIterator>;

    /// tag_value_series_id_iterator returns the posting list for (key, value).
    fn tag_value_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> anyhow::Result<BoxSeriesIdIterator>;

    fn tag_keys(&self, name: &[u8]) -> anyhow::Result<Vec<Vec<u8>>>;

    fn tag_values(&self, name: &[u8], key: &[u8]) -> anyhow::Result<Vec<Vec<u8>>>;

    fn has_tag_value(&self, name: &[u8], key: &[u8], value: &[u8]) -> anyhow::Result<bool>;

    /// tag_value_cardinality returns the number of distinct live values
    /// recorded for a tag key.
    fn tag_value_cardinality(&self, name: &[u8], key: &[u8]) -> anyhow::Result<u64>;

    /// measurement_sketch_counts returns (live, tombstoned) measurement
    /// cardinality estimates.
    fn measurement_sketch_counts(&self) -> anyhow::Result<(u64, u64)>;

    /// series_sketch_counts returns (live, tombstoned) series cardinality
    /// estimates.
    fn series_sketch_counts(&self) -> anyhow::Result<(u64, u64)>;

    /// compaction_needed reports whether the backend has crossed its
    /// compaction thresholds; the shard's monitor polls this.
    fn compaction_needed(&self) -> bool;

    /// compact folds pending maintenance (log compaction for TSI).
    async fn compact(&self, token: CancellationToken) -> anyhow::Result<()>;
}

/// new_index constructs the index backend for a shard.
pub async fn new_index(
    index_type: IndexType,
    sfile: Arc<SeriesFile>,
    index_op: StorageOperator,
    config: &Config,
) -> anyhow::Result<Arc<dyn Index>> {
    let index: Arc<dyn Index> = match index_type {
        IndexType::InMem => Arc::new(inmem::InMemIndex::new(sfile)),
        IndexType::Tsi1 => Arc::new(tsi1::index::Tsi1Index::new(sfile, index_op, config)),
    };
    index.open().await?;
    Ok(index)
}

/// and_expr conjoins two optional residual expressions.
pub(crate) fn and_expr(a: Option<Arc<Expr>>, b: Option<Arc<Expr>>) -> Option<Arc<Expr>> {
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Some(a), Some(b)) => Some(Arc::new(Expr::binary(
            BinaryOp::And,
            (*a).clone(),
            (*b).clone(),
        ))),
    }
}

/// or_expr disjoins two optional residual expressions. A missing side means
/// the series is unconditionally included, so the union carries no residual.
pub(crate) fn or_expr(a: Option<Arc<Expr>>, b: Option<Arc<Expr>>) -> Option<Arc<Expr>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Arc::new(Expr::binary(
            BinaryOp::Or,
            (*a).clone(),
            (*b).clone(),
        ))),
        _ => None,
    }
}

/// SeriesIdSliceIterator iterates a sorted id list.
pub struct SeriesIdSliceIterator {
    ids: Vec<u64>,
    i: usize,
}

impl SeriesIdSliceIterator {
    pub fn new(ids: Vec<u64>) -> Self {
        Self { ids, i: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl TryIterator for SeriesIdSliceIterator {
    type Item = SeriesIdElem;

    fn try_next(&mut self) -> anyhow::Result<Option<SeriesIdElem>> {
        if self.i >= self.ids.len() {
            return Ok(None);
        }
        self.i += 1;
        Ok(Some(SeriesIdElem::new(self.ids[self.i - 1])))
    }
}

/// series_id_expr_iterator attaches a residual expression to every element.
pub fn series_id_expr_iterator(
    itr: BoxSeriesIdIterator,
    expr: Arc<Expr>,
) -> BoxSeriesIdIterator {
    Box::new(SeriesIdExprIterator { itr, expr })
}

struct SeriesIdExprIterator {
    itr: BoxSeriesIdIterator,
    expr: Arc<Expr>,
}

impl TryIterator for SeriesIdExprIterator {
    type Item = SeriesIdElem;

    fn try_next(&mut self) -> anyhow::Result<Option<SeriesIdElem>> {
        match self.itr.try_next()? {
            Some(mut elem) => {
                elem.expr = and_expr(elem.expr.take(), Some(self.expr.clone()));
                Ok(Some(elem))
            }
            None => Ok(None),
        }
    }
}

/// filter_undeleted drops tombstoned series from an iterator, consulting
/// the series file's tombstone set.
pub fn filter_undeleted(
    itr: BoxSeriesIdIterator,
    sfile: Arc<SeriesFile>,
) -> BoxSeriesIdIterator {
    Box::new(FilterUndeletedIterator { itr, sfile })
}

struct FilterUndeletedIterator {
    itr: BoxSeriesIdIterator,
    sfile: Arc<SeriesFile>,
}

impl TryIterator for FilterUndeletedIterator {
    type Item = SeriesIdElem;

    fn try_next(&mut self) -> anyhow::Result<Option<SeriesIdElem>> {
        loop {
            match self.itr.try_next()? {
                None => return Ok(None),
                Some(elem) => {
                    if !self.sfile.is_deleted(elem.series_id) {
                        return Ok(Some(elem));
                    }
                }
            }
        }
    }
}

/// cancellable wraps an iterator so the token is polled once per element.
pub fn cancellable(itr: BoxSeriesIdIterator, token: CancellationToken) -> BoxSeriesIdIterator {
    Box::new(CancellableIterator { itr, token })
}

struct CancellableIterator {
    itr: BoxSeriesIdIterator,
    token: CancellationToken,
}

impl TryIterator for CancellableIterator {
    type Item = SeriesIdElem;

    fn try_next(&mut self) -> anyhow::Result<Option<SeriesIdElem>> {
        if self.token.is_cancelled() {
            return Err(IndexError::Cancelled.into());
        }
        self.itr.try_next()
    }
}

/// merge_series_id_iterators merges multiple sorted iterators, collapsing
/// equal ids into one element whose residuals are ANDed.
pub fn merge_series_id_iterators(mut itrs: Vec<BoxSeriesIdIterator>) -> BoxSeriesIdIterator {
    if itrs.len() == 1 {
        return itrs.remove(0);
    }

    let buf = itrs.iter().map(|_| None).collect();
    Box::new(SeriesIdMergeIterator { buf, itrs })
}

struct SeriesIdMergeIterator {
    buf: Vec<Option<SeriesIdElem>>,
    itrs: Vec<BoxSeriesIdIterator>,
}

impl TryIterator for SeriesIdMergeIterator {
    type Item = SeriesIdElem;

    fn try_next(&mut self) -> anyhow::Result<Option<SeriesIdElem>> {
        // Find the next lowest id amongst the buffers.
        let mut min_id: Option<u64> = None;
        for i in 0..self.itrs.len() {
            if self.buf[i].is_none() {
                self.buf[i] = self.itrs[i].try_next()?;
            }
            if let Some(elem) = &self.buf[i] {
                min_id = Some(match min_id {
                    Some(m) => m.min(elem.series_id),
                    None => elem.series_id,
                });
            }
        }

        let min_id = match min_id {
            Some(id) => id,
            None => return Ok(None),
        };

        // Pop all buffers holding the minimum, combining their residuals.
        let mut out: Option<SeriesIdElem> = None;
        for buf in self.buf.iter_mut() {
            let matches = matches!(buf, Some(e) if e.series_id == min_id);
            if !matches {
                continue;
            }
            let elem = buf.take().unwrap();
            out = Some(match out {
                None => elem,
                Some(mut prev) => {
                    prev.expr = and_expr(prev.expr.take(), elem.expr);
                    prev
                }
            });
        }

        Ok(out)
    }
}

/// intersect_series_id_iterators returns only ids present in both
/// iterators; residuals on matching ids are ANDed.
pub fn intersect_series_id_iterators(
    itr0: BoxSeriesIdIterator,
    itr1: BoxSeriesIdIterator,
) -> BoxSeriesIdIterator {
    Box::new(SeriesIdIntersectIterator {
        itrs: [itr0, itr1],
        buf: [None, None],
    })
}

struct SeriesIdIntersectIterator {
    itrs: [BoxSeriesIdIterator; 2],
    buf: [Option<SeriesIdElem>; 2],
}

impl TryIterator for SeriesIdIntersectIterator {
    type Item = SeriesIdElem;

    fn try_next(&mut self) -> anyhow::Result<Option<SeriesIdElem>> {
        loop {
            if self.buf[0].is_none() {
                self.buf[0] = self.itrs[0].try_next()?;
            }
            if self.buf[1].is_none() {
                self.buf[1] = self.itrs[1].try_next()?;
            }

            let (a, b) = match (&self.buf[0], &self.buf[1]) {
                (Some(a), Some(b)) => (a.series_id, b.series_id),
                _ => return Ok(None),
            };

            if a < b {
                self.buf[0] = None;
            } else if a > b {
                self.buf[1] = None;
            } else {
                let mut elem = self.buf[0].take().unwrap();
                let other = self.buf[1].take().unwrap();
                elem.expr = and_expr(elem.expr.take(), other.expr);
                return Ok(Some(elem));
            }
        }
    }
}

/// union_series_id_iterators returns ids from either iterator. Ids present
/// in both carry the OR of their residuals; a side without a residual makes
/// the id unconditional.
pub fn union_series_id_iterators(
    itr0: BoxSeriesIdIterator,
    itr1: BoxSeriesIdIterator,
) -> BoxSeriesIdIterator {
    Box::new(SeriesIdUnionIterator {
        itrs: [itr0, itr1],
        buf: [None, None],
    })
}

struct SeriesIdUnionIterator {
    itrs: [BoxSeriesIdIterator; 2],
    buf: [Option<SeriesIdElem>; 2],
}

impl TryIterator for SeriesIdUnionIterator {
    type Item = SeriesIdElem;

    fn try_next(&mut self) -> anyhow::Result<Option<SeriesIdElem>> {
        if self.buf[0].is_none() {
            self.buf[0] = self.itrs[0].try_next()?;
        }
        if self.buf[1].is_none() {
            self.buf[1] = self.itrs[1].try_next()?;
        }

        match (&self.buf[0], &self.buf[1]) {
            (None, None) => Ok(None),
            (Some(_), None) => Ok(self.buf[0].take()),
            (None, Some(_)) => Ok(self.buf[1].take()),
            (Some(a), Some(b)) => {
                if a.series_id < b.series_id {
                    Ok(self.buf[0].take())
                } else if a.series_id > b.series_id {
                    Ok(self.buf[1].take())
                } else {
                    let mut elem = self.buf[0].take().unwrap();
                    let other = self.buf[1].take().unwrap();
                    elem.expr = or_expr(elem.expr.take(), other.expr);
                    Ok(Some(elem))
                }
            }
        }
    }
}

/// difference_series_id_iterators returns ids in the first iterator that do
/// not occur in the second.
pub fn difference_series_id_iterators(
    itr0: BoxSeriesIdIterator,
    itr1: BoxSeriesIdIterator,
) -> BoxSeriesIdIterator {
    Box::new(SeriesIdDifferenceIterator {
        itrs: [itr0, itr1],
        buf: [None, None],
    })
}

struct SeriesIdDifferenceIterator {
    itrs: [BoxSeriesIdIterator; 2],
    buf: [Option<SeriesIdElem>; 2],
}

impl TryIterator for SeriesIdDifferenceIterator {
    type Item = SeriesIdElem;

    fn try_next(&mut self) -> anyhow::Result<Option<SeriesIdElem>> {
        loop {
            if self.buf[0].is_none() {
                self.buf[0] = self.itrs[0].try_next()?;
            }
            if self.buf[1].is_none() {
                self.buf[1] = self.itrs[1].try_next()?;
            }

            match (&self.buf[0], &self.buf[1]) {
                (None, _) => return Ok(None),
                (Some(_), None) => return Ok(self.buf[0].take()),
                (Some(a), Some(b)) => {
                    if a.series_id < b.series_id {
                        return Ok(self.buf[0].take());
                    } else if a.series_id > b.series_id {
                        self.buf[1] = None;
                    } else {
                        self.buf[0] = None;
                        self.buf[1] = None;
                    }
                }
            }
        }
    }
}

/// MeasurementSliceIterator iterates a sorted list of names.
pub struct MeasurementSliceIterator {
    elems: Vec<MeasurementElem>,
    i: usize,
}

impl MeasurementSliceIterator {
    pub fn new(elems: Vec<MeasurementElem>) -> Self {
        Self { elems, i: 0 }
    }
}

impl TryIterator for MeasurementSliceIterator {
    type Item = MeasurementElem;

    fn try_next(&mut self) -> anyhow::Result<Option<MeasurementElem>> {
        if self.i >= self.elems.len() {
            return Ok(None);
        }
        self.i += 1;
        Ok(Some(self.elems[self.i - 1].clone()))
    }
}

/// merge_measurement_iterators merges by name; for equal names the element
/// from the earliest (newest) iterator wins, so tombstones shadow older
/// files.
pub fn merge_measurement_iterators(
    mut itrs: Vec<BoxMeasurementIterator>,
) -> BoxMeasurementIterator {
    if itrs.len() == 1 {
        return itrs.remove(0);
    }
    let buf = itrs.iter().map(|_| None).collect();
    Box::new(MeasurementMergeIterator { buf, itrs })
}

struct MeasurementMergeIterator {
    buf: Vec<Option<MeasurementElem>>,
    itrs: Vec<BoxMeasurementIterator>,
}

impl TryIterator for MeasurementMergeIterator {
    type Item = MeasurementElem;

    fn try_next(&mut self) -> anyhow::Result<Option<MeasurementElem>> {
        let mut min_name: Option<Vec<u8>> = None;
        for i in 0..self.itrs.len() {
            if self.buf[i].is_none() {
                self.buf[i] = self.itrs[i].try_next()?;
            }
            if let Some(elem) = &self.buf[i] {
                min_name = Some(match min_name {
                    Some(m) => m.min(elem.name.clone()),
                    None => elem.name.clone(),
                });
            }
        }

        let min_name = match min_name {
            Some(name) => name,
            None => return Ok(None),
        };

        // Newest source wins; drain matching buffers.
        let mut out: Option<MeasurementElem> = None;
        for buf in self.buf.iter_mut() {
            let matches = matches!(buf, Some(e) if e.name == min_name);
            if !matches {
                continue;
            }
            let elem = buf.take().unwrap();
            if out.is_none() {
                out = Some(elem);
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(ids: &[u64]) -> BoxSeriesIdIterator {
        Box::new(SeriesIdSliceIterator::new(ids.to_vec()))
    }

    fn collect(mut itr: BoxSeriesIdIterator) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(e) = itr.try_next().unwrap() {
            out.push(e.series_id);
        }
        out
    }

    #[test]
    fn test_merge() {
        let itr = merge_series_id_iterators(vec![
            slice(&[1, 4, 7]),
            slice(&[2, 4, 8]),
            slice(&[]),
        ]);
        assert_eq!(collect(itr), vec![1, 2, 4, 7, 8]);
    }

    #[test]
    fn test_intersect() {
        let itr = intersect_series_id_iterators(slice(&[1, 2, 4, 6]), slice(&[2, 4, 5, 6]));
        assert_eq!(collect(itr), vec![2, 4, 6]);
    }

    #[test]
    fn test_union() {
        let itr = union_series_id_iterators(slice(&[1, 3]), slice(&[2, 3, 9]));
        assert_eq!(collect(itr), vec![1, 2, 3, 9]);
    }

    #[test]
    fn test_difference() {
        let itr = difference_series_id_iterators(slice(&[1, 2, 3, 4]), slice(&[2, 4, 5]));
        assert_eq!(collect(itr), vec![1, 3]);
    }

    #[test]
    fn test_intersect_ands_residuals() {
        let lhs = series_id_expr_iterator(slice(&[7]), Arc::new(Expr::field_ref("a")));
        let rhs = series_id_expr_iterator(slice(&[7]), Arc::new(Expr::field_ref("b")));
        let mut itr = intersect_series_id_iterators(lhs, rhs);

        let elem = itr.try_next().unwrap().unwrap();
        assert_eq!(elem.expr.unwrap().to_string(), "a AND b");
    }

    #[test]
    fn test_union_drops_residual_when_one_side_unconditional() {
        let lhs = series_id_expr_iterator(slice(&[7]), Arc::new(Expr::field_ref("a")));
        let rhs = slice(&[7]);
        let mut itr = union_series_id_iterators(lhs, rhs);

        let elem = itr.try_next().unwrap().unwrap();
        assert!(elem.expr.is_none());
    }

    #[test]
    fn test_cancellation() {
        let token = CancellationToken::new();
        let mut itr = cancellable(slice(&[1, 2, 3]), token.clone());
        assert_eq!(itr.try_next().unwrap().unwrap().series_id, 1);

        token.cancel();
        let err = itr.try_next().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::Cancelled)
        ));
    }

    #[test]
    fn test_measurement_merge_newest_wins() {
        let newest = Box::new(MeasurementSliceIterator::new(vec![MeasurementElem {
            name: b"cpu".to_vec(),
            deleted: true,
        }]));
        let oldest = Box::new(MeasurementSliceIterator::new(vec![
            MeasurementElem {
                name: b"cpu".to_vec(),
                deleted: false,
            },
            MeasurementElem {
                name: b"mem".to_vec(),
                deleted: false,
            },
        ]));

        let mut itr = merge_measurement_iterators(vec![newest, oldest]);
        let first = itr.try_next().unwrap().unwrap();
        assert_eq!(first.name, b"cpu".to_vec());
        assert!(first.deleted);
        let second = itr.try_next().unwrap().unwrap();
        assert_eq!(second.name, b"mem".to_vec());
        assert!(!second.deleted);
        assert!(itr.try_next().unwrap().is_none());
    }
}
