/// TryIterator is the fallible iterator used on query paths. Query-time data
/// is in memory or memory mapped, so these never block on IO.
pub trait TryIterator {
    type Item;
    fn try_next(&mut self) -> anyhow::Result<Option<Self::Item>>;
}

/// TryIterators chains a list of iterators, exhausting each in order.
pub struct TryIterators<ITEM, ITR>
where
    ITR: TryIterator<Item = ITEM>,
{
    itrs: Vec<ITR>,
    i: usize,
}

impl<ITEM, ITR> TryIterators<ITEM, ITR>
where
    ITR: TryIterator<Item = ITEM>,
{
    pub fn new(itrs: Vec<ITR>) -> Self {
        Self { itrs, i: 0 }
    }
}

impl<ITEM, ITR> TryIterator for TryIterators<ITEM, ITR>
where
    ITR: TryIterator<Item = ITEM>,
{
    type Item = ITEM;

    fn try_next(&mut self) -> anyhow::Result<Option<Self::Item>> {
        while self.i < self.itrs.len() {
            if let Some(v) = self.itrs[self.i].try_next()? {
                return Ok(Some(v));
            }
            self.i += 1;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SliceIter(Vec<u64>, usize);

    impl TryIterator for SliceIter {
        type Item = u64;
        fn try_next(&mut self) -> anyhow::Result<Option<u64>> {
            if self.1 >= self.0.len() {
                return Ok(None);
            }
            self.1 += 1;
            Ok(Some(self.0[self.1 - 1]))
        }
    }

    #[test]
    fn test_chained_iterators() {
        let mut itr = TryIterators::new(vec![
            SliceIter(vec![1, 2], 0),
            SliceIter(vec![], 0),
            SliceIter(vec![3], 0),
        ]);
        let mut out = Vec::new();
        while let Some(v) = itr.try_next().unwrap() {
            out.push(v);
        }
        assert_eq!(out, vec![1, 2, 3]);
    }
}
