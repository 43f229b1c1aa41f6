pub mod hll;

/// Sketch is the interface representing a sketch for estimating cardinality.
pub trait Sketch {
    /// add adds a single value to the sketch.
    fn add(&mut self, v: &[u8]);

    /// count returns a cardinality estimate for the sketch.
    fn count(&mut self) -> u64;

    /// merge merges another sketch into this one.
    fn merge(&mut self, s: &Self) -> anyhow::Result<()>;

    /// encode serializes the sketch to a bounded byte block.
    fn encode(&self) -> anyhow::Result<Vec<u8>>;
}
