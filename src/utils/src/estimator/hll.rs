use std::hash::BuildHasherDefault;

use anyhow::anyhow;
use hyperloglogplus::{HyperLogLog, HyperLogLogPlus};
use twox_hash::XxHash64;

use crate::estimator::Sketch;

/// DEFAULT_PRECISION is the default precision.
const DEFAULT_PRECISION: u8 = 16;

/// The hasher must be deterministic: sketches are serialized into index
/// files and merged across processes, so every instance has to hash a key
/// to the same register.
type HashBuilder = BuildHasherDefault<XxHash64>;

/// Plus is an HLL++ cardinality sketch.
pub struct Plus {
    hllp: HyperLogLogPlus<Vec<u8>, HashBuilder>,
}

impl Plus {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_p(DEFAULT_PRECISION)
    }

    pub fn with_p(p: u8) -> anyhow::Result<Self> {
        let hllp = HyperLogLogPlus::new(p, HashBuilder::default())
            .map_err(|e| anyhow!("hll precision {}: {:?}", p, e))?;
        Ok(Self { hllp })
    }

    /// decode restores a sketch previously produced by Sketch::encode.
    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let hllp = serde_json::from_slice(data)?;
        Ok(Self { hllp })
    }
}

impl Sketch for Plus {
    fn add(&mut self, v: &[u8]) {
        self.hllp.insert(&v.to_vec());
    }

    fn count(&mut self) -> u64 {
        self.hllp.count() as u64
    }

    fn merge(&mut self, s: &Self) -> anyhow::Result<()> {
        self.hllp
            .merge(&s.hllp)
            .map_err(|e| anyhow!("hll merge: {:?}", e))
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(&self.hllp).map_err(|e| anyhow!(e))
    }
}
