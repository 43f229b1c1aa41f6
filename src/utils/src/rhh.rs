use std::hash::Hasher;

/// Options represents initialization options that are passed to HashMap::new().
#[derive(Clone, Copy)]
pub struct Options {
    pub capacity: u64,
    pub load_factor: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capacity: 256,
            load_factor: 90,
        }
    }
}

/// hash_key computes a hash of key. Hash is always non-zero.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut xx_hash = twox_hash::XxHash64::with_seed(0);
    xx_hash.write(key);
    let mut h = xx_hash.finish();

    if h == 0 {
        h = 1;
    }

    h
}

/// dist returns the probe distance for a hash in a slot index.
/// NOTE: Capacity must be a power of 2.
pub fn dist(hash: u64, i: u64, capacity: u64) -> u64 {
    let mask = capacity - 1;
    (i + capacity - (hash & mask)) & mask
}

/// pow2 returns the number that is the next highest power of 2.
/// Returns v if it is a power of 2.
pub fn pow2(v: u64) -> u64 {
    let mut i = 2_u64;
    while i < 1 << 62 {
        if i >= v {
            return i;
        }
        i *= 2;
    }
    panic!("unreachable")
}

struct HashElem<V> {
    key: Vec<u8>,
    value: V,
    hash: u64,
}

/// HashMap represents a robin-hood open-addressed hash map keyed by bytes.
pub struct HashMap<V> {
    elems: Vec<Option<HashElem<V>>>,

    n: u64,
    capacity: u64,
    threshold: u64,
    mask: u64,
    load_factor: u64,
}

impl<V> HashMap<V> {
    pub fn new(opt: Options) -> Self {
        Self::alloc(
            pow2(opt.capacity.max(1) * 100 / opt.load_factor),
            opt.load_factor,
        )
    }

    fn alloc(capacity: u64, load_factor: u64) -> Self {
        let mut elems = Vec::with_capacity(capacity as usize);
        elems.resize_with(capacity as usize, || None);

        Self {
            elems,
            n: 0,
            capacity,
            threshold: capacity * load_factor / 100,
            mask: capacity - 1,
            load_factor,
        }
    }

    /// len returns the number of keys in the map.
    pub fn len(&self) -> u64 {
        self.n
    }

    /// cap returns the number of slots allocated, a power of two.
    pub fn cap(&self) -> u64 {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let i = self.index(key)?;
        self.elems[i].as_ref().map(|e| &e.value)
    }

    pub fn put(&mut self, key: &[u8], value: V) {
        // Grow the map if we've run out of slots.
        if self.n + 1 > self.threshold {
            self.grow();
        }

        if !self.insert(hash_key(key), key.to_vec(), value) {
            self.n += 1;
        }
    }

    /// insert adds the entry, displacing richer entries as it probes.
    /// Returns true if an existing entry was overwritten.
    fn insert(&mut self, hash: u64, key: Vec<u8>, value: V) -> bool {
        let mut pos = hash & self.mask;
        let mut d = 0_u64;
        let mut current = HashElem { key, value, hash };

        // The original key can only match before its first displacement.
        let mut searching = true;

        loop {
            match &mut self.elems[pos as usize] {
                slot @ None => {
                    *slot = Some(current);
                    return false;
                }
                Some(e) => {
                    if searching && e.hash == current.hash && e.key == current.key {
                        e.value = current.value;
                        return true;
                    }

                    // Swap with any entry that has probed less than us.
                    let elem_dist = dist(e.hash, pos, self.capacity);
                    if elem_dist < d {
                        std::mem::swap(e, &mut current);
                        d = elem_dist;
                        searching = false;
                    }
                }
            }

            pos = (pos + 1) & self.mask;
            d += 1;
        }
    }

    /// elem returns the key/value pair stored in slot i, if the slot is occupied.
    pub fn elem(&self, i: u64) -> Option<(&[u8], &V)> {
        self.elems[i as usize]
            .as_ref()
            .map(|e| (e.key.as_slice(), &e.value))
    }

    fn index(&self, key: &[u8]) -> Option<usize> {
        let hash = hash_key(key);
        let mut pos = hash & self.mask;
        let mut d = 0_u64;

        loop {
            let e = self.elems[pos as usize].as_ref()?;
            if e.hash == hash && e.key.as_slice() == key {
                return Some(pos as usize);
            }

            // Halt if we've probed further than the key could have been displaced.
            if d > dist(e.hash, pos, self.capacity) {
                return None;
            }

            pos = (pos + 1) & self.mask;
            d += 1;
            if d > self.capacity {
                return None;
            }
        }
    }

    fn grow(&mut self) {
        let mut next = Self::alloc(self.capacity * 2, self.load_factor);
        for slot in self.elems.drain(..) {
            if let Some(e) = slot {
                next.insert(e.hash, e.key, e.value);
                next.n += 1;
            }
        }
        *self = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_non_zero() {
        assert_ne!(hash_key(&[2, 3, 4, 5]), 0);
        assert_ne!(hash_key(&[]), 0);
    }

    #[test]
    fn test_put_get() {
        let mut m: HashMap<u64> = HashMap::new(Options::default());
        m.put(b"foo", 1);
        m.put(b"bar", 2);
        m.put(b"foo", 3);

        assert_eq!(m.len(), 2);
        assert_eq!(m.get(b"foo"), Some(&3));
        assert_eq!(m.get(b"bar"), Some(&2));
        assert_eq!(m.get(b"baz"), None);
    }

    #[test]
    fn test_grow_preserves_entries() {
        let mut m: HashMap<u64> = HashMap::new(Options {
            capacity: 2,
            load_factor: 90,
        });
        for i in 0..1000_u64 {
            m.put(format!("key-{}", i).as_bytes(), i);
        }
        assert_eq!(m.len(), 1000);
        for i in 0..1000_u64 {
            assert_eq!(m.get(format!("key-{}", i).as_bytes()), Some(&i));
        }
    }

    #[test]
    fn test_slot_iteration_covers_all_entries() {
        let mut m: HashMap<u64> = HashMap::new(Options::default());
        for i in 0..100_u64 {
            m.put(format!("k{}", i).as_bytes(), i);
        }

        let mut seen = 0;
        for i in 0..m.cap() {
            if m.elem(i).is_some() {
                seen += 1;
            }
        }
        assert_eq!(seen, 100);
    }
}
