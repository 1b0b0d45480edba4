use std::fmt::Debug;

use xxhash_rust::xxh3::xxh3_128;

/// Builds and probes the per-table filter consulted before block reads on
/// point lookups. Filters are built over user keys.
pub trait FilterPolicy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Serializes a filter covering `keys`.
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// False means the key is definitely absent from the filtered table.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter with double hashing over a split 128-bit hash.
///
/// `h_i(key) = h1 + i * h2 (mod num_bits)` probes `k` bits per key, so no
/// independent hash functions are needed.
#[derive(Debug)]
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    num_probes: u32,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2) minimizes the false positive rate.
        let num_probes = ((bits_per_key as f64 * 0.69) as u32).clamp(1, 30);
        Self {
            bits_per_key,
            num_probes,
        }
    }

    fn hash_key(key: &[u8]) -> (u64, u64) {
        let hash = xxh3_128(key);
        (hash as u64, (hash >> 64) as u64)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "tephradb.BloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        // Round up to a byte, with a floor that keeps tiny tables from
        // producing useless one-byte filters.
        let num_bits = (keys.len() * self.bits_per_key).max(64);
        let num_bytes = (num_bits + 7) / 8;
        let num_bits = num_bytes * 8;

        let mut filter = vec![0u8; num_bytes + 1];
        filter[num_bytes] = self.num_probes as u8;

        for key in keys {
            let (h1, h2) = Self::hash_key(key);
            for i in 0..self.num_probes as u64 {
                let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % num_bits as u64) as usize;
                filter[bit / 8] |= 1 << (bit % 8);
            }
        }
        filter
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return true;
        }
        let num_bytes = filter.len() - 1;
        let num_bits = num_bytes * 8;
        let num_probes = filter[num_bytes];
        if num_probes == 0 || num_probes > 30 {
            // Reserved or corrupt: do not filter.
            return true;
        }

        let (h1, h2) = Self::hash_key(key);
        for i in 0..num_probes as u64 {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % num_bits as u64) as usize;
            if filter[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key{i:06}").into_bytes()).collect()
    }

    #[test]
    fn test_inserted_keys_match() {
        let policy = BloomFilterPolicy::new(10);
        let keys = keys(1000);
        let filter = policy.create_filter(&keys);
        for key in &keys {
            assert!(policy.key_may_match(key, &filter), "false negative for {key:?}");
        }
    }

    #[test]
    fn test_false_positive_rate_is_low() {
        let policy = BloomFilterPolicy::new(10);
        let filter = policy.create_filter(&keys(1000));

        let mut false_positives = 0;
        for i in 0..10_000 {
            let probe = format!("absent{i:06}").into_bytes();
            if policy.key_may_match(&probe, &filter) {
                false_positives += 1;
            }
        }
        // 10 bits/key targets ~1%; allow generous slack.
        assert!(
            false_positives < 300,
            "false positive rate too high: {false_positives}/10000"
        );
    }

    #[test]
    fn test_empty_and_tiny_filters() {
        let policy = BloomFilterPolicy::new(10);
        // No keys inserted: every bit is clear, so every probe misses.
        let filter = policy.create_filter(&[]);
        assert!(!policy.key_may_match(b"anything", &filter));

        // A short or empty filter never filters.
        assert!(policy.key_may_match(b"k", &[]));
        assert!(policy.key_may_match(b"k", &[0x01]));
    }

    #[test]
    fn test_empty_key_is_representable() {
        let policy = BloomFilterPolicy::new(10);
        let filter = policy.create_filter(&[Vec::new()]);
        assert!(policy.key_may_match(b"", &filter));
    }
}
