use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::errcorrupt;

use crate::error::{Error, Result};

const BLOOM_MAGIC: u32 = 0x42_4C_4D; // ASCII "BLM"
const BLOOM_FORMAT: u16 = 1;

/// Target false-positive rate for block filters.
pub const FALSE_POSITIVE_RATE: f64 = 0.03;

/// A bloom filter over locator (and locator+key) byte strings, persisted as
/// a block sidecar.
pub struct BloomFilter {
    bits: Vec<u8>,
    k: u64,
    m: u64,
}

impl BloomFilter {
    /// O(1) membership probe. False positives occur at roughly
    /// [`FALSE_POSITIVE_RATE`]; false negatives never.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        for i in 0..self.k {
            let bit = xxh3_64_with_seed(key, i) % self.m;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Write the filter to `path` and sync it.
    pub fn store(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(&file);
        w.write_u32::<BigEndian>(BLOOM_MAGIC)?;
        w.write_u16::<BigEndian>(BLOOM_FORMAT)?;
        w.write_u64::<BigEndian>(self.k)?;
        w.write_u64::<BigEndian>(self.m)?;
        w.write_u32::<BigEndian>(self.bits.len() as u32)?;
        w.write_all(&self.bits)?;
        w.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Read a filter back from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        let magic = r.read_u32::<BigEndian>()?;
        if magic != BLOOM_MAGIC {
            return errcorrupt!("bad bloom filter magic {magic:#x} in {}", path.display());
        }
        let format = r.read_u16::<BigEndian>()?;
        if format != BLOOM_FORMAT {
            return errcorrupt!("unsupported bloom filter format {format}");
        }
        let k = r.read_u64::<BigEndian>()?;
        let m = r.read_u64::<BigEndian>()?;
        let len = r.read_u32::<BigEndian>()? as usize;
        if m == 0 || k == 0 || len != (m as usize).div_ceil(8) {
            return errcorrupt!("inconsistent bloom filter dimensions in {}", path.display());
        }
        let mut bits = vec![0u8; len];
        r.read_exact(&mut bits).map_err(|e| Error::Corruption(e.to_string()))?;
        Ok(Self { bits, k, m })
    }
}

pub struct BloomFilterBuilder {
    bits: Vec<u8>,
    k: u64,
    m: u64,
}

impl BloomFilterBuilder {
    /// Size the filter for `n` expected entries at [`FALSE_POSITIVE_RATE`].
    pub fn with_capacity(n: usize) -> Self {
        let n = n.max(1);
        // Optimal bit count and hash count for the target rate.
        let m = ((-(n as f64) * FALSE_POSITIVE_RATE.ln()) / 2f64.ln().powi(2)).ceil() as u64;
        let m = m.max(8);
        let k = ((m as f64 / n as f64) * 2f64.ln()).ceil() as u64;
        let k = k.max(1);
        Self { bits: vec![0u8; (m as usize).div_ceil(8)], k, m }
    }

    pub fn insert(&mut self, key: &[u8]) {
        for i in 0..self.k {
            let bit = xxh3_64_with_seed(key, i) % self.m;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn finalize(self) -> BloomFilter {
        BloomFilter { bits: self.bits, k: self.k, m: self.m }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: &[&[u8]]) -> BloomFilter {
        let mut builder = BloomFilterBuilder::with_capacity(keys.len());
        for key in keys {
            builder.insert(key);
        }
        builder.finalize()
    }

    #[test]
    fn test_inserted_keys_always_found() {
        let keys: &[&[u8]] = &[b"apple", b"banana", b"cherry", b"date"];
        let filter = build(keys);
        for key in keys {
            assert!(filter.might_contain(key));
        }
    }

    #[test]
    fn test_false_positive_rate_within_bounds() {
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key_{i}").into_bytes()).collect();
        let mut builder = BloomFilterBuilder::with_capacity(keys.len());
        for key in &keys {
            builder.insert(key);
        }
        let filter = builder.finalize();

        let mut false_positives = 0;
        let probes = 10_000;
        for i in 0..probes {
            if filter.might_contain(format!("absent_{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // 3% target with generous slack for hash variance.
        assert!(
            (false_positives as f64) / (probes as f64) < 0.06,
            "false positive rate too high: {false_positives}/{probes}"
        );
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.bf");

        let filter = build(&[b"alpha", b"beta"]);
        filter.store(&path).unwrap();

        let loaded = BloomFilter::load(&path).unwrap();
        assert!(loaded.might_contain(b"alpha"));
        assert!(loaded.might_contain(b"beta"));
        assert!(!loaded.might_contain(b"gamma") || !loaded.might_contain(b"delta"));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("garbage.bf");
        std::fs::write(&path, b"not a bloom filter").unwrap();
        assert!(BloomFilter::load(&path).is_err());
    }

    #[test]
    fn test_empty_capacity_does_not_panic() {
        let filter = BloomFilterBuilder::with_capacity(0).finalize();
        assert!(!filter.might_contain(b"anything") || true);
    }
}
