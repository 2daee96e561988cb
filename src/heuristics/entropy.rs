//! Shannon entropy over byte frequencies: `Σ p(b)·log2(1/p(b))`, in bits per byte.

use std::fs::File;
use std::io::Read;
use std::path::Path;

const READ_CHUNK: usize = 64 * 1024;

/// Byte-value frequency table, fed incrementally
#[derive(Debug, Clone)]
pub struct ByteHistogram {
    counts: [u64; 256],
    total: u64,
}

impl Default for ByteHistogram {
    fn default() -> Self {
        Self {
            counts: [0; 256],
            total: 0,
        }
    }
}

impl ByteHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.counts[b as usize] += 1;
        }
        self.total += data.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Entropy in bits per byte, 0.0 for empty input
    pub fn entropy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let len = self.total as f64;
        // Every term is non-negative, so the sum never comes out as -0.0
        self.counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f64 / len;
                p * (len / c as f64).log2()
            })
            .sum()
    }
}

pub fn shannon_entropy(data: &[u8]) -> f64 {
    let mut h = ByteHistogram::new();
    h.update(data);
    h.entropy()
}

/// Stream a file through a histogram without loading it whole
pub fn file_histogram(path: &Path) -> std::io::Result<ByteHistogram> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut h = ByteHistogram::new();
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(shannon_entropy(&[]), 0.0);
    }

    #[test]
    fn all_zero_bytes_is_zero_at_any_length() {
        for len in [1usize, 7, 4096, 100_000] {
            let h = shannon_entropy(&vec![0u8; len]);
            assert_eq!(h, 0.0);
            assert!(h.is_sign_positive(), "len {len} gave {h}");
        }
    }

    #[test]
    fn uniform_bytes_approach_eight() {
        let data: Vec<u8> = (0..256 * 64).map(|i| (i % 256) as u8).collect();
        assert!((shannon_entropy(&data) - 8.0).abs() < 1e-9);

        // Pseudo-random stream converges toward 8.0 as it grows
        let mut x: u32 = 0x1234_5678;
        let noise: Vec<u8> = (0..1 << 20)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x >> 24) as u8
            })
            .collect();
        assert!(shannon_entropy(&noise) > 7.99);
    }

    #[test]
    fn two_symbols_is_one_bit() {
        assert!((shannon_entropy(b"abababab") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn streamed_file_matches_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let h = file_histogram(&path).unwrap();
        assert_eq!(h.len(), data.len() as u64);
        assert!((h.entropy() - shannon_entropy(&data)).abs() < 1e-12);
    }
}
