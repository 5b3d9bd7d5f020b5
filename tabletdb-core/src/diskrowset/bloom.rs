//! Bloom filter over encoded primary keys

use crate::encoding::EncodedKey;
use crate::{Result, TabletError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const SECOND_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Probabilistic key membership filter
///
/// Hashes are derived from the key's CRC32 so a filter written by one
/// process is readable by any other.
#[derive(Debug, Clone)]
pub struct KeyBloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl KeyBloomFilter {
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (num_keys.max(1) * bits_per_key.max(1)).max(64);
        let num_bytes = (num_bits + 7) / 8;
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as usize;

        Self {
            bits: vec![0u8; num_bytes],
            num_bits: num_bytes * 8,
            num_hashes: num_hashes.clamp(1, 30),
        }
    }

    pub fn add(&mut self, key: &EncodedKey) {
        let (h1, h2) = Self::hash(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// False means the key is definitely absent
    pub fn may_contain(&self, key: &EncodedKey) -> bool {
        let (h1, h2) = Self::hash(key);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_position(h1, h2, i);
            (self.bits[bit / 8] >> (bit % 8)) & 1 == 1
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.bits.len() + 5);
        buf.put_u32_le(self.bits.len() as u32);
        buf.put_u8(self.num_hashes as u8);
        buf.put_slice(&self.bits);
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(TabletError::InvalidFormat("Bloom filter data too short".into()));
        }
        let mut cursor = data;
        let size = cursor.get_u32_le() as usize;
        let num_hashes = cursor.get_u8() as usize;
        if cursor.len() < size || size == 0 || num_hashes == 0 {
            return Err(TabletError::InvalidFormat("Bad bloom filter header".into()));
        }
        Ok(Self {
            bits: cursor[..size].to_vec(),
            num_bits: size * 8,
            num_hashes,
        })
    }

    fn hash(key: &EncodedKey) -> (u64, u64) {
        let h1 = mix(crc32fast::hash(key.as_bytes()) as u64);
        let h2 = mix(h1 ^ SECOND_SEED) | 1;
        (h1, h2)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: usize) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }
}

fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> EncodedKey {
        EncodedKey::from_bytes(i.to_be_bytes().to_vec())
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = KeyBloomFilter::new(1000, 10);
        for i in 0..1000 {
            filter.add(&key(i));
        }
        let restored = KeyBloomFilter::from_bytes(&filter.to_bytes()).unwrap();
        for i in 0..1000 {
            assert!(restored.may_contain(&key(i)));
        }

        let false_positives = (1000..11000).filter(|i| restored.may_contain(&key(*i))).count();
        assert!(false_positives < 500, "too many false positives: {}", false_positives);
    }
}
