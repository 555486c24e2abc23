//! Bloom filter stored on the header page.
//!
//! The 4076 bytes of page 0 after the database header hold a 32608-bit
//! array queried before any tree descent: a negative answer is definite
//! (zero disk reads), a positive one must be verified in the tree.
//!
//! Bits are only ever added by inserts; deletes leave stale bits behind.
//! The tree rebuilds the filter from the leaf chain at open and on demand.

use forge_common::constants::{BLOOM_BITS, BLOOM_SIZE};

/// First hash: multiplicative (Knuth's 2654435761).
#[inline]
fn hash1(key: u32) -> u32 {
    ((key as u64).wrapping_mul(2_654_435_761) % BLOOM_BITS as u64) as u32
}

/// Second hash: multiplicative with the murmur3 c2 constant.
#[inline]
fn hash2(key: u32) -> u32 {
    ((key as u64).wrapping_mul(0x85eb_ca6b) % BLOOM_BITS as u64) as u32
}

/// Third hash: xor-folded multiplicative with the murmur3 c1 constant.
#[inline]
fn hash3(key: u32) -> u32 {
    let mixed = (key ^ (key >> 16)) as u64;
    (mixed.wrapping_mul(0xcc9e_2d51) % BLOOM_BITS as u64) as u32
}

/// Read-only view of the Bloom bit-array.
pub struct BloomFilter<'a> {
    bits: &'a [u8],
}

impl<'a> BloomFilter<'a> {
    /// Creates a view over the bit-array region of the header page.
    ///
    /// # Panics
    ///
    /// Panics if the slice is not the full bloom region.
    #[inline]
    pub fn new(bits: &'a [u8]) -> Self {
        assert_eq!(bits.len(), BLOOM_SIZE, "bloom view needs the full region");
        Self { bits }
    }

    /// Returns true when `key` might be present. `false` is a definite
    /// negative; `true` must be verified in the tree.
    pub fn possibly_contains(&self, key: u32) -> bool {
        get_bit(self.bits, hash1(key))
            && get_bit(self.bits, hash2(key))
            && get_bit(self.bits, hash3(key))
    }

    /// Computes occupancy statistics.
    pub fn stats(&self) -> BloomStats {
        let bits_set = self
            .bits
            .iter()
            .map(|b| b.count_ones())
            .sum::<u32>();
        BloomStats {
            bits_set,
            total_bits: BLOOM_BITS as u32,
        }
    }
}

/// Mutable view of the Bloom bit-array.
pub struct BloomFilterMut<'a> {
    bits: &'a mut [u8],
}

impl<'a> BloomFilterMut<'a> {
    /// Creates a mutable view over the bit-array region.
    ///
    /// # Panics
    ///
    /// Panics if the slice is not the full bloom region.
    #[inline]
    pub fn new(bits: &'a mut [u8]) -> Self {
        assert_eq!(bits.len(), BLOOM_SIZE, "bloom view needs the full region");
        Self { bits }
    }

    /// Sets the three bits for `key`.
    pub fn add(&mut self, key: u32) {
        set_bit(self.bits, hash1(key));
        set_bit(self.bits, hash2(key));
        set_bit(self.bits, hash3(key));
    }

    /// Zeroes the whole bit-array.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Returns true when `key` might be present.
    pub fn possibly_contains(&self, key: u32) -> bool {
        BloomFilter::new(self.bits).possibly_contains(key)
    }
}

#[inline]
fn set_bit(bits: &mut [u8], pos: u32) {
    bits[(pos / 8) as usize] |= 1 << (pos % 8);
}

#[inline]
fn get_bit(bits: &[u8], pos: u32) -> bool {
    bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0
}

/// Bloom filter occupancy statistics.
#[derive(Debug, Clone, Copy)]
pub struct BloomStats {
    /// Number of set bits.
    pub bits_set: u32,
    /// Size of the bit-array.
    pub total_bits: u32,
}

impl BloomStats {
    /// Fraction of bits set, in `[0, 1]`.
    pub fn fill_ratio(&self) -> f64 {
        self.bits_set as f64 / self.total_bits as f64
    }

    /// Estimated false-positive rate: fill ratio raised to the number of
    /// hash functions.
    pub fn estimated_fpr(&self) -> f64 {
        self.fill_ratio().powi(3)
    }
}
