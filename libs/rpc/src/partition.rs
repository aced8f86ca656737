//! Key to partition mapping
//!
//! `partition_id = hash_to_index(murmur3(key bytes), partition_count)`.
//! The hash is MurmurHash3 x86 32-bit with a fixed seed so that every client
//! and server in a cluster agrees on the mapping. Integer keys hash their
//! little-endian bytes.

/// Seed shared by every participant
pub const HASH_SEED: u32 = 0x0100_0193;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// MurmurHash3, x86 32-bit variant
pub fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    let mut hash = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        hash ^= mix_k(k);
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    let mut k = 0u32;
    if tail.len() >= 3 {
        k ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        k ^= u32::from(tail[1]) << 8;
    }
    if let Some(&first) = tail.first() {
        k ^= u32::from(first);
        hash ^= mix_k(k);
    }

    hash ^= data.len() as u32;
    fmix32(hash)
}

#[inline]
fn mix_k(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

#[inline]
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Fold a signed hash onto `0..count`
///
/// `i32::MIN` has no positive counterpart and maps to 0.
pub fn hash_to_index(hash: i32, count: u32) -> u32 {
    if count == 0 || hash == i32::MIN {
        return 0;
    }
    hash.unsigned_abs() % count
}

/// Anything that can be routed to a partition
pub trait PartitionKey {
    fn partition_hash(&self) -> i32;
}

impl PartitionKey for [u8] {
    fn partition_hash(&self) -> i32 {
        murmur3_x86_32(self, HASH_SEED) as i32
    }
}

impl PartitionKey for Vec<u8> {
    fn partition_hash(&self) -> i32 {
        self.as_slice().partition_hash()
    }
}

impl PartitionKey for str {
    fn partition_hash(&self) -> i32 {
        self.as_bytes().partition_hash()
    }
}

impl PartitionKey for String {
    fn partition_hash(&self) -> i32 {
        self.as_bytes().partition_hash()
    }
}

impl PartitionKey for i64 {
    fn partition_hash(&self) -> i32 {
        self.to_le_bytes().as_slice().partition_hash()
    }
}

impl PartitionKey for i32 {
    fn partition_hash(&self) -> i32 {
        self.to_le_bytes().as_slice().partition_hash()
    }
}

/// Partition owning `key`
pub fn partition_for<K: PartitionKey + ?Sized>(key: &K, partition_count: u32) -> u32 {
    hash_to_index(key.partition_hash(), partition_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reference_vectors() {
        assert_eq!(murmur3_x86_32(b"", 0), 0);
        assert_eq!(murmur3_x86_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_x86_32(b"test", 0), 0xba6b_d213);
        assert_eq!(
            murmur3_x86_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
        assert_eq!(murmur3_x86_32(b"hello", HASH_SEED), 0x54f3_302a);
    }

    #[test]
    fn test_integer_keys_are_stable() {
        assert_eq!(0i64.partition_hash() as u32, 0xd191_a721);
        assert_eq!(partition_for(&0i64, 271), 109);
        assert_eq!(partition_for(&1i64, 271), 219);
        assert_eq!(partition_for(&42i64, 271), 145);
        assert_eq!(partition_for(&-1i64, 271), 231);
    }

    #[test]
    fn test_string_and_bytes_agree() {
        assert_eq!(partition_for("alpha", 271), 153);
        assert_eq!(partition_for(&b"alpha"[..], 271), 153);
        assert_eq!(partition_for(&"key-1".to_string(), 271), 107);
    }

    #[test]
    fn test_hash_to_index_edges() {
        assert_eq!(hash_to_index(i32::MIN, 271), 0);
        assert_eq!(hash_to_index(-5, 3), 2);
        assert_eq!(hash_to_index(5, 3), 2);
        assert_eq!(hash_to_index(12345, 0), 0);
    }

    proptest! {
        #[test]
        fn prop_partition_in_range(key in proptest::collection::vec(any::<u8>(), 0..64), count in 1u32..2048) {
            prop_assert!(partition_for(key.as_slice(), count) < count);
        }

        #[test]
        fn prop_i64_matches_le_bytes(key in any::<i64>()) {
            prop_assert_eq!(key.partition_hash(), key.to_le_bytes().as_slice().partition_hash());
        }
    }
}
