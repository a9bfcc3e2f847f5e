//! Implementation of murmur hash: [https://sites.google.com/site/murmurhash/]

use std::hash::{Hash, Hasher};

pub(crate) const STRIPE_SEED: u32 = 0xbc9f1d34;

pub fn murmur_hash(key: &[u8], seed: u32) -> u32 {
    // 'M' and 'R' are mixing constants generated offline.
    // They're not really 'magic', they just happen to work well.
    const M: u32 = 0x5bd1e995;
    const R: i32 = 24;

    // Initialize the hash to a 'random' value
    let mut h: u32 = seed ^ key.len() as u32;

    // Mix 4 bytes at a time into the hash
    let mut chunks = key.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h = h.wrapping_mul(M);
        h ^= k;
    }

    // Handle the last few bytes of the input array
    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    // Do a few final mixes of the hash to ensure the last few
    // bytes are well-incorporated.
    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// [`Hasher`] feeding every written byte through [`murmur_hash`].
///
/// Keys only need to implement [`Hash`], the bytes they write are buffered and
/// mixed once in [`Hasher::finish`].
pub(crate) struct MurmurHasher {
    buf: Vec<u8>,
    seed: u32,
}

impl MurmurHasher {
    pub(crate) fn with_seed(seed: u32) -> MurmurHasher {
        MurmurHasher {
            buf: Vec::with_capacity(32),
            seed,
        }
    }
}

impl Hasher for MurmurHasher {
    fn finish(&self) -> u64 {
        murmur_hash(&self.buf, self.seed) as u64
    }

    fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

pub(crate) fn hash_key<K: Hash + ?Sized>(key: &K) -> u32 {
    let mut hasher = MurmurHasher::with_seed(STRIPE_SEED);
    key.hash(&mut hasher);
    hasher.finish() as u32
}

#[cfg(test)]
mod tests {
    use crate::hash::{hash_key, murmur_hash};

    #[test]
    fn test_hash() {
        let h1 = murmur_hash("hello".as_bytes(), 0xbc9f1d34);
        let h2 = murmur_hash("hellp".as_bytes(), 0xbc9f1d34);
        let h3 = murmur_hash(String::from("hello").as_bytes(), 0xbc9f1d34);
        assert_eq!(h1, h3);
        assert!(hamming_distance(h1, h2) >= 16);

        let key = [0x23, 0xc9, 0x00, 0x00];
        let h3 = murmur_hash(&key, 0xf123cf13);
        assert_eq!(h3, 4037331841);
    }

    #[test]
    fn test_hash_key() {
        assert_eq!(hash_key("key1"), hash_key(&String::from("key1")));
        assert_eq!(hash_key(&42u64), hash_key(&42u64));
        assert_ne!(hash_key("key1"), hash_key("key2"));
    }

    fn hamming_distance(n1: u32, n2: u32) -> u32 {
        (n1 ^ n2).count_ones()
    }
}
