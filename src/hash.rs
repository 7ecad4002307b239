use std::hash::{Hash, Hasher};
use xxhash_rust::xxh3::{Xxh3, xxh3_64};

/// 64-bit content hash of anything implementing `Hash`.
pub fn content_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = Xxh3::new();
    value.hash(&mut hasher);
    hasher.finish()
}

pub fn bytes_hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Folds `value` into `seed` the way boost's `hash_combine` does.
pub fn hash_combine(seed: &mut u64, value: u64) {
    *seed ^= value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_deterministic() {
        let a = content_hash(&(1u32, "albedo", [0u8; 4]));
        let b = content_hash(&(1u32, "albedo", [0u8; 4]));
        assert_eq!(a, b);
        assert_ne!(a, content_hash(&(2u32, "albedo", [0u8; 4])));
    }

    #[test]
    fn test_hash_combine_is_order_sensitive() {
        let mut left = 0;
        hash_combine(&mut left, 1);
        hash_combine(&mut left, 2);

        let mut right = 0;
        hash_combine(&mut right, 2);
        hash_combine(&mut right, 1);

        assert_ne!(left, right);
    }

    #[test]
    fn test_bytes_hash_changes_with_content() {
        assert_ne!(bytes_hash(&[1, 2, 3]), bytes_hash(&[1, 2, 4]));
    }
}
