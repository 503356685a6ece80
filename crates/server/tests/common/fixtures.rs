//! Test fixtures for generating test data.

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// A valid commit for upload requests.
#[allow(dead_code)]
pub const COMMIT: &str = "deadbeef01deadbeef02deadbeef03deadbeef04";

/// Repository registered by every [`super::TestServer`].
#[allow(dead_code)]
pub const REPO: &str = "github.com/acme/widgets";

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Compute SHA-256 hash of data as hex string.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Split data into parts of the given size.
#[allow(dead_code)]
pub fn split_into_parts(data: &[u8], part_size: usize) -> Vec<Bytes> {
    data.chunks(part_size).map(Bytes::copy_from_slice).collect()
}

/// Query string of an initial single-payload upload.
#[allow(dead_code)]
pub fn single_query(repo: &str) -> String {
    format!(
        "repository={repo}&commit={COMMIT}&root=src&indexerName=scip-go&indexerVersion=0.4.0"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        let a = seeded_bytes(42, 100);
        let b = seeded_bytes(42, 100);
        assert_eq!(a, b);

        let c = seeded_bytes(43, 100);
        assert_ne!(a, c);
    }

    #[test]
    fn test_split_into_parts() {
        let data = seeded_bytes(1, 100);
        let parts = split_into_parts(&data, 30);
        assert_eq!(parts.len(), 4); // 30 + 30 + 30 + 10

        let reassembled: Vec<u8> = parts.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(reassembled, data.as_ref());
    }
}
