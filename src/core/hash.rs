use sha2::{Digest, Sha256};

/// SHA-256 content hashing for exact duplicate detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashService;

impl HashService {
    pub fn new() -> Self {
        Self
    }

    /// Hash bytes already loaded for decoding, so a photo is read only once.
    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }
}
