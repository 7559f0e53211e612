use std::fmt;

/// Content hash used to key the build cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        ContentHash(blake3::hash(bytes))
    }

    pub fn of_str(text: &str) -> Self {
        Self::of(text.as_bytes())
    }

    /// Order-dependent combination of two hashes.
    pub fn combine(&self, other: &ContentHash) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.0.as_bytes());
        hasher.update(other.0.as_bytes());
        ContentHash(hasher.finalize())
    }

    /// Short hex form used for directory and lock names.
    pub fn short_hex(&self) -> String {
        self.0.to_hex().as_str()[..16].to_string()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short_hex())
    }
}
