//! Cache key derivation.

use sha2::{Digest, Sha256};

/// Length in bytes of the truncated digest backing a key.
const KEY_BYTES: usize = 16;

/// Stable identifier of one cached rendition of an image.
///
/// Derived from the locator, the optional size hint and the optional variant suffix.
/// The same triple always maps to the same key, across runs and processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for a locator, size hint and variant.
    ///
    /// Each component is length-prefixed before hashing so that, for example, a
    /// variant of `"mp=100"` cannot alias a size hint of `100`.
    #[must_use]
    pub fn derive(locator: &str, max_dimension: Option<u32>, variant: Option<&str>) -> Self {
        let mut hasher = Sha256::new();

        hasher.update((locator.len() as u64).to_le_bytes());
        hasher.update(locator.as_bytes());

        match max_dimension {
            Some(mp) => {
                hasher.update([1u8]);
                hasher.update(mp.to_le_bytes());
            }
            None => hasher.update([0u8]),
        }

        match variant {
            Some(suffix) => {
                hasher.update([1u8]);
                hasher.update((suffix.len() as u64).to_le_bytes());
                hasher.update(suffix.as_bytes());
            }
            None => hasher.update([0u8]),
        }

        let digest = hasher.finalize();
        Self(hex::encode(&digest[..KEY_BYTES]))
    }

    /// Returns the hex representation used for file names.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the disk file name for this key.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.img", self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
