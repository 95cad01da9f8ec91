use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content-derived key shared by the memory and disk tiers.
///
/// The digest covers a length-prefixed encoding of `(content, label)`, so two
/// pairs can only share a key if both fields are byte-identical. `None` and
/// `Some("")` are distinct labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn derive(content: &[u8], label: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content);
        match label {
            Some(label) => {
                hasher.update([1u8]);
                hasher.update((label.len() as u64).to_le_bytes());
                hasher.update(label.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Name of the disk-tier file holding this entry.
    pub fn file_name(&self) -> String {
        format!("{}.pdf", self.to_hex())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_hex()
    }
}

impl TryFrom<String> for CacheKey {
    type Error = hex::FromHexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(value, &mut bytes)?;
        Ok(Self(bytes))
    }
}
