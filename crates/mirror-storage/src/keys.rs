//! Key encoding and decoding for storage layer.
//!
//! Record key format: `rec:{index}\0{objectID}`. The NUL separator keeps
//! every record of one index under a single prefix and sorts object ids of
//! the same index byte-wise, which is the scan order of facet browsing.

use crate::error::StorageError;

const SEPARATOR: u8 = 0;

/// Key for a record of a local index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    pub index: String,
    pub object_id: String,
}

impl RecordKey {
    pub fn new(index: &str, object_id: &str) -> Result<Self, StorageError> {
        if index.is_empty() || index.as_bytes().contains(&SEPARATOR) {
            return Err(StorageError::Key(format!("Invalid index name: {:?}", index)));
        }
        if object_id.is_empty() {
            return Err(StorageError::Key("Empty objectID".to_string()));
        }
        Ok(Self {
            index: index.to_string(),
            object_id: object_id.to_string(),
        })
    }

    /// Prefix shared by every record of `index`
    pub fn prefix(index: &str) -> Vec<u8> {
        let mut bytes = format!("rec:{}", index).into_bytes();
        bytes.push(SEPARATOR);
        bytes
    }

    /// First key strictly after `object_id` in `index`
    pub fn after(index: &str, object_id: &str) -> Vec<u8> {
        let mut bytes = Self::prefix(index);
        bytes.extend_from_slice(object_id.as_bytes());
        bytes.push(SEPARATOR);
        bytes
    }

    /// Exclusive upper bound of the `index` prefix
    pub fn prefix_end(index: &str) -> Vec<u8> {
        let mut bytes = format!("rec:{}", index).into_bytes();
        bytes.push(SEPARATOR + 1);
        bytes
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Self::prefix(&self.index);
        bytes.extend_from_slice(self.object_id.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let rest = bytes
            .strip_prefix(b"rec:")
            .ok_or_else(|| StorageError::Key("Missing rec: prefix".to_string()))?;
        let split = rest
            .iter()
            .position(|b| *b == SEPARATOR)
            .ok_or_else(|| StorageError::Key("Missing separator".to_string()))?;
        let index = std::str::from_utf8(&rest[..split])
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
        let object_id = std::str::from_utf8(&rest[split + 1..])
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
        Self::new(index, object_id)
    }
}

/// Key for pipeline checkpoints
/// Format: checkpoint:{name}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKey {
    pub name: String,
}

impl CheckpointKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("checkpoint:{}", self.name).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_roundtrip() {
        let key = RecordKey::new("npm-search", "@babel/core").unwrap();
        let decoded = RecordKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_record_keys_stay_inside_prefix() {
        let key = RecordKey::new("a", "zzz").unwrap().to_bytes();
        assert!(key.starts_with(&RecordKey::prefix("a")));
        assert!(key < RecordKey::prefix_end("a"));

        // "a.b" must not fall inside index "a"
        let other = RecordKey::new("a.b", "x").unwrap().to_bytes();
        assert!(!other.starts_with(&RecordKey::prefix("a")));
    }

    #[test]
    fn test_after_skips_exact_id() {
        let exact = RecordKey::new("i", "left").unwrap().to_bytes();
        let longer = RecordKey::new("i", "left-pad").unwrap().to_bytes();
        let after = RecordKey::after("i", "left");
        assert!(exact < after);
        assert!(longer > after);
    }

    #[test]
    fn test_invalid_keys() {
        assert!(RecordKey::new("", "x").is_err());
        assert!(RecordKey::new("bad\0index", "x").is_err());
        assert!(RecordKey::new("i", "").is_err());
    }

    #[test]
    fn test_checkpoint_key() {
        assert_eq!(CheckpointKey::new("main").to_bytes(), b"checkpoint:main".to_vec());
    }
}
