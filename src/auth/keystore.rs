//! Credential store loaded from a JSON key file.
//!
//! ```json
//! { "keys": [ { "access_key": "...", "secret": "...", "created": "2024-01-01T00:00:00Z" } ] }
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::Credential;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse key file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("key file contains no keys")]
    Empty,
    #[error("access key '{0}' appears more than once")]
    Duplicate(String),
}

#[derive(Deserialize)]
struct KeyFile {
    keys: Vec<KeyEntry>,
}

#[derive(Deserialize)]
struct KeyEntry {
    access_key: String,
    secret: String,
    created: DateTime<Utc>,
}

/// Credential paired with the time it was issued.
#[derive(Debug, Clone)]
pub struct StoredKey {
    pub credential: Credential,
    pub created: DateTime<Utc>,
}

/// Set of credentials available to the client.
#[derive(Debug, Clone)]
pub struct KeyStore {
    keys: Vec<StoredKey>,
}

impl KeyStore {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, KeyStoreError> {
        let file: KeyFile = serde_json::from_reader(reader)?;
        Self::from_entries(file.keys)
    }

    pub fn from_json_str(json: &str) -> Result<Self, KeyStoreError> {
        let file: KeyFile = serde_json::from_str(json)?;
        Self::from_entries(file.keys)
    }

    fn from_entries(entries: Vec<KeyEntry>) -> Result<Self, KeyStoreError> {
        if entries.is_empty() {
            return Err(KeyStoreError::Empty);
        }

        let mut seen = HashSet::with_capacity(entries.len());
        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            if !seen.insert(entry.access_key.clone()) {
                return Err(KeyStoreError::Duplicate(entry.access_key));
            }
            keys.push(StoredKey {
                credential: Credential::new(entry.access_key, entry.secret),
                created: entry.created,
            });
        }

        log::debug!("loaded {} credential(s)", keys.len());
        Ok(Self { keys })
    }

    /// Most recently issued credential.
    pub fn newest(&self) -> Option<&Credential> {
        self.keys
            .iter()
            .max_by_key(|key| key.created)
            .map(|key| &key.credential)
    }

    pub fn get(&self, access_key: &str) -> Option<&Credential> {
        self.keys
            .iter()
            .find(|key| key.credential.access_key() == access_key)
            .map(|key| &key.credential)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KEYS: &str = r#"{
        "keys": [
            { "access_key": "old", "secret": "s1", "created": "2023-01-01T00:00:00Z" },
            { "access_key": "new", "secret": "s2", "created": "2024-06-01T12:00:00Z" },
            { "access_key": "mid", "secret": "s3", "created": "2023-09-15T08:30:00Z" }
        ]
    }"#;

    #[test]
    fn selects_newest_key() {
        let store = KeyStore::from_json_str(KEYS).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.newest().unwrap().access_key(), "new");
        assert_eq!(store.get("mid").unwrap().access_key(), "mid");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn loads_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KEYS.as_bytes()).unwrap();

        let store = KeyStore::from_path(file.path()).unwrap();
        assert_eq!(store.newest().unwrap().access_key(), "new");
    }

    #[test]
    fn rejects_empty_and_duplicate_files() {
        assert!(matches!(
            KeyStore::from_json_str(r#"{"keys": []}"#),
            Err(KeyStoreError::Empty)
        ));

        let duplicate = r#"{"keys": [
            { "access_key": "a", "secret": "1", "created": "2023-01-01T00:00:00Z" },
            { "access_key": "a", "secret": "2", "created": "2024-01-01T00:00:00Z" }
        ]}"#;
        assert!(matches!(
            KeyStore::from_json_str(duplicate),
            Err(KeyStoreError::Duplicate(key)) if key == "a"
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            KeyStore::from_json_str("{ not json"),
            Err(KeyStoreError::Parse(_))
        ));
    }
}
