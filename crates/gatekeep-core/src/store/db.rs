use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::crypto::EncryptionKey;

pub(crate) const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Durable key-value store for the link state. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
    pub(crate) key: Arc<EncryptionKey>,
}

impl Store {
    pub fn open(path: &Path, key: EncryptionKey) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("open database at {}", path.display()))?;

        // Make sure the table exists so read transactions never miss it.
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(SETTINGS)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            key: Arc::new(key),
        })
    }

    pub(crate) fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS)?;
        let Some(guard) = table.get(key)? else {
            return Ok(None);
        };
        let (value, _): (T, _) =
            bincode::serde::decode_from_slice(guard.value(), bincode::config::standard())
                .with_context(|| format!("bincode decode {key}"))?;
        Ok(Some(value))
    }

    /// Write a batch of entries in one transaction. `None` removes the key.
    pub(crate) fn put_many(&self, entries: &[(&str, Option<Vec<u8>>)]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS)?;
            for (key, value) in entries {
                match value {
                    Some(bytes) => {
                        table.insert(*key, bytes.as_slice())?;
                    }
                    None => {
                        table.remove(*key)?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub(crate) fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put_many(&[(key, Some(encode(key, value)?))])
    }
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .with_context(|| format!("bincode encode {key}"))
}
