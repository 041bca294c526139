use std::time::Duration;

use anyhow::{Context, Result};

use super::crypto::{self, SealedValue};
use super::db::encode;
use super::model::*;

impl super::db::Store {
    /// Load the full link record; absent keys fall back to an unlinked state.
    pub fn load_link_record(&self) -> Result<LinkRecord> {
        let verification_token = match self.get::<SealedValue>(KEY_VERIFICATION_TOKEN)? {
            Some(sealed) => {
                let plain = crypto::open(&self.key, &sealed)
                    .context("open sealed verification token")?;
                Some(String::from_utf8(plain.to_vec()).context("verification token is not utf-8")?)
            }
            None => None,
        };

        Ok(LinkRecord {
            linked: self.get::<bool>(KEY_LINKED)?.unwrap_or(false),
            server_id: self.get::<String>(KEY_SERVER_ID)?.unwrap_or_default(),
            owner_uuid: self.get::<String>(KEY_OWNER_UUID)?,
            server_uuid: self.get::<String>(KEY_SERVER_UUID)?,
            verification_token,
        })
    }

    /// Persist every field of `record` atomically.
    pub fn save_link_record(&self, record: &LinkRecord) -> Result<()> {
        let sealed_token = match &record.verification_token {
            Some(token) => Some(encode(
                KEY_VERIFICATION_TOKEN,
                &crypto::seal(&self.key, token.as_bytes())?,
            )?),
            None => None,
        };

        self.put_many(&[
            (KEY_LINKED, Some(encode(KEY_LINKED, &record.linked)?)),
            (KEY_SERVER_ID, Some(encode(KEY_SERVER_ID, &record.server_id)?)),
            (
                KEY_OWNER_UUID,
                record
                    .owner_uuid
                    .as_ref()
                    .map(|v| encode(KEY_OWNER_UUID, v))
                    .transpose()?,
            ),
            (
                KEY_SERVER_UUID,
                record
                    .server_uuid
                    .as_ref()
                    .map(|v| encode(KEY_SERVER_UUID, v))
                    .transpose()?,
            ),
            (KEY_VERIFICATION_TOKEN, sealed_token),
        ])
    }

    pub fn validation_ttl(&self) -> Result<Duration> {
        let secs = self
            .get::<u64>(KEY_VALIDATION_TTL)?
            .unwrap_or(DEFAULT_VALIDATION_TTL_SECS);
        Ok(Duration::from_secs(secs))
    }

    pub fn set_validation_ttl(&self, ttl: Duration) -> Result<()> {
        self.put(KEY_VALIDATION_TTL, &ttl.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{crypto, Store};
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("gatekeep.db"), crypto::generate_key()).unwrap();
        (dir, store)
    }

    #[test]
    fn empty_store_is_unlinked_with_default_ttl() {
        let (_dir, store) = open_temp();
        let rec = store.load_link_record().unwrap();
        assert_eq!(rec, LinkRecord::default());
        assert_eq!(store.validation_ttl().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn link_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatekeep.db");
        let key_bytes = [9u8; 32];
        let rec = LinkRecord {
            linked: true,
            server_id: "u1".into(),
            owner_uuid: Some("owner-1".into()),
            server_uuid: Some("u1".into()),
            verification_token: Some("tok-123".into()),
        };

        {
            let store = Store::open(&path, crypto::load_key(&key_bytes).unwrap()).unwrap();
            store.save_link_record(&rec).unwrap();
        }

        let store = Store::open(&path, crypto::load_key(&key_bytes).unwrap()).unwrap();
        assert_eq!(store.load_link_record().unwrap(), rec);
    }

    #[test]
    fn token_is_not_stored_in_plaintext() {
        let (_dir, store) = open_temp();
        let rec = LinkRecord {
            linked: true,
            verification_token: Some("plaintext-token".into()),
            ..Default::default()
        };
        store.save_link_record(&rec).unwrap();
        let sealed = store
            .get::<SealedValue>(KEY_VERIFICATION_TOKEN)
            .unwrap()
            .unwrap();
        assert!(!sealed
            .ciphertext
            .windows(b"plaintext-token".len())
            .any(|w| w == b"plaintext-token"));
    }

    #[test]
    fn saving_cleared_record_removes_owner_and_token() {
        let (_dir, store) = open_temp();
        let mut rec = LinkRecord {
            linked: true,
            server_id: "u1".into(),
            owner_uuid: Some("o".into()),
            server_uuid: Some("u1".into()),
            verification_token: Some("t".into()),
        };
        store.save_link_record(&rec).unwrap();
        rec.clear_link();
        store.save_link_record(&rec).unwrap();

        let loaded = store.load_link_record().unwrap();
        assert!(!loaded.linked);
        assert_eq!(loaded.owner_uuid, None);
        assert_eq!(loaded.verification_token, None);
        assert_eq!(loaded.server_uuid.as_deref(), Some("u1"));
    }

    #[test]
    fn ttl_round_trips() {
        let (_dir, store) = open_temp();
        store.set_validation_ttl(Duration::from_secs(42)).unwrap();
        assert_eq!(store.validation_ttl().unwrap(), Duration::from_secs(42));
    }
}
