use anyhow::{anyhow, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// 32-byte ChaCha20-Poly1305 key used to seal credentials at rest.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

pub fn generate_key() -> EncryptionKey {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    EncryptionKey(bytes)
}

/// Returns `None` unless `bytes` is exactly 32 bytes long.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let arr: [u8; 32] = bytes.try_into().ok()?;
    Some(EncryptionKey(arr))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedValue {
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<SealedValue> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow!("seal failed"))?;
    Ok(SealedValue { nonce, ciphertext })
}

pub fn open(key: &EncryptionKey, sealed: &SealedValue) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| anyhow!("sealed value failed authentication (wrong key or corrupt data)"))
}
