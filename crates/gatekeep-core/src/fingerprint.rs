//! Content identity of a module: SHA-256 over its installed package bytes,
//! lower-case hex. Byte-identical packages share an identity.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

use crate::error::{GateError, GateResult};
use crate::host::HostModule;

pub fn fingerprint_reader(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn content_identity(module: &dyn HostModule) -> GateResult<String> {
    module
        .open_package()
        .and_then(fingerprint_reader)
        .map_err(|e| GateError::Integrity(format!("{}: {e}", module.name())))
}

/// Log-friendly prefix of an identity.
pub fn short(identity: &str) -> &str {
    identity.get(..16).unwrap_or(identity)
}
