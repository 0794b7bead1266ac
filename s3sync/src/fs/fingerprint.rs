//! Content fingerprints for local files.
//!
//! Local fingerprints use the canonical format `sha256:<hex>`. Remote
//! fingerprints are whatever the store reports and are compared verbatim.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Prefix for all fingerprints produced by this module
pub const PREFIX: &str = "sha256:";

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Stream a file through SHA-256.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    hash_reader(file)
}

/// Hash everything readable from `reader`.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
    }

    Ok(finish(hasher))
}

/// Format a finished hasher as a fingerprint.
pub fn finish(hasher: Sha256) -> String {
    format!("{}{:x}", PREFIX, hasher.finalize())
}

pub fn hash_bytes(content: &[u8]) -> String {
    format!("{}{:x}", PREFIX, Sha256::digest(content))
}

/// Whether a fingerprint was produced by this module.
pub fn is_content_digest(fingerprint: &str) -> bool {
    fingerprint.starts_with(PREFIX)
}
