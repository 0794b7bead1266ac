//! Local file system access: directory walking and content hashing.

pub mod fingerprint;
pub mod walker;
