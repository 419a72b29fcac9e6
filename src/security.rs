#![forbid(unsafe_code)]

//! Process and file hardening helpers used by the server binary and the
//! components that persist secrets.

use anyhow::{Result, bail};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use nix::unistd::Uid;
use rand_core::{OsRng, RngCore};
use std::{
    fs,
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::Path,
};
use tempfile::NamedTempFile;

/// Fails fast when the server is started as root. Token and cookie files are
/// owner-only, so running as root would leave them unreadable for the service
/// account later on.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; start it under an unprivileged account");
    }
    Ok(())
}

/// Writes `contents` to `path` through a sibling temp file and renames it into
/// place, so readers never observe a half-written secret. The result is 0600.
pub fn write_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// URL-safe random token built from `bytes` bytes of OS randomness.
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Compares two secrets without leaking the position of the first mismatch.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    // blake3::Hash equality is constant time.
    blake3::hash(a.as_bytes()) == blake3::hash(b.as_bytes())
}
