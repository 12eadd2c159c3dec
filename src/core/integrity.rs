//! Hashing and write discipline shared by every pipeline stage.
//!
//! Every artifact write goes through [`write_atomic`]: bytes land in a
//! temporary sibling first and are renamed into place, so an interrupted
//! process never leaves a half-written artifact under the final name.

use crate::core::error::AgentCertError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use ulid::Ulid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String, AgentCertError> {
    let bytes = fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

/// Compact serialization with sorted object keys.
///
/// `serde_json::Value` maps are ordered, so routing through `Value` gives
/// a stable byte string for any serializable input.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, AgentCertError> {
    let as_value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&as_value)?)
}

pub fn canonical_hash_hex<T: Serialize>(value: &T) -> Result<String, AgentCertError> {
    Ok(sha256_hex(&canonical_json_bytes(value)?))
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AgentCertError> {
    write_staged(path, bytes, None)
}

/// [`write_atomic`] for private key material: the temporary file is created
/// `0600`, so the bytes are never readable by anyone else.
pub fn write_owner_only(path: &Path, bytes: &[u8]) -> Result<(), AgentCertError> {
    write_staged(path, bytes, Some(0o600))
}

fn write_staged(path: &Path, bytes: &[u8], mode: Option<u32>) -> Result<(), AgentCertError> {
    let parent = path.parent().ok_or_else(|| {
        AgentCertError::PathError(format!("no parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, Ulid::new()));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let written = options.open(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Pretty JSON followed by a trailing newline.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), AgentCertError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

pub fn set_read_only(path: &Path) -> Result<(), AgentCertError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o444))?;
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

/// Raw hex digest text, no trailing metadata.
pub fn write_sidecar(path: &Path, digest: &str) -> Result<(), AgentCertError> {
    write_atomic(path, digest.as_bytes())?;
    set_read_only(path)
}

pub fn read_sidecar(path: &Path) -> Result<String, AgentCertError> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Write a `sha256sum`-style manifest covering every regular file in `dir`
/// except the manifest itself.
pub fn write_dir_manifest(dir: &Path, manifest_name: &str) -> Result<Vec<(String, String)>, AgentCertError> {
    let entries = hash_dir_entries(dir, manifest_name)?;
    let body = entries
        .iter()
        .map(|(name, digest)| format!("{}  {}\n", digest, name))
        .collect::<String>();
    let manifest_path = dir.join(manifest_name);
    write_atomic(&manifest_path, body.as_bytes())?;
    set_read_only(&manifest_path)?;
    Ok(entries)
}

/// Returns one message per file whose digest no longer matches the manifest.
pub fn verify_dir_manifest(dir: &Path, manifest_name: &str) -> Result<Vec<String>, AgentCertError> {
    let manifest_path = dir.join(manifest_name);
    if !manifest_path.exists() {
        return Ok(vec![format!("manifest {} missing", manifest_path.display())]);
    }
    let raw = fs::read_to_string(&manifest_path)?;
    let mut failures = Vec::new();
    let mut listed = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let Some((digest, name)) = line.split_once("  ") else {
            failures.push(format!("malformed manifest line: {}", line));
            continue;
        };
        listed.push(name.to_string());
        let path = dir.join(name);
        if !path.exists() {
            failures.push(format!("{}: missing", name));
        } else if sha256_file(&path)? != digest {
            failures.push(format!("{}: digest mismatch", name));
        }
    }
    for (name, _) in hash_dir_entries(dir, manifest_name)? {
        if !listed.contains(&name) {
            failures.push(format!("{}: not listed in manifest", name));
        }
    }
    Ok(failures)
}

fn hash_dir_entries(dir: &Path, manifest_name: &str) -> Result<Vec<(String, String)>, AgentCertError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == manifest_name || name.starts_with('.') || !entry.file_type()?.is_file() {
            continue;
        }
        entries.push((name, sha256_file(&entry.path())?));
    }
    entries.sort();
    Ok(entries)
}
