//! Alias indirection table.
//!
//! An alias (`current`, `latest`) is a named pointer from an alias directory
//! to a relative target path. Two backends exist: real symlinks and a small
//! `aliases.json` manifest. Callers only rely on two guarantees: repointing is
//! atomic, and reading an absent alias yields `None`.

use crate::core::error::AgentCertError;
use crate::core::integrity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const ALIAS_MANIFEST: &str = "aliases.json";

pub trait AliasTable {
    /// Point `<dir>/<alias>` at `target` (relative to `dir`).
    fn point(&self, dir: &Path, alias: &str, target: &Path) -> Result<(), AgentCertError>;

    /// The raw relative target of `<dir>/<alias>`, if the alias exists.
    fn read(&self, dir: &Path, alias: &str) -> Result<Option<PathBuf>, AgentCertError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasBackend {
    Symlink,
    Manifest,
}

impl Default for AliasBackend {
    fn default() -> Self {
        if cfg!(unix) {
            AliasBackend::Symlink
        } else {
            AliasBackend::Manifest
        }
    }
}

impl AliasBackend {
    pub fn table(self) -> Box<dyn AliasTable> {
        match self {
            #[cfg(unix)]
            AliasBackend::Symlink => Box::new(SymlinkAliases),
            #[cfg(not(unix))]
            AliasBackend::Symlink => Box::new(ManifestAliases),
            AliasBackend::Manifest => Box::new(ManifestAliases),
        }
    }
}

/// Real symlinks. The replacement link is created under a temporary name and
/// renamed over the old one, so the alias is never observed missing.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SymlinkAliases;

#[cfg(unix)]
impl AliasTable for SymlinkAliases {
    fn point(&self, dir: &Path, alias: &str, target: &Path) -> Result<(), AgentCertError> {
        fs::create_dir_all(dir)?;
        let link = dir.join(alias);
        if let Ok(meta) = fs::symlink_metadata(&link) {
            if !meta.file_type().is_symlink() {
                return Err(AgentCertError::InvalidAlias(format!(
                    "{} exists and is not an alias",
                    link.display()
                )));
            }
        }
        let staged = dir.join(format!(".{}.{}.tmp", alias, ulid::Ulid::new()));
        std::os::unix::fs::symlink(target, &staged)?;
        if let Err(e) = fs::rename(&staged, &link) {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }
        Ok(())
    }

    fn read(&self, dir: &Path, alias: &str) -> Result<Option<PathBuf>, AgentCertError> {
        let link = dir.join(alias);
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => Ok(Some(fs::read_link(&link)?)),
            Ok(_) => Err(AgentCertError::InvalidAlias(format!(
                "{} is not a symlink",
                link.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// `aliases.json` in the alias directory, rewritten with write-then-rename.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestAliases;

impl ManifestAliases {
    fn load(dir: &Path) -> Result<BTreeMap<String, String>, AgentCertError> {
        let path = dir.join(ALIAS_MANIFEST);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl AliasTable for ManifestAliases {
    fn point(&self, dir: &Path, alias: &str, target: &Path) -> Result<(), AgentCertError> {
        let mut table = Self::load(dir)?;
        table.insert(alias.to_string(), target.to_string_lossy().replace('\\', "/"));
        integrity::write_json_atomic(&dir.join(ALIAS_MANIFEST), &table)
    }

    fn read(&self, dir: &Path, alias: &str) -> Result<Option<PathBuf>, AgentCertError> {
        Ok(Self::load(dir)?.get(alias).map(PathBuf::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(table: &dyn AliasTable) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("scout");
        assert!(table.read(&dir, "latest").unwrap().is_none());

        table.point(&dir, "latest", Path::new("../scout@A")).unwrap();
        assert_eq!(table.read(&dir, "latest").unwrap(), Some(PathBuf::from("../scout@A")));

        table.point(&dir, "latest", Path::new("../scout@B")).unwrap();
        assert_eq!(table.read(&dir, "latest").unwrap(), Some(PathBuf::from("../scout@B")));
        assert!(table.read(&dir, "current").unwrap().is_none());
    }

    #[test]
    fn test_manifest_aliases_repoint() {
        exercise(&ManifestAliases);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_aliases_repoint() {
        exercise(&SymlinkAliases);
    }
}
