//! Append-only versioned entity storage.
//!
//! Every mutable source document lives in its own directory
//! `data/<kind>/<id>@<timestamp>/<kind>.json`. Versions are never rewritten;
//! the `current` and `latest` aliases under `data/<kind>/<id>/` decide which
//! version is active.

use crate::core::alias::AliasTable;
use crate::core::error::AgentCertError;
use crate::core::integrity;
use crate::core::layout::validate_id;
use crate::core::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Agent,
    Plan,
    Criteria,
    Conventions,
    Owner,
    Byo,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Agent,
        EntityKind::Plan,
        EntityKind::Criteria,
        EntityKind::Conventions,
        EntityKind::Owner,
        EntityKind::Byo,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Agent => "agent",
            EntityKind::Plan => "plan",
            EntityKind::Criteria => "criteria",
            EntityKind::Conventions => "conventions",
            EntityKind::Owner => "owner",
            EntityKind::Byo => "byo",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            EntityKind::Agent => "agents",
            EntityKind::Plan => "plans",
            EntityKind::Criteria => "criteria",
            EntityKind::Conventions => "conventions",
            EntityKind::Owner => "owners",
            EntityKind::Byo => "byo",
        }
    }

    pub fn payload_file(self) -> String {
        format!("{}.json", self.label())
    }

    pub fn parse(raw: &str) -> Result<Self, AgentCertError> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.label() == raw || k.dir_name() == raw)
            .ok_or_else(|| {
                AgentCertError::ValidationError(format!(
                    "unknown entity kind '{}': expected one of agent, plan, criteria, conventions, owner, byo",
                    raw
                ))
            })
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alias {
    Current,
    Latest,
}

impl Alias {
    pub fn as_str(self) -> &'static str {
        match self {
            Alias::Current => "current",
            Alias::Latest => "latest",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AgentCertError> {
        match raw {
            "current" => Ok(Alias::Current),
            "latest" => Ok(Alias::Latest),
            other => Err(AgentCertError::InvalidAlias(format!(
                "unknown alias '{}': expected current or latest",
                other
            ))),
        }
    }
}

/// One concrete version of an entity on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityVersion {
    pub kind: EntityKind,
    pub id: String,
    pub timestamp: Timestamp,
    pub path: PathBuf,
}

impl EntityVersion {
    /// `<id>@<timestamp>`, the name of the version directory.
    pub fn lineage(&self) -> String {
        format!("{}@{}", self.id, self.timestamp)
    }

    pub fn payload_path(&self) -> PathBuf {
        self.path.join(self.kind.payload_file())
    }
}

pub struct VersionedStore {
    data_root: PathBuf,
    aliases: Box<dyn AliasTable>,
}

impl VersionedStore {
    pub fn new(data_root: impl Into<PathBuf>, aliases: Box<dyn AliasTable>) -> Self {
        Self {
            data_root: data_root.into(),
            aliases,
        }
    }

    pub fn kind_dir(&self, kind: EntityKind) -> PathBuf {
        self.data_root.join(kind.dir_name())
    }

    pub fn version_dir(&self, kind: EntityKind, id: &str, timestamp: &Timestamp) -> PathBuf {
        self.kind_dir(kind).join(format!("{}@{}", id, timestamp))
    }

    fn alias_dir(&self, kind: EntityKind, id: &str) -> PathBuf {
        self.kind_dir(kind).join(id)
    }

    /// Create `<kind>/<id>@<timestamp>/` holding `payload`. Aliases are untouched.
    pub fn write_version(
        &self,
        kind: EntityKind,
        id: &str,
        timestamp: &Timestamp,
        payload: &Value,
    ) -> Result<EntityVersion, AgentCertError> {
        validate_id(kind.label(), id)?;
        let dir = self.version_dir(kind, id, timestamp);
        if dir.exists() {
            return Err(AgentCertError::VersionExists(dir));
        }
        let parent = self.kind_dir(kind);
        fs::create_dir_all(&parent)?;

        // Stage the whole directory, then rename it into place.
        let staged = parent.join(format!(".{}@{}.{}.tmp", id, timestamp, ulid::Ulid::new()));
        fs::create_dir(&staged)?;
        integrity::write_json_atomic(&staged.join(kind.payload_file()), payload)?;
        if let Err(e) = fs::rename(&staged, &dir) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }

        Ok(EntityVersion {
            kind,
            id: id.to_string(),
            timestamp: timestamp.clone(),
            path: dir,
        })
    }

    /// Repoint `<kind>/<id>/<alias>` at an existing version.
    ///
    /// The target is checked before anything is touched, so a bogus
    /// timestamp leaves the previous alias intact.
    pub fn set_alias(
        &self,
        kind: EntityKind,
        id: &str,
        alias: Alias,
        timestamp: &Timestamp,
    ) -> Result<EntityVersion, AgentCertError> {
        validate_id(kind.label(), id)?;
        let target_dir = self.version_dir(kind, id, timestamp);
        if !target_dir.is_dir() {
            return Err(AgentCertError::NotFound(format!(
                "cannot alias {}/{}/{}: version {}@{} does not exist",
                kind.dir_name(),
                id,
                alias.as_str(),
                id,
                timestamp
            )));
        }
        let relative = Path::new("..").join(format!("{}@{}", id, timestamp));
        self.aliases
            .point(&self.alias_dir(kind, id), alias.as_str(), &relative)?;
        Ok(EntityVersion {
            kind,
            id: id.to_string(),
            timestamp: timestamp.clone(),
            path: target_dir,
        })
    }

    /// Resolve one alias. Dangling aliases resolve to `None`; aliases that
    /// leave the entity's own sibling directories are rejected.
    pub fn resolve_alias(
        &self,
        kind: EntityKind,
        id: &str,
        alias: Alias,
    ) -> Result<Option<EntityVersion>, AgentCertError> {
        validate_id(kind.label(), id)?;
        let Some(target) = self.aliases.read(&self.alias_dir(kind, id), alias.as_str())? else {
            return Ok(None);
        };
        let timestamp = parse_sibling_target(&target, id).ok_or_else(|| {
            AgentCertError::InvalidAlias(format!(
                "{}/{}/{} points at '{}', which is not a version of the same entity",
                kind.dir_name(),
                id,
                alias.as_str(),
                target.display()
            ))
        })?;
        let path = self.version_dir(kind, id, &timestamp);
        if !path.is_dir() {
            return Ok(None);
        }
        Ok(Some(EntityVersion {
            kind,
            id: id.to_string(),
            timestamp,
            path,
        }))
    }

    /// `current` wins over `latest`.
    pub fn try_resolve_active(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<EntityVersion>, AgentCertError> {
        if let Some(v) = self.resolve_alias(kind, id, Alias::Current)? {
            return Ok(Some(v));
        }
        self.resolve_alias(kind, id, Alias::Latest)
    }

    pub fn resolve_active(&self, kind: EntityKind, id: &str) -> Result<EntityVersion, AgentCertError> {
        self.try_resolve_active(kind, id)?
            .ok_or_else(|| AgentCertError::NoActiveVersion {
                entity: kind.label().to_string(),
                id: id.to_string(),
            })
    }

    /// All versions of an entity, oldest first.
    pub fn list_versions(&self, kind: EntityKind, id: &str) -> Result<Vec<Timestamp>, AgentCertError> {
        validate_id(kind.label(), id)?;
        let dir = self.kind_dir(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}@", id);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(raw) = name.strip_prefix(&prefix) {
                if entry.file_type()?.is_dir() {
                    if let Ok(ts) = Timestamp::parse(raw) {
                        out.push(ts);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn read_payload(&self, version: &EntityVersion) -> Result<Value, AgentCertError> {
        let path = version.payload_path();
        let raw = fs::read_to_string(&path).map_err(|e| {
            AgentCertError::NotFound(format!("{}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AgentCertError::ValidationError(format!("invalid JSON in {}: {}", path.display(), e))
        })
    }

    /// Rewrite the payload of an existing version. Only self-heal uses this;
    /// the caller is responsible for logging the mutation.
    pub fn rewrite_payload(&self, version: &EntityVersion, payload: &Value) -> Result<(), AgentCertError> {
        integrity::write_json_atomic(&version.payload_path(), payload)
    }
}

fn parse_sibling_target(target: &Path, id: &str) -> Option<Timestamp> {
    let mut components = target.components();
    if components.next() != Some(Component::ParentDir) {
        return None;
    }
    let Some(Component::Normal(name)) = components.next() else {
        return None;
    };
    if components.next().is_some() {
        return None;
    }
    let name = name.to_str()?;
    let (owner, raw_ts) = name.split_once('@')?;
    if owner != id {
        return None;
    }
    Timestamp::parse(raw_ts).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sibling_target() {
        let ts = "20260101T000000000Z";
        assert!(parse_sibling_target(Path::new(&format!("../scout@{}", ts)), "scout").is_some());
        assert!(parse_sibling_target(Path::new(&format!("../other@{}", ts)), "scout").is_none());
        assert!(parse_sibling_target(Path::new(&format!("../../plans/scout@{}", ts)), "scout").is_none());
        assert!(parse_sibling_target(Path::new(&format!("scout@{}", ts)), "scout").is_none());
        assert!(parse_sibling_target(Path::new("../scout@yesterday"), "scout").is_none());
    }

    #[test]
    fn test_entity_kind_parse_accepts_plural() {
        assert_eq!(EntityKind::parse("agents").unwrap(), EntityKind::Agent);
        assert_eq!(EntityKind::parse("criteria").unwrap(), EntityKind::Criteria);
        assert!(EntityKind::parse("widgets").is_err());
    }
}
