//! Identity store: named, versioned Ed25519 keypairs per role.
//!
//! ```text
//! keys/<role>s/<name>/<timestamp>/identity.json   public identity block
//! keys/<role>s/<name>/<timestamp>/public.key      hex public key
//! keys/<role>s/<name>/<timestamp>/private.key     hex private key (0600)
//! keys/<role>s/<name>/latest                      alias -> <timestamp>
//! ```
//!
//! Identities are append-only. A new keygen for an existing name adds a new
//! timestamped version and moves `latest`; old versions stay resolvable so
//! previously signed artifacts can still be verified.

use crate::core::alias::AliasTable;
use crate::core::error::AgentCertError;
use crate::core::integrity;
use crate::core::layout::validate_id;
use crate::core::signing::{self, Signer};
use crate::core::time::{self, Timestamp};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

const IDENTITY_FILE: &str = "identity.json";
const PUBLIC_KEY_FILE: &str = "public.key";
const PRIVATE_KEY_FILE: &str = "private.key";
const LATEST: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Previewer,
    Certifier,
    Compiler,
    Signer,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Owner,
        Role::Previewer,
        Role::Certifier,
        Role::Compiler,
        Role::Signer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Previewer => "previewer",
            Role::Certifier => "certifier",
            Role::Compiler => "compiler",
            Role::Signer => "signer",
        }
    }

    pub fn dir_name(self) -> String {
        format!("{}s", self.as_str())
    }

    pub fn parse(raw: &str) -> Result<Self, AgentCertError> {
        let singular = raw.strip_suffix('s').unwrap_or(raw);
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == singular)
            .ok_or_else(|| {
                AgentCertError::ValidationError(format!(
                    "unknown role '{}': expected owner, previewer, certifier, compiler or signer",
                    raw
                ))
            })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public identity block, embedded verbatim into artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub role: Role,
    pub name: String,
    pub email: String,
    pub organization: String,
    pub trust_level: String,
    pub created_at: String,
    pub key_version: Timestamp,
    pub public_key: String,
    pub fingerprint: String,
}

/// Human-supplied fields for a new identity.
#[derive(Debug, Clone, Default)]
pub struct IdentityFields {
    pub name: String,
    pub email: String,
    pub organization: String,
    pub trust_level: String,
}

impl IdentityFields {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            trust_level: "standard".to_string(),
            ..Self::default()
        }
    }
}

pub struct IdentityStore {
    keys_root: PathBuf,
    aliases: Box<dyn AliasTable>,
}

impl IdentityStore {
    pub fn new(keys_root: impl Into<PathBuf>, aliases: Box<dyn AliasTable>) -> Self {
        Self {
            keys_root: keys_root.into(),
            aliases,
        }
    }

    fn role_dir(&self, role: Role) -> PathBuf {
        self.keys_root.join(role.dir_name())
    }

    fn name_dir(&self, role: Role, name: &str) -> PathBuf {
        self.role_dir(role).join(name)
    }

    pub fn create_identity(&self, role: Role, fields: &IdentityFields) -> Result<Identity, AgentCertError> {
        self.create_identity_at(role, fields, &Timestamp::now())
    }

    /// Generate a keypair and persist it under `<role>s/<name>/<timestamp>/`.
    pub fn create_identity_at(
        &self,
        role: Role,
        fields: &IdentityFields,
        timestamp: &Timestamp,
    ) -> Result<Identity, AgentCertError> {
        validate_id(role.as_str(), &fields.name)?;
        let name_dir = self.name_dir(role, &fields.name);
        let version_dir = name_dir.join(timestamp.as_str());
        if version_dir.exists() {
            return Err(AgentCertError::DuplicateIdentity(version_dir));
        }

        let key = SigningKey::generate(&mut OsRng);
        let public_bytes = key.verifying_key().to_bytes();
        let identity = Identity {
            role,
            name: fields.name.clone(),
            email: fields.email.clone(),
            organization: fields.organization.clone(),
            trust_level: if fields.trust_level.is_empty() {
                "standard".to_string()
            } else {
                fields.trust_level.clone()
            },
            created_at: time::now_rfc3339(),
            key_version: timestamp.clone(),
            public_key: hex::encode(public_bytes),
            fingerprint: signing::fingerprint(&public_bytes),
        };

        fs::create_dir_all(&name_dir)?;
        let staged = name_dir.join(format!(".{}.{}.tmp", timestamp, ulid::Ulid::new()));
        fs::create_dir(&staged)?;
        let private_path = staged.join(PRIVATE_KEY_FILE);
        integrity::write_owner_only(&private_path, hex::encode(key.to_bytes()).as_bytes())?;
        integrity::write_atomic(&staged.join(PUBLIC_KEY_FILE), identity.public_key.as_bytes())?;
        integrity::write_json_atomic(&staged.join(IDENTITY_FILE), &identity)?;
        if let Err(e) = fs::rename(&staged, &version_dir) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }

        self.aliases
            .point(&name_dir, LATEST, Path::new(timestamp.as_str()))?;
        Ok(identity)
    }

    /// Resolve `version` (`"latest"` or a key version timestamp) for a name.
    pub fn resolve_identity(&self, role: Role, name: &str, version: &str) -> Result<Identity, AgentCertError> {
        let dir = self.resolve_dir(role, name, version)?;
        let raw = fs::read_to_string(dir.join(IDENTITY_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn resolve_dir(&self, role: Role, name: &str, version: &str) -> Result<PathBuf, AgentCertError> {
        validate_id(role.as_str(), name)?;
        let not_found = || AgentCertError::IdentityNotFound {
            role: role.as_str().to_string(),
            name: name.to_string(),
            version: version.to_string(),
        };
        let name_dir = self.name_dir(role, name);
        let timestamp = if version == LATEST {
            let target = self.aliases.read(&name_dir, LATEST)?.ok_or_else(not_found)?;
            let mut parts = target.components();
            match (parts.next(), parts.next()) {
                (Some(Component::Normal(ts)), None) => {
                    Timestamp::parse(&ts.to_string_lossy()).map_err(|_| {
                        AgentCertError::InvalidAlias(format!(
                            "{}/latest points at '{}'",
                            name_dir.display(),
                            target.display()
                        ))
                    })?
                }
                _ => {
                    return Err(AgentCertError::InvalidAlias(format!(
                        "{}/latest points outside its identity directory",
                        name_dir.display()
                    )));
                }
            }
        } else {
            Timestamp::parse(version).map_err(|_| not_found())?
        };
        let dir = name_dir.join(timestamp.as_str());
        if !dir.join(IDENTITY_FILE).is_file() {
            return Err(not_found());
        }
        Ok(dir)
    }

    /// Names with an identity for `role`, each at its latest key version.
    pub fn list_identities(&self, role: Role) -> Result<Vec<Identity>, AgentCertError> {
        let dir = self.role_dir(role);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        let mut out = Vec::new();
        for name in names {
            match self.resolve_identity(role, &name, LATEST) {
                Ok(identity) => out.push(identity),
                Err(AgentCertError::IdentityNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Pick the identity a stage should use: the preferred name when given,
    /// otherwise the only identity registered for the role.
    pub fn select(&self, role: Role, preferred: Option<&str>) -> Result<Identity, AgentCertError> {
        if let Some(name) = preferred {
            return self.resolve_identity(role, name, LATEST);
        }
        let mut all = self.list_identities(role)?;
        match all.len() {
            0 => Err(AgentCertError::MissingIdentity {
                role: role.as_str().to_string(),
            }),
            1 => Ok(all.remove(0)),
            n => Err(AgentCertError::ValidationError(format!(
                "{} {} identities exist; choose one with --{} or [identities] in the config",
                n,
                role,
                role
            ))),
        }
    }

    /// Unlock the private key belonging to exactly this identity version.
    pub fn signer(&self, identity: &Identity) -> Result<Signer, AgentCertError> {
        let dir = self.resolve_dir(identity.role, &identity.name, identity.key_version.as_str())?;
        let key_path = dir.join(PRIVATE_KEY_FILE);
        let raw = fs::read_to_string(&key_path).map_err(|e| {
            AgentCertError::KeyError(format!("cannot read {}: {}", key_path.display(), e))
        })?;
        let key = signing::decode_signing_key(&raw)?;
        Signer::new(key, identity.clone(), key_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("certifier").unwrap(), Role::Certifier);
        assert_eq!(Role::parse("signers").unwrap(), Role::Signer);
        assert!(Role::parse("admin").is_err());
        assert_eq!(Role::Owner.dir_name(), "owners");
    }

    #[test]
    fn test_identity_serializes_camel_case() {
        let identity = Identity {
            role: Role::Owner,
            name: "alice".to_string(),
            email: "a@example.com".to_string(),
            organization: "acme".to_string(),
            trust_level: "high".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            key_version: Timestamp::parse("20260101T000000000Z").unwrap(),
            public_key: "00".to_string(),
            fingerprint: "ff".to_string(),
        };
        let v = serde_json::to_value(&identity).unwrap();
        assert_eq!(v["trustLevel"], "high");
        assert_eq!(v["keyVersion"], "20260101T000000000Z");
        assert_eq!(v["role"], "owner");
        assert!(v.get("privateKey").is_none());
    }
}
