//! Command subsystems. Each one owns a clap `*Cli`, a `run_*_cli`
//! dispatcher and a `schema()` description.

pub mod certify;
pub mod compile;
pub mod entity;
pub mod keygen;
pub mod preview;
pub mod verify;

use crate::core::audit::EventLog;
use crate::core::config::Config;
use crate::core::error::AgentCertError;
use crate::core::identity::IdentityStore;
use crate::core::layout::{self, Workspace};
use crate::core::time::{self, Timestamp};
use crate::core::versioned::VersionedStore;
use clap::ValueEnum;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Workspace, loaded config and output format for one invocation.
pub struct Session {
    pub workspace: Workspace,
    pub config: Config,
    pub format: OutputFormat,
}

impl Session {
    /// `root` wins; otherwise walk up from the current directory.
    pub fn open(root: Option<PathBuf>, format: OutputFormat) -> Result<Self, AgentCertError> {
        let root = match root {
            Some(root) => root,
            None => layout::find_workspace_root(&std::env::current_dir()?)?,
        };
        let workspace = Workspace::new(root);
        let config = Config::load(&workspace)?;
        Ok(Self {
            workspace,
            config,
            format,
        })
    }

    pub fn store(&self) -> VersionedStore {
        store_for(&self.workspace, &self.config)
    }

    pub fn identities(&self) -> IdentityStore {
        identities_for(&self.workspace, &self.config)
    }

    pub fn events(&self) -> EventLog {
        EventLog::new(&self.workspace.logs_dir())
    }

    /// Print a command result: the envelope in JSON mode, `text` otherwise.
    pub fn emit(&self, cmd: &str, data: Value, text: impl FnOnce() -> String) -> Result<(), AgentCertError> {
        match self.format {
            OutputFormat::Json => {
                let envelope = time::command_envelope(cmd, "ok", data);
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            }
            OutputFormat::Text => println!("{}", text()),
        }
        Ok(())
    }
}

pub(crate) fn store_for(workspace: &Workspace, config: &Config) -> VersionedStore {
    VersionedStore::new(workspace.data_dir(), config.store.alias_backend.table())
}

pub(crate) fn identities_for(workspace: &Workspace, config: &Config) -> IdentityStore {
    IdentityStore::new(workspace.keys_dir(), config.store.alias_backend.table())
}

/// Pick the `<agent>@<birth>` directory under `parent` for a stage input:
/// the lineage of the active agent version when it exists, else the newest.
pub(crate) fn locate_lineage_dir(
    parent: &Path,
    store: &VersionedStore,
    agent: &str,
) -> Result<Option<PathBuf>, AgentCertError> {
    layout::validate_id("agent", agent)?;
    if let Some(active) = store.try_resolve_active(crate::core::versioned::EntityKind::Agent, agent)? {
        let dir = parent.join(active.lineage());
        if dir.is_dir() {
            return Ok(Some(dir));
        }
    }
    if !parent.is_dir() {
        return Ok(None);
    }
    let prefix = format!("{}@", agent);
    let mut newest: Option<(Timestamp, PathBuf)> = None;
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(raw) = name.strip_prefix(&prefix) else {
            continue;
        };
        let Ok(ts) = Timestamp::parse(raw) else {
            continue;
        };
        if entry.file_type()?.is_dir() && newest.as_ref().is_none_or(|(best, _)| ts > *best) {
            newest = Some((ts, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Remove `dir` if present, then move `staged` into its place.
pub(crate) fn replace_dir(staged: &Path, dir: &Path) -> Result<(), AgentCertError> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    if let Err(e) = fs::rename(staged, dir) {
        let _ = fs::remove_dir_all(staged);
        return Err(e.into());
    }
    Ok(())
}

/// Hidden sibling directory for staging a stage's output.
pub(crate) fn staging_dir(parent: &Path, name: &str) -> Result<PathBuf, AgentCertError> {
    fs::create_dir_all(parent)?;
    let staged = parent.join(format!(".{}.{}.tmp", name, ulid::Ulid::new()));
    fs::create_dir(&staged)?;
    Ok(staged)
}

pub fn schema() -> Value {
    serde_json::json!({
        "name": "agentcert",
        "version": env!("CARGO_PKG_VERSION"),
        "subsystems": [
            keygen::schema(),
            entity::schema(),
            preview::schema(),
            certify::schema(),
            compile::schema(),
            verify::schema(),
        ]
    })
}
