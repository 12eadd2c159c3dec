//! Workspace layout for agentcert's on-disk state.
//!
//! ```text
//! <root>/agentcert.toml
//! <root>/data/{agents,plans,criteria,conventions,owners,byo}/<id>[@<ts>]
//! <root>/keys/<role>s/<name>/<ts|latest>
//! <root>/ops/{previews,certified,compiled,logs,reports}/...
//! ```

use crate::core::error::AgentCertError;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "agentcert.toml";

/// Handle on one agentcert workspace root.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Absolute path to the workspace root directory
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn ops_dir(&self) -> PathBuf {
        self.root.join("ops")
    }

    pub fn previews_dir(&self) -> PathBuf {
        self.ops_dir().join("previews")
    }

    pub fn certified_dir(&self) -> PathBuf {
        self.ops_dir().join("certified")
    }

    pub fn compiled_dir(&self) -> PathBuf {
        self.ops_dir().join("compiled")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.ops_dir().join("logs")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.ops_dir().join("reports")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// `<agent>@<birth>` lineage directory for a preview.
    pub fn preview_dir(&self, lineage: &str) -> PathBuf {
        self.previews_dir().join(lineage)
    }

    pub fn certified_lineage_dir(&self, lineage: &str) -> PathBuf {
        self.certified_dir().join(lineage)
    }

    pub fn compiled_agent_dir(&self, agent: &str) -> PathBuf {
        self.compiled_dir().join(agent)
    }
}

/// Walk up from `start_dir` until a directory looks like a workspace root.
pub fn find_workspace_root(start_dir: &Path) -> Result<PathBuf, AgentCertError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(CONFIG_FILE).exists()
            || (current_dir.join("data").is_dir() && current_dir.join("keys").is_dir())
        {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(AgentCertError::NotFound(format!(
                "no '{}' (or data/ + keys/) found in current or parent directories. Pass --root or create the config file.",
                CONFIG_FILE
            )));
        }
    }
}

/// Reject identifiers that could escape their directory or collide with
/// the `<id>@<ts>` naming scheme.
pub fn validate_id(kind: &str, id: &str) -> Result<(), AgentCertError> {
    if id.is_empty() {
        return Err(AgentCertError::ValidationError(format!(
            "{} id cannot be empty",
            kind
        )));
    }
    if id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !id.starts_with('.')
    {
        Ok(())
    } else {
        Err(AgentCertError::ValidationError(format!(
            "invalid {} id '{}': allowed characters are [A-Za-z0-9_.-]",
            kind, id
        )))
    }
}
