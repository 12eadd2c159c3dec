//! Workspace configuration (`agentcert.toml`) and per-invocation run modes.
//!
//! A missing config file means defaults. Command-line flags override the
//! file at the command boundary; stages only ever see the resolved values.

use crate::core::alias::AliasBackend;
use crate::core::error::AgentCertError;
use crate::core::identity::Role;
use crate::core::layout::Workspace;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityDefaults {
    pub owner: Option<String>,
    pub previewer: Option<String>,
    pub certifier: Option<String>,
    pub compiler: Option<String>,
}

impl IdentityDefaults {
    pub fn for_role(&self, role: Role) -> Option<&str> {
        match role {
            Role::Owner => self.owner.as_deref(),
            Role::Previewer => self.previewer.as_deref(),
            Role::Certifier => self.certifier.as_deref(),
            Role::Compiler => self.compiler.as_deref(),
            Role::Signer => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CertifyConfig {
    /// Length of the validity window stamped on certified artifacts.
    pub validity_days: u32,
    pub experimental: bool,
}

impl Default for CertifyConfig {
    fn default() -> Self {
        Self {
            validity_days: 90,
            experimental: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Refuse to write a preview while the scanner reports issues.
    pub block_on_issues: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub alias_backend: AliasBackend,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompileConfig {
    /// BYO entity id merged into every compiled bundle as `globalByo`.
    pub byo: String,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            byo: "global".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub identities: IdentityDefaults,
    pub certify: CertifyConfig,
    pub security: SecurityConfig,
    pub store: StoreConfig,
    pub compile: CompileConfig,
}

impl Config {
    pub fn load(workspace: &Workspace) -> Result<Self, AgentCertError> {
        let path = workspace.config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, AgentCertError> {
        let config: Config = toml::from_str(content)?;
        if config.certify.validity_days == 0 {
            return Err(AgentCertError::ValidationError(
                "certify.validity_days must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Mode flags resolved once per invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunModes {
    /// Create stub mock files for missing plan references and rewrite the plan.
    pub self_heal: bool,
    /// Run every check and report, but write nothing.
    pub doctor: bool,
    /// Downgrade missing mock files from an error to a warning.
    pub force: bool,
    /// Proceed past a security-scan block.
    pub violate: bool,
}
