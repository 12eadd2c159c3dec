use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentCertError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Path error: {0}")]
    PathError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),

    // Identity store
    #[error("Identity already exists at {}; wait a moment and re-run keygen", .0.display())]
    DuplicateIdentity(PathBuf),
    #[error("No {role} identity '{name}' at version '{version}'. Run `agentcert keygen {role} --name {name}` first.")]
    IdentityNotFound {
        role: String,
        name: String,
        version: String,
    },
    #[error("No {role} identity available. Run `agentcert keygen {role} --name <name>` first.")]
    MissingIdentity { role: String },

    // Versioned store
    #[error("Version already exists: {}", .0.display())]
    VersionExists(PathBuf),
    #[error("No active version for {entity}/{id}. Run `agentcert entity alias {entity} {id} current <timestamp>`.")]
    NoActiveVersion { entity: String, id: String },
    #[error("Invalid alias: {0}")]
    InvalidAlias(String),

    // Preview
    #[error("Plan references missing mock files: {}. Re-run with --self-heal to create stubs.", .0.join(", "))]
    MockFileValidation(Vec<String>),
    #[error("Security scan found {0} issue(s) and policy blocks on issues. Re-run with --violate to override.")]
    SecurityScanBlocked(usize),

    // Integrity
    #[error("Content changed since preview ({}); re-run `agentcert preview`", drift_detail(.stored, .recomputed, .digest_changed))]
    TokenDrift {
        stored: usize,
        recomputed: usize,
        /// Body digest no longer matches `metadata.sha256`.
        digest_changed: bool,
    },
    #[error("Preview cannot be certified: {0}")]
    UncertifiablePreview(String),
    #[error("Artifact is not certified: {}. Run `agentcert certify` first.", .0.display())]
    UncertifiedInput(PathBuf),
    #[error("Plan identity mismatch: certified against {certified}, currently active {active}. Re-run preview and certify.")]
    PlanIdentityMismatch { certified: String, active: String },
    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),
    #[error("Integrity check failed: {0}")]
    IntegrityMismatch(String),
    #[error("Certification for {subject} is outside its validity window ({valid_from} .. {valid_until})")]
    CertificationExpired {
        subject: String,
        valid_from: String,
        valid_until: String,
    },

    #[error("Key material error: {0}")]
    KeyError(String),
    #[error("Tokenizer error: {0}")]
    TokenizerError(String),
}

fn drift_detail(stored: &usize, recomputed: &usize, digest_changed: &bool) -> String {
    match (stored == recomputed, *digest_changed) {
        (false, _) => format!("tokens {} -> {}", stored, recomputed),
        (true, true) => format!("content digest differs, token count unchanged at {}", stored),
        (true, false) => format!("tokens {}", stored),
    }
}

impl AgentCertError {
    /// Integrity failures indicate a broken trust chain and are never recovered.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::TokenDrift { .. }
                | Self::UncertifiedInput(_)
                | Self::SignatureInvalid(_)
                | Self::IntegrityMismatch(_)
                | Self::PlanIdentityMismatch { .. }
                | Self::CertificationExpired { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_drift_message_names_the_signal() {
        let tokens = AgentCertError::TokenDrift {
            stored: 120,
            recomputed: 125,
            digest_changed: true,
        };
        assert!(tokens.to_string().contains("tokens 120 -> 125"));

        let digest_only = AgentCertError::TokenDrift {
            stored: 120,
            recomputed: 120,
            digest_changed: true,
        };
        let message = digest_only.to_string();
        assert!(message.contains("content digest differs"));
        assert!(!message.contains("120 -> 120"));
    }
}
