//! Certification: the second pipeline stage.
//!
//! Every check runs before anything is written. A preview that fails any of
//! them leaves `ops/certified/` untouched.

use crate::core::artifact::{
    self, ArtifactState, CERTIFIED_FORMAT, CertificationMetadata, CertifiedArtifact, GENERATOR, SCHEMA_VERSION,
    TOOL_VERSION,
};
use crate::core::audit::EventLog;
use crate::core::config::Config;
use crate::core::error::AgentCertError;
use crate::core::identity::{IdentityStore, Role};
use crate::core::integrity;
use crate::core::layout::Workspace;
use crate::core::signing::SignatureDomain;
use crate::core::time;
use crate::core::versioned::VersionedStore;
use crate::plugins::preview::{PREVIEW_FILE, PREVIEW_MANIFEST};
use crate::plugins::{self, Session};
use chrono::{Duration, Utc};
use clap::Parser;
use serde::Serialize;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

pub const CERTIFIED_FILE: &str = "certified.json";
pub const CERTIFIED_SIDECAR: &str = "certified.sha256";

#[derive(Parser, Debug)]
#[clap(name = "certify", about = "Check a preview and sign it as certified")]
pub struct CertifyCli {
    #[clap(long)]
    pub agent: String,
    /// Certify this preview file instead of the agent's current preview.
    #[clap(long)]
    pub preview: Option<PathBuf>,
    #[clap(long)]
    pub certifier: Option<String>,
    /// Validity window in days (defaults to `certify.validity_days`).
    #[clap(long)]
    pub valid_days: Option<u32>,
    #[clap(long)]
    pub experimental: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CertifyRequest {
    pub agent: String,
    pub preview: Option<PathBuf>,
    pub certifier: Option<String>,
    pub valid_days: Option<u32>,
    pub experimental: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertifyOutcome {
    pub lineage: String,
    pub path: PathBuf,
    pub sha256: String,
    pub certifier: String,
    pub valid_from: String,
    pub valid_until: String,
    pub audit_log: PathBuf,
}

pub struct Certifier<'a> {
    workspace: &'a Workspace,
    config: &'a Config,
    store: VersionedStore,
    identities: IdentityStore,
    events: EventLog,
}

impl<'a> Certifier<'a> {
    pub fn new(workspace: &'a Workspace, config: &'a Config) -> Self {
        Self {
            workspace,
            config,
            store: plugins::store_for(workspace, config),
            identities: plugins::identities_for(workspace, config),
            events: EventLog::new(&workspace.logs_dir()),
        }
    }

    fn locate_preview(&self, request: &CertifyRequest) -> Result<PathBuf, AgentCertError> {
        if let Some(path) = &request.preview {
            return Ok(path.clone());
        }
        let dir = plugins::locate_lineage_dir(&self.workspace.previews_dir(), &self.store, &request.agent)?
            .ok_or_else(|| {
                AgentCertError::NotFound(format!(
                    "no preview for agent '{}'. Run `agentcert preview --agent {}` first.",
                    request.agent, request.agent
                ))
            })?;
        Ok(dir.join(PREVIEW_FILE))
    }

    pub fn certify(&self, request: &CertifyRequest) -> Result<CertifyOutcome, AgentCertError> {
        let preview_path = self.locate_preview(request)?;
        let raw = fs::read_to_string(&preview_path)
            .map_err(|e| AgentCertError::NotFound(format!("{}: {}", preview_path.display(), e)))?;
        let document: Value = serde_json::from_str(&raw).map_err(|e| {
            AgentCertError::ValidationError(format!("invalid JSON in {}: {}", preview_path.display(), e))
        })?;

        artifact::check_preview_drift(&document)?;
        let preview_dir = preview_path.parent().unwrap_or(Path::new("."));
        let failures = integrity::verify_dir_manifest(preview_dir, PREVIEW_MANIFEST)?;
        if !failures.is_empty() {
            return Err(AgentCertError::IntegrityMismatch(failures.join("; ")));
        }

        let preview = match ArtifactState::classify(document)? {
            ArtifactState::Previewed(preview) => *preview,
            ArtifactState::Draft(_) => {
                return Err(AgentCertError::UncertifiablePreview(
                    "previewer block, fingerprint or signature missing; re-run `agentcert preview`".to_string(),
                ));
            }
            other => {
                return Err(AgentCertError::UncertifiablePreview(format!(
                    "{} is already {}; re-run `agentcert preview` for a fresh snapshot",
                    preview_path.display(),
                    other.stage()
                )));
            }
        };
        preview.verify_previewer()?;

        let certifier_name = request
            .certifier
            .as_deref()
            .or(self.config.identities.for_role(Role::Certifier));
        let certifier = self.identities.select(Role::Certifier, certifier_name)?;
        let signer = self.identities.signer(&certifier)?;

        let days = request.valid_days.unwrap_or(self.config.certify.validity_days);
        if days == 0 {
            return Err(AgentCertError::ValidationError(
                "validity period must be at least one day".to_string(),
            ));
        }
        let now = Utc::now();
        let valid_from = time::to_rfc3339(now);
        let valid_until = time::to_rfc3339(now + Duration::days(i64::from(days)));
        let lineage = preview.body.lineage()?;

        let mut certified = CertifiedArtifact {
            estimated_tokens: preview.estimated_tokens,
            certifier: certifier.clone(),
            metadata: CertificationMetadata {
                format: CERTIFIED_FORMAT.to_string(),
                schema: SCHEMA_VERSION.to_string(),
                generator: GENERATOR.to_string(),
                tool_version: TOOL_VERSION.to_string(),
                generated_at: valid_from.clone(),
                experimental: request.experimental || self.config.certify.experimental,
                valid_from: valid_from.clone(),
                valid_until: valid_until.clone(),
                preview_sha256: preview.metadata.sha256.clone(),
                previewer_signature: preview.metadata.signature.clone(),
                previewer_fingerprint: preview.metadata.previewer_fingerprint.clone(),
                certifier_fingerprint: certifier.fingerprint.clone(),
                certifier_key_version: certifier.key_version.clone(),
                sha256: None,
                signature: None,
            },
            body: preview.body,
        };
        let sha256 = certified.digest()?;
        certified.metadata.signature = Some(signer.sign_digest(SignatureDomain::Certify, &sha256));
        certified.metadata.sha256 = Some(sha256.clone());

        let certified_dir = self.workspace.certified_lineage_dir(&lineage);
        let staged = plugins::staging_dir(&self.workspace.certified_dir(), &lineage)?;
        let staged_file = staged.join(CERTIFIED_FILE);
        integrity::write_json_atomic(&staged_file, &certified)?;
        integrity::set_read_only(&staged_file)?;
        integrity::write_sidecar(&staged.join(CERTIFIED_SIDECAR), &sha256)?;
        plugins::replace_dir(&staged, &certified_dir)?;

        let audit_line = json!({
            "signed_by": certifier.name,
            "key_path": signer.key_path(),
            "sha256": sha256,
            "timestamp": time::now_rfc3339(),
        });
        let audit_log = self
            .events
            .append_stage_line("certify", &lineage, &serde_json::to_string(&audit_line)?)?;
        self.events.record(
            &certifier.name,
            "certify",
            &lineage,
            "ok",
            json!({
                "sha256": sha256,
                "validUntil": valid_until,
                "experimental": certified.metadata.experimental,
            }),
        )?;

        Ok(CertifyOutcome {
            lineage,
            path: certified_dir.join(CERTIFIED_FILE),
            sha256,
            certifier: certifier.name,
            valid_from,
            valid_until,
            audit_log,
        })
    }
}

pub fn run_certify_cli(session: &Session, cli: CertifyCli) -> Result<(), AgentCertError> {
    let certifier = Certifier::new(&session.workspace, &session.config);
    let outcome = certifier.certify(&CertifyRequest {
        agent: cli.agent,
        preview: cli.preview,
        certifier: cli.certifier,
        valid_days: cli.valid_days,
        experimental: cli.experimental,
    })?;
    session.emit("certify", json!({ "certified": outcome }), || {
        format!(
            "Certified {} by {}\n  {}\n  sha256 {}\n  valid {} .. {}",
            outcome.lineage,
            outcome.certifier,
            outcome.path.display(),
            outcome.sha256,
            outcome.valid_from,
            outcome.valid_until
        )
    })
}

pub fn schema() -> Value {
    json!({
        "name": "certify",
        "version": "0.1.0",
        "description": "Gate a preview on drift, manifest and previewer signature, then sign it",
        "commands": [
            { "name": "certify", "parameters": ["agent", "preview", "certifier", "valid_days", "experimental"] }
        ],
        "artifact": {
            "format": CERTIFIED_FORMAT,
            "schema": SCHEMA_VERSION,
            "certifiedWhen": ["certifier", "metadata.certifierKeyVersion"]
        },
        "storage": ["ops/certified/<agent>@<birth>/certified.json", "ops/certified/<agent>@<birth>/certified.sha256", "ops/logs/certify/<agent>@<birth>.log"]
    })
}
