//! Standalone verification of preview, certified and compiled artifacts.

use crate::core::artifact::{self, ArtifactState};
use crate::core::error::AgentCertError;
use crate::core::integrity;
use crate::core::time;
use crate::plugins::Session;
use crate::plugins::preview::PREVIEW_MANIFEST;
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(name = "verify", about = "Re-derive every hash and signature of an artifact")]
pub struct VerifyCli {
    #[clap(value_name = "ARTIFACT")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerCheck {
    pub role: String,
    pub name: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub path: PathBuf,
    pub stage: String,
    pub lineage: String,
    pub sha256: String,
    pub signers: Vec<SignerCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<String>,
    /// Outside the validity window right now. Reported, not fatal.
    pub expired: bool,
}

fn signer_check(identity: &crate::core::identity::Identity) -> SignerCheck {
    SignerCheck {
        role: identity.role.as_str().to_string(),
        name: identity.name.clone(),
        fingerprint: identity.fingerprint.clone(),
    }
}

/// Sidecar next to `path`: `certified.sha256` for `certified.json`,
/// `<stem>.sha256` for `<stem>.json`.
fn sidecar_for(path: &Path) -> PathBuf {
    path.with_extension("sha256")
}

fn check_sidecar(path: &Path, recorded: &str) -> Result<(), AgentCertError> {
    let sidecar = sidecar_for(path);
    if !sidecar.is_file() {
        return Err(AgentCertError::IntegrityMismatch(format!(
            "sidecar {} missing",
            sidecar.display()
        )));
    }
    if integrity::read_sidecar(&sidecar)? != recorded {
        return Err(AgentCertError::IntegrityMismatch(format!(
            "sidecar {} does not match metadata.sha256",
            sidecar.display()
        )));
    }
    Ok(())
}

fn window_expired(valid_from: &str, valid_until: &str) -> Result<bool, AgentCertError> {
    let now = Utc::now();
    Ok(now < time::parse_rfc3339(valid_from)? || now > time::parse_rfc3339(valid_until)?)
}

pub fn verify_artifact(path: &Path) -> Result<VerifyReport, AgentCertError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AgentCertError::NotFound(format!("{}: {}", path.display(), e)))?;
    let document: Value = serde_json::from_str(&raw).map_err(|e| {
        AgentCertError::ValidationError(format!("invalid JSON in {}: {}", path.display(), e))
    })?;

    match ArtifactState::classify(document.clone())? {
        ArtifactState::Draft(_) => Err(AgentCertError::ValidationError(format!(
            "{} is not a preview, certified or compiled artifact",
            path.display()
        ))),
        ArtifactState::Previewed(preview) => {
            artifact::check_preview_drift(&document)?;
            if let Some(dir) = path.parent() {
                let failures = integrity::verify_dir_manifest(dir, PREVIEW_MANIFEST)?;
                if !failures.is_empty() {
                    return Err(AgentCertError::IntegrityMismatch(failures.join("; ")));
                }
            }
            preview.verify_previewer()?;
            Ok(VerifyReport {
                path: path.to_path_buf(),
                stage: "previewed".to_string(),
                lineage: preview.body.lineage()?,
                sha256: preview.metadata.sha256.clone(),
                signers: vec![signer_check(&preview.body.previewer)],
                version: None,
                valid_from: None,
                valid_until: None,
                expired: false,
            })
        }
        ArtifactState::Certified(certified) => {
            let recorded = artifact::check_unsigned_digest(&document)?;
            check_sidecar(path, &recorded)?;
            certified.verify()?;
            let meta = &certified.metadata;
            Ok(VerifyReport {
                path: path.to_path_buf(),
                stage: "certified".to_string(),
                lineage: certified.body.lineage()?,
                sha256: recorded,
                signers: vec![
                    signer_check(&certified.body.previewer),
                    signer_check(&certified.certifier),
                ],
                version: None,
                valid_from: Some(meta.valid_from.clone()),
                valid_until: Some(meta.valid_until.clone()),
                expired: window_expired(&meta.valid_from, &meta.valid_until)?,
            })
        }
        ArtifactState::Compiled(bundle) => {
            let recorded = artifact::check_unsigned_digest(&document)?;
            check_sidecar(path, &recorded)?;
            bundle.verify()?;
            let meta = &bundle.metadata;
            Ok(VerifyReport {
                path: path.to_path_buf(),
                stage: "compiled".to_string(),
                lineage: bundle.body.lineage()?,
                sha256: recorded,
                signers: vec![
                    signer_check(&bundle.body.previewer),
                    signer_check(&bundle.certifier),
                    signer_check(&bundle.compiler),
                ],
                version: Some(bundle.metadata.version.clone()),
                valid_from: Some(meta.valid_from.clone()),
                valid_until: Some(meta.valid_until.clone()),
                expired: window_expired(&meta.valid_from, &meta.valid_until)?,
            })
        }
    }
}

pub fn run_verify_cli(session: &Session, cli: VerifyCli) -> Result<(), AgentCertError> {
    let report = verify_artifact(&cli.path)?;
    session.events().record(
        "verifier",
        "verify",
        &report.lineage,
        if report.expired { "expired" } else { "ok" },
        json!({ "stage": report.stage, "sha256": report.sha256 }),
    )?;
    session.emit("verify", json!({ "report": report }), || {
        let mut lines = vec![format!(
            "{} {} verified ({})",
            report.lineage,
            report.version.as_deref().unwrap_or(&report.stage),
            report.stage
        )];
        lines.push(format!("  sha256 {}", report.sha256));
        for s in &report.signers {
            lines.push(format!("  {:<10} {:<16} {}", s.role, s.name, s.fingerprint));
        }
        if let (Some(from), Some(until)) = (&report.valid_from, &report.valid_until) {
            let state = if report.expired { "EXPIRED" } else { "valid" };
            lines.push(format!("  {} {} .. {}", state, from, until));
        }
        lines.join("\n")
    })
}

pub fn schema() -> Value {
    json!({
        "name": "verify",
        "version": "0.1.0",
        "description": "Verify digests, sidecars and the previewer/certifier/compiler signature chain",
        "commands": [
            { "name": "verify", "parameters": ["artifact"] }
        ]
    })
}
