//! Compilation: the last pipeline stage.
//!
//! Inputs are admitted only as typed [`CertifiedArtifact`]s whose whole
//! chain verifies. The batch is gated as a unit: if any input fails, nothing
//! is written for any of them.

use crate::core::artifact::{
    self, ArtifactState, COMPILED_FORMAT, CertifiedArtifact, CompilationMetadata, CompiledBundle, SCHEMA_VERSION,
};
use crate::core::audit::EventLog;
use crate::core::config::Config;
use crate::core::error::AgentCertError;
use crate::core::identity::{Identity, IdentityStore, Role};
use crate::core::integrity;
use crate::core::layout::{self, Workspace};
use crate::core::output::{self, Warning};
use crate::core::registry::ModelRegistry;
use crate::core::signing::{SignatureDomain, Signer};
use crate::core::time;
use crate::core::versioned::{EntityKind, VersionedStore};
use crate::plugins::certify::{CERTIFIED_FILE, CERTIFIED_SIDECAR};
use crate::plugins::{self, Session};
use chrono::Utc;
use clap::Parser;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const VERSION_COUNTER: &str = "versions.json";

#[derive(Parser, Debug)]
#[clap(name = "compile", about = "Compile certified artifacts into versioned bundles")]
pub struct CompileCli {
    /// Agent whose certified artifact to compile (repeatable).
    #[clap(long = "agent")]
    pub agents: Vec<String>,
    /// Explicit certified artifact paths (repeatable).
    #[clap(long = "artifact")]
    pub artifacts: Vec<PathBuf>,
    #[clap(long)]
    pub compiler: Option<String>,
    /// BYO entity id merged as `globalByo` (defaults to `compile.byo`).
    #[clap(long)]
    pub byo: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    pub agents: Vec<String>,
    pub artifacts: Vec<PathBuf>,
    pub compiler: Option<String>,
    pub byo: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOutcome {
    pub lineage: String,
    pub version: String,
    pub path: PathBuf,
    pub sha256: String,
    pub estimated_tokens: usize,
    pub warnings: Vec<Warning>,
    pub report: PathBuf,
    pub log: PathBuf,
}

pub struct Compiler<'a> {
    workspace: &'a Workspace,
    config: &'a Config,
    store: VersionedStore,
    identities: IdentityStore,
    registry: ModelRegistry,
    events: EventLog,
}

impl<'a> Compiler<'a> {
    pub fn new(workspace: &'a Workspace, config: &'a Config) -> Result<Self, AgentCertError> {
        Ok(Self {
            workspace,
            config,
            store: plugins::store_for(workspace, config),
            identities: plugins::identities_for(workspace, config),
            registry: ModelRegistry::builtin()?,
            events: EventLog::new(&workspace.logs_dir()),
        })
    }

    pub fn compile(&self, request: &CompileRequest) -> Result<Vec<CompileOutcome>, AgentCertError> {
        if request.agents.is_empty() && request.artifacts.is_empty() {
            return Err(AgentCertError::ValidationError(
                "nothing to compile: pass --agent or --artifact".to_string(),
            ));
        }
        let compiler_name = request
            .compiler
            .as_deref()
            .or(self.config.identities.for_role(Role::Compiler));
        let compiler = self.identities.select(Role::Compiler, compiler_name)?;
        let signer = self.identities.signer(&compiler)?;

        let mut paths = Vec::new();
        for agent in &request.agents {
            paths.push(self.certified_path(agent)?);
        }
        paths.extend(request.artifacts.iter().cloned());

        // Gate the whole batch before the first write. The same certified
        // artifact named twice compiles once.
        let mut admitted = Vec::new();
        let mut seen = HashSet::new();
        for path in &paths {
            let certified = self.admit(path)?;
            if seen.insert((certified.body.lineage()?, certified.sha256()?.to_string())) {
                admitted.push(certified);
            }
        }

        let mut shared_warnings = Vec::new();
        let byo_id = request.byo.as_deref().unwrap_or(&self.config.compile.byo);
        layout::validate_id("byo", byo_id)?;
        let global_byo = match self.store.try_resolve_active(EntityKind::Byo, byo_id)? {
            Some(version) => self.store.read_payload(&version)?,
            None => {
                shared_warnings.push(Warning::new(
                    "byo.missing",
                    format!("no active byo data '{}'; globalByo is null", byo_id),
                ));
                Value::Null
            }
        };

        let mut outcomes = Vec::new();
        for certified in admitted {
            outcomes.push(self.write_bundle(certified, &compiler, &signer, &global_byo, &shared_warnings)?);
        }
        Ok(outcomes)
    }

    fn certified_path(&self, agent: &str) -> Result<PathBuf, AgentCertError> {
        match plugins::locate_lineage_dir(&self.workspace.certified_dir(), &self.store, agent)? {
            Some(dir) => Ok(dir.join(CERTIFIED_FILE)),
            None => Err(AgentCertError::UncertifiedInput(self.workspace.certified_dir().join(agent))),
        }
    }

    /// Classify, re-hash and re-verify one input; check its validity window
    /// and that its plan is still the active one.
    fn admit(&self, path: &Path) -> Result<CertifiedArtifact, AgentCertError> {
        let raw = fs::read_to_string(path).map_err(|_| AgentCertError::UncertifiedInput(path.to_path_buf()))?;
        let document: Value = serde_json::from_str(&raw)
            .map_err(|_| AgentCertError::UncertifiedInput(path.to_path_buf()))?;
        let certified = match ArtifactState::classify(document.clone()) {
            Ok(ArtifactState::Certified(certified)) => *certified,
            _ => return Err(AgentCertError::UncertifiedInput(path.to_path_buf())),
        };

        let recorded = artifact::check_unsigned_digest(&document)?;
        let sidecar = path.with_file_name(CERTIFIED_SIDECAR);
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
        certified.verify()?;

        let lineage = certified.body.lineage()?;
        let valid_from = time::parse_rfc3339(&certified.metadata.valid_from)?;
        let valid_until = time::parse_rfc3339(&certified.metadata.valid_until)?;
        let now = Utc::now();
        if now < valid_from || now > valid_until {
            return Err(AgentCertError::CertificationExpired {
                subject: lineage,
                valid_from: certified.metadata.valid_from.clone(),
                valid_until: certified.metadata.valid_until.clone(),
            });
        }

        let plan = certified.body.source_versions.get("plan").ok_or_else(|| {
            AgentCertError::ValidationError(format!("{} records no plan source version", lineage))
        })?;
        let active = self.store.resolve_active(EntityKind::Plan, &plan.id)?;
        if active.timestamp != plan.timestamp {
            return Err(AgentCertError::PlanIdentityMismatch {
                certified: format!("{}@{}", plan.id, plan.timestamp),
                active: active.lineage(),
            });
        }
        Ok(certified)
    }

    fn write_bundle(
        &self,
        certified: CertifiedArtifact,
        compiler: &Identity,
        signer: &Signer,
        global_byo: &Value,
        shared_warnings: &[Warning],
    ) -> Result<CompileOutcome, AgentCertError> {
        let agent = certified.body.agent_id()?.to_string();
        let lineage = certified.body.lineage()?;
        let agent_dir = self.workspace.compiled_agent_dir(&agent);
        fs::create_dir_all(&agent_dir)?;

        let number = next_version(&agent_dir, &lineage)?;
        let version = format!("v{}", number);
        let stem = format!("{}.{}.cert", lineage, version);
        let path = agent_dir.join(format!("{}.json", stem));
        let sidecar = agent_dir.join(format!("{}.sha256", stem));
        if path.exists() || sidecar.exists() {
            return Err(AgentCertError::VersionExists(path));
        }

        let compiled_at = time::now_rfc3339();
        let target_model = certified
            .body
            .conventions
            .get("targetModel")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut bundle = CompiledBundle {
            estimated_tokens: certified.estimated_tokens,
            compiler: compiler.clone(),
            compiled_at: compiled_at.clone(),
            global_byo: global_byo.clone(),
            metadata: CompilationMetadata::from_certified(
                certified.metadata,
                version.clone(),
                compiled_at.clone(),
                compiler,
            )?,
            certifier: certified.certifier,
            body: certified.body,
        };
        let sha256 = bundle.digest()?;
        bundle.metadata.signature = Some(signer.sign_digest(SignatureDomain::Compile, &sha256));
        bundle.metadata.sha256 = Some(sha256.clone());

        integrity::write_json_atomic(&path, &bundle)?;
        integrity::set_read_only(&path)?;
        integrity::write_sidecar(&sidecar, &sha256)?;
        record_version(&agent_dir, &lineage, number)?;

        let mut warnings = shared_warnings.to_vec();
        warnings.extend(
            self.registry
                .budget_warnings(target_model.as_deref(), bundle.estimated_tokens),
        );

        let mut lines = vec![format!(
            "{} compiled {} {} by {} ({}) sha256={} tokens={}",
            compiled_at,
            lineage,
            version,
            compiler.name,
            compiler.fingerprint,
            sha256,
            bundle.estimated_tokens
        )];
        lines.extend(warnings.iter().map(|w| format!("{} warning [{}] {}", compiled_at, w.code, w.message)));
        let mut log = PathBuf::new();
        for line in &lines {
            log = self.events.append_stage_line("compile", &lineage, line)?;
        }

        let report = self.workspace.reports_dir().join(format!("{}.report.json", lineage));
        integrity::write_json_atomic(
            &report,
            &json!({
                "lineage": lineage,
                "agent": agent,
                "version": version,
                "bundle": path,
                "sha256": sha256,
                "compiledAt": compiled_at,
                "estimatedTokens": bundle.estimated_tokens,
                "sectionTokens": bundle.body.section_tokens,
                "targetModel": target_model,
                "certifierFingerprint": bundle.certifier.fingerprint,
                "compilerFingerprint": compiler.fingerprint,
                "validUntil": bundle.metadata.valid_until,
                "warnings": warnings,
            }),
        )?;
        self.events.record(
            &compiler.name,
            "compile",
            &lineage,
            "ok",
            json!({ "version": version, "sha256": sha256, "warnings": warnings }),
        )?;

        Ok(CompileOutcome {
            lineage,
            version,
            path,
            sha256,
            estimated_tokens: bundle.estimated_tokens,
            warnings,
            report,
            log,
        })
    }
}

fn load_counter(agent_dir: &Path) -> Result<BTreeMap<String, u32>, AgentCertError> {
    let path = agent_dir.join(VERSION_COUNTER);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Highest `N` among `<lineage>.vN.cert.json` files on disk.
fn scan_versions(agent_dir: &Path, lineage: &str) -> Result<u32, AgentCertError> {
    let pattern = Regex::new(&format!(r"^{}\.v(\d+)\.cert\.json$", regex::escape(lineage)))
        .map_err(|e| AgentCertError::ValidationError(e.to_string()))?;
    let mut highest = 0;
    for entry in fs::read_dir(agent_dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(n) = pattern
            .captures(&name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            highest = highest.max(n);
        }
    }
    Ok(highest)
}

/// One past the larger of the persisted counter and what is on disk, so a
/// lost or stale counter never causes a version to be reused.
pub fn next_version(agent_dir: &Path, lineage: &str) -> Result<u32, AgentCertError> {
    let counted = load_counter(agent_dir)?.get(lineage).copied().unwrap_or(0);
    let scanned = if agent_dir.is_dir() {
        scan_versions(agent_dir, lineage)?
    } else {
        0
    };
    Ok(counted.max(scanned) + 1)
}

fn record_version(agent_dir: &Path, lineage: &str, number: u32) -> Result<(), AgentCertError> {
    let mut counter = load_counter(agent_dir)?;
    counter.insert(lineage.to_string(), number);
    integrity::write_json_atomic(&agent_dir.join(VERSION_COUNTER), &counter)
}

pub fn run_compile_cli(session: &Session, cli: CompileCli) -> Result<(), AgentCertError> {
    let compiler = Compiler::new(&session.workspace, &session.config)?;
    let outcomes = compiler.compile(&CompileRequest {
        agents: cli.agents,
        artifacts: cli.artifacts,
        compiler: cli.compiler,
        byo: cli.byo,
    })?;
    for outcome in &outcomes {
        output::print_warnings(&outcome.warnings);
    }
    session.emit("compile", json!({ "compiled": outcomes }), || {
        outcomes
            .iter()
            .map(|o| {
                format!(
                    "Compiled {} {}\n  {}\n  sha256 {}\n  tokens {}",
                    o.lineage,
                    o.version,
                    o.path.display(),
                    o.sha256,
                    o.estimated_tokens
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub fn schema() -> Value {
    json!({
        "name": "compile",
        "version": "0.1.0",
        "description": "Merge BYO data into certified artifacts and sign immutable versioned bundles",
        "commands": [
            { "name": "compile", "parameters": ["agent", "artifact", "compiler", "byo"] }
        ],
        "artifact": {
            "format": COMPILED_FORMAT,
            "schema": SCHEMA_VERSION,
            "versioning": "vN per <agent>@<birth>, never reused"
        },
        "storage": [
            "ops/compiled/<agent>/<agent>@<birth>.vN.cert.json",
            "ops/compiled/<agent>/<agent>@<birth>.vN.cert.sha256",
            "ops/compiled/<agent>/versions.json",
            "ops/logs/compile/<agent>@<birth>.log",
            "ops/reports/<agent>@<birth>.report.json"
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version_uses_larger_of_counter_and_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let lineage = "scout@20260101T000000000Z";
        assert_eq!(next_version(dir, lineage).unwrap(), 1);

        fs::write(dir.join(format!("{}.v4.cert.json", lineage)), "{}").unwrap();
        fs::write(dir.join("scout@20260202T000000000Z.v9.cert.json"), "{}").unwrap();
        assert_eq!(next_version(dir, lineage).unwrap(), 5);

        record_version(dir, lineage, 7).unwrap();
        assert_eq!(next_version(dir, lineage).unwrap(), 8);
    }

    #[test]
    fn test_next_version_for_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(next_version(&tmp.path().join("absent"), "a@b").unwrap(), 1);
    }
}
