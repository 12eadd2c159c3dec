//! Preview assembly: the first pipeline stage.
//!
//! Merges the active agent, plan, criteria and conventions with the owner
//! and previewer identities into one signed, read-only snapshot at
//! `ops/previews/<agent>@<birth>/preview.json`. Always regenerates.

use crate::core::artifact::{
    GENERATOR, OwnerBlock, PREVIEW_FORMAT, PreviewArtifact, PreviewBody, PreviewMetadata, SCHEMA_VERSION,
    SourceVersion,
};
use crate::core::audit::EventLog;
use crate::core::config::{Config, RunModes};
use crate::core::error::AgentCertError;
use crate::core::identity::{Identity, IdentityStore, Role};
use crate::core::integrity;
use crate::core::layout::{self, Workspace};
use crate::core::output::{self, Warning};
use crate::core::scan::{PatternScanner, ScanIssue, Scanner};
use crate::core::signing::SignatureDomain;
use crate::core::time;
use crate::core::tokens;
use crate::core::versioned::{EntityKind, EntityVersion, VersionedStore};
use crate::plugins::{self, Session};
use clap::Parser;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

pub const PREVIEW_FILE: &str = "preview.json";
pub const PREVIEW_MANIFEST: &str = "preview.sha256";

/// Keys that describe how a document was produced, not what it says.
const TRANSPORT_KEYS: [&str; 3] = ["cliVersion", "schemaVersion", "createdVia"];
const MOCK_FIELDS: [&str; 2] = ["inputMock", "outputMock"];

#[derive(Parser, Debug)]
#[clap(name = "preview", about = "Assemble and sign a preview for an agent")]
pub struct PreviewCli {
    #[clap(long)]
    pub agent: String,
    /// Owner identity name (defaults to the agent's `owner`, then config).
    #[clap(long)]
    pub owner: Option<String>,
    #[clap(long)]
    pub previewer: Option<String>,
    /// Create stub files for missing plan mocks and rewrite the plan.
    #[clap(long)]
    pub self_heal: bool,
    /// Run every check and report; write nothing.
    #[clap(long)]
    pub doctor: bool,
    /// Treat missing mock files as warnings.
    #[clap(long)]
    pub force: bool,
    /// Proceed even when the security policy blocks on scan issues.
    #[clap(long)]
    pub violate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PreviewRequest {
    pub agent: String,
    pub owner: Option<String>,
    pub previewer: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOutcome {
    pub lineage: String,
    /// `None` in doctor mode.
    pub path: Option<PathBuf>,
    pub estimated_tokens: usize,
    pub section_tokens: BTreeMap<String, usize>,
    pub sha256: String,
    pub warnings: Vec<Warning>,
    pub healed: Vec<String>,
    pub scan_issues: Vec<ScanIssue>,
}

/// A plan step reference to a mock file that does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MissingMock {
    step_index: usize,
    step_key: String,
    field: &'static str,
    declared: String,
}

impl MissingMock {
    fn describe(&self) -> String {
        format!("{}.{} = {}", self.step_key, self.field, self.declared)
    }

    fn stub_path(&self) -> String {
        let direction = if self.field == "inputMock" { "input" } else { "output" };
        format!("mocks/{}.{}.json", self.step_key, direction)
    }
}

pub struct Previewer<'a> {
    workspace: &'a Workspace,
    config: &'a Config,
    modes: RunModes,
    store: VersionedStore,
    identities: IdentityStore,
    scanner: Box<dyn Scanner>,
    events: EventLog,
}

impl<'a> Previewer<'a> {
    pub fn new(workspace: &'a Workspace, config: &'a Config, modes: RunModes) -> Result<Self, AgentCertError> {
        Ok(Self {
            workspace,
            config,
            modes,
            store: plugins::store_for(workspace, config),
            identities: plugins::identities_for(workspace, config),
            scanner: Box::new(PatternScanner::with_defaults()?),
            events: EventLog::new(&workspace.logs_dir()),
        })
    }

    pub fn with_scanner(mut self, scanner: Box<dyn Scanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn run(&self, request: &PreviewRequest) -> Result<PreviewOutcome, AgentCertError> {
        let agent = self.store.resolve_active(EntityKind::Agent, &request.agent)?;
        let agent_doc = self.store.read_payload(&agent)?;
        let plan_id = referenced_id(&agent_doc, "planId", &request.agent)?;
        let criteria_id = referenced_id(&agent_doc, "criteriaId", &request.agent)?;
        let conventions_id = referenced_id(&agent_doc, "conventionsId", &request.agent)?;

        let plan = self.store.resolve_active(EntityKind::Plan, &plan_id)?;
        let criteria = self.store.try_resolve_active(EntityKind::Criteria, &criteria_id)?;
        let conventions = self.store.resolve_active(EntityKind::Conventions, &conventions_id)?;

        let owner_name = request
            .owner
            .clone()
            .or_else(|| agent_doc.get("owner").and_then(Value::as_str).map(str::to_string))
            .or_else(|| self.config.identities.for_role(Role::Owner).map(str::to_string));
        let owner = self.identities.select(Role::Owner, owner_name.as_deref())?;
        let previewer_name = request
            .previewer
            .as_deref()
            .or(self.config.identities.for_role(Role::Previewer));
        let previewer = self.identities.select(Role::Previewer, previewer_name)?;
        let owner_profile = self.store.try_resolve_active(EntityKind::Owner, &owner.name)?;

        let mut warnings = Vec::new();
        let mut plan_doc = self.store.read_payload(&plan)?;

        let missing = find_missing_mocks(&plan_doc, &plan.path);
        if !missing.is_empty() {
            let described: Vec<String> = missing.iter().map(MissingMock::describe).collect();
            if self.modes.doctor || self.modes.force || self.modes.self_heal {
                for d in &described {
                    warnings.push(Warning::new("mock.missing", format!("missing mock file {}", d)));
                }
            } else {
                return Err(AgentCertError::MockFileValidation(described));
            }
        }
        warnings.extend(high_risk_warnings(&plan_doc));

        let mut roots = vec![agent.path.clone(), plan.path.clone(), conventions.path.clone()];
        roots.extend(criteria.iter().map(|c| c.path.clone()));
        roots.extend(owner_profile.iter().map(|o| o.path.clone()));
        let scan_issues = self.scanner.scan(&roots)?;
        for issue in &scan_issues {
            warnings.push(Warning::new(
                "security.scan",
                format!(
                    "{}:{} matches '{}' ({:?})",
                    issue.file, issue.line, issue.pattern, issue.severity
                ),
            ));
        }
        if self.config.security.block_on_issues && !scan_issues.is_empty() {
            if self.modes.violate {
                warnings.push(Warning::new(
                    "security.override",
                    format!("{} scan issue(s) overridden with --violate", scan_issues.len()),
                ));
            } else if self.modes.doctor {
                warnings.push(Warning::new(
                    "security.blocked",
                    format!("{} scan issue(s) would block this preview", scan_issues.len()),
                ));
            } else {
                return Err(AgentCertError::SecurityScanBlocked(scan_issues.len()));
            }
        }

        // All gates passed; self-heal is the first write.
        let mut healed = Vec::new();
        if self.modes.self_heal && !self.modes.doctor && !missing.is_empty() {
            healed = self.heal_mocks(&plan, &mut plan_doc, &missing)?;
        }

        let mut source_versions = BTreeMap::new();
        let agent_section = take_section(&mut source_versions, "agent", &agent, agent_doc);
        let plan_section = take_section(&mut source_versions, "plan", &plan, plan_doc);
        let criteria_section = match &criteria {
            Some(version) => {
                let doc = self.store.read_payload(version)?;
                take_section(&mut source_versions, "criteria", version, doc)
            }
            None => {
                warnings.push(Warning::new(
                    "criteria.missing",
                    format!("no active criteria for '{}'", criteria_id),
                ));
                json!({
                    "error": "criteria.missing",
                    "message": format!(
                        "no active criteria for '{}'; run `agentcert entity write criteria {} --file <json> --alias current`",
                        criteria_id, criteria_id
                    )
                })
            }
        };
        let conventions_doc = self.store.read_payload(&conventions)?;
        let conventions_section = take_section(&mut source_versions, "conventions", &conventions, conventions_doc);
        let profile = match &owner_profile {
            Some(version) => {
                let doc = self.store.read_payload(version)?;
                Some(take_section(&mut source_versions, "ownerProfile", version, doc))
            }
            None => None,
        };
        source_versions.insert("owner".to_string(), identity_source(&owner));
        source_versions.insert("previewer".to_string(), identity_source(&previewer));

        let owner_block = OwnerBlock {
            identity: owner,
            profile,
        };
        let mut section_tokens = BTreeMap::new();
        section_tokens.insert("agent".to_string(), tokens::estimate_json(&agent_section)?);
        section_tokens.insert("plan".to_string(), tokens::estimate_json(&plan_section)?);
        section_tokens.insert("criteria".to_string(), tokens::estimate_json(&criteria_section)?);
        section_tokens.insert("conventions".to_string(), tokens::estimate_json(&conventions_section)?);
        section_tokens.insert("owner".to_string(), tokens::estimate_json(&owner_block)?);

        let body = PreviewBody {
            agent: agent_section,
            plan: plan_section,
            criteria: criteria_section,
            conventions: conventions_section,
            owner: owner_block,
            previewer: previewer.clone(),
            source_versions,
            section_tokens,
        };
        let estimated_tokens = body.estimate_tokens()?;
        let sha256 = body.digest()?;
        let signer = self.identities.signer(&previewer)?;
        let signature = signer.sign_digest(SignatureDomain::Preview, &sha256);
        let lineage = agent.lineage();

        let mut outcome = PreviewOutcome {
            lineage: lineage.clone(),
            path: None,
            estimated_tokens,
            section_tokens: body.section_tokens.clone(),
            sha256: sha256.clone(),
            warnings,
            healed,
            scan_issues,
        };
        if self.modes.doctor {
            return Ok(outcome);
        }

        let artifact = PreviewArtifact {
            body,
            estimated_tokens,
            metadata: PreviewMetadata {
                format: PREVIEW_FORMAT.to_string(),
                schema: SCHEMA_VERSION.to_string(),
                generator: GENERATOR.to_string(),
                generated_at: time::now_rfc3339(),
                previewer_fingerprint: previewer.fingerprint.clone(),
                previewer_key_version: previewer.key_version.clone(),
                sha256,
                signature,
            },
        };
        let path = self.write_preview(&lineage, &artifact)?;
        self.events.record(
            &previewer.name,
            "preview",
            &lineage,
            "ok",
            json!({
                "estimatedTokens": estimated_tokens,
                "sha256": artifact.metadata.sha256,
                "warnings": outcome.warnings,
                "healed": outcome.healed,
            }),
        )?;
        outcome.path = Some(path);
        Ok(outcome)
    }

    fn write_preview(&self, lineage: &str, artifact: &PreviewArtifact) -> Result<PathBuf, AgentCertError> {
        let previews = self.workspace.previews_dir();
        let staged = plugins::staging_dir(&previews, lineage)?;
        let staged_file = staged.join(PREVIEW_FILE);
        integrity::write_json_atomic(&staged_file, artifact)?;
        integrity::set_read_only(&staged_file)?;
        integrity::write_dir_manifest(&staged, PREVIEW_MANIFEST)?;
        let dir = self.workspace.preview_dir(lineage);
        plugins::replace_dir(&staged, &dir)?;
        Ok(dir.join(PREVIEW_FILE))
    }

    /// Write a stub for every missing mock and point the plan step at it.
    fn heal_mocks(
        &self,
        plan: &EntityVersion,
        plan_doc: &mut Value,
        missing: &[MissingMock],
    ) -> Result<Vec<String>, AgentCertError> {
        let mut healed = Vec::new();
        for mock in missing {
            let relative = mock.stub_path();
            let stub = plan.path.join(&relative);
            if !stub.exists() {
                integrity::write_json_atomic(
                    &stub,
                    &json!({
                        "stub": true,
                        "step": mock.step_key,
                        "field": mock.field,
                        "generator": GENERATOR,
                    }),
                )?;
            }
            if let Some(step) = plan_doc
                .get_mut("steps")
                .and_then(|s| s.get_mut(mock.step_index))
                .and_then(Value::as_object_mut)
            {
                step.insert(mock.field.to_string(), Value::String(relative.clone()));
            }
            healed.push(format!("{} -> {}", mock.describe(), relative));
        }
        self.store.rewrite_payload(plan, plan_doc)?;
        self.events.record(
            "preview",
            "self-heal",
            &format!("{}/{}", EntityKind::Plan.dir_name(), plan.lineage()),
            "ok",
            json!({ "healed": healed }),
        )?;
        Ok(healed)
    }
}

/// Id of a related entity: the agent's explicit reference, else the agent id.
fn referenced_id(agent_doc: &Value, key: &str, agent_id: &str) -> Result<String, AgentCertError> {
    match agent_doc.get(key).and_then(Value::as_str) {
        Some(id) => {
            layout::validate_id(key, id)?;
            Ok(id.to_string())
        }
        None => Ok(agent_id.to_string()),
    }
}

/// Lift transport keys out of `doc` and record where the section came from.
fn take_section(
    source_versions: &mut BTreeMap<String, SourceVersion>,
    name: &str,
    version: &EntityVersion,
    mut doc: Value,
) -> Value {
    let mut transport = BTreeMap::new();
    if let Some(map) = doc.as_object_mut() {
        for key in TRANSPORT_KEYS {
            if let Some(value) = map.remove(key) {
                transport.insert(key.to_string(), value);
            }
        }
    }
    source_versions.insert(
        name.to_string(),
        SourceVersion {
            id: version.id.clone(),
            timestamp: version.timestamp.clone(),
            transport,
        },
    );
    doc
}

fn identity_source(identity: &Identity) -> SourceVersion {
    SourceVersion {
        id: identity.name.clone(),
        timestamp: identity.key_version.clone(),
        transport: BTreeMap::new(),
    }
}

fn plan_steps(plan_doc: &Value) -> impl Iterator<Item = (usize, String, &Value)> {
    plan_doc
        .get("steps")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(index, step)| (index, step_key(step, index), step))
}

fn step_key(step: &Value, index: usize) -> String {
    step.get("id")
        .and_then(Value::as_str)
        .filter(|id| layout::validate_id("step", id).is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("step-{}", index + 1))
}

/// Mock references must be relative paths inside the plan version directory.
fn find_missing_mocks(plan_doc: &Value, plan_dir: &Path) -> Vec<MissingMock> {
    let mut missing = Vec::new();
    for (step_index, step_key, step) in plan_steps(plan_doc) {
        for field in MOCK_FIELDS {
            let Some(declared) = step.get(field).and_then(Value::as_str) else {
                continue;
            };
            let relative = Path::new(declared);
            let contained = !declared.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !contained || !plan_dir.join(relative).is_file() {
                missing.push(MissingMock {
                    step_index,
                    step_key: step_key.clone(),
                    field,
                    declared: declared.to_string(),
                });
            }
        }
    }
    missing
}

fn high_risk_warnings(plan_doc: &Value) -> Vec<Warning> {
    plan_steps(plan_doc)
        .filter(|(_, _, step)| {
            step.get("risk")
                .and_then(Value::as_str)
                .is_some_and(|r| r.eq_ignore_ascii_case("high"))
        })
        .map(|(_, key, _)| Warning::new("plan.high-risk-step", format!("step '{}' is marked high risk", key)))
        .collect()
}

pub fn run_preview_cli(session: &Session, cli: PreviewCli) -> Result<(), AgentCertError> {
    let modes = RunModes {
        self_heal: cli.self_heal,
        doctor: cli.doctor,
        force: cli.force,
        violate: cli.violate,
    };
    let previewer = Previewer::new(&session.workspace, &session.config, modes)?;
    let outcome = previewer.run(&PreviewRequest {
        agent: cli.agent,
        owner: cli.owner,
        previewer: cli.previewer,
    })?;
    output::print_warnings(&outcome.warnings);
    session.emit("preview", json!({ "preview": outcome, "doctor": modes.doctor }), || {
        let mut lines = Vec::new();
        match &outcome.path {
            Some(path) => lines.push(format!("Preview written: {}", path.display())),
            None => lines.push(format!("Doctor: {} checked, nothing written", outcome.lineage)),
        }
        lines.push(format!("Estimated tokens: {}", outcome.estimated_tokens));
        for (section, count) in &outcome.section_tokens {
            lines.push(format!("  {:<12} {}", section, count));
        }
        for h in &outcome.healed {
            lines.push(format!("Self-healed: {}", h));
        }
        lines.join("\n")
    })
}

pub fn schema() -> Value {
    json!({
        "name": "preview",
        "version": "0.1.0",
        "description": "Assemble, estimate and sign a read-only preview snapshot",
        "commands": [
            { "name": "preview", "parameters": ["agent", "owner", "previewer", "self_heal", "doctor", "force", "violate"] }
        ],
        "artifact": {
            "format": PREVIEW_FORMAT,
            "schema": SCHEMA_VERSION,
            "keys": ["agent", "plan", "criteria", "conventions", "owner", "previewer", "sourceVersions", "sectionTokens", "estimatedTokens", "metadata"]
        },
        "storage": ["ops/previews/<agent>@<birth>/preview.json", "ops/previews/<agent>@<birth>/preview.sha256"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_mocks_reject_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("in.json"), "{}").unwrap();
        let plan = json!({"steps": [
            {"id": "fetch", "inputMock": "in.json", "outputMock": "../outside.json"},
            {"inputMock": "missing.json"}
        ]});
        let missing = find_missing_mocks(&plan, tmp.path());
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].step_key, "fetch");
        assert_eq!(missing[0].field, "outputMock");
        assert_eq!(missing[1].step_key, "step-2");
        assert_eq!(missing[1].stub_path(), "mocks/step-2.input.json");
    }

    #[test]
    fn test_high_risk_steps_warn() {
        let plan = json!({"steps": [{"id": "deploy", "risk": "HIGH"}, {"id": "read", "risk": "low"}]});
        let warnings = high_risk_warnings(&plan);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("deploy"));
    }

    #[test]
    fn test_take_section_strips_transport_keys() {
        let version = EntityVersion {
            kind: EntityKind::Agent,
            id: "scout".to_string(),
            timestamp: crate::core::time::Timestamp::parse("20260101T000000000Z").unwrap(),
            path: PathBuf::from("/tmp/scout"),
        };
        let mut sources = BTreeMap::new();
        let doc = json!({"name": "Scout", "cliVersion": "1.2.0", "createdVia": "wizard"});
        let section = take_section(&mut sources, "agent", &version, doc);
        assert_eq!(section, json!({"name": "Scout"}));
        assert_eq!(sources["agent"].transport["cliVersion"], json!("1.2.0"));
        assert_eq!(sources["agent"].transport.len(), 2);
    }
}
