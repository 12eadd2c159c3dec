use crate::core::error::AgentCertError;
use crate::core::time::Timestamp;
use crate::core::versioned::{Alias, EntityKind};
use crate::plugins::Session;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "entity", about = "Append entity versions and move their aliases")]
pub struct EntityCli {
    #[clap(subcommand)]
    pub command: EntityCommand,
}

#[derive(Subcommand, Debug)]
pub enum EntityCommand {
    /// Store a JSON document as a new version.
    Write {
        /// agent, plan, criteria, conventions, owner or byo.
        kind: String,
        id: String,
        #[clap(long)]
        file: PathBuf,
        /// Version timestamp (defaults to now).
        #[clap(long)]
        timestamp: Option<String>,
        /// Point these aliases at the new version.
        #[clap(long = "alias")]
        aliases: Vec<String>,
    },
    /// Point an alias at an existing version.
    Alias {
        kind: String,
        id: String,
        alias: String,
        timestamp: String,
    },
    /// Show the active version (`current`, then `latest`).
    Resolve { kind: String, id: String },
    /// List all versions, oldest first.
    List { kind: String, id: String },
}

pub fn run_entity_cli(session: &Session, cli: EntityCli) -> Result<(), AgentCertError> {
    let store = session.store();
    match cli.command {
        EntityCommand::Write {
            kind,
            id,
            file,
            timestamp,
            aliases,
        } => {
            let kind = EntityKind::parse(&kind)?;
            let aliases = aliases
                .iter()
                .map(|a| Alias::parse(a))
                .collect::<Result<Vec<_>, _>>()?;
            let raw = fs::read_to_string(&file)
                .map_err(|e| AgentCertError::NotFound(format!("{}: {}", file.display(), e)))?;
            let payload: Value = serde_json::from_str(&raw).map_err(|e| {
                AgentCertError::ValidationError(format!("{} is not valid JSON: {}", file.display(), e))
            })?;
            let timestamp = match timestamp {
                Some(raw) => Timestamp::parse(&raw)?,
                None => Timestamp::now(),
            };
            let version = store.write_version(kind, &id, &timestamp, &payload)?;
            for alias in &aliases {
                store.set_alias(kind, &id, *alias, &timestamp)?;
            }
            session.events().record(
                "operator",
                "entity.write",
                &format!("{}/{}", kind.dir_name(), version.lineage()),
                "ok",
                json!({ "aliases": aliases.iter().map(|a| a.as_str()).collect::<Vec<_>>() }),
            )?;
            session.emit("entity.write", json!({ "version": version }), || {
                format!("Wrote {}", version.path.display())
            })
        }
        EntityCommand::Alias {
            kind,
            id,
            alias,
            timestamp,
        } => {
            let kind = EntityKind::parse(&kind)?;
            let alias = Alias::parse(&alias)?;
            let timestamp = Timestamp::parse(&timestamp)?;
            let version = store.set_alias(kind, &id, alias, &timestamp)?;
            session.events().record(
                "operator",
                "entity.alias",
                &format!("{}/{}/{}", kind.dir_name(), id, alias.as_str()),
                "ok",
                json!({ "target": version.lineage() }),
            )?;
            session.emit("entity.alias", json!({ "alias": alias.as_str(), "version": version }), || {
                format!("{}/{}/{} -> {}", kind.dir_name(), id, alias.as_str(), version.lineage())
            })
        }
        EntityCommand::Resolve { kind, id } => {
            let kind = EntityKind::parse(&kind)?;
            let version = store.resolve_active(kind, &id)?;
            session.emit("entity.resolve", json!({ "version": version }), || {
                version.path.display().to_string()
            })
        }
        EntityCommand::List { kind, id } => {
            let kind = EntityKind::parse(&kind)?;
            let versions = store.list_versions(kind, &id)?;
            let current = store.resolve_alias(kind, &id, Alias::Current)?.map(|v| v.timestamp);
            let latest = store.resolve_alias(kind, &id, Alias::Latest)?.map(|v| v.timestamp);
            session.emit(
                "entity.list",
                json!({ "versions": versions, "current": current, "latest": latest }),
                || {
                    versions
                        .iter()
                        .map(|ts| {
                            let mut marks = Vec::new();
                            if current.as_ref() == Some(ts) {
                                marks.push("current");
                            }
                            if latest.as_ref() == Some(ts) {
                                marks.push("latest");
                            }
                            if marks.is_empty() {
                                format!("{}@{}", id, ts)
                            } else {
                                format!("{}@{}  ({})", id, ts, marks.join(", "))
                            }
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                },
            )
        }
    }
}

pub fn schema() -> serde_json::Value {
    json!({
        "name": "entity",
        "version": "0.1.0",
        "description": "Append-only versioned entities with current/latest aliases",
        "commands": [
            { "name": "write", "parameters": ["kind", "id", "file", "timestamp", "alias"] },
            { "name": "alias", "parameters": ["kind", "id", "alias", "timestamp"] },
            { "name": "resolve", "parameters": ["kind", "id"] },
            { "name": "list", "parameters": ["kind", "id"] }
        ],
        "kinds": EntityKind::ALL.iter().map(|k| k.label()).collect::<Vec<_>>(),
        "storage": ["data/<kind>/<id>@<timestamp>/<kind>.json", "data/<kind>/<id>/{current,latest}"]
    })
}
