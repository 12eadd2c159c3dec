use crate::core::error::AgentCertError;
use crate::core::identity::{Identity, IdentityFields, Role};
use crate::plugins::Session;
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser, Debug)]
#[clap(name = "keygen", about = "Create a new key version for a named identity")]
pub struct KeygenCli {
    /// owner, previewer, certifier, compiler or signer.
    #[clap(value_name = "ROLE")]
    pub role: String,
    #[clap(long)]
    pub name: String,
    #[clap(long, default_value = "")]
    pub email: String,
    #[clap(long, default_value = "")]
    pub organization: String,
    #[clap(long, default_value = "standard")]
    pub trust_level: String,
}

#[derive(Parser, Debug)]
#[clap(name = "keys", about = "Inspect stored identities")]
pub struct KeysCli {
    #[clap(subcommand)]
    pub command: KeysCommand,
}

#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// List identities with their latest key version.
    List {
        #[clap(long)]
        role: Option<String>,
    },
}

pub fn run_keygen_cli(session: &Session, cli: KeygenCli) -> Result<(), AgentCertError> {
    let role = Role::parse(&cli.role)?;
    let fields = IdentityFields {
        name: cli.name,
        email: cli.email,
        organization: cli.organization,
        trust_level: cli.trust_level,
    };
    let identity = session.identities().create_identity(role, &fields)?;
    session.events().record(
        &identity.name,
        "keygen",
        &format!("{}/{}", role.dir_name(), identity.name),
        "ok",
        json!({
            "keyVersion": identity.key_version,
            "fingerprint": identity.fingerprint,
        }),
    )?;
    session.emit("keygen", json!({ "identity": identity }), || {
        format!(
            "Created {} '{}' key {} (fingerprint {})",
            role, identity.name, identity.key_version, identity.fingerprint
        )
    })
}

pub fn run_keys_cli(session: &Session, cli: KeysCli) -> Result<(), AgentCertError> {
    match cli.command {
        KeysCommand::List { role } => {
            let roles = match role {
                Some(raw) => vec![Role::parse(&raw)?],
                None => Role::ALL.to_vec(),
            };
            let store = session.identities();
            let mut identities: Vec<Identity> = Vec::new();
            for role in roles {
                identities.extend(store.list_identities(role)?);
            }
            session.emit("keys.list", json!({ "identities": identities }), || {
                if identities.is_empty() {
                    return "No identities. Run `agentcert keygen <role> --name <name>`.".to_string();
                }
                identities
                    .iter()
                    .map(|i| {
                        format!(
                            "{:<10} {:<16} {}  {}",
                            i.role.as_str(),
                            i.name,
                            i.key_version,
                            &i.fingerprint[..16.min(i.fingerprint.len())]
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

pub fn schema() -> serde_json::Value {
    json!({
        "name": "keygen",
        "version": "0.1.0",
        "description": "Versioned Ed25519 identities per role",
        "commands": [
            { "name": "keygen", "parameters": ["role", "name", "email", "organization", "trust_level"] },
            { "name": "keys list", "parameters": ["role"] }
        ],
        "roles": Role::ALL.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        "storage": ["keys/<role>s/<name>/<timestamp>/", "keys/<role>s/<name>/latest"]
    })
}
