//! agentcert: tamper-evident, multi-party-signed agent bundles.
//!
//! **agentcert turns human-edited agent artifacts into immutable bundles that
//! downstream automation can trust.**
//!
//! Mutable source documents (agent, plan, criteria, conventions, owner
//! profile, BYO data) move through a staged pipeline. Each stage attaches a
//! cryptographic identity and re-derives the integrity signals of the stage
//! before it, so silent edits between stages are caught.
//!
//! # Core Principles
//!
//! - **Append-only**: entities and identities gain versions, never lose them
//! - **Gated**: a stage refuses input the previous stage did not produce
//! - **Tamper-evident**: token re-estimation plus content digests plus signatures
//! - **Local**: one producer, one verifier, one file system
//!
//! # Pipeline
//!
//! ```text
//! data/...  --preview-->  ops/previews/<agent>@<birth>/preview.json      (previewer signs)
//!           --certify-->  ops/certified/<agent>@<birth>/certified.json   (certifier signs)
//!           --compile-->  ops/compiled/<agent>/<agent>@<birth>.vN.cert.json (compiler signs)
//! ```
//!
//! # Examples
//!
//! ```bash
//! agentcert keygen owner --name alice
//! agentcert keygen previewer --name pat
//! agentcert entity write agent scout --file scout.json --alias current
//! agentcert preview --agent scout
//! agentcert certify --agent scout --certifier carol
//! agentcert compile --agent scout --compiler cody
//! agentcert verify ops/compiled/scout/scout@<birth>.v1.cert.json
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: storage conventions, integrity primitives and artifact states
//! - [`plugins`]: one subsystem per command (keygen, entity, preview, certify, compile, verify)

pub mod core;
pub mod plugins;

use crate::core::error::AgentCertError;
use crate::plugins::{OutputFormat, Session, certify, compile, entity, keygen, preview, verify};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "agentcert",
    version = env!("CARGO_PKG_VERSION"),
    about = "Preview, certify and compile signed agent bundles"
)]
struct Cli {
    /// Workspace root (defaults to the nearest directory holding agentcert.toml or data/ + keys/).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new key version for a named identity
    Keygen(keygen::KeygenCli),
    /// Inspect stored identities
    Keys(keygen::KeysCli),
    /// Append entity versions and move aliases
    Entity(entity::EntityCli),
    /// Assemble and sign a preview
    Preview(preview::PreviewCli),
    /// Gate and sign a preview as certified
    Certify(certify::CertifyCli),
    /// Compile certified artifacts into versioned bundles
    Compile(compile::CompileCli),
    /// Verify an artifact's digests and signatures
    Verify(verify::VerifyCli),
    /// Print the JSON schema of every subsystem
    Schema,
}

impl Command {
    fn op(&self) -> &'static str {
        match self {
            Command::Keygen(_) => "keygen",
            Command::Keys(_) => "keys",
            Command::Entity(_) => "entity",
            Command::Preview(_) => "preview",
            Command::Certify(_) => "certify",
            Command::Compile(_) => "compile",
            Command::Verify(_) => "verify",
            Command::Schema => "schema",
        }
    }

    fn subject(&self) -> String {
        match self {
            Command::Keygen(c) => format!("{}/{}", c.role, c.name),
            Command::Preview(c) => c.agent.clone(),
            Command::Certify(c) => c.agent.clone(),
            Command::Compile(c) => c.agents.join(","),
            Command::Verify(c) => c.path.display().to_string(),
            _ => String::new(),
        }
    }
}

pub fn run() -> Result<(), AgentCertError> {
    let cli = Cli::parse();

    if let Command::Schema = cli.command {
        println!("{}", serde_json::to_string_pretty(&plugins::schema())?);
        return Ok(());
    }

    // keygen and entity may bootstrap a fresh workspace in the current directory.
    let root = match (&cli.root, &cli.command) {
        (Some(root), _) => Some(root.clone()),
        (None, Command::Keygen(_) | Command::Entity(_)) => Some(
            crate::core::layout::find_workspace_root(&std::env::current_dir()?)
                .or_else(|_| std::env::current_dir())?,
        ),
        (None, _) => None,
    };
    let session = Session::open(root, cli.format)?;
    let op = cli.command.op();
    let subject = cli.command.subject();

    let result = match cli.command {
        Command::Keygen(c) => keygen::run_keygen_cli(&session, c),
        Command::Keys(c) => keygen::run_keys_cli(&session, c),
        Command::Entity(c) => entity::run_entity_cli(&session, c),
        Command::Preview(c) => preview::run_preview_cli(&session, c),
        Command::Certify(c) => certify::run_certify_cli(&session, c),
        Command::Compile(c) => compile::run_compile_cli(&session, c),
        Command::Verify(c) => verify::run_verify_cli(&session, c),
        Command::Schema => Ok(()),
    };
    if let Err(e) = &result {
        // Failures are recorded best-effort; the original error wins.
        let _ = session.events().record(
            "agentcert",
            op,
            &subject,
            "error",
            serde_json::json!({ "error": e.to_string(), "integrity": e.is_integrity() }),
        );
    }
    result
}
