//! # world-id-sim CLI
//!
//! Drives the simulator from a terminal: manage the identity, queue it at a
//! sequencer, wait for inclusion and answer bridge codes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use world_id_sim::bridge::ProofResponse;
use world_id_sim::credential::CredentialType;
use world_id_sim::field::encode_field;
use world_id_sim::identity::FileStorage;
use world_id_sim::orchestrator::{CancellationSource, Decision, FlowOutcome, Scanned};
use world_id_sim::{Identity, IdentityStore, Orchestrator, ProofEngine, SimulatorConfig};

#[derive(Parser, Debug)]
#[command(name = "world-id-sim", version, about = "World ID identity and proof simulator")]
struct Cli {
    /// Enable verbose output. Repeat for more (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory holding cached proving/verifying keys.
    #[arg(long, global = true, env = "WORLD_ID_KEYS_DIR")]
    keys: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, derive, inspect or erase the identity.
    #[command(subcommand)]
    Identity(IdentityCommand),

    /// Queue the identity's commitment at a credential sequencer.
    Register {
        /// orb, document, phone or device.
        level: CredentialType,
    },

    /// Poll a sequencer until the identity is included. Ctrl-C stops.
    Poll { level: CredentialType },

    /// Answer a scanned bridge code.
    Verify {
        /// The scanned text: a bridge URL or a pairing URI.
        code: String,

        /// Send the proof without prompting.
        #[arg(long, conflicts_with = "decline")]
        approve: bool,

        /// Decline the request.
        #[arg(long)]
        decline: bool,

        /// Re-verify the outgoing response as the requester would.
        #[arg(long)]
        check: bool,
    },
}

#[derive(Subcommand, Debug)]
enum IdentityCommand {
    /// Generate a random identity.
    New,
    /// Derive an identity deterministically from a seed string.
    Derive { seed: String },
    /// Print the commitment and verified levels.
    Show,
    /// Print the identity, secrets included, as JSON.
    Export,
    /// Replace the identity with one previously exported.
    Import {
        /// JSON produced by `identity export`.
        json: String,
    },
    /// Irreversibly erase the identity.
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = SimulatorConfig::from_env().context("loading configuration")?;
    debug!(?config, "configuration loaded");

    let identities = Arc::new(match &config.identity_path {
        Some(path) => IdentityStore::new(Box::new(FileStorage::new(path))),
        None => IdentityStore::ephemeral(),
    });
    identities.load();

    let engine = Arc::new(ProofEngine::new(config.tree_depth));
    if let Some(dir) = &cli.keys {
        load_or_create_keys(&engine, dir, config.tree_depth)?;
    }

    let orchestrator = Orchestrator::new(config, identities, engine)?;

    match cli.command {
        Commands::Identity(command) => identity(&orchestrator, command).await,
        Commands::Register { level } => {
            orchestrator.register(level).await?;
            info!(%level, "registration submitted");
            Ok(())
        }
        Commands::Poll { level } => poll(&orchestrator, level).await,
        Commands::Verify {
            code,
            approve,
            decline,
            check,
        } => verify(&orchestrator, &code, approve, decline, check).await,
    }
}

fn load_or_create_keys(engine: &ProofEngine, dir: &std::path::Path, depth: usize) -> anyhow::Result<()> {
    match engine.load_keys(dir, depth) {
        Ok(()) => {
            info!(dir = %dir.display(), depth, "loaded circuit keys");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "no usable keys on disk, running setup");
            engine
                .save_keys(dir, depth)
                .with_context(|| format!("writing keys to {}", dir.display()))
        }
    }
}

async fn identity(orchestrator: &Orchestrator, command: IdentityCommand) -> anyhow::Result<()> {
    let store = orchestrator.identities();
    match command {
        IdentityCommand::New => {
            let identity = store.create_random();
            store.persist(&identity)?;
            println!("{}", encode_field(&identity.commitment()));
        }
        IdentityCommand::Derive { seed } => {
            let identity = store.derive_from_seed(seed.as_bytes());
            store.persist(&identity)?;
            println!("{}", encode_field(&identity.commitment()));
        }
        IdentityCommand::Show => {
            let Some(identity) = store.active() else {
                bail!("no identity; run `identity new` first");
            };
            println!("commitment: {}", encode_field(&identity.commitment()));
            println!("persisted:  {}", identity.is_persisted());
            for (level, verified) in identity.verified_levels() {
                println!("{:<9} {}", level.as_str(), if verified { "verified" } else { "-" });
            }
        }
        IdentityCommand::Export => {
            let Some(identity) = store.active() else {
                bail!("no identity to export");
            };
            println!("{}", identity.to_json()?.as_str());
        }
        IdentityCommand::Import { json } => {
            let identity = Identity::from_json(&json).context("parsing exported identity")?;
            let identity = store.persist(&identity)?;
            println!("{}", encode_field(&identity.commitment()));
        }
        IdentityCommand::Reset => orchestrator.reset_identity().await?,
    }
    Ok(())
}

async fn poll(orchestrator: &Orchestrator, level: CredentialType) -> anyhow::Result<()> {
    let source = CancellationSource::new();
    let token = source.token();

    let wait = orchestrator.wait_for_inclusion(level, token);
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result?,
        _ = tokio::signal::ctrl_c() => {
            source.cancel();
            wait.as_mut().await?
        }
    };

    match result {
        Some(proof) => {
            let root = proof.root.as_ref().map(encode_field).unwrap_or_default();
            println!("included at {level}, root {root}");
        }
        None => println!("stopped before {level} inclusion"),
    }
    Ok(())
}

async fn verify(
    orchestrator: &Orchestrator,
    code: &str,
    approve: bool,
    decline: bool,
    check: bool,
) -> anyhow::Result<()> {
    let mut flow = match orchestrator.scan(code)? {
        Scanned::Bridge(flow) => flow,
        Scanned::Pairing(uri) => {
            bail!(
                "pairing URI for topic {} recognised, but no session transport is available here",
                uri.topic
            );
        }
    };

    let source = CancellationSource::new();
    let prepared = tokio::select! {
        prepared = flow.prepare(source.token()) => prepared?,
        _ = tokio::signal::ctrl_c() => {
            source.cancel();
            bail!("cancelled");
        }
    };

    println!("app:        {}", prepared.metadata.name);
    println!("action:     {}", prepared.request.description());
    println!("credential: {}", prepared.credential);
    if prepared.already_verified {
        println!("warning:    already verified for this action");
    }

    if check {
        let response = ProofResponse::new(&prepared.proof, prepared.credential);
        let valid = orchestrator.verify_response(&prepared.request, &response)?;
        println!("check:      {}", if valid { "valid" } else { "INVALID" });
    }

    let decision = if decline {
        Decision::Decline
    } else if approve {
        Decision::Approve
    } else {
        warn!("neither --approve nor --decline given, dismissing");
        flow.dismiss()?;
        return Ok(());
    };

    let outcome = match decision {
        Decision::Approve => flow.approve().await?,
        Decision::Decline => flow.decline().await?,
    };
    match outcome {
        FlowOutcome::Verified { credential, description } => {
            println!("verified with {credential}: {description}")
        }
        FlowOutcome::Declined(code) => println!("declined: {code}"),
    }
    Ok(())
}
