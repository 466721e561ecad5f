//! swarmlink CLI
//!
//! Thin wrapper around swarmlink-core for inspecting local client state and
//! running the client against the in-memory network.
//!
//! ## Usage
//!
//! ```bash
//! # Show identity and storage summary
//! swarmlink info
//!
//! # Create an identity (stored in the data directory)
//! swarmlink identity generate
//!
//! # Print the account id, or the blinded id for a community server
//! swarmlink identity show
//! swarmlink identity blinded <server_x25519_hex>
//!
//! # Write or print the client configuration
//! swarmlink config init
//! swarmlink config show
//!
//! # Inspect the cached snode pool, a swarm and its poll cursors
//! swarmlink pool
//! swarmlink swarm <account_id>
//! swarmlink cursors <account_id>
//!
//! # Run two clients and a group against a simulated network
//! swarmlink simulate --nodes 20 --swarm-size 5 --messages 3
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use swarmlink_core::logging::{verbosity_filter, JsonlLayer};
use swarmlink_core::poller::{CycleOutcome, StateReporter};
use swarmlink_core::rpc::SnodeMessage;
use swarmlink_core::sender::LogObserver;
use swarmlink_core::storage::settings;
use swarmlink_core::{
    AccountId, ChannelSink, ClientConfig, ConfigSyncJob, Destination, GroupAdmin, GroupConfigs,
    GroupPoller, Identity, MessageSender, Namespace, OutgoingMessage, Poller, PollerManager,
    RequestAuth, SimNetwork, SnodeApi, Storage, SwarmStore, UserConfigs, UserPoller,
};
use tracing::info;
use tracing_subscriber::prelude::*;

/// swarmlink - onion-routed swarm message storage client
#[derive(Parser)]
#[command(name = "swarmlink")]
#[command(version = "0.1.0")]
#[command(about = "swarmlink - onion-routed swarm message storage client")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.swarmlink/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Also write JSONL logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show identity and storage summary
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Client configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List the cached snode pool
    Pool,

    /// Show the cached swarm of an account
    Swarm {
        /// Account id (66 hex chars)
        account: String,
    },

    /// Show poll cursors of an account, per swarm node and namespace
    Cursors {
        /// Account id (66 hex chars)
        account: String,
    },

    /// Run clients against an in-memory network
    Simulate {
        /// Number of storage nodes
        #[arg(long, default_value = "20")]
        nodes: usize,
        /// Nodes per swarm
        #[arg(long, default_value = "5")]
        swarm_size: usize,
        /// One-to-one messages to send
        #[arg(long, default_value = "3")]
        messages: usize,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show the account id and public keys
    Show,
    /// Generate a new identity
    Generate {
        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },
    /// Blinded id used on a community server
    Blinded {
        /// Server x25519 public key (hex)
        server_key: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn setup_logging(verbosity: u8, log_dir: Option<&Path>) -> Result<()> {
    let jsonl = match log_dir {
        Some(dir) => Some(JsonlLayer::new(dir, "cli").context("Failed to open log directory")?),
        None => None,
    };
    tracing_subscriber::registry()
        .with(verbosity_filter(verbosity))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .init();
    Ok(())
}

/// Get the default data directory (~/.swarmlink/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".swarmlink")
        .join("data")
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

fn load_config(data_dir: &Path) -> Result<ClientConfig> {
    let path = config_path(data_dir);
    if path.exists() {
        ClientConfig::from_file(&path)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    } else {
        Ok(ClientConfig::default())
    }
}

fn open_storage(data_dir: &Path) -> Result<Storage> {
    Storage::new(data_dir.join("swarmlink.redb")).context("Failed to open storage")
}

fn load_identity(store: &dyn SwarmStore) -> Result<Option<Identity>> {
    let Some(bytes) = store.load_setting(settings::IDENTITY_SEED)? else {
        return Ok(None);
    };
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Stored identity seed is corrupt"))?;
    Ok(Some(Identity::from_seed(seed)))
}

fn require_identity(store: &dyn SwarmStore) -> Result<Identity> {
    load_identity(store)?
        .ok_or_else(|| anyhow::anyhow!("No identity yet. Run `swarmlink identity generate` first."))
}

fn parse_account(s: &str) -> Result<AccountId> {
    s.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid account id '{}': {}", s, e))
}

fn print_identity(identity: &Identity) {
    println!("Account ID: {}", identity.account_id());
    println!("  Ed25519: {}", hex::encode(identity.ed25519_public()));
    println!("  X25519:  {}", hex::encode(identity.x25519_public().as_bytes()));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_dir.as_deref())?;

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Info => {
            let store = open_storage(&data_dir)?;
            let config = load_config(&data_dir)?;

            println!("swarmlink v0.1.0");
            println!();
            println!("Identity:");
            match load_identity(&store)? {
                Some(identity) => println!("  Account ID: {}", identity.account_id()),
                None => println!("  Account ID: (not initialized)"),
            }
            println!();
            println!("Storage:");
            println!("  Data dir: {}", data_dir.display());
            println!("  Snode pool: {} node(s)", store.load_pool()?.len());
            println!("  Cached swarms: {}", store.swarm_accounts()?.len());
            println!();
            println!("Network:");
            println!("  Seed nodes: {}", config.seed_nodes.len());
            println!("  Onion path: {} hop(s)", config.onion_path_len);
        }

        Commands::Identity { action } => {
            let store = open_storage(&data_dir)?;
            match action {
                IdentityAction::Show => print_identity(&require_identity(&store)?),
                IdentityAction::Generate { force } => {
                    if load_identity(&store)?.is_some() && !force {
                        bail!("An identity already exists. Use --force to replace it.");
                    }
                    let identity = Identity::generate();
                    store.save_setting(settings::IDENTITY_SEED, identity.seed())?;
                    info!(account = %identity.account_id().short(), "Generated identity");
                    println!("Generated new identity");
                    print_identity(&identity);
                }
                IdentityAction::Blinded { server_key } => {
                    let identity = require_identity(&store)?;
                    let key: [u8; 32] = hex::decode(server_key.trim())
                        .ok()
                        .and_then(|b| b.try_into().ok())
                        .ok_or_else(|| anyhow::anyhow!("Server key must be 32 bytes of hex"))?;
                    println!("Blinded ID: {}", identity.blinded_id(&key));
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = load_config(&data_dir)?;
                print!("{}", config.to_toml()?);
            }
            ConfigAction::Init { force } => {
                let path = config_path(&data_dir);
                if path.exists() && !force {
                    bail!("{} already exists. Use --force to overwrite.", path.display());
                }
                std::fs::create_dir_all(&data_dir)?;
                std::fs::write(&path, ClientConfig::default().to_toml()?)?;
                println!("Wrote {}", path.display());
            }
        },

        Commands::Pool => {
            let store = open_storage(&data_dir)?;
            let pool = store.load_pool()?;
            if pool.is_empty() {
                println!("Snode pool is empty.");
            } else {
                println!("Snode pool ({} nodes):", pool.len());
                for node in pool {
                    println!("  {}  {}", node, node.ed25519_key);
                }
            }
        }

        Commands::Swarm { account } => {
            let store = open_storage(&data_dir)?;
            let account = parse_account(&account)?;
            match store.load_swarm(&account)? {
                Some(swarm) if !swarm.is_empty() => {
                    println!("Swarm of {} ({} nodes):", account.short(), swarm.len());
                    for node in swarm {
                        println!("  {}", node);
                    }
                }
                _ => println!("No cached swarm for {}.", account.short()),
            }
        }

        Commands::Cursors { account } => {
            let store = open_storage(&data_dir)?;
            let account = parse_account(&account)?;
            let swarm = store.load_swarm(&account)?.unwrap_or_default();
            let namespaces = [
                Namespace::DEFAULT,
                Namespace::USER_PROFILE,
                Namespace::CONTACTS,
                Namespace::CONVO_INFO_VOLATILE,
                Namespace::USER_GROUPS,
                Namespace::UNAUTHENTICATED_CLOSED_GROUP,
                Namespace::REVOKED_GROUP_MESSAGES,
                Namespace::CLOSED_GROUP_MESSAGES,
                Namespace::ENCRYPTION_KEYS,
                Namespace::CLOSED_GROUP_INFO,
                Namespace::CLOSED_GROUP_MEMBERS,
            ];
            let mut found = 0;
            for node in &swarm {
                for namespace in namespaces {
                    if let Some(hash) = store.last_hash(node, &account, namespace)? {
                        println!("  {}  ns {:>3}  {}", node, namespace, hash);
                        found += 1;
                    }
                }
            }
            if found == 0 {
                println!("No cursors for {}.", account.short());
            }
        }

        Commands::Simulate {
            nodes,
            swarm_size,
            messages,
        } => {
            if nodes < 4 || swarm_size == 0 {
                bail!("Need at least 4 nodes and a swarm size of 1 or more");
            }
            simulate(nodes, swarm_size, messages).await?;
        }
    }

    Ok(())
}

/// Alice messages Bob, then an admin adds and removes Bob from a group.
async fn simulate(nodes: usize, swarm_size: usize, messages: usize) -> Result<()> {
    let network = SimNetwork::new(nodes, swarm_size);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let alice_api = Arc::new(SnodeApi::new(network.context(Some(alice.clone()))?));
    let bob_ctx = network.context(Some(bob.clone()))?;
    let bob_api = Arc::new(SnodeApi::new(bob_ctx.clone()));

    println!("Network: {} nodes, swarms of {}", nodes, swarm_size);
    println!("Alice: {}", alice.account_id());
    println!("Bob:   {}", bob.account_id());

    let sender = MessageSender::new(alice_api.clone(), Arc::new(LogObserver));
    for i in 0..messages {
        let outcome = sender
            .send(
                OutgoingMessage::visible(format!("m{}", i), format!("hello #{}", i).into_bytes()),
                &Destination::Contact(bob.account_id()),
            )
            .await?;
        info!(reference = ?outcome.reference, "Sent");
    }
    println!("Alice sent {} message(s)", messages);

    let (sink, mut batches) = ChannelSink::new();
    let configs = Arc::new(Mutex::new(UserConfigs::new(&bob)));
    let manager = PollerManager::new(bob_ctx.clone());
    manager
        .start(Box::new(UserPoller::new(bob_api.clone(), Arc::new(sink), configs)?))
        .await;

    let mut received = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while received < messages {
        match tokio::time::timeout_at(deadline, batches.recv()).await {
            Ok(Some(batch)) => {
                for envelope in &batch.envelopes {
                    println!(
                        "  Bob <- {}: {}",
                        envelope.sender.as_ref().map(AccountId::short).unwrap_or_default(),
                        String::from_utf8_lossy(&envelope.payload)
                    );
                }
                received += batch.envelopes.len();
            }
            Ok(None) | Err(_) => break,
        }
    }
    manager.shutdown().await;
    println!("Bob received {} message(s)", received);

    // Group: Bob joins, reads the group name, then gets kicked.
    let mut admin = GroupAdmin::new(Identity::generate());
    let group_configs = Mutex::new(admin.create("Simulated group")?);
    let token = admin.add_member(&mut group_configs.lock(), bob.ed25519_public(), "Bob")?;
    let admin_api = Arc::new(SnodeApi::new(network.context(Some(alice.clone()))?));
    let job = ConfigSyncJob::new(admin_api.clone());
    job.run(&group_configs, RequestAuth::Owner(admin.identity())).await?;
    println!("Group: {}", admin.group_id());

    let member_configs = Arc::new(Mutex::new(GroupConfigs::new(admin.group_id())));
    let (sink, _group_batches) = ChannelSink::new();
    let mut poller = GroupPoller::member(bob_api, Arc::new(sink), member_configs.clone(), Some(token));
    let status = StateReporter::new(poller.key(), bob_ctx);
    poller.poll_cycle(&status).await?;
    println!(
        "Bob joined \"{}\"",
        member_configs.lock().info.name().unwrap_or("(unnamed)")
    );

    let notice = admin.revoke(&mut group_configs.lock(), &bob.account_id())?;
    job.run(&group_configs, RequestAuth::Owner(admin.identity())).await?;
    admin_api
        .send_message(
            &SnodeMessage {
                recipient: admin.group_id(),
                data: STANDARD.encode(&notice),
                ttl_ms: admin_api.context().config.message_ttl_ms,
                timestamp: admin_api.context().clock.now(),
            },
            Namespace::REVOKED_GROUP_MESSAGES,
            RequestAuth::Owner(admin.identity()),
        )
        .await?;

    match poller.poll_cycle(&status).await? {
        CycleOutcome::Removed => println!("Bob was removed from the group"),
        other => println!("Bob is still polling the group ({:?})", other),
    }
    Ok(())
}
