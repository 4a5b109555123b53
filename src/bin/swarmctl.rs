/// swarmctl - inspect and exercise a swarm-memory snapshot
///
/// Every command loads the snapshot file, acts on it, and writes it back.
///
/// Usage:
///   swarmctl set <partition> <key> <json> [--ttl-ms N]  - Store a value
///   swarmctl get <partition> <key>                      - Retrieve a value
///   swarmctl delete <partition> <key>                   - Delete a value
///   swarmctl list [partition]                           - List partitions or keys
///   swarmctl hints [pattern]                            - Discover blackboard hints
///   swarmctl propose <json> --quorum N                  - Open a proposal
///   swarmctl vote <proposal-id> [--no]                  - Vote on a proposal
///   swarmctl report <agent-id>                          - Performance report
///   swarmctl sweep                                      - Remove expired entries
///   swarmctl status                                     - Store statistics
///   swarmctl demo                                       - Simulate a small fleet
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::time::Duration;
use swarm_memory::learning::TaskDescriptor;
use swarm_memory::{
    AgentDescriptor, LearningCapable, OpContext, ProposalState, StoreOptions, SwarmConfig,
    SwarmError, SwarmMemory, TaskOutcome, VoteDecision,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarmctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Snapshot file (default: ~/.swarm-memory/store.snap)
    #[arg(short, long, global = true)]
    db_path: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Agent identity used for access checks
    #[arg(long = "as", global = true, default_value = "operator")]
    caller: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a JSON value
    ///
    /// Examples:
    ///   swarmctl set coordination x '"v1"' --ttl-ms 1000
    ///   swarmctl set coordination x '{"step": 2}' --expect-version 1
    Set {
        /// Partition
        partition: String,
        /// Key
        key: String,
        /// Value (JSON)
        value: String,
        /// Time to live in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,
        /// Fail unless the current version matches
        #[arg(long)]
        expect_version: Option<u64>,
    },

    /// Retrieve a value
    Get {
        /// Partition
        partition: String,
        /// Key
        key: String,
        /// Show version, owner and timestamps
        #[arg(short, long)]
        verbose: bool,
        /// Expand `$ref` pointers in the stored document
        #[arg(long)]
        resolve: bool,
    },

    /// Delete a value
    Delete {
        /// Partition
        partition: String,
        /// Key
        key: String,
    },

    /// List partitions, or the keys of one partition
    List {
        /// Partition to list keys from
        partition: Option<String>,
    },

    /// Discover blackboard hints matching a glob
    Hints {
        /// Glob pattern (`*` and `?`)
        #[arg(default_value = "*")]
        pattern: String,
    },

    /// Open a consensus proposal
    Propose {
        /// Payload (JSON)
        payload: String,
        /// Yes votes needed
        #[arg(short, long, default_value_t = 2)]
        quorum: u32,
        /// Voting window in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,
    },

    /// Vote on a proposal
    Vote {
        /// Proposal ID
        proposal_id: String,
        /// Vote no instead of yes
        #[arg(long)]
        no: bool,
    },

    /// Show an agent's performance report
    Report {
        /// Agent ID
        agent_id: String,
    },

    /// Remove expired entries and expire overdue proposals
    Sweep,

    /// Show store statistics
    Status,

    /// Simulate a small fleet learning which strategy works
    Demo {
        /// Number of agents
        #[arg(long, default_value_t = 3)]
        agents: usize,
        /// Tasks per agent
        #[arg(long, default_value_t = 200)]
        tasks: usize,
        /// RNG seed
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

/// Default snapshot path (~/.swarm-memory/store.snap)
fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".swarm-memory").join("store.snap"))
}

/// Load configuration, pointing the checkpoint at `db_path`
async fn load_config(config_path: Option<&Path>, db_path: PathBuf) -> Result<SwarmConfig> {
    let mut config = match config_path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            SwarmConfig::from_json(&raw).context("Invalid configuration")?
        }
        None => SwarmConfig::default(),
    };
    config.store.checkpoint_path = Some(db_path);
    Ok(config)
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_json(value: &JsonValue) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn parse_json(raw: &str) -> Result<JsonValue> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON value: {}", raw))
}

fn format_state(state: ProposalState) -> ColoredString {
    match state {
        ProposalState::Proposed | ProposalState::Voting => state.to_string().yellow(),
        ProposalState::Committed => state.to_string().green(),
        ProposalState::Rejected => state.to_string().red(),
        ProposalState::Expired => state.to_string().bright_black(),
    }
}

async fn run(memory: &SwarmMemory, ctx: &OpContext, command: Commands) -> Result<()> {
    match command {
        Commands::Set {
            partition,
            key,
            value,
            ttl_ms,
            expect_version,
        } => {
            let json = parse_json(&value)?;
            let mut options = StoreOptions::new();
            if let Some(ms) = ttl_ms {
                options = options.with_ttl(Duration::from_millis(ms));
            }
            if let Some(v) = expect_version {
                options = options.with_expected_version(v);
            }
            let version = memory
                .put_json(ctx, &partition, &key, &json, options)
                .context("Failed to store value")?;

            println!("{}", "OK".green().bold());
            println!("  Stored: {}/{}", partition.cyan(), key.cyan());
            println!("  Version: {}", version.to_string().bright_black());
            Ok(())
        }

        Commands::Get {
            partition,
            key,
            verbose,
            resolve,
        } => {
            let entry = memory.retrieve(ctx, &partition, &key)?;
            let decoder = memory.memory_store().decoder();
            if resolve {
                let json = decoder.decode_resolved(&entry.value).map_err(SwarmError::from)?;
                println!("{}", format_json(&json));
            } else {
                match decoder.decode_value(&entry.value) {
                    Ok(json) => println!("{}", format_json(&json)),
                    Err(_) => println!("{}", String::from_utf8_lossy(&entry.value)),
                }
            }
            if verbose {
                println!();
                println!("  Version: {}", entry.version);
                println!("  Owner: {} ({})", entry.acl.owner_id, entry.acl.visibility);
                println!("  Updated: {}", format_timestamp(&entry.updated_at));
                if let Some(expires) = entry.ttl_expires_at {
                    println!("  Expires: {}", format_timestamp(&expires));
                }
            }
            Ok(())
        }

        Commands::Delete { partition, key } => {
            if memory.delete(ctx, &partition, &key)? {
                println!("{}", "Deleted".green().bold());
            } else {
                println!("{}", "Nothing to delete".yellow());
            }
            Ok(())
        }

        Commands::List { partition } => {
            let store = memory.memory_store();
            match partition {
                Some(p) => {
                    let keys = store.list_keys(&p);
                    if keys.is_empty() {
                        println!("{}", format!("No keys in '{}'", p).yellow());
                    }
                    for key in keys {
                        println!("  {}", key);
                    }
                }
                None => {
                    for p in store.list_partitions() {
                        println!("  {} ({} keys)", p.cyan(), store.list_keys(&p).len());
                    }
                }
            }
            Ok(())
        }

        Commands::Hints { pattern } => {
            let hints = memory.discover(ctx, &pattern)?;
            if hints.is_empty() {
                println!("{}", "No hints".yellow());
            }
            for hint in hints {
                println!(
                    "  {} {} {}",
                    hint.key.cyan(),
                    format!("by {}", hint.advertiser_id).bright_black(),
                    format!("until {}", format_timestamp(&hint.ttl_expires_at)).bright_black()
                );
                println!("    {}", hint.value);
            }
            Ok(())
        }

        Commands::Propose {
            payload,
            quorum,
            ttl_ms,
        } => {
            let proposal = memory
                .propose(ctx, parse_json(&payload)?, quorum, ttl_ms.map(Duration::from_millis))
                .await?;
            println!("{}", "Proposal opened".green().bold());
            println!("  ID: {}", proposal.id.cyan());
            println!("  State: {}", format_state(proposal.state));
            println!("  Deadline: {}", format_timestamp(&proposal.deadline));
            Ok(())
        }

        Commands::Vote { proposal_id, no } => {
            let decision = if no { VoteDecision::No } else { VoteDecision::Yes };
            let proposal = memory.vote(ctx, &proposal_id, decision).await?;
            println!(
                "  {} yes / {} no (quorum {}) - {}",
                proposal.yes_votes(),
                proposal.no_votes(),
                proposal.quorum,
                format_state(proposal.state)
            );
            Ok(())
        }

        Commands::Report { agent_id } => {
            let report = memory
                .performance_tracker(&agent_id)
                .generate_report(ctx)?;
            println!("{}", format!("Performance of {}", agent_id).bold());
            println!("  Snapshots: {}", report.summary.snapshot_count);
            if let Some(improvement) = &report.improvement {
                let pct = format!("{:+.1}%", improvement.aggregate * 100.0);
                let pct = if improvement.aggregate >= 0.0 { pct.green() } else { pct.red() };
                println!("  Improvement: {} (target {:.0}%)", pct, improvement.target * 100.0);
            }
            if let Some(projected) = report.trend.projected_score {
                println!("  Projected: {:+.1}%", projected * 100.0);
            }
            for line in &report.recommendations {
                println!("  - {}", line);
            }
            Ok(())
        }

        Commands::Sweep => {
            let report = memory.sweep().await;
            println!("{}", "Sweep complete".green().bold());
            println!("  Expired entries: {}", report.expired_entries);
            println!("  Expired proposals: {}", report.expired_proposals);
            Ok(())
        }

        Commands::Status => {
            let stats = memory.stats();
            println!("{}", "swarm-memory status".bold());
            println!("  Namespace: {}", memory.layout().namespace().cyan());
            println!("  Partitions: {}", stats.partition_count);
            println!("  Keys: {}", stats.key_count);
            println!("  Events: {}", stats.event_count);
            let proposals = memory.consensus().list_proposals(&OpContext::system())?;
            if !proposals.is_empty() {
                println!("  Proposals:");
                for p in proposals {
                    println!("    {} {}", p.id, format_state(p.state));
                }
            }
            Ok(())
        }

        Commands::Demo {
            agents,
            tasks,
            seed,
        } => run_demo(memory, agents, tasks, seed).await,
    }
}

/// Agents pick between two strategies; "incremental" succeeds far more often.
async fn run_demo(memory: &SwarmMemory, agents: usize, tasks: usize, seed: u64) -> Result<()> {
    let strategies = vec!["full_rebuild".to_string(), "incremental".to_string()];
    let mut rng = StdRng::seed_from_u64(seed);

    println!("{}", "Running fleet simulation".bold());
    for i in 0..agents {
        let agent_id = format!("demo-agent-{}", i);
        let mut agent = memory.create_agent(
            AgentDescriptor::new(agent_id.clone(), "builder").with_capabilities(["build"]),
        );

        for t in 0..tasks {
            let task = TaskDescriptor::new(format!("{}-task-{}", agent_id, t), "build", 0.5);
            let features = agent.learning_engine().features_for(&task);
            let strategy = agent
                .learning_engine()
                .choose_action(&features.encode(), &strategies, &mut rng)
                .unwrap_or_else(|| strategies[0].clone());
            let success_odds = if strategy == "incremental" { 0.9 } else { 0.4 };
            let latency = rng.gen_range(50..500);
            let outcome = if rng.gen_bool(success_odds) {
                TaskOutcome::success(strategy, latency)
            } else {
                TaskOutcome::failure(strategy, latency, "build failed")
            };
            agent.on_task_finished(&task, &outcome).await;
        }
        agent.shutdown();

        let status = agent.learning_engine().get_learning_status();
        let best = agent
            .recommend_strategy(&TaskDescriptor::new("probe", "build", 0.5))
            .map(|r| format!("{} ({:.0}% confidence)", r.strategy, r.confidence * 100.0))
            .unwrap_or_else(|| "none".to_string());
        println!(
            "  {} experiences={} epsilon={:.3} best={}",
            agent_id.cyan(),
            status.total_experiences,
            status.exploration_rate,
            best.green()
        );
    }

    let patterns = memory
        .learning_engine("demo-observer")
        .get_learned_patterns()?;
    println!("{}", format!("Shared patterns: {}", patterns.len()).bold());
    for p in patterns.iter().take(5) {
        println!(
            "  {} {} confidence={:.2} uses={}",
            p.id.bright_black(),
            p.action,
            p.confidence,
            p.usage_count
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = match cli.db_path {
        Some(path) => path,
        None => default_db_path()?,
    };
    let config = load_config(cli.config.as_deref(), db_path).await?;
    let memory = SwarmMemory::start(config)
        .await
        .context("Failed to open snapshot")?;
    let ctx = OpContext::new(cli.caller);

    let result = run(&memory, &ctx, cli.command).await;
    memory.shutdown().await;

    match result {
        Err(e) => match e.downcast_ref::<SwarmError>() {
            Some(SwarmError::NotFound { partition, key }) => {
                eprintln!("{}", "Error".red().bold());
                eprintln!("  Key not found: {}/{}", partition, key);
                std::process::exit(1);
            }
            Some(err @ (SwarmError::AccessDenied { .. } | SwarmError::Conflict { .. })) => {
                eprintln!("{}", "Error".red().bold());
                eprintln!("  {}", err);
                std::process::exit(2);
            }
            _ => Err(e),
        },
        Ok(()) => Ok(()),
    }
}
