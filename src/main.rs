/*!
 * Vigil CLI - Command Line Interface
 *
 * `vigil run` drives a shield over an in-memory store seeded with demo tiers;
 * `vigil config` prints and validates configuration files.
 */

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vigil::{
    error::{VigilError, EXIT_FATAL, EXIT_SUCCESS},
    logging, LogLevel, Shield, ShieldConfig, INDEX_KEY,
};
use vigil_store::MemoryStore;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about = "Threat aggregation and storage integrity monitor", long_about = None)]
struct Cli {
    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor over a seeded in-memory store
    Run {
        /// Configuration file (TOML)
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: Option<PathBuf>,

        /// Stop after this many ticks (runs until Ctrl-C when omitted)
        #[arg(short = 'n', long = "ticks")]
        ticks: Option<u64>,

        /// Override the tick interval
        #[arg(long = "interval-ms")]
        interval_ms: Option<u64>,

        /// Corrupt the first tier after the first tick to exercise repair
        #[arg(long)]
        chaos: bool,
    },

    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print a configuration as TOML
    Default {
        #[arg(long, value_enum, default_value = "default")]
        preset: PresetArg,
    },

    /// Load and validate a configuration file
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Copy, Clone, ValueEnum)]
enum PresetArg {
    Default,
    Strict,
    Relaxed,
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<VigilError>()
                .map(VigilError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            ticks,
            interval_ms,
            chaos,
        } => {
            let mut config = match config {
                Some(ref path) => ShieldConfig::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ShieldConfig::default(),
            };
            if let Some(ms) = interval_ms {
                config.monitoring_interval_ms = ms;
            }
            if cli.verbose {
                config.logging.level = LogLevel::Debug;
            }

            if let Err(e) = logging::init_logging(&config.logging) {
                eprintln!("Warning: Failed to initialize logging: {}", e);
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("starting async runtime")?;
            runtime.block_on(run_monitor(config, ticks, chaos))
        }
        Commands::Config(ConfigCommands::Default { preset }) => {
            let config = match preset {
                PresetArg::Default => ShieldConfig::default(),
                PresetArg::Strict => ShieldConfig::strict_preset(),
                PresetArg::Relaxed => ShieldConfig::relaxed_preset(),
            };
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Validate { file }) => {
            let config = ShieldConfig::from_file(&file)
                .with_context(|| format!("loading {}", file.display()))?;
            config.validate()?;
            println!(
                "✓ {} is valid ({} tier(s): {})",
                file.display(),
                config.tiers.len(),
                config.tier_names().join(", ")
            );
            Ok(())
        }
    }
}

async fn run_monitor(config: ShieldConfig, ticks: Option<u64>, chaos: bool) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &config);

    let shield = Shield::new(config.clone(), store.clone())?;
    let _transitions = shield.subscribe_state_change(|t| {
        info!("State change: {} → {} after {:?}", t.from, t.to, t.previous_state_duration);
    });

    let monitor = shield.start_monitor();
    let poll = Duration::from_millis((config.monitoring_interval_ms / 4).max(10));
    let mut corrupted = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(poll) => {
                let done = shield.metrics().ticks_run;
                if chaos && !corrupted && done >= 1 {
                    if let Some(tier) = config.tiers.first() {
                        store.insert(&tier.name, "positions", b"not json");
                        warn!("💥 Corrupted tier '{}'", tier.name);
                    }
                    corrupted = true;
                }
                if ticks.is_some_and(|n| done >= n) {
                    break;
                }
            }
        }
    }

    monitor.shutdown().await;

    let report = json!({
        "status": shield.status(),
        "metrics": shield.metrics(),
        "snapshots": shield.all_snapshots(),
        "pending_conflicts": shield.pending_conflicts(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Fill every tier with a few indexed JSON records
fn seed(store: &MemoryStore, config: &ShieldConfig) {
    for tier in &config.tiers {
        let keys = ["positions", "orders", "limits"];
        for (i, key) in keys.iter().enumerate() {
            let record = json!({ "tier": tier.name, "seq": i, "open": i % 2 == 0 });
            store.insert(&tier.name, key, record.to_string().as_bytes());
        }
        let index = json!(keys);
        store.insert(&tier.name, INDEX_KEY, index.to_string().as_bytes());
    }
}
