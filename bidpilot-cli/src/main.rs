//! bidpilot CLI
//!
//! Usage from workspace root:
//!   cargo run --bin bidpilot -- serve                      # Bridge + engine for the browser extension
//!   cargo run --bin bidpilot -- simulate --items 25        # Full run against the simulated wizard
//!   cargo run --bin bidpilot -- checkpoint show <session>  # Inspect stored progress

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use bidpilot::duration::parse_duration;
use bidpilot::extension_bridge::{BridgeEvent, BridgeNotifier, BridgePage, DEFAULT_WS_ADDR};
use bidpilot::simulator::SimulatedWizard;
use bidpilot::{
    CheckpointStore, Engine, EngineConfig, ExtensionBridge, FileStore, HttpDocumentSource,
    HttpStatusReporter, MemoryStore,
};

#[derive(Parser)]
#[command(name = "bidpilot")]
#[command(about = "Resumable automation for the procurement bid wizard")]
struct Cli {
    /// Engine configuration (YAML). Defaults are used when absent.
    #[clap(long, short = 'c', global = true, env = "BIDPILOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept the browser extension and drive the wizard on every page load
    Serve(ServeArgs),
    /// Run a whole submission against the in-memory wizard
    Simulate(SimulateArgs),
    /// Inspect or discard stored progress
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address the extension connects to
    #[clap(long, default_value = DEFAULT_WS_ADDR, env = "BIDPILOT_WS_ADDR")]
    addr: String,

    /// Directory holding checkpoints and sessions
    #[clap(long, default_value = ".bidpilot", env = "BIDPILOT_STATE_DIR")]
    state_dir: PathBuf,

    /// Platform endpoint serving bid documents
    #[clap(long, env = "BIDPILOT_DOCUMENTS_URL")]
    documents_url: Option<String>,

    /// Bearer token for the platform API
    #[clap(long, env = "BIDPILOT_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Backend endpoint receiving progress updates
    #[clap(long, env = "BIDPILOT_STATUS_URL")]
    status_url: Option<String>,

    /// Backend endpoint keeping the history of progress updates
    #[clap(long, env = "BIDPILOT_STATUS_LOG_URL", requires = "status_url")]
    status_log_url: Option<String>,

    /// Longest wait for a single script evaluation in the page
    #[clap(long, default_value = "15s", value_parser = parse_duration)]
    eval_timeout: Duration,
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    #[clap(long, default_value_t = 25)]
    items: u32,

    #[clap(long, default_value_t = 10)]
    page_size: u32,

    /// Remove the slot of this item to watch a catalog fail
    #[clap(long)]
    missing_slot: Option<u32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lower")]
enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum CheckpointCommands {
    Show {
        session_id: String,
        #[clap(long, default_value = ".bidpilot", env = "BIDPILOT_STATE_DIR")]
        state_dir: PathBuf,
        #[clap(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    Clear {
        session_id: String,
        #[clap(long, default_value = ".bidpilot", env = "BIDPILOT_STATE_DIR")]
        state_dir: PathBuf,
    },
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))
}

async fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_yaml_file(path)
            .await
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    match cli.command {
        Commands::Serve(args) => {
            let config = load_config(cli.config.as_ref()).await?;
            serve(args, config).await
        }
        Commands::Simulate(args) => {
            let config = match cli.config.as_ref() {
                Some(_) => load_config(cli.config.as_ref()).await?,
                None => EngineConfig::for_simulation(),
            };
            simulate(args, config).await
        }
        Commands::Checkpoint { command } => checkpoint(command).await,
    }
}

async fn serve(args: ServeArgs, config: EngineConfig) -> Result<()> {
    let bridge = Arc::new(
        ExtensionBridge::start(&args.addr)
            .await
            .context("starting extension bridge")?,
    );
    let store = Arc::new(
        FileStore::open(&args.state_dir)
            .await
            .with_context(|| format!("opening state dir {}", args.state_dir.display()))?,
    );

    let page = Arc::new(BridgePage::new(bridge.clone(), args.eval_timeout));
    let mut builder = Engine::builder(page, store)
        .config(config)
        .notifier(Arc::new(BridgeNotifier::new(bridge.clone())));
    if let Some(url) = args.documents_url {
        let source = HttpDocumentSource::new(url, args.api_token.clone())
            .context("configuring document source")?;
        builder = builder.documents(Arc::new(source));
    }
    if let Some(url) = args.status_url {
        let mut reporter = HttpStatusReporter::new(url, args.api_token.clone())
            .context("configuring status reporter")?;
        if let Some(log_url) = args.status_log_url {
            reporter = reporter.with_log_endpoint(log_url);
        }
        builder = builder.reporter(Arc::new(reporter));
    }
    let engine = Arc::new(builder.build().context("building engine")?);

    let Some(mut events) = bridge.take_events().await else {
        bail!("bridge events already taken");
    };
    info!(addr = %bridge.local_addr(), "Waiting for the extension. Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("extension bridge stopped");
                };
                let engine = engine.clone();
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    match event {
                        BridgeEvent::PageLoaded { url } => {
                            let response = engine.handle("page-loaded", json!({})).await;
                            info!(url = ?url, success = response.success, message = ?response.message, "Page handled");
                        }
                        BridgeEvent::Dispatch { id, envelope } => {
                            let response = engine.dispatch(envelope).await;
                            if let Err(e) = bridge.reply(&id, &response).await {
                                warn!(id = %id, error = %e, "Reply not delivered");
                            }
                        }
                    }
                });
            }
        }
    }
}

async fn simulate(args: SimulateArgs, mut config: EngineConfig) -> Result<()> {
    config.page_size = args.page_size;
    let mut builder = SimulatedWizard::builder().items(args.items, args.page_size);
    if let Some(n) = args.missing_slot {
        builder = builder.missing_slot(n);
    }
    let wizard = Arc::new(builder.build());
    let engine = Engine::builder(wizard.clone(), Arc::new(MemoryStore::default()))
        .config(config)
        .build()
        .context("building engine")?;

    let catalog: Vec<Value> = (1..=args.items)
        .map(|n| {
            json!({
                "itemNumber": n,
                "description": format!("Item {n}"),
                "unitPrice": 100.0 * f64::from(n),
            })
        })
        .collect();
    let payload = json!({
        "sessionId": "simulated",
        "catalog": catalog,
        "offer": {"name": "Simulated offer"},
    });

    let mut response = engine.handle("start", payload).await;
    let mut activations = 1;
    while response.success && wizard.complete_reload() {
        response = engine.handle("page-loaded", json!({})).await;
        activations += 1;
    }

    let summary = json!({
        "screen": format!("{:?}", wizard.screen()),
        "activations": activations,
        "pageVisits": wizard.page_visits(),
        "last": response,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !response.success {
        bail!("simulated run failed");
    }
    Ok(())
}

async fn checkpoint(command: CheckpointCommands) -> Result<()> {
    match command {
        CheckpointCommands::Show {
            session_id,
            state_dir,
            format,
        } => {
            let checkpoints = open_checkpoints(&state_dir).await?;
            let Some(checkpoint) = checkpoints.load(&session_id).await? else {
                println!("No checkpoint for {session_id}");
                return Ok(());
            };
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
                OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&checkpoint)?),
            }
        }
        CheckpointCommands::Clear {
            session_id,
            state_dir,
        } => {
            open_checkpoints(&state_dir).await?.clear(&session_id).await?;
            println!("Cleared checkpoint for {session_id}");
        }
    }
    Ok(())
}

async fn open_checkpoints(state_dir: &Path) -> Result<CheckpointStore> {
    let store = FileStore::open(state_dir)
        .await
        .with_context(|| format!("opening state dir {}", state_dir.display()))?;
    Ok(CheckpointStore::new(
        Arc::new(store),
        EngineConfig::default().checkpoint_ttl,
    ))
}
