use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use talkback_core::config::{Config, LoggingConfig};
use talkback_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "talkback",
    about = "Real-time conversational audio gateway: speech in, role-played speech out",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show configuration summary and check a running gateway
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List configured scenarios
    Scenarios,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value by dotted path
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => {
            let (warnings, errors) = config.validate();
            for w in &warnings {
                tracing::warn!("{w}");
            }
            if !errors.is_empty() {
                for e in &errors {
                    tracing::error!("{e}");
                }
                anyhow::bail!("Invalid configuration ({} errors) in {}", errors.len(), config_path.display());
            }

            let port = port.unwrap_or_else(|| config.gateway_port());
            tracing::info!(config = %config_path.display(), "Starting Talkback gateway on port {port}");

            let state = GatewayState::from_config(config)?;
            #[cfg(feature = "metrics")]
            let state = state.with_metrics(talkback_gateway::metrics::install_prometheus_recorder()?);

            talkback_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Status => {
            let port = config.gateway_port();
            println!("Talkback v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway port: {port}");
            println!(
                "Providers: stt={} llm={} tts={}",
                config.providers.stt.provider, config.providers.llm.provider, config.providers.tts.provider
            );
            println!("Scenarios: {}", config.scenarios.len());
            println!("Session TTL: {}s", config.talk.session_ttl_secs);

            match fetch_health(port).await {
                Some(health) => println!(
                    "Status: running (version {}, {} connections)",
                    health["version"].as_str().unwrap_or("?"),
                    health["connections"]
                ),
                None => println!("Status: not running"),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if errors.is_empty() {
                    println!("Config OK ({} warnings)", warnings.len());
                } else {
                    anyhow::bail!("{} config errors", errors.len());
                }
            }
        },
        Commands::Scenarios => {
            if config.scenarios.is_empty() {
                println!("No scenarios configured in {}", config_path.display());
            }
            for s in &config.scenarios {
                println!(
                    "{:<24} {:<16} {:<14} {}",
                    s.id, s.npc_name, s.player_proficiency_level, s.objective_text
                );
            }
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `--verbose`, then the `logging` section.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        logging.and_then(|l| l.level.as_deref()).unwrap_or("info")
    };
    let mut directives = level.to_string();
    for f in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        directives.push(',');
        directives.push_str(f);
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

async fn fetch_health(port: u16) -> Option<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    let resp = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .ok()?;
    resp.json().await.ok()
}
