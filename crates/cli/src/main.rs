mod handlers;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    clap::{Parser, Subcommand},
    tokio::io::{AsyncBufReadExt, BufReader},
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    hostgate_config::{GatewayConfig, discover_and_load, load_config},
    hostgate_gateway::GatewayServices,
};

const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "hostgate", about = "Hostgate, multi-transport API gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled transport and run until Ctrl-C.
    Serve {
        /// Config file; searched for in ./ and ~/.config/hostgate when absent.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Host identity selecting a per-identity override section.
        #[arg(long, env = "HOSTGATE_IDENTITY")]
        identity: Option<String>,
        /// Read newline-delimited JSON events from stdin and push each one.
        #[arg(long, default_value_t = false)]
        events_from_stdin: bool,
    },
    /// Print the resolved configuration.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, env = "HOSTGATE_IDENTITY")]
        identity: Option<String>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// An explicit path must load; discovery falls back to defaults instead.
fn resolve_config(path: Option<&Path>, identity: Option<&str>) -> anyhow::Result<GatewayConfig> {
    match path {
        Some(path) => load_config(path, identity),
        None => Ok(discover_and_load(identity)),
    }
}

async fn serve(config: GatewayConfig, events_from_stdin: bool) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let slot = handlers::ServicesSlot::default();
    let registry = Arc::new(handlers::builtin_handlers(Arc::clone(&slot)));
    info!(endpoints = ?registry.endpoint_names(), "handlers registered");

    let services = Arc::new(GatewayServices::new(config, registry));
    if slot.set(Arc::downgrade(&services)).is_err() {
        warn!("services handle already bound");
    }

    let failures = services.start_all().await;
    for (service, e) in &failures {
        error!(service, error = %e, "transport unavailable");
    }
    services.spawn_health_check(HEALTH_CHECK_PERIOD);

    if events_from_stdin {
        tokio::spawn(pump_stdin_events(Arc::clone(&services)));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    services.stop_all().await;
    Ok(())
}

async fn pump_stdin_events(services: Arc<GatewayServices>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read event from stdin");
                break;
            },
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(event) => {
                let delivery = services.push_event(&event).await;
                info!(socket = %delivery.socket, reverse = ?delivery.reverse, "event delivered");
            },
            Err(e) => warn!(error = %e, "ignoring malformed event line"),
        }
    }
    info!("stdin closed, no more events");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "hostgate starting");

    match cli.command {
        Commands::Serve {
            config,
            identity,
            events_from_stdin,
        } => {
            let config = resolve_config(config.as_deref(), identity.as_deref())?;
            serve(config, events_from_stdin).await
        },
        Commands::Config { config, identity } => {
            let config = resolve_config(config.as_deref(), identity.as_deref())?;
            println!("{config:#?}");
            Ok(())
        },
    }
}
