// # entropy - Reconciliation Daemon and Client
//
// Thin integration layer: wires configuration, the store, the module
// registry, the API gateway and the syncer together. All reconciliation
// logic lives in entropy-core and the module crates.
//
// ## Usage
//
// ```text
// entropy [--config=<path>] [--host=<host>] [--port=<port>] [--actor=<name>] <command>
//
//   serve [--migrate] [--worker]      run the API (and the syncer with --worker)
//   migrate                           prepare the configured store
//   resource create --file=<json>     create a resource from a CreateRequest
//   resource list [--kind=] [--project=] [--status=] [--label k=v]...
//   resource view <urn>
//   resource edit <urn> --file=<json> replace spec (and labels) of a resource
//   resource delete <urn>
//   action <name> --urn=<urn> [--file=<json params>]
//   logs <urn> [--filter k=v]...
//   version
//   configs                           print the effective configuration
// ```
//
// ## Configuration
//
// A JSON file (`--config` or `ENTROPY_CONFIG`), then `ENTROPY_*`
// environment overrides:
//
// - `ENTROPY_LOG_LEVEL`: trace, debug, info, warn, error
// - `ENTROPY_SERVICE_HOST` / `ENTROPY_SERVICE_PORT`: API address
// - `ENTROPY_STORE_PATH`: file store location
// - `ENTROPY_WORKER_THREADS` / `ENTROPY_WORKER_POLL_INTERVAL_MS`: syncer pool

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use entropy_core::module::LogFilter;
use entropy_core::service::UpdateRequest;
use entropy_core::{
    Client, CreateRequest, EntropyConfig, Gateway, ListFilter, ModuleRegistry, ResourceService,
    Status, Syncer, store,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// - 0: Success or clean shutdown
/// - 1: Usage or configuration error
/// - 2: Runtime or request error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntropyExitCode {
    Success = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<EntropyExitCode> for ExitCode {
    fn from(code: EntropyExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Entropy control plane daemon and client
#[derive(Debug, Parser)]
#[command(name = "entropy", version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "ENTROPY_CONFIG")]
    config: Option<PathBuf>,

    /// API host, overriding service.host
    #[arg(long, global = true)]
    host: Option<String>,

    /// API port, overriding service.port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Caller identity recorded on writes
    #[arg(long, global = true)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
enum Command {
    /// Run the API, and the syncer with --worker
    Serve {
        /// Prepare the store before serving
        #[arg(long)]
        migrate: bool,

        /// Run the syncer pool in this process
        #[arg(long)]
        worker: bool,
    },
    /// Prepare the configured store
    Migrate,
    /// Manage resources
    #[command(subcommand)]
    Resource(ResourceCommand),
    /// Apply a named action to a resource
    Action {
        name: String,

        #[arg(long)]
        urn: String,

        /// JSON file holding the action params
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Stream the logs of a resource
    Logs {
        urn: String,

        /// Label selector, repeatable
        #[arg(long = "filter", value_name = "KEY=VALUE", value_parser = parse_pair)]
        filters: Vec<(String, String)>,
    },
    /// Print the version
    Version,
    /// Print the effective configuration
    Configs,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
enum ResourceCommand {
    /// Create a resource from a JSON CreateRequest
    Create {
        #[arg(long)]
        file: PathBuf,
    },
    /// List resources
    List(ListArgs),
    /// Show one resource
    View { urn: String },
    /// Replace the spec (and labels) of a resource from a JSON file
    Edit {
        urn: String,

        #[arg(long)]
        file: PathBuf,
    },
    /// Delete a resource
    Delete { urn: String },
}

#[derive(Debug, Clone, PartialEq, Args)]
struct ListArgs {
    #[arg(long)]
    kind: Option<String>,

    #[arg(long)]
    project: Option<String>,

    #[arg(long, value_parser = parse_status)]
    status: Option<Status>,

    /// Label selector, repeatable
    #[arg(long = "label", value_name = "KEY=VALUE", value_parser = parse_pair)]
    labels: Vec<(String, String)>,
}

impl From<ListArgs> for ListFilter {
    fn from(args: ListArgs) -> Self {
        ListFilter {
            kind: args.kind,
            project: args.project,
            status: args.status,
            labels: args.labels.into_iter().collect(),
        }
    }
}

fn parse_pair(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn parse_status(raw: &str) -> std::result::Result<Status, String> {
    raw.parse::<Status>().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Help and --version also arrive here
            return if e.use_stderr() {
                EntropyExitCode::ConfigError.into()
            } else {
                EntropyExitCode::Success.into()
            };
        }
    };

    if cli.command == Command::Version {
        println!("entropy {}", env!("CARGO_PKG_VERSION"));
        return EntropyExitCode::Success.into();
    }

    let mut config = match EntropyConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return EntropyExitCode::ConfigError.into();
        }
    };
    if let Some(host) = cli.host {
        config.service.host = host;
    }
    if let Some(port) = cli.port {
        config.service.port = port;
    }

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {e}");
        return EntropyExitCode::ConfigError.into();
    }

    if cli.command == Command::Configs {
        return match print_json(&config) {
            Ok(()) => EntropyExitCode::Success.into(),
            Err(e) => {
                eprintln!("{e:#}");
                EntropyExitCode::RuntimeError.into()
            }
        };
    }

    let log_level = config.log.level().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
        return EntropyExitCode::ConfigError.into();
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to create tokio runtime");
            return EntropyExitCode::RuntimeError.into();
        }
    };

    let code = rt.block_on(async {
        match run(cli.command, cli.actor, config).await {
            Ok(()) => EntropyExitCode::Success,
            Err(e) => {
                error!("{e:#}");
                eprintln!("Error: {e:#}");
                EntropyExitCode::RuntimeError
            }
        }
    });
    code.into()
}

async fn run(command: Command, actor: Option<String>, config: EntropyConfig) -> Result<()> {
    let client = Client::new(config.service.addr()).with_timeout(config.service.request_timeout());

    match command {
        Command::Serve { migrate, worker } => serve(config, migrate, worker).await,
        Command::Migrate => {
            store::migrate(&config.store).await?;
            info!(store = config.store.type_name(), "store migrated");
            Ok(())
        }
        Command::Resource(ResourceCommand::Create { file }) => {
            let request: CreateRequest = read_json(&file)?;
            print_json(&client.create_resource(request, actor).await?)
        }
        Command::Resource(ResourceCommand::List(args)) => {
            print_json(&client.list_resources(args.into()).await?)
        }
        Command::Resource(ResourceCommand::View { urn }) => {
            print_json(&client.get_resource(&urn).await?)
        }
        Command::Resource(ResourceCommand::Edit { urn, file }) => {
            let update: UpdateRequest = read_json(&file)?;
            print_json(&client.update_resource(&urn, update, actor).await?)
        }
        Command::Resource(ResourceCommand::Delete { urn }) => {
            print_json(&client.delete_resource(&urn, actor).await?)
        }
        Command::Action { name, urn, file } => {
            let params = match file {
                Some(file) => read_json(&file)?,
                None => serde_json::Value::Null,
            };
            print_json(&client.apply_action(&urn, &name, params, actor).await?)
        }
        Command::Logs { urn, filters } => {
            let filter: LogFilter = filters.into_iter().collect();
            client
                .logs(&urn, filter, |chunk| println!("{}", chunk.data))
                .await?;
            Ok(())
        }
        Command::Version | Command::Configs => Ok(()),
    }
}

/// Run the API gateway, and the syncer pool when `worker` is set
async fn serve(config: EntropyConfig, migrate: bool, worker: bool) -> Result<()> {
    info!(
        service_name = %config.telemetry.service_name,
        telemetry = config.telemetry.enabled,
        store = config.store.type_name(),
        grpc_port = config.service.grpc_port,
        "starting entropy"
    );
    if config.telemetry.enabled {
        warn!("telemetry export is not available in this build");
    }

    if migrate {
        store::migrate(&config.store)
            .await
            .context("store migration failed")?;
    }
    let store = store::open_store(&config.store)
        .await
        .context("failed to open store")?;
    let registry = Arc::new(build_registry()?);
    info!(kinds = ?registry.kinds(), "modules registered");

    let service = ResourceService::new(Arc::clone(&store), Arc::clone(&registry))
        .with_max_cas_retries(config.service.max_cas_retries);
    let listener = TcpListener::bind(config.service.addr())
        .await
        .with_context(|| format!("failed to bind {}", config.service.addr()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = Arc::new(Gateway::new(service, config.service.request_timeout()));
    let api = tokio::spawn(gateway.serve(listener, shutdown_rx));

    let syncer = worker.then(|| {
        Syncer::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.worker.clone(),
            config.syncer.clone(),
        )
        .start()
    });

    let received = wait_for_shutdown().await?;
    info!(signal = received, "shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Some(handle) = syncer {
        handle.shutdown().await;
    }
    match api.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "api task terminated abnormally"),
    }

    store.flush().await?;
    info!("entropy stopped");
    Ok(())
}

fn build_registry() -> Result<ModuleRegistry> {
    #[allow(unused_mut)]
    let mut registry = ModuleRegistry::new();

    #[cfg(feature = "webhook")]
    entropy_module_webhook::register(&mut registry)?;

    if registry.is_empty() {
        warn!("no modules registered; every create will fail");
    }
    Ok(registry)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for CTRL-C")?;
    Ok("SIGINT")
}
