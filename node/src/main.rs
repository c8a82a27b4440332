mod config;
mod shell;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use filemesh_registry::{
    discover, CoordinationStore, DiscoveryOutcome, EtcdGatewayStore, NodeDirectory, NodeMap,
    Registration, RegistrationConfig, Registry,
};
use filemesh_rpc::{bind_listener, serve_listener, FileAccessService};
use filemesh_session::{CommandInterpreter, SessionConfig, SessionManager};
use filemesh_storage::build_backend;
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;

fn cli() -> Command {
    Command::new("filemesh-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("filemesh node: serves local storage and browses the files of other nodes")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file path (TOML or YAML)"),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .value_name("NAME")
                .help("Node name to register"),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("HOST:PORT")
                .help("Address advertised to other nodes"),
        )
        .arg(
            Arg::new("endpoint")
                .short('e')
                .long("endpoint")
                .value_name("URL")
                .help("etcd endpoint"),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("HOST:PORT")
                .help("Bind address of the file service (defaults to the advertised address)"),
        )
        .arg(
            Arg::new("storage-root")
                .long("storage-root")
                .value_name("DIR")
                .help("Root directory served by the local storage backend"),
        )
        .arg(
            Arg::new("data-root")
                .long("data-root")
                .value_name("DIR")
                .help("Directory that downloads are written into"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["compact", "pretty"])
                .help("Select log output format"),
        )
        .arg(
            Arg::new("headless")
                .long("headless")
                .action(ArgAction::SetTrue)
                .help("Serve and stay registered without the interactive shell"),
        )
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches.get_one::<PathBuf>("config").map(PathBuf::as_path);
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) -> Result<()> {
    if let Some(name) = matches.get_one::<String>("name") {
        config.node_name = name.clone();
    }

    if let Some(address) = matches.get_one::<String>("address") {
        // the bind address follows the advertised one unless set separately
        if config.rpc_listen == config.advertise_address {
            config.rpc_listen = address.clone();
        }
        config.advertise_address = address.clone();
    }

    if let Some(endpoint) = matches.get_one::<String>("endpoint") {
        config.etcd_endpoint = endpoint.clone();
    }

    if let Some(listen) = matches.get_one::<String>("listen") {
        config.rpc_listen = listen.clone();
    }

    if let Some(root) = matches.get_one::<String>("storage-root") {
        let filemesh_storage::StorageConfig::Local(local) = &mut config.storage else {
            anyhow::bail!("--storage-root only applies to the local storage backend");
        };
        local.root = PathBuf::from(root);
    }

    if let Some(data_root) = matches.get_one::<String>("data-root") {
        config.data_root = PathBuf::from(data_root);
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    let headless = matches.get_flag("headless");

    init_logging(&config)?;
    init_metrics(&config)?;

    info!(
        node = %config.node_name,
        address = %config.advertise_address,
        endpoint = %config.etcd_endpoint,
        "starting filemesh node"
    );
    run(config, headless).await
}

async fn run(config: AppConfig, headless: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let backend = build_backend(&config.storage).context("failed to initialise storage backend")?;
    let service = FileAccessService::new(backend).with_chunk_size(config.chunk_size);
    let listener = bind_listener(&config.rpc_listen).await?;
    let server = tokio::spawn(serve_listener(listener, service, shutdown.clone()));

    let registration = match register(&config).await {
        Ok(registration) => registration,
        Err(err) => {
            shutdown.cancel();
            log_server_exit(server.await);
            return Err(err);
        }
    };
    spawn_liveness_watch(&registration, shutdown.clone());

    let nodes = NodeMap::shared();
    let discovery = tokio::spawn(run_discovery(
        config.clone(),
        nodes.clone(),
        shutdown.child_token(),
    ));

    if headless {
        info!("running headless; press Ctrl+C to stop");
        shutdown.cancelled().await;
    } else {
        let session = SessionManager::new(
            nodes.clone(),
            SessionConfig {
                data_root: config.data_root.clone(),
                timeouts: config.client_timeouts(),
                ..SessionConfig::default()
            },
        );
        let mut interpreter = CommandInterpreter::new(session);
        let mut stdout = tokio::io::stdout();
        let result = shell::run_shell(
            &mut interpreter,
            shell::spawn_stdin_reader(),
            &mut stdout,
            &shutdown,
        )
        .await;
        interpreter.close();
        if let Err(err) = result {
            warn!(error = %err, "shell terminated with an error");
        }
    }

    info!("shutting down");
    shutdown.cancel();
    registration.deregister().await;
    if let Err(err) = discovery.await {
        warn!(error = %err, "discovery task panicked");
    }
    log_server_exit(server.await);
    info!(known_nodes = nodes.len(), "filemesh node stopped");
    Ok(())
}

fn log_server_exit(result: Result<Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "file service failed"),
        Err(err) => warn!(error = %err, "file service task panicked"),
    }
}

async fn register(config: &AppConfig) -> Result<Registration> {
    let store = EtcdGatewayStore::connect(&config.etcd_endpoint, config.dial_timeout())
        .await
        .with_context(|| format!("failed to connect to etcd at {}", config.etcd_endpoint))?;
    let store: Arc<dyn CoordinationStore> = Arc::new(store);
    let registration = Registry::new(store)
        .register(
            RegistrationConfig::new(&config.node_name, &config.advertise_address, config.ttl())
                .with_key_prefix(&config.key_prefix),
        )
        .await
        .with_context(|| format!("failed to register node {}", config.node_name))?;
    Ok(registration)
}

/// Discovery failures leave the node map as it was; the shell keeps working.
async fn run_discovery(config: AppConfig, nodes: Arc<NodeMap>, cancel: CancellationToken) {
    let outcome = discover(
        &config.etcd_endpoint,
        config.dial_timeout(),
        &config.key_prefix,
        nodes,
        cancel,
    )
    .await;
    match outcome {
        Ok(DiscoveryOutcome::Cancelled) => info!("discovery stopped"),
        Ok(DiscoveryOutcome::StoreClosed) => info!("discovery ended: store closed"),
        Err(err) => error!(error = %err, "discovery failed; node list will not be updated"),
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for Ctrl+C");
                    return;
                }
                info!("received Ctrl+C");
                shutdown.cancel();
            }
        }
    });
}

fn spawn_liveness_watch(registration: &Registration, shutdown: CancellationToken) {
    let lost = registration.liveness_lost();
    let key = registration.key().to_string();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = lost.cancelled() => {
                error!(key = %key, "registration lost; other nodes can no longer discover this node");
            }
        }
    });
}

fn init_metrics(config: &AppConfig) -> Result<()> {
    let Some(listen) = &config.prometheus_listen else {
        info!("Prometheus metrics exporter disabled via configuration");
        return Ok(());
    };
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid metrics.prometheus_listen address {listen}"))?;

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            info!(addr = %addr, "Prometheus metrics exporter listening");
            describe_counter!(
                "filemesh_rpc_list_requests_total",
                "ListDirectory calls served"
            );
            describe_counter!(
                "filemesh_rpc_download_requests_total",
                "DownloadFile calls served"
            );
            describe_counter!(
                "filemesh_rpc_download_bytes_total",
                "Bytes relayed by DownloadFile"
            );
            describe_counter!(
                "filemesh_registry_keepalive_failures_total",
                "Lease renewals that ended the registration"
            );
            describe_counter!(
                "filemesh_discovery_events_total",
                "Registry change events applied to the node map"
            );
        }
        Err(err) => warn!("Failed to install Prometheus metrics exporter: {}", err),
    }
    Ok(())
}

/// Logs go to stderr so they do not interleave with shell output.
fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    Ok(())
}
