use crate::{
    config::{table_routes, ExportConfig},
    coordinator::ExportCoordinator,
    logging::{format_error_report, init_logging},
    protocol,
    server::setup_server_with_addr,
    sinks::SinkRegistry,
    source::{BlockLog, MemoryBlockLog},
    spool::load_spool_dir,
    state::AppState,
};
use clap::Args;
use dotenv::dotenv;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:3000";

#[derive(Debug, Args, Clone)]
pub struct ExportArgs {
    /// Export config file. Falls back to `EXPORT_CONFIG`.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Directory of spooled blocks to replay. Falls back to `EXPORT_SPOOL_DIR`.
    #[arg(long = "spool-dir")]
    pub spool_dir: Option<PathBuf>,
    /// Falls back to `EXPORT_METRICS_BIND`, then 0.0.0.0:3000.
    #[arg(long = "metrics-bind")]
    pub metrics_bind: Option<String>,
    /// Enables the raw block protocol on this address. Falls back to
    /// `EXPORT_PROTOCOL_BIND`.
    #[arg(long = "protocol-bind")]
    pub protocol_bind: Option<String>,
    /// Cluster member advertised to protocol consumers. Repeatable.
    #[arg(long = "member")]
    pub members: Vec<String>,
    /// Shut down once every pump has reached the end of its source.
    #[arg(long = "exit-when-drained", default_value_t = false)]
    pub exit_when_drained: bool,
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Args, Clone)]
pub struct CheckConfigArgs {
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
}

fn resolve_path(flag: &Option<PathBuf>, var: &str) -> Option<PathBuf> {
    flag.clone()
        .or_else(|| env::var(var).ok().filter(|value| !value.is_empty()).map(PathBuf::from))
}

fn resolve_config_path(flag: &Option<PathBuf>) -> Result<PathBuf, String> {
    resolve_path(flag, "EXPORT_CONFIG")
        .ok_or_else(|| "EXPORT_CONFIG is required (env var or --config)".to_string())
}

fn resolve_metrics_bind(args: &ExportArgs) -> String {
    if let Some(value) = &args.metrics_bind {
        return value.clone();
    }
    env::var("EXPORT_METRICS_BIND").unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
}

fn resolve_protocol_bind(args: &ExportArgs) -> Option<String> {
    args.protocol_bind
        .clone()
        .or_else(|| env::var("EXPORT_PROTOCOL_BIND").ok().filter(|value| !value.is_empty()))
}

fn parse_bind(flag: &str, value: &str) -> Result<SocketAddr, String> {
    value
        .parse::<SocketAddr>()
        .map_err(|err| format!("invalid --{flag} address `{value}`: {err}"))
}

pub fn validate_export_args(args: &ExportArgs) -> Result<(), String> {
    parse_bind("metrics-bind", &resolve_metrics_bind(args))?;
    if let Some(bind) = resolve_protocol_bind(args) {
        parse_bind("protocol-bind", &bind)?;
    }
    if args.members.iter().any(|member| member.trim().is_empty()) {
        return Err("--member must not be empty".to_string());
    }
    if args.log_level.trim().is_empty() {
        return Err("--log-level must not be empty".to_string());
    }
    Ok(())
}

fn report_failure(event: &'static str, message: &str, err: &(dyn std::error::Error + 'static)) {
    let error_report = format_error_report(err);
    error!(
        event,
        error = %err,
        error_debug = ?err,
        error_report = %error_report,
        "{message}"
    );
    eprintln!("{message}: {err}");
    eprintln!("{error_report}");
}

/// Runs the export streamer until `shutdown` fires (or, with `--exit-when-drained`, until
/// every source has been pumped to its end). Returns the process exit code.
pub async fn run_export(args: ExportArgs, logging_mode: &str, shutdown: CancellationToken) -> i32 {
    dotenv().ok();

    let logging_context = init_logging("export_streamer", logging_mode, &args.log_level);
    let run_span = tracing::info_span!(
        "export_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id,
        build_version = %logging_context.build_version,
        build_commit = %logging_context.build_commit
    );
    let _run_guard = run_span.enter();
    info!(event = "export_starting", mode = logging_mode, "starting export streamer");

    if let Err(err) = validate_export_args(&args) {
        eprintln!("{err}");
        return 2;
    }
    let config_path = match resolve_config_path(&args.config) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };
    let config = match ExportConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(err) => {
            report_failure("export_config_load_failed", "failed to load export config", &err);
            return 1;
        }
    };

    let metrics_addr = match parse_bind("metrics-bind", &resolve_metrics_bind(&args)) {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };
    let app_state = Arc::new(AppState::new(shutdown.clone()));
    let metrics_server_handle = match setup_server_with_addr(app_state, metrics_addr).await {
        Ok(handle) => handle,
        Err(err) => {
            report_failure(
                "export_metrics_server_start_failed",
                "failed to start metrics endpoint",
                &err,
            );
            return 1;
        }
    };

    // Event history is only read by tests.
    let log = Arc::new(MemoryBlockLog::with_event_history(0));
    if let Some(spool_dir) = resolve_path(&args.spool_dir, "EXPORT_SPOOL_DIR") {
        if let Err(err) = load_spool_dir(&spool_dir, &log) {
            report_failure("export_spool_load_failed", "failed to load spool directory", &err);
            shutdown.cancel();
            return 1;
        }
    }

    let mut protocol_handle = None;
    if let Some(bind) = resolve_protocol_bind(&args) {
        let listener = match parse_bind("protocol-bind", &bind) {
            Ok(addr) => tokio::net::TcpListener::bind(addr).await,
            Err(err) => {
                eprintln!("{err}");
                shutdown.cancel();
                return 2;
            }
        };
        match listener {
            Ok(listener) => {
                let log: Arc<dyn BlockLog> = log.clone();
                let members = args.members.clone();
                let token = shutdown.clone();
                protocol_handle = Some(tokio::spawn(async move {
                    if let Err(err) = protocol::serve(listener, log, members, token).await {
                        error!(event = "protocol_server_failed", error = %err, "raw protocol server failed");
                    }
                }));
            }
            Err(err) => {
                report_failure(
                    "export_protocol_bind_failed",
                    "failed to bind raw protocol listener",
                    &err,
                );
                shutdown.cancel();
                return 1;
            }
        }
    }

    let coordinator = ExportCoordinator::new(
        log.clone(),
        SinkRegistry::with_builtins(),
        config.pump_config(),
        shutdown.child_token(),
    );
    if let Err(err) = coordinator.configure(&config.targets).await {
        report_failure("export_configure_failed", "failed to configure export targets", &err);
        shutdown.cancel();
        return 1;
    }
    let routed = match coordinator.on_sources_ready(log.sources()).await {
        Ok(routed) => routed,
        Err(err) => {
            report_failure("export_routing_failed", "failed to route sources", &err);
            coordinator.shutdown().await;
            shutdown.cancel();
            return 1;
        }
    };
    if let Err(err) = coordinator.start_polling().await {
        report_failure("export_start_failed", "failed to start polling", &err);
        coordinator.shutdown().await;
        shutdown.cancel();
        return 1;
    }
    info!(event = "export_running", sources = routed, "export streamer running");

    if args.exit_when_drained {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = coordinator.wait_for_drain() => {
                info!(event = "export_drained", "every source reached its end");
            }
        }
    } else {
        shutdown.cancelled().await;
    }

    coordinator.shutdown().await;
    shutdown.cancel();
    if let Some(handle) = protocol_handle {
        if let Err(err) = handle.await {
            warn!(event = "protocol_server_join_failed", error = %err, "raw protocol server task failed");
        }
    }
    if let Err(err) = metrics_server_handle.await {
        warn!(event = "metrics_server_join_failed", error = %err, "metrics server task failed");
    }

    info!(event = "export_stopped", mode = logging_mode, "export streamer stopped");
    0
}

/// Loads a config, resolves every client id and prints the table routes.
pub fn run_check_config(args: CheckConfigArgs) -> i32 {
    dotenv().ok();

    let config_path = match resolve_config_path(&args.config) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };
    let config = match ExportConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid export config: {err}");
            return 1;
        }
    };

    let registry = SinkRegistry::with_builtins();
    for (name, target) in config.targets.iter().filter(|(_, target)| target.enabled) {
        if registry.create(&target.client).is_none() {
            eprintln!(
                "target `{name}` uses unknown sink client `{}` (known: {})",
                target.client,
                registry.names().join(", ")
            );
            return 1;
        }
    }

    match table_routes(&config.targets) {
        Ok(routes) => {
            for (table, target) in routes {
                println!("{table} -> {target}");
            }
            0
        }
        Err(err) => {
            eprintln!("invalid export config: {err}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_export_args, ExportArgs};
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: ExportArgs,
    }

    fn parse(extra: &[&str]) -> ExportArgs {
        let mut argv = vec!["export_streamer"];
        argv.extend_from_slice(extra);
        Harness::parse_from(argv).args
    }

    #[test]
    fn explicit_binds_are_validated() {
        let args = parse(&["--metrics-bind", "127.0.0.1:0", "--protocol-bind", "127.0.0.1:0"]);
        assert_eq!(validate_export_args(&args), Ok(()));

        let args = parse(&["--metrics-bind", "not-an-addr"]);
        let err = validate_export_args(&args).expect_err("bad metrics bind");
        assert!(err.contains("--metrics-bind"), "{err}");

        let args = parse(&["--metrics-bind", "127.0.0.1:0", "--protocol-bind", "nowhere"]);
        let err = validate_export_args(&args).expect_err("bad protocol bind");
        assert!(err.contains("--protocol-bind"), "{err}");
    }

    #[test]
    fn blank_member_is_rejected() {
        let args = parse(&["--metrics-bind", "127.0.0.1:0", "--member", " "]);
        assert!(validate_export_args(&args).is_err());
    }
}
