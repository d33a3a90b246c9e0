use export_streamer_lib::{
    cli::{parse_args, Command},
    commands::{run_check_config, run_export},
};
use log::info;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancels `shutdown_token` when a SIGTERM or SIGINT signal is received.
async fn handle_shutdown_signals(shutdown_token: CancellationToken) {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("Failed to register SIGTERM signal handler");
    let mut sigint =
        signal(SignalKind::interrupt()).expect("Failed to register SIGINT signal handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down.");
        }
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down.");
        }
        _ = shutdown_token.cancelled() => return,
    }

    shutdown_token.cancel();
}

#[tokio::main]
async fn main() {
    let cli = parse_args();

    let exit_code = match cli.command {
        Command::Run(args) => {
            let shutdown_token = CancellationToken::new();
            let signal_handle = tokio::spawn(handle_shutdown_signals(shutdown_token.clone()));
            let exit_code = run_export(args, "run", shutdown_token.clone()).await;
            shutdown_token.cancel();
            let _ = signal_handle.await;
            exit_code
        }
        Command::CheckConfig(args) => run_check_config(args),
    };

    std::process::exit(exit_code);
}
