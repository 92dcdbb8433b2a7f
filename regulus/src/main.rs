use std::sync::Arc;

use clap::Parser;
use regulus::bpf::{KernelMaps, MapProvider, MemoryMaps};
use regulus::config::{Cli, Commands, Config};
use regulus::daemon::Daemon;
use regulus::daemon::watcher::{ContainerRuntime, run_event_listener, run_resync};
use regulus::kubernetes::PodRuntime;
use regulus::metrics::DaemonMetrics;
use regulus::program::loader::{NoopLoader, ProgramLoader, ScriptLoader};
use regulus::{Result, http};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let ready = CancellationToken::new();
    match cli.command {
        Commands::Daemon(args) => {
            setup_subscriber(args.debug);
            let daemon = Arc::new(build_daemon(Config::from(&args)));
            daemon.init().await?;

            let mut metrics_handle = tokio::spawn(http::serve_metrics(
                args.metrics_address,
                ready.child_token(),
                cancel.child_token(),
            ));
            let mut daemon_handle =
                tokio::spawn(run_daemon(daemon, ready, cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            tokio::select! {
                h = &mut metrics_handle => exit("metrics", h),
                h = &mut daemon_handle => exit("daemon", h),
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    let (metrics, daemon) = tokio::join!(metrics_handle, daemon_handle);
                    if let Err(m) = metrics {
                        error!("metrics exited with error: {m}");
                    }
                    if let Err(d) = daemon {
                        error!("daemon exited with error: {d}");
                    }
                },
            };
            info!("Exiting...");
        }
    }
    Ok(())
}

fn build_daemon(config: Config) -> Daemon {
    let (provider, loader): (Arc<dyn MapProvider>, Arc<dyn ProgramLoader>) = if config.dry_run {
        (Arc::new(MemoryMaps::new()), Arc::new(NoopLoader))
    } else {
        (Arc::new(KernelMaps), Arc::new(ScriptLoader::default()))
    };
    Daemon::new(config, provider, loader, DaemonMetrics::registered())
}

async fn run_daemon(
    daemon: Arc<Daemon>,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(node_name) = daemon.config().node_name.clone() else {
        warn!("no node name configured, container discovery is disabled");
        ready.cancel();
        cancel.cancelled().await;
        return Ok(());
    };
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(PodRuntime::try_new(node_name).await?);
    ready.cancel();

    let interval = daemon.config().resync_interval;
    tokio::try_join!(
        run_event_listener(daemon.clone(), runtime.clone(), cancel.clone()),
        run_resync(daemon, runtime, interval, cancel),
    )?;
    Ok(())
}

fn setup_subscriber(debug: bool) {
    let default = if debug { "regulus=debug" } else { "regulus=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(%e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(%e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
