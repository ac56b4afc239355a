mod cli;
mod constants;
mod shutdown;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use iri_string::types::IriStr;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use podping_writer_core::settings::{self, SettingsManager};
use podping_writer_engine::{start_writer, WriterConfig, WriterError, WriterHandle};

use crate::cli::{Cli, Command, CommonArgs, ServerArgs, WriteArgs};
use crate::constants::{
    EXIT_INTERRUPTED, EXIT_INVALID_POSTING_KEY, EXIT_UNKNOWN_STARTUP_FAILURE,
};
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownEvent};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_settings_manager() -> Arc<SettingsManager> {
    let loaded = settings::settings_overrides_path()
        .and_then(|path| settings::load_settings(&path));
    match loaded {
        Ok(Some(overrides)) => Arc::new(SettingsManager::new(overrides)),
        Ok(None) => Arc::new(SettingsManager::default()),
        Err(err) => {
            warn!("failed to read settings overrides (using defaults): {err:#}");
            Arc::new(SettingsManager::default())
        }
    }
}

fn writer_config(common: &CommonArgs) -> WriterConfig {
    let mut config = WriterConfig::new(common.account.clone());
    config.posting_keys = common.posting_keys.clone();
    config.nodes = common.nodes.clone();
    config.settings = load_settings_manager();
    config.medium = common.medium;
    config.reason = common.reason;
    config.operation_id = common.operation_id.clone();
    config.dry_run = common.dry_run;
    config.max_attempts = common.max_attempts;
    config
}

fn exit_code_for(err: &WriterError) -> i32 {
    match err {
        WriterError::InvalidPostingKey(_) => EXIT_INVALID_POSTING_KEY,
        WriterError::StartupFailed(_) | WriterError::Task(_) => EXIT_UNKNOWN_STARTUP_FAILURE,
        WriterError::Publish(_) => 1,
    }
}

fn start_or_exit(config: WriterConfig) -> WriterHandle {
    match start_writer(config) {
        Ok(handle) => handle,
        Err(err) => {
            error!("{err}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let mut config = writer_config(&args.common);
    config.listen_ip = args.listen_ip;
    config.listen_port = args.listen_port;
    config.resource_test = !args.no_resource_test;
    config.status = !args.no_status;
    config.daemon = true;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        account = %config.server_account,
        dry_run = config.dry_run,
        "podping writer starting",
    );

    let mut handle = start_or_exit(config);
    let stopper = handle.stopper();

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown_tx);

    let result = loop {
        tokio::select! {
            event = shutdown_rx.recv() => {
                match event {
                    Some(ShutdownEvent::Graceful) => {
                        info!("finishing in-flight batches before exiting (press ctrl-c again to exit immediately)");
                        stopper.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        warn!("exiting immediately");
                        std::process::exit(EXIT_INTERRUPTED);
                    }
                    None => {}
                }
            }
            result = handle.join() => break result,
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            error!("{err}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

async fn run_write(args: WriteArgs) -> anyhow::Result<()> {
    for iri in &args.iris {
        IriStr::new(iri).ok().with_context(|| format!("invalid IRI: {iri}"))?;
    }
    let iris: HashSet<String> = args.iris.iter().cloned().collect();

    let mut config = writer_config(&args.common);
    config.daemon = false;
    config.status = false;
    config.resource_test = false;

    let mut handle = start_or_exit(config);

    let outcome = handle
        .publish_iris(iris, args.common.medium, args.common.reason)
        .await;
    handle.request_stop();
    let shutdown = handle.join().await;

    // A startup fatal surfaces through the writer itself with the more
    // specific classification; prefer it over the publish error.
    if let Err(err) = &shutdown {
        error!("{err}");
        std::process::exit(exit_code_for(err));
    }
    match outcome {
        Ok(failures) => {
            info!(iris = args.iris.len(), failures, "published");
            Ok(())
        }
        Err(err) => {
            error!("{err}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Write(args) => run_write(args).await,
    }
}
