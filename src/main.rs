mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, LedgerCommand};
use ftransfer::config::{ConnectionsFile, Settings};
use ftransfer::ledger::Ledger;
use ftransfer::{logging, scheduler};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long abandoned transfers may hold the runtime once the daemon returns
const SHUTDOWN_LINGER: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.resolve_settings().context("Failed to load settings")?;

    logging::init(cli.debug, &settings.log_file)
        .with_context(|| format!("Failed to open log file {}", settings.log_file.display()))?;

    scheduler::block_on_bounded(dispatch(cli, settings), SHUTDOWN_LINGER)
        .context("Failed to build tokio runtime")?
}

async fn dispatch(cli: Cli, settings: Settings) -> Result<()> {
    match &cli.command {
        None | Some(Command::Run) => run_daemon(&cli, settings).await,
        Some(Command::Check) => check(settings).await,
        Some(Command::Ledger { action }) => ledger_command(action, &settings),
    }
}

async fn run_daemon(cli: &Cli, settings: Settings) -> Result<()> {
    tracing::info!("ftransfer v{} starting", env!("CARGO_PKG_VERSION"));

    let mut connections = ConnectionsFile::load(&settings.connections_file)
        .context("Failed to load connections")?
        .connections;

    if cli.clean {
        clean_download_dir(&settings.download_dir)?;
    }
    std::fs::create_dir_all(&settings.download_dir).with_context(|| {
        format!(
            "Failed to create download directory {}",
            settings.download_dir.display()
        )
    })?;

    let ledger = Arc::new(
        Ledger::open(&settings.database).context("Failed to open download ledger")?,
    );
    if cli.truncate {
        ledger.clear().context("Failed to truncate download ledger")?;
    }

    scheduler::check_reachability(&mut connections, settings.reach_timeout()).await;

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    scheduler::run(Arc::new(settings), connections, ledger, token)
        .await
        .context("Sync stopped on an unrecoverable error")?;

    tracing::info!("ftransfer stopped");
    Ok(())
}

fn clean_download_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => tracing::info!("Removed download directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to clean {}", dir.display()));
        }
    }
    Ok(())
}

async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received interrupt"),
        _ = terminate => tracing::info!("Received termination signal"),
    }
    token.cancel();
}

async fn check(settings: Settings) -> Result<()> {
    let mut connections = ConnectionsFile::load(&settings.connections_file)
        .context("Invalid connections file")?
        .connections;

    scheduler::check_reachability(&mut connections, settings.reach_timeout()).await;

    for conn in &connections {
        println!(
            "{:<20} {:<26} {:<11} {}",
            conn.name,
            conn.address(),
            conn.protocol.to_string(),
            if conn.reachable { "available" } else { "unavailable" }
        );
    }
    println!("{} connections OK", connections.len());
    Ok(())
}

fn ledger_command(action: &LedgerCommand, settings: &Settings) -> Result<()> {
    let ledger = Ledger::open(&settings.database).context("Failed to open download ledger")?;

    match action {
        LedgerCommand::List { page, limit } => {
            let page = ledger.list(*page, *limit)?;
            for record in &page.records {
                println!("{}", serde_json::to_string(record)?);
            }
            println!("total: {}", page.total);
        }
        LedgerCommand::Clear => {
            println!("removed: {}", ledger.clear()?);
        }
        LedgerCommand::Purge => {
            println!("removed: {}", ledger.purge_expired()?);
        }
    }

    ledger.close();
    Ok(())
}
