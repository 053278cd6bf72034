//! Command line

use clap::{Parser, Subcommand};
use ftransfer::config::Settings;
use ftransfer::ledger::DEFAULT_PAGE_LIMIT;
use ftransfer::AppResult;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Mirror files from SFTP, FTP and FTP-over-SSH servers and remove them once stored"
)]
pub struct Cli {
    /// Daemon settings file (TOML); defaults are used when it does not exist
    #[arg(long, global = true, default_value = "ftransfer.toml")]
    pub settings: PathBuf,

    /// Connections file (YAML)
    #[arg(long, global = true)]
    pub connections: Option<PathBuf>,

    /// Local download directory
    #[arg(long, global = true)]
    pub download: Option<PathBuf>,

    /// Number of worker groups
    #[arg(long, global = true)]
    pub groups: Option<usize>,

    /// Download ledger database
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Clear the download ledger before starting
    #[arg(long)]
    pub truncate: bool,

    /// Remove and recreate the download directory before starting
    #[arg(long)]
    pub clean: bool,

    /// Log to stderr at debug level instead of the log file
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the sync daemon until interrupted (default)
    Run,
    /// Validate configuration and dial every server
    Check,
    /// Inspect or maintain the download ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum LedgerCommand {
    /// Print records, most recent first, one JSON object per line
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: u32,
    },
    /// Delete every record
    Clear,
    /// Delete records past the retention horizon
    Purge,
}

impl Cli {
    /// Settings file merged with command line overrides
    pub fn resolve_settings(&self) -> AppResult<Settings> {
        let mut settings = Settings::load(&self.settings)?;
        self.apply_overrides(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(path) = &self.connections {
            settings.connections_file = path.clone();
        }
        if let Some(dir) = &self.download {
            settings.download_dir = dir.clone();
        }
        if let Some(groups) = self.groups {
            settings.groups = groups;
        }
        if let Some(path) = &self.database {
            settings.database = path.clone();
        }
    }
}
