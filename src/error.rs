use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Failed to list {path}: {message}")]
    Listing { path: String, message: String },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    /// A verified download could not be recorded. The only error that stops the process.
    #[error("Ledger write failed: {0}")]
    LedgerWrite(String),
}

impl AppError {
    /// Whether this error must halt every scheduling loop instead of being retried next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::LedgerWrite(_))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Ledger(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<regex::Error> for AppError {
    fn from(err: regex::Error) -> Self {
        AppError::InvalidConfig(format!("Invalid file name filter: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
