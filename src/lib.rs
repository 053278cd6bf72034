//! ftransfer - mirrors files from a fleet of SFTP, FTP and FTP-over-SSH
//! servers into local storage, removing each remote file once its copy is
//! verified and recorded.

pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod scheduler;
pub mod sync;
pub mod transfer;

pub use error::{AppError, AppResult};
