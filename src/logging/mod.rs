//! Log output setup and redaction helpers
//!
//! Remote servers and libssh2 sometimes echo credentials back in error text,
//! so anything derived from a transport error goes through [`sanitize`]
//! before it reaches the log.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Maximum message length before truncation
const MAX_LINE_LENGTH: usize = 2048;

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // SSH Private key blocks
        r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----",
        // FTP PASS command echoed by some servers
        r"(?i)\bPASS\s+\S+",
        // Credentials embedded in URLs
        r"(?i)(ftp|sftp|ssh)://[^:/\s]+:[^@\s]+@",
        // Generic secrets by key name (key=value patterns)
        concat!(
            r"(?i)(password|passwd|pwd|secret|passphrase|private[_-]?key)",
            r#"\s*[:=]\s*["']?[^\s"']+["']?"#,
        ),
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Sanitize a string by removing sensitive information
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.len() > MAX_LINE_LENGTH {
        let mut cut = MAX_LINE_LENGTH;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result = format!("{}... [truncated]", &result[..cut]);
    }

    result
}

/// Format a byte count with binary units, e.g. `1.50 KB`
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = "B";
    for candidate in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = candidate;
    }
    format!("{:.2} {}", value, unit)
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the built-in filter. In debug mode output
/// goes to stderr; otherwise it is appended to `log_file` without colors.
pub fn init(debug: bool, log_file: &Path) -> std::io::Result<()> {
    let default_filter = if debug {
        "ftransfer=debug,info"
    } else {
        "ftransfer=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if debug {
        builder.with_writer(std::io::stderr).init();
    } else {
        if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(log_file)?;
        builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }

    Ok(())
}
