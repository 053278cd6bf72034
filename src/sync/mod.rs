//! Recursive sync engine
//!
//! Walks a remote tree depth-first, copies every new file into the local
//! mirror, verifies the byte count against the listed size, records the
//! download and only then deletes the remote copy.

use crate::config::{Connection, Settings};
use crate::error::{AppError, AppResult};
use crate::ledger::{DownloadRecord, Ledger};
use crate::logging::{human_bytes, sanitize};
use crate::transfer::{
    client_for, is_plain_name, join_remote, RemoteEntry, TransferClient, TransferOptions,
};
use regex::Regex;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Per-connection inputs of one traversal
pub struct SyncContext<'a> {
    pub server_name: &'a str,
    pub filter: Option<Regex>,
    pub ledger: &'a Ledger,
    /// Once cancelled no further entry is started
    pub cancel: &'a CancellationToken,
}

impl<'a> SyncContext<'a> {
    /// Context for `conn`; an empty regex matches every file
    pub fn for_connection(
        conn: &'a Connection,
        ledger: &'a Ledger,
        cancel: &'a CancellationToken,
    ) -> AppResult<Self> {
        let filter = if conn.regex.is_empty() {
            None
        } else {
            Some(Regex::new(&conn.regex)?)
        };
        Ok(Self {
            server_name: &conn.name,
            filter,
            ledger,
            cancel,
        })
    }

    fn accepts(&self, name: &str) -> bool {
        self.filter.as_ref().map_or(true, |re| re.is_match(name))
    }
}

/// Outcome counters of one pass over a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub downloaded: u64,
    pub bytes: u64,
    pub skipped_existing: u64,
    pub filtered: u64,
    pub failed: u64,
    pub remote_delete_failures: u64,
}

/// Mirror `remote` into `local`, descending at most `depth` levels.
///
/// Only a listing failure at this level or a fatal ledger error is returned.
/// Failures inside a subdirectory or on a single file are logged and skipped.
/// Cancellation stops the walk before the next entry; the entry in flight
/// finishes first.
pub fn sync_tree(
    client: &mut dyn TransferClient,
    remote: &str,
    local: &Path,
    depth: u32,
    ctx: &SyncContext<'_>,
    report: &mut SyncReport,
) -> AppResult<()> {
    if depth == 0 {
        return Ok(());
    }

    let entries = client.list_dir(remote)?;

    for entry in entries {
        if ctx.cancel.is_cancelled() {
            tracing::debug!(server = ctx.server_name, "Pass cancelled in {}", remote);
            return Ok(());
        }
        if !is_plain_name(&entry.name) {
            tracing::debug!(server = ctx.server_name, "Skipping entry {:?}", entry.name);
            continue;
        }
        let remote_path = join_remote(remote, &entry.name);
        let local_path = local.join(&entry.name);

        if entry.is_dir() {
            if let Err(e) = fs::create_dir_all(&local_path) {
                tracing::error!(
                    server = ctx.server_name,
                    "Error creating local directory {}: {}",
                    local_path.display(),
                    e
                );
                continue;
            }
            match sync_tree(client, &remote_path, &local_path, depth - 1, ctx, report) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(
                        server = ctx.server_name,
                        "Error syncing directory {}: {}",
                        remote_path,
                        e
                    );
                }
            }
        } else if entry.is_file() {
            sync_file(client, &entry, &remote_path, &local_path, ctx, report)?;
        }
    }

    Ok(())
}

/// Handle one listed file. Only a fatal ledger error is returned.
fn sync_file(
    client: &mut dyn TransferClient,
    entry: &RemoteEntry,
    remote_path: &str,
    local_path: &Path,
    ctx: &SyncContext<'_>,
    report: &mut SyncReport,
) -> AppResult<()> {
    if !ctx.accepts(&entry.name) {
        report.filtered += 1;
        return Ok(());
    }

    match ctx.ledger.exists(&entry.name, entry.size, ctx.server_name) {
        Ok(true) => {
            tracing::debug!(
                server = ctx.server_name,
                "File {} already downloaded, skipping",
                remote_path
            );
            report.skipped_existing += 1;
            return Ok(());
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(
                server = ctx.server_name,
                "Error checking ledger for {}: {}",
                remote_path,
                e
            );
            report.failed += 1;
            return Ok(());
        }
    }

    let written = match copy_to_local(client, remote_path, local_path) {
        Ok(written) => written,
        Err(e) => {
            tracing::error!(
                server = ctx.server_name,
                "Error downloading {}: {}",
                remote_path,
                sanitize(&e.to_string())
            );
            remove_partial(local_path);
            report.failed += 1;
            return Ok(());
        }
    };

    if written != entry.size {
        tracing::warn!(
            server = ctx.server_name,
            "Size mismatch for {}: remote {} bytes, local {} bytes",
            remote_path,
            entry.size,
            written
        );
        remove_partial(local_path);
        report.failed += 1;
        return Ok(());
    }

    // The record must exist before the remote copy disappears
    ctx.ledger
        .record(&DownloadRecord::now(&entry.name, entry.size, ctx.server_name))?;

    tracing::info!(
        server = ctx.server_name,
        size = entry.size,
        "Downloaded {} ({})",
        remote_path,
        human_bytes(entry.size)
    );
    report.downloaded += 1;
    report.bytes += entry.size;

    if let Err(e) = client.delete(remote_path) {
        tracing::error!(
            server = ctx.server_name,
            "Error deleting remote file {}: {}",
            remote_path,
            sanitize(&e.to_string())
        );
        report.remote_delete_failures += 1;
    }

    Ok(())
}

fn copy_to_local(
    client: &mut dyn TransferClient,
    remote_path: &str,
    local_path: &Path,
) -> AppResult<u64> {
    let file = File::create(local_path)?;
    let mut writer = BufWriter::new(file);
    let written = client.read_file(remote_path, &mut writer)?;
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| AppError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(written)
}

fn remove_partial(local_path: &Path) {
    match fs::remove_file(local_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Error removing partial file {}: {}", local_path.display(), e),
    }
}

/// One full pass over `conn`: connect, mirror into `download_dir/<name>`, close.
///
/// Connection and listing failures are logged and yield the partial report.
/// Only a fatal ledger error is returned.
pub fn sync_connection(
    conn: &Connection,
    settings: &Settings,
    ledger: &Ledger,
    cancel: &CancellationToken,
) -> AppResult<SyncReport> {
    let mut client = client_for(conn.protocol, TransferOptions::from(settings));
    let result = sync_with_client(client.as_mut(), conn, &settings.download_dir, ledger, cancel);
    client.close();
    result
}

/// [`sync_connection`] over an existing, unconnected client. The client is left open.
pub fn sync_with_client(
    client: &mut dyn TransferClient,
    conn: &Connection,
    download_root: &Path,
    ledger: &Ledger,
    cancel: &CancellationToken,
) -> AppResult<SyncReport> {
    let mut report = SyncReport::default();

    let ctx = match SyncContext::for_connection(conn, ledger, cancel) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(server = %conn.name, "Invalid file filter: {}", e);
            return Ok(report);
        }
    };

    if cancel.is_cancelled() {
        return Ok(report);
    }

    if let Err(e) = client.connect(conn) {
        tracing::error!(
            server = %conn.name,
            "Failed to connect to {} over {}: {}",
            conn.address(),
            conn.protocol,
            sanitize(&e.to_string())
        );
        return Ok(report);
    }

    let local_root = download_root.join(&conn.name);
    if let Err(e) = fs::create_dir_all(&local_root) {
        tracing::error!(
            server = %conn.name,
            "Error creating download directory {}: {}",
            local_root.display(),
            e
        );
        return Ok(report);
    }

    match sync_tree(client, &conn.path, &local_root, conn.depth, &ctx, &mut report) {
        Ok(()) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => tracing::error!(server = %conn.name, "Error syncing {}: {}", conn.path, e),
    }

    if report.downloaded > 0 || report.failed > 0 {
        tracing::info!(
            server = %conn.name,
            downloaded = report.downloaded,
            failed = report.failed,
            "Pass finished, {} transferred",
            human_bytes(report.bytes)
        );
    }

    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::testing::MockClient;
    use super::*;
    use crate::config::Protocol;
    use tempfile::TempDir;

    struct Fixture {
        ledger: Ledger,
        download: TempDir,
        conn: Connection,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(depth: u32) -> Self {
            let mut conn = Connection::sample("srv1", Protocol::Sftp);
            conn.path = "/outbox".to_string();
            conn.depth = depth;
            Self {
                ledger: Ledger::open_in_memory().unwrap(),
                download: tempfile::tempdir().unwrap(),
                conn,
                cancel: CancellationToken::new(),
            }
        }

        fn run(&self, client: &mut MockClient) -> SyncReport {
            let report = self.try_run(client).unwrap();
            client.close();
            report
        }

        fn try_run(&self, client: &mut MockClient) -> AppResult<SyncReport> {
            sync_with_client(
                client,
                &self.conn,
                self.download.path(),
                &self.ledger,
                &self.cancel,
            )
        }

        fn local(&self, rel: &str) -> std::path::PathBuf {
            self.download.path().join("srv1").join(rel)
        }
    }

    #[test]
    fn test_fresh_file_is_mirrored_recorded_and_removed() {
        let fx = Fixture::new(1);
        let mut client = MockClient::new().dir("/outbox").file("/outbox/report.csv", 1024);

        let report = fx.run(&mut client);

        assert_eq!(report.downloaded, 1);
        assert_eq!(report.bytes, 1024);
        assert_eq!(fs::metadata(fx.local("report.csv")).unwrap().len(), 1024);
        assert!(!client.exists("/outbox/report.csv"));
        assert!(fx.ledger.exists("report.csv", 1024, "srv1").unwrap());
        assert_eq!(fx.ledger.count().unwrap(), 1);
    }

    #[test]
    fn test_repeat_cycle_does_nothing() {
        let fx = Fixture::new(1);
        let mut client = MockClient::new().dir("/outbox").file("/outbox/report.csv", 1024);
        fx.run(&mut client);
        client.opened.clear();

        let report = fx.run(&mut client);

        assert_eq!(report, SyncReport::default());
        assert!(client.opened.is_empty());
        assert_eq!(fx.ledger.count().unwrap(), 1);
    }

    #[test]
    fn test_recorded_file_is_never_reopened_or_deleted() {
        let fx = Fixture::new(1);
        fx.ledger
            .record(&DownloadRecord::now("report.csv", 1024, "srv1"))
            .unwrap();
        let mut client = MockClient::new().dir("/outbox").file("/outbox/report.csv", 1024);

        for _ in 0..3 {
            let report = fx.run(&mut client);
            assert_eq!(report.skipped_existing, 1);
        }

        assert!(client.opened.is_empty());
        assert!(client.deleted.is_empty());
        assert!(client.exists("/outbox/report.csv"));
    }

    #[test]
    fn test_same_name_different_size_is_downloaded() {
        let fx = Fixture::new(1);
        fx.ledger
            .record(&DownloadRecord::now("report.csv", 512, "srv1"))
            .unwrap();
        let mut client = MockClient::new().dir("/outbox").file("/outbox/report.csv", 1024);

        let report = fx.run(&mut client);

        assert_eq!(report.downloaded, 1);
        assert_eq!(fx.ledger.count().unwrap(), 2);
    }

    #[test]
    fn test_depth_zero_visits_nothing() {
        let fx = Fixture::new(0);
        let mut client = MockClient::new().dir("/outbox").file("/outbox/a.txt", 3);

        let report = fx.run(&mut client);

        assert_eq!(report, SyncReport::default());
        assert!(client.listed.is_empty());
        assert!(client.exists("/outbox/a.txt"));
    }

    #[test]
    fn test_depth_bounds_descent() {
        let fx = Fixture::new(2);
        let mut client = MockClient::new()
            .dir("/outbox")
            .file("/outbox/top.txt", 1)
            .dir("/outbox/day1")
            .file("/outbox/day1/mid.txt", 2)
            .dir("/outbox/day1/deep")
            .file("/outbox/day1/deep/bottom.txt", 3);

        let report = fx.run(&mut client);

        assert_eq!(report.downloaded, 2);
        assert!(fx.local("day1/mid.txt").exists());
        assert!(fx.local("day1/deep").is_dir());
        assert!(!fx.local("day1/deep/bottom.txt").exists());
        assert!(client.exists("/outbox/day1/deep/bottom.txt"));
        assert!(!client.listed.contains(&"/outbox/day1/deep".to_string()));
    }

    #[test]
    fn test_filter_excludes_across_cycles() {
        let mut fx = Fixture::new(1);
        fx.conn.regex = r"\.csv$".to_string();
        let mut client = MockClient::new()
            .dir("/outbox")
            .file("/outbox/keep.csv", 4)
            .file("/outbox/skip.tmp", 4);

        for _ in 0..3 {
            fx.run(&mut client);
        }

        assert!(!client.opened.contains(&"/outbox/skip.tmp".to_string()));
        assert!(client.exists("/outbox/skip.tmp"));
        assert!(!fx.ledger.exists("skip.tmp", 4, "srv1").unwrap());
        assert!(fx.ledger.exists("keep.csv", 4, "srv1").unwrap());
    }

    #[test]
    fn test_short_transfer_is_discarded() {
        let fx = Fixture::new(1);
        let mut client = MockClient::new()
            .dir("/outbox")
            .short_file("/outbox/big.bin", 2048, 1000);

        let report = fx.run(&mut client);

        assert_eq!(report.failed, 1);
        assert!(!fx.local("big.bin").exists());
        assert!(client.exists("/outbox/big.bin"));
        assert_eq!(fx.ledger.count().unwrap(), 0);
    }

    #[test]
    fn test_copy_failure_removes_partial_and_continues() {
        let fx = Fixture::new(1);
        let mut client = MockClient::new()
            .dir("/outbox")
            .file("/outbox/a.txt", 5)
            .file("/outbox/b.txt", 6);
        client.failing_reads.insert("/outbox/a.txt".to_string());

        let report = fx.run(&mut client);

        assert_eq!(report.failed, 1);
        assert_eq!(report.downloaded, 1);
        assert!(!fx.local("a.txt").exists());
        assert!(client.exists("/outbox/a.txt"));
        assert!(fx.ledger.exists("b.txt", 6, "srv1").unwrap());
    }

    #[test]
    fn test_failing_subdirectory_does_not_stop_siblings() {
        let fx = Fixture::new(2);
        let mut client = MockClient::new()
            .dir("/outbox")
            .dir("/outbox/a")
            .file("/outbox/a/1.txt", 1)
            .dir("/outbox/b")
            .file("/outbox/b/2.txt", 2)
            .file("/outbox/top.txt", 3);
        client.failing_lists.insert("/outbox/a".to_string());

        let report = fx.run(&mut client);

        assert_eq!(report.downloaded, 2);
        assert!(fx.local("b/2.txt").exists());
        assert!(fx.local("top.txt").exists());
        assert!(client.exists("/outbox/a/1.txt"));
    }

    #[test]
    fn test_remote_delete_failure_keeps_record() {
        let fx = Fixture::new(1);
        let mut client = MockClient::new().dir("/outbox").file("/outbox/locked.csv", 10);
        client.failing_deletes.insert("/outbox/locked.csv".to_string());

        let report = fx.run(&mut client);
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.remote_delete_failures, 1);
        assert!(client.exists("/outbox/locked.csv"));
        assert!(fx.ledger.exists("locked.csv", 10, "srv1").unwrap());

        client.opened.clear();
        let again = fx.run(&mut client);
        assert_eq!(again.skipped_existing, 1);
        assert!(client.opened.is_empty());
    }

    #[test]
    fn test_ledger_write_failure_is_fatal_and_keeps_remote() {
        let fx = Fixture::new(2);
        fx.ledger.reject_writes();
        let mut client = MockClient::new()
            .dir("/outbox")
            .dir("/outbox/day1")
            .file("/outbox/day1/a.txt", 5);

        let err = fx.try_run(&mut client).unwrap_err();

        assert!(err.is_fatal());
        assert!(client.exists("/outbox/day1/a.txt"));
        assert!(client.deleted.is_empty());
    }

    #[test]
    fn test_closed_ledger_only_skips_files() {
        let fx = Fixture::new(1);
        let mut client = MockClient::new().dir("/outbox").file("/outbox/a.txt", 5);
        fx.ledger.close();

        let report = fx.run(&mut client);

        assert_eq!(report.failed, 1);
        assert!(client.opened.is_empty());
        assert!(client.exists("/outbox/a.txt"));
    }

    #[test]
    fn test_connect_failure_yields_empty_report() {
        let fx = Fixture::new(1);
        let mut client = MockClient::new().dir("/outbox").file("/outbox/a.txt", 5);
        client.fail_connect = true;

        let report = fx.run(&mut client);

        assert_eq!(report, SyncReport::default());
        assert!(client.listed.is_empty());
    }

    #[test]
    fn test_missing_root_is_not_fatal() {
        let fx = Fixture::new(1);
        let mut client = MockClient::new();
        assert_eq!(fx.run(&mut client), SyncReport::default());
    }

    #[test]
    fn test_sync_connection_survives_unreachable_server() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            download_dir: dir.path().to_path_buf(),
            connect_timeout_secs: 1,
            ..Settings::default()
        };
        let mut conn = Connection::sample("offline", Protocol::Ftp);
        conn.port = 1;
        let ledger = Ledger::open_in_memory().unwrap();

        let cancel = CancellationToken::new();

        let report = sync_connection(&conn, &settings, &ledger, &cancel).unwrap();
        assert_eq!(report, SyncReport::default());
    }

    #[test]
    fn test_cancel_stops_before_next_file() {
        let fx = Fixture::new(2);
        let mut client = MockClient::new()
            .dir("/outbox")
            .file("/outbox/a.txt", 5)
            .file("/outbox/b.txt", 6)
            .dir("/outbox/day1")
            .file("/outbox/day1/c.txt", 7);
        client.cancel_on_read = Some(fx.cancel.clone());

        let report = fx.run(&mut client);

        // The file in flight completes, nothing after it starts
        assert_eq!(client.opened, vec!["/outbox/a.txt".to_string()]);
        assert_eq!(report.downloaded, 1);
        assert!(fx.ledger.exists("a.txt", 5, "srv1").unwrap());
        assert!(client.exists("/outbox/b.txt"));
        assert!(!client.listed.contains(&"/outbox/day1".to_string()));
    }

    #[test]
    fn test_cancelled_pass_never_connects() {
        let fx = Fixture::new(1);
        fx.cancel.cancel();
        let mut client = MockClient::new().dir("/outbox").file("/outbox/a.txt", 5);

        let report = fx.run(&mut client);

        assert_eq!(report, SyncReport::default());
        assert_eq!(client.connect_calls, 0);
        assert!(client.exists("/outbox/a.txt"));
    }
}
