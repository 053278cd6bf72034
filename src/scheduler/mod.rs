//! Worker groups
//!
//! Connections are split into a fixed number of groups. Each group is one
//! long-lived task that walks its connections in order forever, running
//! every pass on the blocking pool. All sleeps race the shared cancellation
//! token so a shutdown never waits on an idle group, and the token is handed
//! to each pass so a walk stops at the next file.

use crate::config::{Connection, Settings};
use crate::error::{AppError, AppResult};
use crate::ledger::Ledger;
use crate::logging::human_bytes;
use crate::sync::{sync_connection, SyncReport};
use futures::future::join_all;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Builder;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A statically assigned slice of the connection list
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub connections: Vec<Connection>,
}

/// One pass over one connection. Runs on a blocking thread and should
/// return early once the token is cancelled.
pub type PassFn =
    dyn Fn(&Connection, &Settings, &Ledger, &CancellationToken) -> AppResult<SyncReport>
        + Send
        + Sync;

/// Run `daemon` on a fresh multi-threaded runtime, then give leftover
/// blocking work at most `linger` before the runtime is dropped.
///
/// A pass stuck in a blocking read is abandoned by [`run_groups`] but still
/// holds a blocking-pool thread; a plain runtime drop would wait for it.
pub fn block_on_bounded<F: Future>(daemon: F, linger: Duration) -> io::Result<F::Output> {
    let runtime = Builder::new_multi_thread().enable_all().build()?;
    let output = runtime.block_on(daemon);
    runtime.shutdown_timeout(linger);
    Ok(output)
}

/// Split `connections` into `count` groups of `len / count`; the last group takes the rest.
pub fn split_connections(connections: Vec<Connection>, count: usize) -> Vec<Group> {
    let count = count.max(1);
    let per_group = connections.len() / count;
    let mut remaining = connections.into_iter();

    (1..=count)
        .map(|i| {
            let connections: Vec<Connection> = if i == count {
                remaining.by_ref().collect()
            } else {
                remaining.by_ref().take(per_group).collect()
            };
            Group {
                name: format!("group_{}", i),
                connections,
            }
        })
        .collect()
}

/// Dial every connection once and set its advisory `reachable` flag
pub async fn check_reachability(connections: &mut [Connection], timeout: Duration) {
    let dials = connections
        .iter()
        .map(|conn| dial(conn.host.clone(), conn.port, timeout));
    let results = join_all(dials).await;

    for (conn, reachable) in connections.iter_mut().zip(results) {
        conn.reachable = reachable;
        if reachable {
            tracing::info!("Server {} ({}) is available", conn.name, conn.address());
        } else {
            tracing::warn!("Server {} ({}) is unavailable", conn.name, conn.address());
        }
    }
}

async fn dial(host: String, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await,
        Ok(Ok(_))
    )
}

/// Log the group assignment as a table
pub fn log_groups(groups: &[Group]) {
    tracing::info!(
        "{:<10} {:<20} {:<20} {:<6} {:<11} {:<15}",
        "GROUP",
        "NAME",
        "HOST",
        "PORT",
        "PROTOCOL",
        "USERNAME"
    );
    for group in groups {
        for conn in &group.connections {
            tracing::info!(
                "{:<10} {:<20} {:<20} {:<6} {:<11} {:<15}",
                group.name,
                conn.name,
                conn.host,
                conn.port,
                conn.protocol.to_string(),
                conn.username
            );
        }
    }
}

/// Run every group with [`sync_connection`] until `token` is cancelled
pub async fn run(
    settings: Arc<Settings>,
    connections: Vec<Connection>,
    ledger: Arc<Ledger>,
    token: CancellationToken,
) -> AppResult<()> {
    let groups = split_connections(connections, settings.groups);
    log_groups(&groups);
    run_groups(groups, settings, ledger, token, Arc::new(sync_connection)).await
}

/// Drive `groups` with `pass` until cancelled or a fatal error occurs.
///
/// After cancellation, in-flight passes get `shutdown_grace` to finish before
/// they are abandoned, then the ledger is closed. The first fatal error, if
/// any, is returned. Abandoned passes keep their blocking thread until their
/// transport times out; see [`block_on_bounded`].
pub async fn run_groups(
    groups: Vec<Group>,
    settings: Arc<Settings>,
    ledger: Arc<Ledger>,
    token: CancellationToken,
    pass: Arc<PassFn>,
) -> AppResult<()> {
    let mut tasks = JoinSet::new();
    for group in groups {
        if group.connections.is_empty() {
            tracing::debug!("Skipping empty {}", group.name);
            continue;
        }
        tasks.spawn(run_group(
            group,
            settings.clone(),
            ledger.clone(),
            token.clone(),
            pass.clone(),
        ));
    }

    token.cancelled().await;
    tracing::info!("Shutting down, waiting for in-flight transfers");

    let mut fatal: Option<AppError> = None;
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(e) => tracing::error!("Group task failed: {}", e),
            }
        }
    };
    if tokio::time::timeout(settings.shutdown_grace(), drain).await.is_err() {
        tracing::warn!(
            "Abandoning {} groups still busy after {}s",
            tasks.len(),
            settings.shutdown_grace_secs
        );
        tasks.abort_all();
    }

    ledger.close();

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_group(
    group: Group,
    settings: Arc<Settings>,
    ledger: Arc<Ledger>,
    token: CancellationToken,
    pass: Arc<PassFn>,
) -> AppResult<()> {
    tracing::info!(
        group = %group.name,
        "Starting with {} connections",
        group.connections.len()
    );

    loop {
        for conn in &group.connections {
            if token.is_cancelled() {
                return Ok(());
            }

            let delay = Duration::from_secs(conn.delay);
            let job = {
                let conn = conn.clone();
                let settings = settings.clone();
                let ledger = ledger.clone();
                let pass = pass.clone();
                let token = token.clone();
                move || pass(&conn, &*settings, &*ledger, &token)
            };

            match tokio::task::spawn_blocking(job).await {
                Ok(Ok(report)) => {
                    tracing::debug!(
                        group = %group.name,
                        server = %conn.name,
                        downloaded = report.downloaded,
                        skipped = report.skipped_existing,
                        failed = report.failed,
                        "Pass done ({})",
                        human_bytes(report.bytes)
                    );
                }
                Ok(Err(e)) if e.is_fatal() => {
                    tracing::error!(group = %group.name, server = %conn.name, "Stopping: {}", e);
                    token.cancel();
                    return Err(e);
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        group = %group.name,
                        server = %conn.name,
                        "Pass failed: {}",
                        e
                    );
                }
                Err(e) => {
                    tracing::error!(
                        group = %group.name,
                        server = %conn.name,
                        "Pass panicked: {}",
                        e
                    );
                }
            }

            if !sleep_unless_cancelled(delay, &token).await {
                return Ok(());
            }
        }

        if !sleep_unless_cancelled(settings.cycle_interval(), &token).await {
            return Ok(());
        }
    }
}

/// Sleep for `duration`; false if the token fired first
async fn sleep_unless_cancelled(duration: Duration, token: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connections(n: usize) -> Vec<Connection> {
        (1..=n)
            .map(|i| Connection::sample(&format!("srv{}", i), Protocol::Sftp))
            .collect()
    }

    fn fast_settings() -> Arc<Settings> {
        Arc::new(Settings {
            cycle_interval_secs: 1,
            shutdown_grace_secs: 5,
            ..Settings::default()
        })
    }

    /// Wrap a closure that only looks at the connection as a pass
    fn pass_fn(
        f: impl Fn(&Connection) -> AppResult<SyncReport> + Send + Sync + 'static,
    ) -> Arc<PassFn> {
        Arc::new(
            move |conn: &Connection, _: &Settings, _: &Ledger, _: &CancellationToken| f(conn),
        )
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_split_five_into_two() {
        let groups = split_connections(connections(5), 2);
        let sizes: Vec<_> = groups.iter().map(|g| g.connections.len()).collect();
        assert_eq!(sizes, [2, 3]);
        assert_eq!(groups[0].name, "group_1");
        assert_eq!(groups[1].name, "group_2");
        assert_eq!(groups[1].connections[2].name, "srv5");
    }

    #[test]
    fn test_split_even_and_oversized() {
        let sizes: Vec<_> = split_connections(connections(6), 3)
            .iter()
            .map(|g| g.connections.len())
            .collect();
        assert_eq!(sizes, [2, 2, 2]);

        let groups = split_connections(connections(2), 5);
        assert_eq!(groups.len(), 5);
        let sizes: Vec<_> = groups.iter().map(|g| g.connections.len()).collect();
        assert_eq!(sizes, [0, 0, 0, 0, 2]);
    }

    #[test]
    fn test_split_zero_groups_means_one() {
        let groups = split_connections(connections(3), 0);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].connections.len(), 3);
    }

    #[tokio::test]
    async fn test_reachability_is_marked() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let closed_port = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };

        let mut conns = connections(2);
        conns[0].port = open_port;
        conns[1].port = closed_port;
        check_reachability(&mut conns, Duration::from_secs(2)).await;

        assert!(conns[0].reachable);
        assert!(!conns[1].reachable);
    }

    #[tokio::test]
    async fn test_groups_cycle_in_order_until_cancelled() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let recorder = seen.clone();
        let pass = pass_fn(move |conn| {
            recorder.lock().push(conn.name.clone());
            Ok(SyncReport::default())
        });

        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let token = CancellationToken::new();
        let groups = split_connections(connections(3), 1);
        let handle = tokio::spawn(run_groups(
            groups,
            fast_settings(),
            ledger.clone(),
            token.clone(),
            pass,
        ));

        wait_for(|| seen.lock().len() >= 6).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        let seen = seen.lock();
        assert_eq!(&seen[..6], ["srv1", "srv2", "srv3", "srv1", "srv2", "srv3"]);
        assert!(ledger.count().is_err());
    }

    #[tokio::test]
    async fn test_failed_pass_does_not_stop_group() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pass = pass_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Connection("connection refused".to_string()))
        });

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_groups(
            split_connections(connections(2), 2),
            fast_settings(),
            Arc::new(Ledger::open_in_memory().unwrap()),
            token.clone(),
            pass,
        ));

        wait_for(|| calls.load(Ordering::SeqCst) >= 4).await;
        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fatal_error_cancels_every_group() {
        let pass = pass_fn(|conn| {
            if conn.name == "srv1" {
                Err(AppError::LedgerWrite("disk full".to_string()))
            } else {
                Ok(SyncReport::default())
            }
        });

        let token = CancellationToken::new();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run_groups(
                split_connections(connections(4), 2),
                fast_settings(),
                Arc::new(Ledger::open_in_memory().unwrap()),
                token.clone(),
                pass,
            ),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(AppError::LedgerWrite(_))));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_long_delay() {
        let mut conns = connections(1);
        conns[0].delay = 3600;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pass = pass_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(SyncReport::default())
        });

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_groups(
            split_connections(conns, 1),
            fast_settings(),
            Arc::new(Ledger::open_in_memory().unwrap()),
            token.clone(),
            pass,
        ));

        wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pass_sees_shutdown_token() {
        let stopped_early = Arc::new(AtomicUsize::new(0));
        let counter = stopped_early.clone();
        let pass: Arc<PassFn> = Arc::new(
            move |_: &Connection,
                  _: &Settings,
                  _: &Ledger,
                  token: &CancellationToken|
                  -> AppResult<SyncReport> {
                for _ in 0..500 {
                    if token.is_cancelled() {
                        counter.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(SyncReport::default())
            },
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_groups(
            split_connections(connections(1), 1),
            fast_settings(),
            Arc::new(Ledger::open_in_memory().unwrap()),
            token.clone(),
            pass,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(stopped_early.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stuck_pass_does_not_hold_process_open() {
        let settings = Arc::new(Settings {
            cycle_interval_secs: 1,
            shutdown_grace_secs: 1,
            ..Settings::default()
        });
        // Ignores the token, like a transfer blocked in a socket read
        let pass = pass_fn(|_| {
            std::thread::sleep(Duration::from_secs(6));
            Ok(SyncReport::default())
        });
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let token = CancellationToken::new();

        let started = std::time::Instant::now();
        let daemon = {
            let ledger = ledger.clone();
            let token = token.clone();
            async move {
                let trigger = token.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    trigger.cancel();
                });
                run_groups(
                    split_connections(connections(1), 1),
                    settings,
                    ledger,
                    token,
                    pass,
                )
                .await
            }
        };
        let result = block_on_bounded(daemon, Duration::from_millis(200)).unwrap();

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(ledger.count().is_err());
    }
}
