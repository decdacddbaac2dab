//! Internal library for the `rgeorep` replication daemon.
//!
//! `rgeorepd` watches a CephFS directory tree, detects changes through the
//! filesystem's recursive change time (`ceph.dir.rctime`), and replicates
//! changed files to one or more remote destinations by fanning batches of
//! paths out to an external transfer program (rsync/scp) across a pool of
//! worker processes.
//!
//! The modules here are the engine behind the `rgeorepd` binary:
//!
//! - [`rctime`] - the persisted high-water-mark clock and change detection
//! - [`snapshot`] - point-in-time `.snap` views of the source tree
//! - [`crawl`] - snapshot enumeration (single-threaded DFS or threaded BFS)
//! - [`queue`] - the work queue backing the threaded crawl
//! - [`file`] - immutable descriptors of enumerated entries
//! - [`destination`] - the rotating remote destination list
//! - [`syncer`] / [`process`] - argument budgeting, stride partitioning and
//!   child process supervision
//! - [`status`] - status code publication for the Prometheus exporter
//! - [`shutdown`] - flag-based termination handling
//!
//! This crate is not intended for direct use outside the rgeorep tools.

pub mod config;
pub mod crawl;
pub mod destination;
pub mod file;
pub mod process;
pub mod queue;
pub mod rctime;
pub mod shutdown;
pub mod snapshot;
pub mod status;
pub mod syncer;
pub mod testutils;

/// Map the daemon's numeric log level onto a tracing directive.
///
/// 0 logs errors only, 1 is normal operation, 2 enables debug logging and
/// anything higher enables trace logging.
#[must_use]
pub fn log_directive(log_level: u8) -> &'static str {
    match log_level {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialize tracing and run `func`, logging any error it returns.
///
/// Returns `None` on failure so binaries can exit with a non-zero code
/// without double-reporting the error.
pub fn run<F>(log_level: u8, func: F) -> Option<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_directive(log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    match func() {
        Ok(()) => Some(()),
        Err(error) => {
            tracing::error!("{:#}", &error);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_map_to_directives() {
        assert_eq!(log_directive(0), "error");
        assert_eq!(log_directive(1), "info");
        assert_eq!(log_directive(2), "debug");
        assert_eq!(log_directive(3), "trace");
        assert_eq!(log_directive(200), "trace");
    }
}
