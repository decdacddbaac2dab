//! The poll loop.
//!
//! Each cycle: check for change, snapshot, wait for the change time to
//! propagate, enumerate, dispatch, tear the snapshot down, advance the
//! clock. Cycles are strictly sequential; the next poll does not begin until
//! the previous cycle's dispatch and clock update complete.

use anyhow::Context;

use common::config::Config;
use common::crawl::{Crawl, IgnoreRules};
use common::destination::DestinationList;
use common::rctime::{LastRctime, Timestamp};
use common::shutdown;
use common::snapshot::Snapshot;
use common::status::{StatusCode, StatusFile};
use common::syncer::Syncer;

/// How often the in-memory clock is flushed to disk during long runs, to
/// bound how much progress a crash can lose.
const CLOCK_FLUSH_PERIOD: std::time::Duration = std::time::Duration::from_secs(3600);

/// Granularity at which sleeps observe the shutdown flag.
const SLEEP_SLICE: std::time::Duration = std::time::Duration::from_millis(250);

/// One-cycle and no-dispatch variations of the poll loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    /// Prime the clock so everything syncs, run one cycle, exit.
    pub seed: bool,
    /// Log the would-be transfer command instead of running it; the clock is
    /// not advanced.
    pub dry_run: bool,
    /// Run a single poll cycle, then exit.
    pub oneshot: bool,
    /// Record the newest change time without syncing anything.
    pub set_rctime: bool,
}

impl RunFlags {
    fn single_cycle(&self) -> bool {
        self.oneshot || self.seed || self.dry_run || self.set_rctime
    }
}

#[derive(Debug)]
pub struct Daemon {
    config: Config,
    clock: LastRctime,
    status: StatusFile,
    snapshot: Option<Snapshot>,
}

impl Daemon {
    pub fn new(config: Config) -> anyhow::Result<Daemon> {
        anyhow::ensure!(
            config.source_directory.is_dir(),
            "source directory {:?} does not exist",
            config.source_directory
        );
        let clock = LastRctime::load(&config.last_rctime_path())?;
        let status = StatusFile::new(&config.status_file);
        Ok(Daemon {
            config,
            clock,
            status,
            snapshot: None,
        })
    }

    /// Run the poll loop until a termination signal, a fatal error, or - for
    /// single-cycle modes - the end of the first cycle.
    ///
    /// Every exit path, fatal errors included, passes through the cleanup
    /// routine: flush the clock, remove any active snapshot, publish
    /// not-running.
    pub fn run(&mut self, flags: RunFlags) -> anyhow::Result<()> {
        shutdown::install()?;
        let result = self.poll_loop(flags);
        self.cleanup();
        result
    }

    fn poll_loop(&mut self, flags: RunFlags) -> anyhow::Result<()> {
        let source = self.config.source_directory.clone();
        let rules = IgnoreRules {
            hidden: self.config.ignore_hidden,
            win_lock: self.config.ignore_win_lock,
            vim_swap: self.config.ignore_vim_swap,
        };
        let sync_period = std::time::Duration::from_secs(self.config.sync_period_s);
        let prop_delay = std::time::Duration::from_millis(self.config.propagation_delay_ms);
        let mut syncer = Syncer::new(&self.config, self.status.clone());
        let mut last_flush = std::time::Instant::now();

        tracing::info!("watching: {:?}", &source);
        self.config.dump();

        // seeded dry runs must not disturb the real mark
        let cached_mark = (flags.seed && flags.dry_run).then(|| self.clock.mark());
        if flags.seed {
            self.clock.update(Timestamp::SEED);
        }

        loop {
            let cycle_start = std::time::Instant::now();
            if shutdown::requested() {
                tracing::info!("termination requested");
                break;
            }
            tracing::debug!("checking for change");
            if let Some(new_mark) = self.clock.check_for_change(&source)? {
                tracing::info!("change detected in {:?}", &source);
                if flags.set_rctime {
                    self.clock.update(new_mark);
                    self.clock.flush()?;
                    tracing::info!("last change time set to {}", new_mark);
                } else {
                    self.run_cycle(&flags, new_mark, &rules, prop_delay, &mut syncer)?;
                    if !flags.dry_run {
                        self.clock.update(new_mark);
                        if last_flush.elapsed() >= CLOCK_FLUSH_PERIOD {
                            self.clock.flush()?;
                            last_flush = std::time::Instant::now();
                        }
                    }
                }
            }
            if flags.single_cycle() {
                break;
            }
            // if the cycle took longer than the sync period, don't wait
            let elapsed = cycle_start.elapsed();
            if elapsed < sync_period {
                sleep_watching(sync_period - elapsed);
            }
        }
        if let Some(mark) = cached_mark {
            self.clock.update(mark);
        }
        Ok(())
    }

    /// Snapshot, enumerate and dispatch one detected change.
    fn run_cycle(
        &mut self,
        flags: &RunFlags,
        new_mark: Timestamp,
        rules: &IgnoreRules,
        prop_delay: std::time::Duration,
        syncer: &mut Syncer,
    ) -> anyhow::Result<()> {
        self.snapshot = Some(Snapshot::create(&self.config.source_directory, new_mark)?);
        // wait for the recursive change time to trickle up to the root
        std::thread::sleep(prop_delay);
        let snap_path = self
            .snapshot
            .as_ref()
            .map(|snapshot| snapshot.path().to_path_buf())
            .context("snapshot vanished mid-cycle")?;
        let crawl = Crawl::new(&self.clock, *rules, self.config.threads)?;
        let (mut files, total_bytes) = crawl.enumerate(&snap_path)?;
        tracing::info!(
            "new files to sync: {} ({})",
            files.len(),
            bytesize::ByteSize::b(total_bytes)
        );
        if !files.is_empty() {
            if flags.dry_run {
                let destinations = DestinationList::from_config(&self.config);
                tracing::info!(
                    "{} {} <file list> {}",
                    self.config.exec,
                    self.config.flags,
                    destinations.current().unwrap_or("<local>")
                );
            } else {
                syncer.sync(&mut files)?;
            }
        }
        if let Some(snapshot) = self.snapshot.take() {
            snapshot.delete()?;
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            if let Err(error) = snapshot.delete() {
                tracing::warn!("cleanup: {:#}", error);
            }
        }
        if let Err(error) = self.clock.flush() {
            tracing::warn!("cleanup: {:#}", error);
        }
        self.status.publish(StatusCode::NotRunning);
    }
}

/// Sleep in slices so a termination signal is observed promptly.
fn sleep_watching(duration: std::time::Duration) {
    let deadline = std::time::Instant::now() + duration;
    while !shutdown::requested() {
        let now = std::time::Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(tmp: &std::path::Path) -> Config {
        Config {
            source_directory: tmp.join("tree"),
            exec: "true".to_string(),
            flags: String::new(),
            metadata_directory: tmp.join("meta"),
            status_file: tmp.join("run").join("status"),
            diagnostic_log_directory: tmp.join("log"),
            propagation_delay_ms: 0,
            ..Config::default()
        }
    }

    #[test]
    fn missing_source_directory_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let error = Daemon::new(config).unwrap_err();
        assert!(error.to_string().contains("does not exist"));
    }

    #[test]
    fn oneshot_cycle_advances_the_clock_and_removes_the_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::create_dir(&config.source_directory).unwrap();
        std::fs::write(config.source_directory.join("a.txt"), "0123456789").unwrap();

        let mut daemon = Daemon::new(config.clone()).unwrap();
        daemon
            .run(RunFlags {
                oneshot: true,
                ..Default::default()
            })
            .unwrap();

        // the clock advanced past zero and was flushed on exit
        let persisted = std::fs::read_to_string(config.last_rctime_path()).unwrap();
        let mark: Timestamp = persisted.parse().unwrap();
        assert!(mark > Timestamp::ZERO);
        // the snapshot directory was torn down
        let snap_dir = config.source_directory.join(".snap");
        assert_eq!(std::fs::read_dir(&snap_dir).unwrap().count(), 0);
        // not-running was published
        assert_eq!(
            std::fs::read_to_string(&config.status_file).unwrap(),
            "1\n"
        );
    }

    #[test]
    fn second_cycle_sees_no_change() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::create_dir(&config.source_directory).unwrap();
        std::fs::write(config.source_directory.join("a.txt"), "0123456789").unwrap();

        let flags = RunFlags {
            oneshot: true,
            ..Default::default()
        };
        let mut daemon = Daemon::new(config.clone()).unwrap();
        daemon.run(flags).unwrap();
        let first = std::fs::read_to_string(config.last_rctime_path()).unwrap();

        // no intervening mutation: the mark must not move
        let mut daemon = Daemon::new(config.clone()).unwrap();
        daemon.run(flags).unwrap();
        let second = std::fs::read_to_string(config.last_rctime_path()).unwrap();
        assert_eq!(first, second);
        // and no snapshot was created this time
        let snap_dir = config.source_directory.join(".snap");
        assert_eq!(std::fs::read_dir(&snap_dir).unwrap().count(), 0);
    }

    #[test]
    fn dry_run_does_not_advance_the_clock() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::create_dir(&config.source_directory).unwrap();
        std::fs::write(config.source_directory.join("a.txt"), "0123456789").unwrap();

        let mut daemon = Daemon::new(config.clone()).unwrap();
        daemon
            .run(RunFlags {
                dry_run: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(config.last_rctime_path()).unwrap(),
            "0.0\n"
        );
    }

    #[test]
    fn set_rctime_updates_the_clock_without_snapshotting() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::create_dir(&config.source_directory).unwrap();
        std::fs::write(config.source_directory.join("a.txt"), "0123456789").unwrap();

        let mut daemon = Daemon::new(config.clone()).unwrap();
        daemon
            .run(RunFlags {
                set_rctime: true,
                ..Default::default()
            })
            .unwrap();
        let mark: Timestamp = std::fs::read_to_string(config.last_rctime_path())
            .unwrap()
            .parse()
            .unwrap();
        assert!(mark > Timestamp::ZERO);
        assert!(!config.source_directory.join(".snap").exists());
    }
}
