//! Dispatch of enumerated files across a pool of transfer processes.
//!
//! The syncer computes a per-process argument budget from the OS limit,
//! partitions the sorted file list across workers by interleaved striding,
//! launches the transfer program once per batch, and supervises the children:
//! reaping in any-completion order, retrying transient failures, rotating the
//! destination on collective connection failures, and self-tuning the budget
//! when the kernel rejects an argument list as too big.

use std::collections::HashMap;

use anyhow::anyhow;

use crate::config::{Config, tokenize};
use crate::destination::DestinationList;
use crate::file::FileEntry;
use crate::process::{
    ARG_ENTRY_OVERHEAD, ExitClass, FatalReason, SyncProcess, classify_exit,
};
use crate::status::{StatusCode, StatusFile};

/// POSIX minimum for the argv+environment limit, used when `_SC_ARG_MAX`
/// cannot be determined and as the floor the budget may never shrink below.
const POSIX_ARG_MAX: usize = 4096;

/// Bytes left unused below the OS limit, per POSIX guidance.
const ARG_HEADROOM: usize = 2048;

/// Size of the inherited environment as the kernel accounts it: every
/// `key=value` string with its NUL plus a pointer slot, and the terminating
/// null pointer.
#[must_use]
pub fn env_size() -> usize {
    let mut size = std::mem::size_of::<*const libc::c_char>();
    for (key, value) in std::env::vars_os() {
        size += key.len() + value.len() + 1 + ARG_ENTRY_OVERHEAD;
    }
    size
}

/// The hard per-process argument budget: the OS argument-list ceiling minus
/// the inherited environment minus fixed headroom.
#[must_use]
pub fn arg_budget() -> usize {
    let arg_max = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
    let arg_max = if arg_max < 0 {
        tracing::warn!(
            "could not determine ARG_MAX from sysconf: {}; assuming the POSIX minimum",
            std::io::Error::last_os_error()
        );
        POSIX_ARG_MAX
    } else {
        arg_max as usize
    };
    arg_max
        .saturating_sub(env_size() + ARG_HEADROOM)
        .max(POSIX_ARG_MAX)
}

/// Counts connection failures since the last success. The destination
/// cursor may only advance once *every* outstanding worker has failed, so a
/// single flaky worker cannot abandon a healthy destination.
#[derive(Debug, Default)]
struct FailoverTracker {
    fails: usize,
}

impl FailoverTracker {
    /// Record one worker's connection failure; true means all `active`
    /// workers have now failed and the destination should rotate.
    fn record_failure(&mut self, active: usize) -> bool {
        self.fails += 1;
        if self.fails >= active {
            self.fails = 0;
            true
        } else {
            false
        }
    }

    fn record_success(&mut self) {
        self.fails = 0;
    }
}

enum DispatchError {
    /// The kernel rejected an exec with E2BIG; shrink the budget and restart.
    ArgListTooBig,
    Fatal(anyhow::Error),
}

enum ChildExit {
    Code(i32),
    Signal(i32),
}

/// Block until any child changes state.
fn wait_any() -> anyhow::Result<(i32, ChildExit)> {
    loop {
        match nix::sys::wait::wait() {
            Ok(nix::sys::wait::WaitStatus::Exited(pid, code)) => {
                return Ok((pid.as_raw(), ChildExit::Code(code)));
            }
            Ok(nix::sys::wait::WaitStatus::Signaled(pid, signal, _)) => {
                return Ok((pid.as_raw(), ChildExit::Signal(signal as i32)));
            }
            Ok(_) => {}
            Err(errno) => return Err(anyhow!("no children to wait for: {errno}")),
        }
    }
}

pub struct Syncer {
    exec_bin: String,
    exec_flags: Vec<String>,
    nproc: usize,
    destinations: DestinationList,
    failover_cooldown: std::time::Duration,
    max_arg_bytes: usize,
    start_arg_bytes: usize,
    diag_dir: std::path::PathBuf,
    status: StatusFile,
}

impl Syncer {
    #[must_use]
    pub fn new(config: &Config, status: StatusFile) -> Syncer {
        let exec_flags = tokenize(&config.flags);
        let destinations = DestinationList::from_config(config);
        let max_arg_bytes = arg_budget();
        let mut start_arg_bytes = config.exec.len() + ARG_ENTRY_OVERHEAD;
        for flag in &exec_flags {
            start_arg_bytes += flag.len() + ARG_ENTRY_OVERHEAD;
        }
        // account for the longest destination so rotating never overflows
        start_arg_bytes += config
            .destinations
            .iter()
            .map(String::len)
            .max()
            .unwrap_or_else(|| {
                crate::destination::compose(
                    &config.remote_user,
                    &config.remote_host,
                    &config.remote_directory,
                )
                .len()
            })
            + ARG_ENTRY_OVERHEAD;
        // trailing null pointer of argv
        start_arg_bytes += std::mem::size_of::<*const libc::c_char>();
        Syncer {
            exec_bin: config.exec.clone(),
            exec_flags,
            nproc: config.processes,
            destinations,
            failover_cooldown: std::time::Duration::from_secs(config.failover_cooldown_s),
            max_arg_bytes,
            start_arg_bytes,
            diag_dir: config.diagnostic_log_directory.clone(),
            status,
        }
    }

    /// Replicate `files` to the current destination, retrying and failing
    /// over per the exit taxonomy. On success every entry has been consumed
    /// into some completed batch.
    pub fn sync(&mut self, files: &mut Vec<FileEntry>) -> anyhow::Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        // smallest first, so stride consumption interleaves small and large
        // files instead of handing one worker all the big ones
        files.sort_by_key(FileEntry::size);
        loop {
            match self.dispatch_pass(files) {
                Ok(()) => {
                    self.status.publish(StatusCode::Ok);
                    return Ok(());
                }
                Err(DispatchError::ArgListTooBig) => {
                    let shrunk = (self.max_arg_bytes / 2).max(POSIX_ARG_MAX);
                    if shrunk == self.max_arg_bytes {
                        return Err(anyhow!(
                            "argument list still too big at the {POSIX_ARG_MAX} byte floor"
                        ));
                    }
                    tracing::warn!(
                        "argument list too big with a {} byte budget, restarting dispatch with {}",
                        self.max_arg_bytes,
                        shrunk
                    );
                    self.max_arg_bytes = shrunk;
                }
                Err(DispatchError::Fatal(error)) => return Err(error),
            }
        }
    }

    fn dispatch_pass(&mut self, files: &mut Vec<FileEntry>) -> Result<(), DispatchError> {
        let nproc = self.nproc.clamp(1, files.len());
        let mut procs: Vec<SyncProcess> = (0..nproc)
            .map(|id| SyncProcess::new(id, nproc, self.start_arg_bytes, self.max_arg_bytes))
            .collect();
        let mut running: HashMap<i32, usize> = HashMap::new();
        let mut parked: Vec<usize> = Vec::new();
        let mut active = nproc;
        let mut failover = FailoverTracker::default();

        for index in 0..nproc {
            procs[index].consume(files);
            if procs[index].payload_is_empty() {
                // nothing left on this stride (possible after a restart)
                active -= 1;
                continue;
            }
            self.log_launch(&procs[index], nproc);
            self.spawn(index, &mut procs, &mut running, files)?;
        }

        while active > 0 {
            let (pid, exit) = wait_any().map_err(DispatchError::Fatal)?;
            let Some(index) = running.remove(&pid) else {
                continue;
            };
            procs[index].reaped();
            let class = match exit {
                ChildExit::Code(code) => classify_exit(&self.exec_bin, code),
                ChildExit::Signal(signal) => ExitClass::Fatal(FatalReason::Signaled {
                    bin: self.exec_bin.clone(),
                    signal,
                }),
            };
            match class {
                ExitClass::Success => {
                    tracing::debug!("{} exited successfully", pid);
                    failover.record_success();
                    // clear the completed batch before anything can restart
                    // the pass, so its files are never re-consumed
                    procs[index].reset();
                    // a success proves the destination is reachable, so any
                    // workers parked on a flaky connection go again
                    for parked_index in std::mem::take(&mut parked) {
                        self.log_launch(&procs[parked_index], nproc);
                        self.spawn(parked_index, &mut procs, &mut running, files)?;
                    }
                    procs[index].consume(files);
                    if procs[index].payload_is_empty() {
                        self.log_proc(&procs[index], nproc, "done.");
                        active -= 1;
                    } else {
                        self.log_launch(&procs[index], nproc);
                        self.spawn(index, &mut procs, &mut running, files)?;
                    }
                }
                ExitClass::RetryableSsh => {
                    self.log_proc(
                        &procs[index],
                        nproc,
                        &format!(
                            "{} failed to connect to {}. Is the server running and connected to your network?",
                            self.exec_bin,
                            procs[index].destination().unwrap_or("<local>"),
                        ),
                    );
                    parked.push(index);
                    if failover.record_failure(active) {
                        self.rotate_destination();
                        for parked_index in std::mem::take(&mut parked) {
                            self.log_launch(&procs[parked_index], nproc);
                            self.spawn(parked_index, &mut procs, &mut running, files)?;
                        }
                    }
                }
                ExitClass::RetryableTransient(code) => {
                    tracing::warn!(
                        "{} reported a transient failure (exit code {}{}), retrying batch",
                        self.exec_bin,
                        code,
                        crate::process::rsync_exit_detail(code)
                            .map(|text| format!(": {text}"))
                            .unwrap_or_default()
                    );
                    self.spawn(index, &mut procs, &mut running, files)?;
                }
                ExitClass::Fatal(reason) => {
                    let message = reason.to_string();
                    match procs[index].dump_diagnostics(
                        &self.diag_dir,
                        &self.exec_bin,
                        &self.exec_flags,
                        &message,
                    ) {
                        Ok(path) => tracing::error!("diagnostics dumped to {:?}", path),
                        Err(error) => {
                            tracing::warn!("could not dump diagnostics: {:#}", error);
                        }
                    }
                    Self::kill_running(&mut procs, &mut running);
                    return Err(DispatchError::Fatal(anyhow!(reason)));
                }
            }
        }
        Ok(())
    }

    /// Launch one worker's batch, translating spawn failures: E2BIG restarts
    /// the whole dispatch with a smaller budget, anything else is fatal.
    fn spawn(
        &self,
        index: usize,
        procs: &mut [SyncProcess],
        running: &mut HashMap<i32, usize>,
        files: &mut [FileEntry],
    ) -> Result<(), DispatchError> {
        let destination = self.destinations.current().map(str::to_string);
        match procs[index].launch(&self.exec_bin, &self.exec_flags, destination.as_deref()) {
            Ok(pid) => {
                running.insert(pid as i32, index);
                Ok(())
            }
            Err(error) if error.raw_os_error() == Some(libc::E2BIG) => {
                Self::kill_running(procs, running);
                for proc in procs.iter_mut() {
                    proc.restore(files);
                }
                Err(DispatchError::ArgListTooBig)
            }
            Err(error) => {
                let message = format!("failed to execute {}: {}", self.exec_bin, error);
                match procs[index].dump_diagnostics(
                    &self.diag_dir,
                    &self.exec_bin,
                    &self.exec_flags,
                    &message,
                ) {
                    Ok(path) => tracing::error!("diagnostics dumped to {:?}", path),
                    Err(error) => tracing::warn!("could not dump diagnostics: {:#}", error),
                }
                Self::kill_running(procs, running);
                Err(DispatchError::Fatal(anyhow!(message)))
            }
        }
    }

    /// Advance the destination cursor, publishing status and cooling down
    /// when the whole list has been exhausted.
    fn rotate_destination(&mut self) {
        let wrapped = self.destinations.advance();
        if wrapped {
            self.status.publish(StatusCode::AllHostsDown);
            tracing::warn!(
                "every destination failed; cooling down for {:?} before retrying {}",
                self.failover_cooldown,
                self.destinations.current().unwrap_or("<local>"),
            );
            std::thread::sleep(self.failover_cooldown);
        } else {
            self.status.publish(StatusCode::HostDown);
            tracing::info!(
                "trying next destination: {}",
                self.destinations.current().unwrap_or("<local>")
            );
        }
    }

    fn kill_running(procs: &mut [SyncProcess], running: &mut HashMap<i32, usize>) {
        for (_, index) in running.drain() {
            procs[index].kill();
        }
    }

    fn log_launch(&self, proc: &SyncProcess, nproc: usize) {
        self.log_proc(
            proc,
            nproc,
            &format!(
                "Launching {} {} with {} files ({}).",
                self.exec_bin,
                self.exec_flags.join(" "),
                proc.payload_count(),
                bytesize::ByteSize::b(proc.payload_bytes()),
            ),
        );
    }

    fn log_proc(&self, proc: &SyncProcess, nproc: usize, message: &str) {
        if nproc > 1 {
            tracing::info!("proc {}: {}", proc.id(), message);
        } else {
            tracing::info!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;

    fn test_config(tmp: &std::path::Path, flags: &str, processes: usize) -> Config {
        Config {
            source_directory: tmp.to_path_buf(),
            exec: "sh".to_string(),
            flags: flags.to_string(),
            processes,
            metadata_directory: tmp.join("meta"),
            status_file: tmp.join("run").join("status"),
            diagnostic_log_directory: tmp.join("log"),
            ..Config::default()
        }
    }

    fn test_files(tmp: &std::path::Path, count: usize) -> Vec<FileEntry> {
        let tree = tmp.join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        let mut files = Vec::new();
        for i in 0..count {
            let path = tree.join(format!("file{i}"));
            std::fs::write(&path, "x".repeat(i + 1)).unwrap();
            let metadata = std::fs::symlink_metadata(&path).unwrap();
            files.push(FileEntry::new(&path, &tree, &metadata));
        }
        files
    }

    #[test]
    fn failover_rotates_exactly_once_per_collective_failure() {
        let mut tracker = FailoverTracker::default();
        // 4 workers, 4 consecutive failures: exactly one rotation
        for _ in 0..3 {
            assert!(!tracker.record_failure(4));
        }
        assert!(tracker.record_failure(4));
        // counter restarts after the rotation
        assert!(!tracker.record_failure(4));
        // a success resets the count
        tracker.record_success();
        assert!(!tracker.record_failure(2));
        assert!(tracker.record_failure(2));
    }

    #[test]
    fn env_and_budget_are_sane() {
        assert!(env_size() > 0);
        let budget = arg_budget();
        assert!(budget >= POSIX_ARG_MAX);
        // the budget leaves room below the real OS limit
        let arg_max = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
        if arg_max > 0 {
            assert!(budget < arg_max as usize);
        }
    }

    #[test]
    fn dispatch_consumes_every_file() {
        let _guard = testutils::child_test_guard();
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "-c 'exit 0'", 3);
        let status = StatusFile::new(&config.status_file);
        let mut syncer = Syncer::new(&config, status);
        let mut files = test_files(tmp.path(), 7);
        syncer.sync(&mut files).unwrap();
        assert!(files.iter().all(FileEntry::is_consumed));
        assert_eq!(
            std::fs::read_to_string(&config.status_file).unwrap(),
            "0\n"
        );
    }

    #[test]
    fn small_budget_splits_into_multiple_batches() {
        let _guard = testutils::child_test_guard();
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "-c 'exit 0'", 1);
        let status = StatusFile::new(&config.status_file);
        let mut syncer = Syncer::new(&config, status);
        let mut files = test_files(tmp.path(), 6);
        // room for roughly two paths per batch, forcing several relaunches
        syncer.max_arg_bytes = syncer.start_arg_bytes
            + 2 * (files[0].arg_len() + ARG_ENTRY_OVERHEAD)
            + 1;
        syncer.sync(&mut files).unwrap();
        assert!(files.iter().all(FileEntry::is_consumed));
    }

    #[test]
    fn fatal_exit_dumps_diagnostics_and_errors() {
        let _guard = testutils::child_test_guard();
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "-c 'echo doomed >&2; exit 1'", 1);
        let status = StatusFile::new(&config.status_file);
        let mut syncer = Syncer::new(&config, status);
        let mut files = test_files(tmp.path(), 2);
        let error = syncer.sync(&mut files).unwrap_err();
        assert!(error.to_string().contains("exit code 1"));
        let dumps: Vec<_> = std::fs::read_dir(tmp.path().join("log"))
            .unwrap()
            .collect();
        assert_eq!(dumps.len(), 1);
    }

    #[test]
    fn missing_binary_is_fatal_with_diagnostics() {
        let _guard = testutils::child_test_guard();
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path(), "", 1);
        config.exec = "definitely-not-a-real-transfer-program".to_string();
        let status = StatusFile::new(&config.status_file);
        let mut syncer = Syncer::new(&config, status);
        let mut files = test_files(tmp.path(), 1);
        let error = syncer.sync(&mut files).unwrap_err();
        assert!(error.to_string().contains("failed to execute"));
    }

    #[test]
    fn empty_file_list_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "-c 'exit 0'", 2);
        let status = StatusFile::new(&config.status_file);
        let mut syncer = Syncer::new(&config, status);
        let mut files = Vec::new();
        syncer.sync(&mut files).unwrap();
    }
}
