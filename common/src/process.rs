//! One transfer worker process.
//!
//! A `SyncProcess` owns a static slice of the sorted file list - the indices
//! `id, id + nproc, id + 2*nproc, ...` - and repeatedly fills an argument
//! vector from those positions up to the argument budget, launches the
//! transfer program, and reports how the child exited. The object persists
//! across batches; only its payload resets between launches.

use std::io::{Read, Seek, Write};
use std::os::unix::process::CommandExt;

use anyhow::Context;

use crate::file::FileEntry;

/// Exit code rsync/scp report when the ssh connection itself failed.
pub const SSH_FAIL: i32 = 255;
/// Shell convention: command not found.
pub const NOT_INSTALLED: i32 = 127;
/// Shell convention: found but not executable.
pub const PERM_DENY: i32 = 126;

/// Protocol stream errors, partial transfers and timeouts: worth retrying
/// the same batch against the same destination.
const TRANSIENT_CODES: [i32; 5] = [12, 23, 24, 30, 35];

/// Bytes one argv entry costs beyond the string itself: the terminating NUL
/// plus the pointer slot.
pub const ARG_ENTRY_OVERHEAD: usize = 1 + std::mem::size_of::<*const libc::c_char>();

/// How a finished transfer child is handled.
#[derive(Debug)]
pub enum ExitClass {
    Success,
    /// Connection failure: park the worker until the destination rotates.
    RetryableSsh,
    /// Transient transfer failure: relaunch the same batch unchanged.
    RetryableTransient(i32),
    Fatal(FatalReason),
}

#[derive(Debug, thiserror::Error)]
pub enum FatalReason {
    #[error("{0} is not installed")]
    NotInstalled(String),
    #[error("encountered permission error while executing {0}")]
    PermissionDenied(String),
    #[error("encountered error while executing {bin} (exit code {code}){detail}")]
    UnknownExit {
        bin: String,
        code: i32,
        detail: String,
    },
    #[error("{bin} terminated by signal {signal}")]
    Signaled { bin: String, signal: i32 },
}

/// Map a child exit code onto the retry/fail taxonomy.
#[must_use]
pub fn classify_exit(bin: &str, code: i32) -> ExitClass {
    match code {
        0 => ExitClass::Success,
        SSH_FAIL => ExitClass::RetryableSsh,
        code if TRANSIENT_CODES.contains(&code) => ExitClass::RetryableTransient(code),
        NOT_INSTALLED => ExitClass::Fatal(FatalReason::NotInstalled(bin.to_string())),
        PERM_DENY => ExitClass::Fatal(FatalReason::PermissionDenied(bin.to_string())),
        code => {
            let detail = if bin.contains("rsync") {
                rsync_exit_detail(code)
                    .map(|text| format!("\nrsync exit status: {text}"))
                    .unwrap_or_default()
            } else {
                String::new()
            };
            ExitClass::Fatal(FatalReason::UnknownExit {
                bin: bin.to_string(),
                code,
                detail,
            })
        }
    }
}

/// Human text for rsync's documented exit codes.
#[must_use]
pub fn rsync_exit_detail(code: i32) -> Option<&'static str> {
    match code {
        1 => Some("syntax or usage error"),
        2 => Some("protocol incompatibility"),
        3 => Some("errors selecting input/output files, dirs"),
        4 => Some("requested action not supported"),
        5 => Some("error starting client-server protocol"),
        6 => Some("daemon unable to append to log-file"),
        10 => Some("error in socket I/O"),
        11 => Some("error in file I/O"),
        12 => Some("error in rsync protocol data stream"),
        13 => Some("errors with program diagnostics"),
        14 => Some("error in IPC code"),
        20 => Some("received SIGUSR1 or SIGINT"),
        21 => Some("some error returned by waitpid()"),
        22 => Some("error allocating core memory buffers"),
        23 => Some("partial transfer due to error"),
        24 => Some("partial transfer due to vanished source files"),
        25 => Some("the --max-delete limit stopped deletions"),
        30 => Some("timeout in data send/receive"),
        35 => Some("timeout waiting for daemon connection"),
        _ => None,
    }
}

pub struct SyncProcess {
    id: usize,
    stride: usize,
    cursor: usize,
    max_arg_bytes: usize,
    start_arg_bytes: usize,
    arg_bytes: usize,
    payload_bytes: u64,
    payload: Vec<std::path::PathBuf>,
    payload_indices: Vec<usize>,
    sending_to: Option<String>,
    child: Option<std::process::Child>,
    capture: Option<(std::fs::File, std::fs::File)>,
}

impl SyncProcess {
    #[must_use]
    pub fn new(id: usize, nproc: usize, start_arg_bytes: usize, max_arg_bytes: usize) -> SyncProcess {
        SyncProcess {
            id,
            stride: nproc,
            cursor: id,
            max_arg_bytes,
            start_arg_bytes,
            arg_bytes: start_arg_bytes,
            payload_bytes: 0,
            payload: Vec::new(),
            payload_indices: Vec::new(),
            sending_to: None,
            child: None,
            capture: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn payload_count(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    #[must_use]
    pub fn payload_is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Destination of the last launch, for reporting failures after the
    /// cursor has moved on.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.sending_to.as_deref()
    }

    fn would_overflow(&self, entry: &FileEntry) -> bool {
        self.arg_bytes + entry.arg_len() + ARG_ENTRY_OVERHEAD >= self.max_arg_bytes
    }

    /// Fill the argument vector from this worker's stride positions until
    /// the next file would exceed the budget.
    ///
    /// The budget check only prevents adding *another* file: a single entry
    /// whose path alone overflows the budget still becomes its own batch, so
    /// oversized files are attempted rather than silently dropped.
    pub fn consume(&mut self, files: &mut [FileEntry]) {
        while self.cursor < files.len() {
            let entry = &files[self.cursor];
            if entry.is_consumed() {
                self.cursor += self.stride;
                continue;
            }
            if !self.payload.is_empty() && self.would_overflow(entry) {
                break;
            }
            let entry = &mut files[self.cursor];
            self.arg_bytes += entry.arg_len() + ARG_ENTRY_OVERHEAD;
            self.payload_bytes += entry.payload_bytes();
            self.payload_indices.push(self.cursor);
            self.payload.push(entry.take_path());
            self.cursor += self.stride;
        }
    }

    /// True when this worker has no batch pending and no stride positions
    /// left to pull from.
    #[must_use]
    pub fn done(&self, files_len: usize) -> bool {
        self.payload.is_empty() && self.cursor >= files_len
    }

    /// Spawn the transfer program with the current batch.
    ///
    /// Standard out/err go to capture files read back only on failure. The
    /// child resets SIGINT to its default disposition so it stays
    /// independently killable.
    pub fn launch(
        &mut self,
        bin: &str,
        flags: &[String],
        destination: Option<&str>,
    ) -> std::io::Result<u32> {
        let stdout_capture = tempfile::tempfile()?;
        let stderr_capture = tempfile::tempfile()?;
        let mut command = std::process::Command::new(bin);
        command
            .args(flags)
            .args(&self.payload)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::from(stdout_capture.try_clone()?))
            .stderr(std::process::Stdio::from(stderr_capture.try_clone()?));
        if let Some(destination) = destination {
            command.arg(destination);
        }
        unsafe {
            command.pre_exec(|| {
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                Ok(())
            });
        }
        let child = command.spawn()?;
        let pid = child.id();
        tracing::debug!("proc {}: {} started", self.id, pid);
        self.sending_to = destination.map(str::to_string);
        self.child = Some(child);
        self.capture = Some((stdout_capture, stderr_capture));
        Ok(pid)
    }

    /// Clear the batch after a successful transfer so the next chunk can be
    /// consumed. Byte counters fall back to their baseline.
    pub fn reset(&mut self) {
        self.payload.clear();
        self.payload_indices.clear();
        self.arg_bytes = self.start_arg_bytes;
        self.payload_bytes = 0;
        self.child = None;
        self.capture = None;
    }

    /// Hand every consumed path back to the file list, undoing this pass's
    /// `consume` calls so a dispatch restart sees the full list again.
    pub fn restore(&mut self, files: &mut [FileEntry]) {
        for (index, path) in self.payload_indices.drain(..).zip(self.payload.drain(..)) {
            files[index].put_path(path);
        }
        self.arg_bytes = self.start_arg_bytes;
        self.payload_bytes = 0;
    }

    /// Kill and reap the child, if one is still running.
    pub fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.capture = None;
    }

    /// The child was reaped externally (wait-any); drop our handle without
    /// waiting on it again.
    pub fn reaped(&mut self) {
        self.child = None;
    }

    /// Read back whatever the child wrote, for failure diagnostics.
    pub fn captured_output(&mut self) -> (String, String) {
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some((mut out_file, mut err_file)) = self.capture.take() {
            let mut read = |file: &mut std::fs::File, buf: &mut String| {
                let mut bytes = Vec::new();
                if file.rewind().is_ok() && file.read_to_end(&mut bytes).is_ok() {
                    *buf = String::from_utf8_lossy(&bytes).into_owned();
                }
            };
            read(&mut out_file, &mut stdout);
            read(&mut err_file, &mut stderr);
        }
        (stdout, stderr)
    }

    /// Dump the failed invocation - decoded error, full argv, captured
    /// output - to a uniquely named file under `dir`. Returns the path.
    pub fn dump_diagnostics(
        &mut self,
        dir: &std::path::Path,
        bin: &str,
        flags: &[String],
        detail: &str,
    ) -> anyhow::Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir).with_context(|| format!("failed creating {dir:?}"))?;
        let stamp = chrono::Local::now().format("%F_%T_%z");
        let mut path = dir.join(format!("exec_fail_{stamp}.log"));
        let mut suffix = 0;
        while path.exists() {
            suffix += 1;
            path = dir.join(format!("exec_fail_{stamp}.log.{suffix}"));
        }
        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("failed creating diagnostic log {path:?}"))?;
        writeln!(file, "{detail}")?;
        writeln!(file, "argv:")?;
        writeln!(file, "{bin}")?;
        for flag in flags {
            writeln!(file, "{flag}")?;
        }
        for arg in &self.payload {
            writeln!(file, "{}", arg.display())?;
        }
        if let Some(destination) = &self.sending_to {
            writeln!(file, "{destination}")?;
        }
        let (stdout, stderr) = self.captured_output();
        if !stdout.is_empty() {
            writeln!(file, "captured stdout:\n{stdout}")?;
        }
        if !stderr.is_empty() {
            writeln!(file, "captured stderr:\n{stderr}")?;
        }
        Ok(path)
    }
}
