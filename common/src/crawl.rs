//! Snapshot enumeration.
//!
//! Walks a snapshot of the source tree and collects every entry that changed
//! since the high-water mark. Unchanged directories prune their whole subtree
//! because a directory's recursive change time gates recursion into it.
//!
//! Two strategies, selected by the configured thread count: a single-threaded
//! recursive DFS, or a multi-threaded BFS over a shared work queue of pending
//! directories.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;

use crate::file::FileEntry;
use crate::queue::ConcurrentQueue;
use crate::rctime::LastRctime;

/// Files buffered per worker before flushing into the shared list.
const LOCAL_BATCH: usize = 128;

static VIM_SWAP: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"\.swpx?$").expect("valid swap file regex"));

/// Name-based ignore filters, each an independent gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreRules {
    /// Skip dotfiles.
    pub hidden: bool,
    /// Skip `~$...` office lock markers.
    pub win_lock: bool,
    /// Skip vim swap files (`*.swp` / `*.swpx`).
    pub vim_swap: bool,
}

impl IgnoreRules {
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        (self.hidden && name.starts_with('.'))
            || (self.win_lock && name.starts_with("~$"))
            || (self.vim_swap && VIM_SWAP.is_match(name))
    }
}

/// One enumeration pass over a snapshot.
pub struct Crawl<'a> {
    clock: &'a LastRctime,
    rules: IgnoreRules,
    threads: usize,
}

impl<'a> Crawl<'a> {
    pub fn new(clock: &'a LastRctime, rules: IgnoreRules, threads: usize) -> anyhow::Result<Crawl<'a>> {
        anyhow::ensure!(threads >= 1, "invalid number of crawler threads: {threads}");
        Ok(Crawl {
            clock,
            rules,
            threads,
        })
    }

    /// Walk `snap_root` and return the changed entries plus their byte total.
    ///
    /// Always runs to completion once started; the snapshot is immutable so
    /// no mid-crawl cancellation is needed.
    pub fn enumerate(
        &self,
        snap_root: &std::path::Path,
    ) -> anyhow::Result<(Vec<FileEntry>, u64)> {
        tracing::debug!("launching crawler in {:?}", snap_root);
        let (files, total_bytes) = if self.threads == 1 {
            let mut files = Vec::new();
            let mut total_bytes = 0;
            self.crawl_dfs(snap_root, snap_root, &mut files, &mut total_bytes)?;
            (files, total_bytes)
        } else {
            self.crawl_bfs(snap_root)?
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            for file in &files {
                tracing::debug!("to sync: {:?}", file.path());
            }
        }
        Ok((files, total_bytes))
    }

    /// An entry is kept iff it is newer than the clock and matched by no
    /// active ignore rule.
    fn ignored(&self, path: &std::path::Path, metadata: &std::fs::Metadata) -> bool {
        if !self.clock.is_newer(path, metadata) {
            return true;
        }
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        self.rules.matches(&name)
    }

    fn crawl_dfs(
        &self,
        dir: &std::path::Path,
        snap_root: &std::path::Path,
        files: &mut Vec<FileEntry>,
        total_bytes: &mut u64,
    ) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(dir).with_context(|| format!("failed listing {dir:?}"))? {
            let entry = entry.with_context(|| format!("failed reading entry of {dir:?}"))?;
            let path = entry.path();
            let metadata = std::fs::symlink_metadata(&path)
                .with_context(|| format!("failed reading metadata from {path:?}"))?;
            if self.ignored(&path, &metadata) {
                continue;
            }
            if metadata.is_dir() {
                self.crawl_dfs(&path, snap_root, files, total_bytes)?;
            } else {
                let file = FileEntry::new(&path, snap_root, &metadata);
                *total_bytes += file.payload_bytes();
                files.push(file);
            }
        }
        Ok(())
    }

    fn crawl_bfs(&self, snap_root: &std::path::Path) -> anyhow::Result<(Vec<FileEntry>, u64)> {
        let queue = ConcurrentQueue::new(self.threads);
        queue.push(snap_root.to_path_buf());
        let files = Mutex::new(Vec::new());
        let total_bytes = AtomicU64::new(0);
        std::thread::scope(|scope| -> anyhow::Result<()> {
            let mut handles = Vec::new();
            for _ in 0..self.threads {
                handles.push(
                    scope.spawn(|| self.bfs_worker(&queue, snap_root, &files, &total_bytes)),
                );
            }
            for handle in handles {
                match handle.join() {
                    Ok(result) => result?,
                    Err(_) => anyhow::bail!("crawler worker thread panicked"),
                }
            }
            Ok(())
        })?;
        let files = files.into_inner().expect("crawl file list lock poisoned");
        Ok((files, total_bytes.load(Ordering::SeqCst)))
    }

    /// Pop directories, push their child directories back, flush matching
    /// files into the shared list in small batches.
    ///
    /// A failing directory is recorded but the worker keeps draining the
    /// queue; bailing out early would strand siblings blocked on the queue's
    /// termination protocol.
    fn bfs_worker(
        &self,
        queue: &ConcurrentQueue<std::path::PathBuf>,
        snap_root: &std::path::Path,
        files: &Mutex<Vec<FileEntry>>,
        total_bytes: &AtomicU64,
    ) -> anyhow::Result<()> {
        let mut local = Vec::with_capacity(LOCAL_BATCH);
        let mut first_error = None;
        while let Some(dir) = queue.pop() {
            if let Err(error) = self.expand_node(&dir, snap_root, queue, &mut local) {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            if !local.is_empty() {
                let mut bytes = 0;
                for file in &local {
                    bytes += file.payload_bytes();
                }
                total_bytes.fetch_add(bytes, Ordering::SeqCst);
                files
                    .lock()
                    .expect("crawl file list lock poisoned")
                    .append(&mut local);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn expand_node(
        &self,
        dir: &std::path::Path,
        snap_root: &std::path::Path,
        queue: &ConcurrentQueue<std::path::PathBuf>,
        local: &mut Vec<FileEntry>,
    ) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(dir).with_context(|| format!("failed listing {dir:?}"))? {
            let entry = entry.with_context(|| format!("failed reading entry of {dir:?}"))?;
            let path = entry.path();
            let metadata = std::fs::symlink_metadata(&path)
                .with_context(|| format!("failed reading metadata from {path:?}"))?;
            if self.ignored(&path, &metadata) {
                continue;
            }
            if metadata.is_dir() {
                queue.push(path);
            } else {
                local.push(FileEntry::new(&path, snap_root, &metadata));
            }
        }
        Ok(())
    }
}
