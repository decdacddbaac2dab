//! Point-in-time snapshots of the source tree.
//!
//! CephFS turns a `mkdir` under a directory's `.snap` subdirectory into a
//! consistent read-only view of that directory. The crawler always walks such
//! a view so the live tree can keep mutating underneath it.

use anyhow::Context;

use crate::rctime::Timestamp;

/// An active snapshot directory, named uniquely per daemon PID so concurrent
/// instances never collide.
#[derive(Debug)]
pub struct Snapshot {
    path: std::path::PathBuf,
}

impl Snapshot {
    /// Create `<base>/.snap/<pid>snapshot<mark>`.
    pub fn create(base: &std::path::Path, mark: Timestamp) -> anyhow::Result<Snapshot> {
        let name = format!("{}snapshot{}", std::process::id(), mark);
        let path = base.join(".snap").join(name);
        tracing::debug!("creating snapshot: {:?}", &path);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed creating snapshot path {path:?}"))?;
        Ok(Snapshot { path })
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Remove the snapshot directory. An already-removed snapshot is fine;
    /// anything else is an error.
    pub fn delete(self) -> anyhow::Result<()> {
        tracing::debug!("removing snapshot: {:?}", &self.path);
        match std::fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error)
                .with_context(|| format!("failed removing snapshot path {:?}", &self.path)),
        }
    }
}
