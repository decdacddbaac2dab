//! Daemon status publication.
//!
//! A single numeric code written to a well-known file, scraped by the
//! Prometheus exporter. Publication is best-effort: a failure to write the
//! status file is never allowed to take the daemon down.

/// Status code definitions for the Prometheus exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    NotRunning = 1,
    HostDown = 2,
    AllHostsDown = 3,
}

/// Writes status codes to a fixed file, truncating on every update.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: std::path::PathBuf,
}

impl StatusFile {
    /// Create the publisher and publish the initial [`StatusCode::Ok`].
    #[must_use]
    pub fn new(path: &std::path::Path) -> StatusFile {
        let status = StatusFile {
            path: path.to_path_buf(),
        };
        status.publish(StatusCode::Ok);
        status
    }

    pub fn publish(&self, code: StatusCode) {
        if let Err(error) = self.write(code) {
            tracing::warn!("failed publishing status to {:?}: {:#}", &self.path, error);
        }
    }

    fn write(&self, code: StatusCode) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{}\n", code as i32))?;
        Ok(())
    }
}
