//! The high-water-mark change clock.
//!
//! CephFS maintains a recursive change time (`ceph.dir.rctime`) on every
//! directory: the newest modification time of anything in its subtree. The
//! daemon persists a single timestamp - the high-water mark - below which all
//! changes are known to have been replicated. Answering "did anything change"
//! then only requires comparing the rctimes of the source root's immediate
//! children against the mark, not walking the tree.

use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;

use anyhow::Context;

const XATTR_RCTIME: &std::ffi::CStr = c"ceph.dir.rctime";
const XATTR_BUF_SIZE: usize = 1024;

/// A second/nanosecond timestamp, ordered lexicographically.
///
/// Serialized as `<seconds>.<nanoseconds>` both in the persistence file and
/// in log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, nsec: 0 };

    /// Mark used by seed mode: early enough that every real file is newer.
    pub const SEED: Timestamp = Timestamp { sec: 1, nsec: 0 };

    #[must_use]
    pub fn new(sec: i64, nsec: i64) -> Timestamp {
        Timestamp { sec, nsec }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.sec, self.nsec)
    }
}

impl std::str::FromStr for Timestamp {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Timestamp> {
        let (sec, nsec) = value
            .trim()
            .split_once('.')
            .with_context(|| format!("missing '.' separator in timestamp {value:?}"))?;
        Ok(Timestamp {
            sec: sec
                .parse()
                .with_context(|| format!("invalid seconds in timestamp {value:?}"))?,
            nsec: nsec
                .parse()
                .with_context(|| format!("invalid nanoseconds in timestamp {value:?}"))?,
        })
    }
}

/// Read `ceph.dir.rctime` from a directory.
///
/// The attribute value has the form `<seconds>.09<nanoseconds>`; the two
/// characters after the separator are a fixed width marker and are skipped.
fn read_rctime_xattr(path: &std::path::Path) -> anyhow::Result<Timestamp> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path {path:?} contains a NUL byte"))?;
    let mut buf = [0u8; XATTR_BUF_SIZE];
    let len = unsafe {
        libc::lgetxattr(
            cpath.as_ptr(),
            XATTR_RCTIME.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if len < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed reading ceph.dir.rctime from {path:?}"));
    }
    #[allow(clippy::cast_sign_loss)]
    let value = std::str::from_utf8(&buf[..len as usize])
        .context("ceph.dir.rctime value is not valid UTF-8")?
        .trim_end_matches('\0');
    let (sec, rest) = value
        .split_once('.')
        .with_context(|| format!("malformed ceph.dir.rctime value {value:?}"))?;
    let nsec = match rest.get(2..) {
        Some(digits) if !digits.is_empty() => digits,
        _ => "0",
    };
    Ok(Timestamp {
        sec: sec
            .parse()
            .with_context(|| format!("malformed ceph.dir.rctime seconds in {value:?}"))?,
        nsec: nsec
            .parse()
            .with_context(|| format!("malformed ceph.dir.rctime nanoseconds in {value:?}"))?,
    })
}

/// Change time of one filesystem entry: `ceph.dir.rctime` for directories,
/// `lstat` mtime for everything else (symlinks are not followed).
///
/// An unreadable attribute is logged and treated as the lowest possible time
/// so one bad entry never blocks detection of other changes.
#[must_use]
pub fn get_rctime(path: &std::path::Path, metadata: &std::fs::Metadata) -> Timestamp {
    if metadata.is_dir() {
        match read_rctime_xattr(path) {
            Ok(rctime) => rctime,
            Err(error) => {
                tracing::warn!("{:#}; ignoring {:?}", error, path);
                Timestamp::ZERO
            }
        }
    } else {
        Timestamp::new(metadata.mtime(), metadata.mtime_nsec())
    }
}

/// The persisted high-water mark.
///
/// Loaded once at daemon start, advanced in memory after each processed
/// change, flushed to disk on shutdown and periodically to bound how much
/// progress a crash can lose.
#[derive(Debug)]
pub struct LastRctime {
    mark: Timestamp,
    path: std::path::PathBuf,
}

impl LastRctime {
    /// Load the mark from disk, initializing to `0.0` when the file is
    /// missing or corrupt. Corruption is recovered, never fatal.
    pub fn load(path: &std::path::Path) -> anyhow::Result<LastRctime> {
        let mut clock = LastRctime {
            mark: Timestamp::ZERO,
            path: path.to_path_buf(),
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => match contents.parse() {
                Ok(mark) => clock.mark = mark,
                Err(error) => {
                    tracing::warn!("{:?} is corrupt ({:#}), reinitializing to 0.0", path, error);
                    clock.flush()?;
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{:?} does not exist, initializing to 0.0", path);
                clock.flush()?;
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed reading {path:?}"));
            }
        }
        Ok(clock)
    }

    #[must_use]
    pub fn mark(&self) -> Timestamp {
        self.mark
    }

    /// Advance (or rewind, for seed/dry-run bookkeeping) the in-memory mark.
    pub fn update(&mut self, mark: Timestamp) {
        self.mark = mark;
    }

    /// Write the mark to disk in `<seconds>.<nanoseconds>` form.
    pub fn flush(&self) -> anyhow::Result<()> {
        tracing::debug!("writing last rctime {} to {:?}", self.mark, &self.path);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {parent:?}"))?;
        }
        let mut file = std::fs::File::create(&self.path)
            .with_context(|| format!("failed creating {:?}", &self.path))?;
        writeln!(file, "{}", self.mark).with_context(|| format!("failed writing {:?}", &self.path))
    }

    /// True iff the entry changed after the mark.
    #[must_use]
    pub fn is_newer(&self, path: &std::path::Path, metadata: &std::fs::Metadata) -> bool {
        get_rctime(path, metadata) > self.mark
    }

    /// Scan only the immediate children of `root` for changes.
    ///
    /// Because a directory's rctime aggregates its whole subtree, one level
    /// is enough to answer "did anything change"; the full walk is deferred
    /// until the answer is yes. Returns the newest qualifying timestamp.
    pub fn check_for_change(&self, root: &std::path::Path) -> anyhow::Result<Option<Timestamp>> {
        let mut newest: Option<Timestamp> = None;
        for entry in
            std::fs::read_dir(root).with_context(|| format!("failed listing {root:?}"))?
        {
            let entry = entry.with_context(|| format!("failed reading entry of {root:?}"))?;
            let path = entry.path();
            let metadata = match std::fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(error) => {
                    tracing::warn!("failed reading metadata from {:?}: {}", &path, error);
                    continue;
                }
            };
            let rctime = get_rctime(&path, &metadata);
            if rctime > self.mark && Some(rctime) > newest {
                newest = Some(rctime);
            }
        }
        Ok(newest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_ordering() {
        assert!(Timestamp::new(2, 0) > Timestamp::new(1, 999_999_999));
        assert!(Timestamp::new(1, 1) > Timestamp::new(1, 0));
        assert!(Timestamp::new(1, 0) >= Timestamp::new(1, 0));
        assert!(Timestamp::new(0, 5) < Timestamp::new(1, 0));
    }

    #[test]
    fn timestamp_round_trips_through_text() {
        let ts = Timestamp::new(1_699_999_999, 123_456_789);
        let parsed: Timestamp = ts.to_string().parse().unwrap();
        assert_eq!(parsed, ts);
        assert_eq!("0.0".parse::<Timestamp>().unwrap(), Timestamp::ZERO);
    }

    #[test]
    fn missing_file_initializes_to_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("meta").join("last_rctime.dat");
        let clock = LastRctime::load(&path).unwrap();
        assert_eq!(clock.mark(), Timestamp::ZERO);
        // the file now exists with the initial value
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0.0\n");
    }

    #[test]
    fn corrupt_file_recovers_to_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("last_rctime.dat");
        std::fs::write(&path, "not a timestamp\n").unwrap();
        let clock = LastRctime::load(&path).unwrap();
        assert_eq!(clock.mark(), Timestamp::ZERO);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0.0\n");
    }

    #[test]
    fn flush_persists_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("last_rctime.dat");
        let mut clock = LastRctime::load(&path).unwrap();
        clock.update(Timestamp::new(42, 7));
        clock.flush().unwrap();
        let reloaded = LastRctime::load(&path).unwrap();
        assert_eq!(reloaded.mark(), Timestamp::new(42, 7));
    }

    #[test]
    fn check_for_change_sees_new_files_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "0123456789").unwrap();
        let clock_path = tmp.path().join("last_rctime.dat");
        let mut clock = LastRctime::load(&clock_path).unwrap();

        let newest = clock.check_for_change(tmp.path()).unwrap();
        let newest = newest.expect("fresh file must register as a change");
        assert!(newest > Timestamp::ZERO);

        // monotonicity: the mark only moves forward, and re-scanning with no
        // intervening mutation reports no change
        clock.update(newest);
        assert_eq!(clock.check_for_change(tmp.path()).unwrap(), None);
    }

    #[test]
    fn check_for_change_returns_the_newest_qualifying_mark() {
        let source = tempfile::tempdir().unwrap();
        let meta = tempfile::tempdir().unwrap();
        let old = source.path().join("old.txt");
        let new = source.path().join("new.txt");
        std::fs::write(&old, "old").unwrap();
        std::fs::write(&new, "new").unwrap();
        filetime::set_file_mtime(&old, filetime::FileTime::from_unix_time(100, 0)).unwrap();
        filetime::set_file_mtime(&new, filetime::FileTime::from_unix_time(200, 500)).unwrap();

        let mut clock = LastRctime::load(&meta.path().join("last_rctime.dat")).unwrap();
        clock.update(Timestamp::new(150, 0));
        assert_eq!(
            clock.check_for_change(source.path()).unwrap(),
            Some(Timestamp::new(200, 500))
        );
    }

    #[test]
    fn mtime_is_not_followed_through_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("target.txt");
        std::fs::write(&target, "x").unwrap();
        filetime::set_file_mtime(&target, filetime::FileTime::from_unix_time(500, 0)).unwrap();
        let link = tmp.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let metadata = std::fs::symlink_metadata(&link).unwrap();
        let rctime = get_rctime(&link, &metadata);
        // the link's own mtime is "now", far newer than the target's
        assert!(rctime > Timestamp::new(500, 0));
    }
}
