//! Daemon configuration.
//!
//! Settings are read from a TOML file. A missing file is replaced with a
//! commented default template; CLI overrides are applied after loading and
//! the merged result is validated once, so the rest of the daemon can treat
//! the config as a read-only settings bag.

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Name of the high-water-mark file inside the metadata directory.
const LAST_RCTIME_NAME: &str = "last_rctime.dat";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Full path to the directory to replicate.
    pub source_directory: std::path::PathBuf,
    /// Ignore files beginning with `.`.
    pub ignore_hidden: bool,
    /// Ignore office lock files beginning with `~$`.
    pub ignore_win_lock: bool,
    /// Ignore vim swap files (`*.swp` / `*.swpx`).
    pub ignore_vim_swap: bool,

    /// User on the remote backup machine (optional).
    pub remote_user: String,
    /// Remote backup machine address/host.
    pub remote_host: String,
    /// Directory on the remote backup machine.
    pub remote_directory: String,
    /// Explicit failover list of `[user@]host:path` destinations; overrides
    /// the three fields above when non-empty.
    pub destinations: Vec<String>,

    /// Program used for syncing - rsync or scp.
    pub exec: String,
    /// Flags for the sync program, shell-word tokenized.
    pub flags: String,
    /// Where the daemon keeps its own state.
    pub metadata_directory: std::path::PathBuf,
    /// Seconds between checks for changes.
    pub sync_period_s: u64,
    /// Milliseconds between snapshot creation and crawl, giving the
    /// recursive change time room to trickle up to the source root.
    pub propagation_delay_ms: u64,
    /// Number of parallel sync processes to launch.
    pub processes: usize,
    /// Number of crawler threads (1 selects the recursive walk).
    pub threads: usize,
    /// 0 = errors only, 1 = basic logging, 2 = debug, 3 = trace.
    pub log_level: u8,
    /// Seconds to wait before retrying the first destination after the whole
    /// failover list has been exhausted.
    pub failover_cooldown_s: u64,
    /// Status code file scraped by the Prometheus exporter.
    pub status_file: std::path::PathBuf,
    /// Where argv dumps land when the sync program fails to execute.
    pub diagnostic_log_directory: std::path::PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            source_directory: std::path::PathBuf::new(),
            ignore_hidden: false,
            ignore_win_lock: true,
            ignore_vim_swap: false,
            remote_user: String::new(),
            remote_host: String::new(),
            remote_directory: String::new(),
            destinations: Vec::new(),
            exec: "rsync".to_string(),
            flags: "-a --relative".to_string(),
            metadata_directory: "/var/lib/rgeorep".into(),
            sync_period_s: 10,
            propagation_delay_ms: 100,
            processes: 1,
            threads: 1,
            log_level: 1,
            failover_cooldown_s: 30,
            status_file: "/run/rgeorep/status".into(),
            diagnostic_log_directory: "/var/log/rgeorep".into(),
        }
    }
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub nproc: Option<usize>,
    pub threads: Option<usize>,
    pub log_level: Option<u8>,
}

impl Config {
    /// Load the config, writing a default template first if the file does
    /// not exist, then apply `overrides` and validate.
    pub fn load(path: &std::path::Path, overrides: &Overrides) -> anyhow::Result<Config> {
        if !path.exists() {
            tracing::info!("{:?} does not exist, writing default config", path);
            Config::write_default_template(path)?;
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {path:?}"))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed parsing config file {path:?}"))?;
        if let Some(nproc) = overrides.nproc {
            config.processes = nproc;
        }
        if let Some(threads) = overrides.threads {
            config.threads = threads;
        }
        if let Some(log_level) = overrides.log_level {
            config.log_level = log_level;
        }
        config.validate(path)?;
        Ok(config)
    }

    /// Read just the log level so tracing can be initialized before the full
    /// load (whose warnings should themselves be logged). Any failure here
    /// resurfaces properly during [`Config::load`].
    #[must_use]
    pub fn peek_log_level(path: &std::path::Path) -> Option<u8> {
        let contents = std::fs::read_to_string(path).ok()?;
        let config: Config = toml::from_str(&contents).ok()?;
        Some(config.log_level)
    }

    fn validate(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        if self.source_directory.as_os_str().is_empty() {
            errors.push("config does not name a directory to replicate (source_directory)");
        }
        if self.exec.is_empty() {
            errors.push("config must name a program to execute (exec)");
        }
        if self.processes == 0 {
            errors.push("number of sync processes must be at least 1 (processes)");
        }
        if self.threads == 0 {
            errors.push("number of crawler threads must be at least 1 (threads)");
        }
        if self.remote_host.is_empty() && self.destinations.is_empty() {
            tracing::warn!("config does not name a remote host (remote_host)");
        }
        if self.remote_directory.is_empty() && self.destinations.is_empty() {
            tracing::warn!("config does not name a remote directory (remote_directory)");
        }
        if self.flags.is_empty() {
            tracing::warn!("no execution flags present in config (flags)");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "{}\nPlease fix these mistakes in {}.",
                errors.join("\n"),
                path.display()
            )
        }
    }

    /// Write the commented default config.
    pub fn write_default_template(path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {parent:?}"))?;
        }
        std::fs::write(path, DEFAULT_TEMPLATE)
            .with_context(|| format!("failed writing default config to {path:?}"))
    }

    /// Log the effective configuration at debug level.
    pub fn dump(&self) {
        match toml::to_string(self) {
            Ok(rendered) => tracing::debug!("configuration:\n{}", rendered),
            Err(error) => tracing::warn!("could not render configuration: {}", error),
        }
    }

    #[must_use]
    pub fn last_rctime_path(&self) -> std::path::PathBuf {
        self.metadata_directory.join(LAST_RCTIME_NAME)
    }
}

/// Split a flag string into words the way a shell would, honoring single and
/// double quotes and backslash escapes.
#[must_use]
pub fn tokenize(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_word = true;
                }
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                        in_word = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

const DEFAULT_TEMPLATE: &str = r#"# local backup settings
source_directory = ""         # full path to directory to replicate
ignore_hidden = false         # ignore files beginning with "."
ignore_win_lock = true        # ignore files beginning with "~$"
ignore_vim_swap = false       # ignore vim swap files (*.swp, *.swpx)

# remote settings
remote_user = ""              # user on remote backup machine (optional)
remote_host = ""              # remote backup machine address/host
remote_directory = ""         # directory in remote backup
destinations = []             # explicit failover list of [user@]host:path
                              # entries; overrides the three fields above

# daemon settings
exec = "rsync"                # program to use for syncing - rsync or scp
flags = "-a --relative"       # execution flags for above program
metadata_directory = "/var/lib/rgeorep"
sync_period_s = 10            # time in seconds between checks for changes
propagation_delay_ms = 100    # time in milliseconds between snapshot and sync
processes = 1                 # number of parallel sync processes to launch
threads = 1                   # number of crawler threads (1 = recursive walk)
log_level = 1
failover_cooldown_s = 30      # pause before retrying the first destination
status_file = "/run/rgeorep/status"
diagnostic_log_directory = "/var/log/rgeorep"
# 0 = minimum logging
# 1 = basic logging
# 2 = debug logging
# If remote_user is empty, the daemon will sync remotely as the executing user.
# propagation_delay_ms accounts for the time Ceph needs to propagate the
# modification time of a file all the way back to the root of the sync
# directory.
"#;
