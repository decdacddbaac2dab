use clap::Parser;

use common::config::{Config, Overrides};
use rgeorep_tools_daemon::daemon::{Daemon, RunFlags};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rgeorepd",
    version,
    about = "Geo-replication daemon for CephFS - watches a directory tree and replicates changes via rsync/scp",
    long_about = "`rgeorepd` watches a CephFS directory tree using the filesystem's recursive \
change time, takes a snapshot when something changed, and fans the changed files out across \
parallel instances of an external transfer program (rsync/scp).

EXAMPLES:
    # Run against the default config
    rgeorepd

    # Send everything once to seed a fresh destination
    rgeorepd --seed

    # See what would be synced without transferring anything
    rgeorepd --dry-run -v

    # One poll cycle with eight transfer processes
    rgeorepd --oneshot --nproc 8"
)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(
        short,
        long,
        value_name = "PATH",
        default_value = "/etc/rgeorep/rgeorepd.toml",
        help_heading = "General"
    )]
    config: std::path::PathBuf,

    /// Verbose level: -v DEBUG / -vv TRACE (default: from config)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "General")]
    verbose: u8,

    /// Quiet mode, log errors only
    #[arg(short = 'q', long = "quiet", help_heading = "General")]
    quiet: bool,

    /// Sync the entire tree once to seed the destination, then exit
    #[arg(short, long, help_heading = "Modes")]
    seed: bool,

    /// Log the transfer command instead of running it; the clock is not
    /// advanced
    #[arg(short, long, help_heading = "Modes")]
    dry_run: bool,

    /// Run a single poll cycle, then exit
    #[arg(short, long, help_heading = "Modes")]
    oneshot: bool,

    /// Record the newest change time without syncing anything, priming the
    /// daemon to skip pre-existing files
    #[arg(long = "set-last-change-time", help_heading = "Modes")]
    set_last_change_time: bool,

    /// Number of parallel transfer processes
    #[arg(short, long, value_name = "N", help_heading = "Overrides")]
    nproc: Option<usize>,

    /// Number of crawler threads (1 = recursive walk)
    #[arg(short, long, value_name = "N", help_heading = "Overrides")]
    threads: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    // tracing must come up before the config is fully loaded so load-time
    // warnings are visible; CLI flags win, otherwise peek at the file
    let log_level = if args.quiet {
        0
    } else if args.verbose > 0 {
        args.verbose.saturating_add(1)
    } else {
        Config::peek_log_level(&args.config).unwrap_or(1)
    };
    let cli_level = (args.quiet || args.verbose > 0).then_some(log_level);
    let result = common::run(log_level, || {
        let overrides = Overrides {
            nproc: args.nproc,
            threads: args.threads,
            log_level: cli_level,
        };
        let config = Config::load(&args.config, &overrides)?;
        let mut daemon = Daemon::new(config)?;
        daemon.run(RunFlags {
            seed: args.seed,
            dry_run: args.dry_run,
            oneshot: args.oneshot,
            set_rctime: args.set_last_change_time,
        })
    });
    if result.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
