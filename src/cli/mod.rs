use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::transfer::path::RemotePath;
use crate::transfer::throttle::parse_bandwidth_limit;
use crate::transfer::TransferOptions;

#[derive(Parser, Debug)]
#[command(name = "iot")]
#[command(about = "Terminal access and file transfer for IoT devices", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Only print errors and warnings
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Config file (default: <config dir>/iot/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Platform API base URL
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Give up after this long, e.g. 30s or 5m
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,
}

/// Flags shared by `get` and `put`
#[derive(Args, Debug, Clone)]
pub struct TransferFlags {
    /// Transfer directories recursively
    #[arg(long, short = 'r')]
    pub recursive: bool,

    /// Bandwidth limit (e.g. 1M, 500K)
    #[arg(long, short = 'l', value_parser = parse_bandwidth_limit)]
    pub limit: Option<u64>,

    /// Show progress bar
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub progress: bool,

    /// Overwrite existing files and continue past failed entries
    #[arg(long, short = 'f')]
    pub force: bool,

    /// Show what would be transferred without transferring anything
    #[arg(long)]
    pub dry_run: bool,
}

impl TransferFlags {
    /// Progress is only drawn when stdout is a terminal
    pub fn options(&self, quiet: bool, stdout_is_terminal: bool) -> TransferOptions {
        TransferOptions {
            recursive: self.recursive,
            limit: self.limit.unwrap_or(0),
            quiet,
            force: self.force,
            dry_run: self.dry_run,
            show_progress: self.progress && stdout_is_terminal,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open a terminal session to a device
    Ssh {
        /// Device ID
        device: String,
    },

    /// Download files from a device
    Get {
        /// Remote source as <device>:<path>
        source: RemotePath,

        /// Local destination (default: current directory)
        destination: Option<String>,

        #[command(flatten)]
        flags: TransferFlags,
    },

    /// Upload files to a device
    Put {
        /// Local files or directories
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Remote destination as <device>:<path>, ending with / for a directory
        destination: RemotePath,

        #[command(flatten)]
        flags: TransferFlags,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let cli = Cli::try_parse_from([
            "iot", "get", "-r", "-l", "500K", "sensor-1:/etc/app/", "backup/", "--timeout", "5m",
        ])
        .unwrap();

        assert_eq!(cli.timeout, Some(Duration::from_secs(300)));
        let Commands::Get {
            source,
            destination,
            flags,
        } = cli.command
        else {
            panic!("expected get");
        };
        assert_eq!(source.device_id, "sensor-1");
        assert_eq!(source.path, "/etc/app/");
        assert_eq!(destination.as_deref(), Some("backup/"));
        assert!(flags.recursive);
        assert_eq!(flags.limit, Some(512_000));
        assert!(flags.progress);
    }

    #[test]
    fn test_parse_put_with_several_sources() {
        let cli = Cli::try_parse_from([
            "iot", "put", "a.txt", "b.txt", "dev:/opt/", "--progress=false", "--dry-run",
        ])
        .unwrap();

        let Commands::Put {
            sources,
            destination,
            flags,
        } = cli.command
        else {
            panic!("expected put");
        };
        assert_eq!(sources, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
        assert_eq!(destination.to_string(), "dev:/opt/");
        assert!(!flags.progress);
        assert!(flags.dry_run);
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        assert!(Cli::try_parse_from(["iot", "get", "no-separator"]).is_err());
        assert!(Cli::try_parse_from(["iot", "get", "dev:relative"]).is_err());
        assert!(Cli::try_parse_from(["iot", "get", "-l", "abc", "dev:/x"]).is_err());
        assert!(Cli::try_parse_from(["iot", "put", "dev:/x"]).is_err());
    }

    #[test]
    fn test_transfer_options() {
        let cli = Cli::try_parse_from(["iot", "-q", "get", "-f", "dev:/x"]).unwrap();
        let Commands::Get { flags, .. } = cli.command else {
            panic!("expected get");
        };

        let options = flags.options(cli.quiet, true);
        assert!(options.quiet);
        assert!(options.force);
        assert_eq!(options.limit, 0);

        assert!(!flags.options(false, false).show_progress);
        assert!(flags.options(false, true).show_progress);
    }
}
