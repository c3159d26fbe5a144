//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml` in the working directory)
//! - Merging CLI with file config (CLI takes precedence)

use clap::Parser;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::{DEFAULT_RELAY_URL, TransferPolicy};

/// PeerDrop - peer-to-peer file transfer over WebRTC.
#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Signaling relay WebSocket URL.
    #[clap(long, default_value = DEFAULT_RELAY_URL)]
    pub relay: String,

    /// Device id announced to the relay. Generated when omitted.
    #[clap(long)]
    pub device_id: Option<String>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory for persistent data (checkpoints, logs).
    /// Defaults to ~/.peerdrop/
    #[clap(long)]
    pub conf: Option<PathBuf>,

    /// Where received files are saved. Defaults to <conf>/downloads.
    #[clap(long)]
    pub download_dir: Option<PathBuf>,

    /// File to send once the targets are online.
    #[clap(long, requires = "to")]
    pub send: Option<PathBuf>,

    /// Comma-separated target device ids for --send.
    #[clap(long, value_delimiter = ',')]
    pub to: Vec<String>,

    /// Accept every inbound transfer request (otherwise they are rejected).
    #[clap(long)]
    pub auto_accept: bool,

    /// Keep large receives in memory instead of streaming them to disk.
    #[clap(long)]
    pub no_disk_stream: bool,

    /// Transfer heuristics; only settable from config.toml.
    #[clap(skip)]
    pub policy: TransferPolicy,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            relay: DEFAULT_RELAY_URL.to_string(),
            device_id: None,
            verbose: 0,
            conf: None,
            download_dir: None,
            send: None,
            to: Vec::new(),
            auto_accept: false,
            no_disk_stream: false,
            policy: TransferPolicy::default(),
        }
    }
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        // Resolve relative paths before anything changes the working directory
        cli_args.conf = cli_args.conf.map(Self::resolve_path);
        cli_args.download_dir = cli_args.download_dir.map(Self::resolve_path);
        cli_args.send = cli_args.send.map(Self::resolve_path);

        let default_path = PathBuf::from("config.toml");
        let mut args = match Self::from_file(&default_path) {
            Some(file_args) => Self::merge(file_args, cli_args),
            None => cli_args,
        };
        if args.no_disk_stream {
            args.policy.stream_to_disk = false;
        }
        args
    }

    /// The configured device id, or a fresh `<host>-<random6>` one.
    pub fn device_id(&self) -> String {
        if let Some(id) = self.device_id.as_deref().filter(|s| !s.is_empty()) {
            return id.to_string();
        }
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "peer".to_string());
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        format!("{}-{suffix}", host.to_lowercase())
    }

    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        Self::from_toml(&content)
    }

    fn from_toml(content: &str) -> Option<Self> {
        toml::from_str::<Args>(content).ok()
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.relay != DEFAULT_RELAY_URL {
            file.relay = cli.relay;
        }
        if cli.device_id.is_some() {
            file.device_id = cli.device_id;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.conf.is_some() {
            file.conf = cli.conf;
        }
        if cli.download_dir.is_some() {
            file.download_dir = cli.download_dir;
        }
        if cli.send.is_some() {
            file.send = cli.send;
            file.to = cli.to;
        }
        if cli.auto_accept {
            file.auto_accept = true;
        }
        if cli.no_disk_stream {
            file.no_disk_stream = true;
        }
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cli_overrides_file() {
        let file = Args::from_toml(
            r#"
            relay = "ws://relay.lan:9000/ws"
            device_id = "from-file"
            auto_accept = true

            [policy]
            small_file_threshold = 1024
            inter_chunk_delay = 0
            "#,
        )
        .unwrap();
        assert_eq!(file.policy.small_file_threshold, 1024);
        assert_eq!(file.policy.inter_chunk_delay, Duration::ZERO);

        let cli = Args::parse_from(["peerdrop", "--device-id", "laptop", "-vv"]);
        let merged = Args::merge(file, cli);
        assert_eq!(merged.relay, "ws://relay.lan:9000/ws");
        assert_eq!(merged.device_id(), "laptop");
        assert_eq!(merged.verbose, 2);
        assert!(merged.auto_accept);
        assert_eq!(merged.policy.small_file_threshold, 1024);
    }

    #[test]
    fn test_send_targets_are_split() {
        let args = Args::parse_from(["peerdrop", "--send", "a.txt", "--to", "bob,carol"]);
        assert_eq!(args.to, vec!["bob", "carol"]);
    }

    #[test]
    fn test_generated_device_id_has_random_suffix() {
        let args = Args::default();
        let id = args.device_id();
        let (_, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(suffix.len(), 6);
        assert_ne!(id, args.device_id());
    }
}
