use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::bpf::BPF_FS_DIR;
use crate::daemon::binding::RetryPolicy;
use crate::options::parse_option;
use crate::program::ProgramKind;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Daemon(DaemonArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    /// Directory holding the program sources and init scripts
    #[arg(long, env = "REGULUS_LIB_DIR", default_value = "/usr/lib/regulus")]
    pub lib_dir: PathBuf,

    /// Directory for generated headers and runtime state
    #[arg(long, env = "REGULUS_RUN_DIR", default_value = "/var/run/regulus")]
    pub run_dir: PathBuf,

    /// Path to the bpf fs for bpf maps
    #[arg(long, default_value = "/sys/fs/bpf")]
    pub bpf_fs: PathBuf,

    /// Device the base program is attached to
    #[arg(long, default_value = "eth1")]
    pub device: String,

    /// Tunnel mode, replaces direct routing through --device
    #[arg(long)]
    pub tunnel: Option<String>,

    /// Name of the node the daemon is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// IPv4 address of this node
    #[arg(long, env = "NODE_ADDRESS")]
    pub node_address: Option<Ipv4Addr>,

    /// Metrics listener for the daemon
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Do not create bpf maps or load programs
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Enable debug logging
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Polls of the endpoint registry before a container is abandoned
    #[arg(long, default_value_t = 5)]
    pub bind_max_attempts: u32,

    /// Backoff unit between polls, multiplied by the attempt number
    #[arg(long, default_value_t = 1)]
    pub bind_backoff_secs: u64,

    /// Interval between full resyncs of running containers
    #[arg(long, default_value_t = 30)]
    pub resync_interval_secs: u64,

    /// Programs started for every newly bound container
    #[arg(long = "default-program", default_value = "L1")]
    pub default_programs: Vec<ProgramKind>,

    /// Options passed to the default programs
    #[arg(long, default_value = "")]
    pub default_program_options: String,

    /// Initial daemon option, `Name`, `!Name` or `Name=bool` (repeatable)
    #[arg(long = "option", value_parser = parse_option)]
    pub options: Vec<(String, bool)>,
}

/// Runtime configuration of the daemon.
#[derive(Clone, Debug)]
pub struct Config {
    pub lib_dir: PathBuf,
    pub run_dir: PathBuf,
    pub bpf_fs: PathBuf,
    pub device: String,
    pub tunnel: Option<String>,
    pub node_name: Option<String>,
    pub node_address: Option<Ipv4Addr>,
    pub dry_run: bool,
    pub retry: RetryPolicy,
    pub resync_interval: Duration,
    pub default_programs: Vec<ProgramKind>,
    pub default_program_options: String,
    pub options: BTreeMap<String, bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lib_dir: PathBuf::from("/usr/lib/regulus"),
            run_dir: PathBuf::from("/var/run/regulus"),
            bpf_fs: PathBuf::from(BPF_FS_DIR),
            device: "eth1".into(),
            tunnel: None,
            node_name: None,
            node_address: None,
            dry_run: false,
            retry: RetryPolicy::default(),
            resync_interval: Duration::from_secs(30),
            default_programs: vec![ProgramKind::L1],
            default_program_options: String::new(),
            options: BTreeMap::new(),
        }
    }
}

impl From<&DaemonArgs> for Config {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            lib_dir: args.lib_dir.clone(),
            run_dir: args.run_dir.clone(),
            bpf_fs: args.bpf_fs.clone(),
            device: args.device.clone(),
            tunnel: args.tunnel.clone(),
            node_name: args.node_name.clone(),
            node_address: args.node_address,
            dry_run: args.dry_run,
            retry: RetryPolicy {
                max_attempts: args.bind_max_attempts.max(1),
                backoff_unit: Duration::from_secs(args.bind_backoff_secs),
            },
            resync_interval: Duration::from_secs(args.resync_interval_secs.max(1)),
            default_programs: args.default_programs.clone(),
            default_program_options: args.default_program_options.clone(),
            options: args.options.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_daemon_defaults() {
        let cli = Cli::parse_from(["regulus", "daemon"]);
        let Commands::Daemon(args) = cli.command;
        let config = Config::from(&args);
        assert_eq!(config.lib_dir, PathBuf::from("/usr/lib/regulus"));
        assert_eq!(config.device, "eth1");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_unit, Duration::from_secs(1));
        assert_eq!(config.default_programs, vec![ProgramKind::L1]);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_daemon_overrides() {
        let cli = Cli::parse_from([
            "regulus",
            "daemon",
            "--dry-run",
            "--tunnel",
            "vxlan",
            "--bind-max-attempts",
            "3",
            "--node-address",
            "192.168.1.10",
            "--option",
            "PolicyTracing",
            "--option",
            "Debug=off",
        ]);
        let Commands::Daemon(args) = cli.command;
        let config = Config::from(&args);
        assert!(config.dry_run);
        assert_eq!(config.tunnel.as_deref(), Some("vxlan"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.node_address, Some(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(config.options.get("PolicyTracing"), Some(&true));
        assert_eq!(config.options.get("Debug"), Some(&false));
    }

    #[test]
    fn test_invalid_option_is_rejected() {
        let res = Cli::try_parse_from(["regulus", "daemon", "--option", "PolicyTracing=maybe"]);
        assert!(res.is_err());
    }
}
