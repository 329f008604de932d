use clap::{Args, Parser, Subcommand};
use skiff_proto::DeviceClass;
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "skiff",
    about = "Discover devices on the local network and send them files",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "SKIFF_RELAY_URL",
        value_name = "URL",
        help = "Signaling relay WebSocket URL (http/https are accepted)"
    )]
    pub relay_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "SKIFF_IDENTITY",
        value_name = "PATH",
        help = "Identity file; listen and whoami default to ~/.skiff/identity.toml, send and peers join under a throwaway identity unless this is set"
    )]
    pub identity: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "CLASS",
        help = "Device class announced to peers (desktop, mobile, tablet)"
    )]
    pub device_class: Option<DeviceClass>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "SKIFF_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "SKIFF_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stay online and save every file peers send
    Listen(ListenArgs),
    /// Send one file to a peer by id
    Send(SendArgs),
    /// List the peers the relay reports
    Peers(PeersArgs),
    /// Print this device's identity
    Whoami,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[arg(
        long,
        short = 'o',
        value_name = "DIR",
        default_value = ".",
        help = "Directory received files are written to"
    )]
    pub output: PathBuf,

    #[arg(long, help = "Exit after the first completed file")]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Id of the receiving peer
    pub peer_id: String,

    /// File to send
    pub path: PathBuf,

    #[arg(
        long,
        default_value_t = 10,
        value_name = "SECS",
        help = "How long to wait for the peer to appear and connect"
    )]
    pub wait_secs: u64,
}

#[derive(Args, Debug)]
pub struct PeersArgs {
    #[arg(
        long,
        default_value_t = 2,
        value_name = "SECS",
        help = "How long to collect roster updates"
    )]
    pub wait_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_parses_peer_and_path() {
        let cli = Cli::try_parse_from([
            "skiff",
            "--device-class",
            "mobile",
            "send",
            "k2z",
            "notes.txt",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.device_class, Some(DeviceClass::Mobile));
        assert_eq!(cli.logging.level, LogLevel::Debug);
        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.peer_id, "k2z");
                assert_eq!(args.path, PathBuf::from("notes.txt"));
                assert_eq!(args.wait_secs, 10);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_device_class_is_rejected() {
        assert!(Cli::try_parse_from(["skiff", "--device-class", "toaster", "whoami"]).is_err());
    }
}
