use std::net::IpAddr;

use clap::{Args, Parser, Subcommand};
use reqwest::Url;

use podping_writer_core::podping::{Medium, Reason};
use podping_writer_engine::WriterConfig;

#[derive(Debug, Parser)]
#[command(name = "podping", version, about = "Publish podping notifications to the Hive blockchain")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon: accept IRIs over TCP and publish them in batches.
    Server(ServerArgs),
    /// Publish the given IRIs once and exit.
    Write(WriteArgs),
}

#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Hive account used to publish.
    #[arg(long, env = "PODPING_HIVE_ACCOUNT")]
    pub account: String,

    /// WIF posting key for the account. Repeat or comma-separate for spares.
    #[arg(long = "posting-key", env = "PODPING_HIVE_POSTING_KEY", value_delimiter = ',')]
    pub posting_keys: Vec<String>,

    /// RPC node URLs to use instead of the built-in ring.
    #[arg(long = "node", env = "PODPING_HIVE_NODES", value_delimiter = ',')]
    pub nodes: Vec<Url>,

    /// Medium tag for published notifications.
    #[arg(long, env = "PODPING_MEDIUM", default_value = "podcast", value_parser = parse_medium)]
    pub medium: Medium,

    /// Reason tag for published notifications.
    #[arg(long, env = "PODPING_REASON", default_value = "update", value_parser = parse_reason)]
    pub reason: Reason,

    /// Operation-id prefix.
    #[arg(long, env = "PODPING_OPERATION_ID", default_value = WriterConfig::DEFAULT_OPERATION_ID)]
    pub operation_id: String,

    /// Construct and validate operations without broadcasting.
    #[arg(long, env = "PODPING_DRY_RUN", default_value_t = false)]
    pub dry_run: bool,

    /// Cap publish attempts per batch (default: retry forever).
    #[arg(long, env = "PODPING_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Address the IRI endpoint binds.
    #[arg(long, env = "PODPING_LISTEN_IP", default_value = "127.0.0.1")]
    pub listen_ip: IpAddr,

    /// Port the IRI endpoint binds.
    #[arg(long, env = "PODPING_LISTEN_PORT", default_value_t = WriterConfig::DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Skip the startup resource-credit probe and startup notices.
    #[arg(long, env = "PODPING_NO_RESOURCE_TEST", default_value_t = false)]
    pub no_resource_test: bool,

    /// Disable the periodic status report.
    #[arg(long, env = "PODPING_NO_STATUS", default_value_t = false)]
    pub no_status: bool,
}

#[derive(Debug, Clone, Args)]
pub struct WriteArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// IRIs to publish.
    #[arg(required = true)]
    pub iris: Vec<String>,
}

fn parse_medium(raw: &str) -> Result<Medium, String> {
    raw.parse()
}

fn parse_reason(raw: &str) -> Result<Reason, String> {
    raw.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::try_parse_from([
            "podping",
            "server",
            "--account",
            "podping.test",
            "--posting-key",
            "5HueCGU8rMjxEXxiPuD5BDku4MkFqeZyd4dZ1jvhTVqvbTLvyTJ",
        ])
        .unwrap();
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.listen_port, 9999);
        assert_eq!(args.common.medium, Medium::Podcast);
        assert_eq!(args.common.reason, Reason::Update);
        assert_eq!(args.common.operation_id, "pp");
        assert!(!args.common.dry_run);
        assert!(args.common.max_attempts.is_none());
    }

    #[test]
    fn write_requires_at_least_one_iri() {
        let result = Cli::try_parse_from(["podping", "write", "--account", "podping.test"]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "podping",
            "write",
            "--account",
            "podping.test",
            "--dry-run",
            "--reason",
            "liveEnd",
            "https://example.com/feed.xml",
        ])
        .unwrap();
        let Command::Write(args) = cli.command else {
            panic!("expected write command");
        };
        assert_eq!(args.iris.len(), 1);
        assert_eq!(args.common.reason, Reason::LiveEnd);
        assert!(args.common.dry_run);
    }

    #[test]
    fn bad_medium_is_rejected() {
        let result = Cli::try_parse_from([
            "podping",
            "server",
            "--account",
            "podping.test",
            "--medium",
            "podcasts",
        ]);
        assert!(result.is_err());
    }
}
