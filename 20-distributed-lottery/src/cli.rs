use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    bet::AgencyId,
    client::{default_dataset, ClientConfig},
    server::ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Default log filter; RUST_LOG takes precedence when set.
    #[arg(long, global = true, env = "LOGGING_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the lottery server that collects bets from every agency.
    Server(ServerArgs),
    /// Submit one agency's bets and wait for its winners.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "SERVER_LISTEN", default_value = "0.0.0.0:12345")]
    pub listen: String,

    /// Number of agencies taking part; the draw waits for all of them.
    #[arg(long, env = "SERVER_AGENCIES", default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub agencies: AgencyId,

    #[arg(long, env = "SERVER_WINNING_NUMBER", default_value_t = 7574)]
    pub winning_number: u32,

    /// File the bets are appended to.
    #[arg(long, env = "SERVER_LEDGER", default_value = "./bets.csv")]
    pub ledger: PathBuf,

    /// How long a new connection may take to introduce itself.
    #[arg(long, env = "SERVER_HELLO_TIMEOUT_MS", default_value_t = 5000)]
    pub hello_timeout_ms: u64,

    /// How long open connections get to close on shutdown before they are aborted.
    #[arg(long, env = "SERVER_SHUTDOWN_GRACE_MS", default_value_t = 5000)]
    pub shutdown_grace_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Agency number, starting at 1.
    #[arg(long, env = "CLI_ID", value_parser = clap::value_parser!(u32).range(1..))]
    pub id: AgencyId,

    /// Address of the lottery server.
    #[arg(long, env = "CLI_SERVER_ADDRESS", default_value = "127.0.0.1:12345")]
    pub server: String,

    /// Most bets sent in a single batch.
    #[arg(long, env = "CLI_BATCH_MAXAMOUNT", default_value_t = 100,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_max_amount: u32,

    /// Pause between batches.
    #[arg(long, env = "CLI_BATCH_PERIOD_MS", default_value_t = 0)]
    pub batch_period_ms: u64,

    /// How often the client checks for shutdown while waiting on the server.
    #[arg(long, env = "CLI_POLL_INTERVAL_MS", default_value_t = 500,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval_ms: u64,

    /// Bets to submit; defaults to ./.data/agency-<id>.csv.
    #[arg(long, env = "CLI_DATASET")]
    pub dataset: Option<PathBuf>,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            listen: args.listen,
            agencies: args.agencies,
            winning_number: args.winning_number,
            ledger: args.ledger,
            hello_timeout: Duration::from_millis(args.hello_timeout_ms),
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
        }
    }
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        Self {
            agency: args.id,
            server: args.server,
            max_batch_size: args.batch_max_amount,
            batch_period: Duration::from_millis(args.batch_period_ms),
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            dataset: args.dataset.unwrap_or_else(|| default_dataset(args.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn client_defaults_follow_agency_id() {
        let cli = Cli::try_parse_from(["distributed-lottery", "client", "--id", "3"]).expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        let config = ClientConfig::from(args);

        assert_eq!(config.agency, 3);
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.dataset, PathBuf::from("./.data/agency-3.csv"));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn agency_zero_is_rejected() {
        let parsed = Cli::try_parse_from(["distributed-lottery", "client", "--id", "0"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["distributed-lottery", "server", "--agencies", "0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn server_flags_map_onto_config() {
        let cli = Cli::try_parse_from([
            "distributed-lottery",
            "--log-level",
            "debug",
            "server",
            "--listen",
            "127.0.0.1:0",
            "--agencies",
            "2",
            "--winning-number",
            "12",
            "--hello-timeout-ms",
            "250",
        ])
        .expect("parse");
        assert_eq!(cli.log_level, "debug");

        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        let config = ServerConfig::from(args);
        assert_eq!(config.listen, "127.0.0.1:0");
        assert_eq!(config.agencies, 2);
        assert_eq!(config.winning_number, 12);
        assert_eq!(config.hello_timeout, Duration::from_millis(250));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }
}
