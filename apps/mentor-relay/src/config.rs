use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "mentor-relay",
    author,
    version,
    about = "Room relay for two-party mentor calls"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "MENTOR_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Time allowed for close frames to flush during shutdown.
    #[arg(long, env = "MENTOR_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(RelayConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_addr() {
        let cli = Cli::parse_from(["mentor-relay", "--listen-addr", "0.0.0.0:9000"]);
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
    }

    #[test]
    fn rejects_garbage_addr() {
        let cli = Cli::parse_from(["mentor-relay", "--listen-addr", "not-an-addr"]);
        assert!(RelayConfig::try_from(cli).is_err());
    }
}
