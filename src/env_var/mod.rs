use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use crab_relay::{
    AssignStrategies, ClusterMember, ClusterStrategies, Destination, DestinationConfig,
};
use envconfig::Envconfig;

#[derive(Envconfig, Debug)]
pub struct EnvVars {
    #[envconfig(from = "RELAY_LISTEN_IP", default = "0.0.0.0")]
    pub listen_ip: String,

    #[envconfig(from = "RELAY_LISTEN_PORT", default = "2003")]
    pub listen_port: u16,

    #[envconfig(from = "RELAY_USE_UDP", default = "false")]
    pub use_udp: bool,

    #[envconfig(from = "RELAY_UDP_BUFFER_SIZE", default = "65536")]
    pub udp_buffer_size: usize,

    /// Comma separated `host:port[=weight]` list
    #[envconfig(from = "RELAY_DESTINATIONS")]
    pub destinations: String,

    #[envconfig(from = "RELAY_CLUSTER_NAME", default = "default")]
    pub cluster_name: String,

    #[envconfig(from = "RELAY_CLUSTER_STRATEGY", default = "consistent-hash")]
    pub cluster_strategy: ClusterStrategies,

    #[envconfig(from = "RELAY_REPLICATION_FACTOR", default = "1")]
    pub replication_factor: usize,

    #[envconfig(from = "RELAY_WORKERS", default = "16")]
    pub workers: usize,

    #[envconfig(from = "RELAY_ASSIGN_STRATEGY", default = "round-robin")]
    pub assign_strategy: AssignStrategies,

    #[envconfig(from = "RELAY_MAX_LINE_LENGTH", default = "8192")]
    pub max_line_length: usize,

    #[envconfig(from = "RELAY_QUEUE_CAPACITY", default = "25000")]
    pub queue_capacity: usize,

    #[envconfig(from = "RELAY_BATCH_SIZE", default = "2500")]
    pub batch_size: usize,

    #[envconfig(from = "RELAY_FLUSH_INTERVAL_MS", default = "50")]
    pub flush_interval_ms: u64,

    #[envconfig(from = "RELAY_BACKOFF_CEILING_MS", default = "10000")]
    pub backoff_ceiling_ms: u64,

    #[envconfig(from = "RELAY_SHUTDOWN_GRACE_MS", default = "5000")]
    pub shutdown_grace_ms: u64,

    #[envconfig(from = "RELAY_STATS_INTERVAL", default = "60")]
    pub stats_interval: u64,

    /// Empty means `carbon.relays.<hostname>`, `none` disables self metrics
    #[envconfig(from = "RELAY_SELF_METRICS_PREFIX", default = "")]
    pub self_metrics_prefix: String,

    #[envconfig(from = "RELAY_WORKER_THREADS", default = "0")]
    pub worker_threads: usize,
}

pub fn load_env_var() -> Result<EnvVars> {
    EnvVars::init_from_env().context("Invalid relay configuration")
}

/// Prefix of the relay's own metrics, or `None` when they are disabled.
pub fn self_metrics_prefix(configured: &str) -> Option<String> {
    let hostname = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "127.0.0.1".to_owned());
    resolve_prefix(configured, &hostname)
}

fn resolve_prefix(configured: &str, hostname: &str) -> Option<String> {
    match configured.trim() {
        "" => Some(format!("carbon.relays.{}", hostname.replace('.', "_"))),
        "none" => None,
        prefix => Some(prefix.to_owned()),
    }
}

/// Parse `host:port[=weight]` entries into cluster members sharing `config`.
pub fn parse_destinations(list: &str, config: &DestinationConfig) -> Result<Vec<ClusterMember>> {
    let members = list
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (address, weight) = match entry.split_once('=') {
                Some((address, weight)) => {
                    let weight = weight
                        .trim()
                        .parse()
                        .with_context(|| format!("Invalid weight in {entry}"))?;
                    (address.trim(), weight)
                }
                None => (entry, 1),
            };

            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("Destination {address} is not host:port"))?;
            if host.is_empty() {
                return Err(anyhow!("Destination {address} has no host"));
            }
            port.parse::<u16>()
                .with_context(|| format!("Invalid port in {address}"))?;

            let destination: Arc<Destination> = Destination::new(address, config.clone());
            Ok(ClusterMember::new(destination, weight))
        })
        .collect::<Result<Vec<_>>>()?;

    if members.is_empty() {
        return Err(anyhow!("RELAY_DESTINATIONS lists no destination"));
    }
    Ok(members)
}

#[cfg(test)]
mod env_var_tests {
    use std::collections::HashMap;

    use crab_relay::{ClusterStrategies, DestinationConfig};
    use envconfig::Envconfig;

    use crate::env_var::{parse_destinations, resolve_prefix, EnvVars};

    #[test]
    fn test_defaults() {
        let env = HashMap::from([(
            "RELAY_DESTINATIONS".to_owned(),
            "127.0.0.1:2103".to_owned(),
        )]);
        let vars = EnvVars::init_from_hashmap(&env).unwrap();

        assert_eq!(vars.listen_port, 2003);
        assert_eq!(vars.workers, 16);
        assert_eq!(vars.cluster_strategy, ClusterStrategies::ConsistentHash);
        assert!(vars.self_metrics_prefix.is_empty());

        assert!(EnvVars::init_from_hashmap(&HashMap::new()).is_err());
    }

    #[test]
    fn test_parse_destinations() {
        let config = DestinationConfig::default();
        let members =
            parse_destinations(" 10.0.0.1:2003, backend.local:2004=3 ,", &config).unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].destination().address(), "10.0.0.1:2003");
        assert_eq!(members[0].weight(), 1);
        assert_eq!(members[1].destination().id().as_str(), "backend.local:2004");
        assert_eq!(members[1].weight(), 3);

        assert!(parse_destinations("", &config).is_err());
        assert!(parse_destinations("10.0.0.1", &config).is_err());
        assert!(parse_destinations("10.0.0.1:http", &config).is_err());
        assert!(parse_destinations("10.0.0.1:2003=heavy", &config).is_err());
    }

    #[test]
    fn test_self_metrics_prefix() {
        assert_eq!(
            resolve_prefix("", "graphite01.example.org").as_deref(),
            Some("carbon.relays.graphite01_example_org")
        );
        assert_eq!(
            resolve_prefix(" relay.eu ", "ignored").as_deref(),
            Some("relay.eu")
        );
        assert_eq!(resolve_prefix("none", "graphite01"), None);
    }
}
