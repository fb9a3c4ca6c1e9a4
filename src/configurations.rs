//! Parses the configuration record handed to a replica's entry point: a
//! single `key:value` argument string listing `my_addr`, `my_paxos`,
//! `fail_rate`, and one or more `replica` entries.
//!
//! Uses plain `std::env::args()` plus manual `.parse()` calls, no
//! CLI-parsing crate -- the same style used elsewhere in this crate for
//! its entry points, generalized here from positional arguments to a
//! `key:value` record -- a format `config`/`toml` can't express directly,
//! since a repeated key (`replica`) has no native TOML representation.

use std::fmt;
use std::net::SocketAddr;

/// Errors produced while parsing a `key:value` configuration record.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MissingField(&'static str),
    MalformedEntry(String),
    UnknownKey(String),
    InvalidAddress { key: String, value: String },
    InvalidFailRate(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingField(field) => write!(f, "missing required field `{}`", field),
            ConfigError::MalformedEntry(entry) => write!(f, "malformed entry `{}`, expected key:value", entry),
            ConfigError::UnknownKey(key) => write!(f, "unknown configuration key `{}`", key),
            ConfigError::InvalidAddress { key, value } => {
                write!(f, "invalid address for `{}`: `{}`", key, value)
            }
            ConfigError::InvalidFailRate(value) => write!(f, "invalid fail_rate `{}`", value),
        }
    }
}

impl std::error::Error for ConfigError {}

/// The configuration record a replica is started with.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Address this replica's KV Front-End listens on.
    pub my_addr: SocketAddr,
    /// Address this replica's Replication Service listens on -- the
    /// address other replicas know it by in the peer set.
    pub my_paxos: SocketAddr,
    /// Probability in `[0, 1]` that an acceptor randomly rejects a
    /// non-`"coordinator"` Prepare/Propose. Defaults to 0.0 if absent.
    pub fail_rate: f64,
    /// The full replica set, including this replica's own `my_paxos`
    /// address.
    pub replicas: Vec<SocketAddr>,
}

impl ReplicaConfig {
    /// Parses a whitespace-separated sequence of `key:value` tokens.
    /// Addresses keep their own colon (`host:port`): only the first colon
    /// in a token separates the key from the value.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut my_addr = None;
        let mut my_paxos = None;
        let mut fail_rate = 0.0;
        let mut replicas = Vec::new();

        for token in input.split_whitespace() {
            let mut parts = token.splitn(2, ':');
            let key = parts.next().unwrap_or("");
            let value = parts
                .next()
                .ok_or_else(|| ConfigError::MalformedEntry(token.to_string()))?;

            match key {
                "my_addr" => my_addr = Some(parse_addr(key, value)?),
                "my_paxos" => my_paxos = Some(parse_addr(key, value)?),
                "fail_rate" => {
                    fail_rate = value
                        .parse::<f64>()
                        .map_err(|_| ConfigError::InvalidFailRate(value.to_string()))?;
                }
                "replica" => replicas.push(parse_addr(key, value)?),
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
        }

        let my_addr = my_addr.ok_or(ConfigError::MissingField("my_addr"))?;
        let my_paxos = my_paxos.ok_or(ConfigError::MissingField("my_paxos"))?;
        if replicas.is_empty() {
            return Err(ConfigError::MissingField("replica"));
        }

        Ok(ReplicaConfig {
            my_addr,
            my_paxos,
            fail_rate,
            replicas,
        })
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_record() {
        let config = ReplicaConfig::parse(
            "my_addr:127.0.0.1:8001 my_paxos:127.0.0.1:9001 fail_rate:0.2 \
             replica:127.0.0.1:9001 replica:127.0.0.1:9002",
        )
        .unwrap();
        assert_eq!(config.my_addr, "127.0.0.1:8001".parse().unwrap());
        assert_eq!(config.my_paxos, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.fail_rate, 0.2);
        assert_eq!(config.replicas.len(), 2);
    }

    #[test]
    fn fail_rate_defaults_to_zero() {
        let config = ReplicaConfig::parse(
            "my_addr:127.0.0.1:8001 my_paxos:127.0.0.1:9001 replica:127.0.0.1:9001",
        )
        .unwrap();
        assert_eq!(config.fail_rate, 0.0);
    }

    #[test]
    fn rejects_missing_required_fields() {
        assert_eq!(
            ReplicaConfig::parse("my_paxos:127.0.0.1:9001 replica:127.0.0.1:9001"),
            Err(ConfigError::MissingField("my_addr"))
        );
        assert_eq!(
            ReplicaConfig::parse("my_addr:127.0.0.1:8001 my_paxos:127.0.0.1:9001"),
            Err(ConfigError::MissingField("replica"))
        );
    }

    #[test]
    fn rejects_malformed_and_unknown_entries() {
        assert!(matches!(
            ReplicaConfig::parse("my_addr"),
            Err(ConfigError::MalformedEntry(_))
        ));
        assert!(matches!(
            ReplicaConfig::parse("my_addr:127.0.0.1:8001 my_paxos:127.0.0.1:9001 replica:127.0.0.1:9001 bogus:1"),
            Err(ConfigError::UnknownKey(_))
        ));
    }
}
