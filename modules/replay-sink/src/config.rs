use std::env;
use std::time::Duration;

/// Errors raised while reading configuration from the environment
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Which durable stream implementation to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

/// Which event store implementation to write to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    ClickHouse,
    InMemory,
}

/// ClickHouse connection and schema settings
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub table: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Rows older than this are expired by the table TTL
    pub retention_days: u32,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            table: "events_rrweb".to_string(),
            user: None,
            password: None,
            retention_days: 90,
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub nats_url: String,
    pub stream_name: String,
    pub subject: String,
    pub durable_name: String,
    /// Empty disables dead-lettering: poison messages are acked and dropped
    pub dlq_subject: Option<String>,
    pub dlq_stream: String,
    pub stream_max_age: Duration,
    pub max_ack_pending: i64,
    pub ack_wait: Duration,

    pub fetch_batch: usize,
    pub fetch_timeout: Duration,
    pub idle_backoff: Duration,
    pub nak_delay: Duration,
    pub worker_count: usize,

    pub store_type: StoreType,
    pub clickhouse: ClickHouseConfig,

    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bus_type = match var("BUS_TYPE", "nats").to_lowercase().as_str() {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                return Err(invalid("BUS_TYPE", other, "must be 'nats' or 'inmemory'"));
            }
        };

        let store_type = match var("STORE_TYPE", "clickhouse").to_lowercase().as_str() {
            "clickhouse" => StoreType::ClickHouse,
            "inmemory" => StoreType::InMemory,
            other => {
                return Err(invalid("STORE_TYPE", other, "must be 'clickhouse' or 'inmemory'"));
            }
        };

        let dlq_subject = var("NATS_DLQ_SUBJECT", "events.rrweb.dlq");
        let dlq_subject = if dlq_subject.trim().is_empty() {
            None
        } else {
            Some(dlq_subject)
        };

        let max_ack_pending: i64 = parse(&lookup, "MAX_ACK_PENDING", "1000")?;
        if max_ack_pending < 1 {
            return Err(invalid(
                "MAX_ACK_PENDING",
                &max_ack_pending.to_string(),
                "must be at least 1",
            ));
        }

        let worker_count: usize = parse(&lookup, "WORKER_COUNT", "4")?;
        if worker_count == 0 {
            return Err(invalid("WORKER_COUNT", "0", "must be at least 1"));
        }

        let fetch_batch: usize = parse(&lookup, "FETCH_BATCH", "100")?;
        if fetch_batch == 0 {
            return Err(invalid("FETCH_BATCH", "0", "must be at least 1"));
        }

        let clickhouse = ClickHouseConfig {
            url: var("CH_URL", "http://localhost:8123"),
            database: identifier("CH_DB", var("CH_DB", "default"))?,
            table: identifier("CH_TABLE", var("CH_TABLE", "events_rrweb"))?,
            user: lookup("CH_USER").filter(|v| !v.is_empty()),
            password: lookup("CH_PASSWORD").filter(|v| !v.is_empty()),
            retention_days: parse(&lookup, "RETENTION_DAYS", "90")?,
        };

        Ok(Config {
            bus_type,
            nats_url: var("NATS_URL", "nats://localhost:4222"),
            stream_name: var("NATS_STREAM", "EVENTS"),
            subject: var("NATS_SUBJECT", "events.rrweb"),
            durable_name: var("NATS_DURABLE", "rrhog-workers"),
            dlq_subject,
            dlq_stream: var("NATS_DLQ_STREAM", "EVENTS_DLQ"),
            stream_max_age: Duration::from_secs(
                60 * 60 * 24 * parse::<u64, _>(&lookup, "STREAM_MAX_AGE_DAYS", "14")?,
            ),
            max_ack_pending,
            ack_wait: Duration::from_secs(parse(&lookup, "ACK_WAIT_SECS", "30")?),
            fetch_batch,
            fetch_timeout: Duration::from_millis(parse(&lookup, "FETCH_TIMEOUT_MS", "1000")?),
            idle_backoff: Duration::from_millis(parse(&lookup, "IDLE_BACKOFF_MS", "250")?),
            nak_delay: Duration::from_millis(parse(&lookup, "NAK_DELAY_MS", "1000")?),
            worker_count,
            store_type,
            clickhouse,
            host: var("HOST", "0.0.0.0"),
            port: parse(&lookup, "PORT", "8091")?,
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T, F>(lookup: &F, var: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, &raw, &e.to_string()))
}

/// Database and table names are interpolated into DDL, so keep them to plain identifiers
fn identifier(var: &'static str, value: String) -> Result<String, ConfigError> {
    let valid = !value.is_empty()
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(value)
    } else {
        Err(invalid(var, &value, "must contain only letters, digits and '_'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.bus_type, BusType::Nats);
        assert_eq!(config.store_type, StoreType::ClickHouse);
        assert_eq!(config.stream_name, "EVENTS");
        assert_eq!(config.subject, "events.rrweb");
        assert_eq!(config.durable_name, "rrhog-workers");
        assert_eq!(config.dlq_subject.as_deref(), Some("events.rrweb.dlq"));
        assert_eq!(config.max_ack_pending, 1000);
        assert_eq!(config.ack_wait, Duration::from_secs(30));
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.clickhouse.table, "events_rrweb");
        assert_eq!(config.clickhouse.retention_days, 90);
        assert_eq!(config.port, 8091);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("BUS_TYPE", "InMemory"),
            ("STORE_TYPE", "inmemory"),
            ("NATS_SUBJECT", "replay.batches"),
            ("WORKER_COUNT", "8"),
            ("FETCH_TIMEOUT_MS", "250"),
            ("CH_DB", "replay"),
            ("CH_USER", "sink"),
            ("RETENTION_DAYS", "30"),
        ])
        .unwrap();

        assert_eq!(config.bus_type, BusType::InMemory);
        assert_eq!(config.store_type, StoreType::InMemory);
        assert_eq!(config.subject, "replay.batches");
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.fetch_timeout, Duration::from_millis(250));
        assert_eq!(config.clickhouse.database, "replay");
        assert_eq!(config.clickhouse.user.as_deref(), Some("sink"));
        assert!(config.clickhouse.password.is_none());
        assert_eq!(config.clickhouse.retention_days, 30);
    }

    #[test]
    fn test_empty_dlq_subject_disables_dead_lettering() {
        let config = config_from(&[("NATS_DLQ_SUBJECT", "")]).unwrap();
        assert!(config.dlq_subject.is_none());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(config_from(&[("BUS_TYPE", "kafka")]).is_err());
        assert!(config_from(&[("PORT", "not-a-port")]).is_err());
        assert!(config_from(&[("WORKER_COUNT", "0")]).is_err());
        assert!(config_from(&[("MAX_ACK_PENDING", "0")]).is_err());
        assert!(config_from(&[("CH_TABLE", "events; DROP TABLE x")]).is_err());
        assert!(config_from(&[("CH_DB", "1db")]).is_err());
    }
}
