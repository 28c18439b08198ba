//! Worker configuration

use crate::backoff::Backoff;
use crate::source::DEFAULT_CLAIM_IDLE;
use core_config::{env_or_default, env_optional, env_parse_or, ConfigError, FromEnv};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Which Redis structure holds the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueKind {
    /// Plain list, `BLMOVE` into a processing list
    #[default]
    List,
    /// Stream read through a consumer group
    Stream,
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "list" => Ok(QueueKind::List),
            "stream" => Ok(QueueKind::Stream),
            other => Err(format!("expected 'list' or 'stream', got '{other}'")),
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::List => f.write_str("list"),
            QueueKind::Stream => f.write_str("stream"),
        }
    }
}

/// Configuration for the processing loop and its job source
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// List or stream name
    pub queue_name: String,

    pub queue_kind: QueueKind,

    /// Consumer group (stream sources only)
    pub consumer_group: String,

    /// Unique consumer name; keys the processing list / pending entries
    pub consumer_name: String,

    /// How long one fetch may block
    pub fetch_timeout: Duration,

    /// Failed attempts before an item is dead-lettered
    pub max_retries: u32,

    /// Consecutive failed reconnect cycles before the worker gives up
    pub max_fault_cycles: u32,

    /// Time an in-flight item gets to finish after shutdown is requested
    pub grace_period: Duration,

    /// Reconnect policy
    pub reconnect: Backoff,

    /// Bound on one health probe
    pub probe_timeout: Duration,

    /// Idle time after which another consumer's unsettled items are claimed.
    /// Also the interval between recovery sweeps.
    pub claim_idle: Duration,
}

impl WorkerConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();

        Self {
            consumer_group: format!("{queue_name}:group"),
            queue_name,
            queue_kind: QueueKind::List,
            consumer_name: format!("worker-{}", Uuid::new_v4()),
            fetch_timeout: Duration::from_secs(5),
            max_retries: 3,
            max_fault_cycles: 3,
            grace_period: Duration::from_secs(10),
            reconnect: Backoff::default(),
            probe_timeout: Duration::from_secs(2),
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }

    pub fn with_queue_kind(mut self, kind: QueueKind) -> Self {
        self.queue_kind = kind;
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_fault_cycles(mut self, cycles: u32) -> Self {
        self.max_fault_cycles = cycles;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_reconnect(mut self, backoff: Backoff) -> Self {
        self.reconnect = backoff;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("processing_queue")
    }
}

impl FromEnv for WorkerConfig {
    /// - QUEUE_NAME: defaults to `processing_queue`
    /// - QUEUE_KIND: `list` (default) or `stream`
    /// - CONSUMER_GROUP: defaults to `<queue>:group`
    /// - CONSUMER_NAME: defaults to `$HOSTNAME`, else `worker-<uuid>`
    /// - FETCH_TIMEOUT_SECS: defaults to 5
    /// - MAX_RETRIES: defaults to 3
    /// - SHUTDOWN_GRACE_SECS: defaults to 10
    /// - CLAIM_IDLE_SECS: defaults to 300
    fn from_env() -> Result<Self, ConfigError> {
        let queue_name = env_or_default("QUEUE_NAME", "processing_queue");
        let mut config = Self::new(queue_name);

        config.queue_kind = env_parse_or("QUEUE_KIND", QueueKind::List)?;
        if let Some(group) = env_optional("CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        if let Some(name) = env_optional("CONSUMER_NAME").or_else(|| env_optional("HOSTNAME")) {
            config.consumer_name = name;
        }
        config.fetch_timeout = Duration::from_secs(env_parse_or("FETCH_TIMEOUT_SECS", 5)?);
        config.max_retries = env_parse_or("MAX_RETRIES", 3)?;
        config.reconnect.max_retries = config.max_retries;
        config.grace_period = Duration::from_secs(env_parse_or("SHUTDOWN_GRACE_SECS", 10)?);
        config.claim_idle = Duration::from_secs(env_parse_or("CLAIM_IDLE_SECS", DEFAULT_CLAIM_IDLE.as_secs())?);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 9] = [
        "QUEUE_NAME",
        "QUEUE_KIND",
        "CONSUMER_GROUP",
        "CONSUMER_NAME",
        "HOSTNAME",
        "FETCH_TIMEOUT_SECS",
        "MAX_RETRIES",
        "SHUTDOWN_GRACE_SECS",
        "CLAIM_IDLE_SECS",
    ];

    #[test]
    fn test_queue_kind_parse() {
        assert_eq!("list".parse::<QueueKind>().unwrap(), QueueKind::List);
        assert_eq!("STREAM".parse::<QueueKind>().unwrap(), QueueKind::Stream);
        assert!("pubsub".parse::<QueueKind>().is_err());
        assert_eq!(QueueKind::Stream.to_string(), "stream");
    }

    #[test]
    fn test_defaults_from_env() {
        temp_env::with_vars_unset(VARS, || {
            let config = WorkerConfig::from_env().unwrap();

            assert_eq!(config.queue_name, "processing_queue");
            assert_eq!(config.queue_kind, QueueKind::List);
            assert_eq!(config.consumer_group, "processing_queue:group");
            assert!(config.consumer_name.starts_with("worker-"));
            assert_eq!(config.fetch_timeout, Duration::from_secs(5));
            assert_eq!(config.max_retries, 3);
            assert_eq!(config.max_fault_cycles, 3);
            assert_eq!(config.grace_period, Duration::from_secs(10));
            assert_eq!(config.reconnect, Backoff::default());
            assert_eq!(config.probe_timeout, Duration::from_secs(2));
            assert_eq!(config.claim_idle, Duration::from_secs(300));
        });
    }

    #[test]
    fn test_overrides_from_env() {
        temp_env::with_vars(
            [
                ("QUEUE_NAME", Some("jobs")),
                ("QUEUE_KIND", Some("stream")),
                ("CONSUMER_GROUP", None),
                ("CONSUMER_NAME", None),
                ("HOSTNAME", Some("pod-7")),
                ("FETCH_TIMEOUT_SECS", Some("1")),
                ("MAX_RETRIES", Some("5")),
                ("SHUTDOWN_GRACE_SECS", Some("30")),
                ("CLAIM_IDLE_SECS", Some("60")),
            ],
            || {
                let config = WorkerConfig::from_env().unwrap();

                assert_eq!(config.queue_name, "jobs");
                assert_eq!(config.queue_kind, QueueKind::Stream);
                assert_eq!(config.consumer_group, "jobs:group");
                assert_eq!(config.consumer_name, "pod-7");
                assert_eq!(config.fetch_timeout, Duration::from_secs(1));
                assert_eq!(config.max_retries, 5);
                assert_eq!(config.reconnect.max_retries, 5);
                assert_eq!(config.grace_period, Duration::from_secs(30));
                assert_eq!(config.claim_idle, Duration::from_secs(60));
            },
        );
    }

    #[test]
    fn test_invalid_values() {
        temp_env::with_vars([("QUEUE_KIND", Some("kafka")), ("MAX_RETRIES", None)], || {
            let err = WorkerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("QUEUE_KIND"));
        });

        temp_env::with_vars([("QUEUE_KIND", None), ("MAX_RETRIES", Some("-1"))], || {
            assert!(WorkerConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_builder() {
        let config = WorkerConfig::new("jobs")
            .with_consumer_name("c1")
            .with_max_retries(1)
            .with_grace_period(Duration::from_millis(50));

        assert_eq!(config.consumer_name, "c1");
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.grace_period, Duration::from_millis(50));
    }
}
