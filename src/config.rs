use anyhow::Context;
use config::{Config as ConfigRs, ConfigError, Environment, File, Map, Source, Value};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::File as FsFile, io::BufReader, time::Duration};

/// Serde helpers for [`Duration`] fields expressed as integer milliseconds on the wire.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes the duration as its whole number of milliseconds.
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    /// Deserializes a duration from an integer number of milliseconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;

        Ok(Duration::from_millis(millis))
    }
}

/// Where consumption starts on a partition that has no committed offset and no explicit start
/// position.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPolicy {
    /// Start from the earliest retained offset. The default for mirror workloads.
    #[default]
    Earliest,
    /// Start from the log end.
    Latest,
}

/// Configuration values that drive the behavior of a single datastream task.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    /// Period between soft offset commits. Also determines the poll timeout, which is half of
    /// this interval.
    #[serde(with = "duration_ms")]
    pub offset_commit_interval: Duration,
    /// Delay between attempts to send the same record.
    #[serde(with = "duration_ms")]
    pub retry_sleep: Duration,
    /// Maximum number of send attempts per record before the partition is recovered.
    pub max_retry_count: u32,
    /// Whether a partition that exhausted its send retries is auto-paused.
    pub pause_partition_on_error: bool,
    /// How long a partition paused for a send error stays paused.
    #[serde(with = "duration_ms")]
    pub pause_error_duration: Duration,
    /// Threshold above which batch processing time is logged and metered as slow.
    #[serde(with = "duration_ms")]
    pub processing_delay_threshold: Duration,
    /// Enables flushless checkpointing: the producer is not flushed between polls and commits
    /// rely on the in-flight tracker's safe offsets.
    pub flushless_mode: bool,
    /// Enables in-flight flow control. Requires flushless mode.
    pub flow_control_enabled: bool,
    /// In-flight message count above which a partition is auto-paused.
    pub max_in_flight_messages_threshold: usize,
    /// In-flight message count at or below which an auto-paused partition resumes.
    pub min_in_flight_messages_threshold: usize,
    /// Maximum number of records returned by a single poll.
    pub max_poll_records: usize,
    /// Reset policy applied when a partition has no committed offset and no start position.
    pub reset_policy: ResetPolicy,
}

impl Default for TaskConfig {
    /// Returns the documented defaults for every task-level key.
    fn default() -> Self {
        Self {
            offset_commit_interval: Duration::from_secs(60),
            retry_sleep: Duration::from_secs(5),
            max_retry_count: 5,
            pause_partition_on_error: true,
            pause_error_duration: Duration::from_secs(600),
            processing_delay_threshold: Duration::from_secs(60),
            flushless_mode: false,
            flow_control_enabled: false,
            max_in_flight_messages_threshold: 5000,
            min_in_flight_messages_threshold: 1000,
            max_poll_records: 500,
            reset_policy: ResetPolicy::Earliest,
        }
    }
}

impl TaskConfig {
    /// Returns the poll timeout for the task loop: half the offset commit interval.
    pub fn poll_timeout(&self) -> Duration {
        self.offset_commit_interval / 2
    }
}

/// Configuration values that drive the behavior of the task supervisor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    /// Cadence of the supervisor liveness check.
    #[serde(with = "duration_ms")]
    pub daemon_interval: Duration,
    /// Maximum silence (time since the last poll) before a task is considered dead.
    #[serde(with = "duration_ms")]
    pub non_good_state_threshold: Duration,
    /// Grace period a task is given to stop cleanly before its thread is abandoned.
    #[serde(with = "duration_ms")]
    pub cancel_task_timeout: Duration,
}

impl Default for SupervisorConfig {
    /// Returns the documented defaults for every supervisor-level key.
    fn default() -> Self {
        Self {
            daemon_interval: Duration::from_secs(300),
            non_good_state_threshold: Duration::from_secs(600),
            cancel_task_timeout: Duration::from_secs(30),
        }
    }
}

/// Default address the diagnostics endpoints listen on.
const DEFAULT_DIAGNOSTICS_ADDR: &str = "127.0.0.1:7070";

/// Default connector name tasks are registered under.
const DEFAULT_CONNECTOR: &str = "kafkaMirror";

/// Top-level configuration for the application.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Path to the JSON file containing the datastream definitions to run.
    pub datastreams: String,
    /// Name of the connector the tasks run under.
    pub connector: String,
    /// Address the diagnostics HTTP endpoints listen on.
    pub diagnostics_addr: String,
    /// Path to a properties file with additional configuration for source consumers.
    pub consumer_properties: Option<String>,
    /// Path to a properties file with additional configuration for destination producers.
    pub producer_properties: Option<String>,
    /// Task-level configuration.
    #[serde(default)]
    pub task: TaskConfig,
    /// Supervisor-level configuration.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl AppConfig {
    /// Initializes the application configuration by layering sources.
    ///
    /// Configuration precedence is applied as follows where 1 is the highest:
    ///
    /// 1. CLI arguments
    /// 2. Config file, if one is specified
    /// 3. Environment variables
    /// 4. Default values
    pub fn new<S>(config_file: Option<&str>, cli_args: S) -> anyhow::Result<Self>
    where
        S: Source + Send + Sync + 'static,
    {
        let mut builder = ConfigRs::builder()
            .add_source(Defaults)
            .add_source(Environment::with_prefix("KAFMIRROR").separator("_"));

        if let Some(path) = config_file {
            builder = builder.add_source(File::with_name(path));
        }

        let config = builder
            .add_source(cli_args)
            .build()
            .context("create AppConfig from sources")?;

        config.try_deserialize().context("deserialize AppConfig")
    }
}

/// Empty struct that implements the [`Source`] trait to integrate the global application default
/// values into the configuration resolution.
#[derive(Debug)]
struct Defaults;

impl Source for Defaults {
    /// Clones the [`Source`] and lifts it into a [`Box`].
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(Defaults)
    }
    /// Collect all configuration properties available from this source into a [`Map`].
    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut cfg = Map::new();

        cfg.insert(
            String::from("connector"),
            Value::from(String::from(DEFAULT_CONNECTOR)),
        );

        cfg.insert(
            String::from("diagnosticsAddr"),
            Value::from(String::from(DEFAULT_DIAGNOSTICS_ADDR)),
        );

        Ok(cfg)
    }
}

/// Reads a Java-style `.properties` file into a map, as used for passthrough source consumer and
/// destination producer client configuration.
pub fn load_properties(path: impl AsRef<str>) -> anyhow::Result<HashMap<String, String>> {
    let file = FsFile::open(path.as_ref())
        .with_context(|| format!("open properties file {}", path.as_ref()))?;

    java_properties::read(BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("failed to read properties file {}: {}", path.as_ref(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_config_defaults_match_documentation() {
        let config = TaskConfig::default();

        assert_eq!(config.offset_commit_interval, Duration::from_secs(60));
        assert_eq!(config.retry_sleep, Duration::from_secs(5));
        assert_eq!(config.max_retry_count, 5);
        assert!(config.pause_partition_on_error);
        assert_eq!(config.pause_error_duration, Duration::from_secs(600));
        assert_eq!(config.processing_delay_threshold, Duration::from_secs(60));
        assert!(!config.flushless_mode);
        assert!(!config.flow_control_enabled);
        assert_eq!(config.max_in_flight_messages_threshold, 5000);
        assert_eq!(config.min_in_flight_messages_threshold, 1000);
        assert_eq!(config.reset_policy, ResetPolicy::Earliest);
    }

    #[test]
    fn poll_timeout_is_half_the_commit_interval() {
        let config = TaskConfig {
            offset_commit_interval: Duration::from_secs(30),
            ..TaskConfig::default()
        };

        assert_eq!(config.poll_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn task_config_deserializes_camel_case_keys() {
        let config: TaskConfig = serde_json::from_str(
            r#"{
                "offsetCommitInterval": 30000,
                "maxRetryCount": 2,
                "flushlessMode": true,
                "flowControlEnabled": true,
                "maxInFlightMessagesThreshold": 100,
                "minInFlightMessagesThreshold": 10
            }"#,
        )
        .unwrap();

        assert_eq!(config.offset_commit_interval, Duration::from_secs(30));
        assert_eq!(config.max_retry_count, 2);
        assert!(config.flushless_mode);
        assert!(config.flow_control_enabled);
        assert_eq!(config.max_in_flight_messages_threshold, 100);
        assert_eq!(config.min_in_flight_messages_threshold, 10);
        assert_eq!(config.retry_sleep, Duration::from_secs(5));
    }

    #[test]
    fn supervisor_config_defaults_match_documentation() {
        let config = SupervisorConfig::default();

        assert_eq!(config.daemon_interval, Duration::from_secs(300));
        assert_eq!(config.non_good_state_threshold, Duration::from_secs(600));
        assert_eq!(config.cancel_task_timeout, Duration::from_secs(30));
    }
}
