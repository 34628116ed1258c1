use chrono::Utc;
use rdkafka::config::RDKafkaLogLevel;

/// Looks up an environment variable, returning [`None`] when it is unset or unreadable. Read
/// failures are logged rather than propagated since every caller falls back to a default.
pub fn try_read_env(key: impl AsRef<str>) -> Option<String> {
    let key = key.as_ref();

    match std::env::var(key) {
        Ok(value) => Some(value),
        Err(std::env::VarError::NotPresent) => None,
        Err(e) => {
            tracing::warn!("could not read environment variable {}: {}", key, e);
            None
        }
    }
}

/// Reads an environment variable with the given key returning the value as a [`String`]. If no
/// value is present for the environment variable, the given default is returned instead.
pub fn read_env_or(key: impl AsRef<str>, default: String) -> String {
    try_read_env(key).unwrap_or(default)
}

/// Reads an environment variable with the given key and then invokes the given [`FnOnce`] to
/// transform it to a different type. If no value is present for the environment variable, the
/// given default value is returned instead.
pub fn read_env_transformed_or<K, T, V>(key: K, transform: T, default: V) -> V
where
    K: AsRef<str>,
    T: FnOnce(String) -> V,
{
    match try_read_env(key) {
        Some(v) => transform(v),
        None => default,
    }
}

/// Returns the current wall-clock time as epoch milliseconds.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Returns the hostname of the machine the process is running on, falling back to `unknown`
/// when the hostname cannot be resolved as a UTF-8 string.
pub fn host_name() -> String {
    match gethostname::gethostname().into_string() {
        Ok(name) => name,
        Err(_) => {
            tracing::error!("failed to get hostname");
            String::from("unknown")
        }
    }
}

/// Forwards a log line from the native Kafka client library to the tracing subscriber. The
/// client reports syslog severities, which collapse onto four tracing levels. Shared by the
/// consumer and producer client contexts.
pub fn forward_client_log(level: RDKafkaLogLevel, facility: &str, message: &str) {
    let severity = level as i32;

    if severity <= RDKafkaLogLevel::Error as i32 {
        tracing::error!("kafka client [{}] {}", facility, message);
    } else if severity == RDKafkaLogLevel::Warning as i32 {
        tracing::warn!("kafka client [{}] {}", facility, message);
    } else if severity <= RDKafkaLogLevel::Info as i32 {
        tracing::info!("kafka client [{}] {}", facility, message);
    } else {
        tracing::debug!("kafka client [{}] {}", facility, message);
    }
}
