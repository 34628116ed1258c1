use serde::{Deserialize, Serialize, de::Error as _};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Metadata key holding the operator-configured paused source partitions as a JSON object of
/// `{topic: [partitionId | "*"]}`.
pub const PAUSED_SOURCE_PARTITIONS: &str = "pausedSourcePartitions";

/// Metadata key holding the start positions as a JSON object of `{partitionId: offset}`. Used
/// when a partition has no committed offset.
pub const START_POSITION: &str = "startPosition";

/// Metadata key overriding the derived consumer group identifier.
pub const GROUP_ID: &str = "groupId";

/// Metadata key enabling identity partitioning, i.e. the destination partition for a record is
/// the same as its source partition.
pub const IDENTITY_PARTITIONING: &str = "identityPartitioning";

/// Placeholder in a destination connection string that is substituted with the origin topic of
/// each record.
pub const TOPIC_PLACEHOLDER: &str = "%s";

/// Error raised when operator-provided datastream state fails validation. The previous state is
/// kept when this is returned.
#[derive(Debug, Error)]
pub enum ControlError {
    /// A recognized metadata entry did not parse as its expected JSON shape.
    #[error("invalid {key} metadata: {source}")]
    InvalidMetadata {
        /// The metadata key that failed to parse.
        key: &'static str,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// A connection string did not have the `scheme://host:port/path` shape.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
}

/// Administrative lifecycle status of a datastream.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatastreamStatus {
    /// The datastream is active and its tasks should be running.
    Ready,
    /// The datastream is paused by the operator.
    Paused,
    /// The datastream is stopped and its tasks should not run.
    Stopped,
    /// The datastream is in an error state.
    Error,
}

/// Read-only snapshot of a datastream definition as held by a task. The supervisor swaps in a
/// fresh snapshot when the definition changes; tasks never mutate it.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Datastream {
    /// Name that uniquely identifies the datastream.
    pub name: String,
    /// Name of the connector type that executes the datastream.
    pub connector: String,
    /// Connection string for the source system.
    pub source: String,
    /// Connection string for the destination system. May contain a `%s` placeholder that is
    /// substituted with the origin topic per record.
    pub destination: String,
    /// Administrative status of the datastream.
    pub status: DatastreamStatus,
    /// Free-form metadata. Recognized keys are documented as constants in this module; unknown
    /// keys are preserved untouched across updates.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Datastream {
    /// Returns the consumer group identifier for the datastream: the `groupId` metadata entry if
    /// present, otherwise the datastream name.
    pub fn group_id(&self) -> &str {
        self.metadata
            .get(GROUP_ID)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }
    /// Returns true if records should be produced to the same partition number they were read
    /// from.
    pub fn identity_partitioning(&self) -> bool {
        self.metadata
            .get(IDENTITY_PARTITIONING)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
    /// Parses the `pausedSourcePartitions` metadata entry. The value is a JSON object mapping
    /// topic names to arrays of partition ids, where `"*"` selects every partition of the topic.
    /// An absent entry yields an empty map.
    pub fn paused_source_partitions(
        &self,
    ) -> Result<HashMap<String, BTreeSet<String>>, ControlError> {
        match self.metadata.get(PAUSED_SOURCE_PARTITIONS) {
            Some(raw) => {
                serde_json::from_str(raw).map_err(|source| ControlError::InvalidMetadata {
                    key: PAUSED_SOURCE_PARTITIONS,
                    source,
                })
            }
            None => Ok(HashMap::new()),
        }
    }
    /// Parses the `startPosition` metadata entry: a JSON object mapping partition ids to the
    /// offset consumption should begin at when no committed offset exists.
    pub fn start_positions(&self) -> Result<HashMap<i32, i64>, ControlError> {
        match self.metadata.get(START_POSITION) {
            Some(raw) => {
                let by_key: HashMap<String, i64> =
                    serde_json::from_str(raw).map_err(|source| ControlError::InvalidMetadata {
                        key: START_POSITION,
                        source,
                    })?;

                let mut positions = HashMap::with_capacity(by_key.len());

                for (partition, offset) in by_key {
                    let partition = partition.parse::<i32>().map_err(|e| {
                        ControlError::InvalidMetadata {
                            key: START_POSITION,
                            source: serde_json::Error::custom(e),
                        }
                    })?;

                    positions.insert(partition, offset);
                }

                Ok(positions)
            }
            None => Ok(HashMap::new()),
        }
    }
    /// Validates the snapshot: both connection strings must parse and the recognized metadata
    /// entries must have their expected JSON shapes. Invalid definitions are rejected before any
    /// state is applied.
    pub fn validate(&self) -> Result<(), ControlError> {
        ConnectionString::parse(&self.source)?;
        ConnectionString::parse(&self.destination)?;

        self.paused_source_partitions()?;
        self.start_positions()?;

        Ok(())
    }
}

/// A parsed connection string of the form `scheme://host:port/path`. The path of a destination
/// connection string may contain a single `%s` placeholder substituted with the origin topic of
/// each record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionString {
    /// Scheme of the connection string, e.g. `kafka`.
    scheme: String,
    /// Host and port section, e.g. `broker-1:9092,broker-2:9092`.
    authority: String,
    /// Path section without its leading slash. May be empty.
    path: String,
}

impl ConnectionString {
    /// Parses the given connection string, rejecting anything without a scheme or authority.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, ControlError> {
        let raw = raw.as_ref();

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| ControlError::InvalidConnectionString(raw.to_string()))?;

        if scheme.is_empty() {
            return Err(ControlError::InvalidConnectionString(raw.to_string()));
        }

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        if authority.is_empty() {
            return Err(ControlError::InvalidConnectionString(raw.to_string()));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            path: path.to_string(),
        })
    }
    /// Returns the scheme of the connection string.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }
    /// Returns the host and port section of the connection string.
    pub fn authority(&self) -> &str {
        &self.authority
    }
    /// Returns the path section of the connection string, without its leading slash.
    pub fn path(&self) -> &str {
        &self.path
    }
    /// Resolves the destination topic for a record originating from the given topic: the path
    /// with the `%s` placeholder substituted, or the origin topic itself when the path is empty.
    pub fn topic_for(&self, origin_topic: &str) -> String {
        if self.path.is_empty() {
            return origin_topic.to_string();
        }

        self.path.replace(TOPIC_PLACEHOLDER, origin_topic)
    }
    /// Returns the full connection string with the `%s` placeholder substituted for the given
    /// origin topic.
    pub fn resolve(&self, origin_topic: &str) -> String {
        format!(
            "{}://{}/{}",
            self.scheme,
            self.authority,
            self.topic_for(origin_topic)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datastream_with_metadata(metadata: HashMap<String, String>) -> Datastream {
        Datastream {
            name: String::from("mirror-events"),
            connector: String::from("kafkaMirror"),
            source: String::from("kafka://source:9092/.*"),
            destination: String::from("kafka://dest:9092/%s"),
            status: DatastreamStatus::Ready,
            metadata,
        }
    }

    #[test]
    fn group_id_defaults_to_name() {
        let datastream = datastream_with_metadata(HashMap::new());

        assert_eq!(datastream.group_id(), "mirror-events");
    }

    #[test]
    fn group_id_metadata_overrides_name() {
        let mut metadata = HashMap::new();
        metadata.insert(String::from(GROUP_ID), String::from("custom-group"));

        let datastream = datastream_with_metadata(metadata);

        assert_eq!(datastream.group_id(), "custom-group");
    }

    #[test]
    fn paused_source_partitions_parse() {
        let mut metadata = HashMap::new();
        metadata.insert(
            String::from(PAUSED_SOURCE_PARTITIONS),
            String::from(r#"{"A": ["*"], "B": ["0", "2"]}"#),
        );

        let paused = datastream_with_metadata(metadata)
            .paused_source_partitions()
            .unwrap();

        assert_eq!(paused.len(), 2);
        assert!(paused["A"].contains("*"));
        assert!(paused["B"].contains("0"));
        assert!(paused["B"].contains("2"));
    }

    #[test]
    fn invalid_paused_source_partitions_are_rejected() {
        let mut metadata = HashMap::new();
        metadata.insert(
            String::from(PAUSED_SOURCE_PARTITIONS),
            String::from("not json"),
        );

        let datastream = datastream_with_metadata(metadata);

        assert!(matches!(
            datastream.paused_source_partitions(),
            Err(ControlError::InvalidMetadata { .. })
        ));
        assert!(datastream.validate().is_err());
    }

    #[test]
    fn start_positions_parse() {
        let mut metadata = HashMap::new();
        metadata.insert(
            String::from(START_POSITION),
            String::from(r#"{"0": 100, "3": 7}"#),
        );

        let positions = datastream_with_metadata(metadata).start_positions().unwrap();

        assert_eq!(positions[&0], 100);
        assert_eq!(positions[&3], 7);
    }

    #[test]
    fn unknown_metadata_keys_survive_round_trip() {
        let mut metadata = HashMap::new();
        metadata.insert(String::from("owner"), String::from("team-data"));

        let datastream = datastream_with_metadata(metadata);

        let json = serde_json::to_string(&datastream).unwrap();
        let restored: Datastream = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.metadata["owner"], "team-data");
    }

    #[test]
    fn connection_string_parses_scheme_authority_and_path() {
        let parsed = ConnectionString::parse("kafka://broker-1:9092,broker-2:9092/%s").unwrap();

        assert_eq!(parsed.scheme(), "kafka");
        assert_eq!(parsed.authority(), "broker-1:9092,broker-2:9092");
        assert_eq!(parsed.path(), "%s");
    }

    #[test]
    fn connection_string_rejects_missing_scheme() {
        assert!(ConnectionString::parse("broker:9092/topic").is_err());
        assert!(ConnectionString::parse("://broker:9092").is_err());
        assert!(ConnectionString::parse("kafka:///topic").is_err());
    }

    #[test]
    fn topic_substitution_applies_placeholder() {
        let parsed = ConnectionString::parse("kafka://dest:9092/%s").unwrap();

        assert_eq!(parsed.topic_for("events"), "events");
        assert_eq!(parsed.resolve("events"), "kafka://dest:9092/events");
    }

    #[test]
    fn fixed_topic_destination_ignores_origin() {
        let parsed = ConnectionString::parse("kafka://dest:9092/all-events").unwrap();

        assert_eq!(parsed.topic_for("clicks"), "all-events");
    }

    #[test]
    fn empty_path_mirrors_origin_topic() {
        let parsed = ConnectionString::parse("kafka://dest:9092").unwrap();

        assert_eq!(parsed.topic_for("clicks"), "clicks");
    }
}
