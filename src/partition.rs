use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

/// Identifies a single partition of a topic in a source system. The pair is the unit of
/// ordering for the runtime: all progress, pause state and in-flight accounting is keyed by it.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SourcePartition {
    /// Name of the topic.
    topic: String,
    /// Partition number within the topic.
    partition: i32,
}

impl SourcePartition {
    /// Creates a new [`SourcePartition`] for the given topic and partition number.
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
    /// Returns the name of the topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }
    /// Returns the partition number within the topic.
    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl Display for SourcePartition {
    /// Writes the canonical `{topic}-{partition}` representation to the [`std::fmt::Formatter`].
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}-{}", self.topic, self.partition))
    }
}

impl Serialize for SourcePartition {
    /// Serializes the partition as its canonical `{topic}-{partition}` string so it can be used
    /// as a map key in diagnostics JSON.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Metadata describing one partition of a topic as reported by the source system.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionInfo {
    /// Name of the topic.
    pub topic: String,
    /// Partition number within the topic.
    pub partition: i32,
}

/// Error raised when a checkpoint token cannot be parsed.
#[derive(Debug, Error)]
pub enum CheckpointTokenError {
    /// The token did not have the expected number of fields.
    #[error("malformed checkpoint token: {0}")]
    Malformed(String),
    /// A numeric field of the token could not be parsed.
    #[error("invalid number in checkpoint token {token}: {source}")]
    InvalidNumber {
        /// The offending token.
        token: String,
        /// Parse failure for the numeric field.
        #[source]
        source: std::num::ParseIntError,
    },
}

/// A token tying an envelope back to the source position it was read from. Mirroring tasks use
/// the three field form since they consume many topics at once; single-topic tasks omit the
/// topic. Topic names may themselves contain `-` so the mirror form is parsed from the right.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CheckpointToken {
    /// `{topic}-{partition}-{offset}` form used when mirroring a set of topics.
    Mirror {
        /// Origin topic.
        topic: String,
        /// Origin partition number.
        partition: i32,
        /// Origin offset.
        offset: i64,
    },
    /// `{partition}-{offset}` form used when the task replicates a single known topic.
    SingleTopic {
        /// Origin partition number.
        partition: i32,
        /// Origin offset.
        offset: i64,
    },
}

impl CheckpointToken {
    /// Creates a mirror mode token for the given source position.
    pub fn mirror(partition: &SourcePartition, offset: i64) -> Self {
        Self::Mirror {
            topic: partition.topic().to_string(),
            partition: partition.partition(),
            offset,
        }
    }
    /// Creates a single-topic mode token for the given partition and offset.
    pub fn single_topic(partition: i32, offset: i64) -> Self {
        Self::SingleTopic { partition, offset }
    }
    /// Parses a mirror mode token of the form `{topic}-{partition}-{offset}`. The topic may
    /// contain `-` characters, so the partition and offset are taken from the right.
    pub fn parse_mirror(token: impl AsRef<str>) -> Result<Self, CheckpointTokenError> {
        let token = token.as_ref();

        let mut fields = token.rsplitn(3, '-');

        let offset = fields
            .next()
            .ok_or_else(|| CheckpointTokenError::Malformed(token.to_string()))?;

        let partition = fields
            .next()
            .ok_or_else(|| CheckpointTokenError::Malformed(token.to_string()))?;

        let topic = fields
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CheckpointTokenError::Malformed(token.to_string()))?;

        Ok(Self::Mirror {
            topic: topic.to_string(),
            partition: parse_number(token, partition)?,
            offset: parse_number(token, offset)?,
        })
    }
    /// Parses a single-topic mode token of the form `{partition}-{offset}`. Tokens with more or
    /// fewer fields are rejected.
    pub fn parse_single_topic(token: impl AsRef<str>) -> Result<Self, CheckpointTokenError> {
        let token = token.as_ref();

        let fields: Vec<&str> = token.split('-').collect();

        if fields.len() != 2 {
            return Err(CheckpointTokenError::Malformed(token.to_string()));
        }

        Ok(Self::SingleTopic {
            partition: parse_number(token, fields[0])?,
            offset: parse_number(token, fields[1])?,
        })
    }
    /// Returns the source partition the token points at, if the token carries a topic.
    pub fn source_partition(&self) -> Option<SourcePartition> {
        match self {
            Self::Mirror {
                topic, partition, ..
            } => Some(SourcePartition::new(topic.clone(), *partition)),
            Self::SingleTopic { .. } => None,
        }
    }
    /// Returns the partition number of the token.
    pub fn partition(&self) -> i32 {
        match self {
            Self::Mirror { partition, .. } => *partition,
            Self::SingleTopic { partition, .. } => *partition,
        }
    }
    /// Returns the offset of the token.
    pub fn offset(&self) -> i64 {
        match self {
            Self::Mirror { offset, .. } => *offset,
            Self::SingleTopic { offset, .. } => *offset,
        }
    }
}

impl Display for CheckpointToken {
    /// Writes the wire representation of the token to the [`std::fmt::Formatter`].
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mirror {
                topic,
                partition,
                offset,
            } => f.write_fmt(format_args!("{}-{}-{}", topic, partition, offset)),
            Self::SingleTopic { partition, offset } => {
                f.write_fmt(format_args!("{}-{}", partition, offset))
            }
        }
    }
}

/// Parses a numeric checkpoint token field, attributing failures to the whole token.
fn parse_number<N>(token: &str, field: &str) -> Result<N, CheckpointTokenError>
where
    N: std::str::FromStr<Err = std::num::ParseIntError>,
{
    field
        .parse()
        .map_err(|source| CheckpointTokenError::InvalidNumber {
            token: token.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_token_round_trips() {
        let partition = SourcePartition::new("events", 3);

        let token = CheckpointToken::mirror(&partition, 42);

        assert_eq!(token.to_string(), "events-3-42");
        assert_eq!(CheckpointToken::parse_mirror("events-3-42").unwrap(), token);
    }

    #[test]
    fn mirror_token_topic_may_contain_dashes() {
        let token = CheckpointToken::parse_mirror("user-click-events-0-17").unwrap();

        assert_eq!(
            token,
            CheckpointToken::Mirror {
                topic: String::from("user-click-events"),
                partition: 0,
                offset: 17,
            }
        );
    }

    #[test]
    fn mirror_token_rejects_missing_fields() {
        assert!(CheckpointToken::parse_mirror("42").is_err());
        assert!(CheckpointToken::parse_mirror("3-42").is_err());
        assert!(CheckpointToken::parse_mirror("").is_err());
    }

    #[test]
    fn mirror_token_rejects_non_numeric_fields() {
        assert!(CheckpointToken::parse_mirror("events-x-42").is_err());
        assert!(CheckpointToken::parse_mirror("events-3-y").is_err());
    }

    #[test]
    fn single_topic_token_round_trips() {
        let token = CheckpointToken::single_topic(1, 9);

        assert_eq!(token.to_string(), "1-9");
        assert_eq!(CheckpointToken::parse_single_topic("1-9").unwrap(), token);
    }

    #[test]
    fn single_topic_token_rejects_wrong_field_count() {
        assert!(CheckpointToken::parse_single_topic("9").is_err());
        assert!(CheckpointToken::parse_single_topic("a-1-9").is_err());
    }

    #[test]
    fn source_partition_displays_canonically() {
        let partition = SourcePartition::new("events", 12);

        assert_eq!(partition.to_string(), "events-12");
        assert_eq!(
            serde_json::to_string(&partition).unwrap(),
            "\"events-12\""
        );
    }
}
