use crate::{
    checkpoint::PartitionPosition, pause::PauseReason, supervisor::TaskSupervisor,
    task::TaskState, util,
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

/// Shared state of the diagnostics endpoints.
#[derive(Clone)]
struct DiagnosticsState {
    /// The supervisor whose tasks are exposed.
    supervisor: Arc<TaskSupervisor>,
    /// Hostname used to key positions for cross-host aggregation.
    host: String,
}

/// One entry of the datastream listing.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatastreamSummary {
    /// Name of the datastream.
    name: String,
    /// Lifecycle state of its task.
    state: TaskState,
}

/// Details of one auto-paused partition.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AutoPausedInfo {
    /// Why the partition was paused.
    reason: PauseReason,
    /// When the pause was applied.
    since: DateTime<Utc>,
}

/// Pause and progress state of one datastream task.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatastreamStateResponse {
    /// Name of the datastream.
    name: String,
    /// Lifecycle state of the task.
    state: TaskState,
    /// Partitions currently assigned to the task, sorted.
    assignment: Vec<String>,
    /// Partitions the task paused on its own, with the reason.
    auto_paused_partitions: BTreeMap<String, AutoPausedInfo>,
    /// Operator-configured pauses: topic to partition ids, where `"*"` selects every partition.
    manual_paused_partitions: BTreeMap<String, Vec<String>>,
    /// In-flight message counts per partition.
    in_flight_counts: BTreeMap<String, usize>,
}

/// Key identifying one partition position; aggregation across hosts is by the host field.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PositionKey {
    /// Name of the datastream.
    datastream: String,
    /// Hostname of the instance that produced the value.
    host: String,
    /// Source topic.
    topic: String,
    /// Source partition number.
    partition: i32,
}

/// One partition position entry.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PositionEntry {
    /// Identity of the partition.
    key: PositionKey,
    /// Progress of the partition.
    value: PartitionPosition,
}

/// Builds the read-only diagnostics router over the given supervisor.
pub fn router(supervisor: Arc<TaskSupervisor>) -> Router {
    let state = DiagnosticsState {
        supervisor,
        host: util::host_name(),
    };

    Router::new()
        .route("/datastreams", get(list_datastreams))
        .route("/datastreams/:name/state", get(datastream_state))
        .route("/datastreams/:name/position", get(datastream_position))
        .with_state(state)
}

/// Lists the datastreams with a running task and their states.
async fn list_datastreams(State(state): State<DiagnosticsState>) -> Json<Vec<DatastreamSummary>> {
    let summaries = state
        .supervisor
        .datastream_names()
        .into_iter()
        .filter_map(|name| {
            state
                .supervisor
                .task_shared(&name)
                .map(|shared| DatastreamSummary {
                    name,
                    state: shared.state(),
                })
        })
        .collect();

    Json(summaries)
}

/// Returns the pause and progress state of one datastream task.
async fn datastream_state(
    State(state): State<DiagnosticsState>,
    Path(name): Path<String>,
) -> Result<Json<DatastreamStateResponse>, StatusCode> {
    let shared = state
        .supervisor
        .task_shared(&name)
        .ok_or(StatusCode::NOT_FOUND)?;

    let mut assignment: Vec<String> = shared
        .assignment_snapshot()
        .iter()
        .map(ToString::to_string)
        .collect();
    assignment.sort();

    let auto_paused_partitions = shared
        .auto_paused_snapshot()
        .into_iter()
        .map(|(partition, entry)| {
            (
                partition.to_string(),
                AutoPausedInfo {
                    reason: entry.reason,
                    since: entry.since,
                },
            )
        })
        .collect();

    let manual_paused_partitions = shared
        .manual_paused_snapshot()
        .into_iter()
        .map(|(topic, partitions)| (topic, partitions.into_iter().collect()))
        .collect();

    let in_flight_counts = shared
        .in_flight_counts()
        .into_iter()
        .map(|(partition, count)| (partition.to_string(), count))
        .collect();

    Ok(Json(DatastreamStateResponse {
        name,
        state: shared.state(),
        assignment,
        auto_paused_partitions,
        manual_paused_partitions,
        in_flight_counts,
    }))
}

/// Returns the per-partition positions of one datastream task, keyed for cross-host
/// aggregation.
async fn datastream_position(
    State(state): State<DiagnosticsState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<PositionEntry>>, StatusCode> {
    let shared = state
        .supervisor
        .task_shared(&name)
        .ok_or(StatusCode::NOT_FOUND)?;

    let mut entries: Vec<PositionEntry> = shared
        .positions_snapshot()
        .into_iter()
        .map(|(partition, position)| PositionEntry {
            key: PositionKey {
                datastream: name.clone(),
                host: state.host.clone(),
                topic: String::from(partition.topic()),
                partition: partition.partition(),
            },
            value: position,
        })
        .collect();

    entries.sort_by(|a, b| {
        (a.key.topic.as_str(), a.key.partition).cmp(&(b.key.topic.as_str(), b.key.partition))
    });

    Ok(Json(entries))
}
