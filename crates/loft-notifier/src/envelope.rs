use chrono::{DateTime, Utc};
use loft_domain::{EnvironmentId, EnvironmentStatus, MetricKind, MetricSample};
use serde::{Deserialize, Serialize};

/// Typed envelopes pushed to subscribed client sessions. Field names are the
/// wire contract; do not rename without versioning the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "environment-status")]
    EnvironmentStatus {
        #[serde(rename = "environmentId")]
        environment_id: EnvironmentId,
        status: EnvironmentStatus,
        timestamp: DateTime<Utc>,
        #[serde(rename = "updatedAt")]
        updated_at: DateTime<Utc>,
    },

    #[serde(rename = "METRICS_UPDATE")]
    MetricsUpdate {
        #[serde(rename = "projectId")]
        project_id: EnvironmentId,
        metrics: Vec<MetricPayload>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "environment-log")]
    LogLine {
        #[serde(rename = "environmentId")]
        environment_id: EnvironmentId,
        service: String,
        line: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "SUBSCRIBED")]
    Subscribed {
        #[serde(rename = "projectId")]
        project_id: EnvironmentId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "UNSUBSCRIBED")]
    Unsubscribed {
        #[serde(rename = "projectId")]
        project_id: EnvironmentId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "PONG")]
    Pong { timestamp: DateTime<Utc> },

    #[serde(rename = "ERROR")]
    Error { message: String, timestamp: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    #[serde(rename = "metricType")]
    pub metric_type: MetricKind,
    #[serde(rename = "metricName")]
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    #[serde(rename = "containerId", skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(rename = "recordedAt")]
    pub recorded_at: DateTime<Utc>,
}

impl From<&MetricSample> for MetricPayload {
    fn from(sample: &MetricSample) -> Self {
        MetricPayload {
            metric_type: sample.kind,
            metric_name: sample.name.clone(),
            value: sample.value,
            unit: sample.unit.clone(),
            container_id: sample.container_id.clone(),
            recorded_at: sample.recorded_at,
        }
    }
}

/// The small client command set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCommand {
    pub action: ClientAction,
    #[serde(rename = "projectId")]
    pub project_id: Option<EnvironmentId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
    Ping,
}
