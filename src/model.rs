//! Data models for MetricHub.
//!
//! Field names follow the JSON contract the dashboard consumes
//! (`deployment_frequency`, `lead_time`, `mttr`, `change_failure_rate`,
//! `severity`, `resolved_time`, ...). Inbound events arrive in the canonical
//! [`NewDeployment`] / [`NewIncident`] shape; plugin adapters translate vendor
//! payloads into these before they reach the engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{EngineError, Result};

/// Outcome of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Success,
    Failed,
    InProgress,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }

    /// Whether the deployment has reached a final outcome.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::InProgress)
    }
}

impl FromStr for DeploymentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(DeploymentStatus::Success),
            "failed" => Ok(DeploymentStatus::Failed),
            "in_progress" => Ok(DeploymentStatus::InProgress),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            other => Err(EngineError::Validation(format!(
                "unknown deployment status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident severity levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(EngineError::Validation(format!(
                "unknown incident severity '{other}'"
            ))),
        }
    }
}

/// The (service, environment) pair: unit of write isolation and metric scoping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub service: String,
    pub environment: String,
}

impl PartitionKey {
    pub fn new(service: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            environment: environment.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.environment)
    }
}

/// Which partitions a query or metric window covers.
///
/// `None` on either axis means "all". The default scope covers every partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl Scope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn service(service: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            environment: None,
        }
    }

    pub fn partition(key: &PartitionKey) -> Self {
        Self {
            service: Some(key.service.clone()),
            environment: Some(key.environment.clone()),
        }
    }

    pub fn matches(&self, key: &PartitionKey) -> bool {
        self.service.as_deref().is_none_or(|s| s == key.service)
            && self
                .environment
                .as_deref()
                .is_none_or(|e| e == key.environment)
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Build a range, rejecting empty or inverted intervals.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(EngineError::Validation(format!(
                "time range end {end} must be after start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days`-long range ending at `end`.
    pub fn last_days(end: DateTime<Utc>, days: u32) -> Result<Self> {
        Self::new(end - Duration::days(i64::from(days)), end)
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Fractional length of the range in days.
    pub fn days(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 86_400_000.0
    }
}

/// A recorded deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub service: String,
    pub environment: String,
    pub status: DeploymentStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(&self.service, &self.environment)
    }

    /// Commit-to-deploy time, when the commit timestamp is known.
    pub fn lead_time(&self) -> Option<Duration> {
        self.commit_time.map(|commit| self.start_time - commit)
    }

    pub fn is_failed(&self) -> bool {
        self.status == DeploymentStatus::Failed
    }
}

/// A recorded incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub service: String,
    pub environment: String,
    pub severity: Severity,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(&self.service, &self.environment)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_time.is_some()
    }

    /// Time from start to resolution. `None` while the incident is open.
    pub fn recovery_time(&self) -> Option<Duration> {
        self.resolved_time.map(|resolved| resolved - self.start_time)
    }
}

/// Canonical inbound deployment event.
///
/// `start_time` defaults to the time the event is received and `id` is
/// assigned server-side when absent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewDeployment {
    #[serde(default)]
    pub id: Option<String>,
    pub service: String,
    pub environment: String,
    #[serde(default = "default_deployment_status")]
    pub status: DeploymentStatus,
    #[serde(default, alias = "started_at")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "ended_at")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub commit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<String>,
}

fn default_deployment_status() -> DeploymentStatus {
    DeploymentStatus::Success
}

impl NewDeployment {
    /// Validate the event and turn it into a stored [`Deployment`].
    pub fn into_deployment(self, received_at: DateTime<Utc>) -> Result<Deployment> {
        let id = assign_id(self.id)?;
        require_non_empty("service", &self.service)?;
        require_non_empty("environment", &self.environment)?;

        let start_time = self.start_time.unwrap_or(received_at);
        check_storable("start_time", start_time)?;
        for (field, at) in [("end_time", self.end_time), ("commit_time", self.commit_time)] {
            if let Some(at) = at {
                check_storable(field, at)?;
            }
        }

        if let Some(end) = self.end_time {
            if end < start_time {
                return Err(EngineError::Validation(format!(
                    "deployment {id}: end_time {end} is before start_time {start_time}"
                )));
            }
            if self.status == DeploymentStatus::InProgress {
                return Err(EngineError::Validation(format!(
                    "deployment {id}: an in-progress deployment cannot have an end_time"
                )));
            }
        }

        if let Some(commit) = self.commit_time {
            if commit > start_time {
                return Err(EngineError::Validation(format!(
                    "deployment {id}: commit_time {commit} is after start_time {start_time}"
                )));
            }
        }

        Ok(Deployment {
            id,
            service: self.service,
            environment: self.environment,
            status: self.status,
            start_time,
            end_time: self.end_time,
            commit_sha: self.commit_sha,
            commit_time: self.commit_time,
            version: self.version,
            created_at: received_at,
        })
    }
}

/// Canonical inbound incident event.
///
/// Incidents normally arrive open; a source replaying history may include a
/// `resolved_time`, which is held to the same ordering invariant.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewIncident {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub service: String,
    pub environment: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default, alias = "started_at")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "resolved_at")]
    pub resolved_time: Option<DateTime<Utc>>,
}

fn default_severity() -> Severity {
    Severity::Medium
}

impl NewIncident {
    /// Validate the event and turn it into a stored [`Incident`].
    pub fn into_incident(self, received_at: DateTime<Utc>) -> Result<Incident> {
        let id = assign_id(self.id)?;
        require_non_empty("title", &self.title)?;
        require_non_empty("service", &self.service)?;
        require_non_empty("environment", &self.environment)?;

        let start_time = self.start_time.unwrap_or(received_at);
        check_storable("start_time", start_time)?;

        if let Some(resolved) = self.resolved_time {
            check_storable("resolved_time", resolved)?;
            if resolved < start_time {
                return Err(EngineError::Validation(format!(
                    "incident {id}: resolved_time {resolved} is before start_time {start_time}"
                )));
            }
        }

        Ok(Incident {
            id,
            title: self.title,
            description: self.description,
            service: self.service,
            environment: self.environment,
            severity: self.severity,
            start_time,
            resolved_time: self.resolved_time,
            created_at: received_at,
        })
    }
}

fn assign_id(id: Option<String>) -> Result<String> {
    match id {
        Some(id) if id.trim().is_empty() => {
            Err(EngineError::Validation("id must not be blank".to_string()))
        }
        Some(id) => Ok(id),
        None => Ok(uuid::Uuid::new_v4().to_string()),
    }
}

/// Reject timestamps outside what the durable log can hold (i64 nanoseconds).
pub(crate) fn check_storable(field: &str, at: DateTime<Utc>) -> Result<()> {
    if at.timestamp_nanos_opt().is_none() {
        return Err(EngineError::InvalidTimestamp(format!(
            "{field} {at} is outside the supported range (1677 to 2262)"
        )));
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Request body for `POST /incidents/:id/resolve`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolveRequest {
    /// Defaults to the engine clock's current time.
    #[serde(default, alias = "resolved_at")]
    pub resolved_time: Option<DateTime<Utc>>,
}

/// Request body for `POST /deployments/:id/complete`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentCompletion {
    pub status: DeploymentStatus,
    #[serde(default, alias = "ended_at")]
    pub end_time: Option<DateTime<Utc>>,
}

/// An event in the store, as returned by range queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Deployment(Deployment),
    Incident(Incident),
}

impl Event {
    pub fn id(&self) -> &str {
        match self {
            Event::Deployment(d) => &d.id,
            Event::Incident(i) => &i.id,
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        match self {
            Event::Deployment(d) => d.start_time,
            Event::Incident(i) => i.start_time,
        }
    }
}

/// Canonical webhook envelope accepted by `POST /webhook/:plugin`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum WebhookEvent {
    Deployment(NewDeployment),
    DeploymentCompleted {
        id: String,
        status: DeploymentStatus,
        #[serde(default, alias = "ended_at")]
        end_time: Option<DateTime<Utc>>,
    },
    Incident(NewIncident),
    IncidentResolved {
        id: String,
        #[serde(default, alias = "resolved_at")]
        resolved_time: Option<DateTime<Utc>>,
    },
}

/// Counts behind a metric window, used for data-quality assessment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleCounts {
    pub deployments_count: usize,
    pub failed_count: usize,
    pub lead_time_samples: usize,
    pub incidents_count: usize,
    pub resolved_incidents_count: usize,
}

/// The four DORA values computed over one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowSummary {
    /// Deployments per day.
    pub deployment_frequency: f64,
    /// Median commit-to-deploy time.
    #[serde(serialize_with = "serialize_duration")]
    pub lead_time: Duration,
    /// Mean time from incident start to resolution.
    #[serde(serialize_with = "serialize_duration")]
    pub mttr: Duration,
    /// Failed deployments over all deployments, in `[0, 1]`.
    pub change_failure_rate: f64,
    #[serde(flatten)]
    pub samples: SampleCounts,
}

impl WindowSummary {
    pub fn empty() -> Self {
        Self {
            deployment_frequency: 0.0,
            lead_time: Duration::zero(),
            mttr: Duration::zero(),
            change_failure_rate: 0.0,
            samples: SampleCounts::default(),
        }
    }
}

/// DORA metrics for a time range and scope. Owned by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricWindow {
    pub time_range: TimeRange,
    pub scope: Scope,
    #[serde(flatten)]
    pub summary: WindowSummary,
    pub calculated_at: DateTime<Utc>,
}

/// Performance tier from DORA research, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Low,
    Medium,
    High,
    Elite,
}

/// Per-metric tiers plus the combined tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PerformanceClassification {
    pub deployment_frequency: PerformanceTier,
    pub lead_time: PerformanceTier,
    pub mttr: PerformanceTier,
    pub change_failure_rate: PerformanceTier,
    /// Worst of the four per-metric tiers.
    pub overall: PerformanceTier,
}

/// How far a window's numbers can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricMetadata {
    pub time_range: TimeRange,
    pub data_quality: DataQuality,
    pub last_updated: DateTime<Utc>,
}

/// Envelope for every metric endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricResponse<T> {
    pub data: T,
    pub metadata: MetricMetadata,
}

/// Body of `GET /metrics/dora`.
#[derive(Debug, Clone, Serialize)]
pub struct DoraReport {
    #[serde(flatten)]
    pub window: MetricWindow,
    pub classification: PerformanceClassification,
}

/// Which of the four metrics a single-metric response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    DeploymentFrequency,
    LeadTime,
    Mttr,
    ChangeFailureRate,
}

/// Body of the single-metric endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct MetricValue {
    pub metric: MetricKind,
    pub value: MetricReading,
    /// Milliseconds, for duration metrics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_ms: Option<i64>,
    pub unit: &'static str,
    pub tier: PerformanceTier,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricReading {
    Number(f64),
    Text(String),
}

/// Read-only export of everything the store holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemState {
    pub deployments: Vec<Deployment>,
    pub incidents: Vec<Incident>,
}

/// Render a duration the way the dashboard shows it, e.g. `"2h 30m"` or `"45m"`.
pub fn format_duration(d: Duration) -> String {
    let total = d.num_seconds().max(0);
    if total == 0 {
        return "0m".to_string();
    }

    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }
    parts.join(" ")
}

pub(crate) fn serialize_duration<S: Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*d))
}
