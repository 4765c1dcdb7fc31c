//! The metrics engine: one handle over the store, aggregator, classifier,
//! and incident lifecycle.
//!
//! All mutations run on their own task, so once accepted they reach a
//! definite outcome even if the request that started them is dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::aggregation::{Aggregator, assess_quality};
use crate::classifier::Classifier;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fixtures::{self, FixtureEvent, FixtureSpec};
use crate::lifecycle::{IncidentLifecycle, IncidentState};
use crate::model::{
    DataQuality, Deployment, DeploymentCompletion, DoraReport, Incident, MetricKind,
    MetricMetadata, MetricReading, MetricResponse, MetricValue, MetricWindow, NewDeployment,
    NewIncident, PerformanceClassification, Scope, SystemState, TimeRange, format_duration,
};
use crate::storage::EventLog;
use crate::store::{ChangeListener, EventQuery, EventStore, detached};

/// Longest rolling window a caller may ask for.
pub const MAX_WINDOW_DAYS: u32 = 365;

/// Outcome of a `/simulate` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationSummary {
    pub deployments: usize,
    pub incidents: usize,
    pub resolved: usize,
}

pub struct MetricsEngine {
    store: Arc<EventStore>,
    aggregator: Arc<Aggregator>,
    classifier: Classifier,
    lifecycle: IncidentLifecycle,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl MetricsEngine {
    /// Build an engine over `log` with empty in-memory indices.
    pub fn new(log: Arc<dyn EventLog>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let aggregator = Arc::new(Aggregator::new(config.cache_capacity));
        let listener: Arc<dyn ChangeListener> = aggregator.clone();
        let store = Arc::new(EventStore::new(log, listener));
        let lifecycle = IncidentLifecycle::new(Arc::clone(&store), Arc::clone(&clock));

        Self {
            store,
            aggregator,
            classifier: Classifier::new(config.thresholds),
            lifecycle,
            clock,
            config,
        }
    }

    /// Build an engine and replay everything `log` already holds.
    pub async fn open(
        log: Arc<dyn EventLog>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let engine = Self::new(log, config, clock);
        engine.store.restore().await?;
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn ingest_deployment(&self, new: NewDeployment) -> Result<Deployment> {
        let store = Arc::clone(&self.store);
        let received_at = self.clock.now();
        let deployment =
            detached(async move { store.append_deployment(new, received_at).await }).await?;

        info!(
            id = %deployment.id,
            service = %deployment.service,
            environment = %deployment.environment,
            status = %deployment.status,
            "Deployment recorded"
        );
        Ok(deployment)
    }

    pub async fn ingest_incident(&self, new: NewIncident) -> Result<Incident> {
        let store = Arc::clone(&self.store);
        let received_at = self.clock.now();
        let incident =
            detached(async move { store.append_incident(new, received_at).await }).await?;

        info!(
            id = %incident.id,
            service = %incident.service,
            environment = %incident.environment,
            severity = incident.severity.as_str(),
            "Incident recorded"
        );
        Ok(incident)
    }

    pub async fn complete_deployment(
        &self,
        id: &str,
        completion: DeploymentCompletion,
    ) -> Result<Deployment> {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        let deployment =
            detached(async move { store.complete_deployment(&id, completion).await }).await?;

        info!(id = %deployment.id, status = %deployment.status, "Deployment completed");
        Ok(deployment)
    }

    /// Resolve an incident at `resolved_time`, or now if not given.
    pub async fn resolve_incident(
        &self,
        id: &str,
        resolved_time: Option<DateTime<Utc>>,
    ) -> Result<Incident> {
        self.lifecycle.resolve(id, resolved_time).await
    }

    pub fn incident_state(&self, id: &str) -> Result<IncidentState> {
        self.lifecycle.state(id)
    }

    pub fn deployment(&self, id: &str) -> Result<Deployment> {
        self.store.deployment(id)
    }

    pub fn incident(&self, id: &str) -> Result<Incident> {
        self.store.incident(id)
    }

    /// The `days`-long window ending now, with the end rounded up to the
    /// configured alignment so that polls within one slot share a window.
    pub fn rolling_range(&self, days: u32) -> Result<TimeRange> {
        if days == 0 || days > MAX_WINDOW_DAYS {
            return Err(EngineError::Validation(format!(
                "days must be between 1 and {MAX_WINDOW_DAYS}"
            )));
        }
        let end = align_up(self.clock.now(), self.config.window_alignment_secs);
        TimeRange::last_days(end, days)
    }

    pub fn compute(&self, range: TimeRange, scope: &Scope) -> MetricWindow {
        self.aggregator
            .compute(&self.store, range, scope, self.clock.now())
    }

    pub fn classify(&self, window: &MetricWindow) -> PerformanceClassification {
        self.classifier.classify(window)
    }

    pub fn data_quality(&self, window: &MetricWindow) -> DataQuality {
        assess_quality(&window.summary.samples, self.config.min_samples)
    }

    fn metadata(&self, window: &MetricWindow) -> MetricMetadata {
        MetricMetadata {
            time_range: window.time_range,
            data_quality: self.data_quality(window),
            last_updated: window.calculated_at,
        }
    }

    /// All four metrics with their classification.
    pub fn report(&self, range: TimeRange, scope: &Scope) -> MetricResponse<DoraReport> {
        let window = self.compute(range, scope);
        let classification = self.classify(&window);
        let metadata = self.metadata(&window);
        MetricResponse {
            data: DoraReport {
                window,
                classification,
            },
            metadata,
        }
    }

    /// A single metric with its tier.
    pub fn metric(
        &self,
        kind: MetricKind,
        range: TimeRange,
        scope: &Scope,
    ) -> MetricResponse<MetricValue> {
        let window = self.compute(range, scope);
        let summary = &window.summary;
        let samples = &summary.samples;

        let data = match kind {
            MetricKind::DeploymentFrequency => MetricValue {
                metric: kind,
                value: MetricReading::Number(summary.deployment_frequency),
                value_ms: None,
                unit: "per_day",
                tier: self.classifier.deployment_frequency(summary.deployment_frequency),
                samples: samples.deployments_count,
            },
            MetricKind::LeadTime => MetricValue {
                metric: kind,
                value: MetricReading::Text(format_duration(summary.lead_time)),
                value_ms: Some(summary.lead_time.num_milliseconds()),
                unit: "duration",
                tier: self.classifier.lead_time(summary.lead_time),
                samples: samples.lead_time_samples,
            },
            MetricKind::Mttr => MetricValue {
                metric: kind,
                value: MetricReading::Text(format_duration(summary.mttr)),
                value_ms: Some(summary.mttr.num_milliseconds()),
                unit: "duration",
                tier: self.classifier.mttr(summary.mttr),
                samples: samples.resolved_incidents_count,
            },
            MetricKind::ChangeFailureRate => MetricValue {
                metric: kind,
                value: MetricReading::Number(summary.change_failure_rate),
                value_ms: None,
                unit: "ratio",
                tier: self.classifier.change_failure_rate(summary.change_failure_rate),
                samples: samples.deployments_count,
            },
        };

        MetricResponse {
            data,
            metadata: self.metadata(&window),
        }
    }

    pub fn query(&self, range: &TimeRange, scope: &Scope) -> EventQuery {
        self.store.query(range, scope)
    }

    pub fn deployments(&self, range: Option<&TimeRange>, scope: &Scope) -> Vec<Deployment> {
        self.store.deployments(range, scope)
    }

    pub fn incidents(&self, range: Option<&TimeRange>, scope: &Scope) -> Vec<Incident> {
        self.store.incidents(range, scope)
    }

    pub fn snapshot(&self, range: Option<&TimeRange>, scope: &Scope) -> SystemState {
        self.store.snapshot(range, scope)
    }

    /// Check that the durable log is reachable.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.store.log().ping().await
    }

    /// Generate a seeded history ending now and ingest it through the normal
    /// paths, so every invariant applies as it would to real traffic.
    ///
    /// Ids already in the store are rejected before anything is ingested. A
    /// concurrent writer that claims a generated id mid-run still stops the
    /// run with the events before it kept.
    pub async fn simulate(&self, spec: FixtureSpec) -> Result<SimulationSummary> {
        spec.validate()?;
        let fixture = fixtures::generate(&spec, self.clock.now());
        let taken = fixture
            .deployments()
            .filter_map(|d| d.id.as_deref())
            .chain(fixture.incidents().filter_map(|i| i.id.as_deref()))
            .find(|id| self.store.deployment(id).is_ok() || self.store.incident(id).is_ok());
        if let Some(id) = taken {
            return Err(EngineError::DuplicateId(id.to_string()));
        }
        let mut summary = SimulationSummary::default();

        for event in fixture.events {
            match event {
                FixtureEvent::Deployment(d) => {
                    self.ingest_deployment(d).await?;
                    summary.deployments += 1;
                }
                FixtureEvent::Incident(i) => {
                    self.ingest_incident(i).await?;
                    summary.incidents += 1;
                }
                FixtureEvent::Resolve { id, resolved_time } => {
                    self.resolve_incident(&id, Some(resolved_time)).await?;
                    summary.resolved += 1;
                }
            }
        }

        info!(
            seed = spec.seed,
            deployments = summary.deployments,
            incidents = summary.incidents,
            resolved = summary.resolved,
            "Simulation ingested"
        );
        Ok(summary)
    }
}

fn align_up(now: DateTime<Utc>, alignment_secs: i64) -> DateTime<Utc> {
    if alignment_secs <= 0 {
        return now;
    }
    let secs = now.timestamp();
    let rem = secs.rem_euclid(alignment_secs);
    if rem == 0 && now.timestamp_subsec_nanos() == 0 {
        return now;
    }
    DateTime::from_timestamp(secs - rem + alignment_secs, 0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::{DeploymentStatus, PerformanceTier, Severity};
    use crate::storage::{MemoryLog, Storage};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()
    }

    fn engine() -> (MetricsEngine, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let engine = MetricsEngine::new(
            Arc::new(MemoryLog::new()),
            EngineConfig::default(),
            clock.clone(),
        );
        (engine, clock)
    }

    fn deployment(id: &str, start: DateTime<Utc>, status: DeploymentStatus) -> NewDeployment {
        NewDeployment {
            id: Some(id.to_string()),
            service: "api".to_string(),
            environment: "production".to_string(),
            status,
            start_time: Some(start),
            end_time: None,
            commit_sha: None,
            commit_time: Some(start - Duration::hours(1)),
            version: None,
        }
    }

    #[test]
    fn test_align_up() {
        let aligned = t0();
        assert_eq!(align_up(aligned, 60), aligned);
        assert_eq!(
            align_up(aligned + Duration::seconds(1), 60),
            aligned + Duration::minutes(1)
        );
        assert_eq!(
            align_up(aligned + Duration::milliseconds(5), 60),
            aligned + Duration::minutes(1)
        );
    }

    #[tokio::test]
    async fn test_rolling_range_bounds() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.rolling_range(0),
            Err(EngineError::Validation(_))
        ));
        assert!(engine.rolling_range(366).is_err());

        let range = engine.rolling_range(30).unwrap();
        assert_eq!(range.end, t0());
        assert_eq!(range.days(), 30.0);
    }

    #[tokio::test]
    async fn test_frequency_elite_but_failure_rate_low() {
        let (engine, clock) = engine();
        // Five deployments a day for two days, half of them failed
        for n in 0..10 {
            let status = if n % 2 == 0 {
                DeploymentStatus::Failed
            } else {
                DeploymentStatus::Success
            };
            let start = t0() + Duration::hours(n * 4 + 1);
            engine
                .ingest_deployment(deployment(&format!("d{n}"), start, status))
                .await
                .unwrap();
        }
        clock.set(t0() + Duration::days(2));

        let range = TimeRange::new(t0(), t0() + Duration::days(2)).unwrap();
        let report = engine.report(range, &Scope::all());
        let classification = report.data.classification;
        assert_eq!(classification.deployment_frequency, PerformanceTier::Elite);
        assert_eq!(classification.change_failure_rate, PerformanceTier::Low);
        assert_eq!(classification.overall, PerformanceTier::Low);
        // No incidents at all
        assert_eq!(report.metadata.data_quality, DataQuality::Low);
    }

    #[tokio::test]
    async fn test_resolve_defaults_to_now() {
        let (engine, clock) = engine();
        engine
            .ingest_incident(NewIncident {
                id: Some("inc-1".to_string()),
                title: "queue backlog".to_string(),
                description: None,
                service: "api".to_string(),
                environment: "production".to_string(),
                severity: Severity::Medium,
                start_time: None,
                resolved_time: None,
            })
            .await
            .unwrap();

        clock.advance(Duration::minutes(45));
        let resolved = engine.resolve_incident("inc-1", None).await.unwrap();
        assert_eq!(resolved.recovery_time(), Some(Duration::minutes(45)));

        let range = TimeRange::new(t0(), t0() + Duration::days(1)).unwrap();
        let mttr = engine.metric(MetricKind::Mttr, range, &Scope::all());
        assert_eq!(mttr.data.value, MetricReading::Text("45m".to_string()));
        assert_eq!(mttr.data.value_ms, Some(45 * 60 * 1000));
        assert_eq!(mttr.data.tier, PerformanceTier::Elite);
    }

    #[tokio::test]
    async fn test_simulate_matches_direct_fixture() {
        let (engine, _) = engine();
        let spec = FixtureSpec::new(11);
        let summary = engine.simulate(spec.clone()).await.unwrap();
        assert!(summary.deployments > 0);

        let expected = fixtures::generate(&spec, t0());
        assert_eq!(summary.deployments, expected.deployments().count());
        assert_eq!(
            engine.snapshot(None, &Scope::all()).deployments.len(),
            summary.deployments
        );

        // Replaying the same seed collides on every id
        let err = engine.simulate(spec).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_simulate_collision_ingests_nothing() {
        let (engine, _) = engine();
        let spec = FixtureSpec::new(23);
        let fixture = fixtures::generate(&spec, t0());
        let last = fixture.deployments().last().unwrap().clone();
        engine.ingest_deployment(last).await.unwrap();

        let err = engine.simulate(spec).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateId(_)));
        assert_eq!(engine.store().len(), 1);
    }

    #[tokio::test]
    async fn test_simulate_rejects_unbounded_volume() {
        let (engine, _) = engine();
        let spec = FixtureSpec {
            max_deployments_per_day: u32::MAX,
            ..FixtureSpec::new(1)
        };
        let err = engine.simulate(spec).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.store().is_empty());
    }

    #[tokio::test]
    async fn test_open_replays_log() {
        let spec = FixtureSpec::new(5);
        let log = fixtures::generate(&spec, t0())
            .into_memory_log(t0())
            .unwrap();
        let engine = MetricsEngine::open(
            Arc::new(log),
            EngineConfig::default(),
            Arc::new(FixedClock::new(t0())),
        )
        .await
        .unwrap();

        let range = engine.rolling_range(30).unwrap();
        let window = engine.compute(range, &Scope::all());
        assert!(window.summary.samples.deployments_count > 0);
        assert!(engine.ping().await.is_ok());
    }

    async fn open_sqlite(url: &str) -> MetricsEngine {
        MetricsEngine::open(
            Arc::new(Storage::new(url).await.unwrap()),
            EngineConfig::default(),
            Arc::new(FixedClock::new(t0())),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_restart_keeps_sub_millisecond_window_edges() {
        let path = std::env::temp_dir().join(format!("metrichub-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite:{}?mode=rwc", path.display());

        let start = t0() + Duration::microseconds(500);
        // Window opens inside the same millisecond as the deployment, before it
        let range = TimeRange::new(t0() + Duration::microseconds(300), t0() + Duration::days(1))
            .unwrap();

        let before = {
            let engine = open_sqlite(&url).await;
            engine
                .ingest_deployment(deployment("d1", start, DeploymentStatus::Success))
                .await
                .unwrap();
            engine.compute(range, &Scope::all()).summary
        };
        assert_eq!(before.samples.deployments_count, 1);

        let engine = open_sqlite(&url).await;
        assert_eq!(engine.deployment("d1").unwrap().start_time, start);
        assert_eq!(engine.compute(range, &Scope::all()).summary, before);

        let _ = std::fs::remove_file(&path);
    }
}
