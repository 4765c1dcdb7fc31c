//! Aggregation of events into DORA metric windows.
//!
//! # Definitions
//!
//! For a half-open window `[start, end)`, counting events by `start_time`:
//!
//! - **Deployment frequency**: deployments / max(1, window length in days)
//! - **Lead time**: median of `start_time - commit_time` over deployments
//!   that carry a commit time
//! - **MTTR**: mean of `resolved_time - start_time` over resolved incidents
//! - **Change failure rate**: failed deployments / all deployments
//!
//! Each is zero when it has no input.
//!
//! # Caching
//!
//! The [`Aggregator`] listens to store mutations and keeps a generation
//! counter per partition. A cached window is tagged with the sum of the
//! generations of the partitions it covered, read *before* the data. Any
//! later mutation in scope changes that sum, so a cached value is only ever
//! served if nothing it depends on has changed.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::model::{
    DataQuality, Deployment, Incident, MetricWindow, PartitionKey, SampleCounts, Scope, TimeRange,
    WindowSummary,
};
use crate::store::{ChangeListener, EventStore};

/// Running totals for one window. Feed it events, then [`finish`](Self::finish).
#[derive(Debug, Default, Clone)]
pub struct WindowAccumulator {
    deployments: usize,
    failed: usize,
    lead_times_ms: Vec<i64>,
    incidents: usize,
    resolved: usize,
    recovery_total_ms: i64,
}

impl WindowAccumulator {
    pub fn add_deployment(&mut self, deployment: &Deployment) {
        self.deployments += 1;
        if deployment.is_failed() {
            self.failed += 1;
        }
        if let Some(lead_time) = deployment.lead_time() {
            self.lead_times_ms.push(lead_time.num_milliseconds());
        }
    }

    pub fn add_incident(&mut self, incident: &Incident) {
        self.incidents += 1;
        if let Some(recovery) = incident.recovery_time() {
            self.resolved += 1;
            self.recovery_total_ms += recovery.num_milliseconds();
        }
    }

    pub fn finish(mut self, range: &TimeRange) -> WindowSummary {
        let deployment_frequency = self.deployments as f64 / range.days().max(1.0);

        let change_failure_rate = if self.deployments == 0 {
            0.0
        } else {
            self.failed as f64 / self.deployments as f64
        };

        let mttr = if self.resolved == 0 {
            Duration::zero()
        } else {
            Duration::milliseconds(self.recovery_total_ms / self.resolved as i64)
        };

        let lead_time = Duration::milliseconds(median(&mut self.lead_times_ms));

        WindowSummary {
            deployment_frequency,
            lead_time,
            mttr,
            change_failure_rate,
            samples: SampleCounts {
                deployments_count: self.deployments,
                failed_count: self.failed,
                lead_time_samples: self.lead_times_ms.len(),
                incidents_count: self.incidents,
                resolved_incidents_count: self.resolved,
            },
        }
    }
}

/// Median of `values`; the mean of the middle pair for even counts, 0 if empty.
fn median(values: &mut [i64]) -> i64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        let (a, b) = (values[mid - 1], values[mid]);
        a + (b - a) / 2
    }
}

/// Compute a window from scratch over arbitrary event collections.
///
/// The cached path in [`Aggregator::compute`] must always agree with this.
pub fn full_scan<'a>(
    deployments: impl IntoIterator<Item = &'a Deployment>,
    incidents: impl IntoIterator<Item = &'a Incident>,
    range: &TimeRange,
    scope: &Scope,
) -> WindowSummary {
    let mut acc = WindowAccumulator::default();
    for deployment in deployments {
        if range.contains(deployment.start_time) && scope.matches(&deployment.partition_key()) {
            acc.add_deployment(deployment);
        }
    }
    for incident in incidents {
        if range.contains(incident.start_time) && scope.matches(&incident.partition_key()) {
            acc.add_incident(incident);
        }
    }
    acc.finish(range)
}

/// Judge how much a window's numbers can be trusted.
///
/// Low when either side of the picture is missing (no deployments or no
/// resolved incidents). High when deployments, lead-time samples, and
/// resolved incidents each reach `min_samples`. Medium otherwise.
pub fn assess_quality(samples: &SampleCounts, min_samples: usize) -> DataQuality {
    if samples.deployments_count == 0 || samples.resolved_incidents_count == 0 {
        DataQuality::Low
    } else if samples.deployments_count >= min_samples
        && samples.lead_time_samples >= min_samples
        && samples.resolved_incidents_count >= min_samples
    {
        DataQuality::High
    } else {
        DataQuality::Medium
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    range: TimeRange,
    scope: Scope,
}

#[derive(Debug, Clone)]
struct CachedWindow {
    stamp: u64,
    window: MetricWindow,
}

/// Incremental metric computation with a cache invalidated per partition.
#[derive(Debug)]
pub struct Aggregator {
    generations: DashMap<PartitionKey, u64>,
    windows: Mutex<HashMap<WindowKey, CachedWindow>>,
    capacity: usize,
}

impl Aggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            generations: DashMap::new(),
            windows: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Mutations seen so far for `partition`.
    pub fn generation(&self, partition: &PartitionKey) -> u64 {
        self.generations.get(partition).map(|g| *g).unwrap_or(0)
    }

    fn stamp(&self, scope: &Scope) -> u64 {
        self.generations
            .iter()
            .filter(|entry| scope.matches(entry.key()))
            .map(|entry| *entry.value())
            .sum()
    }

    /// Metrics for `range` and `scope`.
    ///
    /// Served from cache when no partition in scope has changed since the
    /// cached value was computed; recomputed from the store otherwise.
    ///
    /// # Arguments
    ///
    /// * `store` - Source of events
    /// * `range` - Half-open window, events counted by start time
    /// * `scope` - Partitions to include
    /// * `now` - Stamped as `calculated_at` on a fresh computation
    pub fn compute(
        &self,
        store: &EventStore,
        range: TimeRange,
        scope: &Scope,
        now: DateTime<Utc>,
    ) -> MetricWindow {
        let key = WindowKey {
            range,
            scope: scope.clone(),
        };
        let stamp = self.stamp(scope);

        if let Some(cached) = self.cached(&key, stamp) {
            debug!(start = %range.start, end = %range.end, "Metric window cache hit");
            return cached;
        }

        let mut acc = WindowAccumulator::default();
        store.visit_window(&range, scope, |_, deployments, incidents| {
            deployments.iter().for_each(|d| acc.add_deployment(d));
            incidents.iter().for_each(|i| acc.add_incident(i));
        });

        let window = MetricWindow {
            time_range: range,
            scope: scope.clone(),
            summary: acc.finish(&range),
            calculated_at: now,
        };
        debug!(
            start = %range.start,
            end = %range.end,
            deployments = window.summary.samples.deployments_count,
            incidents = window.summary.samples.incidents_count,
            "Metric window computed"
        );

        self.remember(key, stamp, window.clone());
        window
    }

    fn cached(&self, key: &WindowKey, stamp: u64) -> Option<MetricWindow> {
        let windows = self.windows.lock();
        windows
            .get(key)
            .filter(|cached| cached.stamp == stamp)
            .map(|cached| cached.window.clone())
    }

    fn remember(&self, key: WindowKey, stamp: u64, window: MetricWindow) {
        if self.capacity == 0 {
            return;
        }
        let mut windows = self.windows.lock();
        if windows.len() >= self.capacity && !windows.contains_key(&key) {
            windows.clear();
        }
        windows.insert(key, CachedWindow { stamp, window });
    }

    /// Number of windows currently cached.
    pub fn cached_windows(&self) -> usize {
        self.windows.lock().len()
    }
}

impl ChangeListener for Aggregator {
    fn partition_changed(&self, partition: &PartitionKey) {
        *self.generations.entry(partition.clone()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeploymentStatus, NewDeployment, NewIncident, Severity};
    use crate::storage::MemoryLog;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
    }

    fn deployment(id: &str, start: DateTime<Utc>, status: DeploymentStatus) -> Deployment {
        NewDeployment {
            id: Some(id.to_string()),
            service: "api".to_string(),
            environment: "production".to_string(),
            status,
            start_time: Some(start),
            end_time: None,
            commit_sha: None,
            commit_time: Some(start - Duration::hours(2)),
            version: None,
        }
        .into_deployment(start)
        .unwrap()
    }

    fn incident(id: &str, start: DateTime<Utc>, recovery: Option<Duration>) -> Incident {
        NewIncident {
            id: Some(id.to_string()),
            title: "outage".to_string(),
            description: None,
            service: "api".to_string(),
            environment: "production".to_string(),
            severity: Severity::High,
            start_time: Some(start),
            resolved_time: recovery.map(|r| start + r),
        }
        .into_incident(start)
        .unwrap()
    }

    fn engine_parts() -> (Arc<Aggregator>, EventStore) {
        let aggregator = Arc::new(Aggregator::new(16));
        let store = EventStore::new(Arc::new(MemoryLog::new()), aggregator.clone());
        (aggregator, store)
    }

    #[test]
    fn test_ten_deployments_one_failed() {
        let range = TimeRange::new(t0(), t0() + Duration::days(10)).unwrap();
        let deployments: Vec<_> = (0..10)
            .map(|day| {
                let status = if day == 3 {
                    DeploymentStatus::Failed
                } else {
                    DeploymentStatus::Success
                };
                deployment(&format!("d{day}"), t0() + Duration::days(day) + Duration::hours(1), status)
            })
            .collect();

        let summary = full_scan(&deployments, &Vec::<Incident>::new(), &range, &Scope::all());
        assert_eq!(summary.samples.deployments_count, 10);
        assert_eq!(summary.samples.failed_count, 1);
        assert!((summary.change_failure_rate - 0.1).abs() < 1e-9);
        assert!((summary.deployment_frequency - 1.0).abs() < 1e-9);
        assert_eq!(summary.lead_time, Duration::hours(2));
    }

    #[test]
    fn test_mttr_counts_resolved_incidents_only() {
        let range = TimeRange::new(t0(), t0() + Duration::days(1)).unwrap();
        let incidents = vec![
            incident("resolved", t0() + Duration::hours(1), Some(Duration::minutes(45))),
            incident("open", t0() + Duration::hours(2), None),
        ];

        let summary = full_scan(&Vec::<Deployment>::new(), &incidents, &range, &Scope::all());
        assert_eq!(summary.mttr, Duration::minutes(45));
        assert_eq!(summary.samples.incidents_count, 2);
        assert_eq!(summary.samples.resolved_incidents_count, 1);
    }

    #[tokio::test]
    async fn test_resolved_incident_only_counts_where_it_started() {
        let (aggregator, store) = engine_parts();
        let opened = t0() + Duration::hours(6);
        store
            .append_incident(
                NewIncident {
                    id: Some("inc-1".to_string()),
                    title: "checkout errors".to_string(),
                    description: None,
                    service: "api".to_string(),
                    environment: "production".to_string(),
                    severity: Severity::Critical,
                    start_time: Some(opened),
                    resolved_time: None,
                },
                t0(),
            )
            .await
            .unwrap();
        store
            .resolve_incident("inc-1", opened + Duration::minutes(45))
            .await
            .unwrap();

        let window = |start: DateTime<Utc>, end: DateTime<Utc>| {
            let range = TimeRange::new(start, end).unwrap();
            aggregator.compute(&store, range, &Scope::all(), t0()).summary
        };

        for summary in [
            window(opened - Duration::hours(1), opened + Duration::hours(1)),
            // Resolution falls after the window, the start does not
            window(opened, opened + Duration::minutes(1)),
        ] {
            assert_eq!(summary.mttr, Duration::minutes(45));
            assert_eq!(summary.samples.resolved_incidents_count, 1);
        }

        for summary in [
            window(t0(), opened),
            window(t0(), opened - Duration::hours(1)),
            // Starts between the incident opening and its resolution
            window(opened + Duration::minutes(1), opened + Duration::days(1)),
            window(opened + Duration::hours(1), opened + Duration::days(1)),
        ] {
            assert_eq!(summary.mttr, Duration::zero());
            assert_eq!(summary.samples.incidents_count, 0);
            assert_eq!(summary.samples.resolved_incidents_count, 0);
        }
    }

    #[test]
    fn test_empty_window_is_all_zero() {
        let range = TimeRange::new(t0(), t0() + Duration::days(30)).unwrap();
        let summary = full_scan(&Vec::<Deployment>::new(), &Vec::<Incident>::new(), &range, &Scope::all());
        assert_eq!(summary, WindowSummary::empty());
    }

    #[test]
    fn test_window_is_half_open() {
        let range = TimeRange::new(t0(), t0() + Duration::days(1)).unwrap();
        let deployments = vec![
            deployment("at-start", t0(), DeploymentStatus::Success),
            deployment("at-end", t0() + Duration::days(1), DeploymentStatus::Success),
        ];
        let summary = full_scan(&deployments, &Vec::<Incident>::new(), &range, &Scope::all());
        assert_eq!(summary.samples.deployments_count, 1);
    }

    #[test]
    fn test_short_window_frequency_uses_one_day_floor() {
        let range = TimeRange::new(t0(), t0() + Duration::hours(6)).unwrap();
        let deployments = vec![
            deployment("a", t0(), DeploymentStatus::Success),
            deployment("b", t0() + Duration::hours(1), DeploymentStatus::Success),
        ];
        let summary = full_scan(&deployments, &Vec::<Incident>::new(), &range, &Scope::all());
        assert!((summary.deployment_frequency - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&mut []), 0);
        assert_eq!(median(&mut [5, 1, 3]), 3);
        assert_eq!(median(&mut [4, 1, 3, 2]), 2);
        assert_eq!(median(&mut [10, 20]), 15);
    }

    #[test]
    fn test_data_quality() {
        let mut samples = SampleCounts::default();
        assert_eq!(assess_quality(&samples, 5), DataQuality::Low);

        samples.deployments_count = 3;
        samples.lead_time_samples = 3;
        samples.resolved_incidents_count = 1;
        assert_eq!(assess_quality(&samples, 5), DataQuality::Medium);

        samples.deployments_count = 5;
        samples.lead_time_samples = 5;
        samples.resolved_incidents_count = 5;
        assert_eq!(assess_quality(&samples, 5), DataQuality::High);
    }

    #[tokio::test]
    async fn test_compute_is_idempotent_and_cached() {
        let (aggregator, store) = engine_parts();
        for n in 0..3 {
            let new = NewDeployment {
                id: Some(format!("d{n}")),
                service: "api".to_string(),
                environment: "production".to_string(),
                status: DeploymentStatus::Success,
                start_time: Some(t0() + Duration::hours(n)),
                end_time: None,
                commit_sha: None,
                commit_time: None,
                version: None,
            };
            store.append_deployment(new, t0()).await.unwrap();
        }

        let range = TimeRange::new(t0(), t0() + Duration::days(1)).unwrap();
        let first = aggregator.compute(&store, range, &Scope::all(), t0());
        let second = aggregator.compute(&store, range, &Scope::all(), t0() + Duration::minutes(1));
        assert_eq!(first, second);
        assert_eq!(aggregator.cached_windows(), 1);
    }

    #[tokio::test]
    async fn test_append_invalidates_cached_window() {
        let (aggregator, store) = engine_parts();
        let range = TimeRange::new(t0(), t0() + Duration::days(1)).unwrap();

        let before = aggregator.compute(&store, range, &Scope::all(), t0());
        assert_eq!(before.summary.samples.incidents_count, 0);

        store
            .append_incident(
                NewIncident {
                    id: Some("inc-1".to_string()),
                    title: "outage".to_string(),
                    description: None,
                    service: "api".to_string(),
                    environment: "production".to_string(),
                    severity: Severity::Medium,
                    start_time: Some(t0() + Duration::hours(1)),
                    resolved_time: None,
                },
                t0(),
            )
            .await
            .unwrap();
        let after_append = aggregator.compute(&store, range, &Scope::all(), t0());
        assert_eq!(after_append.summary.samples.incidents_count, 1);
        assert_eq!(after_append.summary.mttr, Duration::zero());

        store
            .resolve_incident("inc-1", t0() + Duration::hours(1) + Duration::minutes(45))
            .await
            .unwrap();
        let after_resolve = aggregator.compute(&store, range, &Scope::all(), t0());
        assert_eq!(after_resolve.summary.mttr, Duration::minutes(45));
    }

    #[tokio::test]
    async fn test_unrelated_partition_keeps_cache() {
        let (aggregator, store) = engine_parts();
        let range = TimeRange::new(t0(), t0() + Duration::days(1)).unwrap();
        let api = Scope::service("api");

        aggregator.compute(&store, range, &api, t0());
        let web = NewDeployment {
            id: Some("w1".to_string()),
            service: "web".to_string(),
            environment: "production".to_string(),
            status: DeploymentStatus::Success,
            start_time: Some(t0()),
            end_time: None,
            commit_sha: None,
            commit_time: None,
            version: None,
        };
        store.append_deployment(web, t0()).await.unwrap();

        assert_eq!(aggregator.generation(&PartitionKey::new("web", "production")), 1);
        assert_eq!(aggregator.generation(&PartitionKey::new("api", "production")), 0);
        let window = aggregator.compute(&store, range, &api, t0() + Duration::hours(1));
        // Served from cache: the calculation time did not move
        assert_eq!(window.calculated_at, t0());
    }

    #[test]
    fn test_cache_flushes_at_capacity() {
        let aggregator = Aggregator::new(2);
        let store = EventStore::new(Arc::new(MemoryLog::new()), Arc::new(Aggregator::new(0)));
        for days in 1..=3 {
            let range = TimeRange::last_days(t0(), days).unwrap();
            aggregator.compute(&store, range, &Scope::all(), t0());
        }
        assert!(aggregator.cached_windows() <= 2);
    }
}
