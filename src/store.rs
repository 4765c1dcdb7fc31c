//! Partitioned, append-only event store.
//!
//! Events live in per-(service, environment) partitions, each holding
//! deployments and incidents sorted by `start_time`.
//!
//! # Concurrency
//!
//! - Each partition has an async write sequencer. Mutations of one partition
//!   run one at a time; different partitions never contend.
//! - The sequencer stays held across the durable log write. Per partition the
//!   log therefore sees writes in index order, and a resolve or completion
//!   checks, persists, and publishes its transition without another writer
//!   interleaving. Durable writes of one partition queue behind each other;
//!   readers never wait on them.
//! - The in-memory index sits behind a `RwLock` that is held only for the
//!   insert itself, or for a binary search plus copy on the read side. It is
//!   never held across an `.await`, so durable writes never block readers.
//! - Ids are unique across partitions. They are reserved in a concurrent
//!   registry before the durable write and released if that write fails.
//! - Every mutation updates the index *before* notifying the
//!   [`ChangeListener`], so a reader that observes a notification also
//!   observes the data behind it.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::lifecycle;
use crate::model::{
    Deployment, DeploymentCompletion, Event, Incident, NewDeployment, NewIncident, PartitionKey,
    Scope, SystemState, TimeRange,
};
use crate::storage::EventLog;

/// Receives a notification after every mutation of a partition.
pub trait ChangeListener: Send + Sync {
    fn partition_changed(&self, partition: &PartitionKey);
}

#[derive(Debug, Default)]
struct PartitionIndex {
    deployments: Vec<Deployment>,
    incidents: Vec<Incident>,
}

impl PartitionIndex {
    // Events mostly arrive in time order, so the insert point is usually the end.
    fn insert_deployment(&mut self, deployment: Deployment) {
        let pos = self
            .deployments
            .partition_point(|d| d.start_time <= deployment.start_time);
        self.deployments.insert(pos, deployment);
    }

    fn insert_incident(&mut self, incident: Incident) {
        let pos = self
            .incidents
            .partition_point(|i| i.start_time <= incident.start_time);
        self.incidents.insert(pos, incident);
    }

    fn deployments_in(&self, range: Option<&TimeRange>) -> &[Deployment] {
        in_range(&self.deployments, range, |d| d.start_time)
    }

    fn incidents_in(&self, range: Option<&TimeRange>) -> &[Incident] {
        in_range(&self.incidents, range, |i| i.start_time)
    }

    fn deployment_mut(&mut self, id: &str, start_time: DateTime<Utc>) -> Option<&mut Deployment> {
        let lo = self.deployments.partition_point(|d| d.start_time < start_time);
        let hi = self.deployments.partition_point(|d| d.start_time <= start_time);
        self.deployments[lo..hi].iter_mut().find(|d| d.id == id)
    }

    fn incident_mut(&mut self, id: &str, start_time: DateTime<Utc>) -> Option<&mut Incident> {
        let lo = self.incidents.partition_point(|i| i.start_time < start_time);
        let hi = self.incidents.partition_point(|i| i.start_time <= start_time);
        self.incidents[lo..hi].iter_mut().find(|i| i.id == id)
    }

    fn deployment(&self, id: &str, start_time: DateTime<Utc>) -> Option<&Deployment> {
        let lo = self.deployments.partition_point(|d| d.start_time < start_time);
        let hi = self.deployments.partition_point(|d| d.start_time <= start_time);
        self.deployments[lo..hi].iter().find(|d| d.id == id)
    }

    fn incident(&self, id: &str, start_time: DateTime<Utc>) -> Option<&Incident> {
        let lo = self.incidents.partition_point(|i| i.start_time < start_time);
        let hi = self.incidents.partition_point(|i| i.start_time <= start_time);
        self.incidents[lo..hi].iter().find(|i| i.id == id)
    }
}

/// The sub-slice of `events` (sorted by start time) with start in `[start, end)`.
fn in_range<'a, T>(
    events: &'a [T],
    range: Option<&TimeRange>,
    start_of: impl Fn(&T) -> DateTime<Utc>,
) -> &'a [T] {
    match range {
        None => events,
        Some(range) => {
            let lo = events.partition_point(|e| start_of(e) < range.start);
            let hi = events.partition_point(|e| start_of(e) < range.end);
            &events[lo..hi]
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    writer: Mutex<()>,
    index: RwLock<PartitionIndex>,
}

impl Partition {
    fn read(&self) -> RwLockReadGuard<'_, PartitionIndex> {
        self.index.read()
    }

    fn write(&self) -> RwLockWriteGuard<'_, PartitionIndex> {
        self.index.write()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Deployment,
    Incident,
}

/// Where a committed event lives.
#[derive(Debug, Clone)]
struct EventRef {
    kind: EventKind,
    partition: PartitionKey,
    start_time: DateTime<Utc>,
}

#[derive(Debug)]
enum Slot {
    /// Id claimed by an append whose durable write is in flight.
    Reserved,
    Committed(EventRef),
}

/// Run a mutation on its own task so it reaches a definite outcome even if
/// the caller stops waiting for it.
pub(crate) async fn detached<T, F>(mutation: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(mutation)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("mutation task failed: {e}")))?
}

/// The event store: partitions, id registry, and the durable log behind them.
pub struct EventStore {
    log: Arc<dyn EventLog>,
    listener: Arc<dyn ChangeListener>,
    partitions: DashMap<PartitionKey, Arc<Partition>>,
    ids: DashMap<String, Slot>,
}

impl EventStore {
    pub fn new(log: Arc<dyn EventLog>, listener: Arc<dyn ChangeListener>) -> Self {
        Self {
            log,
            listener,
            partitions: DashMap::new(),
            ids: DashMap::new(),
        }
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    fn partition(&self, key: &PartitionKey) -> Arc<Partition> {
        Arc::clone(self.partitions.entry(key.clone()).or_default().value())
    }

    fn existing_partition(&self, key: &PartitionKey) -> Option<Arc<Partition>> {
        self.partitions.get(key).map(|p| Arc::clone(p.value()))
    }

    fn reserve(&self, id: &str) -> Result<()> {
        match self.ids.entry(id.to_string()) {
            Entry::Occupied(_) => Err(EngineError::DuplicateId(id.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(Slot::Reserved);
                Ok(())
            }
        }
    }

    fn commit(&self, id: &str, event: EventRef) {
        self.ids.insert(id.to_string(), Slot::Committed(event));
    }

    fn release(&self, id: &str) {
        self.ids.remove(id);
    }

    fn lookup(&self, id: &str, kind: EventKind) -> Option<EventRef> {
        self.ids.get(id).and_then(|slot| match slot.value() {
            Slot::Committed(event) if event.kind == kind => Some(event.clone()),
            _ => None,
        })
    }

    /// Validate, persist, and index a deployment.
    ///
    /// Fails with `Validation` for contradictory timestamps, `DuplicateId` if
    /// the id is already taken, and `Storage` if the durable write fails.
    pub async fn append_deployment(
        &self,
        new: NewDeployment,
        received_at: DateTime<Utc>,
    ) -> Result<Deployment> {
        let deployment = new.into_deployment(received_at)?;
        let key = deployment.partition_key();

        self.reserve(&deployment.id)?;
        let partition = self.partition(&key);
        let _sequence = partition.writer.lock().await;

        if let Err(e) = self.log.record_deployment(&deployment).await {
            self.release(&deployment.id);
            warn!(id = %deployment.id, partition = %key, error = %e, "Failed to persist deployment");
            return Err(EngineError::Storage(e));
        }

        partition.write().insert_deployment(deployment.clone());
        self.commit(
            &deployment.id,
            EventRef {
                kind: EventKind::Deployment,
                partition: key.clone(),
                start_time: deployment.start_time,
            },
        );
        self.listener.partition_changed(&key);

        debug!(
            id = %deployment.id,
            partition = %key,
            status = %deployment.status,
            "Deployment appended"
        );
        Ok(deployment)
    }

    /// Validate, persist, and index an incident.
    pub async fn append_incident(
        &self,
        new: NewIncident,
        received_at: DateTime<Utc>,
    ) -> Result<Incident> {
        let incident = new.into_incident(received_at)?;
        let key = incident.partition_key();

        self.reserve(&incident.id)?;
        let partition = self.partition(&key);
        let _sequence = partition.writer.lock().await;

        if let Err(e) = self.log.record_incident(&incident).await {
            self.release(&incident.id);
            warn!(id = %incident.id, partition = %key, error = %e, "Failed to persist incident");
            return Err(EngineError::Storage(e));
        }

        partition.write().insert_incident(incident.clone());
        self.commit(
            &incident.id,
            EventRef {
                kind: EventKind::Incident,
                partition: key.clone(),
                start_time: incident.start_time,
            },
        );
        self.listener.partition_changed(&key);

        debug!(
            id = %incident.id,
            partition = %key,
            severity = incident.severity.as_str(),
            "Incident appended"
        );
        Ok(incident)
    }

    /// Resolve an open incident.
    ///
    /// Fails with `NotFound` for an unknown id, `AlreadyResolved` on a second
    /// resolve, and `InvalidTimestamp` if `resolved_time` precedes the start.
    pub async fn resolve_incident(
        &self,
        id: &str,
        resolved_time: DateTime<Utc>,
    ) -> Result<Incident> {
        let not_found = || EngineError::NotFound(format!("incident {id}"));
        let event = self.lookup(id, EventKind::Incident).ok_or_else(not_found)?;
        let partition = self.existing_partition(&event.partition).ok_or_else(not_found)?;
        let _sequence = partition.writer.lock().await;

        let current = partition
            .read()
            .incident(id, event.start_time)
            .cloned()
            .ok_or_else(not_found)?;
        let resolved_time = lifecycle::resolve(&current, resolved_time)?;

        self.log.record_resolution(id, resolved_time).await?;

        let resolved = {
            let mut index = partition.write();
            let incident = index
                .incident_mut(id, event.start_time)
                .ok_or_else(not_found)?;
            incident.resolved_time = Some(resolved_time);
            incident.clone()
        };
        self.listener.partition_changed(&event.partition);

        debug!(id, partition = %event.partition, "Incident resolved");
        Ok(resolved)
    }

    /// Move an in-progress deployment to its terminal status.
    pub async fn complete_deployment(
        &self,
        id: &str,
        completion: DeploymentCompletion,
    ) -> Result<Deployment> {
        let not_found = || EngineError::NotFound(format!("deployment {id}"));
        let event = self
            .lookup(id, EventKind::Deployment)
            .ok_or_else(not_found)?;
        let partition = self.existing_partition(&event.partition).ok_or_else(not_found)?;
        let _sequence = partition.writer.lock().await;

        let current = partition
            .read()
            .deployment(id, event.start_time)
            .cloned()
            .ok_or_else(not_found)?;
        let (status, end_time) = lifecycle::complete(&current, &completion)?;

        self.log.record_completion(id, status, end_time).await?;

        let completed = {
            let mut index = partition.write();
            let deployment = index
                .deployment_mut(id, event.start_time)
                .ok_or_else(not_found)?;
            deployment.status = status;
            deployment.end_time = end_time;
            deployment.clone()
        };
        self.listener.partition_changed(&event.partition);

        debug!(id, partition = %event.partition, status = %status, "Deployment completed");
        Ok(completed)
    }

    /// Rebuild the in-memory indices from the durable log.
    ///
    /// Intended for an empty store at startup; ids already present are skipped.
    pub async fn restore(&self) -> Result<usize> {
        let events = self.log.load().await?;
        let mut touched = BTreeSet::new();
        let mut restored = 0;

        for deployment in events.deployments {
            if self.reserve(&deployment.id).is_err() {
                warn!(id = %deployment.id, "Skipping duplicate deployment in log");
                continue;
            }
            let key = deployment.partition_key();
            let event = EventRef {
                kind: EventKind::Deployment,
                partition: key.clone(),
                start_time: deployment.start_time,
            };
            let id = deployment.id.clone();
            self.partition(&key).write().insert_deployment(deployment);
            self.commit(&id, event);
            touched.insert(key);
            restored += 1;
        }

        for incident in events.incidents {
            if self.reserve(&incident.id).is_err() {
                warn!(id = %incident.id, "Skipping duplicate incident in log");
                continue;
            }
            let key = incident.partition_key();
            let event = EventRef {
                kind: EventKind::Incident,
                partition: key.clone(),
                start_time: incident.start_time,
            };
            let id = incident.id.clone();
            self.partition(&key).write().insert_incident(incident);
            self.commit(&id, event);
            touched.insert(key);
            restored += 1;
        }

        for key in &touched {
            self.listener.partition_changed(key);
        }

        info!(events = restored, partitions = touched.len(), "Event store restored");
        Ok(restored)
    }

    /// Matching partitions in key order, so reads are deterministic.
    fn partitions_in(&self, scope: &Scope) -> Vec<(PartitionKey, Arc<Partition>)> {
        let mut partitions: Vec<_> = self
            .partitions
            .iter()
            .filter(|entry| scope.matches(entry.key()))
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        partitions.sort_by(|a, b| a.0.cmp(&b.0));
        partitions
    }

    /// Call `visit` with each matching partition's events whose start falls in
    /// `range`. Each partition is seen as one consistent snapshot.
    pub fn visit_window<F>(&self, range: &TimeRange, scope: &Scope, mut visit: F)
    where
        F: FnMut(&PartitionKey, &[Deployment], &[Incident]),
    {
        for (key, partition) in self.partitions_in(scope) {
            let index = partition.read();
            visit(
                &key,
                index.deployments_in(Some(range)),
                index.incidents_in(Some(range)),
            );
        }
    }

    /// Events starting in `range`, merged lazily in `start_time` order.
    pub fn query(&self, range: &TimeRange, scope: &Scope) -> EventQuery {
        let mut runs = Vec::new();
        for (_, partition) in self.partitions_in(scope) {
            let index = partition.read();
            runs.push(
                index
                    .deployments_in(Some(range))
                    .iter()
                    .cloned()
                    .map(Event::Deployment)
                    .collect::<Vec<_>>(),
            );
            runs.push(
                index
                    .incidents_in(Some(range))
                    .iter()
                    .cloned()
                    .map(Event::Incident)
                    .collect(),
            );
        }
        runs.retain(|run| !run.is_empty());
        EventQuery { runs }
    }

    /// Deployments and incidents in scope, each sorted by start time.
    /// Without a range, everything the store holds.
    pub fn snapshot(&self, range: Option<&TimeRange>, scope: &Scope) -> SystemState {
        let mut state = SystemState::default();
        for (_, partition) in self.partitions_in(scope) {
            let index = partition.read();
            state
                .deployments
                .extend_from_slice(index.deployments_in(range));
            state.incidents.extend_from_slice(index.incidents_in(range));
        }
        state.deployments.sort_by_key(|d| d.start_time);
        state.incidents.sort_by_key(|i| i.start_time);
        state
    }

    /// Deployments in scope sorted by start time; all of them without a range.
    pub fn deployments(&self, range: Option<&TimeRange>, scope: &Scope) -> Vec<Deployment> {
        let mut deployments = Vec::new();
        for (_, partition) in self.partitions_in(scope) {
            deployments.extend_from_slice(partition.read().deployments_in(range));
        }
        deployments.sort_by_key(|d| d.start_time);
        deployments
    }

    /// Incidents in scope sorted by start time; all of them without a range.
    pub fn incidents(&self, range: Option<&TimeRange>, scope: &Scope) -> Vec<Incident> {
        let mut incidents = Vec::new();
        for (_, partition) in self.partitions_in(scope) {
            incidents.extend_from_slice(partition.read().incidents_in(range));
        }
        incidents.sort_by_key(|i| i.start_time);
        incidents
    }

    pub fn deployment(&self, id: &str) -> Result<Deployment> {
        let not_found = || EngineError::NotFound(format!("deployment {id}"));
        let event = self
            .lookup(id, EventKind::Deployment)
            .ok_or_else(not_found)?;
        let partition = self.existing_partition(&event.partition).ok_or_else(not_found)?;
        let index = partition.read();
        index
            .deployment(id, event.start_time)
            .cloned()
            .ok_or_else(not_found)
    }

    pub fn incident(&self, id: &str) -> Result<Incident> {
        let not_found = || EngineError::NotFound(format!("incident {id}"));
        let event = self.lookup(id, EventKind::Incident).ok_or_else(not_found)?;
        let partition = self.existing_partition(&event.partition).ok_or_else(not_found)?;
        let index = partition.read();
        index
            .incident(id, event.start_time)
            .cloned()
            .ok_or_else(not_found)
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<_> = self.partitions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of committed events.
    pub fn len(&self) -> usize {
        self.ids
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Committed(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of [`EventStore::query`].
///
/// Holds one sorted run per partition and event kind. Iterating merges the
/// runs on the fly; iterate again to restart from the beginning.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    runs: Vec<Vec<Event>>,
}

impl EventQuery {
    pub fn iter(&self) -> EventIter<'_> {
        EventIter {
            runs: &self.runs,
            cursors: vec![0; self.runs.len()],
        }
    }

    pub fn len(&self) -> usize {
        self.runs.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl<'a> IntoIterator for &'a EventQuery {
    type Item = &'a Event;
    type IntoIter = EventIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct EventIter<'a> {
    runs: &'a [Vec<Event>],
    cursors: Vec<usize>,
}

impl<'a> Iterator for EventIter<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<&'a Event> {
        let runs = self.runs;
        let mut best: Option<(usize, &'a Event)> = None;

        for (i, run) in runs.iter().enumerate() {
            let Some(candidate) = run.get(self.cursors[i]) else {
                continue;
            };
            // Ties go to the earlier run
            match best {
                Some((_, current)) if current.start_time() <= candidate.start_time() => {}
                _ => best = Some((i, candidate)),
            }
        }

        let (i, event) = best?;
        self.cursors[i] += 1;
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeploymentStatus, Severity};
    use crate::storage::MemoryLog;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        notifications: AtomicUsize,
    }

    impl ChangeListener for CountingListener {
        fn partition_changed(&self, _partition: &PartitionKey) {
            self.notifications.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn store() -> (Arc<EventStore>, Arc<CountingListener>) {
        let listener = Arc::new(CountingListener::default());
        let store = EventStore::new(Arc::new(MemoryLog::new()), listener.clone());
        (Arc::new(store), listener)
    }

    fn deployment(id: &str, service: &str, start: DateTime<Utc>) -> NewDeployment {
        NewDeployment {
            id: Some(id.to_string()),
            service: service.to_string(),
            environment: "production".to_string(),
            status: DeploymentStatus::Success,
            start_time: Some(start),
            end_time: None,
            commit_sha: None,
            commit_time: None,
            version: None,
        }
    }

    fn incident(id: &str, start: DateTime<Utc>) -> NewIncident {
        NewIncident {
            id: Some(id.to_string()),
            title: "error rate".to_string(),
            description: None,
            service: "api".to_string(),
            environment: "production".to_string(),
            severity: Severity::High,
            start_time: Some(start),
            resolved_time: None,
        }
    }

    #[tokio::test]
    async fn test_append_notifies_listener() {
        let (store, listener) = store();
        store
            .append_deployment(deployment("d1", "api", t0()), t0())
            .await
            .unwrap();
        assert_eq!(listener.notifications.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_typed_listings_merge_partitions_in_order() {
        let (store, _) = store();
        for (id, service, hours) in [("d1", "web", 3), ("d2", "api", 1), ("d3", "web", 0)] {
            store
                .append_deployment(deployment(id, service, t0() + Duration::hours(hours)), t0())
                .await
                .unwrap();
        }
        store
            .append_incident(incident("i1", t0() + Duration::hours(2)), t0())
            .await
            .unwrap();

        let ids: Vec<String> = store
            .deployments(None, &Scope::all())
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, ["d3", "d2", "d1"]);

        let range = TimeRange::new(t0() + Duration::hours(1), t0() + Duration::hours(3)).unwrap();
        let windowed = store.deployments(Some(&range), &Scope::service("web"));
        assert!(windowed.is_empty());
        assert_eq!(store.incidents(Some(&range), &Scope::all()).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_across_kinds() {
        let (store, listener) = store();
        store
            .append_deployment(deployment("same", "api", t0()), t0())
            .await
            .unwrap();

        let err = store
            .append_incident(incident("same", t0()), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateId(_)));
        assert_eq!(listener.notifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_does_not_reserve_id() {
        let (store, _) = store();
        let mut bad = deployment("d1", "api", t0());
        bad.end_time = Some(t0() - Duration::minutes(1));
        let err = store.append_deployment(bad, t0()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // The id is still free
        store
            .append_deployment(deployment("d1", "api", t0()), t0())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_appends_are_sorted() {
        let (store, _) = store();
        for (id, hours) in [("d3", 3), ("d1", 1), ("d2", 2)] {
            store
                .append_deployment(deployment(id, "api", t0() + Duration::hours(hours)), t0())
                .await
                .unwrap();
        }

        let state = store.snapshot(None, &Scope::all());
        let ids: Vec<_> = state.deployments.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2", "d3"]);
    }

    #[tokio::test]
    async fn test_query_merges_partitions_in_order() {
        let (store, _) = store();
        store
            .append_deployment(deployment("web-1", "web", t0() + Duration::hours(2)), t0())
            .await
            .unwrap();
        store
            .append_deployment(deployment("api-1", "api", t0() + Duration::hours(1)), t0())
            .await
            .unwrap();
        store
            .append_incident(incident("inc-1", t0() + Duration::hours(3)), t0())
            .await
            .unwrap();
        store
            .append_deployment(deployment("api-2", "api", t0() + Duration::days(5)), t0())
            .await
            .unwrap();

        let range = TimeRange::last_days(t0() + Duration::days(1), 1).unwrap();
        let query = store.query(&range, &Scope::all());
        let ids: Vec<_> = query.iter().map(Event::id).collect();
        assert_eq!(ids, vec!["api-1", "web-1", "inc-1"]);

        // Restartable: a second pass yields the same sequence
        let again: Vec<_> = query.iter().map(Event::id).collect();
        assert_eq!(ids, again);
        assert_eq!(query.len(), 3);

        let api_only = store.query(&range, &Scope::service("api"));
        assert_eq!(api_only.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_resolve_incident_lifecycle() {
        let (store, _) = store();
        store.append_incident(incident("inc-1", t0()), t0()).await.unwrap();

        let resolved = store
            .resolve_incident("inc-1", t0() + Duration::minutes(45))
            .await
            .unwrap();
        assert_eq!(resolved.recovery_time(), Some(Duration::minutes(45)));

        let err = store
            .resolve_incident("inc-1", t0() + Duration::hours(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));

        // The first resolution stands
        let stored = store.incident("inc-1").unwrap();
        assert_eq!(stored.resolved_time, Some(t0() + Duration::minutes(45)));
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let (store, _) = store();
        store.append_incident(incident("inc-1", t0()), t0()).await.unwrap();
        store
            .append_deployment(deployment("d1", "api", t0()), t0())
            .await
            .unwrap();

        let err = store.resolve_incident("missing", t0()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        // Deployment ids are not incidents
        let err = store.resolve_incident("d1", t0()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let err = store
            .resolve_incident("inc-1", t0() - Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTimestamp(_)));
        assert!(!store.incident("inc-1").unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_complete_deployment() {
        let (store, _) = store();
        let mut running = deployment("d1", "api", t0());
        running.status = DeploymentStatus::InProgress;
        store.append_deployment(running, t0()).await.unwrap();

        let completed = store
            .complete_deployment(
                "d1",
                DeploymentCompletion {
                    status: DeploymentStatus::Failed,
                    end_time: Some(t0() + Duration::minutes(3)),
                },
            )
            .await
            .unwrap();
        assert_eq!(completed.status, DeploymentStatus::Failed);

        let err = store
            .complete_deployment(
                "d1",
                DeploymentCompletion {
                    status: DeploymentStatus::Success,
                    end_time: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(
            store.deployment("d1").unwrap().status,
            DeploymentStatus::Failed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends() {
        let (store, listener) = store();
        let mut handles = Vec::new();

        for task in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let service = if task % 2 == 0 { "api" } else { "web" };
                for n in 0..25 {
                    let start = t0() + Duration::minutes(i64::from(task * 100 + n));
                    store
                        .append_deployment(deployment(&format!("d-{task}-{n}"), service, start), t0())
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 200);
        assert_eq!(listener.notifications.load(Ordering::SeqCst), 200);
        let state = store.snapshot(None, &Scope::all());
        assert_eq!(state.deployments.len(), 200);
        assert!(
            state
                .deployments
                .windows(2)
                .all(|w| w[0].start_time <= w[1].start_time)
        );
        assert_eq!(store.partition_keys().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolves_have_one_winner() {
        let (store, listener) = store();
        store.append_incident(incident("inc-1", t0()), t0()).await.unwrap();

        let mut handles = Vec::new();
        for task in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .resolve_incident("inc-1", t0() + Duration::minutes(10 + task))
                    .await
            }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(incident) => winners.push(incident.resolved_time),
                Err(e) => assert!(matches!(e, EngineError::AlreadyResolved(_))),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(store.incident("inc-1").unwrap().resolved_time, winners[0]);
        let logged = store.log().load().await.unwrap();
        assert_eq!(logged.incidents[0].resolved_time, winners[0]);
        // One append plus one resolution
        assert_eq!(listener.notifications.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restore_from_log() {
        let log = Arc::new(MemoryLog::new());
        let listener = Arc::new(CountingListener::default());
        let first = EventStore::new(log.clone(), listener.clone());
        first
            .append_deployment(deployment("d1", "api", t0()), t0())
            .await
            .unwrap();
        first.append_incident(incident("inc-1", t0()), t0()).await.unwrap();
        first
            .resolve_incident("inc-1", t0() + Duration::minutes(5))
            .await
            .unwrap();

        let second = EventStore::new(log, listener);
        assert_eq!(second.restore().await.unwrap(), 2);
        assert!(second.incident("inc-1").unwrap().is_resolved());
        assert_eq!(
            second.snapshot(None, &Scope::all()),
            first.snapshot(None, &Scope::all())
        );
    }
}
