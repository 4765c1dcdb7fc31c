//! Incident and deployment state transitions.
//!
//! An incident is `Open` until it is resolved exactly once. A deployment that
//! was recorded `in_progress` can be completed exactly once. The transition
//! rules live here; [`crate::store::EventStore`] applies them under the
//! partition's write sequencer so they cannot race.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::model::{
    Deployment, DeploymentCompletion, DeploymentStatus, Incident, check_storable,
    serialize_duration,
};
use crate::store::{EventStore, detached};

/// Where an incident is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IncidentState {
    Open,
    Resolved {
        resolved_time: DateTime<Utc>,
        #[serde(serialize_with = "serialize_duration")]
        recovery_time: Duration,
    },
}

impl IncidentState {
    pub fn of(incident: &Incident) -> Self {
        match incident.resolved_time {
            None => IncidentState::Open,
            Some(resolved_time) => IncidentState::Resolved {
                resolved_time,
                recovery_time: resolved_time - incident.start_time,
            },
        }
    }
}

/// Check that `incident` may be resolved at `at`, returning the resolution time.
pub fn resolve(incident: &Incident, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match IncidentState::of(incident) {
        IncidentState::Resolved { .. } => Err(EngineError::AlreadyResolved(incident.id.clone())),
        IncidentState::Open if at < incident.start_time => {
            Err(EngineError::InvalidTimestamp(format!(
                "incident {}: resolved_time {at} is before start_time {}",
                incident.id, incident.start_time
            )))
        }
        IncidentState::Open => {
            check_storable("resolved_time", at)?;
            Ok(at)
        }
    }
}

/// Check that `deployment` may be completed as requested, returning the new
/// status and end time.
pub fn complete(
    deployment: &Deployment,
    completion: &DeploymentCompletion,
) -> Result<(DeploymentStatus, Option<DateTime<Utc>>)> {
    if deployment.status.is_terminal() {
        return Err(EngineError::Validation(format!(
            "deployment {} already finished with status {}",
            deployment.id, deployment.status
        )));
    }
    if !completion.status.is_terminal() {
        return Err(EngineError::Validation(format!(
            "deployment {}: completion status must be terminal",
            deployment.id
        )));
    }
    if let Some(end) = completion.end_time {
        check_storable("end_time", end)?;
        if end < deployment.start_time {
            return Err(EngineError::InvalidTimestamp(format!(
                "deployment {}: end_time {end} is before start_time {}",
                deployment.id, deployment.start_time
            )));
        }
    }
    Ok((completion.status, completion.end_time))
}

/// The only path by which incidents get resolved.
#[derive(Clone)]
pub struct IncidentLifecycle {
    store: Arc<EventStore>,
    clock: Arc<dyn Clock>,
}

impl IncidentLifecycle {
    pub fn new(store: Arc<EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Resolve an open incident at `at`, or now if not given.
    ///
    /// The transition runs to completion even if the caller goes away.
    pub async fn resolve(&self, id: &str, at: Option<DateTime<Utc>>) -> Result<Incident> {
        let at = at.unwrap_or_else(|| self.clock.now());
        let store = Arc::clone(&self.store);
        let owned_id = id.to_string();

        let incident = detached(async move { store.resolve_incident(&owned_id, at).await }).await?;

        info!(
            id = %incident.id,
            service = %incident.service,
            environment = %incident.environment,
            recovery_ms = incident.recovery_time().map(|d| d.num_milliseconds()),
            "Incident resolved"
        );
        Ok(incident)
    }

    pub fn state(&self, id: &str) -> Result<IncidentState> {
        Ok(IncidentState::of(&self.store.incident(id)?))
    }
}
