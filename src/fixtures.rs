//! Seeded synthetic event histories.
//!
//! Used by the `/simulate` endpoint to populate a demo instance, and by tests
//! to build realistic data sets. The same seed and end time always produce
//! the same events.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::lifecycle;
use crate::model::{DeploymentStatus, NewDeployment, NewIncident, Severity};
use crate::storage::{LoggedEvents, MemoryLog};

const MAX_FIXTURE_DAYS: u32 = 365;
const MAX_FIXTURE_SERVICES: usize = 20;
const MAX_DEPLOYMENTS_PER_DAY: u32 = 100;

/// Shape of a generated history.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureSpec {
    pub seed: u64,
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Upper bound on deployments per service per day.
    #[serde(default = "default_max_deployments_per_day")]
    pub max_deployments_per_day: u32,
    /// Probability that a deployment fails.
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
    /// Probability that a deployment is followed by an incident.
    #[serde(default = "default_incident_rate")]
    pub incident_rate: f64,
}

fn default_days() -> u32 {
    30
}

fn default_services() -> Vec<String> {
    vec!["api".to_string(), "web".to_string()]
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_max_deployments_per_day() -> u32 {
    3
}

fn default_failure_rate() -> f64 {
    0.15
}

fn default_incident_rate() -> f64 {
    0.1
}

impl FixtureSpec {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            days: default_days(),
            services: default_services(),
            environment: default_environment(),
            max_deployments_per_day: default_max_deployments_per_day(),
            failure_rate: default_failure_rate(),
            incident_rate: default_incident_rate(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.days == 0 || self.days > MAX_FIXTURE_DAYS {
            return Err(EngineError::Validation(format!(
                "days must be between 1 and {MAX_FIXTURE_DAYS}"
            )));
        }
        if self.services.is_empty() || self.services.len() > MAX_FIXTURE_SERVICES {
            return Err(EngineError::Validation(format!(
                "services must list between 1 and {MAX_FIXTURE_SERVICES} names"
            )));
        }
        let mut seen = HashSet::new();
        for service in &self.services {
            if service.trim().is_empty() || !seen.insert(service.as_str()) {
                return Err(EngineError::Validation(format!(
                    "service names must be non-empty and unique, got {service:?}"
                )));
            }
        }
        if self.environment.trim().is_empty() {
            return Err(EngineError::Validation(
                "environment must not be empty".to_string(),
            ));
        }
        if self.max_deployments_per_day == 0
            || self.max_deployments_per_day > MAX_DEPLOYMENTS_PER_DAY
        {
            return Err(EngineError::Validation(format!(
                "max_deployments_per_day must be between 1 and {MAX_DEPLOYMENTS_PER_DAY}"
            )));
        }
        for (name, p) in [
            ("failure_rate", self.failure_rate),
            ("incident_rate", self.incident_rate),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(EngineError::Validation(format!(
                    "{name} must be within [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// One generated event, in the order it should be ingested.
#[derive(Debug, Clone)]
pub enum FixtureEvent {
    Deployment(NewDeployment),
    Incident(NewIncident),
    Resolve {
        id: String,
        resolved_time: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Fixture {
    pub events: Vec<FixtureEvent>,
}

fn probability(p: f64) -> f64 {
    if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 }
}

/// Generate a history covering the `spec.days` days before `end`.
///
/// Every event starts before `end`. Incidents whose recovery would land
/// after `end` are left open.
pub fn generate(spec: &FixtureSpec, end: DateTime<Utc>) -> Fixture {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let start = end - Duration::days(i64::from(spec.days));
    let failure_rate = probability(spec.failure_rate);
    let incident_rate = probability(spec.incident_rate);
    let mut events = Vec::new();

    for day in 0..spec.days {
        let day_start = start + Duration::days(i64::from(day));

        for service in &spec.services {
            let count = rng.random_range(0..=spec.max_deployments_per_day);

            for n in 0..count {
                let deployed_at = day_start + Duration::minutes(rng.random_range(0..24 * 60));
                if deployed_at >= end {
                    continue;
                }

                let lead_time = Duration::minutes(rng.random_range(10..72 * 60));
                let status = if rng.random_bool(failure_rate) {
                    DeploymentStatus::Failed
                } else {
                    DeploymentStatus::Success
                };
                let deployment_id = format!("fx{}-{service}-d{day}-{n}", spec.seed);

                events.push(FixtureEvent::Deployment(NewDeployment {
                    id: Some(deployment_id.clone()),
                    service: service.clone(),
                    environment: spec.environment.clone(),
                    status,
                    start_time: Some(deployed_at),
                    end_time: Some(deployed_at + Duration::minutes(rng.random_range(1..30))),
                    commit_sha: Some(format!("{:08x}", rng.random::<u32>())),
                    commit_time: Some(deployed_at - lead_time),
                    version: None,
                }));

                if !rng.random_bool(incident_rate) {
                    continue;
                }

                let opened_at = deployed_at + Duration::minutes(rng.random_range(5..120));
                if opened_at >= end {
                    continue;
                }
                let severity = match rng.random_range(0..4) {
                    0 => Severity::Low,
                    1 => Severity::Medium,
                    2 => Severity::High,
                    _ => Severity::Critical,
                };
                let incident_id = format!("fx{}-{service}-i{day}-{n}", spec.seed);

                events.push(FixtureEvent::Incident(NewIncident {
                    id: Some(incident_id.clone()),
                    title: format!("Regression after {deployment_id}"),
                    description: None,
                    service: service.clone(),
                    environment: spec.environment.clone(),
                    severity,
                    start_time: Some(opened_at),
                    resolved_time: None,
                }));

                let resolved_at = opened_at + Duration::minutes(rng.random_range(5..12 * 60));
                if resolved_at < end {
                    events.push(FixtureEvent::Resolve {
                        id: incident_id,
                        resolved_time: resolved_at,
                    });
                }
            }
        }
    }

    Fixture { events }
}

impl Fixture {
    pub fn deployments(&self) -> impl Iterator<Item = &NewDeployment> {
        self.events.iter().filter_map(|e| match e {
            FixtureEvent::Deployment(d) => Some(d),
            _ => None,
        })
    }

    pub fn incidents(&self) -> impl Iterator<Item = &NewIncident> {
        self.events.iter().filter_map(|e| match e {
            FixtureEvent::Incident(i) => Some(i),
            _ => None,
        })
    }

    /// Apply the fixture directly to a fresh event log, bypassing the store.
    ///
    /// Resolutions go through the same lifecycle rule the store applies.
    pub fn into_logged_events(self, received_at: DateTime<Utc>) -> Result<LoggedEvents> {
        let mut logged = LoggedEvents::default();

        for event in self.events {
            match event {
                FixtureEvent::Deployment(d) => {
                    logged.deployments.push(d.into_deployment(received_at)?);
                }
                FixtureEvent::Incident(i) => {
                    logged.incidents.push(i.into_incident(received_at)?);
                }
                FixtureEvent::Resolve { id, resolved_time } => {
                    let incident = logged
                        .incidents
                        .iter_mut()
                        .find(|i| i.id == id)
                        .ok_or_else(|| EngineError::NotFound(format!("incident {id}")))?;
                    incident.resolved_time = Some(lifecycle::resolve(incident, resolved_time)?);
                }
            }
        }

        Ok(logged)
    }

    pub fn into_memory_log(self, received_at: DateTime<Utc>) -> Result<MemoryLog> {
        Ok(MemoryLog::with_events(self.into_logged_events(received_at)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn end() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_same_seed_same_history() {
        let spec = FixtureSpec::new(42);
        let a = generate(&spec, end());
        let b = generate(&spec, end());
        let ids = |f: &Fixture| f.deployments().map(|d| d.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.events.len(), b.events.len());
        assert!(a.deployments().count() > 0);
    }

    #[test]
    fn test_events_fall_inside_window() {
        let spec = FixtureSpec {
            days: 7,
            incident_rate: 1.0,
            ..FixtureSpec::new(7)
        };
        let fixture = generate(&spec, end());
        let start = end() - Duration::days(7);

        for d in fixture.deployments() {
            let t = d.start_time.unwrap();
            assert!(start <= t && t < end());
            assert!(d.commit_time.unwrap() <= t);
        }
        for i in fixture.incidents() {
            assert!(i.start_time.unwrap() < end());
        }
    }

    #[test]
    fn test_into_logged_events() {
        let spec = FixtureSpec {
            incident_rate: 1.0,
            ..FixtureSpec::new(3)
        };
        let fixture = generate(&spec, end());
        let deployments = fixture.deployments().count();
        let logged = fixture.into_logged_events(end()).unwrap();

        assert_eq!(logged.deployments.len(), deployments);
        assert!(logged.incidents.iter().any(|i| i.is_resolved()));
        assert!(
            logged
                .incidents
                .iter()
                .filter_map(|i| i.recovery_time())
                .all(|r| r >= Duration::zero())
        );
    }

    #[test]
    fn test_validate_rejects_bad_rates() {
        let spec = FixtureSpec {
            failure_rate: 1.5,
            ..FixtureSpec::new(1)
        };
        assert!(matches!(spec.validate(), Err(EngineError::Validation(_))));

        let spec = FixtureSpec {
            days: 0,
            ..FixtureSpec::new(1)
        };
        assert!(spec.validate().is_err());
        assert!(FixtureSpec::new(1).validate().is_ok());
    }

    #[test]
    fn test_validate_bounds_generated_volume() {
        let spec = FixtureSpec {
            days: 365,
            max_deployments_per_day: u32::MAX,
            ..FixtureSpec::new(1)
        };
        assert!(matches!(spec.validate(), Err(EngineError::Validation(_))));

        let spec = FixtureSpec {
            max_deployments_per_day: 0,
            ..FixtureSpec::new(1)
        };
        assert!(spec.validate().is_err());

        let spec = FixtureSpec {
            services: (0..100_000).map(|n| format!("svc-{n}")).collect(),
            ..FixtureSpec::new(1)
        };
        assert!(matches!(spec.validate(), Err(EngineError::Validation(_))));

        let spec = FixtureSpec {
            services: vec!["api".to_string(), "api".to_string()],
            ..FixtureSpec::new(1)
        };
        assert!(spec.validate().is_err());

        let spec = FixtureSpec {
            days: 365,
            max_deployments_per_day: 100,
            services: (0..20).map(|n| format!("svc-{n}")).collect(),
            ..FixtureSpec::new(1)
        };
        assert!(spec.validate().is_ok());
    }
}
