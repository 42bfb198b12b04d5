//! Service health registry
//!
//! Long-running services report every success and failure. A service is
//! healthy after its first success and becomes unhealthy once its last
//! success is older than its unhealthy budget, except during the startup
//! grace period.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::warn;

use crate::time::{to_chrono, TimeProvider};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthCheckError {
    #[error("service {0} is not registered")]
    NotRegistered(String),
    #[error("service {0} is already registered")]
    AlreadyRegistered(String),
    #[error("no successful update has been reported for service {0}")]
    NoSuccessfulUpdate(String),
    #[error("service {service} unhealthy: no successful update in {elapsed_ms}ms (last error: {last_error})")]
    Unhealthy {
        service: String,
        elapsed_ms: i64,
        last_error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone)]
struct ServiceHealth {
    max_unhealthy: Duration,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Point-in-time view of one service, served by the health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealthSnapshot {
    pub service: String,
    pub status: HealthStatus,
    pub max_unhealthy_ms: i64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct HealthMonitor {
    services: Mutex<BTreeMap<String, ServiceHealth>>,
    clock: Arc<dyn TimeProvider>,
    started_at: DateTime<Utc>,
    grace_period: Duration,
}

impl HealthMonitor {
    pub fn new(grace_period: std::time::Duration, clock: Arc<dyn TimeProvider>) -> Self {
        let started_at = clock.now();
        Self {
            services: Mutex::new(BTreeMap::new()),
            clock,
            started_at,
            grace_period: to_chrono(grace_period),
        }
    }

    /// Register `service`. A zero `max_unhealthy` never marks it unhealthy.
    pub fn register_service(
        self: &Arc<Self>,
        service: &str,
        max_unhealthy: std::time::Duration,
    ) -> Result<HealthReporter, HealthCheckError> {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(service) {
            return Err(HealthCheckError::AlreadyRegistered(service.to_string()));
        }
        services.insert(
            service.to_string(),
            ServiceHealth {
                max_unhealthy: to_chrono(max_unhealthy),
                last_success: None,
                last_failure: None,
                last_error: None,
            },
        );
        Ok(HealthReporter {
            monitor: Arc::clone(self),
            service: service.to_string(),
        })
    }

    pub fn report_success(&self, service: &str) -> Result<(), HealthCheckError> {
        let now = self.clock.now();
        self.with_service(service, |health| health.last_success = Some(now))
    }

    pub fn report_failure(&self, service: &str, error: &str) -> Result<(), HealthCheckError> {
        let now = self.clock.now();
        self.with_service(service, |health| {
            health.last_failure = Some(now);
            health.last_error = Some(error.to_string());
        })
    }

    fn with_service<F>(&self, service: &str, f: F) -> Result<(), HealthCheckError>
    where
        F: FnOnce(&mut ServiceHealth),
    {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        let health = services
            .get_mut(service)
            .ok_or_else(|| HealthCheckError::NotRegistered(service.to_string()))?;
        f(health);
        Ok(())
    }

    pub fn in_grace_period(&self) -> bool {
        self.clock.now() - self.started_at < self.grace_period
    }

    fn status_of(&self, health: &ServiceHealth, now: DateTime<Utc>) -> HealthStatus {
        let Some(last_success) = health.last_success else {
            return HealthStatus::Unknown;
        };
        if health.max_unhealthy.is_zero() || now - self.started_at < self.grace_period {
            return HealthStatus::Healthy;
        }
        if now - last_success > health.max_unhealthy {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }

    fn check(&self, service: &str, health: &ServiceHealth, now: DateTime<Utc>) -> Result<(), HealthCheckError> {
        match self.status_of(health, now) {
            HealthStatus::Healthy => Ok(()),
            HealthStatus::Unknown => Err(HealthCheckError::NoSuccessfulUpdate(service.to_string())),
            HealthStatus::Unhealthy => Err(HealthCheckError::Unhealthy {
                service: service.to_string(),
                elapsed_ms: health
                    .last_success
                    .map(|ts| (now - ts).num_milliseconds())
                    .unwrap_or_default(),
                last_error: health
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "none".to_string()),
            }),
        }
    }

    pub fn status(&self, service: &str) -> Result<HealthStatus, HealthCheckError> {
        let now = self.clock.now();
        let services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        let health = services
            .get(service)
            .ok_or_else(|| HealthCheckError::NotRegistered(service.to_string()))?;
        Ok(self.status_of(health, now))
    }

    pub fn health_check(&self, service: &str) -> Result<(), HealthCheckError> {
        let now = self.clock.now();
        let services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        let health = services
            .get(service)
            .ok_or_else(|| HealthCheckError::NotRegistered(service.to_string()))?;
        self.check(service, health, now)
    }

    /// Services the owning process should act on: unhealthy ones, plus those
    /// that never succeeded within the grace period and their budget.
    pub fn failed_services(&self) -> Vec<HealthCheckError> {
        let now = self.clock.now();
        let services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        services
            .iter()
            .filter_map(|(name, health)| match self.check(name, health, now) {
                Ok(()) => None,
                Err(e @ HealthCheckError::NoSuccessfulUpdate(_)) => {
                    // a deadline past the representable range never arrives
                    let deadline = self
                        .started_at
                        .checked_add_signed(self.grace_period)
                        .and_then(|t| t.checked_add_signed(health.max_unhealthy));
                    let overdue = deadline.is_some_and(|deadline| now > deadline);
                    (!health.max_unhealthy.is_zero() && overdue).then_some(e)
                }
                Err(e) => Some(e),
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ServiceHealthSnapshot> {
        let now = self.clock.now();
        let services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        services
            .iter()
            .map(|(name, health)| ServiceHealthSnapshot {
                service: name.clone(),
                status: self.status_of(health, now),
                max_unhealthy_ms: health.max_unhealthy.num_milliseconds(),
                last_success: health.last_success,
                last_failure: health.last_failure,
                last_error: health.last_error.clone(),
            })
            .collect()
    }
}

/// Handle a single service reports through
#[derive(Clone)]
pub struct HealthReporter {
    monitor: Arc<HealthMonitor>,
    service: String,
}

impl HealthReporter {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn report_success(&self) {
        if let Err(e) = self.monitor.report_success(&self.service) {
            warn!(service = %self.service, error = %e, "Failed to record success");
        }
    }

    pub fn report_failure(&self, error: &dyn fmt::Display) {
        if let Err(e) = self.monitor.report_failure(&self.service, &error.to_string()) {
            warn!(service = %self.service, error = %e, "Failed to record failure");
        }
    }

    pub fn health_check(&self) -> Result<(), HealthCheckError> {
        self.monitor.health_check(&self.service)
    }
}

impl fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthReporter")
            .field("service", &self.service)
            .finish()
    }
}
