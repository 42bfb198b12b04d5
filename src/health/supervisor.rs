//! Periodic health enforcement for the owning process

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::monitor::{HealthCheckError, HealthMonitor};

/// What to do when a service fails its health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Log,
    Shutdown,
}

impl FailurePolicy {
    pub fn from_panic_on_failure(panic_on_failure: bool) -> Self {
        if panic_on_failure {
            FailurePolicy::Shutdown
        } else {
            FailurePolicy::Log
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("health supervisor shutting down: {0}")]
pub struct SupervisorError(#[from] pub HealthCheckError);

/// Check every registered service once. Under `Shutdown` the first failure
/// is returned.
pub fn check_services(monitor: &HealthMonitor, policy: FailurePolicy) -> Result<(), SupervisorError> {
    if monitor.in_grace_period() {
        debug!("Health checks skipped during grace period");
        return Ok(());
    }

    for failure in monitor.failed_services() {
        error!(error = %failure, "Service failed health check");
        if policy == FailurePolicy::Shutdown {
            return Err(SupervisorError(failure));
        }
    }
    Ok(())
}

/// Poll the monitor every `poll_interval` until stopped or a failure under
/// `Shutdown` policy.
pub async fn supervise(
    monitor: Arc<HealthMonitor>,
    poll_interval: Duration,
    policy: FailurePolicy,
    mut stop: watch::Receiver<bool>,
) -> Result<(), SupervisorError> {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(poll_ms = poll_interval.as_millis() as u64, policy = ?policy, "Starting health supervisor");

    loop {
        if *stop.borrow() {
            return Ok(());
        }
        tokio::select! {
            _ = ticker.tick() => check_services(&monitor, policy)?,
            changed = stop.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use chrono::{TimeZone, Utc};

    fn stale_monitor() -> Arc<HealthMonitor> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let monitor = Arc::new(HealthMonitor::new(Duration::ZERO, clock.clone()));
        monitor
            .register_service("svc", Duration::from_secs(5))
            .unwrap()
            .report_success();
        clock.advance(chrono::Duration::seconds(10));
        monitor
    }

    #[test]
    fn log_policy_keeps_running() {
        assert_eq!(check_services(&stale_monitor(), FailurePolicy::Log), Ok(()));
    }

    #[tokio::test]
    async fn shutdown_policy_returns_the_failure() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let result = supervise(
            stale_monitor(),
            Duration::from_millis(5),
            FailurePolicy::Shutdown,
            stop_rx,
        )
        .await;

        assert!(matches!(
            result,
            Err(SupervisorError(HealthCheckError::Unhealthy { .. }))
        ));
    }

    #[tokio::test]
    async fn stop_ends_supervision() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            stale_monitor(),
            Duration::from_secs(3600),
            FailurePolicy::Log,
            stop_rx,
        ));
        stop_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[test]
    fn policy_from_flag() {
        assert_eq!(FailurePolicy::from_panic_on_failure(true), FailurePolicy::Shutdown);
        assert_eq!(FailurePolicy::from_panic_on_failure(false), FailurePolicy::Log);
    }
}
