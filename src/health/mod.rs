//! Health tracking for long-running services

mod monitor;
mod supervisor;

pub use monitor::{
    HealthCheckError, HealthMonitor, HealthReporter, HealthStatus, ServiceHealthSnapshot,
};
pub use supervisor::{check_services, supervise, FailurePolicy, SupervisorError};
