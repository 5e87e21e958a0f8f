//! Migration metrics
//!
//! Exposed through the process-wide prometheus registry by the binary.

use crate::error::{Error, Result};
use prometheus::{
    CounterVec, HistogramOpts, HistogramTimer, HistogramVec, Opts, Registry,
};

pub struct MotionMetrics {
    migrations: CounterVec,
    compensations: CounterVec,
    phase_duration: HistogramVec,
}

fn registration(e: prometheus::Error) -> Error {
    Error::Internal(format!("metric registration failed: {}", e))
}

impl MotionMetrics {
    /// Create the metrics and register them on `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let migrations = CounterVec::new(
            Opts::new(
                "storage_motion_migrations_total",
                "Migrations with volumes by protocol and outcome",
            ),
            &["protocol", "outcome"],
        )
        .map_err(registration)?;
        let compensations = CounterVec::new(
            Opts::new(
                "storage_motion_compensations_total",
                "Managed volume compensation steps by outcome",
            ),
            &["outcome"],
        )
        .map_err(registration)?;
        let phase_duration = HistogramVec::new(
            HistogramOpts::new(
                "storage_motion_phase_duration_seconds",
                "Duration of each migration phase",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
            &["phase"],
        )
        .map_err(registration)?;

        registry
            .register(Box::new(migrations.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(compensations.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(phase_duration.clone()))
            .map_err(registration)?;

        Ok(Self {
            migrations,
            compensations,
            phase_duration,
        })
    }

    pub fn record_migration(&self, protocol: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.migrations
            .with_label_values(&[protocol, outcome])
            .inc();
    }

    pub fn record_compensation(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.compensations.with_label_values(&[outcome]).inc();
    }

    /// Timer observing the phase duration when dropped
    pub fn phase_timer(&self, phase: &str) -> HistogramTimer {
        self.phase_duration.with_label_values(&[phase]).start_timer()
    }

    pub fn migrations(&self, protocol: &str, outcome: &str) -> u64 {
        self.migrations
            .with_label_values(&[protocol, outcome])
            .get() as u64
    }

    pub fn compensations(&self, outcome: &str) -> u64 {
        self.compensations.with_label_values(&[outcome]).get() as u64
    }
}
