//! Session performance metrics plus the process-wide OpenTelemetry
//! instruments they are mirrored into.

use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundMetric {
    pub round: u32,
    pub training_loss: f32,
    /// Post-apply validation loss, including rejected updates.
    pub validation_loss: f32,
    pub committed_loss: f32,
    pub rolled_back: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub total_training_time: Duration,
    pub average_round_time: Duration,
    pub total_loss: f32,
    pub convergence_rounds: u32,
    pub rollbacks: u32,
    pub round_metrics: Vec<RoundMetric>,
}

impl PerformanceMetrics {
    pub fn reset(&mut self) { *self = Self::default(); }

    pub fn record_round(&mut self, metric: RoundMetric) {
        self.total_training_time += metric.duration;
        self.total_loss += metric.validation_loss;
        if metric.rolled_back { self.rollbacks += 1; }
        self.round_metrics.push(metric);
        self.average_round_time = self.total_training_time / self.round_metrics.len() as u32;
    }

    pub fn completed_rounds(&self) -> usize { self.round_metrics.len() }
}

pub struct FlInstruments {
    pub rounds_total: Counter<u64>,
    pub rollbacks_total: Counter<u64>,
    pub sessions_total: Counter<u64>,
    pub round_latency_ms: Histogram<f64>,
    pub training_latency_ms: Histogram<f64>,
}

static FL_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("pulse_fl"));

pub static FL_METRICS: Lazy<FlInstruments> = Lazy::new(|| FlInstruments {
    rounds_total: FL_METER.u64_counter("pulse_fl_rounds_total").with_description("Federated rounds completed").build(),
    rollbacks_total: FL_METER.u64_counter("pulse_fl_rollbacks_total").with_description("Aggregated updates rejected by validation").build(),
    sessions_total: FL_METER.u64_counter("pulse_fl_sessions_total").with_description("Sessions finished, by terminal status").build(),
    round_latency_ms: FL_METER.f64_histogram("pulse_fl_round_latency_ms").with_description("Wall-clock round latency ms").with_unit("ms").build(),
    training_latency_ms: FL_METER.f64_histogram("pulse_fl_training_latency_ms").with_description("Local training latency ms").with_unit("ms").build(),
});

pub fn record_session_finished(status: &'static str) {
    FL_METRICS.sessions_total.add(1, &[KeyValue::new("status", status)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(round: u32, ms: u64, rolled_back: bool) -> RoundMetric {
        RoundMetric { round, training_loss: 1.0, validation_loss: 0.5, committed_loss: 0.5, rolled_back, duration: Duration::from_millis(ms) }
    }

    #[test]
    fn averages_and_totals() {
        let mut m = PerformanceMetrics::default();
        m.record_round(metric(0, 100, false));
        m.record_round(metric(1, 300, true));
        assert_eq!(m.total_training_time, Duration::from_millis(400));
        assert_eq!(m.average_round_time, Duration::from_millis(200));
        assert_eq!(m.rollbacks, 1);
        assert!((m.total_loss - 1.0).abs() < 1e-6);
        m.reset();
        assert_eq!(m.completed_rounds(), 0);
    }
}
