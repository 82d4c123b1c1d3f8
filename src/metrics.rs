//! Saga metrics - counters, in-flight gauge and step latency sampling
//!
//! Rendered as plain text lines `name{labels} value` for `GET /metrics`.

use std::fmt::Write as _;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::activity::AttemptOutcome;

/// Latency samples with bounded memory
///
/// Samples every Nth observation to keep the vector small under load.
#[derive(Default)]
pub struct LatencySamples {
    samples: Vec<u64>,
    sample_rate: usize,
    sample_counter: usize,
    count: u64,
    sum_us: u64,
}

impl LatencySamples {
    const MAX_SAMPLES: usize = 10_000;

    pub fn new(sample_rate: usize) -> Self {
        LatencySamples {
            sample_rate: sample_rate.max(1),
            samples: Vec::with_capacity(1_024),
            ..Default::default()
        }
    }

    #[inline]
    pub fn observe(&mut self, latency_us: u64) {
        self.count += 1;
        self.sum_us = self.sum_us.saturating_add(latency_us);
        self.sample_counter += 1;
        if self.sample_counter >= self.sample_rate {
            self.sample_counter = 0;
            if self.samples.len() >= Self::MAX_SAMPLES {
                // Keep the newer half
                self.samples.drain(..Self::MAX_SAMPLES / 2);
            }
            self.samples.push(latency_us);
        }
    }

    /// Percentile over the sampled window
    ///
    /// # Arguments
    /// * `p` - Percentile (0-100), e.g., 50.0 for median, 99.0 for P99
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    /// Average over every observation, sampled or not
    pub fn avg(&self) -> Option<u64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum_us / self.count)
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Process-wide saga metrics
#[derive(Default)]
pub struct SagaMetrics {
    sagas_started: AtomicU64,
    sagas_in_flight: AtomicI64,
    sagas_finished: DashMap<&'static str, AtomicU64>,
    compensations: DashMap<&'static str, AtomicU64>,
    attempts: DashMap<(&'static str, &'static str), AtomicU64>,
    step_latency: DashMap<&'static str, Mutex<LatencySamples>>,
}

impl SagaMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saga_started(&self) {
        self.sagas_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A saga task began driving (new or resumed)
    pub fn run_entered(&self) {
        self.sagas_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_exited(&self) {
        self.sagas_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Terminal saga, labelled by external status
    pub fn saga_finished(&self, status: &'static str) {
        bump(&self.sagas_finished, status);
    }

    /// Compensation result, labelled by audit status
    pub fn compensation(&self, outcome: &'static str) {
        bump(&self.compensations, outcome);
    }

    pub fn attempt(&self, step: &'static str, outcome: AttemptOutcome) {
        bump(&self.attempts, (step, outcome.as_str()));
    }

    pub fn observe_step_latency(&self, step: &'static str, elapsed: Duration) {
        let entry = self
            .step_latency
            .entry(step)
            .or_insert_with(|| Mutex::new(LatencySamples::new(1)));
        let mut samples = entry.lock().unwrap_or_else(|e| e.into_inner());
        samples.observe(elapsed.as_micros() as u64);
    }

    pub fn sagas_started(&self) -> u64 {
        self.sagas_started.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> i64 {
        self.sagas_in_flight.load(Ordering::Relaxed)
    }

    pub fn finished(&self, status: &str) -> u64 {
        self.sagas_finished
            .get(status)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn attempts(&self, step: &str, outcome: AttemptOutcome) -> u64 {
        self.attempts
            .iter()
            .filter(|e| e.key().0 == step && e.key().1 == outcome.as_str())
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Text exposition, one sample per line, sorted for stable output
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("saga_started_total {}", self.sagas_started()));
        lines.push(format!("saga_in_flight {}", self.in_flight()));
        for e in self.sagas_finished.iter() {
            lines.push(format!(
                "saga_finished_total{{status=\"{}\"}} {}",
                e.key(),
                e.value().load(Ordering::Relaxed)
            ));
        }
        for e in self.compensations.iter() {
            lines.push(format!(
                "compensation_total{{status=\"{}\"}} {}",
                e.key(),
                e.value().load(Ordering::Relaxed)
            ));
        }
        for e in self.attempts.iter() {
            let (step, outcome) = e.key();
            lines.push(format!(
                "activity_attempts_total{{step=\"{}\",outcome=\"{}\"}} {}",
                step,
                outcome,
                e.value().load(Ordering::Relaxed)
            ));
        }
        for e in self.step_latency.iter() {
            let samples = e.value().lock().unwrap_or_else(|p| p.into_inner());
            let step = e.key();
            for (q, v) in [
                ("0.5", samples.percentile(50.0)),
                ("0.99", samples.percentile(99.0)),
            ] {
                if let Some(v) = v {
                    lines.push(format!(
                        "step_latency_us{{step=\"{}\",quantile=\"{}\"}} {}",
                        step, q, v
                    ));
                }
            }
            if let Some(avg) = samples.avg() {
                lines.push(format!("step_latency_us_avg{{step=\"{}\"}} {}", step, avg));
            }
            lines.push(format!(
                "step_latency_us_count{{step=\"{}\"}} {}",
                step,
                samples.count()
            ));
        }
        lines.sort();

        let mut out = String::new();
        for line in lines {
            let _ = writeln!(out, "{}", line);
        }
        out
    }
}

fn bump<K>(map: &DashMap<K, AtomicU64>, key: K)
where
    K: std::hash::Hash + Eq,
{
    map.entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}
