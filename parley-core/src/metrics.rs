// ABOUTME: Prometheus metrics for sessions, waiters, and watermark reconciliation
// ABOUTME: Thin wrappers over the `metrics` facade so call sites stay one-liners

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return its render handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

pub fn record_session_opened(mode: &'static str) {
    counter!("parley_sessions_opened_total", "mode" => mode).increment(1);
}

pub fn record_session_closed(mode: &'static str) {
    counter!("parley_sessions_closed_total", "mode" => mode).increment(1);
}

pub fn record_session_failure(reason: &'static str) {
    counter!("parley_session_failures_total", "reason" => reason).increment(1);
}

pub fn record_wait_outcome(outcome: &'static str) {
    counter!("parley_wait_outcomes_total", "outcome" => outcome).increment(1);
}

pub fn pending_waits_added(count: usize) {
    gauge!("parley_pending_waits").increment(count as f64);
}

pub fn pending_waits_removed(count: usize) {
    gauge!("parley_pending_waits").decrement(count as f64);
}

pub fn record_watermark_advance(result: &'static str) {
    counter!("parley_watermark_advances_total", "result" => result).increment(1);
}

pub fn record_unread_batch(origin: &'static str, size: usize) {
    counter!("parley_unread_batches_total", "origin" => origin).increment(1);
    counter!("parley_unread_messages_total").increment(size as u64);
}

pub fn record_tool_call(tool: &str, status: &'static str) {
    counter!("parley_tool_calls_total", "tool" => tool.to_string(), "status" => status)
        .increment(1);
}
