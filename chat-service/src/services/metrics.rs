//! Prometheus metrics for the chat service.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use service_core::chat::TokenUsage;
use std::sync::OnceLock;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

static CHAT_TURNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CHAT_TOKENS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CHAT_TURN_DURATION_SECONDS: OnceLock<Histogram> = OnceLock::new();
static CHAT_STORE_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Turn outcome label values.
pub const OUTCOME_COMPLETED: &str = "completed";
pub const OUTCOME_FAILED: &str = "failed";
pub const OUTCOME_DISCONNECTED: &str = "disconnected";

/// Initialize the metrics registry. Safe to call more than once.
pub fn init_metrics() {
    if REGISTRY.get().is_some() {
        return;
    }

    let registry = Registry::new();

    let turns = IntCounterVec::new(
        Opts::new("chat_turns_total", "Total chat turns by outcome"),
        &["outcome", "key_class"],
    )
    .expect("Failed to create chat_turns_total metric");

    let tokens = IntCounterVec::new(
        Opts::new("chat_tokens_total", "Provider tokens reported per type"),
        &["type"],
    )
    .expect("Failed to create chat_tokens_total metric");

    let duration = Histogram::with_opts(
        HistogramOpts::new(
            "chat_turn_duration_seconds",
            "Wall-clock duration of a chat turn",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )
    .expect("Failed to create chat_turn_duration_seconds metric");

    let store_errors = IntCounterVec::new(
        Opts::new("chat_store_errors_total", "Session store failures"),
        &["operation"],
    )
    .expect("Failed to create chat_store_errors_total metric");

    registry
        .register(Box::new(turns.clone()))
        .expect("Failed to register chat_turns_total");
    registry
        .register(Box::new(tokens.clone()))
        .expect("Failed to register chat_tokens_total");
    registry
        .register(Box::new(duration.clone()))
        .expect("Failed to register chat_turn_duration_seconds");
    registry
        .register(Box::new(store_errors.clone()))
        .expect("Failed to register chat_store_errors_total");

    let _ = REGISTRY.set(registry);
    let _ = CHAT_TURNS_TOTAL.set(turns);
    let _ = CHAT_TOKENS_TOTAL.set(tokens);
    let _ = CHAT_TURN_DURATION_SECONDS.set(duration);
    let _ = CHAT_STORE_ERRORS_TOTAL.set(store_errors);

    tracing::info!("Prometheus metrics initialized");
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        tracing::error!("Metrics registry not initialized");
        return "# Metrics registry not initialized\n".to_string();
    };

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
        format!("# Failed to convert metrics to UTF-8: {}\n", e)
    })
}

/// Record a finished turn.
pub fn record_turn(outcome: &str, key_class: &str, duration_secs: f64) {
    if let Some(counter) = CHAT_TURNS_TOTAL.get() {
        counter.with_label_values(&[outcome, key_class]).inc();
    }
    if let Some(histogram) = CHAT_TURN_DURATION_SECONDS.get() {
        histogram.observe(duration_secs);
    }
}

/// Record the token counts reported for a completed turn.
pub fn record_tokens(usage: &TokenUsage) {
    if let Some(counter) = CHAT_TOKENS_TOTAL.get() {
        if let Some(input) = usage.input_tokens {
            counter.with_label_values(&["input"]).inc_by(input);
        }
        if let Some(output) = usage.output_tokens {
            counter.with_label_values(&["output"]).inc_by(output);
        }
    }
}

/// Record a failed session store operation.
pub fn record_store_error(operation: &str) {
    if let Some(counter) = CHAT_STORE_ERRORS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}
