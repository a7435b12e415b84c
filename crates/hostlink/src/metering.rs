//! Metering interface the core reports counters through.

use std::time::Duration;

pub const TRIGGER_COUNT: &str = "hostlink.trigger.count";
pub const TRIGGER_DURATION: &str = "hostlink.trigger.duration";

pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Sink for counters and durations. Implementations must be cheap and non-blocking.
pub trait Meter: Send + Sync {
    fn increment(&self, name: &str, labels: Labels<'_>, value: u64);

    fn record_duration(&self, name: &str, labels: Labels<'_>, duration: Duration);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMeter;

impl Meter for NoopMeter {
    fn increment(&self, _name: &str, _labels: Labels<'_>, _value: u64) {}

    fn record_duration(&self, _name: &str, _labels: Labels<'_>, _duration: Duration) {}
}

/// Emits every measurement as a trace event on the `hostlink::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMeter;

impl Meter for TracingMeter {
    fn increment(&self, name: &str, labels: Labels<'_>, value: u64) {
        tracing::trace!(target: "hostlink::metrics", metric = name, ?labels, value, "counter");
    }

    fn record_duration(&self, name: &str, labels: Labels<'_>, duration: Duration) {
        tracing::trace!(
            target: "hostlink::metrics",
            metric = name,
            ?labels,
            duration_ms = duration.as_secs_f64() * 1000.0,
            "duration"
        );
    }
}
