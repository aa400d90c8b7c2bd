//! Span admission filtering.
//!
//! A [`SpanFilter`] classifies every finished span as worth exporting or not.
//! The decision runs synchronously inside `Span::end` and therefore never
//! blocks, suspends, or panics; a malformed span degrades to the safest
//! applicable rule instead of raising.

use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use opentelemetry::trace::Status;
use opentelemetry_sdk::trace::SpanData;
use rand::Rng;

/// Hard ceiling on the configured sample rate.
///
/// The filter refuses to admit more than 30% of otherwise-unclassified spans;
/// rates above this are clamped when the filter is built.
pub const MAX_SAMPLE_RATE: f64 = 0.3;

/// Admission settings, immutable once a [`SpanFilter`] is built from them.
#[derive(Clone, Debug, Default)]
pub struct FilterConfig {
    /// Maximum number of error-status spans admitted per second.
    ///
    /// `None` (the default) leaves the error budget unbounded.
    pub error_tps: Option<u32>,
    /// Give error-status spans their own rate-limited budget.
    ///
    /// When `false` (the default), error spans receive no special treatment
    /// and fall through to the slow-span and sampling rules like any other
    /// span.
    pub send_error_traces: bool,
    /// Spans that ran strictly longer than this many milliseconds are always
    /// admitted. Zero (the default) disables the rule.
    pub slow_threshold_ms: u64,
    /// Probability of admitting a span matched by neither of the other rules.
    ///
    /// Unset means no sampling (every such span is admitted). Explicit values
    /// are clamped into `[0.0, MAX_SAMPLE_RATE]`.
    pub sample_rate: Option<f64>,
}

impl FilterConfig {
    /// The sample rate a filter built from this configuration will use.
    pub fn effective_sample_rate(&self) -> f64 {
        match self.sample_rate {
            Some(rate) => rate.clamp(0.0, MAX_SAMPLE_RATE),
            None => 1.0,
        }
    }

    /// Whether this configuration admits every span.
    ///
    /// A no-op configuration lets callers skip the filtering wrapper entirely.
    pub fn is_noop(&self) -> bool {
        !(self.send_error_traces && self.error_tps.is_some())
            && self.slow_threshold_ms == 0
            && self.effective_sample_rate() >= 1.0
    }
}

/// Counts error spans admitted within the current one-second window.
///
/// The window state lives behind a [`Mutex`] so concurrent span completions
/// cannot lose updates and silently inflate the budget.
#[derive(Debug)]
pub struct ErrorRateLimiter {
    max_per_second: Option<u32>,
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    second: u64,
    admitted: u32,
}

impl ErrorRateLimiter {
    /// Limiter admitting at most `max_per_second` error spans per whole
    /// second; `None` never rejects.
    pub fn new(max_per_second: Option<u32>) -> Self {
        ErrorRateLimiter {
            max_per_second,
            window: Mutex::new(Window {
                second: 0,
                admitted: 0,
            }),
        }
    }

    /// Consume one unit of the current second's budget, if any is left.
    pub fn admit(&self) -> bool {
        self.admit_at(unix_second())
    }

    fn admit_at(&self, now_second: u64) -> bool {
        let Some(limit) = self.max_per_second else {
            return true;
        };
        // A poisoned lock means another thread panicked mid-update; the
        // window state is still usable, so recover rather than propagate.
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if window.second != now_second {
            window.second = now_second;
            window.admitted = 0;
        }
        if window.admitted < limit {
            window.admitted += 1;
            true
        } else {
            false
        }
    }
}

/// Rate-limited, threshold-aware, probabilistic admission decision for
/// finished spans.
///
/// Rules are evaluated in order and the first match decides:
///
/// 1. error-status spans draw from the [`ErrorRateLimiter`] budget (only when
///    `send_error_traces` is set, otherwise they fall through),
/// 2. spans exceeding the slow threshold are admitted,
/// 3. everything else is admitted with the effective sample rate.
#[derive(Debug)]
pub struct SpanFilter {
    send_error_traces: bool,
    slow_threshold_ms: u64,
    sample_rate: f64,
    error_limiter: ErrorRateLimiter,
}

impl SpanFilter {
    /// Build a filter, clamping the sample rate to [`MAX_SAMPLE_RATE`].
    pub fn new(config: &FilterConfig) -> Self {
        SpanFilter {
            send_error_traces: config.send_error_traces,
            slow_threshold_ms: config.slow_threshold_ms,
            sample_rate: config.effective_sample_rate(),
            error_limiter: ErrorRateLimiter::new(config.error_tps),
        }
    }

    /// The clamped sample rate in use.
    pub fn effective_sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Decide whether `span` should reach the export pipeline.
    pub fn should_admit(&self, span: &SpanData) -> bool {
        self.should_admit_at(span, unix_second())
    }

    fn should_admit_at(&self, span: &SpanData, now_second: u64) -> bool {
        if self.send_error_traces && matches!(span.status, Status::Error { .. }) {
            // Once the per-second budget is gone, further error spans in the
            // same second are dropped regardless of the remaining rules.
            return self.error_limiter.admit_at(now_second);
        }
        if self.slow_threshold_ms > 0 {
            if let Some(elapsed_ms) = duration_millis(span) {
                if elapsed_ms > self.slow_threshold_ms as f64 {
                    return true;
                }
            }
        }
        if self.sample_rate < 1.0 {
            rand::rng().random::<f64>() < self.sample_rate
        } else {
            true
        }
    }
}

/// Span duration in milliseconds, or `None` when the end timestamp precedes
/// the start timestamp (a clock or instrumentation bug, treated as not-slow).
fn duration_millis(span: &SpanData) -> Option<f64> {
    span.end_time
        .duration_since(span.start_time)
        .ok()
        .map(|elapsed| elapsed.as_secs_f64() * 1_000.0)
}

fn unix_second() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
