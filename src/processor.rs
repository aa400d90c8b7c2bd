//! Span processor that gates what reaches a downstream sink.

use opentelemetry::Context;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use opentelemetry_sdk::Resource;

use crate::filter::{FilterConfig, SpanFilter};

/// A [`SpanProcessor`] that forwards only admitted spans to an inner
/// processor.
///
/// Wrap the processor that exports to the Watchlog agent (typically a batch
/// exporter) and register the wrapper with the tracer provider. Span starts
/// and lifecycle calls pass straight through; only `on_end` is gated, since
/// admission depends on the finished span's status and duration.
///
/// When the filter configuration enables no rule at all the wrapper holds no
/// filter and every span is forwarded without a decision.
#[derive(Debug)]
pub struct FilteredSpanProcessor<P> {
    inner: P,
    filter: Option<SpanFilter>,
}

impl<P> FilteredSpanProcessor<P> {
    /// Wrap `inner`, admitting spans according to `config`.
    pub fn new(inner: P, config: &FilterConfig) -> Self {
        let filter = if config.is_noop() {
            None
        } else {
            Some(SpanFilter::new(config))
        };
        FilteredSpanProcessor { inner, filter }
    }
}

impl<P: SpanProcessor> SpanProcessor for FilteredSpanProcessor<P> {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        // Admission is decided at end of life; starts always reach the inner
        // processor so it can maintain its own bookkeeping.
        self.inner.on_start(span, cx);
    }

    fn on_end(&self, span: SpanData) {
        match &self.filter {
            Some(filter) if !filter.should_admit(&span) => {}
            _ => self.inner.on_end(span),
        }
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.inner.force_flush()
    }

    fn shutdown(&self) -> OTelSdkResult {
        self.inner.shutdown()
    }

    fn shutdown_with_timeout(&self, timeout: std::time::Duration) -> OTelSdkResult {
        self.inner.shutdown_with_timeout(timeout)
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.inner.set_resource(resource);
    }
}
