//! Pipeline configuration for shipping telemetry to a Watchlog agent.

use std::collections::HashMap;
use std::time::Duration;

use opentelemetry_sdk::trace::SpanProcessor;
use url::Url;

use crate::endpoint::EndpointResolver;
use crate::filter::FilterConfig;
use crate::processor::FilteredSpanProcessor;

/// Application name used when none is configured.
const DEFAULT_APP_NAME: &str = "unnamed-app";
/// Default maximum number of spans per exported batch.
const DEFAULT_MAX_BATCH_SIZE: usize = 200;
/// Default delay between batch exports.
const DEFAULT_SCHEDULED_DELAY_MILLIS: u64 = 5_000;
/// Default interval between metric reports.
const DEFAULT_METRIC_INTERVAL_MILLIS: u64 = 5_000;

/// Errors raised while building a [`WatchlogPipeline`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The resolved agent base URL and app name do not form a valid endpoint.
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

/// Batching parameters handed to the downstream exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    /// Maximum number of spans exported in one request.
    pub max_batch_size: usize,
    /// Delay between two consecutive batch exports.
    pub scheduled_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            scheduled_delay: Duration::from_millis(DEFAULT_SCHEDULED_DELAY_MILLIS),
        }
    }
}

/// Create a new pipeline builder with default settings.
pub fn new_pipeline() -> WatchlogPipelineBuilder {
    WatchlogPipelineBuilder::default()
}

/// Builder for [`WatchlogPipeline`].
#[derive(Debug)]
pub struct WatchlogPipelineBuilder {
    app: String,
    url: Option<String>,
    headers: HashMap<String, String>,
    batch_options: BatchOptions,
    metric_interval: Duration,
    filter: FilterConfig,
    probe_dns: bool,
}

impl Default for WatchlogPipelineBuilder {
    fn default() -> Self {
        WatchlogPipelineBuilder {
            app: DEFAULT_APP_NAME.to_string(),
            url: None,
            headers: HashMap::new(),
            batch_options: BatchOptions::default(),
            metric_interval: Duration::from_millis(DEFAULT_METRIC_INTERVAL_MILLIS),
            filter: FilterConfig::default(),
            probe_dns: false,
        }
    }
}

impl WatchlogPipelineBuilder {
    /// Assign the application name used in the endpoint paths.
    pub fn with_app<T: Into<String>>(mut self, app: T) -> Self {
        self.app = app.into();
        self
    }

    /// Assign the agent base URL, skipping environment auto-detection.
    ///
    /// The `WATCHLOG_APM_URL` environment variable still takes precedence.
    pub fn with_url<T: Into<String>>(mut self, url: T) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Assign extra headers for requests to the agent.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Assign batching parameters for the downstream exporter.
    pub fn with_batch_options(mut self, batch_options: BatchOptions) -> Self {
        self.batch_options = batch_options;
        self
    }

    /// Assign the interval between metric reports.
    pub fn with_metric_interval(mut self, interval: Duration) -> Self {
        self.metric_interval = interval;
        self
    }

    /// Cap the number of error spans admitted per second.
    pub fn with_error_tps(mut self, max_per_second: u32) -> Self {
        self.filter.error_tps = Some(max_per_second);
        self
    }

    /// Enable or disable the error-span admission rule.
    pub fn with_error_traces(mut self, enabled: bool) -> Self {
        self.filter.send_error_traces = enabled;
        self
    }

    /// Admit every span slower than this many milliseconds. Zero disables
    /// the rule.
    pub fn with_slow_threshold_ms(mut self, threshold_ms: u64) -> Self {
        self.filter.slow_threshold_ms = threshold_ms;
        self
    }

    /// Assign the probabilistic sampling rate. Values above
    /// [`MAX_SAMPLE_RATE`](crate::MAX_SAMPLE_RATE) are clamped.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.filter.sample_rate = Some(rate);
        self
    }

    /// Allow endpoint auto-detection to probe cluster DNS. The probe can
    /// block on the system resolver, so it is off by default.
    pub fn with_dns_probe(mut self, enabled: bool) -> Self {
        self.probe_dns = enabled;
        self
    }

    /// Resolve the agent base URL and assemble the pipeline.
    pub fn build(self) -> Result<WatchlogPipeline, Error> {
        let resolver = EndpointResolver::new(self.url, self.probe_dns);
        let base = resolver.base_url();
        let base = base.trim_end_matches('/');
        let trace_endpoint = Url::parse(&format!("{}/{}/v1/traces", base, self.app))?;
        let metrics_endpoint = Url::parse(&format!("{}/{}/v1/metrics", base, self.app))?;
        Ok(WatchlogPipeline {
            trace_endpoint,
            metrics_endpoint,
            headers: self.headers,
            batch_options: self.batch_options,
            metric_interval: self.metric_interval,
            filter: self.filter,
        })
    }
}

/// A resolved Watchlog pipeline configuration.
///
/// Holds the validated agent endpoints plus everything the exporting
/// collaborators need: headers, batch options, the metric interval, and the
/// admission rules applied by [`span_processor`](Self::span_processor).
#[derive(Debug)]
pub struct WatchlogPipeline {
    trace_endpoint: Url,
    metrics_endpoint: Url,
    headers: HashMap<String, String>,
    batch_options: BatchOptions,
    metric_interval: Duration,
    filter: FilterConfig,
}

impl WatchlogPipeline {
    /// Endpoint receiving exported trace batches.
    pub fn trace_endpoint(&self) -> &Url {
        &self.trace_endpoint
    }

    /// Endpoint receiving metric reports.
    pub fn metrics_endpoint(&self) -> &Url {
        &self.metrics_endpoint
    }

    /// Extra headers for requests to the agent.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Batching parameters for the downstream exporter.
    pub fn batch_options(&self) -> &BatchOptions {
        &self.batch_options
    }

    /// Interval between metric reports.
    pub fn metric_interval(&self) -> Duration {
        self.metric_interval
    }

    /// The configured admission rules.
    pub fn filter_config(&self) -> &FilterConfig {
        &self.filter
    }

    /// Wrap `downstream` in a processor that applies the configured
    /// admission rules.
    pub fn span_processor<P: SpanProcessor>(&self, downstream: P) -> FilteredSpanProcessor<P> {
        FilteredSpanProcessor::new(downstream, &self.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::WATCHLOG_APM_URL;

    #[test]
    fn endpoints_embed_the_app_name() {
        temp_env::with_var_unset(WATCHLOG_APM_URL, || {
            let pipeline = new_pipeline()
                .with_app("checkout")
                .with_url("http://127.0.0.1:3774/apm")
                .build()
                .unwrap();
            assert_eq!(
                pipeline.trace_endpoint().as_str(),
                "http://127.0.0.1:3774/apm/checkout/v1/traces"
            );
            assert_eq!(
                pipeline.metrics_endpoint().as_str(),
                "http://127.0.0.1:3774/apm/checkout/v1/metrics"
            );
        });
    }

    #[test]
    fn env_override_applies_to_built_endpoints() {
        temp_env::with_var(WATCHLOG_APM_URL, Some("http://agent:9000/apm"), || {
            let pipeline = new_pipeline()
                .with_app("checkout")
                .with_url("http://ignored:3774/apm")
                .build()
                .unwrap();
            assert_eq!(
                pipeline.trace_endpoint().as_str(),
                "http://agent:9000/apm/checkout/v1/traces"
            );
        });
    }

    #[test]
    fn trailing_slash_on_the_base_url_is_trimmed() {
        temp_env::with_var_unset(WATCHLOG_APM_URL, || {
            let pipeline = new_pipeline()
                .with_app("checkout")
                .with_url("http://127.0.0.1:3774/apm/")
                .build()
                .unwrap();
            assert_eq!(
                pipeline.trace_endpoint().as_str(),
                "http://127.0.0.1:3774/apm/checkout/v1/traces"
            );
        });
    }

    #[test]
    fn invalid_base_url_fails_the_build() {
        temp_env::with_var_unset(WATCHLOG_APM_URL, || {
            let result = new_pipeline().with_url("not a url").build();
            assert!(matches!(result, Err(Error::InvalidEndpoint(_))));
        });
    }

    #[test]
    fn defaults_are_applied() {
        temp_env::with_var_unset(WATCHLOG_APM_URL, || {
            let pipeline = new_pipeline()
                .with_url("http://127.0.0.1:3774/apm")
                .build()
                .unwrap();
            assert_eq!(
                pipeline.trace_endpoint().as_str(),
                "http://127.0.0.1:3774/apm/unnamed-app/v1/traces"
            );
            assert_eq!(pipeline.batch_options().max_batch_size, 200);
            assert_eq!(
                pipeline.batch_options().scheduled_delay,
                Duration::from_millis(5_000)
            );
            assert_eq!(pipeline.metric_interval(), Duration::from_millis(5_000));
            assert!(pipeline.filter_config().is_noop());
        });
    }

    #[test]
    fn filter_knobs_reach_the_filter_config() {
        temp_env::with_var_unset(WATCHLOG_APM_URL, || {
            let pipeline = new_pipeline()
                .with_url("http://127.0.0.1:3774/apm")
                .with_error_traces(true)
                .with_error_tps(12)
                .with_slow_threshold_ms(250)
                .with_sample_rate(0.9)
                .build()
                .unwrap();
            let filter = pipeline.filter_config();
            assert!(filter.send_error_traces);
            assert_eq!(filter.error_tps, Some(12));
            assert_eq!(filter.slow_threshold_ms, 250);
            assert_eq!(filter.sample_rate, Some(0.9));
            assert!(!filter.is_noop());
        });
    }

    #[test]
    fn headers_are_forwarded() {
        temp_env::with_var_unset(WATCHLOG_APM_URL, || {
            let mut headers = HashMap::new();
            headers.insert("x-api-key".to_string(), "secret".to_string());
            let pipeline = new_pipeline()
                .with_url("http://127.0.0.1:3774/apm")
                .with_headers(headers)
                .build()
                .unwrap();
            assert_eq!(
                pipeline.headers().get("x-api-key").map(String::as_str),
                Some("secret")
            );
        });
    }
}
