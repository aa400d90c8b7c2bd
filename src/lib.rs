//! # OpenTelemetry Watchlog
//!
//! Admission filtering and agent endpoint discovery for applications that ship
//! traces to a [Watchlog] node agent.
//!
//! The crate covers the two decisions an instrumented process has to make
//! before any span leaves it:
//!
//! * **Which spans are worth exporting.** [`FilteredSpanProcessor`] wraps any
//!   downstream [`SpanProcessor`] (typically a batching exporter) and gates
//!   every finished span through a [`SpanFilter`]: error spans draw from a
//!   per-second budget, slow spans are always kept, and the remainder is
//!   sampled probabilistically with a hard 30% ceiling.
//! * **Where to send them.** [`EndpointResolver`] picks the agent base URL
//!   from the `WATCHLOG_APM_URL` environment variable, an explicitly
//!   configured URL, or auto-detection of the runtime environment (Kubernetes
//!   service-account token, cgroup membership, and optionally cluster DNS).
//!
//! Span creation, batching, wire encoding, and transport stay with the usual
//! OpenTelemetry components; this crate only decides and routes.
//!
//! ## Getting started
//!
//! ```
//! use opentelemetry_watchlog::new_pipeline;
//!
//! let pipeline = new_pipeline()
//!     .with_app("checkout")
//!     .with_url("http://127.0.0.1:3774/apm")
//!     .with_error_traces(true)
//!     .with_error_tps(5)
//!     .with_slow_threshold_ms(300)
//!     .build()
//!     .expect("valid endpoint");
//!
//! assert_eq!(
//!     pipeline.trace_endpoint().as_str(),
//!     "http://127.0.0.1:3774/apm/checkout/v1/traces",
//! );
//!
//! // Hand pipeline.span_processor(downstream) to your tracer provider and
//! // pipeline.metrics_endpoint() to your metrics exporter.
//! ```
//!
//! Omit `with_url` to let the resolver detect the environment: inside a
//! cluster it targets the `watchlog-node-agent` service, otherwise the local
//! agent on `127.0.0.1:3774`.
//!
//! [Watchlog]: https://watchlog.io
//! [`SpanProcessor`]: opentelemetry_sdk::trace::SpanProcessor
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(test, deny(warnings))]

mod config;
mod endpoint;
mod filter;
mod processor;

pub use config::{new_pipeline, BatchOptions, Error, WatchlogPipeline, WatchlogPipelineBuilder};
pub use endpoint::{ClusterDetector, DnsLookup, EndpointResolver, SystemDns, WATCHLOG_APM_URL};
pub use filter::{ErrorRateLimiter, FilterConfig, SpanFilter, MAX_SAMPLE_RATE};
pub use processor::FilteredSpanProcessor;
