//! Watchlog agent endpoint discovery.
//!
//! The agent base URL is taken from the [`WATCHLOG_APM_URL`] environment
//! variable when set, then from an explicitly configured URL, and only then
//! from auto-detection of the runtime environment. Detection itself is a
//! short-circuiting chain of independent probes, each of which swallows its
//! own failures: an unreadable file or a failed lookup is a negative vote,
//! never an error.

use std::io;
use std::path::PathBuf;
use std::{env, fs};

use once_cell::sync::OnceCell;
use opentelemetry::otel_debug;

/// Environment variable that overrides endpoint resolution entirely.
///
/// When set and non-empty, its value is used verbatim as the agent base URL,
/// taking precedence over both configuration and auto-detection.
pub const WATCHLOG_APM_URL: &str = "WATCHLOG_APM_URL";

/// Agent base URL used outside a cluster.
const DEFAULT_LOCAL_ENDPOINT: &str = "http://127.0.0.1:3774/apm";
/// Agent base URL used inside a Kubernetes cluster.
const DEFAULT_CLUSTER_ENDPOINT: &str =
    "http://watchlog-node-agent.monitoring.svc.cluster.local:3774/apm";

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CGROUP_PATH: &str = "/proc/self/cgroup";
const CGROUP_MARKER: &str = "kubepods";
const CLUSTER_DNS_NAME: &str = "kubernetes.default.svc.cluster.local";
const CLUSTER_DNS_PORT: u16 = 443;

/// Name-resolution collaborator used by the in-cluster DNS probe.
///
/// The default implementation is [`SystemDns`]; tests substitute their own to
/// stub or count lookups.
pub trait DnsLookup: Send + Sync + std::fmt::Debug {
    /// Resolve `host`, returning an error when no address was found.
    fn lookup(&self, host: &str) -> io::Result<()>;
}

/// [`DnsLookup`] backed by the operating system resolver.
#[derive(Debug, Default)]
pub struct SystemDns;

impl DnsLookup for SystemDns {
    fn lookup(&self, host: &str) -> io::Result<()> {
        use std::net::ToSocketAddrs;
        let mut addresses = (host, CLUSTER_DNS_PORT).to_socket_addrs()?;
        if addresses.next().is_some() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                "name resolved to no addresses",
            ))
        }
    }
}

/// Detects whether the process runs inside a container-orchestration cluster.
#[derive(Debug)]
pub struct ClusterDetector {
    token_path: PathBuf,
    cgroup_path: PathBuf,
    dns: Box<dyn DnsLookup>,
}

impl Default for ClusterDetector {
    fn default() -> Self {
        ClusterDetector::new()
    }
}

impl ClusterDetector {
    /// Detector probing the well-known orchestrator signals.
    pub fn new() -> Self {
        ClusterDetector {
            token_path: PathBuf::from(SERVICE_ACCOUNT_TOKEN_PATH),
            cgroup_path: PathBuf::from(CGROUP_PATH),
            dns: Box::new(SystemDns),
        }
    }

    /// Replace the lookup mechanism used by the DNS probe.
    pub fn with_dns(mut self, dns: impl DnsLookup + 'static) -> Self {
        self.dns = Box::new(dns);
        self
    }

    /// Run the probes in order; the first positive signal wins.
    ///
    /// The DNS probe may block on the resolver and is attempted only when
    /// `probe_dns` is set, so callers needing a non-blocking startup can opt
    /// out.
    pub fn is_cluster(&self, probe_dns: bool) -> bool {
        self.has_service_account_token()
            || self.cgroup_mentions_orchestrator()
            || (probe_dns && self.cluster_dns_resolves())
    }

    fn has_service_account_token(&self) -> bool {
        self.token_path.exists()
    }

    fn cgroup_mentions_orchestrator(&self) -> bool {
        fs::read_to_string(&self.cgroup_path)
            .map(|contents| contents.contains(CGROUP_MARKER))
            .unwrap_or(false)
    }

    fn cluster_dns_resolves(&self) -> bool {
        self.dns.lookup(CLUSTER_DNS_NAME).is_ok()
    }
}

/// Resolves and caches the Watchlog agent base URL.
///
/// The environment override and the explicit URL short-circuit detection
/// entirely; when neither is present, detection runs at most once per
/// resolver and later calls return the cached value without touching the
/// filesystem or the resolver again.
#[derive(Debug)]
pub struct EndpointResolver {
    explicit_url: Option<String>,
    probe_dns: bool,
    detector: ClusterDetector,
    detected: OnceCell<String>,
}

impl EndpointResolver {
    /// Resolver using the default [`ClusterDetector`].
    pub fn new(explicit_url: Option<String>, probe_dns: bool) -> Self {
        EndpointResolver::with_detector(explicit_url, probe_dns, ClusterDetector::new())
    }

    /// Resolver with a custom detector, e.g. one carrying a stubbed
    /// [`DnsLookup`].
    pub fn with_detector(
        explicit_url: Option<String>,
        probe_dns: bool,
        detector: ClusterDetector,
    ) -> Self {
        EndpointResolver {
            explicit_url,
            probe_dns,
            detector,
            detected: OnceCell::new(),
        }
    }

    /// The agent base URL.
    ///
    /// Safe to call before any network stack is initialized; only the
    /// optional DNS probe performs network activity, and only on the first
    /// call that reaches auto-detection.
    pub fn base_url(&self) -> String {
        if let Ok(url) = env::var(WATCHLOG_APM_URL) {
            if !url.is_empty() {
                return url;
            }
        }
        if let Some(url) = &self.explicit_url {
            return url.clone();
        }
        self.detected
            .get_or_init(|| {
                let base = if self.detector.is_cluster(self.probe_dns) {
                    DEFAULT_CLUSTER_ENDPOINT
                } else {
                    DEFAULT_LOCAL_ENDPOINT
                };
                otel_debug!(name: "WatchlogEndpoint.Detected", url = base);
                base.to_string()
            })
            .clone()
    }
}
