//! Metrics: a sliding-window throughput tracker, plus a parallel Prometheus
//! export surface for scraping.

use parking_lot::Mutex;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;

const WINDOW: Duration = Duration::from_secs(1);
const READ_CACHE_TTL: Duration = Duration::from_millis(100);

struct RequestWindow {
    completions: VecDeque<Instant>,
}

impl RequestWindow {
    fn new() -> Self {
        Self {
            completions: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.completions.front() {
            if now.duration_since(*front) > WINDOW {
                self.completions.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub requests_per_second: f64,
    pub average_iteration_duration: Duration,
    pub total_iterations: u64,
}

struct CachedSnapshot {
    at: Instant,
    value: Snapshot,
}

/// Tracks rolling requests-per-second over a 1-second sliding window and the
/// average duration of iterations that completed without a `flow_error`,
/// with a short-lived read cache so metrics reads never contend heavily with
/// the hot path.
pub struct Metrics {
    window: Mutex<RequestWindow>,
    duration_sum: Mutex<Duration>,
    duration_count: AtomicU64,
    total_iterations: AtomicU64,
    cache: Mutex<Option<CachedSnapshot>>,
    registry: Arc<Registry>,
    iterations_total: Counter,
    requests_total: Counter,
    errors_total: Counter,
    iteration_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let iterations_total = Counter::with_opts(Opts::new(
            "loadflow_iterations_total",
            "Total completed flow iterations across all simulated users",
        ))?;
        let requests_total = Counter::with_opts(Opts::new(
            "loadflow_requests_total",
            "Total HTTP requests sent by the request executor",
        ))?;
        let errors_total = Counter::with_opts(Opts::new(
            "loadflow_errors_total",
            "Total flow iterations that ended in a recorded flow_error",
        ))?;
        let iteration_duration = Histogram::with_opts(
            HistogramOpts::new(
                "loadflow_iteration_duration_seconds",
                "Duration of one completed flow iteration",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(iterations_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(iteration_duration.clone()))?;

        Ok(Self {
            window: Mutex::new(RequestWindow::new()),
            duration_sum: Mutex::new(Duration::ZERO),
            duration_count: AtomicU64::new(0),
            total_iterations: AtomicU64::new(0),
            cache: Mutex::new(None),
            registry,
            iterations_total,
            requests_total,
            errors_total,
            iteration_duration,
        })
    }

    /// Records one completed HTTP request/response pair, independent of its
    /// status. This — not flow iterations — is what feeds the rolling RPS
    /// window; a flow iteration can issue any number of requests.
    pub fn record_request(&self, got_response: bool) {
        self.requests_total.inc();
        if got_response {
            let now = Instant::now();
            let mut window = self.window.lock();
            window.evict(now);
            window.completions.push_back(now);
        }
    }

    /// Records one completed flow iteration. `total_iterations` always
    /// increments; the duration average only accumulates for iterations
    /// that completed with no `flow_error`.
    pub fn record_iteration(&self, duration: Duration, succeeded: bool) {
        self.iterations_total.inc();
        self.iteration_duration.observe(duration.as_secs_f64());
        self.total_iterations.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            *self.duration_sum.lock() += duration;
            self.duration_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors_total.inc();
        }
    }

    /// A point-in-time snapshot of throughput and latency, cached briefly
    /// so concurrent readers don't all re-walk the sliding window.
    pub fn snapshot(&self) -> Snapshot {
        let now = Instant::now();
        {
            let cache = self.cache.lock();
            if let Some(ref cached) = *cache {
                if now.duration_since(cached.at) < READ_CACHE_TTL {
                    return cached.value;
                }
            }
        }

        let mut window = self.window.lock();
        window.evict(now);
        let rps = window.completions.len() as f64 / WINDOW.as_secs_f64();
        drop(window);

        let duration_count = self.duration_count.load(Ordering::Relaxed);
        let avg = if duration_count > 0 {
            *self.duration_sum.lock() / duration_count as u32
        } else {
            Duration::ZERO
        };

        let snapshot = Snapshot {
            requests_per_second: rps,
            average_iteration_duration: avg,
            total_iterations: self.total_iterations.load(Ordering::Relaxed),
        };

        *self.cache.lock() = Some(CachedSnapshot { at: now, value: snapshot });
        snapshot
    }

    /// Renders all registered metrics in the Prometheus text exposition
    /// format, for a scrape endpoint.
    pub fn export_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metric registration with fixed, non-colliding names cannot fail")
    }
}
