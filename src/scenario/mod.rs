use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;

use crate::engine::http_client::HttpClient;
use crate::stats::{MetricRegistry, Tags, CHECKS, GROUP_DURATION};

pub mod http;

pub use http::{Http, RequestSpec, Response};

/// State shared between a context and its HTTP facade for one VU iteration.
pub(crate) struct ScenarioShared {
    pub(crate) vu_id: usize,
    pub(crate) registry: Arc<MetricRegistry>,
    pub(crate) client: HttpClient,
    pub(crate) group_path: Mutex<String>,
    pub(crate) think: Mutex<Option<Duration>>,
}

/// Handle a scenario receives on every iteration: groups, checks, the HTTP
/// facade, custom metrics and think-time requests.
#[derive(Clone)]
pub struct ScenarioContext {
    shared: Arc<ScenarioShared>,
    http: Http,
}

impl ScenarioContext {
    pub(crate) fn new(vu_id: usize, registry: Arc<MetricRegistry>, client: HttpClient) -> Self {
        let shared = Arc::new(ScenarioShared {
            vu_id,
            registry,
            client,
            group_path: Mutex::new(String::new()),
            think: Mutex::new(None),
        });
        Self { http: Http::new(shared.clone()), shared }
    }

    pub fn vu_id(&self) -> usize {
        self.shared.vu_id
    }

    pub fn http(&self) -> &Http {
        &self.http
    }

    pub(crate) fn registry(&self) -> &Arc<MetricRegistry> {
        &self.shared.registry
    }

    /// Run `body` as a named sub-scope, recording its wall-clock duration as
    /// a `group_duration` Trend sample (milliseconds) tagged with the full
    /// group path. Nested paths join with `::` and every path starts with
    /// `::`, so the root group `Blocks` is addressed as
    /// `group_duration{group:::Blocks}`.
    pub async fn group<F, Fut>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let prev = {
            let mut path = self.shared.group_path.lock();
            let prev = path.clone();
            path.push_str("::");
            path.push_str(name);
            prev
        };
        let started = Instant::now();
        let result = body().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let full = {
            let mut path = self.shared.group_path.lock();
            let full = path.clone();
            *path = prev;
            full
        };
        let mut tags = Tags::new();
        tags.insert("group".to_string(), full);
        let _ = self.shared.registry.trend_add(GROUP_DURATION, tags, elapsed_ms);
        result
    }

    /// Evaluate named assertions against `subject`. Every outcome is recorded
    /// on the built-in `checks` Rate metric tagged `check:<name>`; returns
    /// whether all passed, so the scenario can feed its own failure Rate.
    pub fn check<T>(&self, subject: &T, checks: &[(&str, fn(&T) -> bool)]) -> bool {
        let mut all_passed = true;
        for (name, predicate) in checks {
            let passed = predicate(subject);
            let mut tags = Tags::new();
            tags.insert("check".to_string(), (*name).to_string());
            let _ = self.shared.registry.rate_add(CHECKS, tags, passed);
            if !passed {
                all_passed = false;
            }
        }
        all_passed
    }

    /// Request a pause before the next iteration. Applied by the executor
    /// after the current iteration returns, unless the VU has been asked to
    /// stop; the last request of an iteration wins.
    pub fn think(&self, pause: Duration) {
        *self.shared.think.lock() = Some(pause);
    }

    pub(crate) fn take_think(&self) -> Option<Duration> {
        self.shared.think.lock().take()
    }

    pub fn counter_add(&self, name: &str, value: f64, tags: Option<Tags>) -> Result<()> {
        self.shared.registry.counter_add(name, tags.unwrap_or_default(), value)
    }

    pub fn rate_add(&self, name: &str, hit: bool, tags: Option<Tags>) -> Result<()> {
        self.shared.registry.rate_add(name, tags.unwrap_or_default(), hit)
    }

    pub fn trend_add(&self, name: &str, sample: f64, tags: Option<Tags>) -> Result<()> {
        self.shared.registry.trend_add(name, tags.unwrap_or_default(), sample)
    }

    pub fn gauge_set(&self, name: &str, value: f64, tags: Option<Tags>) -> Result<()> {
        self.shared.registry.gauge_set(name, tags.unwrap_or_default(), value)
    }
}
