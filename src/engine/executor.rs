use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::engine::control::ControlState;
use crate::engine::http_client::HttpClient;
use crate::scenario::ScenarioContext;
use crate::stats::{MetricRegistry, Tags, ITERATIONS, ITERATION_DURATION, ITERATION_ERRORS};

/// The scenario entry point, invoked once per VU iteration.
pub type ScenarioFn =
    Arc<dyn Fn(ScenarioContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Adapt an async closure into a [`ScenarioFn`].
pub fn scenario_fn<F, Fut>(f: F) -> ScenarioFn
where
    F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// One live VU: its cooperative stop flag and the task driving its loop.
pub(crate) struct VuSlot {
    pub id: usize,
    pub running: Arc<AtomicBool>,
    pub handle: JoinHandle<()>,
}

impl VuSlot {
    /// Ask the VU to stop after its current iteration.
    pub fn signal_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Spawn a VU task. The VU starts at the beginning of the scenario loop and
/// keeps iterating until its flag or the run-wide stop flag clears.
pub(crate) fn spawn_vu(
    id: usize,
    scenario: ScenarioFn,
    registry: Arc<MetricRegistry>,
    client: HttpClient,
    control: Arc<ControlState>,
) -> VuSlot {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let handle = tokio::spawn(async move {
        run_vu(id, scenario, registry, client, control, flag).await;
    });
    VuSlot { id, running, handle }
}

async fn run_vu(
    id: usize,
    scenario: ScenarioFn,
    registry: Arc<MetricRegistry>,
    client: HttpClient,
    control: Arc<ControlState>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) && !control.is_stopped() {
        let ctx = ScenarioContext::new(id, registry.clone(), client.clone());
        let started = Instant::now();
        let outcome = AssertUnwindSafe(scenario(ctx.clone())).catch_unwind().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let _ = registry.counter_add(ITERATIONS, Tags::new(), 1.0);
        let _ = registry.trend_add(ITERATION_DURATION, Tags::new(), elapsed_ms);
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                eprintln!("[vu {}] iteration error: {:#}", id, err);
                let _ = registry.counter_add(ITERATION_ERRORS, Tags::new(), 1.0);
            }
            Err(_) => {
                eprintln!("[vu {}] iteration panicked", id);
                let _ = registry.counter_add(ITERATION_ERRORS, Tags::new(), 1.0);
            }
        }

        // Think-time applies between iterations; the stop flags are re-checked
        // by the loop condition immediately after the sleep.
        if let Some(pause) = ctx.take_think() {
            if !running.load(Ordering::Relaxed) || control.is_stopped() {
                break;
            }
            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup() -> (Arc<MetricRegistry>, HttpClient, Arc<ControlState>) {
        (
            Arc::new(MetricRegistry::new()),
            HttpClient::new().unwrap(),
            Arc::new(ControlState::new()),
        )
    }

    fn counter_value(registry: &MetricRegistry, name: &str) -> f64 {
        match registry.snapshot(name, &Tags::new()) {
            Some(crate::stats::MetricSnapshot::Counter { sum }) => sum,
            _ => 0.0,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_vu_iterates_until_signaled() {
        let (registry, client, control) = setup();
        let scenario = scenario_fn(|ctx: ScenarioContext| async move {
            ctx.think(Duration::from_millis(1));
            Ok(())
        });

        let slot = spawn_vu(1, scenario, registry.clone(), client, control);
        tokio::time::sleep(Duration::from_millis(100)).await;
        slot.signal_stop();
        slot.handle.await.unwrap();

        assert!(counter_value(&registry, ITERATIONS) >= 1.0);
        assert_eq!(counter_value(&registry, ITERATION_ERRORS), 0.0);
        assert!(registry.snapshot(ITERATION_DURATION, &Tags::new()).unwrap().count() >= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_iteration_error_does_not_kill_vu() {
        let (registry, client, control) = setup();
        let scenario = scenario_fn(|ctx: ScenarioContext| async move {
            ctx.think(Duration::from_millis(1));
            anyhow::bail!("scenario fault")
        });

        let slot = spawn_vu(1, scenario, registry.clone(), client, control);
        tokio::time::sleep(Duration::from_millis(100)).await;
        slot.signal_stop();
        slot.handle.await.unwrap();

        let iterations = counter_value(&registry, ITERATIONS);
        assert!(iterations >= 2.0, "VU should keep iterating after errors");
        assert_eq!(counter_value(&registry, ITERATION_ERRORS), iterations);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_iteration_panic_is_recovered() {
        let (registry, client, control) = setup();
        let scenario = scenario_fn(|ctx: ScenarioContext| async move {
            ctx.think(Duration::from_millis(1));
            panic!("scenario blew up");
        });

        let slot = spawn_vu(1, scenario, registry.clone(), client, control);
        tokio::time::sleep(Duration::from_millis(100)).await;
        slot.signal_stop();
        slot.handle.await.unwrap();

        assert!(counter_value(&registry, ITERATIONS) >= 2.0);
        assert!(counter_value(&registry, ITERATION_ERRORS) >= 2.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_wide_stop_flag_halts_vu() {
        let (registry, client, control) = setup();
        let scenario = scenario_fn(|ctx: ScenarioContext| async move {
            ctx.think(Duration::from_millis(1));
            Ok(())
        });

        let slot = spawn_vu(1, scenario, registry.clone(), client, control.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.stop();
        slot.handle.await.unwrap();
        assert!(!slot.running.load(Ordering::Relaxed) || control.is_stopped());
    }
}
