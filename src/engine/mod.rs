use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use crossbeam_channel::Receiver;

use crate::config::{RunConfig, RunPlan};
use crate::scenario::ScenarioContext;
use crate::stats::threshold::{Threshold, Verdict};
use crate::stats::{
    MetricKind, MetricRegistry, RunReport, RunStatus, ThresholdReport, CHECKS, GROUP_DURATION,
    HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, ITERATIONS, ITERATION_DURATION,
    ITERATION_ERRORS,
};

pub mod control;
pub mod executor;
pub mod http_client;
pub mod scheduler;

use control::{ControlCommand, ControlState};
use executor::{scenario_fn, ScenarioFn, VuSlot};
use http_client::HttpClient;

/// Control-loop cadence for VU reconciliation and state transitions.
const CONTROL_TICK: Duration = Duration::from_millis(100);

/// Load-test engine: owns the runtime, drives the VU population through the
/// configured schedule and emits the final report exactly once per run.
pub struct Engine {
    plan: RunPlan,
}

impl Engine {
    /// Validate the configuration; any configuration error fails here, before
    /// a run starts.
    pub fn new(config: RunConfig) -> Result<Self> {
        let plan = config.validate()?;
        Ok(Self { plan })
    }

    /// Execute one run, blocking until it completes or aborts.
    pub fn run<F, Fut>(&self, scenario: F) -> Result<RunReport>
    where
        F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.run_with_control(scenario, None)
    }

    /// Like [`Engine::run`], with an external control channel an embedder can
    /// use to request a graceful stop mid-run.
    pub fn run_with_control<F, Fut>(
        &self,
        scenario: F,
        control_rx: Option<Receiver<ControlCommand>>,
    ) -> Result<RunReport>
    where
        F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let scenario = scenario_fn(scenario);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get().max(4))
            .enable_all()
            .build()?;
        let client = {
            let _guard = runtime.enter();
            HttpClient::new()?
        };
        let registry = Arc::new(MetricRegistry::new());
        declare_builtin_metrics(&registry)?;
        let control = Arc::new(ControlState::new());

        let started_at = Utc::now();
        let started = Instant::now();
        let outcome = runtime.block_on(drive(
            &self.plan,
            scenario,
            registry.clone(),
            client,
            control,
            control_rx,
        ));

        Ok(RunReport::compile(
            &registry,
            outcome.status,
            outcome.abort_reason,
            started_at,
            started.elapsed().as_millis(),
            outcome.thresholds,
        ))
    }
}

fn declare_builtin_metrics(registry: &MetricRegistry) -> Result<()> {
    registry.declare(CHECKS, MetricKind::Rate)?;
    registry.declare(GROUP_DURATION, MetricKind::Trend)?;
    registry.declare(HTTP_REQS, MetricKind::Counter)?;
    registry.declare(HTTP_REQ_DURATION, MetricKind::Trend)?;
    registry.declare(HTTP_REQ_FAILED, MetricKind::Rate)?;
    registry.declare(ITERATIONS, MetricKind::Counter)?;
    registry.declare(ITERATION_DURATION, MetricKind::Trend)?;
    registry.declare(ITERATION_ERRORS, MetricKind::Counter)?;
    Ok(())
}

struct RunOutcome {
    status: RunStatus,
    abort_reason: Option<String>,
    thresholds: Vec<ThresholdReport>,
}

/// Per-run controller state; created at run start, torn down after the report
/// is compiled.
struct RunState {
    status: RunStatus,
    vus: Vec<VuSlot>,
    retiring: Vec<VuSlot>,
    next_vu_id: usize,
    verdicts: Vec<Option<Verdict>>,
    abort: Option<(usize, String)>,
}

async fn drive(
    plan: &RunPlan,
    scenario: ScenarioFn,
    registry: Arc<MetricRegistry>,
    client: HttpClient,
    control: Arc<ControlState>,
    control_rx: Option<Receiver<ControlCommand>>,
) -> RunOutcome {
    let start = Instant::now();
    let mut state = RunState {
        status: RunStatus::Pending,
        vus: Vec::new(),
        retiring: Vec::new(),
        next_vu_id: 1,
        verdicts: vec![None; plan.thresholds.len()],
        abort: None,
    };
    state.status = RunStatus::Running;

    let schedule_end = plan.scheduler.total_duration();
    let mut tick = tokio::time::interval(CONTROL_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_eval: Option<Instant> = None;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        tick.tick().await;
        let elapsed = start.elapsed();

        if let Some(rx) = &control_rx {
            while let Ok(cmd) = rx.try_recv() {
                match cmd {
                    ControlCommand::Stop => {
                        if state.status == RunStatus::Running {
                            begin_drain(&mut state, &control, &mut drain_deadline, plan.graceful_stop);
                        }
                    }
                }
            }
        }

        match state.status {
            RunStatus::Running => {
                // Hard deadline: cancel everything in flight and finalize
                if plan.max_duration.is_some_and(|cap| elapsed >= cap) {
                    control.stop();
                    for vu in state.vus.iter().chain(state.retiring.iter()) {
                        vu.signal_stop();
                        vu.handle.abort();
                    }
                    break;
                }

                reap_finished(&mut state);

                let target = plan.scheduler.target_at(elapsed);
                while state.vus.len() < target {
                    let id = state.next_vu_id;
                    state.next_vu_id += 1;
                    state.vus.push(executor::spawn_vu(
                        id,
                        scenario.clone(),
                        registry.clone(),
                        client.clone(),
                        control.clone(),
                    ));
                }
                while state.vus.len() > target {
                    if let Some(slot) = state.vus.pop() {
                        slot.signal_stop();
                        state.retiring.push(slot);
                    }
                }

                if last_eval.is_none_or(|t| t.elapsed() >= plan.tick_interval) {
                    last_eval = Some(Instant::now());
                    if let Some(idx) =
                        evaluate_tick(&plan.thresholds, &registry, &mut state.verdicts)
                    {
                        let reason = format!(
                            "threshold '{}' on '{}' failed",
                            plan.thresholds[idx].expression(),
                            plan.thresholds[idx].metric_display()
                        );
                        eprintln!("aborting run: {}", reason);
                        state.abort = Some((idx, reason));
                        begin_drain(&mut state, &control, &mut drain_deadline, plan.graceful_stop);
                        continue;
                    }
                }

                if elapsed >= schedule_end {
                    begin_drain(&mut state, &control, &mut drain_deadline, plan.graceful_stop);
                }
            }
            RunStatus::Draining => {
                reap_finished(&mut state);
                if state.vus.is_empty() && state.retiring.is_empty() {
                    break;
                }
                if drain_deadline.is_some_and(|d| Instant::now() >= d) {
                    for vu in state.vus.iter().chain(state.retiring.iter()) {
                        vu.handle.abort();
                    }
                    break;
                }
            }
            _ => break,
        }
    }

    // Settle every remaining task, including ones we cancelled
    for vu in state.vus.drain(..).chain(state.retiring.drain(..)) {
        let _ = vu.handle.await;
    }

    let abort_idx = state.abort.as_ref().map(|(idx, _)| *idx);
    let thresholds = finalize_thresholds(&plan.thresholds, &registry, &state.verdicts, abort_idx);
    let status = if state.abort.is_some() { RunStatus::Aborted } else { RunStatus::Completed };
    RunOutcome { status, abort_reason: state.abort.map(|(_, reason)| reason), thresholds }
}

/// Stop spawning, ask every VU to finish its current iteration and move to
/// Draining with a bounded grace window.
fn begin_drain(
    state: &mut RunState,
    control: &ControlState,
    deadline: &mut Option<Instant>,
    grace: Duration,
) {
    control.stop();
    for vu in state.vus.iter().chain(state.retiring.iter()) {
        vu.signal_stop();
    }
    state.status = RunStatus::Draining;
    *deadline = Some(Instant::now() + grace);
}

fn reap_finished(state: &mut RunState) {
    state.vus.retain(|vu| !vu.handle.is_finished());
    state.retiring.retain(|vu| !vu.handle.is_finished());
}

/// Evaluate every threshold once; returns the index of the first failing
/// threshold that demands an abort.
fn evaluate_tick(
    thresholds: &[Threshold],
    registry: &MetricRegistry,
    verdicts: &mut [Option<Verdict>],
) -> Option<usize> {
    let mut abort = None;
    for (idx, threshold) in thresholds.iter().enumerate() {
        let verdict = threshold.evaluate(registry);
        if !verdict.passed && threshold.abort_on_fail && abort.is_none() {
            abort = Some(idx);
        }
        verdicts[idx] = Some(verdict);
    }
    abort
}

/// Final verdicts over the end-of-run snapshot. The threshold that triggered
/// an abort keeps its failing verdict.
fn finalize_thresholds(
    thresholds: &[Threshold],
    registry: &MetricRegistry,
    verdicts: &[Option<Verdict>],
    abort_idx: Option<usize>,
) -> Vec<ThresholdReport> {
    thresholds
        .iter()
        .enumerate()
        .map(|(idx, threshold)| {
            let verdict = if Some(idx) == abort_idx {
                verdicts[idx]
                    .clone()
                    .unwrap_or(Verdict { passed: false, observed: None })
            } else {
                threshold.evaluate(registry)
            };
            ThresholdReport {
                metric: threshold.metric_display(),
                expression: threshold.expression().to_string(),
                passed: verdict.passed,
                observed: verdict.observed,
                abort_on_fail: threshold.abort_on_fail,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Stage, ThresholdSpec};
    use crate::stats::Tags;
    use std::collections::HashMap;

    fn stage(duration: &str, target: usize) -> Stage {
        Stage { duration: duration.to_string(), target }
    }

    fn counter_value(report: &RunReport, name: &str) -> f64 {
        report.counters.get(name).copied().unwrap_or(0.0)
    }

    #[test]
    fn test_empty_schedule_is_configuration_error() {
        assert!(Engine::new(RunConfig::default()).is_err());
    }

    #[test]
    fn test_run_completes_with_check_and_group() {
        let mut criteria = HashMap::new();
        criteria.insert(
            "checks".to_string(),
            vec![ThresholdSpec::Expression("rate==1".to_string())],
        );
        let config = RunConfig {
            schedule: vec![stage("1s", 1), stage("1s", 0)],
            criteria,
            graceful_stop: Some("5s".to_string()),
            ..Default::default()
        };
        let engine = Engine::new(config).unwrap();

        let report = engine
            .run(|ctx| async move {
                let inner = ctx.clone();
                ctx.group("main", move || async move {
                    let passed = inner.check(&42i32, &[("answer is 42", |v: &i32| *v == 42)]);
                    anyhow::ensure!(passed, "check failed");
                    Ok(())
                })
                .await?;
                ctx.think(Duration::from_millis(5));
                Ok(())
            })
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.abort_reason.is_none());
        assert!(report.passed());

        // at least one iteration ran and every check passed
        assert!(counter_value(&report, ITERATIONS) >= 1.0);
        assert_eq!(counter_value(&report, ITERATION_ERRORS), 0.0);
        let checks = &report.rates["checks{check:answer is 42}"];
        assert!(checks.total > 0);
        assert_eq!(checks.hits, checks.total);

        // group_duration populated under the group path tag
        let group = &report.trends["group_duration{group:::main}"];
        assert!(group.count >= 1);
    }

    #[test]
    fn test_aborts_on_breached_threshold_within_a_tick() {
        let mut criteria = HashMap::new();
        criteria.insert(
            "content_match_error".to_string(),
            vec![ThresholdSpec::Detailed {
                threshold: "count<5".to_string(),
                abort_on_fail: true,
            }],
        );
        let config = RunConfig {
            schedule: vec![stage("0s", 2), stage("30s", 2)],
            criteria,
            tick_interval: Some("100ms".to_string()),
            graceful_stop: Some("5s".to_string()),
            ..Default::default()
        };
        let engine = Engine::new(config).unwrap();

        let started = Instant::now();
        let report = engine
            .run(|ctx| async move {
                ctx.counter_add("content_match_error", 1.0, None)?;
                ctx.think(Duration::from_millis(10));
                Ok(())
            })
            .unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        let reason = report.abort_reason.as_deref().unwrap();
        assert!(reason.contains("count<5"), "unexpected reason: {}", reason);
        assert!(
            started.elapsed() < Duration::from_secs(15),
            "abort should fire long before the schedule ends"
        );

        let verdict = &report.thresholds[0];
        assert!(!verdict.passed);
        assert!(verdict.abort_on_fail);
        assert!(verdict.observed.unwrap_or(0.0) >= 5.0);
        assert!(!report.passed());
    }

    #[test]
    fn test_duration_cap_cuts_off_held_schedule() {
        let config = RunConfig {
            schedule: vec![stage("0s", 1), stage("60s", 1)],
            max_duration: Some("500ms".to_string()),
            ..Default::default()
        };
        let engine = Engine::new(config).unwrap();

        let started = Instant::now();
        let report = engine
            .run(|ctx| async move {
                ctx.think(Duration::from_millis(10));
                Ok(())
            })
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(counter_value(&report, ITERATIONS) >= 1.0);
    }

    #[test]
    fn test_control_channel_stop_ends_run_gracefully() {
        let config = RunConfig {
            schedule: vec![stage("0s", 1), stage("60s", 1)],
            graceful_stop: Some("5s".to_string()),
            ..Default::default()
        };
        let engine = Engine::new(config).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            let _ = tx.send(ControlCommand::Stop);
        });

        let started = Instant::now();
        let report = engine
            .run_with_control(
                |ctx| async move {
                    ctx.think(Duration::from_millis(5));
                    Ok(())
                },
                Some(rx),
            )
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_iteration_errors_do_not_abort_run() {
        let config = RunConfig {
            schedule: vec![stage("0s", 1), stage("500ms", 1), stage("0s", 0)],
            graceful_stop: Some("5s".to_string()),
            ..Default::default()
        };
        let engine = Engine::new(config).unwrap();

        let report = engine
            .run(|ctx| async move {
                ctx.think(Duration::from_millis(5));
                anyhow::bail!("iteration always fails")
            })
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        let errors = counter_value(&report, ITERATION_ERRORS);
        assert!(errors >= 1.0);
        assert_eq!(errors, counter_value(&report, ITERATIONS));
    }

    #[test]
    fn test_report_serializes_with_status() {
        let config = RunConfig {
            schedule: vec![stage("0s", 1), stage("200ms", 1), stage("0s", 0)],
            graceful_stop: Some("5s".to_string()),
            ..Default::default()
        };
        let engine = Engine::new(config).unwrap();
        let report = engine
            .run(|ctx| async move {
                ctx.gauge_set("active", 1.0, Some(Tags::new()))?;
                ctx.think(Duration::from_millis(5));
                Ok(())
            })
            .unwrap();

        let json = report.to_json();
        assert!(json.contains("\"status\": \"completed\""));
        assert!(json.contains("\"iterations\""));
        assert!(json.contains("\"active\""));
    }
}
