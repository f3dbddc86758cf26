use anyhow::{bail, Result};
use std::time::Duration;

/// One ramp segment: interpolate toward `target` VUs over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampStage {
    pub duration: Duration,
    pub target: usize,
}

/// Converts an ordered stage list into a continuous, piecewise-linear VU
/// count over elapsed run time.
#[derive(Debug, Clone)]
pub struct StageScheduler {
    stages: Vec<RampStage>,
    total: Duration,
}

impl StageScheduler {
    pub fn new(stages: Vec<RampStage>) -> Result<Self> {
        if stages.is_empty() {
            bail!("stage list is empty: a run needs at least one stage");
        }
        let total = stages.iter().map(|s| s.duration).sum();
        Ok(Self { stages, total })
    }

    /// Sum of all stage durations; the run's natural end.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Target of the last stage; held after the schedule ends until the run
    /// is stopped (zero means the curve ends idle).
    pub fn final_target(&self) -> usize {
        self.stages.last().map(|s| s.target).unwrap_or(0)
    }

    /// Prescribed VU count at `elapsed`, interpolating linearly within the
    /// covering stage from the previous stage's target (0 before the first
    /// stage). The interpolated value is rounded to the nearest whole VU, so
    /// declared targets are met exactly at stage boundaries.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut offset = Duration::ZERO;
        let mut prev = 0usize;
        for stage in &self.stages {
            let end = offset + stage.duration;
            if elapsed < end {
                if stage.duration.is_zero() {
                    return stage.target;
                }
                let progress =
                    (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
                let delta = stage.target as f64 - prev as f64;
                return (prev as f64 + delta * progress).round() as usize;
            }
            offset = end;
            prev = stage.target;
        }
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn scheduler(stages: &[(u64, usize)]) -> StageScheduler {
        StageScheduler::new(
            stages
                .iter()
                .map(|&(d, target)| RampStage { duration: secs(d), target })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_stage_list_is_error() {
        assert!(StageScheduler::new(Vec::new()).is_err());
    }

    #[test]
    fn test_ramp_up_interpolates() {
        let s = scheduler(&[(60, 100)]);
        assert_eq!(s.target_at(Duration::ZERO), 0);
        assert_eq!(s.target_at(secs(30)), 50);
        assert_eq!(s.target_at(secs(45)), 75);
        assert_eq!(s.target_at(secs(60)), 100);
    }

    #[test]
    fn test_targets_exact_at_stage_boundaries() {
        // The observed ramp profile: 1m to 100, hold-ish to 50, down to 30, down to 0
        let s = scheduler(&[(60, 100), (210, 50), (60, 30), (30, 0)]);
        assert_eq!(s.target_at(secs(60)), 100);
        assert_eq!(s.target_at(secs(270)), 50);
        assert_eq!(s.target_at(secs(330)), 30);
        assert_eq!(s.target_at(secs(360)), 0);
        assert_eq!(s.total_duration(), secs(360));
    }

    #[test]
    fn test_ramp_down_interpolates() {
        let s = scheduler(&[(10, 100), (10, 0)]);
        assert_eq!(s.target_at(secs(15)), 50);
        assert_eq!(s.target_at(Duration::from_millis(17_500)), 25);
    }

    #[test]
    fn test_holds_nonzero_final_target_after_end() {
        let s = scheduler(&[(10, 20)]);
        assert_eq!(s.target_at(secs(10)), 20);
        assert_eq!(s.target_at(secs(999)), 20);
        assert_eq!(s.final_target(), 20);
    }

    #[test]
    fn test_zero_final_target_after_end() {
        let s = scheduler(&[(10, 20), (10, 0)]);
        assert_eq!(s.target_at(secs(20)), 0);
        assert_eq!(s.target_at(secs(999)), 0);
        assert_eq!(s.final_target(), 0);
    }

    #[test]
    fn test_zero_target_first_stage_starts_idle() {
        let s = scheduler(&[(10, 0), (10, 10)]);
        assert_eq!(s.target_at(Duration::ZERO), 0);
        assert_eq!(s.target_at(secs(5)), 0);
        assert_eq!(s.target_at(secs(15)), 5);
    }

    #[test]
    fn test_zero_duration_stage_steps() {
        let s = scheduler(&[(0, 10), (10, 10)]);
        assert_eq!(s.target_at(Duration::ZERO), 10);
        assert_eq!(s.target_at(secs(5)), 10);
    }

    #[test]
    fn test_never_negative_and_continuous() {
        let s = scheduler(&[(10, 5), (10, 0), (10, 7)]);
        let mut last = s.target_at(Duration::ZERO);
        for ms in (0..=30_000u64).step_by(100) {
            let v = s.target_at(Duration::from_millis(ms));
            // piecewise-linear with integer rounding: adjacent samples move by
            // at most the stage slope (here < 1 VU per 100ms)
            assert!(v <= 7);
            assert!((v as i64 - last as i64).abs() <= 1);
            last = v;
        }
    }
}
