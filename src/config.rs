use anyhow::{anyhow, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::engine::scheduler::{RampStage, StageScheduler};
use crate::stats::threshold::Threshold;
use crate::utils::parse_duration_str;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// One ramp segment of the schedule.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct Stage {
    /// Duration of the segment (e.g., "30s", "1m")
    pub duration: String,
    /// VU count to reach by the end of the segment
    pub target: usize,
}

/// One threshold entry: either a bare expression or an expression with an
/// abort flag (k6: `{ threshold, abortOnFail }`).
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: bool,
    },
}

/// Declarative run configuration. Accepts both this crate's field names and
/// the k6-style aliases (`stages`, `thresholds`, `abortOnFail`).
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct RunConfig {
    /// Ramping schedule (k6: stages)
    #[serde(default, alias = "stages")]
    pub schedule: Vec<Stage>,
    /// Pass/fail criteria (k6: thresholds): metric selector -> expressions
    #[serde(default, alias = "thresholds")]
    pub criteria: HashMap<String, Vec<ThresholdSpec>>,
    /// Hard cap on total run time; in-flight work is cancelled when it fires
    #[serde(default, alias = "maxDuration")]
    pub max_duration: Option<String>,
    /// Threshold evaluation cadence (default "1s")
    #[serde(default, alias = "tickInterval")]
    pub tick_interval: Option<String>,
    /// How long draining waits for in-flight iterations (default "30s")
    #[serde(default, alias = "gracefulStop")]
    pub graceful_stop: Option<String>,
}

/// Validated form of [`RunConfig`]; construction fails fast on any
/// configuration error, before a run starts.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub(crate) scheduler: StageScheduler,
    pub(crate) thresholds: Vec<Threshold>,
    pub(crate) max_duration: Option<Duration>,
    pub(crate) tick_interval: Duration,
    pub(crate) graceful_stop: Duration,
}

impl RunConfig {
    pub fn validate(&self) -> Result<RunPlan> {
        let mut stages = Vec::with_capacity(self.schedule.len());
        for stage in &self.schedule {
            let duration = parse_duration_str(&stage.duration)
                .ok_or_else(|| anyhow!("invalid stage duration '{}'", stage.duration))?;
            stages.push(RampStage { duration, target: stage.target });
        }
        let scheduler = StageScheduler::new(stages)?;

        // Deterministic threshold order regardless of map iteration
        let mut selectors: Vec<&String> = self.criteria.keys().collect();
        selectors.sort();
        let mut thresholds = Vec::new();
        for selector in selectors {
            for spec in &self.criteria[selector] {
                let (expression, abort_on_fail) = match spec {
                    ThresholdSpec::Expression(e) => (e.as_str(), false),
                    ThresholdSpec::Detailed { threshold, abort_on_fail } => {
                        (threshold.as_str(), *abort_on_fail)
                    }
                };
                thresholds.push(Threshold::parse(selector, expression, abort_on_fail)?);
            }
        }

        let max_duration = self
            .max_duration
            .as_deref()
            .map(|s| parse_duration_str(s).ok_or_else(|| anyhow!("invalid max_duration '{}'", s)))
            .transpose()?;
        let tick_interval = self
            .tick_interval
            .as_deref()
            .map(|s| parse_duration_str(s).ok_or_else(|| anyhow!("invalid tick_interval '{}'", s)))
            .transpose()?
            .unwrap_or(DEFAULT_TICK_INTERVAL);
        let graceful_stop = self
            .graceful_stop
            .as_deref()
            .map(|s| parse_duration_str(s).ok_or_else(|| anyhow!("invalid graceful_stop '{}'", s)))
            .transpose()?
            .unwrap_or(DEFAULT_GRACEFUL_STOP);

        Ok(RunPlan { scheduler, thresholds, max_duration, tick_interval, graceful_stop })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::schema_for;

    #[test]
    fn test_config_schema() {
        let schema = schema_for!(RunConfig);
        let schema_json = serde_json::to_string(&schema).unwrap();
        assert!(schema_json.contains("schedule"));
        assert!(schema_json.contains("criteria"));
        assert!(schema_json.contains("max_duration"));
    }

    #[test]
    fn test_config_deserialize_minimal() {
        let yaml = r#"
schedule:
  - duration: "10s"
    target: 5
  - duration: "20s"
    target: 10
  - duration: "10s"
    target: 0
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.schedule.len(), 3);
        assert_eq!(config.schedule[0].target, 5);
        assert_eq!(config.schedule[2].target, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialize_with_criteria() {
        let yaml = r#"
schedule:
  - duration: "30s"
    target: 10
criteria:
  http_req_duration:
    - "p(95) < 500"
    - "avg < 200"
  checks:
    - "rate > 0.95"
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        let criteria = &config.criteria;
        assert!(criteria.contains_key("http_req_duration"));
        assert_eq!(criteria["http_req_duration"].len(), 2);

        let plan = config.validate().unwrap();
        assert_eq!(plan.thresholds.len(), 3);
    }

    #[test]
    fn test_config_k6_aliases() {
        // The observed option block shape: stages/thresholds/abortOnFail
        let json = r#"{
            "stages": [
                { "target": 100, "duration": "1m" },
                { "target": 0, "duration": "30s" }
            ],
            "thresholds": {
                "content_match_error": ["count < 5"],
                "group_duration{group:::Blocks}": ["avg < 200"],
                "http_req_duration": ["p(95)<500"],
                "check_failure_rate": [
                    "rate<0.01",
                    { "threshold": "rate<=0.05", "abortOnFail": true }
                ]
            }
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.schedule.len(), 2);
        assert_eq!(config.schedule[0].target, 100);

        let plan = config.validate().unwrap();
        assert_eq!(plan.thresholds.len(), 5);
        let aborting: Vec<_> = plan.thresholds.iter().filter(|t| t.abort_on_fail).collect();
        assert_eq!(aborting.len(), 1);
        assert_eq!(aborting[0].expression(), "rate<=0.05");
    }

    #[test]
    fn test_empty_schedule_fails_validation() {
        let config = RunConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_stage_duration_fails_validation() {
        let config = RunConfig {
            schedule: vec![Stage { duration: "soon".to_string(), target: 1 }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_threshold_fails_validation() {
        let mut criteria = HashMap::new();
        criteria.insert(
            "http_req_duration".to_string(),
            vec![ThresholdSpec::Expression("bogus?500".to_string())],
        );
        let config = RunConfig {
            schedule: vec![Stage { duration: "1s".to_string(), target: 1 }],
            criteria,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations_and_defaults() {
        let config = RunConfig {
            schedule: vec![Stage { duration: "1s".to_string(), target: 1 }],
            max_duration: Some("2m".to_string()),
            tick_interval: Some("250ms".to_string()),
            ..Default::default()
        };
        let plan = config.validate().unwrap();
        assert_eq!(plan.max_duration, Some(Duration::from_secs(120)));
        assert_eq!(plan.tick_interval, Duration::from_millis(250));
        assert_eq!(plan.graceful_stop, Duration::from_secs(30));
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = RunConfig {
            schedule: vec![Stage { duration: "30s".to_string(), target: 10 }],
            graceful_stop: Some("5s".to_string()),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: RunConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.schedule.len(), 1);
        assert_eq!(parsed.graceful_stop, Some("5s".to_string()));
    }
}
