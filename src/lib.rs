//! Staged-ramp HTTP load-testing engine: scenarios are async Rust closures
//! executed by a ramping virtual-user population, with thread-safe metric
//! aggregation, threshold evaluation and early abort.

pub mod config;
pub mod engine;
pub mod scenario;
pub mod stats;
pub mod utils;

pub use config::{RunConfig, Stage, ThresholdSpec};
pub use engine::control::ControlCommand;
pub use engine::executor::{scenario_fn, ScenarioFn};
pub use engine::Engine;
pub use scenario::{Http, RequestSpec, Response, ScenarioContext};
pub use stats::{MetricKind, MetricRegistry, RunReport, RunStatus, Tags};
pub use utils::parse_duration_str;
