use anyhow::{bail, Result};

use super::{MetricRegistry, MetricSnapshot, Tags};

/// Aggregate a threshold expression compares against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    /// Counter sum, Trend sample count, or Rate observation count.
    Count,
    Avg,
    Min,
    Max,
    /// Rate success ratio.
    Rate,
    /// Gauge last value.
    Value,
    Percentile(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "==",
        }
    }
}

/// Metric reference of a threshold: `name` or `name{tag:value,...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub name: String,
    pub tags: Tags,
}

/// One parsed threshold rule bound to a metric selector.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub selector: Selector,
    pub aggregate: Aggregate,
    pub op: Op,
    pub bound: f64,
    pub abort_on_fail: bool,
    expression: String,
}

/// Outcome of evaluating one threshold against a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub observed: Option<f64>,
}

/// Parse `name` or `name{tag:value,...}`. A tag value may itself contain
/// colons (group paths look like `::Blocks`), so only the first colon of each
/// pair separates key from value.
pub fn parse_selector(s: &str) -> Result<Selector> {
    let s = s.trim();
    let Some(brace) = s.find('{') else {
        if s.is_empty() {
            bail!("empty metric selector");
        }
        return Ok(Selector { name: s.to_string(), tags: Tags::new() });
    };
    if !s.ends_with('}') {
        bail!("invalid metric selector '{}': missing closing brace", s);
    }
    let name = s[..brace].trim();
    if name.is_empty() {
        bail!("invalid metric selector '{}': empty metric name", s);
    }
    let mut tags = Tags::new();
    let inner = &s[brace + 1..s.len() - 1];
    for pair in inner.split(',') {
        let Some((key, value)) = pair.split_once(':') else {
            bail!("invalid tag filter '{}' in selector '{}'", pair, s);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid tag filter '{}' in selector '{}'", pair, s);
        }
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(Selector { name: name.to_string(), tags })
}

/// Parse an expression like `rate<0.01`, `avg < 200`, `p(95)<500`, `count<5`.
/// Whitespace is insignificant.
pub fn parse_expression(s: &str) -> Result<(Aggregate, Op, f64)> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        bail!("empty threshold expression");
    }

    let mut found: Option<(usize, Op)> = None;
    for (text, op) in [
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("==", Op::Eq),
        ("<", Op::Lt),
        (">", Op::Gt),
    ] {
        if let Some(pos) = compact.find(text) {
            if found.is_none_or(|(best, _)| pos < best) {
                found = Some((pos, op));
            }
        }
    }
    let Some((pos, op)) = found else {
        bail!("threshold expression '{}' has no comparison operator", s);
    };

    let aggregate = parse_aggregate(&compact[..pos])
        .ok_or_else(|| anyhow::anyhow!("unknown aggregate in threshold expression '{}'", s))?;

    let rhs = &compact[pos + op.as_str().len()..];
    let bound: f64 = rhs
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid bound '{}' in threshold expression '{}'", rhs, s))?;

    Ok((aggregate, op, bound))
}

fn parse_aggregate(s: &str) -> Option<Aggregate> {
    match s {
        "count" => return Some(Aggregate::Count),
        "avg" => return Some(Aggregate::Avg),
        "min" => return Some(Aggregate::Min),
        "max" => return Some(Aggregate::Max),
        "rate" => return Some(Aggregate::Rate),
        "value" => return Some(Aggregate::Value),
        _ => {}
    }
    // p(95) or the shorthand p95
    let body = s.strip_prefix('p')?;
    let digits = body.strip_prefix('(').and_then(|b| b.strip_suffix(')')).unwrap_or(body);
    let p: f64 = digits.parse().ok()?;
    if !(0.0..=100.0).contains(&p) {
        return None;
    }
    Some(Aggregate::Percentile(p))
}

impl Threshold {
    pub fn parse(selector: &str, expression: &str, abort_on_fail: bool) -> Result<Self> {
        let selector = parse_selector(selector)?;
        let (aggregate, op, bound) = parse_expression(expression)?;
        Ok(Self {
            selector,
            aggregate,
            op,
            bound,
            abort_on_fail,
            expression: expression.trim().to_string(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn metric_display(&self) -> String {
        super::SeriesKey {
            name: self.selector.name.clone(),
            tags: self.selector.tags.clone(),
        }
        .display_name()
    }

    /// Evaluate against the current snapshot. Never mutates metrics.
    ///
    /// A selector with no recorded data passes vacuously; an aggregate that
    /// cannot be computed for the metric's kind fails so that the mismatch
    /// surfaces in the verdict instead of silently passing.
    pub fn evaluate(&self, registry: &MetricRegistry) -> Verdict {
        let Some(snap) = registry.snapshot(&self.selector.name, &self.selector.tags) else {
            return Verdict { passed: true, observed: None };
        };
        if snap.is_empty() {
            return Verdict { passed: true, observed: None };
        }
        match self.observe(&snap) {
            Some(observed) => Verdict { passed: self.compare(observed), observed: Some(observed) },
            None => {
                eprintln!(
                    "threshold '{}' on '{}': aggregate not defined for {} metric",
                    self.expression,
                    self.selector.name,
                    snap.kind().as_str()
                );
                Verdict { passed: false, observed: None }
            }
        }
    }

    fn observe(&self, snap: &MetricSnapshot) -> Option<f64> {
        match self.aggregate {
            Aggregate::Count => match snap {
                MetricSnapshot::Counter { sum } => Some(*sum),
                MetricSnapshot::Trend { .. } | MetricSnapshot::Rate { .. } => {
                    Some(snap.count() as f64)
                }
                MetricSnapshot::Gauge { .. } => None,
            },
            Aggregate::Avg => snap.avg(),
            Aggregate::Min => snap.min(),
            Aggregate::Max => snap.max(),
            Aggregate::Rate => match snap {
                MetricSnapshot::Rate { .. } => Some(snap.ratio()),
                _ => None,
            },
            Aggregate::Value => match snap {
                MetricSnapshot::Gauge { last } => *last,
                _ => None,
            },
            Aggregate::Percentile(p) => snap.percentile(p),
        }
    }

    fn compare(&self, observed: f64) -> bool {
        match self.op {
            Op::Lt => observed < self.bound,
            Op::Le => observed <= self.bound,
            Op::Gt => observed > self.bound,
            Op::Ge => observed >= self.bound,
            Op::Eq => (observed - self.bound).abs() < f64::EPSILON,
        }
    }
}
