use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::OnceLock,
};

use crate::MeteringError;

/// A reported usage value: `N` adds to the counters, `#N` overwrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageValue {
    /// Add the value.
    Increment(i64),
    /// Overwrite with the value.
    Set(i64),
}

impl UsageValue {
    /// Parse the wire form of a usage value reported for `metric`.
    ///
    /// Accepts optional surrounding whitespace, an optional leading `#` and a non-empty run of
    /// decimal digits. Everything else is a configuration error.
    pub fn parse(metric: &str, raw: &str) -> Result<Self, MeteringError> {
        let invalid = || MeteringError::InvalidUsageValue {
            metric: metric.to_string(),
            value: raw.to_string(),
        };

        let trimmed = raw.trim();
        let (is_set, digits) = match trimmed.strip_prefix('#') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let value: i64 = digits.parse().map_err(|_| invalid())?;

        Ok(if is_set {
            UsageValue::Set(value)
        } else {
            UsageValue::Increment(value)
        })
    }
}

impl fmt::Display for UsageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageValue::Increment(value) => write!(f, "{value}"),
            UsageValue::Set(value) => write!(f, "#{value}"),
        }
    }
}

/// Usage reported by one transaction, in request order.
///
/// Order matters: when several entries touch the same counter through the hierarchy, later
/// entries are applied on top of earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Usage {
    entries: Vec<(String, UsageValue)>,
}

impl Usage {
    /// Empty usage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Usage::push`].
    pub fn with(mut self, metric: impl Into<String>, value: UsageValue) -> Self {
        self.push(metric, value);
        self
    }

    /// Append an entry.
    pub fn push(&mut self, metric: impl Into<String>, value: UsageValue) {
        self.entries.push((metric.into(), value));
    }

    /// Build usage from `(metric, raw value)` pairs, e.g. `[("hits", "3"), ("storage", "#10")]`.
    pub fn parse<I, K, V>(entries: I) -> Result<Self, MeteringError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut usage = Usage::new();

        for (metric, raw) in entries {
            let metric = metric.into();
            let value = UsageValue::parse(&metric, raw.as_ref())?;
            usage.entries.push((metric, value));
        }

        Ok(usage)
    }

    /// Entries in request order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, UsageValue)> {
        self.entries
            .iter()
            .map(|(metric, value)| (metric.as_str(), *value))
    }

    /// Whether no metric was reported.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Forest of metrics for one service.
///
/// Stored as parent pointers; the children index is derived lazily on first use. All walks
/// use explicit loops and are bounded by the number of metrics, so a malformed (cyclic)
/// configuration cannot cause unbounded traversal.
#[derive(Debug, Clone, Default)]
pub struct MetricHierarchy {
    metrics: Vec<String>,
    known: HashSet<String>,
    parents: HashMap<String, String>,
    children: OnceLock<HashMap<String, Vec<String>>>,
}

impl MetricHierarchy {
    /// Empty hierarchy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: add a root metric.
    pub fn with_metric(mut self, name: impl Into<String>) -> Self {
        self.add_metric(name, None::<String>);
        self
    }

    /// Builder-style: add `name` as a child of `parent`.
    pub fn with_child(mut self, name: impl Into<String>, parent: impl Into<String>) -> Self {
        self.add_metric(name, Some(parent));
        self
    }

    /// Add a metric, optionally under a parent. Re-adding a metric replaces its parent.
    pub fn add_metric(&mut self, name: impl Into<String>, parent: Option<impl Into<String>>) {
        let name = name.into();

        if self.known.insert(name.clone()) {
            self.metrics.push(name.clone());
        }

        match parent {
            Some(parent) => {
                self.parents.insert(name, parent.into());
            }
            None => {
                self.parents.remove(&name);
            }
        }

        self.children = OnceLock::new();
    }

    /// Whether `name` is a known metric.
    pub fn contains(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    /// Metrics in declaration order.
    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(String::as_str)
    }

    /// Direct parent of `name`.
    pub fn parent(&self, name: &str) -> Option<&str> {
        self.parents.get(name).map(String::as_str)
    }

    /// Strict ancestors of `name`, nearest first.
    pub fn ancestors(&self, name: &str) -> Vec<&str> {
        let mut ancestors = Vec::new();
        let mut current = name;

        while ancestors.len() < self.metrics.len()
            && let Some(parent) = self.parents.get(current)
        {
            if parent == name || ancestors.contains(&parent.as_str()) {
                break;
            }

            ancestors.push(parent.as_str());
            current = parent.as_str();
        }

        ancestors
    }

    /// Direct children of `name`.
    pub fn children(&self, name: &str) -> &[String] {
        self.children_index()
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All strict descendants of `name`, breadth first.
    pub fn descendants(&self, name: &str) -> Vec<&str> {
        let mut seen: HashSet<&str> = HashSet::from([name]);
        let mut queue: Vec<&str> = vec![name];
        let mut out = Vec::new();
        let mut cursor = 0;

        while cursor < queue.len() {
            let current = queue[cursor];
            cursor += 1;

            for child in self.children(current) {
                if seen.insert(child.as_str()) {
                    out.push(child.as_str());
                    queue.push(child.as_str());
                }
            }
        }

        out
    }

    fn children_index(&self) -> &HashMap<String, Vec<String>> {
        self.children.get_or_init(|| {
            let mut index: HashMap<String, Vec<String>> = HashMap::new();

            for metric in &self.metrics {
                if let Some(parent) = self.parents.get(metric) {
                    index.entry(parent.clone()).or_default().push(metric.clone());
                }
            }

            index
        })
    }
}

/// Net effect of a request on one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CounterOp {
    Add(i64),
    Set(i64),
}

impl CounterOp {
    /// Apply `next` after `self`. A set discards whatever came before it.
    fn then(self, next: CounterOp) -> CounterOp {
        match (self, next) {
            (_, CounterOp::Set(value)) => CounterOp::Set(value),
            (CounterOp::Add(a), CounterOp::Add(b)) => CounterOp::Add(a.saturating_add(b)),
            (CounterOp::Set(value), CounterOp::Add(delta)) => {
                CounterOp::Set(value.saturating_add(delta))
            }
        }
    }

    /// Counter value after applying this op to `current`.
    pub(crate) fn projected(self, current: i64) -> i64 {
        match self {
            CounterOp::Add(delta) => current.saturating_add(delta),
            CounterOp::Set(value) => value,
        }
    }
}

impl From<UsageValue> for CounterOp {
    fn from(value: UsageValue) -> Self {
        match value {
            UsageValue::Increment(delta) => CounterOp::Add(delta),
            UsageValue::Set(value) => CounterOp::Set(value),
        }
    }
}

/// Collapse `usage` into one op per affected metric, in first-touched order.
///
/// With `flat` unset every entry also applies to all strict ancestors of its metric. Unknown
/// metrics are rejected before anything is computed.
pub(crate) fn expand(
    service_id: &str,
    usage: &Usage,
    hierarchy: &MetricHierarchy,
    flat: bool,
) -> Result<Vec<(String, CounterOp)>, MeteringError> {
    let mut ops: Vec<(String, CounterOp)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (metric, value) in usage.iter() {
        if !hierarchy.contains(metric) {
            return Err(MeteringError::InvalidMetric {
                service_id: service_id.to_string(),
                metric: metric.to_string(),
            });
        }

        let op = CounterOp::from(value);
        let ancestors = if flat {
            Vec::new()
        } else {
            hierarchy.ancestors(metric)
        };

        for target in std::iter::once(metric).chain(ancestors) {
            match index.get(target) {
                Some(&position) => {
                    let merged = ops[position].1.then(op);
                    ops[position].1 = merged;
                }
                None => {
                    index.insert(target.to_string(), ops.len());
                    ops.push((target.to_string(), op));
                }
            }
        }
    }

    Ok(ops)
}
