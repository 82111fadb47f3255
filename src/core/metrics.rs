use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::core::util::lock_unpoisoned;

/// Counter emitted once per call outcome, tagged with
/// `{server, api, status[, error]}`.
pub const HTTP_CALL_COUNTER: &str = "gox_http_call";

/// Destination for tagged counters. Implementations adapt this onto whatever
/// metrics pipeline the host process runs; increments must be cheap and must
/// never block the calling task.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: &str, tags: &[(&str, &str)]);
}

/// A [`MetricsSink`] that keeps counts in memory, keyed by the counter name
/// plus its rendered tag set. Useful in tests and small tools.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, counter: &str, tags: &[(&str, &str)]) -> u64 {
        let key = render_key(counter, tags);
        lock_unpoisoned(&self.counts).get(&key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        lock_unpoisoned(&self.counts).clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, counter: &str, tags: &[(&str, &str)]) {
        let key = render_key(counter, tags);
        *lock_unpoisoned(&self.counts).entry(key).or_insert(0) += 1;
    }
}

fn render_key(counter: &str, tags: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = tags.to_vec();
    sorted.sort();
    let mut key = counter.to_owned();
    for (tag_name, tag_value) in sorted {
        key.push_str(&format!("|{tag_name}={tag_value}"));
    }
    key
}
