//! Resource statistics.
//!
//! Items are sampled with [`StatManager::add_resource_item`] and rolled into
//! a `{last, min, max, sum, count}` window. Every `report_cycle` updates the
//! window is closed, kept for [`StatManager::stat`] and exported to the
//! `resource_usage` gauges.
use std::collections::BTreeMap;

use tracing::debug;

use crate::metrics;

/// One report window of a resource item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatWindow {
    /// last sample
    pub last: i64,
    /// smallest sample
    pub min: i64,
    /// largest sample
    pub max: i64,
    /// sum of samples
    pub sum: i64,
    /// # of samples
    pub count: u64,
}

impl StatWindow {
    fn new(value: i64) -> Self {
        Self {
            last: value,
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    fn record(&mut self, value: i64) {
        self.last = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum = self.sum.saturating_add(value);
        self.count += 1;
    }

    /// mean of the samples
    pub fn avg(&self) -> i64 {
        // count is never 0
        self.sum / self.count as i64
    }
}

/// Pull-based statistics aggregation
#[derive(Debug)]
pub struct StatManager {
    report_cycle: u32,
    updates: u32,
    current: BTreeMap<String, StatWindow>,
    reported: BTreeMap<String, StatWindow>,
}

impl StatManager {
    /// Close a window every `report_cycle` updates (at least 1).
    pub fn new(report_cycle: u32) -> Self {
        Self {
            report_cycle: report_cycle.max(1),
            updates: 0,
            current: BTreeMap::new(),
            reported: BTreeMap::new(),
        }
    }

    /// Record a sample of `name`.
    pub fn add_resource_item(&mut self, name: &str, value: i64) {
        match self.current.get_mut(name) {
            Some(window) => window.record(value),
            None => {
                self.current.insert(name.to_owned(), StatWindow::new(value));
            }
        }
    }

    /// Count one update; closes and exports the window at the end of a
    /// cycle. Returns true if a window was closed.
    pub fn update(&mut self) -> bool {
        self.updates += 1;
        if self.updates < self.report_cycle {
            return false;
        }
        self.updates = 0;
        let closed = std::mem::take(&mut self.current);
        for (name, window) in &closed {
            metrics::RESOURCE_USAGE
                .with_label_values(&[name.as_str()])
                .set(window.last);
            metrics::RESOURCE_USAGE_MAX
                .with_label_values(&[name.as_str()])
                .set(window.max);
        }
        debug!(items = closed.len(), "stat window closed");
        self.reported.extend(closed);
        true
    }

    /// Last closed window of `name`.
    pub fn stat(&self, name: &str) -> Option<StatWindow> {
        self.reported.get(name).copied()
    }

    /// Window of `name` still being filled.
    pub fn current(&self, name: &str) -> Option<StatWindow> {
        self.current.get(name).copied()
    }

    /// names with a closed window
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.reported.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_rolls_on_cycle() {
        let mut stats = StatManager::new(2);
        stats.add_resource_item("stats_test.loop", 5);
        stats.add_resource_item("stats_test.loop", 1);
        stats.add_resource_item("stats_test.loop", 9);
        assert!(!stats.update());
        assert_eq!(stats.stat("stats_test.loop"), None);
        assert_eq!(stats.current("stats_test.loop").map(|w| w.count), Some(3));

        assert!(stats.update());
        assert_eq!(
            stats.stat("stats_test.loop"),
            Some(StatWindow {
                last: 9,
                min: 1,
                max: 9,
                sum: 15,
                count: 3,
            })
        );
        assert_eq!(stats.stat("stats_test.loop").map(|w| w.avg()), Some(5));
        assert_eq!(stats.current("stats_test.loop"), None);
        assert_eq!(
            metrics::RESOURCE_USAGE
                .with_label_values(&["stats_test.loop"])
                .get(),
            9
        );
    }

    #[test]
    fn test_item_missing_from_window_keeps_last_report() {
        let mut stats = StatManager::new(1);
        stats.add_resource_item("stats_test.a", 1);
        stats.update();
        stats.add_resource_item("stats_test.b", 2);
        stats.update();
        assert_eq!(stats.stat("stats_test.a").map(|w| w.last), Some(1));
        assert_eq!(stats.names().collect::<Vec<_>>(), vec!["stats_test.a", "stats_test.b"]);
    }
}
