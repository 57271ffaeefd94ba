use crate::cache::{MergeCollection, Window};

use super::bucket::Downsampling;
use super::metric::EndpointMetric;

pub type MetricWindow = Window<MergeCollection<EndpointMetric>>;

/// Merge windows for the hour, day and month granularities.
///
/// Metrics drained from one granularity are forwarded into the next coarser
/// window, so a minute row reaches the month window after one pass over the
/// chain.
pub struct RollupChain {
    levels: Vec<(Downsampling, MetricWindow)>,
}

impl RollupChain {
    pub fn new() -> Self {
        let levels = Downsampling::ALL
            .into_iter()
            .filter(|d| *d != Downsampling::Minute)
            .map(|d| (d, Window::new(MergeCollection::new)))
            .collect();
        Self { levels }
    }

    /// Windows from finest to coarsest.
    pub fn levels(&self) -> impl Iterator<Item = (Downsampling, &MetricWindow)> {
        self.levels.iter().map(|(d, w)| (*d, w))
    }

    pub fn window(&self, downsampling: Downsampling) -> Option<&MetricWindow> {
        self.levels
            .iter()
            .find(|(d, _)| *d == downsampling)
            .map(|(_, w)| w)
    }

    /// Re-buckets `metrics` (of granularity `from`) into the next coarser
    /// window. Returns how many rows were forwarded.
    pub fn forward(&self, from: Downsampling, metrics: &[EndpointMetric]) -> usize {
        let Some(to) = from.coarser() else {
            return 0;
        };
        let Some(window) = self.window(to) else {
            return 0;
        };

        let mut guard = window.start_writing();
        let mut forwarded = 0;
        for metric in metrics {
            if let Some(coarse) = metric.rebucket(to) {
                guard.put(coarse);
                forwarded += 1;
            }
        }
        forwarded
    }
}

impl Default for RollupChain {
    fn default() -> Self {
        Self::new()
    }
}
