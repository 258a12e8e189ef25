use super::intervals::{Intervals, Phase};
use super::stats::{StatsError, Summary};

/// Per-phase samples collected across a run, in probe order.
#[derive(Debug, Default, Clone)]
pub struct SampleAggregator {
    samples: [Vec<f64>; 7],
}

impl SampleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one value to every phase's sequence.
    pub fn add_sample(&mut self, intervals: Intervals) {
        for phase in Phase::ALL {
            self.samples[phase.index()].push(intervals.get(phase));
        }
    }

    pub fn samples(&self, phase: Phase) -> &[f64] {
        &self.samples[phase.index()]
    }

    /// Number of probes aggregated so far.
    pub fn len(&self) -> usize {
        self.samples[Phase::Total.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self, phase: Phase) -> Result<Summary, StatsError> {
        Summary::of(self.samples(phase))
    }

    pub fn summaries(&self) -> impl Iterator<Item = (Phase, Result<Summary, StatsError>)> + '_ {
        Phase::ALL
            .into_iter()
            .map(move |phase| (phase, self.summary(phase)))
    }
}
