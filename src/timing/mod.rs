//! Latency instrumentation: checkpoints recorded per probe, the intervals
//! derived from them, and the statistics aggregated over a run.

pub mod aggregate;
pub mod intervals;
pub mod probe;
pub mod stats;

pub use aggregate::SampleAggregator;
pub use intervals::{IntervalError, Intervals, Phase};
pub use probe::{Checkpoint, Checkpoints, Instants, Probe, ProbeFlags, ProbeRecorder, ProbeSlot};
pub use stats::{StatsError, Summary};
