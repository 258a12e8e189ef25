use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Min,
    Max,
    Mean,
    StdDev,
    Median,
    Mad,
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Statistic::Min => "minimum",
            Statistic::Max => "maximum",
            Statistic::Mean => "mean",
            Statistic::StdDev => "standard deviation",
            Statistic::Median => "median",
            Statistic::Mad => "median absolute deviation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StatsError {
    #[error("cannot compute the {0} of an empty sequence")]
    EmptySequence(Statistic),
}

fn non_empty(samples: &[f64], statistic: Statistic) -> Result<&[f64], StatsError> {
    if samples.is_empty() {
        Err(StatsError::EmptySequence(statistic))
    } else {
        Ok(samples)
    }
}

pub fn min(samples: &[f64]) -> Result<f64, StatsError> {
    let samples = non_empty(samples, Statistic::Min)?;
    Ok(samples.iter().copied().fold(f64::INFINITY, f64::min))
}

pub fn max(samples: &[f64]) -> Result<f64, StatsError> {
    let samples = non_empty(samples, Statistic::Max)?;
    Ok(samples.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

pub fn mean(samples: &[f64]) -> Result<f64, StatsError> {
    let samples = non_empty(samples, Statistic::Mean)?;
    Ok(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Population standard deviation (divides by `n`), so a single sample has 0.
pub fn std_dev(samples: &[f64]) -> Result<f64, StatsError> {
    let samples = non_empty(samples, Statistic::StdDev)?;
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance = samples
        .iter()
        .map(|x| (x - mean) * (x - mean))
        .sum::<f64>()
        / samples.len() as f64;
    Ok(variance.sqrt())
}

fn median_of(samples: &[f64]) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn median(samples: &[f64]) -> Result<f64, StatsError> {
    let samples = non_empty(samples, Statistic::Median)?;
    Ok(median_of(samples))
}

/// Median of the absolute deviations from the median. Unscaled.
pub fn median_absolute_deviation(samples: &[f64]) -> Result<f64, StatsError> {
    let samples = non_empty(samples, Statistic::Mad)?;
    let center = median_of(samples);
    let deviations: Vec<f64> = samples.iter().map(|x| (x - center).abs()).collect();
    Ok(median_of(&deviations))
}

/// The six summary statistics of one sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub mad: f64,
}

impl Summary {
    pub fn of(samples: &[f64]) -> Result<Self, StatsError> {
        Ok(Summary {
            min: min(samples)?,
            max: max(samples)?,
            mean: mean(samples)?,
            std_dev: std_dev(samples)?,
            median: median(samples)?,
            mad: median_absolute_deviation(samples)?,
        })
    }
}
