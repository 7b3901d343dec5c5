//! Density accretion policies.
//!
//! An [`AggregationMethod`] controls how repeated observations at the same
//! bucket key fold into the bucket's single density value. The method is
//! fixed for the duration of one run.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a bucket's density updates as rows accumulate on its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    /// Count colliding rows.
    #[default]
    Increment,
    /// Sum the observed values.
    Cumulative,
    /// Running mean of the observed values.
    Average,
    /// Keep the first observation (`Min` shares this branch).
    Min,
    /// Largest observed value.
    Max,
    /// Keep the first observation.
    First,
    /// Always the latest observation.
    Last,
    /// Nearest-rank percentile over every observed value.
    Percentile,
}

impl FromStr for AggregationMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "increment" => AggregationMethod::Increment,
            "cumulative" => AggregationMethod::Cumulative,
            "average" => AggregationMethod::Average,
            "min" => AggregationMethod::Min,
            "max" => AggregationMethod::Max,
            "first" => AggregationMethod::First,
            "last" => AggregationMethod::Last,
            "percentile" => AggregationMethod::Percentile,
            other => bail!("unknown aggregation method '{}'", other),
        })
    }
}

/// Accumulates one bucket's density under a fixed method.
///
/// `Average` tracks a sum and count; `Percentile` retains every sample in
/// arrival order and resolves at [`DensityAccumulator::density`] time,
/// which keeps results deterministic for a fixed input order. All other
/// methods fold into a single running value.
#[derive(Debug)]
pub struct DensityAccumulator {
    method: AggregationMethod,
    value: f32,
    count: u32,
    samples: Vec<f32>,
}

impl DensityAccumulator {
    /// Seeds the accumulator with the first observation.
    pub fn first(method: AggregationMethod, observed: f32) -> Self {
        let mut acc = DensityAccumulator {
            method,
            value: 0.0,
            count: 1,
            samples: Vec::new(),
        };
        match method {
            AggregationMethod::Increment => acc.value = 1.0,
            AggregationMethod::Percentile => {
                acc.value = observed;
                acc.samples.push(observed);
            }
            _ => acc.value = observed,
        }
        acc
    }

    /// Folds a subsequent observation into the accumulator.
    pub fn accrete(&mut self, observed: f32) {
        self.count += 1;
        match self.method {
            AggregationMethod::Increment => self.value += 1.0,
            AggregationMethod::Cumulative | AggregationMethod::Average => self.value += observed,
            AggregationMethod::Min | AggregationMethod::First => {}
            AggregationMethod::Max => self.value = self.value.max(observed),
            AggregationMethod::Last => self.value = observed,
            AggregationMethod::Percentile => self.samples.push(observed),
        }
    }

    /// Resolves the final density. `percentile` (0–100) only matters for
    /// the `Percentile` method.
    pub fn density(&self, percentile: f32) -> f32 {
        match self.method {
            AggregationMethod::Average => self.value / self.count as f32,
            AggregationMethod::Percentile => nearest_rank(&self.samples, percentile),
            _ => self.value,
        }
    }
}

/// Nearest-rank percentile: sort the samples with a total order, take the
/// value at rank `ceil(p/100 * n)` (1-based, clamped into range).
fn nearest_rank(samples: &[f32], percentile: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f32::total_cmp);

    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f32).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(method: AggregationMethod, values: &[f32], percentile: f32) -> f32 {
        let mut acc = DensityAccumulator::first(method, values[0]);
        for v in &values[1..] {
            acc.accrete(*v);
        }
        acc.density(percentile)
    }

    #[test]
    fn test_increment_counts_rows() {
        assert_eq!(fold(AggregationMethod::Increment, &[5.0, 5.0, 5.0], 0.0), 3.0);
        assert_eq!(fold(AggregationMethod::Increment, &[9.0], 0.0), 1.0);
    }

    #[test]
    fn test_cumulative_sums() {
        assert_eq!(fold(AggregationMethod::Cumulative, &[1.5, 2.5, 4.0], 0.0), 8.0);
    }

    #[test]
    fn test_average_is_running_mean() {
        assert_eq!(fold(AggregationMethod::Average, &[2.0, 4.0, 6.0], 0.0), 4.0);
        assert_eq!(fold(AggregationMethod::Average, &[7.0], 0.0), 7.0);
    }

    #[test]
    fn test_min_and_first_keep_first_observation() {
        assert_eq!(fold(AggregationMethod::Min, &[3.0, 1.0, 9.0], 0.0), 3.0);
        assert_eq!(fold(AggregationMethod::First, &[3.0, 1.0, 9.0], 0.0), 3.0);
    }

    #[test]
    fn test_max_keeps_largest() {
        assert_eq!(fold(AggregationMethod::Max, &[3.0, 9.0, 1.0], 0.0), 9.0);
    }

    #[test]
    fn test_last_overwrites() {
        assert_eq!(fold(AggregationMethod::Last, &[3.0, 9.0, 1.0], 0.0), 1.0);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values = [15.0, 20.0, 35.0, 40.0, 50.0];
        assert_eq!(fold(AggregationMethod::Percentile, &values, 30.0), 20.0);
        assert_eq!(fold(AggregationMethod::Percentile, &values, 50.0), 35.0);
        assert_eq!(fold(AggregationMethod::Percentile, &values, 100.0), 50.0);
        assert_eq!(fold(AggregationMethod::Percentile, &values, 0.0), 15.0);
    }

    #[test]
    fn test_percentile_deterministic_for_fixed_order() {
        let values = [4.0, 1.0, 3.0, 2.0];
        let first = fold(AggregationMethod::Percentile, &values, 50.0);
        let second = fold(AggregationMethod::Percentile, &values, 50.0);
        assert_eq!(first, second);
        assert_eq!(first, 2.0);
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!(
            "percentile".parse::<AggregationMethod>().unwrap(),
            AggregationMethod::Percentile
        );
        assert_eq!(
            "Increment".parse::<AggregationMethod>().unwrap(),
            AggregationMethod::Increment
        );
        assert!("median".parse::<AggregationMethod>().is_err());
    }
}
