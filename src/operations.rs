//! Reductions over temperature readings.
//!
//! [Stats] holds the count, sum, minimum and maximum of a set of temperatures in hundredths of a
//! degree. Together with [Stats::merge] it forms a commutative monoid: merging is associative and
//! commutative and [Stats::default] is the identity, so partial results computed for chunks of a
//! file can be combined in any order. The mean is derived on read and never stored.

use serde::{Deserialize, Serialize};

/// Summary statistics of a set of temperatures
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Stats {
    /// Number of readings
    pub count: u64,
    /// Sum of temperatures in hundredths of a degree
    pub sum: i64,
    /// Minimum temperature in hundredths of a degree, `i64::MAX` when empty
    pub min: i64,
    /// Maximum temperature in hundredths of a degree, `i64::MIN` when empty
    pub max: i64,
}

impl Default for Stats {
    /// The identity of [Stats::merge].
    fn default() -> Self {
        Stats {
            count: 0,
            sum: 0,
            min: i64::MAX,
            max: i64::MIN,
        }
    }
}

impl Stats {
    /// Statistics of a single reading.
    pub fn of(temperature: i64) -> Self {
        Stats {
            count: 1,
            sum: temperature,
            min: temperature,
            max: temperature,
        }
    }

    /// Combine two sets of statistics.
    pub fn merge(self, other: Stats) -> Self {
        Stats {
            count: self.count + other.count,
            sum: self.sum.saturating_add(other.sum),
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Fold a single reading into the statistics.
    pub fn push(&mut self, temperature: i64) {
        *self = self.merge(Stats::of(temperature));
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Minimum in degrees, if any readings were seen.
    pub fn min_celsius(&self) -> Option<f64> {
        (!self.is_empty()).then(|| centi_to_celsius(self.min))
    }

    /// Maximum in degrees, if any readings were seen.
    pub fn max_celsius(&self) -> Option<f64> {
        (!self.is_empty()).then(|| centi_to_celsius(self.max))
    }

    /// Mean in degrees rounded to two decimals, if any readings were seen.
    pub fn mean_celsius(&self) -> Option<f64> {
        (!self.is_empty()).then(|| {
            let mean = self.sum as f64 / self.count as f64 / 100.0;
            (mean * 100.0).round() / 100.0
        })
    }
}

impl FromIterator<i64> for Stats {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        iter.into_iter().fold(Stats::default(), |mut stats, t| {
            stats.push(t);
            stats
        })
    }
}

/// Convert hundredths of a degree to degrees.
pub fn centi_to_celsius(centi: i64) -> f64 {
    centi as f64 / 100.0
}

/// Convert degrees to hundredths of a degree, rounding half away from zero.
pub fn celsius_to_centi(celsius: f64) -> i64 {
    (celsius * 100.0).round() as i64
}
