use std::time::Duration;

use serde::{ser::SerializeStruct, Serialize, Serializer};

/// Running statistics over the round trip times a server monitor has measured, maintained with
/// Welford's online algorithm. All values are in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QueryStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl QueryStats {
    /// Creates an empty set of statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a round trip time sample.
    pub fn add_sample(&mut self, sample: Duration) {
        self.add(sample.as_secs_f64() * 1000.0);
    }

    pub(crate) fn add(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// The number of samples taken.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The mean of the samples, or 0 if there are none.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// The sample variance, or 0 with fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }

    /// The sample standard deviation.
    pub fn standard_deviation(&self) -> f64 {
        self.variance().sqrt()
    }

    /// The score the statistics selection strategy ranks servers by: the mean plus one standard
    /// deviation. Lower is better.
    pub fn s_score(&self) -> f64 {
        self.mean() + self.standard_deviation()
    }
}

impl Serialize for QueryStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("QueryStats", 5)?;
        state.serialize_field("count", &self.count)?;
        state.serialize_field("mean", &self.mean())?;
        state.serialize_field("variance", &self.variance())?;
        state.serialize_field("standardDeviation", &self.standard_deviation())?;
        state.serialize_field("sScore", &self.s_score())?;
        state.end()
    }
}
