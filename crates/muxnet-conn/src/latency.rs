//! One-way latency estimate of a connection.

/// Blend weight applied when a sample jumps away from the estimate.
pub const FAST_BLEND: f64 = 0.5;

/// Blend weight applied to ordinary samples.
pub const SLOW_BLEND: f64 = 0.05;

/// Converts a round trip into a one-way latency.
pub const ONE_WAY_FACTOR: f64 = 0.5;

/// Two-speed exponential moving average over round-trip samples.
///
/// Latency is in seconds, variance in seconds squared. A sample that differs
/// from the running estimate by more than half of it is blended with
/// [`FAST_BLEND`]; anything closer uses [`SLOW_BLEND`]. The variance follows the
/// same rule on its own scale.
#[derive(Debug, Clone, Default)]
pub struct LatencyTracker {
    latency: f64,
    variance: f64,
    samples: u64,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a round-trip sample and its variance, both in milliseconds.
    pub fn update(&mut self, round_trip_ms: f64, variance_ms: f64) {
        let scale = ONE_WAY_FACTOR / 1000.0;
        let latency = round_trip_ms * scale;
        let variance = variance_ms * scale * scale;

        if self.samples == 0 {
            self.latency = latency;
            self.variance = variance;
        } else {
            self.latency = blend(self.latency, latency);
            self.variance = blend(self.variance, variance);
        }
        self.samples += 1;
    }

    /// Seconds; 0 before the first sample.
    pub fn latency(&self) -> f64 {
        self.latency
    }

    /// Seconds squared; infinite before the first sample.
    pub fn latency_variance(&self) -> f64 {
        if self.samples == 0 {
            f64::INFINITY
        } else {
            self.variance
        }
    }

    /// Round-trip samples folded in so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

fn blend(estimate: f64, sample: f64) -> f64 {
    let weight = if (sample - estimate).abs() > estimate / 2.0 {
        FAST_BLEND
    } else {
        SLOW_BLEND
    };
    estimate + (sample - estimate) * weight
}
