use std::time::Duration;

/// Exponentially weighted rolling average of round trip samples: each new sample replaces
///  `1/smoothing` of the previous average. With `smoothing = 6` and pings every 250ms, the
///  average reflects roughly the last 30 seconds.
#[derive(Debug)]
pub struct RttEstimator {
    average_millis: f64,
    smoothing: f64,
    num_samples: u64,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration, smoothing: u32) -> RttEstimator {
        RttEstimator {
            average_millis: initial_rtt.as_secs_f64() * 1000.0,
            smoothing: smoothing.max(1) as f64,
            num_samples: 0,
        }
    }

    pub fn add_sample(&mut self, rtt: Duration) {
        let sample_millis = rtt.as_secs_f64() * 1000.0;
        self.average_millis -= self.average_millis / self.smoothing;
        self.average_millis += sample_millis / self.smoothing;
        self.num_samples += 1;
    }

    pub fn average(&self) -> Duration {
        Duration::from_secs_f64(self.average_millis.max(0.0) / 1000.0)
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// The interval until a peer's next tick: the current average, but never below `floor` to
    ///  avoid a tight loop on very fast links
    pub fn tick_interval(&self, floor: Duration) -> Duration {
        self.average().max(floor)
    }
}
