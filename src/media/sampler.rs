//! RTP timestamp increments from wall-clock time

use tokio::time::Instant;

/// Converts elapsed time between calls into RTP clock ticks
#[derive(Debug)]
pub struct Sampler {
    clock_rate: u32,
    last: Option<Instant>,
}

impl Sampler {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            last: None,
        }
    }

    /// Ticks elapsed since the previous call; 0 on the first call
    pub fn sample(&mut self) -> u32 {
        let now = Instant::now();
        let samples = match self.last {
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs_f64();
                (self.clock_rate as f64 * elapsed).round() as u32
            }
            None => 0,
        };
        self.last = Some(now);
        samples
    }
}
