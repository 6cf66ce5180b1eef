//! Human-paced send delays

use rand::Rng;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Delay window in milliseconds for a message of `chars` characters
pub fn delay_window(chars: usize) -> RangeInclusive<u64> {
    match chars {
        0..=99 => 2_000..=4_000,
        100..=299 => 5_000..=8_000,
        _ => 10_000..=15_000,
    }
}

/// Sleeps a randomized, length-dependent interval before each send
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    enabled: bool,
}

impl Pacer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn delay_for(&self, text: &str) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let window = delay_window(text.chars().count());
        Duration::from_millis(rand::thread_rng().gen_range(window))
    }

    /// Sleep before sending `text`; only blocks the calling task
    pub async fn wait(&self, text: &str) {
        let delay = self.delay_for(text);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
