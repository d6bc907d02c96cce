use std::time::Duration;

use crate::TraceStore;

const MIN_ADAPTIVE_RATE: f64 = 0.1;
const DECREASE_FACTOR: f64 = 0.9;
const INCREASE_FACTOR: f64 = 1.1;

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingController {
    rate: f64,
    adaptive: bool,
    high_water: f64,
    low_water: f64,
}

impl SamplingController {
    pub fn new(rate: f64, adaptive: bool, high_water: f64, low_water: f64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
            adaptive,
            high_water,
            low_water,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
    }

    pub fn set_adaptive(&mut self, adaptive: bool) {
        self.adaptive = adaptive;
    }

    /// Scales the rate from observed traces-per-minute over `window`.
    pub fn adjust(&mut self, trace_count: usize, window: Duration) -> f64 {
        let minutes = window.as_secs_f64() / 60.0;
        if !self.adaptive || minutes <= 0.0 {
            return self.rate;
        }

        let per_minute = trace_count as f64 / minutes;
        if per_minute > self.high_water {
            self.rate = (self.rate * DECREASE_FACTOR).max(MIN_ADAPTIVE_RATE);
        } else if per_minute < self.low_water {
            self.rate = (self.rate * INCREASE_FACTOR).min(1.0);
        }
        self.rate
    }

    pub fn decide(&self, roll: f64) -> bool {
        roll <= self.rate
    }
}

impl TraceStore {
    pub fn should_sample(&self) -> bool {
        let roll: f64 = rand::random();
        self.state().sampler.decide(roll)
    }

    pub fn sampling_rate(&self) -> f64 {
        self.state().sampler.rate()
    }

    pub fn set_sampling_rate(&self, rate: f64) {
        let mut state = self.state();
        state.sampler.set_rate(rate);
        tracing::info!(rate = state.sampler.rate(), "sampling rate set");
    }

    pub fn set_adaptive_sampling(&self, adaptive: bool) {
        self.state().sampler.set_adaptive(adaptive);
        tracing::info!(adaptive, "adaptive sampling toggled");
    }
}
