//! Adaptive poll timer.
//!
//! After a cycle that executed something the worker polls again at the
//! minimum interval. Every idle or contended cycle stretches the next sleep
//! by the warm-up coefficient until it hits the maximum.

use std::time::Duration;

use crate::error::{Error, Result};

/// Backoff settings in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub min_interval: f64,
    pub max_interval: f64,
    pub warm_up_coefficient: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_interval: 0.1,
            max_interval: 300.0,
            warm_up_coefficient: 1.3,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_interval > 0.001 && self.min_interval < 3600.0) {
            return Err(Error::Config(format!(
                "min interval must be within (0.001, 3600) seconds, got {}",
                self.min_interval
            )));
        }
        if !(self.max_interval > self.min_interval && self.max_interval < 8760.0) {
            return Err(Error::Config(format!(
                "max interval must be above min interval ({}) and below 8760 seconds, got {}",
                self.min_interval, self.max_interval
            )));
        }
        if !(self.warm_up_coefficient > 1.0 && self.warm_up_coefficient < 100.0) {
            return Err(Error::Config(format!(
                "warm-up coefficient must be within (1, 100), got {}",
                self.warm_up_coefficient
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: f64,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.min_interval,
            config,
        }
    }

    /// Feed the outcome of a cycle and return how long to sleep before the next.
    pub fn next_delay(&mut self, did_work: bool) -> Duration {
        self.current = if did_work {
            self.config.min_interval
        } else {
            (self.current * self.config.warm_up_coefficient).min(self.config.max_interval)
        };
        Duration::from_secs_f64(self.current)
    }

    pub fn current(&self) -> Duration {
        Duration::from_secs_f64(self.current)
    }
}
