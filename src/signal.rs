//! Synthetic data sources
//!
//! [`Signal`] generates values from a [`SignalPattern`] and elapsed time. It
//! stands in for a real device in the demo binary and in tests:
//!
//! - [`SignalPattern::Constant`] - Fixed value
//! - [`SignalPattern::Sine`] - Sinusoidal wave with configurable frequency/amplitude/phase
//! - [`SignalPattern::Counter`] - Incrementing counter with wrap-around
//! - [`SignalPattern::Random`] - Random values within a range
//! - [`SignalPattern::Sawtooth`] - Linear ramp that resets periodically
//! - [`SignalPattern::Square`] - Square wave alternating between two values
//! - [`SignalPattern::Triangle`] - Triangle wave
//!
//! ```ignore
//! use livevar::signal::{Signal, SignalPattern};
//! use livevar::Variable;
//!
//! let sine = Signal::new(SignalPattern::Sine { frequency: 0.5, amplitude: 1.0, offset: 0.0, phase: 0.0 });
//! let var = Variable::builder().getter(sine.into_getter()).interval(0.1).build()?;
//! ```

use crate::types::Value;
use crate::util::lock;
use crate::variable::GetterFn;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Waveform to generate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPattern {
    /// Constant value
    Constant { value: f64 },
    /// Sine wave with frequency and amplitude
    ///
    /// `phase` is in radians; `FRAC_PI_2` gives a cosine.
    Sine {
        frequency: f64,
        amplitude: f64,
        #[serde(default)]
        offset: f64,
        #[serde(default)]
        phase: f64,
    },
    /// Counter that increments on every sample
    Counter { step: f64, min: f64, max: f64 },
    /// Random values within range
    Random { min: f64, max: f64 },
    /// Sawtooth wave
    Sawtooth { period: f64, amplitude: f64 },
    /// Square wave
    Square { period: f64, amplitude: f64 },
    /// Triangle wave
    Triangle { period: f64, amplitude: f64 },
}

impl Default for SignalPattern {
    fn default() -> Self {
        SignalPattern::Sine {
            frequency: 1.0,
            amplitude: 1.0,
            offset: 0.0,
            phase: 0.0,
        }
    }
}

/// A pattern plus the state needed to sample it
#[derive(Debug)]
pub struct Signal {
    pattern: SignalPattern,
    noise_amplitude: f64,
    started: Instant,
    counter: Mutex<Option<f64>>,
    seed: AtomicU64,
}

impl Signal {
    /// Create a signal whose time axis starts now
    pub fn new(pattern: SignalPattern) -> Self {
        Self {
            pattern,
            noise_amplitude: 0.0,
            started: Instant::now(),
            counter: Mutex::new(None),
            seed: AtomicU64::new(12345),
        }
    }

    /// Add uniform noise of the given amplitude
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise_amplitude = amplitude.abs();
        self
    }

    /// Seed for the random pattern and the noise
    pub fn with_seed(self, seed: u64) -> Self {
        // xorshift never leaves zero
        self.seed.store(seed.max(1), Ordering::Relaxed);
        self
    }

    pub fn pattern(&self) -> SignalPattern {
        self.pattern
    }

    /// Sample at the current time
    pub fn sample(&self) -> f64 {
        self.value_at(self.started.elapsed().as_secs_f64())
    }

    /// Sample at `elapsed_secs` since the signal was created
    ///
    /// Counter and random patterns ignore the time and advance on every call.
    pub fn value_at(&self, elapsed_secs: f64) -> f64 {
        let base = match self.pattern {
            SignalPattern::Constant { value } => value,
            SignalPattern::Sine {
                frequency,
                amplitude,
                offset,
                phase,
            } => {
                offset
                    + amplitude
                        * (2.0 * std::f64::consts::PI * frequency * elapsed_secs + phase).sin()
            }
            SignalPattern::Counter { step, min, max } => {
                let mut counter = lock(&self.counter);
                let next = match *counter {
                    None => min,
                    Some(v) => {
                        let v = v + step;
                        if v > max {
                            min
                        } else if v < min {
                            max
                        } else {
                            v
                        }
                    }
                };
                *counter = Some(next);
                next
            }
            SignalPattern::Random { min, max } => min + self.rand() * (max - min),
            SignalPattern::Sawtooth { period, amplitude } => {
                let t = elapsed_secs % period;
                amplitude * (t / period)
            }
            SignalPattern::Square { period, amplitude } => {
                let t = elapsed_secs % period;
                if t < period / 2.0 {
                    amplitude
                } else {
                    -amplitude
                }
            }
            SignalPattern::Triangle { period, amplitude } => {
                let t = elapsed_secs % period;
                let half = period / 2.0;
                if t < half {
                    amplitude * (2.0 * t / half - 1.0)
                } else {
                    amplitude * (1.0 - 2.0 * (t - half) / half)
                }
            }
        };

        if self.noise_amplitude > 0.0 {
            base + (self.rand() - 0.5) * 2.0 * self.noise_amplitude
        } else {
            base
        }
    }

    /// Turn the signal into a getter for a variable
    pub fn into_getter(self) -> GetterFn {
        let signal = Arc::new(self);
        Arc::new(move || Ok(Value::Float(signal.sample())))
    }

    /// xorshift64 in [0, 1)
    fn rand(&self) -> f64 {
        let mut s = self.seed.load(Ordering::Relaxed);
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.seed.store(s, Ordering::Relaxed);
        (s >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let s = Signal::new(SignalPattern::Constant { value: 42.0 });
        assert_eq!(s.value_at(0.0), 42.0);
        assert_eq!(s.value_at(100.0), 42.0);
    }

    #[test]
    fn test_sine() {
        let s = Signal::new(SignalPattern::Sine {
            frequency: 1.0,
            amplitude: 2.0,
            offset: 1.0,
            phase: 0.0,
        });
        assert!((s.value_at(0.0) - 1.0).abs() < 1e-9);
        assert!((s.value_at(0.25) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_sine_phase_gives_cosine() {
        let s = Signal::new(SignalPattern::Sine {
            frequency: 1.0,
            amplitude: 1.0,
            offset: 0.0,
            phase: std::f64::consts::FRAC_PI_2,
        });
        assert!((s.value_at(0.0) - 1.0).abs() < 1e-9);
        assert!(s.value_at(0.25).abs() < 1e-9);
        assert!((s.value_at(0.5) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_counter_wraps() {
        let s = Signal::new(SignalPattern::Counter {
            step: 1.0,
            min: 0.0,
            max: 2.0,
        });
        let values: Vec<f64> = (0..5).map(|_| s.value_at(0.0)).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 0.0, 1.0]);
    }

    #[test]
    fn test_random_in_range() {
        let s = Signal::new(SignalPattern::Random { min: -1.0, max: 1.0 }).with_seed(7);
        for _ in 0..1000 {
            let v = s.value_at(0.0);
            assert!((-1.0..1.0).contains(&v), "{} out of range", v);
        }
    }

    #[test]
    fn test_square_and_triangle() {
        let sq = Signal::new(SignalPattern::Square {
            period: 2.0,
            amplitude: 1.0,
        });
        assert_eq!(sq.value_at(0.5), 1.0);
        assert_eq!(sq.value_at(1.5), -1.0);

        let tri = Signal::new(SignalPattern::Triangle {
            period: 2.0,
            amplitude: 1.0,
        });
        assert!((tri.value_at(0.0) + 1.0).abs() < 1e-9);
        assert!((tri.value_at(1.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pattern_from_toml() {
        let pattern: SignalPattern =
            toml::from_str("type = \"sine\"\nfrequency = 0.5\namplitude = 1.0").unwrap();
        assert_eq!(
            pattern,
            SignalPattern::Sine {
                frequency: 0.5,
                amplitude: 1.0,
                offset: 0.0,
                phase: 0.0
            }
        );
    }

    #[test]
    fn test_into_getter() {
        let getter = Signal::new(SignalPattern::Constant { value: 3.0 }).into_getter();
        assert_eq!(getter().unwrap(), Value::Float(3.0));
    }
}
