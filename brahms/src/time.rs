//! Sample rates and engine time.
//!
//! All timing in an execution derives from a single *base rate*, the least
//! common multiple of every sample rate requested by the components of the
//! system. Engine time is then counted in base samples: a process sampled at
//! rate `r` is serviced every `base / r` base samples, which is always an
//! integer.
//!
//! # Examples
//!
//! ```
//! use brahms::time::{base_rate, SampleRate};
//!
//! let rates = [SampleRate::new(10, 1)?, SampleRate::new(15, 1)?];
//! let base = base_rate(&rates)?;
//!
//! assert_eq!(base, SampleRate::new(30, 1)?);
//! assert_eq!(base.period_of(rates[0])?, 3);
//! # Ok::<(), brahms::error::Error>(())
//! ```

use std::fmt;
use std::time::Duration;

use crate::error::{Error, ErrorCode};

/// A sample rate expressed as a reduced fraction of samples per second.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleRate {
    num: u64,
    den: u64,
}

impl SampleRate {
    /// Creates a rate of `num / den` samples per second.
    ///
    /// The fraction is reduced. A zero numerator or denominator is an
    /// `E_INVALID_ARG` error.
    pub fn new(num: u64, den: u64) -> Result<Self, Error> {
        if num == 0 || den == 0 {
            return Err(Error::new(
                ErrorCode::InvalidArg,
                format!("invalid sample rate {}/{}", num, den),
            ));
        }
        let g = gcd(num, den);

        Ok(Self {
            num: num / g,
            den: den / g,
        })
    }

    /// Creates an integral rate in Hz.
    pub fn hz(hz: u64) -> Result<Self, Error> {
        Self::new(hz, 1)
    }

    /// Returns the numerator of the reduced fraction.
    pub fn num(&self) -> u64 {
        self.num
    }

    /// Returns the denominator of the reduced fraction.
    pub fn den(&self) -> u64 {
        self.den
    }

    /// Returns the rate as a floating-point value in Hz.
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Returns the number of samples of `self` per sample of `rate`.
    ///
    /// `self` is normally the base rate. The ratio must be an integer, or the
    /// result is `E_UNREPRESENTABLE`.
    pub fn period_of(&self, rate: SampleRate) -> Result<u64, Error> {
        // (n_b / d_b) / (n_r / d_r) = (n_b * d_r) / (d_b * n_r)
        let num = (self.num as u128) * (rate.den as u128);
        let den = (self.den as u128) * (rate.num as u128);
        if num % den != 0 {
            return Err(Error::new(
                ErrorCode::Unrepresentable,
                format!("rate {} is not a divisor of base rate {}", rate, self),
            ));
        }

        u64::try_from(num / den).map_err(|_| {
            Error::new(
                ErrorCode::Unrepresentable,
                format!("period of rate {} at base rate {} overflows", rate, self),
            )
        })
    }

    /// Returns the number of samples covering `seconds`, rounded up.
    pub fn samples_in(&self, seconds: f64) -> Result<u64, Error> {
        if !(seconds.is_finite() && seconds >= 0.0) {
            return Err(Error::new(
                ErrorCode::InvalidArg,
                format!("invalid duration {} s", seconds),
            ));
        }
        let exact = seconds * self.num as f64 / self.den as f64;
        // Absorb the rounding noise of the decimal-to-binary conversion.
        let samples = (exact - 1e-9).ceil().max(0.0);
        if samples >= u64::MAX as f64 {
            return Err(Error::new(
                ErrorCode::Unrepresentable,
                format!("{} s at {} is not representable", seconds, self),
            ));
        }

        Ok(samples as u64)
    }
}

impl fmt::Debug for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SampleRate({}/{})", self.num, self.den)
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Greatest common divisor.
pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }

    a
}

/// Least common multiple, or `None` on overflow.
pub fn lcm(a: u64, b: u64) -> Option<u64> {
    if a == 0 || b == 0 {
        return Some(0);
    }

    (a / gcd(a, b)).checked_mul(b)
}

/// Computes the base rate of a set of sample rates.
///
/// The base rate is `lcm(numerators) / gcd(denominators)` over the reduced
/// fractions, the slowest rate of which every rate is an integral divisor.
/// The result does not depend on the order of the rates. An empty set is an
/// `E_INVALID_ARG` error and an overflow is `E_UNREPRESENTABLE`.
pub fn base_rate(rates: &[SampleRate]) -> Result<SampleRate, Error> {
    let Some(first) = rates.first() else {
        return Err(Error::new(
            ErrorCode::InvalidArg,
            "no sample rate to derive a base rate from",
        ));
    };

    let mut num = first.num;
    let mut den = first.den;
    for rate in &rates[1..] {
        num = lcm(num, rate.num).ok_or_else(|| {
            Error::new(
                ErrorCode::Unrepresentable,
                "least common multiple of sample rates overflows 64 bits",
            )
        })?;
        den = gcd(den, rate.den);
    }

    SampleRate::new(num, den)
}

/// Timing information of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComponentTime {
    /// Base rate of the execution.
    pub base_sample_rate: SampleRate,
    /// Sample rate of the process.
    pub sample_rate: SampleRate,
    /// Number of base samples between two services of the process.
    pub sample_period: u64,
    /// Base sample at which execution stops.
    pub execution_stop: u64,
    /// Current base sample.
    pub now: u64,
}

impl ComponentTime {
    /// Derives the timing of a process sampled at `sample_rate`.
    pub fn new(
        base_sample_rate: SampleRate,
        sample_rate: SampleRate,
        execution_stop: u64,
    ) -> Result<Self, Error> {
        Ok(Self {
            base_sample_rate,
            sample_rate,
            sample_period: base_sample_rate.period_of(sample_rate)?,
            execution_stop,
            now: 0,
        })
    }

    /// Returns the current time in seconds.
    pub fn now_secs(&self) -> f64 {
        self.now as f64 / self.base_sample_rate.as_f64()
    }

    /// Returns the index of the current sample of the process.
    pub fn sample_index(&self) -> u64 {
        self.now / self.sample_period
    }
}

/// An interval that grows with elapsed wallclock time.
///
/// Short executions are polled frequently, long ones more lazily. The
/// interval is `elapsed / 64`, clamped to `[min, max]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdaptiveInterval {
    min: Duration,
    max: Duration,
}

impl AdaptiveInterval {
    /// Creates an interval bounded by `min` and `max`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Returns the interval after `elapsed` wallclock time.
    pub fn at(&self, elapsed: Duration) -> Duration {
        (elapsed / 64).clamp(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(num: u64, den: u64) -> SampleRate {
        SampleRate::new(num, den).unwrap()
    }

    #[test]
    fn rates_are_reduced() {
        assert_eq!(rate(20, 4), rate(5, 1));
        assert_eq!(rate(3, 6).num(), 1);
        assert_eq!(rate(3, 6).den(), 2);
        assert!(SampleRate::new(0, 1).is_err());
        assert!(SampleRate::new(1, 0).is_err());
    }

    #[test]
    fn base_rate_of_integral_rates() {
        assert_eq!(base_rate(&[rate(10, 1), rate(15, 1)]).unwrap(), rate(30, 1));
        assert_eq!(base_rate(&[rate(100, 1)]).unwrap(), rate(100, 1));
    }

    #[test]
    fn base_rate_of_fractional_rates() {
        // 1/2 Hz and 1/3 Hz are both sampled by 1 Hz.
        let base = base_rate(&[rate(1, 2), rate(1, 3)]).unwrap();
        assert_eq!(base, rate(1, 1));
        assert_eq!(base.period_of(rate(1, 2)).unwrap(), 2);
        assert_eq!(base.period_of(rate(1, 3)).unwrap(), 3);

        // 3/2 Hz and 5/4 Hz.
        let base = base_rate(&[rate(3, 2), rate(5, 4)]).unwrap();
        assert_eq!(base, rate(15, 2));
        assert_eq!(base.period_of(rate(3, 2)).unwrap(), 5);
        assert_eq!(base.period_of(rate(5, 4)).unwrap(), 6);
    }

    #[test]
    fn base_rate_is_order_independent() {
        let rates = [rate(7, 3), rate(12, 5), rate(9, 1), rate(4, 9)];
        let expected = base_rate(&rates).unwrap();

        let mut permuted = rates;
        for i in 0..rates.len() {
            permuted.rotate_left(1);
            if i % 2 == 0 {
                permuted.swap(0, 1);
            }
            assert_eq!(base_rate(&permuted).unwrap(), expected);
        }
    }

    #[test]
    fn base_rate_overflow_is_unrepresentable() {
        let rates = [rate(u64::MAX - 1, 1), rate(u64::MAX - 2, 1)];
        assert_eq!(
            base_rate(&rates).unwrap_err().code(),
            ErrorCode::Unrepresentable
        );
        assert_eq!(base_rate(&[]).unwrap_err().code(), ErrorCode::InvalidArg);
    }

    #[test]
    fn execution_stop_rounds_up() {
        assert_eq!(rate(100, 1).samples_in(1.0).unwrap(), 100);
        assert_eq!(rate(30, 1).samples_in(0.1).unwrap(), 3);
        assert_eq!(rate(3, 1).samples_in(0.5).unwrap(), 2);
        assert!(rate(3, 1).samples_in(-1.0).is_err());
    }

    #[test]
    fn adaptive_interval_is_clamped() {
        let interval = AdaptiveInterval::new(Duration::from_millis(5), Duration::from_millis(50));
        assert_eq!(interval.at(Duration::ZERO), Duration::from_millis(5));
        assert_eq!(interval.at(Duration::from_millis(640)), Duration::from_millis(10));
        assert_eq!(interval.at(Duration::from_secs(3600)), Duration::from_millis(50));
    }
}
