//! Rate limiting policies and interval parsing.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ThrottleError};

/// Algorithm a rate limiter factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// Fixed number of hits per calendar-free window
    FixedWindow,
    /// Bucket refilled at a steady rate
    TokenBucket,
    /// Window weighted with the previous one
    SlidingWindow,
    /// Never limits
    NoLimit,
}

impl RateLimitPolicy {
    /// The configuration name of this policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitPolicy::FixedWindow => "fixed_window",
            RateLimitPolicy::TokenBucket => "token_bucket",
            RateLimitPolicy::SlidingWindow => "sliding_window",
            RateLimitPolicy::NoLimit => "no_limit",
        }
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitPolicy {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed_window" => Ok(RateLimitPolicy::FixedWindow),
            "token_bucket" => Ok(RateLimitPolicy::TokenBucket),
            "sliding_window" => Ok(RateLimitPolicy::SlidingWindow),
            "no_limit" => Ok(RateLimitPolicy::NoLimit),
            other => Err(ThrottleError::InvalidArgument(format!(
                "Limiter policy {:?} does not exist, it must be either \"token_bucket\", \
                 \"sliding_window\", \"fixed_window\" or \"no_limit\"",
                other
            ))),
        }
    }
}

/// A refill rate: `amount` tokens every `interval`, both non-zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    interval: Duration,
    amount: u32,
}

impl Rate {
    /// Create a rate.
    ///
    /// Fails with `InvalidArgument` when `amount` or `interval` is zero.
    pub fn new(interval: Duration, amount: u32) -> Result<Self> {
        if amount == 0 || interval.is_zero() {
            return Err(ThrottleError::InvalidArgument(format!(
                "a rate needs a positive amount and interval, {} per {:?} given",
                amount, interval
            )));
        }
        Ok(Self { interval, amount })
    }

    /// `amount` tokens per second.
    pub fn per_second(amount: u32) -> Result<Self> {
        Self::new(Duration::from_secs(1), amount)
    }

    /// `amount` tokens per minute.
    pub fn per_minute(amount: u32) -> Result<Self> {
        Self::new(Duration::from_secs(60), amount)
    }

    /// `amount` tokens per hour.
    pub fn per_hour(amount: u32) -> Result<Self> {
        Self::new(Duration::from_secs(3600), amount)
    }

    /// Parse the interval with [`parse_interval`].
    pub fn parse(interval: &str, amount: u32) -> Result<Self> {
        Self::new(parse_interval(interval)?, amount)
    }

    /// Tokens added per second.
    pub fn tokens_per_second(&self) -> f64 {
        self.amount as f64 / self.interval.as_secs_f64()
    }

    /// Seconds needed to accumulate `tokens`.
    pub fn time_for(&self, tokens: f64) -> f64 {
        tokens / self.tokens_per_second()
    }
}

/// Parse an interval.
///
/// Accepts whole seconds (`"90"`), ISO-8601 durations (`"PT1M30S"`,
/// `"P1D"`) and `"<n> <unit>"` phrases (`"15 minutes"`, `"1 day"`).
pub fn parse_interval(input: &str) -> Result<Duration> {
    let input = input.trim();
    let invalid = || ThrottleError::InvalidArgument(format!("invalid interval: {:?}", input));

    let duration = if let Ok(secs) = input.parse::<u64>() {
        Duration::from_secs(secs)
    } else if let Some(iso) = input.strip_prefix('P') {
        parse_iso8601(iso).ok_or_else(invalid)?
    } else {
        let mut parts = input.split_whitespace();
        let amount: u64 = parts.next().and_then(|n| n.parse().ok()).ok_or_else(invalid)?;
        let unit = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Duration::from_secs(amount * unit_seconds(unit).ok_or_else(invalid)?)
    };

    if duration.is_zero() {
        return Err(invalid());
    }
    Ok(duration)
}

fn unit_seconds(unit: &str) -> Option<u64> {
    let unit = unit.to_ascii_lowercase();
    let unit = unit.strip_suffix('s').unwrap_or(&unit);
    match unit {
        "second" | "sec" => Some(1),
        "minute" | "min" => Some(60),
        "hour" => Some(3_600),
        "day" => Some(86_400),
        "week" => Some(604_800),
        _ => None,
    }
}

fn parse_iso8601(body: &str) -> Option<Duration> {
    let (date, time) = match body.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };

    let mut secs = parse_designators(date, &[('W', 604_800), ('D', 86_400)])?;
    if let Some(time) = time {
        if time.is_empty() {
            return None;
        }
        secs += parse_designators(time, &[('H', 3_600), ('M', 60), ('S', 1)])?;
    }
    Some(Duration::from_secs(secs))
}

fn parse_designators(part: &str, designators: &[(char, u64)]) -> Option<u64> {
    let mut total = 0;
    let mut digits = String::new();
    let mut next = 0;

    for c in part.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        // Designators must appear in order, each at most once.
        let offset = designators[next..].iter().position(|(d, _)| *d == c)?;
        let (_, unit) = designators[next + offset];
        total += digits.parse::<u64>().ok()? * unit;
        digits.clear();
        next += offset + 1;
    }

    digits.is_empty().then_some(total)
}
