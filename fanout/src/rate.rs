//! Rate limiting: admission control for task submission.
//!
//! A [`RateLimit`] is a plain value (`count` operations per [`Interval`]). A
//! [`RateLimiter`] turns it into a token bucket that paces callers: every
//! granted permit pushes the next admission time forward by
//! `1 / rate_per_second`, so consecutive permits are never closer together than
//! that spacing.
//!
//! # Pacing, not bursting
//!
//! The bucket holds a single token. A limit of `100/minute` does not allow 100
//! immediate submissions followed by a minute of silence; it allows one
//! submission every 600ms. This keeps downstream services from seeing bursts
//! at the start of every interval.
//!
//! # Algorithm
//!
//! The only state is `next_allowed`, guarded by a mutex:
//!
//! ```text
//! now >= next_allowed  =>  next_allowed = max(next_allowed, now) + spacing; grant
//! now <  next_allowed  =>  wait = next_allowed - now; sleep(max(wait, 1ms)); retry
//! ```
//!
//! The lock is only held while reading and updating `next_allowed`; callers
//! sleep outside of it. `next_allowed` never moves backwards.
//!
//! A limiter never rejects and never times out. A very low rate simply means
//! long waits.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::error::{Error, Result};

/// Sleeping less than this turns waiting into spinning.
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Spacing beyond this cannot be added to an `Instant` on every platform.
const MAX_SPACING_SECS: f64 = u32::MAX as f64;

/// The time unit a [`RateLimit`] count refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[default]
    Second,
    Minute,
    Hour,
}

impl Interval {
    pub fn as_secs(self) -> f64 {
        match self {
            Self::Second => 1.0,
            Self::Minute => 60.0,
            Self::Hour => 3600.0,
        }
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(Self::Second),
            "m" | "min" | "minute" | "minutes" => Ok(Self::Minute),
            "h" | "hr" | "hour" | "hours" => Ok(Self::Hour),
            other => Err(Error::config(format!(
                "unknown rate interval {other:?}, expected second, minute or hour"
            ))),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
        })
    }
}

/// `count` operations per `interval`.
///
/// ```
/// use fanout::{Interval, RateLimit};
///
/// let limit = RateLimit::new(100.0, Interval::Minute).unwrap();
/// assert_eq!(limit, "100/minute".parse().unwrap());
/// assert!(RateLimit::new(0.0, Interval::Second).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimit")]
pub struct RateLimit {
    count: f64,
    interval: Interval,
}

#[derive(Deserialize)]
struct RawRateLimit {
    count: f64,
    #[serde(default)]
    interval: Interval,
}

impl TryFrom<RawRateLimit> for RateLimit {
    type Error = Error;

    fn try_from(raw: RawRateLimit) -> Result<Self> {
        Self::new(raw.count, raw.interval)
    }
}

impl RateLimit {
    /// Rejects counts that are not finite and positive, and rates so low that
    /// the spacing between two permits cannot be represented.
    pub fn new(count: f64, interval: Interval) -> Result<Self> {
        if !count.is_finite() || count <= 0.0 {
            return Err(Error::config(format!(
                "rate limit count must be a positive number, got {count}"
            )));
        }
        let limit = Self { count, interval };
        let spacing = 1.0 / limit.rate_per_second();
        if !spacing.is_finite() || spacing > MAX_SPACING_SECS {
            return Err(Error::config(format!("rate limit {limit} is too low")));
        }
        Ok(limit)
    }

    pub fn per_second(count: f64) -> Result<Self> {
        Self::new(count, Interval::Second)
    }

    pub fn per_minute(count: f64) -> Result<Self> {
        Self::new(count, Interval::Minute)
    }

    pub fn per_hour(count: f64) -> Result<Self> {
        Self::new(count, Interval::Hour)
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn rate_per_second(&self) -> f64 {
        self.count / self.interval.as_secs()
    }

    /// Minimum time between two permits.
    pub fn spacing(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_per_second())
    }
}

impl FromStr for RateLimit {
    type Err = Error;

    /// Parses `"5/second"`, `"100/min"`, `"3/h"` or a bare `"2.5"` (per second).
    fn from_str(s: &str) -> Result<Self> {
        let (count, interval) = match s.split_once('/') {
            Some((count, interval)) => (count, interval.parse()?),
            None => (s, Interval::Second),
        };
        let count = count
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::config(format!("invalid rate limit {s:?}")))?;
        Self::new(count, interval)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, self.interval)
    }
}

/// Token bucket shared by every caller routed through it.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    spacing: Duration,
    next_allowed: Mutex<Instant>,
    granted: AtomicU64,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            spacing: limit.spacing(),
            next_allowed: Mutex::new(Instant::now()),
            granted: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Number of permits handed out so far.
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    /// Takes a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.reserve(Instant::now()).is_ok()
    }

    /// Blocks the calling thread until a permit is granted.
    pub fn acquire(&self) {
        while let Err(wait) = self.reserve(Instant::now()) {
            std::thread::sleep(wait.max(MIN_SLEEP));
        }
    }

    /// Async twin of [`acquire`](Self::acquire); sleeps on the tokio timer
    /// instead of blocking the thread.
    pub async fn acquire_async(&self) {
        while let Err(wait) = self.reserve(Instant::now()) {
            tokio::time::sleep(wait.max(MIN_SLEEP)).await;
        }
    }

    /// Grants a permit or tells the caller how long to wait before retrying.
    fn reserve(&self, now: Instant) -> std::result::Result<(), Duration> {
        let mut next_allowed = self
            .next_allowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let next = next_slot(*next_allowed, now, self.spacing)?;
        *next_allowed = next;
        self.granted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Pure pacing step.
///
/// Returns the new `next_allowed` when a permit can be granted at `now`, or
/// the remaining wait otherwise.
pub(crate) fn next_slot(
    next_allowed: Instant,
    now: Instant,
    spacing: Duration,
) -> std::result::Result<Instant, Duration> {
    if now < next_allowed {
        return Err(next_allowed - now);
    }
    Ok(next_allowed.max(now) + spacing)
}
