// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Module containing fake clocks for testing
///
/// To enable this module, you must enable the `test-util` feature.
#[cfg(feature = "test-util")]
pub mod fakes;

/// Trait for providing custom clocks
///
/// Implementors of this trait can be handed to [`TimeSource::custom`] to control the time
/// seen by flush workers and retry scheduling.
pub trait Time: Send + Sync + Debug {
    /// Get the current wall-clock time
    fn now(&self) -> SystemTime;
}

/// The clock consulted by the engine.
///
/// Cloning is cheap. A custom source is shared, not copied, so advancing a fake clock is
/// visible through every clone.
#[derive(Clone, Default)]
pub enum TimeSource {
    /// Use the system clock
    #[default]
    System,
    /// Use a custom clock
    Custom(Arc<dyn Time>),
}

impl std::fmt::Debug for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "TimeSource::System"),
            Self::Custom(_) => write!(f, "TimeSource::Custom(...)"),
        }
    }
}

impl TimeSource {
    /// Create a new TimeSource backed by a custom clock
    ///
    /// # Examples
    ///
    /// ```
    /// use outflow_clock::{TimeSource, fakes::StaticClock};
    /// use std::time::UNIX_EPOCH;
    ///
    /// let ts = TimeSource::custom(StaticClock::at_time(UNIX_EPOCH));
    /// assert_eq!(ts.now(), UNIX_EPOCH);
    /// ```
    pub fn custom(custom: impl Time + 'static) -> TimeSource {
        Self::Custom(Arc::new(custom))
    }

    /// Get the current wall-clock time from this source
    pub fn now(&self) -> SystemTime {
        match self {
            Self::System => SystemTime::now(),
            Self::Custom(ts) => ts.now(),
        }
    }

    /// Whole seconds since the Unix epoch, negative for times before it.
    ///
    /// Event timestamps and time-slice keys are computed from this value.
    pub fn unix_seconds(&self) -> i64 {
        unix_seconds(self.now())
    }
}

/// Convert a [`SystemTime`] to whole seconds since the Unix epoch, rounding toward
/// negative infinity.
pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
        Err(before) => {
            let before = before.duration();
            let secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
            if before.subsec_nanos() > 0 {
                -secs - 1
            } else {
                -secs
            }
        }
    }
}

/// Add `secs` (possibly fractional, infinite, or negative) to `time`.
///
/// Negative and NaN offsets are treated as zero. Offsets that cannot be represented saturate
/// to a point roughly a century after `time`, which is as good as "never" for scheduling.
pub fn add_secs_f64(time: SystemTime, secs: f64) -> SystemTime {
    const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
    let offset = if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(FAR_FUTURE)
    };
    time.checked_add(offset)
        .or_else(|| time.checked_add(FAR_FUTURE))
        .unwrap_or(time)
}
