// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use crate::Time;

/// Simple static clock that will always return the same time
#[derive(Debug)]
pub struct StaticClock {
    now: SystemTime,
}

impl StaticClock {
    /// Create a new StaticClock that always returns the given time
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
    pub fn at_time(time: impl Into<SystemTime>) -> Self {
        Self { now: time.into() }
    }
}

impl Time for StaticClock {
    fn now(&self) -> SystemTime {
        self.now
    }
}

/// Clock that is loaded with one time, but can be cloned and moved via a shared handle
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<StaticClock>>);

impl ManualClock {
    /// Create a new ManualClock that is started with the given time.
    ///
    /// You can subsequently call [`Self::set`] or [`Self::advance`] to move it.
    pub fn at_time(time: impl Into<SystemTime>) -> Self {
        Self(Arc::new(Mutex::new(StaticClock::at_time(time))))
    }

    /// Replace the current time.
    ///
    /// # Examples
    ///
    /// ```
    /// use outflow_clock::{TimeSource, fakes::ManualClock};
    /// use std::time::{Duration, UNIX_EPOCH};
    ///
    /// let clock = ManualClock::at_time(UNIX_EPOCH);
    /// let ts = TimeSource::custom(clock.clone());
    ///
    /// let later = UNIX_EPOCH + Duration::from_secs(100);
    /// clock.set(later);
    /// assert_eq!(ts.now(), later);
    /// ```
    pub fn set(&self, time: impl Into<SystemTime>) {
        self.0.lock().unwrap().now = time.into();
    }

    /// Move the current time forward.
    pub fn advance(&self, elapsed: Duration) {
        let mut guard = self.0.lock().unwrap();
        guard.now += elapsed;
    }
}

impl Time for ManualClock {
    fn now(&self) -> SystemTime {
        self.0.lock().unwrap().now
    }
}
