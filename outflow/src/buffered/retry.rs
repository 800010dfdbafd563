// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Retry bookkeeping for the flush engine.
//!
//! A retry episode starts with the first failed flush and lasts until a flush succeeds or
//! the data is abandoned. During an episode every attempt moves the next retry time forward
//! by an exponentially growing, jittered wait.

use std::time::SystemTime;

use outflow_clock::add_secs_f64;
use rand::Rng;

/// Backoff and limit settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RetryPolicy {
    pub(crate) retry_wait: f64,
    pub(crate) max_retry_wait: Option<f64>,
    pub(crate) retry_limit: u32,
    pub(crate) disable_retry_limit: bool,
    pub(crate) secondary_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_wait: 1.0,
            max_retry_wait: None,
            retry_limit: 17,
            disable_retry_limit: false,
            secondary_limit: 8,
        }
    }
}

/// What to do after a failed flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureAction {
    /// Keep retrying with the same target.
    Retry,
    /// The primary just ran out of retries: try the secondary right away.
    FallBackNow,
    /// Keep retrying, with the secondary.
    RetryWithSecondary,
    /// The secondary ran out of retries too: drop the queued data.
    AbandonSecondary,
    /// No secondary and out of retries: drop the queued data.
    Abandon,
}

impl RetryPolicy {
    /// Seconds to wait before attempt `num_errors + 1`.
    pub(crate) fn backoff(&self, num_errors: u32, rng: &mut impl Rng) -> f64 {
        let exponent = if self.disable_retry_limit || num_errors <= self.retry_limit {
            i64::from(num_errors) - 1
        } else {
            i64::from(num_errors) - 2 - i64::from(self.retry_limit)
        };
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let mut wait = self.retry_wait * 2f64.powi(exponent);
        if wait.is_finite() {
            wait += rng.random::<f64>() * (wait / 4.0) - wait / 8.0;
        }
        match self.max_retry_wait {
            Some(max) if wait > max => max,
            _ => wait,
        }
    }

    /// Returns `true` if a retry at `num_errors` goes to the secondary.
    pub(crate) fn uses_secondary(&self, num_errors: u32) -> bool {
        !self.disable_retry_limit && num_errors > self.retry_limit
    }

    /// Classify a failure. `error_count` is 0 for the failure that started the episode.
    pub(crate) fn on_failure(&self, error_count: u32, has_secondary: bool) -> FailureAction {
        if self.disable_retry_limit || error_count < self.retry_limit {
            FailureAction::Retry
        } else if !has_secondary {
            FailureAction::Abandon
        } else if error_count == self.retry_limit {
            FailureAction::FallBackNow
        } else if u64::from(error_count)
            <= u64::from(self.retry_limit) + u64::from(self.secondary_limit)
        {
            FailureAction::RetryWithSecondary
        } else {
            FailureAction::AbandonSecondary
        }
    }
}

/// Outcome of [`RetryState::begin_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// No episode in progress.
    Fresh,
    /// The next retry is not due yet.
    NotDue,
    /// A retry is due. Carries the updated error count.
    Retry(u32),
}

/// The error state shared by all flush workers of one output. Always used under a lock.
#[derive(Debug, Clone)]
pub(crate) struct RetryState {
    num_errors: u32,
    last_retry_time: Option<SystemTime>,
    next_retry_time: SystemTime,
}

impl RetryState {
    pub(crate) fn new(now: SystemTime) -> Self {
        Self {
            num_errors: 0,
            last_retry_time: None,
            next_retry_time: now,
        }
    }

    pub(crate) fn num_errors(&self) -> u32 {
        self.num_errors
    }

    pub(crate) fn next_retry_time(&self) -> SystemTime {
        self.next_retry_time
    }

    pub(crate) fn last_retry_time(&self) -> Option<SystemTime> {
        self.last_retry_time
    }

    /// Start a flush attempt at `now`.
    ///
    /// While an episode is in progress and the retry is due (or `force` is set), the error
    /// count is incremented and the next retry time moves forward by the backoff for the new
    /// count.
    pub(crate) fn begin_step(
        &mut self,
        now: SystemTime,
        force: bool,
        backoff: impl FnOnce(u32) -> f64,
    ) -> Step {
        if self.num_errors == 0 {
            return Step::Fresh;
        }
        if !force && self.next_retry_time > now {
            return Step::NotDue;
        }
        self.last_retry_time = Some(now);
        self.num_errors = self.num_errors.saturating_add(1);
        self.next_retry_time = add_secs_f64(self.next_retry_time, backoff(self.num_errors));
        Step::Retry(self.num_errors)
    }

    /// End the episode after a successful flush. Returns `true` if an episode was in progress.
    pub(crate) fn record_success(&mut self) -> bool {
        std::mem::replace(&mut self.num_errors, 0) != 0
    }

    /// Start an episode at `now` unless another worker already did. Returns `true` if this
    /// call started it.
    pub(crate) fn record_first_failure(
        &mut self,
        now: SystemTime,
        backoff: impl FnOnce(u32) -> f64,
    ) -> bool {
        if self.num_errors != 0 {
            return false;
        }
        self.last_retry_time = Some(now);
        self.num_errors = 1;
        self.next_retry_time = add_secs_f64(now, backoff(1));
        true
    }

    /// End the episode after abandoning data.
    pub(crate) fn reset(&mut self) {
        self.num_errors = 0;
    }
}
