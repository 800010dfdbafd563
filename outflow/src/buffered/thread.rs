// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::{Duration, SystemTime},
};

use crossbeam_utils::sync::{Parker, Unparker};
use outflow_clock::TimeSource;

/// What a flush worker drives.
pub(crate) trait FlushTarget: Send + Sync + 'static {
    /// Flush whatever is due and return when to try next.
    fn try_flush(&self) -> SystemTime;

    /// Called once by every worker after its loop has ended.
    fn before_shutdown(&self);
}

struct WorkerState {
    finished: bool,
    next_time: SystemTime,
    // set by `submit_flush`, so a wake time computed by a concurrent `try_flush` can't
    // overwrite the request
    flush_requested: bool,
}

struct Shared {
    state: Mutex<WorkerState>,
    unparker: Unparker,
}

/// One background flush worker.
///
/// The worker sleeps until its next wake time or until it is unparked, then calls
/// [`FlushTarget::try_flush`] and sleeps until the time that returns.
pub(crate) struct OutputThread {
    name: String,
    clock: TimeSource,
    shared: Arc<Shared>,
    // taken by the worker thread at start
    parker: Mutex<Option<Parker>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl OutputThread {
    pub(crate) fn new(name: String, clock: TimeSource) -> Self {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState {
                    finished: false,
                    next_time: clock.now(),
                    flush_requested: false,
                }),
                unparker,
            }),
            name,
            clock,
            parker: Mutex::new(Some(parker)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the worker. The first flush is attempted one second after start. Starting a
    /// started worker does nothing.
    pub(crate) fn start(&self, target: Arc<dyn FlushTarget>) -> io::Result<()> {
        let Some(parker) = self.parker.lock().unwrap().take() else {
            return Ok(());
        };
        self.shared.state.lock().unwrap().next_time =
            self.clock.now() + Duration::from_secs(1);

        let worker = Worker {
            name: self.name.clone(),
            clock: self.clock.clone(),
            shared: Arc::clone(&self.shared),
            parker,
            target,
        };
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run())?;
        *self.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Ask the worker to call `try_flush` as soon as possible.
    pub(crate) fn submit_flush(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.flush_requested = true;
            state.next_time = self.clock.now();
        }
        self.shared.unparker.unpark();
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.shared.state.lock().unwrap().finished = true;
        self.shared.unparker.unpark();
        thread::yield_now();

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!(worker = %self.name, "output flush worker terminated abnormally");
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }
}

// The state moved into the worker thread.
struct Worker {
    name: String,
    clock: TimeSource,
    shared: Arc<Shared>,
    parker: Parker,
    target: Arc<dyn FlushTarget>,
}

impl Worker {
    fn run(self) {
        let span = tracing::span!(tracing::Level::TRACE, "output flush worker", worker = %self.name);
        let _enter = span.enter();

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        // the stack is already unwound here; the panic hook printed the location and, with
        // RUST_BACKTRACE set, the trace of the panicking frame
        if let Err(payload) = &result {
            tracing::error!(
                error = panic_message(payload.as_ref()),
                "unexpected error while flushing the buffer"
            );
        }

        {
            let _state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.target.before_shutdown();
        }

        if let Err(payload) = result {
            panic::resume_unwind(payload);
        }
    }

    fn run_loop(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while !state.finished {
            let now = self.clock.now();
            if state.flush_requested || state.next_time <= now {
                state.flush_requested = false;
                drop(state);
                let next = self.target.try_flush();
                state = self.shared.state.lock().unwrap();
                if !state.flush_requested {
                    state.next_time = next;
                }
                continue;
            }

            let wait = state
                .next_time
                .duration_since(now)
                .unwrap_or(Duration::ZERO);
            drop(state);
            self.parker.park_timeout(wait);
            state = self.shared.state.lock().unwrap();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
