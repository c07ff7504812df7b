//! Background sweeps for expiring keyed state.
//!
//! Quota expiry, rate-window GC, cache expiry and job retention all run as
//! the same kind of task: a tokio interval that calls a sweep closure until
//! it is shut down. A panicking pass is caught and logged; the loop keeps
//! running.

use crate::error::{panic_message, ConfigError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Error returned when a sweeper does not stop cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The sweep task panicked outside a sweep pass
    #[error("sweeper `{name}` panicked: {message}")]
    TaskPanicked { name: String, message: String },

    /// The sweep task was aborted before it saw the shutdown signal
    #[error("sweeper `{name}` was cancelled")]
    TaskCancelled { name: String },
}

/// A periodic sweep, not yet started.
#[derive(Debug, Clone)]
pub struct Sweeper {
    name: String,
    interval: Duration,
}

impl Sweeper {
    /// Create a sweeper that runs every `interval`.
    ///
    /// # Errors
    /// Returns `ConfigError::Zero` if `interval` is zero.
    pub fn new(name: impl Into<String>, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "sweep_interval_ms",
            });
        }
        Ok(Self {
            name: name.into(),
            interval,
        })
    }

    /// Sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// `pass` returns the number of entries it removed. The first pass runs
    /// one full interval after start.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime, like `tokio::spawn`.
    pub fn start<F>(self, mut pass: F) -> SweeperHandle
    where
        F: FnMut() -> usize + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match catch_unwind(AssertUnwindSafe(&mut pass)) {
                            Ok(0) => {}
                            Ok(removed) => {
                                tracing::debug!(sweeper = %self.name, removed, "sweep pass removed entries");
                            }
                            Err(payload) => {
                                tracing::error!(
                                    sweeper = %self.name,
                                    panic = %panic_message(payload.as_ref()),
                                    "sweep pass panicked"
                                );
                            }
                        }
                    }
                }
            }
        });

        SweeperHandle {
            name,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Handle to a running sweeper.
///
/// Dropping the handle aborts the task, so a forgotten sweeper never keeps
/// a runtime busy.
#[derive(Debug)]
pub struct SweeperHandle {
    name: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Name given to the sweeper.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        if let Some(tx) = self.shutdown_tx.take() {
            // The receiver is gone only if the task already exited
            let _ = tx.send(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_panic() => Err(ShutdownError::TaskPanicked {
                name: self.name.clone(),
                message: panic_message(e.into_panic().as_ref()),
            }),
            Err(_) => Err(ShutdownError::TaskCancelled {
                name: self.name.clone(),
            }),
        }
    }

    /// Stop the task without waiting.
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.abort();
    }
}
