//! Housekeeping tasks owned by a managed service.
//!
//! A [`HousekeepingTask`] runs a [`Housekeeping`] job on its own tokio task:
//! it reacts to requests sent over a bounded channel and fires a periodic
//! tick. Ticks are gated by the owner's [`RunGuard`], so a suspended or
//! stopping owner does no periodic work even if the task is still alive.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::lifecycle::RunGuard;

/// Capacity of the request channel.
const REQUEST_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

/// Work performed by a [`HousekeepingTask`].
#[async_trait]
pub trait Housekeeping: Send + 'static {
    /// On-demand request type.
    type Request: Send + 'static;

    async fn handle(&mut self, request: Self::Request);

    /// Periodic work. Only called while the owner is `Started`.
    async fn on_tick(&mut self) {}

    /// Runs once after the loop exits.
    async fn on_exit(&mut self) {}
}

// ---------------------------------------------------------------------------
// HousekeepingTask
// ---------------------------------------------------------------------------

struct Running<R: Housekeeping> {
    requests: mpsc::Sender<R::Request>,
    exit: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Handle to a spawned housekeeping loop.
///
/// Dropping the handle without [`stop`](Self::stop) aborts the loop, and
/// `on_exit` does not run.
pub struct HousekeepingTask<R: Housekeeping> {
    running: Option<Running<R>>,
}

impl<R: Housekeeping> HousekeepingTask<R> {
    /// Spawns the loop. Must be called inside a tokio runtime.
    ///
    /// The first tick fires one `period` after spawning. A slow tick delays
    /// the following ones instead of bunching them up.
    pub fn spawn(mut job: R, period: Duration, guard: RunGuard) -> Self {
        let (requests, mut inbox) = mpsc::channel::<R::Request>(REQUEST_CAPACITY);
        let (exit, mut exit_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut exit_rx => break,
                    request = inbox.recv() => match request {
                        Some(request) => job.handle(request).await,
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if guard.is_run_allowed() {
                            job.on_tick().await;
                        } else {
                            trace!(state = %guard.state(), "owner not running; tick skipped");
                        }
                    }
                }
            }

            job.on_exit().await;
        });

        Self {
            running: Some(Running {
                requests,
                exit,
                join,
            }),
        }
    }

    /// Hands a request to the loop, waiting for channel capacity.
    ///
    /// # Errors
    ///
    /// Fails once the task has been stopped or its loop has exited.
    pub async fn request(&self, request: R::Request) -> anyhow::Result<()> {
        let Some(running) = &self.running else {
            anyhow::bail!("housekeeping task is stopped");
        };
        running
            .requests
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("housekeeping loop has exited"))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Ends the loop and waits for `on_exit` to finish. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.exit.send(());
        drop(running.requests);
        let _ = running.join.await;
    }
}

impl<R: Housekeeping> Drop for HousekeepingTask<R> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.join.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
