//! Background loop scheduling
//!
//! Each subsystem owns a [`Scheduler`] and registers its periodic loops on it.
//! A loop never overlaps itself: the next tick is only taken once the previous
//! one finished, and missed ticks are skipped rather than burst. Tick errors
//! are logged and emitted as [`CoreEvent::Error`]; the loop keeps running until
//! [`Scheduler::shutdown`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::CoreResult;
use crate::events::{CoreEvent, EventBus};

/// Future produced by one loop tick
pub type TickFuture = BoxFuture<'static, CoreResult<()>>;

/// Owner of a subsystem's background loops
pub struct Scheduler {
    name: &'static str,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    events: EventBus,
}

impl Scheduler {
    /// Create a scheduler whose tasks are named after `name`
    pub fn new(name: &'static str, events: EventBus) -> Self {
        Self {
            name,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Token cancelled when the scheduler shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether tasks are live and shutdown has not begun
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.handles.lock().is_empty()
    }

    /// Run `tick` every `period` until shutdown
    pub fn spawn_loop<F>(&self, loop_name: &'static str, period: Duration, tick: F)
    where
        F: Fn() -> TickFuture + Send + Sync + 'static,
    {
        let token = self.shutdown.clone();
        let events = self.events.clone();
        let owner = self.name;
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            info!(scheduler = owner, loop_name, ?period, "Starting background loop");
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!(scheduler = owner, loop_name, "Tick");
                        let result = tokio::select! {
                            result = tick() => result,
                            _ = token.cancelled() => break,
                        };
                        if let Err(e) = result {
                            error!(scheduler = owner, loop_name, error = %e, "Background loop tick failed");
                            events.publish(CoreEvent::error(format!("{owner}:{loop_name}"), &e));
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }

            info!(scheduler = owner, loop_name, "Background loop stopped");
        });

        self.track(handle);
    }

    /// Run a long-lived task that stops on shutdown
    pub fn spawn_task<Fut>(&self, task_name: &'static str, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let owner = self.name;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = token.cancelled() => {}
            }
            debug!(scheduler = owner, task_name, "Background task stopped");
        });
        self.track(handle);
    }

    /// Keep `handle` for shutdown, dropping handles of tasks that already ended
    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Stop every loop and wait for them to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!(scheduler = self.name, "Scheduler shut down");
    }
}

/// Skip-if-running guard for operations that may be triggered concurrently
#[derive(Debug, Default, Clone)]
pub struct SingleFlight {
    running: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a permit, or `None` if another caller holds one
    pub fn try_begin(&self) -> Option<FlightPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightPermit {
                running: Arc::clone(&self.running),
            })
    }
}

/// Held while a single-flight operation runs
#[derive(Debug)]
pub struct FlightPermit {
    running: Arc<AtomicBool>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
