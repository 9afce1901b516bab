//! # Timer Scheduler
//!
//! Independent periodic timers (poll, eviction, batch flush, heartbeat) that feed tick events
//! into the bridge actor's queue. Every timer hangs off one root `CancellationToken`, so a
//! single [`Scheduler::shutdown`] stops all of them; each timer can also be stopped on its own
//! through the child token returned when it was started.
//!
//! Timers never wait on the actor: a tick that finds the actor's queue full is skipped, and
//! missed ticks are not bursted afterwards.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// What a timer asks the actor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    Poll,
    Evict,
    Flush,
    Heartbeat,
}

/// # Scheduler
pub struct Scheduler {
    root: CancellationToken,
    tx: mpsc::Sender<TimerEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(tx: mpsc::Sender<TimerEvent>) -> Self {
        Self { root: CancellationToken::new(), tx, tasks: Vec::new() }
    }

    /// Starts a timer that emits `event` every `period`, first after one full period.
    pub fn every(&mut self, period: Duration, event: TimerEvent) -> CancellationToken {
        let token = self.root.child_token();
        let task_token = token.clone();
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        match tx.try_send(event) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                trace!(?event, "Actor busy, timer tick skipped");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
            debug!(?event, "Timer stopped");
        });

        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(handle);
        token
    }

    /// Timers still running.
    pub fn active(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Cancels every timer and waits for their tasks to exit.
    pub async fn shutdown(&mut self) {
        self.root.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timers_tick_independently() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut scheduler = Scheduler::new(tx);
        scheduler.every(Duration::from_millis(100), TimerEvent::Flush);
        scheduler.every(Duration::from_millis(250), TimerEvent::Poll);

        tokio::time::sleep(Duration::from_millis(520)).await;
        let mut flushes = 0;
        let mut polls = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                TimerEvent::Flush => flushes += 1,
                TimerEvent::Poll => polls += 1,
                _ => {}
            }
        }
        assert_eq!(flushes, 5);
        assert_eq!(polls, 2);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_every_timer() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut scheduler = Scheduler::new(tx);
        scheduler.every(Duration::from_millis(10), TimerEvent::Heartbeat);
        scheduler.every(Duration::from_millis(10), TimerEvent::Evict);
        scheduler.shutdown().await;
        assert_eq!(scheduler.active(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_can_be_cancelled() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut scheduler = Scheduler::new(tx);
        let poll = scheduler.every(Duration::from_millis(10), TimerEvent::Poll);
        scheduler.every(Duration::from_millis(10), TimerEvent::Evict);
        poll.cancel();

        tokio::time::sleep(Duration::from_millis(35)).await;
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| *e == TimerEvent::Evict));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_skips_ticks() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut scheduler = Scheduler::new(tx);
        scheduler.every(Duration::from_millis(10), TimerEvent::Flush);
        tokio::time::sleep(Duration::from_millis(55)).await;
        assert_eq!(rx.try_recv().ok(), Some(TimerEvent::Flush));
        assert!(rx.try_recv().is_err());
        scheduler.shutdown().await;
    }
}
