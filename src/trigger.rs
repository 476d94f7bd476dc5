//! Completion triggers decide when the accumulated window is scored.
//!
//! Ingestion calls [`CompletionTrigger::on_reading`] for every accepted
//! reading; the processing loop awaits [`CompletionTrigger::wait_for_ready`].
//! Fires that happen while a cycle is running coalesce into one pending
//! fire, so the next cycle picks up everything accumulated in between.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::config::TriggerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Count,
    Quiescence,
    Periodic,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Count => "count",
            TriggerKind::Quiescence => "quiescence",
            TriggerKind::Periodic => "periodic",
        }
    }
}

/// The single event every strategy produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyToScore {
    pub kind: TriggerKind,
    pub at: DateTime<Utc>,
}

impl ReadyToScore {
    fn now(kind: TriggerKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CompletionTrigger: Send + Sync {
    /// Observes one accepted reading. Must not block.
    fn on_reading(&self);

    /// Suspends until the window is ready to score.
    async fn wait_for_ready(&self) -> ReadyToScore;

    fn kind(&self) -> TriggerKind;
}

/// Builds the strategy named by the configuration.
pub fn from_config(config: &TriggerConfig) -> Box<dyn CompletionTrigger> {
    match *config {
        TriggerConfig::Count { threshold } => Box::new(CountTrigger::new(threshold)),
        TriggerConfig::Quiescence { idle_seconds } => {
            Box::new(QuiescenceTrigger::new(Duration::from_secs(idle_seconds)))
        }
        TriggerConfig::Periodic { interval_seconds } => {
            Box::new(PeriodicTrigger::new(Duration::from_secs(interval_seconds)))
        }
    }
}

/// Fires after every `threshold` readings.
pub struct CountTrigger {
    threshold: usize,
    seen: AtomicUsize,
    ready: Notify,
}

impl CountTrigger {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            seen: AtomicUsize::new(0),
            ready: Notify::new(),
        }
    }

    /// Readings observed since the last fire.
    pub fn pending(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionTrigger for CountTrigger {
    fn on_reading(&self) {
        let threshold = self.threshold;
        // fetch_update always succeeds because the closure returns Some.
        let previous = self
            .seen
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(if n + 1 >= threshold { 0 } else { n + 1 })
            })
            .unwrap_or_default();

        if previous + 1 >= threshold {
            debug!(threshold, "Reading count threshold reached");
            self.ready.notify_one();
        }
    }

    async fn wait_for_ready(&self) -> ReadyToScore {
        self.ready.notified().await;
        ReadyToScore::now(TriggerKind::Count)
    }

    fn kind(&self) -> TriggerKind {
        TriggerKind::Count
    }
}

/// Fires once no reading has arrived for `idle`, after at least one reading.
pub struct QuiescenceTrigger {
    idle: Duration,
    last_reading: Mutex<Option<Instant>>,
    activity: Notify,
}

impl QuiescenceTrigger {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            last_reading: Mutex::new(None),
            activity: Notify::new(),
        }
    }

    fn last(&self) -> Option<Instant> {
        *self
            .last_reading
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Disarms the trigger if no reading arrived after `seen`.
    fn try_fire(&self, seen: Instant) -> bool {
        let mut last = self
            .last_reading
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == Some(seen) {
            *last = None;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl CompletionTrigger for QuiescenceTrigger {
    fn on_reading(&self) {
        *self
            .last_reading
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
        self.activity.notify_one();
    }

    async fn wait_for_ready(&self) -> ReadyToScore {
        loop {
            let Some(seen) = self.last() else {
                // Nothing observed yet: sleep until the first reading.
                self.activity.notified().await;
                continue;
            };

            tokio::select! {
                _ = self.activity.notified() => continue,
                _ = tokio::time::sleep_until(seen + self.idle) => {
                    if self.try_fire(seen) {
                        debug!(idle_secs = self.idle.as_secs(), "Readings quiesced");
                        return ReadyToScore::now(TriggerKind::Quiescence);
                    }
                }
            }
        }
    }

    fn kind(&self) -> TriggerKind {
        TriggerKind::Quiescence
    }
}

/// Fires on a fixed interval regardless of reading volume. The first fire
/// is immediate.
pub struct PeriodicTrigger {
    ticker: tokio::sync::Mutex<Interval>,
}

impl PeriodicTrigger {
    /// Must be called inside a tokio runtime.
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker: tokio::sync::Mutex::new(ticker),
        }
    }
}

#[async_trait]
impl CompletionTrigger for PeriodicTrigger {
    fn on_reading(&self) {}

    async fn wait_for_ready(&self) -> ReadyToScore {
        self.ticker.lock().await.tick().await;
        ReadyToScore::now(TriggerKind::Periodic)
    }

    fn kind(&self) -> TriggerKind {
        TriggerKind::Periodic
    }
}
