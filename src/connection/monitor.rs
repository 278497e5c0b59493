//! Reconnect state machine and the background monitor that drives it.
//!
//! The transition table lives in [`ReconnectMachine`], a plain struct with no
//! timing or I/O so it can be tested directly. [`Monitor`] owns one machine,
//! feeds it events from the notification channel and a periodic tick, and runs
//! the retry sequence when the machine asks for it.
//!
//! ```text
//!            Success                    Failure / Tick
//!   ┌───────────────────┐      ┌──────────────────────────┐
//!   ▼                   │      │                          ▼
//! Connected ──Failure──► Degraded ──miss >= allowed──► Retrying
//!   ▲                                                     │
//!   └──────────────── redial ok ──────────────────────────┤
//!                                                         │ budget spent
//!                                                         ▼
//!                                                   Unrecoverable
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::StoreError;
use crate::metrics;

/// Health of the link to the store as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Degraded,
    /// A reconnect sequence is in progress.
    Retrying,
    /// The reconnect budget was spent. Terminal.
    Unrecoverable,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
            LinkState::Retrying => "retrying",
            LinkState::Unrecoverable => "unrecoverable",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection was handed out successfully.
    Success,
    /// Acquiring or using a connection failed at the transport level.
    Failure,
    /// The monitor woke without any notification.
    Tick,
}

/// What the monitor must do after feeding an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    None,
    Reconnect,
}

/// Pure transition table for the reconnect monitor.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: LinkState,
    miss_count: u32,
    allowed_miss_count: u32,
    failure_penalty: u32,
}

impl ReconnectMachine {
    pub fn new(policy: &ReconnectPolicy, initial: LinkState) -> Self {
        Self {
            state: initial,
            miss_count: 0,
            allowed_miss_count: policy.allowed_miss_count,
            failure_penalty: policy.failure_penalty,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    /// Applies one event and reports whether a reconnect sequence must start.
    ///
    /// Events are ignored while a sequence runs and after the link is lost.
    pub fn on_event(&mut self, event: LinkEvent) -> MonitorAction {
        if matches!(self.state, LinkState::Retrying | LinkState::Unrecoverable) {
            return MonitorAction::None;
        }

        match event {
            LinkEvent::Success => {
                self.state = LinkState::Connected;
                self.miss_count = 0;
                return MonitorAction::None;
            }
            LinkEvent::Failure => {
                self.state = LinkState::Degraded;
                self.miss_count = self.miss_count.saturating_add(self.failure_penalty);
            }
            LinkEvent::Tick => {
                self.miss_count = self.miss_count.saturating_add(1);
            }
        }

        if self.miss_count < self.allowed_miss_count {
            return MonitorAction::None;
        }

        self.miss_count = 0;
        if self.state == LinkState::Connected {
            return MonitorAction::None;
        }

        self.state = LinkState::Retrying;
        MonitorAction::Reconnect
    }

    /// Records that the retry sequence re-established the link.
    pub fn on_reconnected(&mut self) {
        self.state = LinkState::Connected;
        self.miss_count = 0;
    }

    /// Records that the retry sequence spent its budget.
    pub fn on_exhausted(&mut self) {
        self.state = LinkState::Unrecoverable;
    }
}

/// Something that can re-establish the store link.
#[async_trait]
pub trait Redial: Send + Sync {
    async fn redial(&self) -> Result<(), StoreError>;
}

/// Result of one retry sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Delay slept before each attempt, in order.
    pub delays: Vec<Duration>,
    pub recovered: bool,
}

/// Runs the bounded reconnect loop.
///
/// Attempt `i` (1-based) sleeps `policy.backoff_delay(i)` and then redials.
/// Stops at the first success.
pub async fn run_retry_sequence<R>(policy: &ReconnectPolicy, redial: &R) -> RetryOutcome
where
    R: Redial + ?Sized,
{
    let mut delays = Vec::with_capacity(policy.max_attempts as usize);

    for attempt in 1..=policy.max_attempts {
        let delay = policy.backoff_delay(attempt);
        tokio::time::sleep(delay).await;
        delays.push(delay);
        metrics::record_reconnect_attempt();

        match redial.redial().await {
            Ok(()) => {
                info!(attempt, "Store connection re-established");
                return RetryOutcome {
                    attempts: attempt,
                    delays,
                    recovered: true,
                };
            }
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store reconnect attempt failed"
                );
            }
        }
    }

    error!(
        attempts = policy.max_attempts,
        "Store reconnect budget exhausted"
    );
    RetryOutcome {
        attempts: policy.max_attempts,
        delays,
        recovered: false,
    }
}

/// The single background task that owns the reconnect state.
pub(crate) struct Monitor<R: ?Sized> {
    machine: ReconnectMachine,
    policy: ReconnectPolicy,
    events: mpsc::Receiver<LinkEvent>,
    status: watch::Sender<LinkState>,
    redial: Arc<R>,
    shutdown: broadcast::Receiver<()>,
}

impl<R> Monitor<R>
where
    R: Redial + ?Sized + 'static,
{
    pub(crate) fn new(
        policy: ReconnectPolicy,
        initial: LinkState,
        events: mpsc::Receiver<LinkEvent>,
        status: watch::Sender<LinkState>,
        redial: Arc<R>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            machine: ReconnectMachine::new(&policy, initial),
            policy,
            events,
            status,
            redial,
            shutdown,
        }
    }

    /// Runs until shutdown, until every notifier is gone, or until the link is
    /// declared unrecoverable.
    pub(crate) async fn run(mut self) -> Result<(), StoreError> {
        let period = self.policy.tick_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.publish();

        loop {
            let event = tokio::select! {
                _ = self.shutdown.recv() => {
                    debug!("Connection monitor shutting down");
                    return Ok(());
                }
                received = self.events.recv() => match received {
                    Some(event) => event,
                    None => return Ok(()),
                },
                _ = ticker.tick() => LinkEvent::Tick,
            };

            // Any wake restarts the tick period.
            ticker.reset();

            if self.machine.on_event(event) == MonitorAction::Reconnect {
                self.publish();

                let outcome = tokio::select! {
                    _ = self.shutdown.recv() => {
                        debug!("Connection monitor shutting down during reconnect");
                        return Ok(());
                    }
                    outcome = run_retry_sequence(&self.policy, self.redial.as_ref()) => outcome,
                };

                // Notifications queued during the outage are stale.
                while self.events.try_recv().is_ok() {}

                if !outcome.recovered {
                    self.machine.on_exhausted();
                    self.publish();
                    return Err(StoreError::Unrecoverable {
                        attempts: outcome.attempts,
                    });
                }

                self.machine.on_reconnected();
                ticker.reset();
            }

            self.publish();
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        let changed = self.status.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            info!(state = %state, "Store link state changed");
        }
        metrics::record_link_state(state);
    }
}
