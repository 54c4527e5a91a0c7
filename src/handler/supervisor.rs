//! Reconnect-with-budget loop around a subscription.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerError;

/// Where a supervised handler currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Subscribed,
    Processing,
    Publishing,
    Failed,
    Backoff,
    Reconnecting,
    Exhausted,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Subscribed => "subscribed",
            Self::Processing => "processing",
            Self::Publishing => "publishing",
            Self::Failed => "failed",
            Self::Backoff => "backoff",
            Self::Reconnecting => "reconnecting",
            Self::Exhausted => "exhausted",
        };
        write!(f, "{label}")
    }
}

/// Shared view of a handler's [`HandlerState`]; handlers update it while
/// working on a message, the supervisor while reconnecting.
#[derive(Debug, Clone)]
pub struct StateHandle {
    handler: Arc<str>,
    state: Arc<Mutex<HandlerState>>,
}

impl StateHandle {
    #[must_use]
    pub fn new(handler: &str) -> Self {
        Self {
            handler: Arc::from(handler),
            state: Arc::new(Mutex::new(HandlerState::Idle)),
        }
    }

    pub fn enter(&self, next: HandlerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(handler = %self.handler, from = %*state, to = %next, "handler state");
            *state = next;
        }
    }

    #[must_use]
    pub fn get(&self) -> HandlerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Retry discipline of a supervised handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Reconnections allowed before giving up.
    pub retry_budget: u32,
    /// Fixed pause before each reconnection.
    pub retry_timeout: Duration,
    /// An attempt that lasted longer than this restores the full budget.
    pub reset_after: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            retry_budget: 5,
            retry_timeout: Duration::from_secs(3),
            reset_after: Duration::from_secs(60),
        }
    }
}

/// A supervised handler gave up. Fatal for the hosting process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("handler '{handler}' gave up after {attempts} attempts: {last}")]
    Exhausted {
        handler: String,
        attempts: u32,
        #[source]
        last: BrokerError,
    },

    #[error("handler task crashed: {reason}")]
    Crashed { reason: String },
}

/// Restarts a subscription after broker failures, within a retry budget.
#[derive(Debug)]
pub struct Supervisor {
    name: String,
    settings: SupervisorSettings,
    remaining: u32,
    attempts: u32,
    state: StateHandle,
}

impl Supervisor {
    #[must_use]
    pub fn new(name: impl Into<String>, settings: SupervisorSettings) -> Self {
        let name = name.into();
        Self {
            state: StateHandle::new(&name),
            name,
            remaining: settings.retry_budget,
            attempts: 0,
            settings,
        }
    }

    #[must_use]
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Reconnections left before the next failure becomes fatal.
    #[must_use]
    pub fn remaining_budget(&self) -> u32 {
        self.remaining
    }

    /// Attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Runs `subscribe` until it returns `Ok`, reconnecting after every error.
    ///
    /// Each failure spends one unit of budget and waits `retry_timeout`
    /// before the next attempt. A failed attempt that had been running for
    /// longer than `reset_after` first restores the full budget, so only
    /// bursts of quick failures can exhaust it.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Exhausted`] with the last broker error once
    /// a failure occurs with no budget left.
    pub async fn run<F, Fut>(&mut self, mut subscribe: F) -> Result<(), SupervisorError>
    where
        F: FnMut(StateHandle) -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        loop {
            self.attempts += 1;
            let started = Instant::now();
            self.state.enter(HandlerState::Subscribed);

            let error = match subscribe(self.state.clone()).await {
                Ok(()) => {
                    self.state.enter(HandlerState::Idle);
                    info!(handler = %self.name, "subscription finished");
                    return Ok(());
                }
                Err(error) => error,
            };

            self.state.enter(HandlerState::Failed);
            if started.elapsed() > self.settings.reset_after {
                debug!(handler = %self.name, "long-lived attempt, retry budget restored");
                self.remaining = self.settings.retry_budget;
            }

            if self.remaining == 0 {
                self.state.enter(HandlerState::Exhausted);
                error!(
                    handler = %self.name,
                    attempts = self.attempts,
                    error = %error,
                    "retry budget exhausted"
                );
                return Err(SupervisorError::Exhausted {
                    handler: self.name.clone(),
                    attempts: self.attempts,
                    last: error,
                });
            }

            self.remaining -= 1;
            warn!(
                handler = %self.name,
                error = %error,
                remaining = self.remaining,
                delay_ms = self.settings.retry_timeout.as_millis(),
                "subscription failed, reconnecting"
            );
            self.state.enter(HandlerState::Backoff);
            tokio::time::sleep(self.settings.retry_timeout).await;
            self.state.enter(HandlerState::Reconnecting);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    fn settings(budget: u32) -> SupervisorSettings {
        SupervisorSettings {
            retry_budget: budget,
            retry_timeout: Duration::from_secs(3),
            reset_after: Duration::from_secs(60),
        }
    }

    fn failure() -> BrokerError {
        BrokerError::consuming("T", "connection lost")
    }

    type Attempt = std::pin::Pin<Box<dyn Future<Output = Result<(), BrokerError>>>>;

    /// Each entry is how long the attempt runs before it fails.
    fn scripted(script: Vec<Duration>) -> impl FnMut(StateHandle) -> Attempt {
        let mut script: VecDeque<Duration> = script.into();
        move |_state| -> Attempt {
            let step = script.pop_front();
            Box::pin(async move {
                match step {
                    Some(lifetime) => {
                        tokio::time::sleep(lifetime).await;
                        Err(failure())
                    }
                    None => Ok(()),
                }
            })
        }
    }

    // ==================== Budget ====================

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let mut supervisor = Supervisor::new("h", settings(3));

        supervisor
            .run(scripted(vec![Duration::ZERO, Duration::ZERO]))
            .await
            .unwrap();

        assert_eq!(supervisor.attempts(), 3);
        assert_eq!(supervisor.remaining_budget(), 1);
        assert_eq!(supervisor.state().get(), HandlerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_failures_exhaust_budget_with_fixed_sleeps() {
        let mut supervisor = Supervisor::new("h", settings(2));
        let started = Instant::now();

        let error = supervisor
            .run(scripted(vec![Duration::ZERO; 10]))
            .await
            .unwrap_err();

        assert_eq!(supervisor.attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(supervisor.state().get(), HandlerState::Exhausted);
        match error {
            SupervisorError::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, failure());
            }
            other @ SupervisorError::Crashed { .. } => panic!("unexpected {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_fails_on_first_error() {
        let mut supervisor = Supervisor::new("h", settings(0));

        let result = supervisor.run(scripted(vec![Duration::ZERO])).await;

        assert!(result.is_err());
        assert_eq!(supervisor.attempts(), 1);
    }

    // ==================== Reset ====================

    #[tokio::test(start_paused = true)]
    async fn test_long_lived_attempt_restores_full_budget() {
        let mut supervisor = Supervisor::new("h", settings(1));

        // quick failure spends the only retry; the next attempt lives 61s,
        // which restores the budget before its failure is counted.
        let error = supervisor
            .run(scripted(vec![
                Duration::ZERO,
                Duration::from_secs(61),
                Duration::ZERO,
                Duration::ZERO,
            ]))
            .await
            .unwrap_err();

        assert!(matches!(error, SupervisorError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_of_exactly_reset_window_does_not_restore() {
        let mut supervisor = Supervisor::new("h", settings(1));

        let error = supervisor
            .run(scripted(vec![
                Duration::ZERO,
                Duration::from_secs(60),
                Duration::ZERO,
            ]))
            .await
            .unwrap_err();

        assert!(matches!(error, SupervisorError::Exhausted { attempts: 2, .. }));
    }

    // ==================== State ====================

    #[test]
    fn test_state_handle_shared_between_clones() {
        let state = StateHandle::new("h");
        let other = state.clone();

        other.enter(HandlerState::Processing);

        assert_eq!(state.get(), HandlerState::Processing);
        assert_eq!(HandlerState::Backoff.to_string(), "backoff");
    }
}
