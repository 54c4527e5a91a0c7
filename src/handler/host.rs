use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use super::{Supervisor, SupervisorError, SupervisorSettings, TopicSubscription};

/// Runs a set of subscriptions, each on its own task under its own
/// [`Supervisor`].
///
/// Every subscription is started immediately: a subscription that is not
/// running has no queue bound to its topic, and messages published there
/// would be dropped. The first subscription that exhausts its retry budget
/// stops the whole host; the caller is expected to exit with a failure
/// status.
#[derive(Debug, Clone, Copy)]
pub struct HandlerHost {
    settings: SupervisorSettings,
}

impl HandlerHost {
    #[must_use]
    pub fn new(settings: SupervisorSettings) -> Self {
        Self { settings }
    }

    /// Runs until every subscription has finished or one has given up.
    ///
    /// # Errors
    ///
    /// Returns the first [`SupervisorError`]; the remaining subscriptions
    /// are aborted.
    #[instrument(skip_all, fields(subscriptions = subscriptions.len()))]
    pub async fn run(self, subscriptions: Vec<TopicSubscription>) -> Result<(), SupervisorError> {
        let mut tasks = JoinSet::new();

        for subscription in subscriptions {
            let settings = self.settings;
            tasks.spawn(async move {
                info!(handler = %subscription.name, topic = subscription.topic, "starting handler");
                let mut supervisor = Supervisor::new(subscription.name.clone(), settings);
                supervisor.run(|state| (subscription.run)(state)).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join_error) => SupervisorError::Crashed {
                    reason: join_error.to_string(),
                },
            };
            error!(error = %failure, "handler stopped for good, shutting down");
            tasks.abort_all();
            return Err(failure);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::broker::BrokerError;
    use crate::handler::{StateHandle, SubscriptionFactory, SubscriptionFuture};

    fn subscription(name: &str, factory: SubscriptionFactory) -> TopicSubscription {
        TopicSubscription {
            name: name.to_string(),
            topic: "T",
            run: factory,
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            retry_budget: 2,
            retry_timeout: Duration::from_secs(1),
            reset_after: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_returns_when_all_subscriptions_finish() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let factory: SubscriptionFactory = Arc::new(move |_state: StateHandle| -> SubscriptionFuture {
            counted.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });

        HandlerHost::new(settings())
            .run(vec![
                subscription("a", Arc::clone(&factory)),
                subscription("b", factory),
            ])
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_subscription_stops_host() {
        let failing: SubscriptionFactory = Arc::new(|_state: StateHandle| -> SubscriptionFuture {
            Box::pin(async { Err(BrokerError::connecting("down")) })
        });
        let forever: SubscriptionFactory = Arc::new(|_state: StateHandle| -> SubscriptionFuture {
            Box::pin(std::future::pending())
        });

        let error = HandlerHost::new(settings())
            .run(vec![subscription("bad", failing), subscription("good", forever)])
            .await
            .unwrap_err();

        match error {
            SupervisorError::Exhausted { handler, attempts, .. } => {
                assert_eq!(handler, "bad");
                assert_eq!(attempts, 3);
            }
            other @ SupervisorError::Crashed { .. } => panic!("unexpected {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_long_lived_subscription_is_started() {
        let started = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&started);
        let factory: SubscriptionFactory = Arc::new(move |_state: StateHandle| -> SubscriptionFuture {
            counted.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::pending())
        });
        let subscriptions = (0..8)
            .map(|i| subscription(&format!("s{i}"), Arc::clone(&factory)))
            .collect();

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            HandlerHost::new(settings()).run(subscriptions),
        )
        .await;

        assert!(outcome.is_err(), "host must keep running");
        assert_eq!(started.load(Ordering::SeqCst), 8);
    }
}
