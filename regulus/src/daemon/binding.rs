use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::endpoint::{Endpoint, EndpointRegistry};

/// Polls with a linearly growing sleep: after the n-th failed poll the
/// waiter sleeps `backoff_unit * n`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }

    /// Time spent before a container is abandoned.
    pub fn total_wait(&self) -> Duration {
        (1..=self.max_attempts).map(|n| self.backoff(n)).sum()
    }
}

#[derive(Clone, Debug)]
pub enum BindOutcome {
    Bound(Endpoint),
    /// No plugin registration showed up; the container is managed by
    /// something else.
    Abandoned,
    Cancelled,
}

impl BindOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            BindOutcome::Bound(_) => "bound",
            BindOutcome::Abandoned => "abandoned",
            BindOutcome::Cancelled => "cancelled",
        }
    }
}

/// Waits until the plugin has registered an endpoint for the container.
pub async fn wait_for_match(
    registry: &EndpointRegistry,
    container_id: &str,
    plugin_endpoint_id: Option<&str>,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> BindOutcome {
    for attempt in 1..=policy.max_attempts {
        if let Some(ep) = registry.resolve_and_bind(Some(container_id), plugin_endpoint_id) {
            return BindOutcome::Bound(ep);
        }
        let backoff = policy.backoff(attempt);
        debug!(container_id, attempt, ?backoff, "endpoint not registered yet");
        tokio::select! {
            _ = cancel.cancelled() => return BindOutcome::Cancelled,
            _ = tokio::time::sleep(backoff) => {},
        }
    }
    BindOutcome::Abandoned
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::Result;

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(3), Duration::from_secs(3));
        assert_eq!(policy.total_wait(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_after_all_attempts() {
        let registry = EndpointRegistry::new();
        let start = Instant::now();
        let outcome = wait_for_match(
            &registry,
            "c9",
            None,
            RetryPolicy::default(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, BindOutcome::Abandoned));
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_when_registered_mid_wait() -> Result<()> {
        let registry = Arc::new(EndpointRegistry::new());
        let late = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            late.insert(Endpoint::new(None, Some("e1".into())))
        });

        let start = Instant::now();
        let outcome = wait_for_match(
            &registry,
            "c1",
            Some("e1"),
            RetryPolicy::default(),
            &CancellationToken::new(),
        )
        .await;
        let BindOutcome::Bound(ep) = &outcome else {
            panic!("expected a binding, got {}", outcome.label());
        };
        assert_eq!(ep.container_id.as_deref(), Some("c1"));
        // polls at 0s, 1s and 3s
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(registry.get_by_container_id("c1").is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait() {
        let registry = EndpointRegistry::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });
        let outcome =
            wait_for_match(&registry, "c1", None, RetryPolicy::default(), &cancel).await;
        assert!(matches!(outcome, BindOutcome::Cancelled));
    }
}
