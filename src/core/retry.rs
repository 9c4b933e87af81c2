//! GT-008: Bounded exponential backoff and completion polling.

use super::error::GantryError;
use super::types::Policy;
use crate::provider::{Completion, Provider, ProviderError, ProviderOutput};
use std::future::Future;
use std::time::Duration;

/// Backoff schedule: `base`, doubling per attempt, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            max_attempts: policy.max_attempts.max(1),
            base: Duration::from_millis(policy.backoff_ms),
            max: Duration::from_millis(policy.max_backoff_ms),
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Polling schedule for long-running operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_polls: u32,
}

impl PollSchedule {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            interval: Duration::from_millis(policy.poll_interval_ms),
            max_polls: policy.max_polls,
        }
    }
}

/// Run a provider call, retrying `Throttled` with backoff.
/// Returns the call's result and the number of attempts made.
pub async fn call_with_retry<T, F, Fut>(backoff: Backoff, mut call: F) -> Result<(T, u32), GantryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(c) => return Ok((c, attempt)),
            Err(ProviderError::Permanent(msg)) => return Err(GantryError::PermanentFailure(msg)),
            Err(ProviderError::Throttled(msg)) => {
                if attempt >= backoff.max_attempts {
                    return Err(GantryError::Throttled {
                        attempts: attempt,
                        message: msg,
                    });
                }
                let delay = backoff.delay(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "throttled, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Wait for a completion, polling the provider while it is in progress.
/// A throttled poll counts as a poll.
pub async fn await_completion(
    provider: &dyn Provider,
    mut completion: Completion,
    schedule: PollSchedule,
) -> Result<ProviderOutput, GantryError> {
    let mut polls = 0;
    loop {
        let token = match completion {
            Completion::Done(output) => return Ok(output),
            Completion::InProgress { token } => token,
        };
        if polls >= schedule.max_polls {
            return Err(GantryError::PermanentFailure(format!(
                "operation {} still in progress after {} poll(s)",
                token, polls
            )));
        }
        tokio::time::sleep(schedule.interval).await;
        polls += 1;
        completion = match provider.poll(&token).await {
            Ok(c) => c,
            Err(ProviderError::Throttled(_)) => Completion::InProgress { token },
            Err(ProviderError::Permanent(msg)) => return Err(GantryError::PermanentFailure(msg)),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> Backoff {
        Backoff {
            max_attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_gt008_delay_doubles_and_caps() {
        let b = Backoff {
            max_attempts: 10,
            base: Duration::from_millis(200),
            max: Duration::from_millis(1000),
        };
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(4), Duration::from_millis(1000));
        assert_eq!(b.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_gt008_from_policy() {
        let b = Backoff::from_policy(&Policy {
            max_attempts: 0,
            ..Policy::default()
        });
        assert_eq!(b.max_attempts, 1);
        assert_eq!(b.base, Duration::from_millis(200));
    }

    fn done() -> Completion {
        Completion::Done(ProviderOutput {
            provider_id: "id".to_string(),
            outputs: Default::default(),
        })
    }

    #[tokio::test]
    async fn test_gt008_retry_until_success() {
        let calls = AtomicU32::new(0);
        let (c, attempts) = call_with_retry(fast(5), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::Throttled("slow down".into()))
            } else {
                Ok(done())
            }
        })
        .await
        .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(c, done());
    }

    #[tokio::test]
    async fn test_gt008_retry_exhausted() {
        let err = call_with_retry(fast(3), || async {
            Err::<Completion, _>(ProviderError::Throttled("slow down".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(
            err,
            GantryError::Throttled {
                attempts: 3,
                message: "slow down".into()
            }
        );
    }

    #[tokio::test]
    async fn test_gt008_permanent_not_retried() {
        let calls = AtomicU32::new(0);
        let err = call_with_retry(fast(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Completion, _>(ProviderError::Permanent("denied".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err, GantryError::PermanentFailure("denied".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gt008_await_completion_polls() {
        use crate::core::types::ResourceType;
        use crate::provider::{LocalCloud, Properties};

        let cloud = LocalCloud::new();
        cloud.complete_after("api", 3);
        let props = Properties::from_iter([("name".to_string(), serde_json::json!("api"))]);

        let pending = cloud.create(ResourceType::HttpApi, "api", &props).await.unwrap();
        let short = PollSchedule {
            interval: Duration::from_millis(1),
            max_polls: 2,
        };
        let err = await_completion(&cloud, pending.clone(), short).await.unwrap_err();
        assert!(err.to_string().contains("still in progress"));

        let pending = cloud.create(ResourceType::HttpApi, "api", &props).await.unwrap();
        let long = PollSchedule {
            interval: Duration::from_millis(1),
            max_polls: 5,
        };
        let out = await_completion(&cloud, pending, long).await.unwrap();
        assert!(out.provider_id.starts_with("api-"));
        assert!(cloud.resource(&out.provider_id).is_some());
    }
}
