//! Limiter combining several limiters.

use async_trait::async_trait;

use super::limiter::{Limiter, RateLimit};
use crate::error::{Result, ThrottleError};

/// Consumes from every inner limiter and reports the most restrictive result:
/// the first rejection, or else the acceptance with the fewest tokens left.
pub struct CompoundLimiter {
    limiters: Vec<Box<dyn Limiter>>,
}

impl CompoundLimiter {
    /// Create a compound limiter. At least one limiter is required.
    pub fn new(limiters: Vec<Box<dyn Limiter>>) -> Result<Self> {
        if limiters.is_empty() {
            return Err(ThrottleError::InvalidArgument(
                "a compound limiter needs at least one limiter".to_string(),
            ));
        }
        Ok(Self { limiters })
    }

    /// Number of inner limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

/// Whether `candidate` is more restrictive than `current`.
fn more_restrictive(candidate: &RateLimit, current: &RateLimit) -> bool {
    match (candidate.accepted, current.accepted) {
        (false, true) => true,
        (_, false) => false,
        (true, true) => candidate.available_tokens < current.available_tokens,
    }
}

#[async_trait]
impl Limiter for CompoundLimiter {
    async fn consume(&mut self, tokens: u32) -> Result<RateLimit> {
        let mut strictest: Option<RateLimit> = None;

        for limiter in self.limiters.iter_mut() {
            let limit = limiter.consume(tokens).await?;
            strictest = match strictest {
                Some(current) if !more_restrictive(&limit, &current) => Some(current),
                _ => Some(limit),
            };
        }

        strictest.ok_or_else(|| {
            ThrottleError::InvalidArgument("a compound limiter needs at least one limiter".to_string())
        })
    }

    async fn reset(&mut self) -> Result<()> {
        for limiter in self.limiters.iter_mut() {
            limiter.reset().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ratelimit::NoLimiter;

    /// Returns a fixed answer.
    struct Fixed(RateLimit);

    #[async_trait]
    impl Limiter for Fixed {
        async fn consume(&mut self, _tokens: u32) -> Result<RateLimit> {
            Ok(self.0.clone())
        }

        async fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn limit(available: u32, accepted: bool, retry_secs: u64) -> RateLimit {
        RateLimit {
            available_tokens: available,
            retry_after: Duration::from_secs(retry_secs),
            accepted,
            limit: 10,
        }
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(CompoundLimiter::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_reports_fewest_remaining() {
        let mut compound = CompoundLimiter::new(vec![
            Box::new(Fixed(limit(7, true, 0))),
            Box::new(Fixed(limit(2, true, 0))),
            Box::new(NoLimiter),
        ])
        .unwrap();

        let result = compound.consume(1).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.available_tokens, 2);
    }

    #[tokio::test]
    async fn test_rejection_wins() {
        let mut compound = CompoundLimiter::new(vec![
            Box::new(Fixed(limit(0, true, 0))),
            Box::new(Fixed(limit(5, false, 3))),
            Box::new(Fixed(limit(1, false, 9))),
        ])
        .unwrap();

        let result = compound.consume(1).await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.retry_after, Duration::from_secs(3));
    }
}
