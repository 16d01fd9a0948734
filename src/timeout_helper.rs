use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::fault::ReliableSessionError;

/// Splits one overall timeout across a sequence of steps: each step gets whatever is left of
///  the original budget.
#[derive(Copy, Clone, Debug)]
pub struct TimeoutHelper {
    original: Duration,
    deadline: Instant,
}

impl TimeoutHelper {
    pub fn new(timeout: Duration) -> TimeoutHelper {
        TimeoutHelper {
            original: timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn original(&self) -> Duration {
        self.original
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Runs a step with the remaining budget, turning expiry into a timeout error that names
    ///  the step
    pub async fn run<T, F>(&self, step: &str, f: F) -> Result<T, ReliableSessionError>
    where
        F: Future<Output = Result<T, ReliableSessionError>>,
    {
        match tokio::time::timeout(self.remaining(), f).await {
            Ok(result) => result,
            Err(_) => Err(ReliableSessionError::Timeout(format!("{} did not complete within {:?}", step, self.original))),
        }
    }
}
