//! Bounded retry with a fixed delay.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Failure of a single retry attempt.
#[derive(Debug)]
pub enum RetryError {
    /// Stop retrying immediately; [`with_retry`] reports success.
    Break,
    /// The attempt failed; retry after the delay, surfacing this error if
    /// the attempt budget runs out.
    Error(Error),
}

impl From<Error> for RetryError {
    fn from(e: Error) -> Self {
        Self::Error(e)
    }
}

/// Invoke `f` up to `attempts` times, sleeping `delay` between attempts.
///
/// Returning [`RetryError::Break`] from `f` terminates the loop
/// immediately and propagates success.
pub async fn with_retry<F, Fut>(mut f: F, attempts: u32, delay: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), RetryError>>,
{
    let mut remaining = attempts;
    loop {
        remaining = remaining.saturating_sub(1);
        match f().await {
            Ok(()) | Err(RetryError::Break) => return Ok(()),
            Err(RetryError::Error(err)) => {
                if remaining == 0 {
                    return Err(err);
                }
                warn!("retry (remain {remaining} times) after {delay:?}: {err}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
