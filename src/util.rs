//! Bounded retry and deadline helpers shared by the harness and backends.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

/// A deadline passed before the awaited work finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline of {0:?} elapsed")]
pub struct Elapsed(pub Duration);

/// Failure modes of [`wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("no signal within {0:?}")]
    Elapsed(Duration),
    #[error("signal sender dropped without sending")]
    Closed,
}

/// Runs `check` up to `attempts` times, sleeping `delay` between failures.
///
/// Returns the first success, or the error from the final attempt. There is
/// no sleep after the last failure, so the worst case is
/// `(attempts - 1) * delay` plus the time spent in `check` itself.
pub async fn retry<T, E, F, Fut>(attempts: usize, delay: Duration, mut check: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match check().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => debug!("attempt {}/{} failed: {}", attempt, attempts, e),
        }
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

/// Races `fut` against `duration`.
pub async fn with_timeout<F: Future>(duration: Duration, fut: F) -> Result<F::Output, Elapsed> {
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Elapsed(duration))
}

/// Waits for a one-shot signal, giving up after `duration`.
pub async fn wait_for<T>(signal: oneshot::Receiver<T>, duration: Duration) -> Result<T, WaitError> {
    match tokio::time::timeout(duration, signal).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(WaitError::Closed),
        Err(_) => Err(WaitError::Elapsed(duration)),
    }
}
