//! Exponential backoff for controller loops.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Runs `op` until it returns `Ok`, sleeping between attempts with
/// exponential backoff. Each failure is reported through `notify`
/// before the sleep. Returns `None` when the token fires first.
pub async fn retry_forever<T, E, Op, Notify>(
    token: &CancellationToken,
    backoff: Backoff,
    mut op: Op,
    mut notify: Notify,
) -> Option<T>
where
    Op: AsyncFnMut() -> Result<T, E>,
    Notify: AsyncFnMut(&E),
{
    let mut attempt: u32 = 0;
    loop {
        if token.is_cancelled() {
            return None;
        }
        tokio::select! {
            result = op() => match result {
                Ok(value) => return Some(value),
                Err(err) => {
                    notify(&err).await;
                    let delay = backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return None,
                    }
                }
            },
            _ = token.cancelled() => return None,
        }
    }
}
