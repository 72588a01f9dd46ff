#![forbid(unsafe_code)]

//! Bounded retry used wherever the harness waits for another process to catch
//! up, such as a certificate that is not written yet or a tip that has not
//! propagated.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

/// Returned when the deadline passes before an attempt succeeds.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Error of the last attempt that completed, if any did.
    pub last_error: Option<E>,
    /// Attempts started, including one cut off by the deadline.
    pub attempts: u32,
    /// Time from the first attempt until giving up.
    pub elapsed: Duration,
}

/// Run `attempt` every `interval` until it succeeds or `deadline` elapses.
///
/// Each attempt is itself cut off at the remaining budget, so a hung attempt
/// cannot stretch the call past `deadline`. At least one attempt always runs.
pub async fn retry_until<F, Fut, T, E>(
    interval: Duration,
    deadline: Duration,
    mut attempt: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut last_error = None;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_sub(start.elapsed()).max(Duration::from_millis(1));
        match timeout(remaining, attempt()).await {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) => last_error = Some(e),
            // The attempt itself ran out of budget; keep the previous error.
            Err(_) => {}
        }
        let elapsed = start.elapsed();
        if elapsed + interval > deadline {
            return Err(Exhausted { last_error, attempts, elapsed });
        }
        sleep(interval).await;
    }
}
