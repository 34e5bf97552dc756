//! Supervised background loops
//!
//! A supervised task is restarted whenever it fails, waiting
//! [`RetryPolicy::delay`] between attempts. It never gives up. Cancelling the
//! token stops the task and any pending restart promptly.

use std::future::Future;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{BoxError, RetryPolicy};

/// Spawn `task` under supervision.
///
/// `task` is invoked once per attempt. Returning `Ok(())` ends supervision;
/// returning an error schedules a restart. The backoff resets once an
/// attempt has stayed up for at least `policy.max_delay`.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let result = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("{}: cancelled", name);
                    return;
                }
                result = task() => result,
            };

            match result {
                Ok(()) => {
                    debug!("{}: finished", name);
                    return;
                }
                Err(e) => {
                    if started.elapsed() >= policy.max_delay {
                        attempt = 0;
                    }
                    let delay = policy.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "{}: failed ({}); restarting in {:?} (attempt {})",
                        name, e, delay, attempt
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            debug!("{}: cancelled during backoff", name);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    })
}
