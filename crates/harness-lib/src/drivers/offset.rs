//! PHC steps that are always undone

use crate::error::{HarnessError, Result};
use crate::exec::{ExecOptions, NodeExecutor};
use std::future::Future;
use tracing::warn;

const RESET_ATTEMPTS: u32 = 3;

pub fn phc_adjust_command(device: &str, seconds: f64) -> String {
    format!("phc_ctl {} adjust {}", device, seconds)
}

/// Await `step`, then `restore` whatever the step returned
///
/// A failed restore is never dropped: alone it is the error, together with a
/// failed step both are returned as `Multiple`.
pub async fn with_restore<T, S, R>(step: S, restore: R) -> Result<T>
where
    S: Future<Output = Result<T>>,
    R: Future<Output = Result<()>>,
{
    let outcome = step.await;
    let restored = restore.await;
    match (outcome, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(restore_error)) => Err(restore_error),
        (Err(e), Err(restore_error)) => Err(HarnessError::Multiple(vec![e, restore_error])),
    }
}

/// Step the PHC `device` by `seconds`, run `check`, then step it back
///
/// The step back runs even when `check` fails.
pub async fn step_phc<C, Fut>(executor: &NodeExecutor, node: &str, device: &str, seconds: f64, check: C) -> Result<()>
where
    C: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    executor
        .exec(node, &phc_adjust_command(device, seconds), &ExecOptions::default())
        .await?;

    let reset = async {
        let options = ExecOptions::default()
            .attempts(RESET_ATTEMPTS)
            .retry_on_error(true);
        executor
            .exec(node, &phc_adjust_command(device, -seconds), &options)
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(node = %node, device = %device, error = %e, "Failed to step PHC back");
                e.context("reset PHC offset", node)
            })
    };
    with_restore(check(), reset).await
}
