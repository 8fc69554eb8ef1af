//! Small helpers shared by the stores and background tasks.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;

/// Run a future, converting a panic inside it into `Err(panic_message)`.
///
/// Remote writes in the mutation stores go through this so that an unexpected
/// panic becomes a rollback instead of leaving the optimistic state published.
pub async fn catch_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| {
            if let Some(s) = panic.downcast_ref::<&'static str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            }
        })
}
