//! Cancellation helpers.
//!
//! [`Instance::wait`](crate::Instance::wait) takes a [`CancellationToken`];
//! deadlines are expressed as tokens that cancel themselves.

use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// Child of `parent` that also cancels itself after `timeout`.
///
/// Must be called from within a tokio runtime.
pub fn cancel_after(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(timeout) => {
                tracing::trace!(?timeout, "Deadline reached");
                timer.cancel();
            }
            () = timer.cancelled() => {}
        }
    });
    token
}
