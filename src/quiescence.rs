//! Deciding when a stopped worker has gone quiet.
//!
//! The worker never acknowledges `stop`; silence in its output is the only
//! signal that it has finished the line it was on.

use crate::log_buffer::RecentLines;
use std::time::Duration;

/// Wait until `lines` has been silent for at least `silence`.
///
/// Samples every `poll`. Returns immediately when nothing has been logged.
/// Unbounded; wrap in [`tokio::time::timeout`] for an upper limit.
pub async fn await_quiescence(lines: &RecentLines, poll: Duration, silence: Duration) {
    loop {
        match lines.newest_age() {
            None => return,
            Some(age) if age >= silence => return,
            Some(age) => {
                tracing::trace!(age_ms = age.as_millis() as u64, "Worker still producing output");
            }
        }
        tokio::time::sleep(poll).await;
    }
}
