/// Utility functions shared by the scan loop, writer and lifecycle
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Duration;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    dt.format(format_description!(
        "[day].[month].[year] - [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| dt.to_string())
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Resolve once a stop has been requested on `stop`.
///
/// A dropped sender counts as a stop request.
pub async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
