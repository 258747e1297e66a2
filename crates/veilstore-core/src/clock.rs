use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch. Saturates to 0 for pre-epoch clocks.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
