use std::time::{Duration, SystemTime};

pub mod clock;
pub mod retry;

pub use clock::{Clock, FakeClock, SystemClock};
pub use retry::{retry_with_policy, Backoff, RetryPolicy};

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_millis() as u64
}

/// Time elapsed between `since_ms` and `now_ms`. Timestamps from the future
/// count as no time elapsed.
pub fn elapsed_since(since_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(since_ms))
}
