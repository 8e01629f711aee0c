//! Fixed retry schedule for webhook deliveries.
//!
//! | Attempt | Delay before it |
//! |---------|-----------------|
//! | 1       | 0               |
//! | 2       | 5 minutes       |
//! | 3       | 30 minutes      |
//! | 4       | 2 hours         |
//! | 5       | 24 hours        |

use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 5;

const DELAYS_SECONDS: [u64; MAX_ATTEMPTS as usize] = [
    0,
    5 * 60,
    30 * 60,
    2 * 60 * 60,
    24 * 60 * 60,
];

/// Delay to wait before running `attempt` (1-based), relative to the
/// previous attempt's outcome. `None` outside `1..=MAX_ATTEMPTS`.
pub fn delay_before_attempt(attempt: u32) -> Option<Duration> {
    if attempt == 0 {
        return None;
    }
    DELAYS_SECONDS
        .get(attempt as usize - 1)
        .map(|secs| Duration::from_secs(*secs))
}
