use crate::config::RetrySettings;
use std::time::Duration;
use tracing::{error, warn};

/// Calculate the delay for the next retry attempt with exponential backoff.
pub fn next_retry_delay(attempt: usize, base_ms: u64, max_ms: u64) -> Duration {
    let multiplier = 2_u64.saturating_pow(attempt as u32);
    let delay = base_ms.saturating_mul(multiplier);
    // Jitter up to one base delay
    let jitter = rand::random::<u64>() % base_ms.max(1);
    let total = delay.saturating_add(jitter);
    Duration::from_millis(total.min(max_ms))
}

/// Execute a blocking operation with retries.
///
/// `should_continue` is checked before every retry; returning `false` stops
/// retrying and surfaces the last error. Used by pool work items, which must
/// observe cancellation between attempts.
pub fn retry_blocking<T, E, F, C>(
    operation_name: &str,
    settings: RetrySettings,
    mut should_continue: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    C: FnMut() -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation(attempt + 1) {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= settings.max_attempts {
                    error!(
                        "Failed to execute '{}' after {} attempts: {}",
                        operation_name, settings.max_attempts, e
                    );
                    return Err(e);
                }
                if !should_continue() {
                    return Err(e);
                }
                let delay = next_retry_delay(
                    attempt as usize,
                    settings.base_delay_ms,
                    settings.max_delay_ms,
                );
                warn!(
                    "Operation '{}' failed. Retrying in {:?} (Attempt {}/{}): {}",
                    operation_name, delay, attempt, settings.max_attempts, e
                );
                std::thread::sleep(delay);
            }
        }
    }
}
