pub(crate) const STORE_READ_ATTEMPTS: u32 = 3;
pub(crate) const STORE_READ_RETRY_DELAY_MS: u64 = 3_000;

/// Re-evaluates `$operation` (a future-producing expression) until it succeeds
/// or `STORE_READ_ATTEMPTS` is reached, returning the last error.
macro_rules! retry_store_read {
    ($context:expr, $operation:expr) => {{
        let description: String = $context.into();
        let mut attempt: u32 = 1;

        loop {
            match ($operation).await {
                Ok(rows) => {
                    if attempt > 1 {
                        log::info!("{} succeeded on attempt {}", description, attempt);
                    }
                    break Ok(rows);
                }
                Err(err) if attempt >= $crate::retry::STORE_READ_ATTEMPTS => {
                    log::error!(
                        "{} failed after {} attempts: {}",
                        description,
                        attempt,
                        err
                    );
                    break Err(err);
                }
                Err(err) => {
                    log::warn!(
                        "{} failed (attempt {}/{}): {}",
                        description,
                        attempt,
                        $crate::retry::STORE_READ_ATTEMPTS,
                        err
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        $crate::retry::STORE_READ_RETRY_DELAY_MS * u64::from(attempt),
                    ))
                    .await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_store_read;
