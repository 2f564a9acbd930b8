use std::time::Duration;

use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it holds or `timeout_after` elapses.
pub async fn wait_until<F>(
    mut condition: F,
    timeout_after: Duration,
) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout_after;
    loop {
        if condition() {
            return Ok(());
        }

        if Instant::now() >= deadline {
            anyhow::bail!("Condition did not hold within {timeout_after:?}.");
        }

        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_wait_until() {
        let polls = AtomicUsize::new(0);
        wait_until(
            || polls.fetch_add(1, Ordering::Relaxed) >= 3,
            Duration::from_secs(1),
        )
        .await
        .expect("Condition should eventually hold");

        let res = wait_until(|| false, Duration::from_millis(30)).await;
        assert!(res.is_err());
    }
}
