//! Exponential backoff for the long-running watch loops.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Doubling delay with jitter, capped at [`MAX_RETRY_DELAY`].
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff {
            next: INITIAL_RETRY_DELAY,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(MAX_RETRY_DELAY);
        let jitter_cap = (base.as_millis() as u64 / 4).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
    }

    pub fn reset(&mut self) {
        self.next = INITIAL_RETRY_DELAY;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

/// Run `op` until it succeeds, sleeping with exponential backoff between
/// attempts. `notify` observes each failure and the delay before the retry.
/// Background watchers wrap their whole connect-and-consume loop in this.
pub async fn retry_forever<T, E, F, Fut, N>(mut op: F, mut notify: N) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    N: FnMut(&E, Duration),
{
    let mut backoff = Backoff::new();
    loop {
        match op().await {
            Ok(value) => return value,
            Err(err) => {
                let delay = backoff.next_delay();
                notify(&err, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = Backoff::new();
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(first >= INITIAL_RETRY_DELAY);
        assert!(second >= INITIAL_RETRY_DELAY * 2);
        for _ in 0..16 {
            backoff.next_delay();
        }
        assert!(backoff.next_delay() <= MAX_RETRY_DELAY + MAX_RETRY_DELAY / 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let mut attempts = 0;
        let value = retry_forever(
            || {
                attempts += 1;
                let attempt = attempts;
                async move {
                    if attempt < 3 {
                        Err("not yet")
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(value, 3);
    }
}
