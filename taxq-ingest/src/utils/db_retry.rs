//! Lock contention retry
//!
//! SQLite allows one writer at a time. Two consumers applying events for the
//! same record serialize on that lock; the one that loses waits here and runs
//! its whole unit of work again instead of dropping the event.

use std::time::{Duration, Instant};
use taxq_common::{Error, Result};
use tracing::{debug, error, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// Doubling delay, capped at [`MAX_BACKOFF`] and at the remaining budget
struct Backoff {
    started: Instant,
    budget: Duration,
    next: Duration,
}

impl Backoff {
    fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            next: INITIAL_BACKOFF,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    fn next_delay(&mut self) -> Option<Duration> {
        let remaining = self.budget.checked_sub(self.started.elapsed())?;
        if remaining.is_zero() {
            return None;
        }
        let delay = self.next.min(remaining);
        self.next = (self.next * 2).min(MAX_BACKOFF);
        Some(delay)
    }

    fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Run `operation` until it succeeds, fails for a reason other than lock
/// contention, or `max_wait_ms` has passed
///
/// `operation` must be a complete unit of work (its own transaction) so a
/// retry never builds on half of a previous attempt. When the budget runs
/// out the last lock error is returned.
pub async fn retry_on_lock<F, Fut, T>(operation_name: &str, max_wait_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(Duration::from_millis(max_wait_ms));
    let mut attempt = 1u32;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = backoff.elapsed_ms(),
                        "Succeeded after lock retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_lock_contention() => err,
            Err(err) => return Err(err),
        };

        let Some(delay) = backoff.next_delay() else {
            error!(
                operation = operation_name,
                attempt,
                elapsed_ms = backoff.elapsed_ms(),
                max_wait_ms,
                "Giving up on locked database"
            );
            return Err(err);
        };

        warn!(
            operation = operation_name,
            attempt,
            delay_ms = delay.as_millis(),
            "Database locked, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::{ConnectOptions, Connection};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(60));
        let delays: Vec<u64> = (0..9)
            .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
    }

    #[test]
    fn test_zero_budget_never_waits() {
        let mut backoff = Backoff::new(Duration::ZERO);
        assert!(backoff.next_delay().is_none());
    }

    #[tokio::test]
    async fn test_first_success_is_returned() {
        let result = retry_on_lock("test_op", 5000, || async { Ok::<i32, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);

        let result = retry_on_lock("test_op", 5000, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, Error>(Error::NotFound("broker".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waits_out_a_held_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("lock.db"))
            .create_if_missing(true)
            .busy_timeout(Duration::ZERO);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (v INTEGER)").execute(&pool).await.unwrap();

        let mut holder = options.connect().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut holder).await.unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sqlx::query("COMMIT").execute(&mut holder).await.unwrap();
            holder.close().await.unwrap();
        });

        let attempts = AtomicUsize::new(0);
        let result = retry_on_lock("insert", 5000, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let pool = pool.clone();
            async move {
                sqlx::query("INSERT INTO t (v) VALUES (1)")
                    .execute(&pool)
                    .await
                    .map_err(Error::from)
            }
        })
        .await;

        release.await.unwrap();
        assert!(result.is_ok(), "insert failed: {:?}", result.err());
        assert!(attempts.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_gives_up_with_lock_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("lock.db"))
            .create_if_missing(true)
            .busy_timeout(Duration::ZERO);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (v INTEGER)").execute(&pool).await.unwrap();

        let mut holder = options.connect().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut holder).await.unwrap();

        let result = retry_on_lock("insert", 50, || {
            let pool = pool.clone();
            async move {
                sqlx::query("INSERT INTO t (v) VALUES (1)")
                    .execute(&pool)
                    .await
                    .map_err(Error::from)
            }
        })
        .await;

        assert!(result.unwrap_err().is_lock_contention());
        sqlx::query("ROLLBACK").execute(&mut holder).await.unwrap();
    }
}
