//! Bounded polling
//!
//! Every wait in a reconciliation pass re-reads OS state until a condition
//! holds, bounded by both a per-step timeout and the pass deadline. Uses
//! tokio's clock so tests can run under a paused runtime.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};

/// Which bound ended a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExpired {
    /// The step's own timeout elapsed
    Step,
    /// The overall pass deadline elapsed
    Deadline,
}

/// Absolute end of a reconciliation pass
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Run `check` until it yields `Some`, re-checking every `interval`
///
/// The check runs once immediately. Returns which bound expired when neither
/// `step_timeout` nor `deadline` leaves room for another check. A check that
/// is still pending when the bound is reached is dropped.
pub async fn poll_until<T, F, Fut>(
    step_timeout: Duration,
    interval: Duration,
    deadline: &Deadline,
    mut check: F,
) -> Result<T, PollExpired>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let step_end = Instant::now() + step_timeout;
    let (end, bound) = if step_end <= deadline.instant() {
        (step_end, PollExpired::Step)
    } else {
        (deadline.instant(), PollExpired::Deadline)
    };

    loop {
        match timeout_at(end, check()).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(_) => return Err(bound),
        }

        let now = Instant::now();
        if now >= end {
            return Err(bound);
        }
        sleep_until((now + interval).min(end)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_condition_holds() {
        let calls = Cell::new(0);
        let deadline = Deadline::after(Duration::from_secs(60));
        let start = Instant::now();

        let value = poll_until(
            Duration::from_secs(3),
            Duration::from_millis(200),
            &deadline,
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { (n == 4).then_some(n) }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 4);
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_is_deterministic() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let start = Instant::now();

        let result: Result<(), _> = poll_until(
            Duration::from_secs(3),
            Duration::from_millis(200),
            &deadline,
            || async { None },
        )
        .await;

        assert_eq!(result, Err(PollExpired::Step));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn pass_deadline_cuts_a_step_short() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let start = Instant::now();

        let result: Result<(), _> = poll_until(
            Duration::from_secs(5),
            Duration::from_millis(300),
            &deadline,
            || async { None },
        )
        .await;

        assert_eq!(result, Err(PollExpired::Deadline));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert!(deadline.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_check_is_cut_off_at_the_step_timeout() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let start = Instant::now();

        let result: Result<(), _> = poll_until(
            Duration::from_secs(2),
            Duration::from_millis(200),
            &deadline,
            || std::future::pending::<Option<()>>(),
        )
        .await;

        assert_eq!(result, Err(PollExpired::Step));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
