//! Concurrent fan-out over the peripheral registry.
//!
//! Two aggregation policies are used by the bus master and kept deliberately
//! separate:
//!
//! - [`collect_outcomes`] isolates failures: every task runs to completion and its
//!   result is reported in input order, whether it succeeded or not.
//! - [`fail_fast`] propagates the first fault as soon as it happens and drops the
//!   tasks still in flight.
//!
//! [`first_fault`] escalates an already collected set of outcomes.
//!
//! All tasks are polled concurrently on the calling task; nothing is spawned.

use futures::future::{join_all, try_join_all};
use std::future::Future;

/// Result of one peripheral operation inside a fan-out.
pub type Outcome<T> = anyhow::Result<T>;

/// Run every task concurrently and keep each result, in input order.
pub async fn collect_outcomes<I, F, T, E>(tasks: I) -> Vec<Result<T, E>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    join_all(tasks).await
}

/// Run every task concurrently; the first failure fails the whole call.
pub async fn fail_fast<I, F, T, E>(tasks: I) -> Result<Vec<T>, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    try_join_all(tasks).await
}

/// Turn collected outcomes into all successes, or the first failure and its index.
pub fn first_fault<T, E>(outcomes: Vec<Result<T, E>>) -> Result<Vec<T>, (usize, E)> {
    outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| outcome.map_err(|e| (index, e)))
        .collect()
}
