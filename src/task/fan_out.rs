//! Fan-out helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Outcome, Task, TaskCompletionSource};

/// Wait for every task and collect their results in input order.
///
/// Faults from all tasks are aggregated in input order. If none faulted but
/// at least one was canceled, the result is canceled. An empty input
/// completes immediately.
pub fn when_all<T>(tasks: Vec<Task<T>>) -> Task<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    if tasks.is_empty() {
        return Task::from_result(Vec::new());
    }

    let source = TaskCompletionSource::new();
    let result = source.task();
    let outcomes: Arc<Mutex<Vec<Option<Outcome<T>>>>> =
        Arc::new(Mutex::new(vec![None; tasks.len()]));
    let remaining = Arc::new(AtomicUsize::new(tasks.len()));

    for (index, task) in tasks.into_iter().enumerate() {
        let outcomes = outcomes.clone();
        let remaining = remaining.clone();
        let source = source.clone();
        task.attach(true, move |outcome| {
            outcomes.lock()[index] = Some(outcome);
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let collected = std::mem::take(&mut *outcomes.lock());
                source.try_complete(combine(collected));
            }
        });
    }

    result
}

fn combine<T>(outcomes: Vec<Option<Outcome<T>>>) -> Outcome<Vec<T>> {
    let mut values = Vec::with_capacity(outcomes.len());
    let mut faults = Vec::new();
    let mut canceled = false;

    for outcome in outcomes.into_iter().flatten() {
        match outcome {
            Outcome::Completed(value) => values.push(value),
            Outcome::Faulted(mut f) => faults.append(&mut f),
            Outcome::Canceled => canceled = true,
        }
    }

    if !faults.is_empty() {
        Outcome::Faulted(faults)
    } else if canceled {
        Outcome::Canceled
    } else {
        Outcome::Completed(values)
    }
}
