//! Sequential execution of a lazily produced task sequence.

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::{CancellationToken, Fault, Outcome, Task, TaskCompletionSource};
use crate::error::DispatchError;

type TaskSequence = Box<dyn Iterator<Item = Option<Task<()>>> + Send>;

/// Run the tasks produced by `tasks` one after another.
///
/// The next task is only requested from the iterator once the previous one
/// completed successfully, so producers never run ahead. The first faulted or
/// canceled task stops the sequence and its state becomes the result. A
/// `None` element faults the result with [`DispatchError::NullTask`]. When
/// `cancellation` is signaled between elements the result is canceled and
/// the remaining elements are never requested.
pub fn iterate<I, X>(tasks: I, cancellation: Option<CancellationToken>) -> Task<()>
where
    I: IntoIterator<Item = X>,
    I::IntoIter: Send + 'static,
    X: Into<Option<Task<()>>> + 'static,
{
    let source = TaskCompletionSource::new();
    let result = source.task();
    let sequence: TaskSequence = Box::new(
        tasks
            .into_iter()
            .map(|item: X| -> Option<Task<()>> { item.into() }),
    );
    advance(sequence, cancellation, source);
    result
}

fn advance(
    mut sequence: TaskSequence,
    cancellation: Option<CancellationToken>,
    source: TaskCompletionSource<()>,
) {
    loop {
        if cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancellation_requested)
        {
            source.try_set_canceled();
            return;
        }

        let next = match catch_unwind(AssertUnwindSafe(|| sequence.next())) {
            Ok(next) => next,
            Err(payload) => {
                source.try_set_fault(Fault::panicked(payload));
                return;
            }
        };

        let task = match next {
            None => {
                source.try_set_result(());
                return;
            }
            Some(None) => {
                source.try_set_fault(Fault::new(DispatchError::NullTask));
                return;
            }
            Some(Some(task)) => task,
        };

        // Completed tasks are consumed in the loop to keep the stack flat.
        match task.outcome() {
            Some(Outcome::Completed(())) => continue,
            Some(Outcome::Faulted(faults)) => {
                source.try_set_faults(faults);
                return;
            }
            Some(Outcome::Canceled) => {
                source.try_set_canceled();
                return;
            }
            None => {
                task.attach(false, move |outcome| match outcome {
                    Outcome::Completed(()) => advance(sequence, cancellation, source),
                    Outcome::Faulted(faults) => {
                        source.try_set_faults(faults);
                    }
                    Outcome::Canceled => {
                        source.try_set_canceled();
                    }
                });
                return;
            }
        }
    }
}
