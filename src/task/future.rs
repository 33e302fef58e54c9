//! Bridge from tasks to `std::future::Future`.
//!
//! The runtime never relies on this; it lets async code await a task.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

use super::{Task, TaskError};

/// Future returned by `Task::into_future`.
pub struct TaskFuture<T> {
    task: Task<T>,
    waker: Option<Arc<AtomicWaker>>,
}

impl<T> Future for TaskFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.task.outcome() {
            return Poll::Ready(outcome.into_result());
        }

        match &self.waker {
            Some(waker) => waker.register(cx.waker()),
            None => {
                let waker = Arc::new(AtomicWaker::new());
                waker.register(cx.waker());
                let wake = waker.clone();
                self.task.attach(true, move |_| wake.wake());
                self.waker = Some(waker);
            }
        }

        match self.task.outcome() {
            Some(outcome) => Poll::Ready(outcome.into_result()),
            None => Poll::Pending,
        }
    }
}

impl<T> IntoFuture for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, TaskError>;
    type IntoFuture = TaskFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        TaskFuture {
            task: self,
            waker: None,
        }
    }
}
