//! Handler traits.
//!
//! Handlers never block. They return a [`Task`] that completes when the
//! work is done, composing any nested work with the task combinators.

use std::sync::Arc;

use crate::request::Request;
use crate::task::Task;

/// Handles one command type and produces a result.
pub trait CommandHandler: Send + Sync + 'static {
    type Command: Send + Sync + 'static;
    /// `Default` supplies the result of an aborted dispatch.
    type Output: Clone + Default + Send + Sync + 'static;

    fn handle(&self, command: &Self::Command, request: &Arc<Request>) -> Task<Self::Output>;
}

/// Handles one event type. Any number of event handlers may share a type.
pub trait EventHandler: Send + Sync + 'static {
    type Event: Send + Sync + 'static;

    fn handle(&self, event: &Self::Event, request: &Arc<Request>) -> Task<()>;
}
