//! Courier - in-process message dispatch
//!
//! Commands and events are dispatched to registered handlers through an
//! ordered pipeline of filters. Everything is asynchronous and built on
//! [`task::Task`], a continuation-based future with explicit scheduling
//! affinity: continuations attached to finished work run inline, and
//! continuations attached to pending work run on the scheduling context
//! that was current when they were attached.

pub mod activation;
pub mod advice;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod request;
pub mod scheduling;
pub mod services;
pub mod task;
pub mod utils;
pub mod validation;

pub use config::ProcessorConfig;
pub use descriptor::{HandlerDescriptor, HandlerLifetime, MessageKind};
pub use dispatch::{Processor, ProcessorBuilder};
pub use error::{DispatchError, Result};
pub use handlers::{CommandHandler, EventHandler};
pub use request::{Envelope, Request};
pub use task::{Fault, Task, TaskCompletionSource, TaskError};
