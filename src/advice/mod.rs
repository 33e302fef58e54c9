//! Aspect-oriented advice for cross-cutting concerns.
//!
//! Wrapper types add orthogonal behavior to the dispatch collaborators
//! without touching their implementations. Advice is applied when the
//! processor is built:
//!
//! ```ignore
//! let selector = RegistrySelector::new(registry);
//! let selector = Traced::new(selector, Arc::new(TracingWriter));
//! ```
//!
//! # Available Advice
//!
//! - [`Traced`] - Reports begin, end and error of every collaborator call
//!   to a [`TraceWriter`]

mod traced;

pub use traced::{TraceWriter, Traced, TracingWriter};
