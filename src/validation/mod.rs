//! Message validation.
//!
//! Validation never faults a dispatch. Failures are recorded on the request
//! and the dispatch core decides whether to abort or continue.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::request::Request;

/// One failed validation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub member: String,
    pub message: String,
}

impl ValidationFailure {
    /// A failure for `member` with a human-readable `message`.
    pub fn new(member: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.member, self.message)
    }
}

/// Validates the message carried by a request.
pub trait Validator: Send + Sync {
    /// Returns false if the message is invalid. Failures are recorded on
    /// the request.
    fn validate(&self, request: &Request) -> bool;
}

impl<T: Validator + ?Sized> Validator for Arc<T> {
    fn validate(&self, request: &Request) -> bool {
        (**self).validate(request)
    }
}

/// Accepts every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysValid;

impl Validator for AlwaysValid {
    fn validate(&self, _request: &Request) -> bool {
        true
    }
}

type Rule = Arc<dyn Fn(&dyn Any) -> Option<ValidationFailure> + Send + Sync>;

/// Validator built from per-message-type rules.
///
/// ```
/// use courier::validation::{RuleValidator, ValidationFailure};
///
/// struct PlaceOrder { quantity: u32 }
///
/// let validator = RuleValidator::new().rule(|order: &PlaceOrder| {
///     (order.quantity == 0).then(|| ValidationFailure::new("quantity", "must be positive"))
/// });
/// # let _ = validator;
/// ```
#[derive(Clone, Default)]
pub struct RuleValidator {
    rules: HashMap<TypeId, Vec<Rule>>,
}

impl RuleValidator {
    /// A validator with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule for messages of type `M`.
    pub fn rule<M, F>(mut self, rule: F) -> Self
    where
        M: 'static,
        F: Fn(&M) -> Option<ValidationFailure> + Send + Sync + 'static,
    {
        let erased: Rule = Arc::new(move |message: &dyn Any| message.downcast_ref::<M>().and_then(&rule));
        self.rules.entry(TypeId::of::<M>()).or_default().push(erased);
        self
    }
}

impl Validator for RuleValidator {
    fn validate(&self, request: &Request) -> bool {
        let Some(rules) = self.rules.get(&request.message_type()) else {
            return true;
        };

        let message: &dyn Any = request.message_value().as_ref();
        let mut valid = true;
        for rule in rules {
            if let Some(failure) = rule(message) {
                request.add_validation_failure(failure);
                valid = false;
            }
        }
        valid
    }
}
