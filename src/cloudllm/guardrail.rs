//! Guardrail Chain (C3): an ordered list of input/output validators, each
//! returning pass / reject / transform, with short-circuit on first reject.
//!
//! Grounded in `planner.rs`'s `PolicyEngine` trait (`PolicyDecision::Allow`
//! / `Deny(reason)`), generalized into a chain of independently pluggable
//! validators that may also rewrite the value in flight (`transform`),
//! which the teacher's single binary allow/deny `PolicyEngine` does not
//! support.

use async_trait::async_trait;

use crate::cloudllm::error::DynError;

/// The outcome of running one guardrail against a value.
pub enum GuardrailDecision<T> {
    Pass,
    Reject { reason: String },
    Transform(T),
}

/// A single pluggable validator. `T` is `String` for a plain-text guardrail
/// or a richer type for guardrails that inspect structured output.
#[async_trait]
pub trait Guardrail<T: Send>: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, value: &T) -> Result<GuardrailDecision<T>, DynError>;
}

/// An ordered chain of guardrails, run in declaration order with
/// short-circuit on the first reject.
pub struct GuardrailChain<T: Send> {
    guardrails: Vec<Box<dyn Guardrail<T>>>,
}

impl<T: Send + Clone> GuardrailChain<T> {
    pub fn new() -> Self {
        Self { guardrails: Vec::new() }
    }

    pub fn with(mut self, guardrail: Box<dyn Guardrail<T>>) -> Self {
        self.guardrails.push(guardrail);
        self
    }

    /// Run the chain against `value`. Returns either the (possibly
    /// transformed) final value, or the reject reason from the first
    /// guardrail that rejected, tagged with the guardrail's name for
    /// diagnostics.
    pub async fn run(&self, value: T) -> Result<Result<T, (String, String)>, DynError> {
        let mut current = value;
        for guardrail in &self.guardrails {
            match guardrail.check(&current).await? {
                GuardrailDecision::Pass => {}
                GuardrailDecision::Transform(new_value) => current = new_value,
                GuardrailDecision::Reject { reason } => {
                    return Ok(Err((guardrail.name().to_string(), reason)));
                }
            }
        }
        Ok(Ok(current))
    }
}

impl<T: Send + Clone> Default for GuardrailChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A guardrail built from a plain synchronous predicate, for the common
/// case of a stateless check with no I/O.
pub struct PredicateGuardrail<F> {
    name: String,
    predicate: F,
}

impl<F> PredicateGuardrail<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self { name: name.into(), predicate }
    }
}

#[async_trait]
impl<F> Guardrail<String> for PredicateGuardrail<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, value: &String) -> Result<GuardrailDecision<String>, DynError> {
        match (self.predicate)(value) {
            Some(reason) => Ok(GuardrailDecision::Reject { reason }),
            None => Ok(GuardrailDecision::Pass),
        }
    }
}
