//! Handler pipeline composition
//!
//! A reconciler is usually a linear sequence of dependency checks: is the desired
//! state valid, does the referenced deployment exist, is it reachable, does the
//! derived child resource match. Each stage gates the next and often surfaces
//! its own named condition. A [`Pipeline`] runs such stages ([`Step`]s) in
//! order over a caller-defined state value `S` that carries the resource, its
//! status and any fetched dependencies.
//!
//! Every run yields one [`Outcome`]: the OR of the `changed` flags reported by
//! the steps that ran, plus the error (if any) that ended the run. The caller
//! makes exactly one status-write decision from it.
//!
//! ```ignore
//! let pipeline = Pipeline::new()
//!     .step(step_fn("validate", |_ctx, s: &mut RouteState| validate(s).boxed()))
//!     .step(condition_step(
//!         "BackendFound",
//!         |s: &mut RouteState| &mut s.status.conditions,
//!         |ctx, s: &mut RouteState| find_backend(ctx, s).boxed(),
//!     ));
//!
//! let outcome = pipeline
//!     .handle_with_condition(&ctx, &mut state, |s| &mut s.status.conditions, CONDITION_READY)
//!     .await;
//! ```

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::condition::{ConditionList, REASON_NOT_READY, REASON_READY};
use crate::context::ReconcileContext;
use crate::{Error, Result};

/// Accessor for the condition list inside a pipeline state
pub type ConditionsOf<S> = fn(&mut S) -> &mut ConditionList;

/// Result of a step that manages its own condition
///
/// The condition is applied even when the result is an error, so a failing
/// step can still record why it failed.
pub type ConditionStepResult = (Option<StepCondition>, Result<bool>);

/// One stage of a pipeline
#[async_trait]
pub trait Step<S: Send>: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Run the stage; `Ok(true)` means it changed `state`
    async fn run(&self, ctx: &ReconcileContext, state: &mut S) -> Result<bool>;
}

/// Outcome of a pipeline run
#[derive(Debug, Default)]
pub struct Outcome {
    /// Whether any step that ran reported a change
    pub changed: bool,
    /// Error that ended the run, if any
    pub error: Option<Error>,
}

impl Outcome {
    /// Successful run
    pub fn ok(changed: bool) -> Self {
        Self {
            changed,
            error: None,
        }
    }

    /// Run ended by `error`
    pub fn failed(changed: bool, error: Error) -> Self {
        Self {
            changed,
            error: Some(error),
        }
    }

    /// Whether the run finished without error
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Collapse into a `Result`, dropping `changed` on error
    pub fn into_result(self) -> Result<bool> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.changed),
        }
    }
}

/// Condition value reported by a condition-managing step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCondition {
    /// Whether the condition holds
    pub status: bool,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Content hash of the object the condition was derived from
    pub hash: String,
}

impl StepCondition {
    /// Condition that holds
    pub fn satisfied(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: true,
            reason: reason.into(),
            message: message.into(),
            hash: String::new(),
        }
    }

    /// Condition that does not hold
    pub fn unsatisfied(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: false,
            ..Self::satisfied(reason, message)
        }
    }

    /// Attach a content hash
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }
}

/// Step backed by an async closure
pub struct FnStep<S, F> {
    name: String,
    f: F,
    _state: PhantomData<fn(&mut S)>,
}

/// Build a step from a closure returning a boxed future
pub fn step_fn<S, F>(name: impl Into<String>, f: F) -> FnStep<S, F>
where
    S: Send,
    F: for<'a> Fn(&'a ReconcileContext, &'a mut S) -> BoxFuture<'a, Result<bool>> + Send + Sync,
{
    FnStep {
        name: name.into(),
        f,
        _state: PhantomData,
    }
}

#[async_trait]
impl<S, F> Step<S> for FnStep<S, F>
where
    S: Send,
    F: for<'a> Fn(&'a ReconcileContext, &'a mut S) -> BoxFuture<'a, Result<bool>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ReconcileContext, state: &mut S) -> Result<bool> {
        (self.f)(ctx, state).await
    }
}

/// Step that reconciles one named condition from its own result
pub struct ConditionStep<S, F> {
    condition_type: String,
    conditions: ConditionsOf<S>,
    f: F,
}

/// Adapt a condition-reporting closure into a plain [`Step`].
///
/// After the closure runs, `condition_type` is reconciled in the list returned
/// by `conditions`: `None` removes it, `Some` upserts it with its hash. If the
/// condition changed and the closure did not fail, the step returns
/// [`Error::Reconcile`] so the caller persists status and runs again.
pub fn condition_step<S, F>(
    condition_type: impl Into<String>,
    conditions: ConditionsOf<S>,
    f: F,
) -> ConditionStep<S, F>
where
    S: Send,
    F: for<'a> Fn(&'a ReconcileContext, &'a mut S) -> BoxFuture<'a, ConditionStepResult>
        + Send
        + Sync,
{
    ConditionStep {
        condition_type: condition_type.into(),
        conditions,
        f,
    }
}

#[async_trait]
impl<S, F> Step<S> for ConditionStep<S, F>
where
    S: Send,
    F: for<'a> Fn(&'a ReconcileContext, &'a mut S) -> BoxFuture<'a, ConditionStepResult>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.condition_type
    }

    async fn run(&self, ctx: &ReconcileContext, state: &mut S) -> Result<bool> {
        let (condition, result) = (self.f)(ctx, state).await;
        with_condition_change(
            (self.conditions)(state),
            &self.condition_type,
            condition,
            result,
        )
    }
}

/// Reconcile one condition from a step's reported value and result
pub fn with_condition_change(
    conditions: &mut ConditionList,
    condition_type: &str,
    condition: Option<StepCondition>,
    result: Result<bool>,
) -> Result<bool> {
    let condition_changed = match condition {
        None => conditions.remove(condition_type),
        Some(c) => {
            conditions.update_with_hash(condition_type, c.status, c.reason, c.message, c.hash)
        }
    };

    match result {
        Ok(_) if condition_changed => Err(Error::reconcile(format!(
            "condition {condition_type} changed"
        ))),
        other => other,
    }
}

/// Swallow a stop signal into a successful outcome
pub fn with_stop(outcome: Outcome) -> Outcome {
    match outcome.error {
        Some(e) if e.is_stop() => {
            debug!(reason = %e, "Pipeline stopped");
            Outcome::ok(outcome.changed)
        }
        _ => outcome,
    }
}

/// Record an outcome as a readiness-style condition.
///
/// The condition is `true` (reason `Ready`) when the run ended without error
/// and without change, otherwise `false` (reason `Not ready`). When the
/// condition flips on an error-free run the outcome becomes
/// [`Error::Reconcile`]; errors from the run (including `Stop`) are kept.
pub fn with_condition(
    conditions: &mut ConditionList,
    condition_type: &str,
    outcome: Outcome,
) -> Outcome {
    let ready = outcome.error.is_none() && !outcome.changed;
    let reason = if ready { REASON_READY } else { REASON_NOT_READY };
    let flipped = conditions.update(condition_type, ready, reason, reason);

    match outcome.error {
        None if flipped => Outcome::failed(
            true,
            Error::reconcile(format!("condition {condition_type} changed")),
        ),
        error => Outcome {
            changed: outcome.changed || flipped,
            error,
        },
    }
}

/// Ordered list of steps over a shared state
pub struct Pipeline<S> {
    steps: Vec<Box<dyn Step<S>>>,
}

impl<S: Send> Default for Pipeline<S> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<S: Send> Pipeline<S> {
    /// Empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step
    pub fn step(mut self, step: impl Step<S> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the pipeline has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the steps strictly in order, stopping at the first error.
    ///
    /// Later steps never run after a failure, so they never observe a state
    /// whose dependencies were not verified. A `Reconcile` error counts as a
    /// change. A cancelled context ends the run before the next step.
    pub async fn handle(&self, ctx: &ReconcileContext, state: &mut S) -> Outcome {
        let mut changed = false;

        for step in &self.steps {
            if ctx.is_done() {
                return Outcome::failed(
                    changed,
                    Error::deadline_exceeded(format!("pipeline step {}", step.name())),
                );
            }

            match step.run(ctx, state).await {
                Ok(step_changed) => changed |= step_changed,
                Err(error) => {
                    changed |= error.is_reconcile();
                    debug!(step = %step.name(), error = %error, "Pipeline interrupted");
                    return Outcome::failed(changed, error);
                }
            }
        }

        Outcome::ok(changed)
    }

    /// Like [`Pipeline::handle`], with a stop signal treated as success
    pub async fn handle_with_stop(&self, ctx: &ReconcileContext, state: &mut S) -> Outcome {
        with_stop(self.handle(ctx, state).await)
    }

    /// Run the steps, then record the outcome as `condition_type`
    ///
    /// See [`with_condition`] for how the condition and outcome are derived.
    pub async fn handle_with_condition(
        &self,
        ctx: &ReconcileContext,
        state: &mut S,
        conditions: ConditionsOf<S>,
        condition_type: &str,
    ) -> Outcome {
        let outcome = self.handle(ctx, state).await;
        with_condition(conditions(state), condition_type, outcome)
    }
}
