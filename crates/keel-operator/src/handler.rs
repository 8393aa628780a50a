//! Handler and starter extension points
//!
//! A [`Handler`] reconciles one resource kind. The operator routes every
//! dequeued work item to the first registered handler whose
//! [`Handler::can_be_handled`] accepts it.
//!
//! Handlers see only the item's identity. The operation on the item is always
//! `UPDATE` by the time it reaches a handler, so deletion must be derived from
//! fetched state (a missing object or a deletion timestamp), never from the
//! event that triggered the work.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use keel_common::{ReconcileContext, Result, WorkItem};

/// Reconciler for one resource kind
///
/// Return values steer the queue:
/// - `Ok(())`, [`Error::Stop`](keel_common::Error::Stop),
///   [`Error::Reconcile`](keel_common::Error::Reconcile) or a not-found
///   error: the item is forgotten
/// - any other error: the item is re-queued with backoff
#[async_trait]
pub trait Handler: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Whether this handler owns the item
    fn can_be_handled(&self, item: &WorkItem) -> bool;

    /// Reconcile the resource the item identifies
    async fn handle(&self, ctx: &ReconcileContext, item: &WorkItem) -> Result<()>;

    /// Per-invocation timeout; `None` uses the operator default
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Hook run before any informer starts
    ///
    /// Retried until it succeeds or the operator shuts down, so it can wait
    /// for an external dependency (a CRD being installed, a webhook being
    /// reachable) to become available.
    async fn pre_start(&self, _ctx: &ReconcileContext) -> Result<()> {
        Ok(())
    }
}

/// Background task started once caches have synced
///
/// Typical uses are periodic garbage collection or leader-only loops that
/// need the local caches populated. `start` should run until `shutdown` is
/// cancelled.
#[async_trait]
pub trait Starter: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run until `shutdown` is cancelled
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;
}

/// Handler routing on a single group/version/kind
///
/// Covers the common case of one reconcile function per resource kind
/// without writing a dedicated type.
pub struct KindHandler<F> {
    name: String,
    group: String,
    version: String,
    kind: String,
    timeout: Option<Duration>,
    f: F,
}

impl<F> KindHandler<F>
where
    F: for<'a> Fn(&'a ReconcileContext, &'a WorkItem) -> futures::future::BoxFuture<'a, Result<()>>
        + Send
        + Sync,
{
    /// Route items of `group/version/kind` to `f`
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        f: F,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            timeout: None,
            f,
        }
    }

    /// Override the operator's default timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<F> Handler for KindHandler<F>
where
    F: for<'a> Fn(&'a ReconcileContext, &'a WorkItem) -> futures::future::BoxFuture<'a, Result<()>>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn can_be_handled(&self, item: &WorkItem) -> bool {
        item.matches_kind(&self.group, &self.version, &self.kind)
    }

    async fn handle(&self, ctx: &ReconcileContext, item: &WorkItem) -> Result<()> {
        (self.f)(ctx, item).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
