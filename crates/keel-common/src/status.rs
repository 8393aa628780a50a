//! Status persistence with optimistic retry
//!
//! [`update_status_with_retry`] commits a reconciled status back to the store
//! with a get-mutate-update loop: every attempt re-reads the object to pick up
//! the latest resourceVersion, sets the new status and writes it. Nothing is
//! locked; lost updates are prevented by the store rejecting writes made
//! against a stale resourceVersion (HTTP 409 from the Kubernetes API server).
//! The loop only retries; it does not itself guarantee consistency.

use std::time::Duration;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::context::ReconcileContext;
use crate::retry::{retry_with_backoff, RetryConfig, RetryError};
use crate::{metrics, Error, Result};

/// Default number of attempts for a status update
pub const DEFAULT_STATUS_RETRY_COUNT: u32 = 25;

/// Default delay between status update attempts
pub const DEFAULT_STATUS_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default timeout for a single get or update call
pub const DEFAULT_STATUS_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

static DEFAULT_CONFIG: Lazy<RwLock<StatusRetryConfig>> = Lazy::new(|| {
    RwLock::new(StatusRetryConfig {
        retry_count: DEFAULT_STATUS_RETRY_COUNT,
        retry_delay: DEFAULT_STATUS_RETRY_DELAY,
        update_timeout: DEFAULT_STATUS_UPDATE_TIMEOUT,
    })
});

/// Retry settings for status updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRetryConfig {
    /// Number of get-mutate-update attempts
    pub retry_count: u32,
    /// Wait between failed attempts
    pub retry_delay: Duration,
    /// Timeout for each individual API call
    pub update_timeout: Duration,
}

impl StatusRetryConfig {
    /// Current process-wide defaults
    pub fn current() -> Self {
        *DEFAULT_CONFIG.read()
    }
}

impl Default for StatusRetryConfig {
    fn default() -> Self {
        Self::current()
    }
}

/// Replace the process-wide defaults used by [`StatusRetryConfig::current`]
pub fn set_default_status_retry(config: StatusRetryConfig) {
    *DEFAULT_CONFIG.write() = config;
}

/// Objects whose status sub-resource can be replaced
pub trait HasStatus {
    /// Status type
    type Status: Clone + Send + Sync;

    /// Overwrite the status
    fn set_status(&mut self, status: Self::Status);
}

/// Store access needed to persist status
///
/// Implemented for the Kubernetes API by
/// [`KubeStatusClient`](crate::kube_utils::KubeStatusClient) and mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusClient<K: Send + Sync + 'static>: Send + Sync {
    /// Fetch the latest version of an object
    async fn get(&self, namespace: &str, name: &str) -> Result<K>;

    /// Write the status of `obj`; the store must reject stale versions
    async fn update_status(&self, obj: &K) -> Result<K>;
}

/// Persist `status` onto `obj` with optimistic retry.
///
/// Makes up to `config.retry_count` attempts. Each attempt fetches the object
/// fresh, sets its status and writes it, with each call bounded by
/// `config.update_timeout` (clamped to the context deadline). Between failed
/// attempts waits `config.retry_delay`, returning [`Error::DeadlineExceeded`]
/// if `ctx` is cancelled first. When every attempt fails the result is
/// [`Error::RetriesExceeded`] carrying the last error.
pub async fn update_status_with_retry<K, C>(
    ctx: &ReconcileContext,
    client: &C,
    obj: &K,
    status: &K::Status,
    config: &StatusRetryConfig,
) -> Result<K>
where
    K: Resource + HasStatus + Send + Sync + 'static,
    C: StatusClient<K> + ?Sized,
{
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let retry = RetryConfig::fixed(config.retry_count.max(1), config.retry_delay);

    let result = retry_with_backoff(ctx, &retry, "update_status", || {
        let (namespace, name) = (&namespace, &name);
        async move {
            let attempt = status_attempt(ctx, client, namespace, name, status, config).await;
            if attempt.is_err() {
                metrics::record_status_retry();
            }
            attempt
        }
    })
    .await;

    match result {
        Ok(updated) => {
            debug!(namespace = %namespace, name = %name, "Status updated");
            Ok(updated)
        }
        Err(RetryError::Cancelled { .. }) => Err(Error::deadline_exceeded(format!(
            "update status {namespace}/{name}"
        ))),
        Err(RetryError::Exhausted { last, attempts }) => Err(Error::RetriesExceeded {
            namespace,
            name,
            attempts,
            last: Some(Box::new(last)),
        }),
    }
}

/// One get-mutate-update cycle, each call bounded by the update timeout
async fn status_attempt<K, C>(
    ctx: &ReconcileContext,
    client: &C,
    namespace: &str,
    name: &str,
    status: &K::Status,
    config: &StatusRetryConfig,
) -> Result<K>
where
    K: Resource + HasStatus + Send + Sync + 'static,
    C: StatusClient<K> + ?Sized,
{
    let timeout = ctx.clamp(config.update_timeout);

    let mut fresh = tokio::time::timeout(timeout, client.get(namespace, name))
        .await
        .map_err(|_| Error::deadline_exceeded(format!("get {namespace}/{name}")))??;

    fresh.set_status(status.clone());

    tokio::time::timeout(timeout, client.update_status(&fresh))
        .await
        .map_err(|_| Error::deadline_exceeded(format!("update status {namespace}/{name}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionList;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Minimal resource with a status sub-object
    #[derive(Clone, Debug, Default, PartialEq)]
    struct Backup {
        metadata: ObjectMeta,
        status: Option<BackupStatus>,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct BackupStatus {
        conditions: ConditionList,
        phase: String,
    }

    impl Resource for Backup {
        type DynamicType = ();
        type Scope = k8s_openapi::NamespaceResourceScope;

        fn kind(_: &()) -> std::borrow::Cow<'_, str> {
            "Backup".into()
        }
        fn group(_: &()) -> std::borrow::Cow<'_, str> {
            "backup.keel.dev".into()
        }
        fn version(_: &()) -> std::borrow::Cow<'_, str> {
            "v1".into()
        }
        fn plural(_: &()) -> std::borrow::Cow<'_, str> {
            "backups".into()
        }
        fn meta(&self) -> &ObjectMeta {
            &self.metadata
        }
        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
    }

    impl HasStatus for Backup {
        type Status = BackupStatus;

        fn set_status(&mut self, status: BackupStatus) {
            self.status = Some(status);
        }
    }

    fn backup(resource_version: &str) -> Backup {
        Backup {
            metadata: ObjectMeta {
                name: Some("nightly".into()),
                namespace: Some("db".into()),
                resource_version: Some(resource_version.into()),
                ..Default::default()
            },
            status: None,
        }
    }

    fn done() -> BackupStatus {
        BackupStatus {
            conditions: ConditionList::new(),
            phase: "Done".into(),
        }
    }

    fn fast(retry_count: u32) -> StatusRetryConfig {
        StatusRetryConfig {
            retry_count,
            retry_delay: Duration::from_millis(1),
            update_timeout: Duration::from_secs(1),
        }
    }

    /// Story: a clean write fetches once and writes the new status
    #[tokio::test]
    async fn story_status_written_on_first_attempt() {
        let mut client = MockStatusClient::<Backup>::new();
        client
            .expect_get()
            .times(1)
            .returning(|namespace, name| {
                assert_eq!((namespace, name), ("db", "nightly"));
                Ok(backup("7"))
            });
        client
            .expect_update_status()
            .times(1)
            .returning(|obj| Ok(obj.clone()));

        let ctx = ReconcileContext::background();
        let updated = update_status_with_retry(&ctx, &client, &backup("1"), &done(), &fast(3))
            .await
            .unwrap();

        assert_eq!(updated.status, Some(done()));
        // Written against the fresh resourceVersion, not the caller's copy
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("7"));
    }

    /// Story: a conflicting writer is tolerated by re-reading and retrying
    #[tokio::test]
    async fn story_conflict_then_success() {
        let versions = Arc::new(AtomicU32::new(10));
        let v = versions.clone();

        let mut client = MockStatusClient::<Backup>::new();
        client
            .expect_get()
            .times(2)
            .returning(move |_, _| Ok(backup(&v.fetch_add(1, Ordering::SeqCst).to_string())));

        let mut seq = mockall::Sequence::new();
        client
            .expect_update_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::internal("conflict: object has been modified")));
        client
            .expect_update_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|obj| Ok(obj.clone()));

        let ctx = ReconcileContext::background();
        let updated = update_status_with_retry(&ctx, &client, &backup("1"), &done(), &fast(5))
            .await
            .unwrap();

        assert_eq!(updated.metadata.resource_version.as_deref(), Some("11"));
    }

    /// Story: a store that always rejects the write exhausts the retry budget
    #[tokio::test]
    async fn story_retries_exceeded() {
        let gets = Arc::new(AtomicU32::new(0));
        let g = gets.clone();

        let mut client = MockStatusClient::<Backup>::new();
        client.expect_get().returning(move |_, _| {
            g.fetch_add(1, Ordering::SeqCst);
            Ok(backup("1"))
        });
        client
            .expect_update_status()
            .returning(|_| Err(Error::internal("conflict")));

        let ctx = ReconcileContext::background();
        let err = update_status_with_retry(&ctx, &client, &backup("1"), &done(), &fast(4))
            .await
            .unwrap_err();

        assert_eq!(gets.load(Ordering::SeqCst), 4);
        match err {
            Error::RetriesExceeded {
                namespace,
                name,
                attempts,
                last,
            } => {
                assert_eq!((namespace.as_str(), name.as_str()), ("db", "nightly"));
                assert_eq!(attempts, 4);
                assert!(last.unwrap().to_string().contains("conflict"));
            }
            other => panic!("expected RetriesExceeded, got {other:?}"),
        }
    }

    /// Story: shutdown during the retry delay aborts with a deadline error
    #[tokio::test]
    async fn story_cancellation_aborts_retry() {
        let mut client = MockStatusClient::<Backup>::new();
        client.expect_get().times(1).returning(|_, _| Ok(backup("1")));
        client
            .expect_update_status()
            .times(1)
            .returning(|_| Err(Error::internal("conflict")));

        let ctx = ReconcileContext::background();
        ctx.cancel();
        let config = StatusRetryConfig {
            retry_count: 10,
            retry_delay: Duration::from_secs(3600),
            update_timeout: Duration::from_secs(1),
        };
        let err = update_status_with_retry(&ctx, &client, &backup("1"), &done(), &config)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded { .. }));
    }

    /// Story: a failing get counts as a failed attempt too
    #[tokio::test]
    async fn story_get_failure_is_retried() {
        let mut client = MockStatusClient::<Backup>::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Error::internal("connection refused")));
        client
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(backup("2")));
        client
            .expect_update_status()
            .times(1)
            .returning(|obj| Ok(obj.clone()));

        let ctx = ReconcileContext::background();
        let result =
            update_status_with_retry(&ctx, &client, &backup("1"), &done(), &fast(3)).await;
        assert!(result.is_ok());
    }

    /// Story: reads that keep failing or timing out exhaust the same budget
    /// as rejected writes, and the write is never attempted
    #[tokio::test(start_paused = true)]
    async fn story_failed_reads_use_the_retry_budget() {
        let gets = Arc::new(AtomicU32::new(0));
        let g = gets.clone();

        let mut client = MockStatusClient::<Backup>::new();
        client.expect_get().returning(move |_, _| {
            if g.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Err(Error::internal("connection refused"))
            } else {
                Err(Error::deadline_exceeded("get db/nightly"))
            }
        });
        client.expect_update_status().never();

        let ctx = ReconcileContext::background();
        let err = update_status_with_retry(&ctx, &client, &backup("1"), &done(), &fast(3))
            .await
            .unwrap_err();

        assert_eq!(gets.load(Ordering::SeqCst), 3);
        match err {
            Error::RetriesExceeded { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(last.unwrap().to_string().contains("connection refused"));
            }
            other => panic!("expected RetriesExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_process_wide_defaults() {
        let original = StatusRetryConfig::current();
        let custom = StatusRetryConfig {
            retry_count: 3,
            retry_delay: Duration::from_millis(50),
            update_timeout: Duration::from_secs(2),
        };
        set_default_status_retry(custom);
        assert_eq!(StatusRetryConfig::default(), custom);
        set_default_status_retry(original);
    }
}
