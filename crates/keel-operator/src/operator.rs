//! Operator dispatch loop
//!
//! The [`Operator`] owns the handler, informer and starter registries and the
//! shared work queue. Registration is only possible before [`Operator::start`];
//! afterwards the registries are frozen.
//!
//! Startup order:
//! 1. every handler's pre-start hook, retried until it succeeds
//! 2. informers start delivering events
//! 3. wait for every informer's initial listing; an informer that stops
//!    before it syncs fails startup
//! 4. starters run
//! 5. `worker_threads` workers pull from the queue
//!
//! No item is routed before all caches are synced, so handlers never see a
//! partially populated local cache.
//!
//! Each dequeued key moves through:
//! `dequeued -> (not UPDATE) re-queued as UPDATE -> routed -> handled ->
//! forgotten | re-queued with backoff`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use keel_common::metrics::{self, HandleTimer, PANIC_LABEL};
use keel_common::retry::{retry_with_backoff, RetryConfig};
use keel_common::{Error, ErrorKind, Operation, ReconcileContext, Result, WorkItem};

use crate::config::{ConfigError, OperatorConfig};
use crate::handler::{Handler, Starter};
use crate::informer::{Informer, KeyQueue};
use crate::panic::{catch_panic, install_backtrace_hook};
use crate::queue::{ItemBackoff, WorkQueue};

/// How a routed work item ended without a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran and returned `Ok`
    Handled,
    /// A handler ended with a stop, reconcile or not-found signal
    Settled(ErrorKind),
    /// No handler accepted the item
    Dropped,
}

#[derive(Default)]
struct Registry {
    started: bool,
    handlers: Vec<Arc<dyn Handler>>,
    informers: Vec<Arc<dyn Informer>>,
    starters: Vec<Arc<dyn Starter>>,
}

impl Registry {
    fn ensure_open(&self, name: &str) -> Result<()> {
        if self.started {
            return Err(Error::registration(name, "operator already started"));
        }
        Ok(())
    }
}

/// Same allocation, regardless of vtable
fn same_instance<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Reconciliation engine
pub struct Operator {
    config: OperatorConfig,
    queue: KeyQueue,
    registry: Mutex<Registry>,
    root: CancellationToken,
}

impl Operator {
    /// Create an operator after validating `config`.
    ///
    /// Also installs the config's status retry settings as the process-wide
    /// defaults used by `update_status_with_retry`.
    pub fn new(config: OperatorConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        config.apply_globals();
        let backoff = ItemBackoff::new(config.requeue_base_delay(), config.requeue_max_delay());
        Ok(Self {
            config,
            queue: Arc::new(WorkQueue::new(backoff)),
            registry: Mutex::new(Registry::default()),
            root: CancellationToken::new(),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Shared work queue, for handlers that re-enqueue related objects
    pub fn queue(&self) -> KeyQueue {
        Arc::clone(&self.queue)
    }

    /// Queue a work item
    pub fn enqueue(&self, item: &WorkItem) {
        self.queue.add(item.key());
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.registry.lock().started
    }

    /// Add a handler; earlier handlers win when several accept an item
    pub fn register_handler(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.ensure_open(handler.name())?;
        if registry.handlers.iter().any(|h| same_instance(h, &handler)) {
            return Err(Error::registration(handler.name(), "handler already registered"));
        }
        info!(handler = %handler.name(), "Registered handler");
        registry.handlers.push(handler);
        Ok(())
    }

    /// Add an event source
    pub fn register_informer(&self, informer: Arc<dyn Informer>) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.ensure_open(informer.name())?;
        if registry.informers.iter().any(|i| same_instance(i, &informer)) {
            return Err(Error::registration(informer.name(), "informer already registered"));
        }
        info!(informer = %informer.name(), "Registered informer");
        registry.informers.push(informer);
        Ok(())
    }

    /// Add a background task started after caches sync
    pub fn register_starter(&self, starter: Arc<dyn Starter>) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.ensure_open(starter.name())?;
        if registry.starters.iter().any(|s| same_instance(s, &starter)) {
            return Err(Error::registration(starter.name(), "starter already registered"));
        }
        info!(starter = %starter.name(), "Registered starter");
        registry.starters.push(starter);
        Ok(())
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Returns once workers have finished their current items. Shutdown during
    /// startup is not an error. The queue is shut down on return.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let (handlers, informers, starters) = {
            let mut registry = self.registry.lock();
            registry.ensure_open("operator")?;
            registry.started = true;
            (
                registry.handlers.clone(),
                registry.informers.clone(),
                registry.starters.clone(),
            )
        };
        install_backtrace_hook();

        let mut background = JoinSet::new();
        let result = self
            .run(&shutdown, handlers, informers, starters, &mut background)
            .await;

        self.root.cancel();
        self.queue.shut_down();
        background.shutdown().await;

        match result {
            Err(e) if shutdown.is_cancelled() => {
                info!(reason = %e, "Shutdown requested during startup");
                Ok(())
            }
            other => other,
        }
    }

    async fn run(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
        handlers: Vec<Arc<dyn Handler>>,
        informers: Vec<Arc<dyn Informer>>,
        starters: Vec<Arc<dyn Starter>>,
        background: &mut JoinSet<()>,
    ) -> Result<()> {
        self.run_pre_start(shutdown, &handlers).await?;

        for informer in &informers {
            let (informer, queue, token) =
                (Arc::clone(informer), self.queue(), self.root.clone());
            background.spawn(async move {
                match informer.run(queue, token).await {
                    Ok(()) => debug!(informer = %informer.name(), "Informer exited"),
                    Err(e) => error!(informer = %informer.name(), error = %e, "Informer failed"),
                }
            });
        }

        // Only informers are in the background set until caches sync, so any
        // task finishing here is a source that will never sync
        let synced = async {
            for informer in &informers {
                informer.wait_for_sync(shutdown).await?;
                debug!(informer = %informer.name(), "Informer synced");
            }
            Ok::<_, Error>(())
        };
        tokio::select! {
            biased;
            res = synced => res?,
            Some(_) = background.join_next() => {
                return Err(Error::internal_with_context(
                    "startup",
                    "informer stopped before its cache synced",
                ));
            }
        }
        info!(informers = informers.len(), "Caches synced");

        for starter in starters {
            let token = self.root.clone();
            background.spawn(async move {
                info!(starter = %starter.name(), "Starting");
                if let Err(e) = starter.start(token).await {
                    error!(starter = %starter.name(), error = %e, "Starter failed");
                }
            });
        }

        let mut workers = JoinSet::new();
        for id in 0..self.config.worker_threads {
            let operator = Arc::clone(self);
            workers.spawn(async move { operator.worker(id).await });
        }
        info!(workers = self.config.worker_threads, "Operator started");

        shutdown.cancelled().await;
        info!("Shutting down operator");
        self.root.cancel();
        self.queue.shut_down();

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
        Ok(())
    }

    async fn run_pre_start(
        &self,
        shutdown: &CancellationToken,
        handlers: &[Arc<dyn Handler>],
    ) -> Result<()> {
        let ctx = ReconcileContext::new(shutdown.child_token());
        let retry = RetryConfig::fixed(0, self.config.prestart_retry_delay());

        for handler in handlers {
            let name = format!("pre_start {}", handler.name());
            retry_with_backoff(&ctx, &retry, &name, || handler.pre_start(&ctx))
                .await
                .map_err(|_| Error::cancelled(name.clone()))?;
            debug!(handler = %handler.name(), "Pre-start hook completed");
        }
        Ok(())
    }

    async fn worker(&self, id: usize) {
        debug!(worker = id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.dispatch_key(&key).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Process one dequeued key and release it.
    ///
    /// Handler code runs inside routing and timeout lookup as well as in
    /// `handle`, so the whole step is guarded: a panic anywhere sends the key
    /// down the failure path and the key is always marked done.
    async fn dispatch_key(&self, key: &String) {
        if let Err(report) = catch_panic(self.process_key(key)).await {
            error!(
                item = %key,
                panic = %report.message,
                backtrace = report.backtrace.as_deref().unwrap_or("unavailable"),
                "Dispatch panicked, requeueing"
            );
            metrics::record_item_failed("dispatch", PANIC_LABEL);
            self.queue.add_rate_limited(key.clone());
        }
        self.queue.done(key);
    }

    /// Apply the queue policy for one dequeued key
    async fn process_key(&self, key: &String) {
        let item = match WorkItem::parse(key) {
            Ok(item) => item,
            Err(e) => {
                error!(item = %key, error = %e, "Dropping malformed work item");
                self.queue.forget(key);
                return;
            }
        };

        if item.operation() != Operation::Update {
            self.queue.forget(key);
            self.queue.add(item.with_operation(Operation::Update).key());
            return;
        }

        match self.process_item(&item).await {
            Ok(_) => self.queue.forget(key),
            Err(e) => {
                error!(
                    item = %key,
                    error_kind = e.kind().as_str(),
                    error = %e,
                    requeues = self.queue.num_requeues(key),
                    "Processing failed, requeueing"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
    }

    fn route(&self, item: &WorkItem) -> Option<Arc<dyn Handler>> {
        let handlers = self.registry.lock().handlers.clone();
        handlers.into_iter().find(|h| h.can_be_handled(item))
    }

    /// Route `item` to its handler and run it.
    ///
    /// The handler runs under a context derived from the operator's shutdown
    /// token and bounded by its timeout (or the configured default). Panics
    /// are recovered and returned as errors. `Err` means the item should be
    /// retried.
    #[instrument(skip_all, fields(item = %item))]
    pub async fn process_item(&self, item: &WorkItem) -> Result<Dispatch> {
        let Some(handler) = self.route(item) else {
            debug!("No handler accepts work item, dropping");
            metrics::record_item_dropped();
            return Ok(Dispatch::Dropped);
        };

        let name = handler.name().to_string();
        let timeout = handler
            .timeout()
            .unwrap_or_else(|| self.config.handler_timeout());
        let ctx = ReconcileContext::new(self.root.child_token()).with_timeout(timeout);
        let timer = HandleTimer::start(&name);

        let result = match catch_panic(tokio::time::timeout(timeout, handler.handle(&ctx, item)))
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => {
                ctx.cancel();
                Err(Error::deadline_exceeded(format!(
                    "handler {name} after {}",
                    humanize(timeout)
                )))
            }
            Err(report) => {
                error!(
                    handler = %name,
                    panic = %report.message,
                    backtrace = report.backtrace.as_deref().unwrap_or("unavailable"),
                    "Handler panicked"
                );
                timer.error(PANIC_LABEL);
                return Err(report.into_error());
            }
        };

        match result {
            Ok(()) => {
                timer.success();
                Ok(Dispatch::Handled)
            }
            Err(e) if e.is_reconcile() || e.is_stop() || e.is_not_found() => {
                debug!(handler = %name, reason = %e, "Handler settled");
                timer.success();
                Ok(Dispatch::Settled(e.kind()))
            }
            Err(e) => {
                timer.error_kind(e.kind());
                Err(e)
            }
        }
    }
}

fn humanize(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    #[derive(Clone, Copy)]
    enum Step {
        Succeed,
        Fail,
        Reconcile,
        Stop,
        NotFound,
        Panic,
        Hang,
    }

    /// Handler that follows a script, one step per call, then succeeds
    struct Scripted {
        name: &'static str,
        kind: &'static str,
        script: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        timeout: Option<Duration>,
        last_token: Mutex<Option<CancellationToken>>,
    }

    impl Scripted {
        fn new(name: &'static str, kind: &'static str, script: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                name,
                kind,
                script: Mutex::new(script.iter().copied().collect()),
                calls: AtomicUsize::new(0),
                timeout: None,
                last_token: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Handler for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn can_be_handled(&self, item: &WorkItem) -> bool {
            item.kind() == self.kind
        }

        async fn handle(&self, ctx: &ReconcileContext, item: &WorkItem) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_token.lock() = Some(ctx.token().clone());
            let step = self.script.lock().pop_front().unwrap_or(Step::Succeed);
            match step {
                Step::Succeed => Ok(()),
                Step::Fail => Err(Error::internal("backend unavailable")),
                Step::Reconcile => Err(Error::reconcile("status changed")),
                Step::Stop => Err(Error::stop("spec invalid")),
                Step::NotFound => Err(Error::not_found("Pod", item.namespace(), item.name())),
                Step::Panic => panic!("handler bug"),
                Step::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }
    }

    fn operator() -> Arc<Operator> {
        Arc::new(Operator::new(OperatorConfig::default()).unwrap())
    }

    fn item(op: Operation, kind: &str, name: &str) -> WorkItem {
        WorkItem::new(op, "", "v1", kind, "default", name).unwrap()
    }

    // ==========================================================================
    // Routing
    // ==========================================================================

    #[tokio::test]
    async fn test_routes_to_matching_handler() {
        let op = operator();
        let pods = Scripted::new("pods", "pods", &[]);
        let services = Scripted::new("services", "services", &[]);
        op.register_handler(pods.clone()).unwrap();
        op.register_handler(services.clone()).unwrap();

        let dispatch = op
            .process_item(&item(Operation::Update, "services", "web"))
            .await
            .unwrap();

        assert_eq!(dispatch, Dispatch::Handled);
        assert_eq!(services.calls(), 1);
        assert_eq!(pods.calls(), 0);
    }

    #[tokio::test]
    async fn test_first_registered_handler_wins() {
        let op = operator();
        let first = Scripted::new("first", "pods", &[]);
        let second = Scripted::new("second", "pods", &[]);
        op.register_handler(first.clone()).unwrap();
        op.register_handler(second.clone()).unwrap();

        op.process_item(&item(Operation::Update, "pods", "web"))
            .await
            .unwrap();

        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_item_is_dropped() {
        let op = operator();
        op.register_handler(Scripted::new("pods", "pods", &[]))
            .unwrap();

        let key = item(Operation::Update, "secrets", "creds").key();
        op.process_key(&key).await;

        assert!(op.queue().is_empty());
        assert_eq!(op.queue().num_requeues(&key), 0);
        assert_eq!(
            op.process_item(&WorkItem::parse(&key).unwrap())
                .await
                .unwrap(),
            Dispatch::Dropped
        );
    }

    // ==========================================================================
    // Failure policy
    // ==========================================================================

    #[tokio::test]
    async fn test_failure_requeues_with_backoff() {
        let op = operator();
        let pods = Scripted::new("pods", "pods", &[Step::Fail, Step::Fail]);
        op.register_handler(pods.clone()).unwrap();
        let key = item(Operation::Update, "pods", "web").key();

        op.process_key(&key).await;
        assert_eq!(op.queue().num_requeues(&key), 1);
        op.process_key(&key).await;
        assert_eq!(op.queue().num_requeues(&key), 2);

        // Success resets the backoff history
        op.process_key(&key).await;
        assert_eq!(op.queue().num_requeues(&key), 0);
        assert_eq!(pods.calls(), 3);
    }

    #[tokio::test]
    async fn test_signals_are_forgotten() {
        for (step, kind) in [
            (Step::Reconcile, ErrorKind::Reconcile),
            (Step::Stop, ErrorKind::Stop),
            (Step::NotFound, ErrorKind::NotFound),
        ] {
            let op = operator();
            op.register_handler(Scripted::new("pods", "pods", &[Step::Fail, step, step]))
                .unwrap();
            let work = item(Operation::Update, "pods", "web");

            op.process_key(&work.key()).await;
            assert_eq!(op.queue().num_requeues(&work.key()), 1);

            assert_eq!(
                op.process_item(&work).await.unwrap(),
                Dispatch::Settled(kind)
            );
            op.process_key(&work.key()).await;
            assert_eq!(op.queue().num_requeues(&work.key()), 0);
        }
    }

    /// A panicking handler must not take down the worker; the item follows
    /// the ordinary failure path
    #[tokio::test]
    async fn test_panic_is_isolated() {
        let op = operator();
        let pods = Scripted::new("pods", "pods", &[Step::Panic]);
        op.register_handler(pods.clone()).unwrap();
        let work = item(Operation::Update, "pods", "web");

        op.process_key(&work.key()).await;
        assert_eq!(op.queue().num_requeues(&work.key()), 1);

        // Same handler keeps working afterwards
        assert_eq!(op.process_item(&work).await.unwrap(), Dispatch::Handled);
        assert_eq!(pods.calls(), 2);
    }

    #[tokio::test]
    async fn test_panic_surfaces_as_error() {
        let op = operator();
        op.register_handler(Scripted::new("pods", "pods", &[Step::Panic]))
            .unwrap();

        let err = op
            .process_item(&item(Operation::Update, "pods", "web"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("handler bug"));
        assert!(err.is_retryable());
    }

    /// Handler whose routing check panics for one object name
    struct Picky {
        handled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for Picky {
        fn name(&self) -> &str {
            "picky"
        }

        fn can_be_handled(&self, item: &WorkItem) -> bool {
            if item.name() == "bad" {
                panic!("cannot route {}", item.name());
            }
            item.kind() == "pods"
        }

        async fn handle(&self, _ctx: &ReconcileContext, item: &WorkItem) -> Result<()> {
            self.handled.lock().push(item.name().to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panic_while_routing_is_requeued_and_released() {
        let op = operator();
        op.register_handler(Arc::new(Picky {
            handled: Mutex::new(Vec::new()),
        }))
        .unwrap();
        let queue = op.queue();
        let bad = item(Operation::Update, "pods", "bad").key();

        queue.add(bad.clone());
        let key = queue.get().await.unwrap();
        op.dispatch_key(&key).await;

        assert_eq!(queue.num_requeues(&bad), 1);

        // Released from processing: a fresh add is immediately dispatchable
        queue.add(bad.clone());
        assert_eq!(queue.len(), 1);
    }

    /// Story: a single worker survives a panicking routing check and keeps
    /// serving the items queued behind the bad one
    #[tokio::test(start_paused = true)]
    async fn story_worker_survives_routing_panic() {
        let op = Arc::new(
            Operator::new(OperatorConfig {
                worker_threads: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let picky = Arc::new(Picky {
            handled: Mutex::new(Vec::new()),
        });
        op.register_handler(picky.clone()).unwrap();
        op.enqueue(&item(Operation::Update, "pods", "bad"));
        op.enqueue(&item(Operation::Update, "pods", "good"));

        let shutdown = CancellationToken::new();
        let run = {
            let op = Arc::clone(&op);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { op.start(shutdown).await })
        };

        for _ in 0..100 {
            if !picky.handled.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*picky.handled.lock(), ["good"]);
        assert!(op.queue().num_requeues(&item(Operation::Update, "pods", "bad").key()) >= 1);

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_cancels_context() {
        let op = operator();
        let pods = Arc::new(Scripted {
            timeout: Some(Duration::from_millis(50)),
            ..Arc::into_inner(Scripted::new("pods", "pods", &[Step::Hang])).unwrap()
        });
        op.register_handler(pods.clone()).unwrap();

        let err = op
            .process_item(&item(Operation::Update, "pods", "web"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        let token = pods.last_token.lock().clone().unwrap();
        assert!(token.is_cancelled());
    }

    // ==========================================================================
    // Key handling
    // ==========================================================================

    #[tokio::test]
    async fn test_add_and_delete_are_requeued_as_update() {
        let op = operator();
        let pods = Scripted::new("pods", "pods", &[]);
        op.register_handler(pods.clone()).unwrap();

        op.process_key(&item(Operation::Add, "pods", "web").key())
            .await;
        op.process_key(&item(Operation::Delete, "pods", "api").key())
            .await;

        assert_eq!(pods.calls(), 0);
        let queue = op.queue();
        assert_eq!(queue.get().await.unwrap(), "UPDATE//v1/pods/default/web");
        assert_eq!(queue.get().await.unwrap(), "UPDATE//v1/pods/default/api");
    }

    #[tokio::test]
    async fn test_malformed_key_is_forgotten() {
        let op = operator();
        op.process_key(&"UPDATE/only/three".to_string()).await;
        assert!(op.queue().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_uses_item_key() {
        let op = operator();
        op.enqueue(&item(Operation::Update, "pods", "web"));
        assert_eq!(
            op.queue().get().await.unwrap(),
            "UPDATE//v1/pods/default/web"
        );
    }

    // ==========================================================================
    // Registration lifecycle
    // ==========================================================================

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let op = operator();
        let pods = Scripted::new("pods", "pods", &[]);
        op.register_handler(pods.clone()).unwrap();

        let err = op.register_handler(pods).unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));

        // A distinct instance with the same name is fine
        op.register_handler(Scripted::new("pods", "pods", &[]))
            .unwrap();
    }

    #[tokio::test]
    async fn test_registration_after_start_rejected() {
        let op = operator();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        op.start(shutdown.clone()).await.unwrap();
        assert!(op.is_started());
        assert!(op.queue().is_shutting_down());

        let err = op
            .register_handler(Scripted::new("late", "pods", &[]))
            .unwrap_err();
        assert!(err.to_string().contains("already started"));
        assert!(op.start(shutdown).await.is_err());
    }

    /// Informer that stops on its own without ever syncing
    struct Stopping {
        fail: bool,
    }

    #[async_trait]
    impl Informer for Stopping {
        fn name(&self) -> &str {
            "stopping"
        }

        async fn run(&self, _queue: KeyQueue, _shutdown: CancellationToken) -> Result<()> {
            if self.fail {
                Err(Error::registration("stopping", "informer is already running"))
            } else {
                Ok(())
            }
        }

        async fn wait_for_sync(&self, shutdown: &CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            Err(Error::cancelled("cache sync for stopping"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_informer_stopping_before_sync_fails_startup() {
        for fail in [true, false] {
            let op = operator();
            let pods = Scripted::new("pods", "pods", &[]);
            op.register_handler(pods.clone()).unwrap();
            op.register_informer(Arc::new(Stopping { fail })).unwrap();
            op.enqueue(&item(Operation::Update, "pods", "web"));

            let start = op.start(CancellationToken::new());
            let err = tokio::time::timeout(Duration::from_secs(60), start)
                .await
                .expect("startup must not hang")
                .unwrap_err();

            assert!(err.to_string().contains("before its cache synced"));
            assert_eq!(pods.calls(), 0);
            assert!(op.queue().is_shutting_down());
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = OperatorConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(Operator::new(config).is_err());
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize(Duration::from_secs(300)), "300s");
        assert_eq!(humanize(Duration::from_millis(50)), "50ms");
    }
}
