//! Event ingestion
//!
//! Informers turn object events from a source into work item keys on the
//! operator's queue. [`ResourceEventHandler`] does the translation;
//! [`KubeInformer`] drives it from a kube-rs watcher and [`ChannelInformer`]
//! from an in-process channel.
//!
//! The operation recorded on a key (ADD, UPDATE, DELETE) is informational:
//! the dispatch loop rewrites it to UPDATE before any handler sees it.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use keel_common::{Error, Operation, Result, WorkItem};

use crate::queue::WorkQueue;

/// Shared queue of work item keys
pub type KeyQueue = Arc<WorkQueue<String>>;

/// Predicate selecting which objects produce work items
pub type ObjectFilter<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// Group, version and kind stamped on every work item from a source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    /// API group, empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind as it appears in work items
    pub kind: String,
}

impl ResourceKind {
    /// Explicit group/version/kind
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Derive from a static Kubernetes type; kind is the plural resource name
    pub fn of<K>() -> Self
    where
        K: Resource,
        K::DynamicType: Default,
    {
        let dt = K::DynamicType::default();
        Self::new(K::group(&dt), K::version(&dt), K::plural(&dt))
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Translates object callbacks into work item keys on the queue
pub struct ResourceEventHandler<K> {
    queue: KeyQueue,
    resource: ResourceKind,
    filter: Option<ObjectFilter<K>>,
}

impl<K> Clone for ResourceEventHandler<K> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            resource: self.resource.clone(),
            filter: self.filter.clone(),
        }
    }
}

impl<K: Resource> ResourceEventHandler<K> {
    /// Handler pushing keys for `resource` onto `queue`
    pub fn new(queue: KeyQueue, resource: ResourceKind) -> Self {
        Self {
            queue,
            resource,
            filter: None,
        }
    }

    /// Only enqueue objects accepted by `filter`
    pub fn with_filter(mut self, filter: Option<ObjectFilter<K>>) -> Self {
        self.filter = filter;
        self
    }

    /// Object was created or first observed
    pub fn on_add(&self, obj: &K) {
        self.enqueue(Operation::Add, obj);
    }

    /// Object changed
    ///
    /// Periodic resyncs deliver updates where nothing changed; those are
    /// skipped when both versions carry the same resourceVersion.
    pub fn on_update(&self, old: &K, new: &K) {
        self.on_update_from(old.resource_version().as_deref(), new);
    }

    /// Object changed from a previously seen `old_version`
    fn on_update_from(&self, old_version: Option<&str>, new: &K) {
        if old_version.is_some() && old_version == new.meta().resource_version.as_deref() {
            trace!(name = %new.name_any(), "Skipping resync of unchanged object");
            return;
        }
        self.enqueue(Operation::Update, new);
    }

    /// Object was removed
    pub fn on_delete(&self, obj: &K) {
        self.enqueue(Operation::Delete, obj);
    }

    /// Whether `obj` passes the filter
    fn accepts(&self, obj: &K) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(obj))
    }

    fn enqueue(&self, operation: Operation, obj: &K) {
        if self.accepts(obj) {
            self.push(operation, &obj.namespace().unwrap_or_default(), &obj.name_any());
        }
    }

    fn push(&self, operation: Operation, namespace: &str, name: &str) {
        let item = WorkItem::new(
            operation,
            self.resource.group.as_str(),
            self.resource.version.as_str(),
            self.resource.kind.as_str(),
            namespace,
            name,
        );
        match item {
            Ok(item) => {
                trace!(item = %item, "Enqueued");
                self.queue.add(item.key());
            }
            Err(e) => warn!(
                resource = %self.resource,
                name = %name,
                error = %e,
                "Cannot build work item for object"
            ),
        }
    }
}

/// Source of object events feeding the queue
#[async_trait]
pub trait Informer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Deliver events onto `queue` until `shutdown` is cancelled
    async fn run(&self, queue: KeyQueue, shutdown: CancellationToken) -> Result<()>;

    /// Wait until the initial listing has been delivered
    ///
    /// Returns [`Error::Cancelled`] if `shutdown` fires first.
    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> Result<()>;
}

/// Sync flag shared between an informer's run loop and its waiters
struct SyncState {
    tx: watch::Sender<bool>,
}

impl SyncState {
    fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    fn mark(&self) {
        self.tx.send_replace(true);
    }

    fn is_synced(&self) -> bool {
        *self.tx.borrow()
    }

    async fn wait(&self, name: &str, shutdown: &CancellationToken) -> Result<()> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            res = rx.wait_for(|synced| *synced) => res
                .map(|_| ())
                .map_err(|_| Error::cancelled(format!("cache sync for {name}"))),
            _ = shutdown.cancelled() => Err(Error::cancelled(format!("cache sync for {name}"))),
        }
    }
}

/// Informer backed by a kube-rs watcher and reflector store
pub struct KubeInformer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    name: String,
    api: Api<K>,
    config: watcher::Config,
    resource: ResourceKind,
    filter: Option<ObjectFilter<K>>,
    reader: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    synced: SyncState,
}

impl<K> KubeInformer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Watch every object `api` can see
    pub fn new(api: Api<K>) -> Self {
        let resource = ResourceKind::of::<K>();
        let (reader, writer) = reflector::store();
        Self {
            name: resource.to_string(),
            api,
            config: watcher::Config::default(),
            resource,
            filter: None,
            reader,
            writer: Mutex::new(Some(writer)),
            synced: SyncState::new(),
        }
    }

    /// Use custom watch parameters (label or field selectors)
    pub fn with_config(mut self, config: watcher::Config) -> Self {
        self.config = config;
        self
    }

    /// Only enqueue objects accepted by `filter`
    pub fn with_filter(mut self, filter: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Override the kind recorded on work items
    pub fn with_resource(mut self, resource: ResourceKind) -> Self {
        self.resource = resource;
        self
    }

    /// Local cache of watched objects, populated once synced
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }
}

#[async_trait]
impl<K> Informer for KubeInformer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, queue: KeyQueue, shutdown: CancellationToken) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| Error::registration(&self.name, "informer is already running"))?;

        let handler =
            ResourceEventHandler::new(queue, self.resource.clone()).with_filter(self.filter.clone());
        let mut state = WatchState::default();

        let stream = reflector::reflector(
            writer,
            watcher::watcher(self.api.clone(), self.config.clone()),
        )
        .default_backoff();
        tokio::pin!(stream);

        info!(informer = %self.name, "Starting informer");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        if state.apply(event, &handler) {
                            debug!(informer = %self.name, "Cache synced");
                            self.synced.mark();
                        }
                    }
                    Some(Err(e)) => warn!(informer = %self.name, error = %e, "Watch error, backing off"),
                    None => break,
                },
            }
        }
        info!(informer = %self.name, "Informer stopped");
        Ok(())
    }

    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> Result<()> {
        self.synced.wait(&self.name, shutdown).await
    }
}

/// Namespace and name of a watched object
type ObjectRef = (String, String);

/// Versions of the objects seen on a watch, used to tell adds from updates
/// and to find objects that vanished while the watch was being re-listed.
/// Only objects passing the filter are tracked.
#[derive(Default)]
struct WatchState {
    known: HashMap<ObjectRef, Option<String>>,
    relist: Option<HashSet<ObjectRef>>,
}

fn object_ref<K: Resource>(obj: &K) -> ObjectRef {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

impl WatchState {
    /// Feed one watcher event to `handler`; returns true when a listing completes
    fn apply<K: Resource>(
        &mut self,
        event: watcher::Event<K>,
        handler: &ResourceEventHandler<K>,
    ) -> bool {
        match event {
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                false
            }
            watcher::Event::InitApply(obj) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(object_ref(&obj));
                }
                self.upsert(&obj, handler);
                false
            }
            watcher::Event::InitDone => {
                if let Some(seen) = self.relist.take() {
                    self.known.retain(|(namespace, name), _| {
                        let present = seen.contains(&(namespace.clone(), name.clone()));
                        if !present {
                            handler.push(Operation::Delete, namespace, name);
                        }
                        present
                    });
                }
                true
            }
            watcher::Event::Apply(obj) => {
                self.upsert(&obj, handler);
                false
            }
            watcher::Event::Delete(obj) => {
                self.known.remove(&object_ref(&obj));
                handler.on_delete(&obj);
                false
            }
        }
    }

    fn upsert<K: Resource>(&mut self, obj: &K, handler: &ResourceEventHandler<K>) {
        let key = object_ref(obj);
        if !handler.accepts(obj) {
            self.known.remove(&key);
            return;
        }
        let version = obj.meta().resource_version.clone();
        match self.known.insert(key, version) {
            Some(old_version) => handler.on_update_from(old_version.as_deref(), obj),
            None => handler.on_add(obj),
        }
    }
}

enum ChannelEvent<K> {
    Add(K),
    Update(K, K),
    Delete(K),
    Synced,
}

/// Informer fed by an in-process channel
///
/// Used for event sources that are not Kubernetes watches and for driving
/// the operator in tests. Events sent before `run` starts are buffered.
pub struct ChannelInformer<K> {
    name: String,
    resource: ResourceKind,
    filter: Option<ObjectFilter<K>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent<K>>>>,
    synced: SyncState,
}

/// Sending side of a [`ChannelInformer`]
pub struct ChannelInformerHandle<K> {
    tx: mpsc::UnboundedSender<ChannelEvent<K>>,
}

impl<K> Clone for ChannelInformerHandle<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K> ChannelInformerHandle<K> {
    fn send(&self, event: ChannelEvent<K>) {
        if self.tx.send(event).is_err() {
            debug!("Channel informer stopped, dropping event");
        }
    }

    /// Report a new object
    pub fn add(&self, obj: K) {
        self.send(ChannelEvent::Add(obj));
    }

    /// Report a changed object
    pub fn update(&self, old: K, new: K) {
        self.send(ChannelEvent::Update(old, new));
    }

    /// Report a removed object
    pub fn delete(&self, obj: K) {
        self.send(ChannelEvent::Delete(obj));
    }

    /// Report that the initial state has been delivered
    pub fn mark_synced(&self) {
        self.send(ChannelEvent::Synced);
    }
}

impl<K: Resource + Send + Sync + 'static> ChannelInformer<K> {
    /// Informer stamping work items with `resource`
    pub fn new(name: impl Into<String>, resource: ResourceKind) -> (Self, ChannelInformerHandle<K>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let informer = Self {
            name: name.into(),
            resource,
            filter: None,
            events: Mutex::new(Some(rx)),
            synced: SyncState::new(),
        };
        (informer, ChannelInformerHandle { tx })
    }

    /// Only enqueue objects accepted by `filter`
    pub fn with_filter(mut self, filter: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Whether a sync marker has been processed
    pub fn has_synced(&self) -> bool {
        self.synced.is_synced()
    }
}

#[async_trait]
impl<K: Resource + Send + Sync + 'static> Informer for ChannelInformer<K> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, queue: KeyQueue, shutdown: CancellationToken) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| Error::registration(&self.name, "informer is already running"))?;
        let handler =
            ResourceEventHandler::new(queue, self.resource.clone()).with_filter(self.filter.clone());

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(ChannelEvent::Add(obj)) => handler.on_add(&obj),
                Some(ChannelEvent::Update(old, new)) => handler.on_update(&old, &new),
                Some(ChannelEvent::Delete(obj)) => handler.on_delete(&obj),
                Some(ChannelEvent::Synced) => self.synced.mark(),
                // Every handle dropped; nothing more will arrive
                None => {
                    shutdown.cancelled().await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> Result<()> {
        self.synced.wait(&self.name, shutdown).await
    }
}
