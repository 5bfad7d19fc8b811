//! Event Bus implementation

use crate::config::{DeadEventPolicy, EventBusConfig};
use crate::dispatch::{Dispatcher, PublishFuture};
use crate::error::{EventBusError, PublishError, Result};
use crate::event::{DynEvent, Event, FnListener, Handlers, Listener, ListenerResult, Subscriber};
use crate::registry::Registry;
use crate::subscription::{
    Binding, SubscriptionHandle, extract_concrete, extract_event, extract_view,
};
use crate::types::TypeKey;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closed,
}

struct Inner {
    id: Uuid,
    config: EventBusConfig,
    state: RwLock<State>,
    registry: Registry,
    dispatcher: Dispatcher,
    workers: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.get_mut().take() {
            workers.shutdown_background();
        }
    }
}

/// Event bus for in-process, type-hierarchy aware publishing
///
/// Cloning is cheap and every clone refers to the same bus. Listeners that
/// publish again should hold a [`WeakEventBus`], otherwise the bus keeps
/// itself alive through its own registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create new event bus
    pub fn new() -> Result<Self> {
        Self::with_config(EventBusConfig::default())
    }

    /// Create event bus with custom config
    ///
    /// Starts the bus's worker runtime.
    pub fn with_config(config: EventBusConfig) -> Result<Self> {
        config.validate()?;

        let threads = config.effective_worker_threads();
        let workers = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()?;

        let id = Uuid::new_v4();
        if config.enable_logging {
            info!(bus = %id, workers = threads, "Event bus started");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                state: RwLock::new(State::Open),
                registry: Registry::new(),
                dispatcher: Dispatcher::new(
                    config.dead_events,
                    config.max_publish_depth,
                    config.enable_logging,
                ),
                handle: workers.handle().clone(),
                workers: Mutex::new(Some(workers)),
                config,
            }),
        })
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Unique id of this bus.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// Subscribe a listener to the concrete event type `E`
    ///
    /// Events that declare `E` as a supertype are delivered too.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let bus = EventBus::new()?;
    /// let handle = bus.subscribe::<UserCreated, _>(WelcomeMailer::new())?;
    /// ```
    pub fn subscribe<E, L>(&self, listener: L) -> Result<SubscriptionHandle>
    where
        E: Event,
        L: Listener<E>,
    {
        self.subscribe_arc(Arc::new(listener))
    }

    /// Subscribe a shared listener; subscribing the same `Arc` twice under
    /// the same type is a no-op.
    pub fn subscribe_arc<E, L>(&self, listener: Arc<L>) -> Result<SubscriptionHandle>
    where
        E: Event,
        L: Listener<E>,
    {
        let binding = Binding::listener(listener, extract_concrete::<E>);
        self.register(vec![(TypeKey::of::<E>(), binding)])
    }

    /// Subscribe a listener to a supertype, usually a trait object such as
    /// `dyn Audited`.
    ///
    /// ```rust,ignore
    /// bus.subscribe_as::<dyn Audited, _>(FnListener::new(|event: &dyn Audited| {
    ///     println!("{} did something", event.actor());
    ///     Ok(Reply::Done)
    /// }))?;
    /// ```
    pub fn subscribe_as<T, L>(&self, listener: L) -> Result<SubscriptionHandle>
    where
        T: ?Sized + Sync + 'static,
        L: Listener<T>,
    {
        let binding = Binding::listener(Arc::new(listener), extract_view::<T>);
        self.register(vec![(TypeKey::of::<T>(), binding)])
    }

    /// Subscribe a closure to the concrete event type `E`.
    pub fn subscribe_fn<E, F>(&self, f: F) -> Result<SubscriptionHandle>
    where
        E: Event,
        F: Fn(&E) -> ListenerResult + Send + Sync + 'static,
    {
        self.subscribe::<E, _>(FnListener::<E, _>::new(f))
    }

    /// Subscribe a listener under an explicit key, such as a parameterized
    /// key. The listener receives the event as `&dyn Event`.
    pub fn subscribe_key<L>(&self, key: TypeKey, listener: L) -> Result<SubscriptionHandle>
    where
        L: Listener<DynEvent>,
    {
        let binding = Binding::listener(Arc::new(listener), extract_event);
        self.register(vec![(key, binding)])
    }

    /// Subscribe every handler declared by `target`
    ///
    /// Fails with [`EventBusError::NoHandlers`] when the table is empty.
    pub fn subscribe_target<S: Subscriber>(&self, target: Arc<S>) -> Result<SubscriptionHandle> {
        self.ensure_open()?;

        let mut handlers = Handlers::new();
        S::handlers(&mut handlers);
        if handlers.is_empty() {
            return Err(EventBusError::NoHandlers {
                target: std::any::type_name::<S>(),
            });
        }

        let bindings = handlers
            .entries
            .into_iter()
            .map(|entry| (entry.key, (entry.bind)(Arc::clone(&target))))
            .collect();
        self.register(bindings)
    }

    fn register(&self, bindings: Vec<(TypeKey, Binding)>) -> Result<SubscriptionHandle> {
        let state = self.inner.state.read();
        if *state == State::Closed {
            return Err(EventBusError::Closed);
        }

        let entries = self.inner.registry.register_all(bindings);
        drop(state);

        if self.inner.config.enable_logging {
            for (key, id) in &entries {
                debug!(bus = %self.inner.id, key = %key, subscription = %id, "Subscribed listener");
            }
        }

        Ok(SubscriptionHandle::new(self.inner.id, entries))
    }

    fn ensure_open(&self) -> Result<()> {
        match *self.inner.state.read() {
            State::Open => Ok(()),
            State::Closed => Err(EventBusError::Closed),
        }
    }

    /// Remove the subscriptions behind `handle`
    ///
    /// Idempotent. A listener subscribed twice under the same key shares
    /// one subscription, so either handle removes it.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        if handle.bus() != self.inner.id {
            return Err(EventBusError::ForeignHandle);
        }

        let state = self.inner.state.read();
        if *state == State::Closed {
            return Err(EventBusError::Closed);
        }

        for (key, id) in handle.entries() {
            let removed = self.inner.registry.unregister(key, *id);
            if removed && self.inner.config.enable_logging {
                debug!(bus = %self.inner.id, key = %key, subscription = %id, "Unsubscribed listener");
            }
        }
        Ok(())
    }

    /// Publish an event
    ///
    /// Never blocks and never fails synchronously: every matching listener
    /// is scheduled on the worker pool and the returned future resolves
    /// once all of them completed.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let bus = EventBus::new()?;
    /// let delivery = bus.publish(UserCreated::new("alice")).await?;
    /// println!("delivered to {} listener(s)", delivery.delivered());
    /// ```
    pub fn publish<E: Event>(&self, event: E) -> PublishFuture {
        self.publish_arc(Arc::new(event))
    }

    /// Publish an already shared event.
    pub fn publish_arc(&self, event: Arc<DynEvent>) -> PublishFuture {
        let state = self.inner.state.read();
        if *state == State::Closed {
            return PublishFuture::failed(PublishError::Closed);
        }

        self.inner
            .dispatcher
            .dispatch(event, &self.inner.registry, &self.inner.handle)
    }

    /// Close the bus
    ///
    /// Drops every subscription and stops the worker pool without waiting:
    /// in-flight listeners are interrupted and their publishes fail with
    /// [`PublishError::Interrupted`]. Idempotent.
    pub fn close(&self) {
        let workers = {
            let mut state = self.inner.state.write();
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
            self.inner.registry.clear();
            self.inner.workers.lock().take()
        };

        if let Some(workers) = workers {
            workers.shutdown_background();
        }

        if self.inner.config.enable_logging {
            info!(bus = %self.inner.id, "Event bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.state.read() == State::Closed
    }

    /// Total number of subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Get handler count registered directly under `T`
    pub fn handler_count<T: ?Sized + 'static>(&self) -> usize {
        self.inner.registry.count(&TypeKey::of::<T>())
    }

    /// Keys `event` is dispatched under, most specific first.
    pub fn dispatch_keys(&self, event: &DynEvent) -> Vec<TypeKey> {
        self.inner
            .dispatcher
            .matcher()
            .keys_for(event)
            .keys()
            .cloned()
            .collect()
    }

    /// Non-owning handle for listeners that publish back into this bus.
    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// Weak reference to an [`EventBus`].
#[derive(Clone)]
pub struct WeakEventBus {
    inner: Weak<Inner>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }

    /// Publish if the bus is still alive; otherwise the future fails with
    /// [`PublishError::Closed`].
    pub fn publish<E: Event>(&self, event: E) -> PublishFuture {
        match self.upgrade() {
            Some(bus) => bus.publish(event),
            None => PublishFuture::failed(PublishError::Closed),
        }
    }
}

impl fmt::Debug for WeakEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakEventBus")
    }
}

/// Event bus builder
pub struct EventBusBuilder {
    config: EventBusConfig,
}

impl EventBusBuilder {
    /// Create new event bus builder
    pub fn new() -> Self {
        Self {
            config: EventBusConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: EventBusConfig) -> Self {
        self.config = config;
        self
    }

    /// Set worker threads
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = Some(count);
        self
    }

    /// Cap worker threads when not set explicitly
    pub fn max_worker_threads(mut self, count: usize) -> Self {
        self.config.max_worker_threads = count;
        self
    }

    /// Set worker thread name
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Set dead event policy
    pub fn dead_events(mut self, policy: DeadEventPolicy) -> Self {
        self.config.dead_events = policy;
        self
    }

    /// Limit nested publishes (None = unbounded)
    pub fn max_publish_depth(mut self, depth: Option<usize>) -> Self {
        self.config.max_publish_depth = depth;
        self
    }

    /// Enable/disable logging
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.config.enable_logging = enabled;
        self
    }

    /// Build the event bus
    pub fn build(self) -> Result<EventBus> {
        EventBus::with_config(self.config)
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}
