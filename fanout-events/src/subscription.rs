//! Subscriptions: one listener bound to one dispatch key

use crate::error::{ListenerError, ListenerFailure};
use crate::event::{DynEvent, Event, Listener, MethodListener, Reply, Value};
use crate::types::{TypeKey, View};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

tokio::task_local! {
    /// Subscriptions whose invocations led, through nested publishes, to the
    /// current task.
    static CALLERS: Arc<[usize]>;
}

/// Identifier of a registered subscription, unique per bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Token returned by every subscribe call; pass it to
/// [`EventBus::unsubscribe`](crate::EventBus::unsubscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    bus: Uuid,
    entries: Vec<(TypeKey, SubscriptionId)>,
}

impl SubscriptionHandle {
    pub(crate) fn new(bus: Uuid, entries: Vec<(TypeKey, SubscriptionId)>) -> Self {
        Self { bus, entries }
    }

    pub(crate) fn bus(&self) -> Uuid {
        self.bus
    }

    pub(crate) fn entries(&self) -> &[(TypeKey, SubscriptionId)] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.entries.iter().map(|(_, id)| *id)
    }

    /// Number of subscriptions covered by this handle.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Finds the `T` a listener expects inside a dispatched event.
pub(crate) type Extract<T> = for<'a> fn(&'a DynEvent, Option<&'a View>) -> Option<&'a T>;

/// Concrete event types: through the dispatch view, else by downcasting.
pub(crate) fn extract_concrete<'a, E: Event>(
    event: &'a DynEvent,
    view: Option<&'a View>,
) -> Option<&'a E> {
    view.and_then(|view| view.cast::<E>(event))
        .or_else(|| (event as &dyn Any).downcast_ref::<E>())
}

/// Supertypes: only through the dispatch view.
pub(crate) fn extract_view<'a, T: ?Sized + 'static>(
    event: &'a DynEvent,
    view: Option<&'a View>,
) -> Option<&'a T> {
    view.and_then(|view| view.cast::<T>(event))
}

/// The event itself, whatever key it matched.
pub(crate) fn extract_event<'a>(event: &'a DynEvent, _view: Option<&'a View>) -> Option<&'a DynEvent> {
    Some(event)
}

type Invoker = Arc<
    dyn Fn(Arc<DynEvent>, Option<View>) -> BoxFuture<'static, Result<Reply, ListenerError>>
        + Send
        + Sync,
>;

/// A listener with its identity, erased over the type it handles.
pub(crate) struct Binding {
    identity: usize,
    target: String,
    callback: &'static str,
    thread_safe: bool,
    invoke: Invoker,
}

impl Binding {
    /// Bind a [`Listener`]; the `Arc` is the target identity.
    pub(crate) fn listener<T, L>(listener: Arc<L>, extract: Extract<T>) -> Self
    where
        T: ?Sized + Sync + 'static,
        L: Listener<T>,
    {
        let identity = Arc::as_ptr(&listener) as *const () as usize;
        Self {
            identity,
            target: format!("{}@{:#x}", listener.name(), identity),
            callback: "on_event",
            thread_safe: listener.thread_safe(),
            invoke: invoker(listener, extract),
        }
    }

    /// Bind a handler method; the target `Arc` is the identity.
    pub(crate) fn method<S, T>(listener: MethodListener<S, T>, extract: Extract<T>) -> Self
    where
        S: Send + Sync + 'static,
        T: ?Sized + Sync + 'static,
    {
        let identity = Arc::as_ptr(&listener.target) as *const () as usize;
        Self {
            identity,
            target: format!("{}@{:#x}", std::any::type_name::<S>(), identity),
            callback: listener.name(),
            thread_safe: listener.thread_safe(),
            invoke: invoker(Arc::new(listener), extract),
        }
    }
}

fn invoker<T, L>(listener: Arc<L>, extract: Extract<T>) -> Invoker
where
    T: ?Sized + Sync + 'static,
    L: Listener<T>,
{
    Arc::new(move |event: Arc<DynEvent>, view: Option<View>| {
        let listener = Arc::clone(&listener);
        async move {
            let Some(typed) = extract(&*event, view.as_ref()) else {
                return Err(ListenerError::TypeMismatch {
                    expected: std::any::type_name::<T>(),
                });
            };
            listener.on_event(typed).await.map_err(ListenerError::Failed)
        }
        .boxed()
    })
}

/// One listener bound to one key.
///
/// Two subscriptions are equal when they share key, target identity and
/// callback; the registry uses this to refuse duplicates.
pub struct Subscription {
    id: SubscriptionId,
    key: TypeKey,
    binding: Binding,
    serial: Mutex<()>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, key: TypeKey, binding: Binding) -> Self {
        Self {
            id,
            key,
            binding,
            serial: Mutex::new(()),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Listener type name and address.
    pub fn target(&self) -> &str {
        &self.binding.target
    }

    pub fn callback(&self) -> &'static str {
        self.binding.callback
    }

    pub fn is_thread_safe(&self) -> bool {
        self.binding.thread_safe
    }

    /// Invoke the listener with `event`.
    ///
    /// Failures of any kind are logged and returned, never raised. The caller
    /// chain is captured when this is called, so call it from the publishing
    /// task and spawn the returned future.
    pub(crate) fn invoke(
        self: Arc<Self>,
        event: Arc<DynEvent>,
        view: Option<View>,
    ) -> impl Future<Output = Result<Option<Value>, ListenerFailure>> + Send + 'static {
        let address = Arc::as_ptr(&self) as usize;
        let callers = CALLERS
            .try_with(Arc::clone)
            .unwrap_or_else(|_| Arc::from(Vec::new()));
        let reentrant = callers.contains(&address);
        let chain: Arc<[usize]> = callers.iter().copied().chain([address]).collect();

        CALLERS.scope(chain, self.run(event, view, reentrant))
    }

    // A reentrant invocation was caused by one of this subscription's own
    // invocations, which may still hold the serial lock while awaiting it.
    async fn run(
        self: Arc<Self>,
        event: Arc<DynEvent>,
        view: Option<View>,
        reentrant: bool,
    ) -> Result<Option<Value>, ListenerFailure> {
        let reply = {
            let _serial = if self.binding.thread_safe || reentrant {
                None
            } else {
                Some(self.serial.lock().await)
            };
            AssertUnwindSafe((self.binding.invoke)(Arc::clone(&event), view))
                .catch_unwind()
                .await
        };

        let outcome = match reply {
            Ok(Ok(Reply::Done)) => Ok(None),
            Ok(Ok(Reply::Value(value))) => Ok(Some(value)),
            Ok(Ok(Reply::Deferred(deferred))) => {
                match AssertUnwindSafe(deferred).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(ListenerError::Deferred(err)),
                    Err(panic) => Err(ListenerError::Panicked(panic_message(panic))),
                }
            }
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(ListenerError::Panicked(panic_message(panic))),
        };

        outcome.map_err(|cause| {
            let failure = self.failure(&*event, cause);
            error!(
                event = %failure.event(),
                key = %self.key,
                target = %self.binding.target,
                callback = self.binding.callback,
                cause = %failure.cause(),
                "Listener failed"
            );
            failure
        })
    }

    pub(crate) fn failure(&self, event: &DynEvent, cause: ListenerError) -> ListenerFailure {
        ListenerFailure::new(
            format!("{event:?}"),
            self.key.clone(),
            self.binding.target.clone(),
            self.binding.callback,
            cause,
        )
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.binding.identity == other.binding.identity
            && self.binding.callback == other.binding.callback
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("target", &self.binding.target)
            .field("callback", &self.binding.callback)
            .field("thread_safe", &self.binding.thread_safe)
            .finish()
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
