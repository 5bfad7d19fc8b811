//! Event and listener definitions

use crate::dispatch::{Delivery, PublishFuture};
use crate::error::BoxError;
use crate::types::{ConcreteType, EventType, TypeKey};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Event trait
///
/// Anything published through the bus. The default [`event_type`](Event::event_type)
/// describes the concrete type alone; override it to declare supertypes or a
/// reified parameterization. The declaration must be the same for every value
/// of a given concrete type, because it is cached per type.
pub trait Event: Any + Send + Sync + Debug + ConcreteType {
    /// Declared type of this event.
    fn event_type(&self) -> EventType {
        EventType::interface::<Self>().build()
    }
}

/// The universal root type, `dyn Event`.
pub type DynEvent = dyn Event;

/// Value carried by a [`Reply`].
pub type Value = Box<dyn Any + Send>;

/// Result returned by every listener callback.
pub type ListenerResult = Result<Reply, BoxError>;

/// What a listener hands back to the bus.
pub enum Reply {
    /// Handling is complete.
    Done,

    /// Handling is complete and produced a value.
    Value(Value),

    /// Handling completes when this future does.
    ///
    /// The bus awaits it once; its outcome is the invocation's outcome.
    Deferred(BoxFuture<'static, Result<Option<Value>, BoxError>>),
}

impl Reply {
    pub fn value<V: Any + Send>(value: V) -> Self {
        Reply::Value(Box::new(value))
    }

    /// Defer completion to `future`.
    pub fn defer<F, V, E>(future: F) -> Self
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
        V: Any + Send,
        E: Into<BoxError>,
    {
        Reply::Deferred(
            async move {
                future
                    .await
                    .map(|value| Some(Box::new(value) as Value))
                    .map_err(Into::into)
            }
            .boxed(),
        )
    }
}

/// A nested publish deferred as a reply completes with the nested outcome.
impl From<PublishFuture> for Reply {
    fn from(publish: PublishFuture) -> Self {
        Reply::Deferred(
            async move {
                publish
                    .await
                    .map(Delivery::into_value)
                    .map_err(|err| Box::new(err) as BoxError)
            }
            .boxed(),
        )
    }
}

impl Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Done => f.write_str("Done"),
            Reply::Value(_) => f.write_str("Value(..)"),
            Reply::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Event listener trait
///
/// `T` is either a concrete event type or a supertype such as `dyn Audited`.
#[async_trait]
pub trait Listener<T: ?Sized + Sync>: Send + Sync + 'static {
    /// Handle the event
    async fn on_event(&self, event: &T) -> ListenerResult;

    /// Whether concurrent invocations are allowed. When `false` the bus
    /// serializes calls to this listener, except for invocations caused by
    /// the listener's own publishes, so awaiting a republish inside
    /// `on_event` cannot deadlock.
    fn thread_safe(&self) -> bool {
        false
    }

    /// Name reported in failures and logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Listener backed by a synchronous closure.
pub struct FnListener<T: ?Sized, F> {
    f: F,
    thread_safe: bool,
    _marker: PhantomData<fn(&T)>,
}

impl<T: ?Sized, F> FnListener<T, F> {
    pub fn new(f: F) -> Self
    where
        F: Fn(&T) -> ListenerResult + Send + Sync + 'static,
    {
        Self {
            f,
            thread_safe: false,
            _marker: PhantomData,
        }
    }

    /// Allow concurrent invocations
    pub fn allow_concurrent(mut self, enabled: bool) -> Self {
        self.thread_safe = enabled;
        self
    }
}

#[async_trait]
impl<T, F> Listener<T> for FnListener<T, F>
where
    T: ?Sized + Sync + 'static,
    F: Fn(&T) -> ListenerResult + Send + Sync + 'static,
{
    async fn on_event(&self, event: &T) -> ListenerResult {
        (self.f)(event)
    }

    fn thread_safe(&self) -> bool {
        self.thread_safe
    }
}

/// A target that lists its own handler methods.
///
/// Replaces reflective handler discovery with an explicit table:
///
/// ```rust,ignore
/// struct Mailer;
///
/// impl Mailer {
///     fn on_user_created(&self, event: &UserCreated) -> ListenerResult {
///         Ok(Reply::Done)
///     }
/// }
///
/// impl Subscriber for Mailer {
///     fn handlers(handlers: &mut Handlers<Self>) {
///         handlers.on("on_user_created", Self::on_user_created);
///     }
/// }
///
/// bus.subscribe_target(Arc::new(Mailer))?;
/// ```
pub trait Subscriber: Send + Sync + Sized + 'static {
    fn handlers(handlers: &mut Handlers<Self>);
}

/// Handler method on a [`Subscriber`].
pub type Method<S, T> = for<'a, 'b> fn(&'a S, &'b T) -> ListenerResult;

/// Registration table filled by [`Subscriber::handlers`].
pub struct Handlers<S> {
    pub(crate) entries: Vec<HandlerEntry<S>>,
}

pub(crate) struct HandlerEntry<S> {
    pub(crate) key: TypeKey,
    pub(crate) bind: Box<dyn FnOnce(Arc<S>) -> crate::subscription::Binding + Send>,
}

impl<S: Subscriber> Handlers<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Handle the concrete event `E` (and events that extend it).
    pub fn on<E: Event>(&mut self, name: &'static str, method: Method<S, E>) -> &mut Self {
        self.push(name, method, false, crate::subscription::extract_concrete::<E>)
    }

    /// Like [`on`](Self::on), allowing concurrent invocations.
    pub fn on_concurrent<E: Event>(&mut self, name: &'static str, method: Method<S, E>) -> &mut Self {
        self.push(name, method, true, crate::subscription::extract_concrete::<E>)
    }

    /// Handle a supertype such as `dyn Audited`.
    pub fn on_as<T: ?Sized + Sync + 'static>(
        &mut self,
        name: &'static str,
        method: Method<S, T>,
    ) -> &mut Self {
        self.push(name, method, false, crate::subscription::extract_view::<T>)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push<T: ?Sized + Sync + 'static>(
        &mut self,
        name: &'static str,
        method: Method<S, T>,
        thread_safe: bool,
        extract: crate::subscription::Extract<T>,
    ) -> &mut Self {
        self.entries.push(HandlerEntry {
            key: TypeKey::of::<T>(),
            bind: Box::new(move |target: Arc<S>| {
                let listener = MethodListener {
                    target,
                    method,
                    name,
                    thread_safe,
                };
                crate::subscription::Binding::method(listener, extract)
            }),
        });
        self
    }
}

/// A handler method bound to its target.
pub(crate) struct MethodListener<S, T: ?Sized> {
    pub(crate) target: Arc<S>,
    method: Method<S, T>,
    name: &'static str,
    thread_safe: bool,
}

#[async_trait]
impl<S, T> Listener<T> for MethodListener<S, T>
where
    S: Send + Sync + 'static,
    T: ?Sized + Sync + 'static,
{
    async fn on_event(&self, event: &T) -> ListenerResult {
        (self.method)(&self.target, event)
    }

    fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Published in place of an event nobody listened to, when the bus is
/// configured with [`DeadEventPolicy::Republish`](crate::DeadEventPolicy::Republish).
#[derive(Debug, Clone)]
pub struct DeadEvent {
    event: Arc<DynEvent>,
}

impl DeadEvent {
    pub(crate) fn new(event: Arc<DynEvent>) -> Self {
        Self { event }
    }

    /// The undelivered event.
    pub fn event(&self) -> &Arc<DynEvent> {
        &self.event
    }
}

impl Event for DeadEvent {}
