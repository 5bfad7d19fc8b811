//! Fan-out of one event to its matching subscriptions

use crate::config::DeadEventPolicy;
use crate::error::{Failures, ListenerFailure, PublishError};
use crate::event::{DeadEvent, DynEvent, Value};
use crate::registry::Registry;
use crate::types::TypeMatcher;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

tokio::task_local! {
    static PUBLISH_DEPTH: usize;
}

/// Nesting depth of the publish currently running on this task.
///
/// `0` outside listeners; a listener invoked by a top-level publish runs at
/// depth `1`.
pub fn current_depth() -> usize {
    PUBLISH_DEPTH.try_with(|depth| *depth).unwrap_or(0)
}

/// Successful outcome of a publish.
pub struct Delivery {
    delivered: usize,
    value: Option<Value>,
}

impl Delivery {
    fn new(delivered: usize, value: Option<Value>) -> Self {
        Self { delivered, value }
    }

    /// Number of subscriptions the event was delivered to.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// `true` when no subscription matched the event.
    pub fn is_dead(&self) -> bool {
        self.delivered == 0
    }

    /// Value produced by the listener, when exactly one was invoked.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<Value> {
        self.value
    }

    /// Take the value as a `V`.
    pub fn downcast<V: Any>(self) -> Option<V> {
        self.value?.downcast::<V>().ok().map(|value| *value)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivered", &self.delivered)
            .field("value", &self.value.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Completion of one publish.
///
/// Resolves once every invoked listener has finished, successfully or not.
/// Dropping it does not cancel the listeners.
pub struct PublishFuture {
    inner: BoxFuture<'static, Result<Delivery, PublishError>>,
}

type Invocation = JoinHandle<Result<Option<Value>, ListenerFailure>>;

impl PublishFuture {
    pub(crate) fn ready(delivery: Delivery) -> Self {
        Self {
            inner: futures::future::ready(Ok(delivery)).boxed(),
        }
    }

    pub(crate) fn failed(err: PublishError) -> Self {
        Self {
            inner: futures::future::ready(Err(err)).boxed(),
        }
    }

    fn join(invocations: Vec<Invocation>) -> Self {
        let delivered = invocations.len();

        let inner = async move {
            let mut pending: FuturesUnordered<Invocation> = invocations.into_iter().collect();
            let mut values = Vec::with_capacity(delivered);
            let mut failures = Vec::new();
            let mut interrupted = 0;

            while let Some(joined) = pending.next().await {
                match joined {
                    Ok(Ok(value)) => values.push(value),
                    Ok(Err(failure)) => failures.push(failure),
                    Err(err) => {
                        if err.is_panic() {
                            error!("Listener task panicked outside its invocation: {}", err);
                        }
                        interrupted += 1;
                    }
                }
            }

            if let Some(failures) = Failures::new(failures) {
                return Err(PublishError::ListenersFailed(failures));
            }
            if interrupted > 0 {
                return Err(PublishError::Interrupted {
                    pending: interrupted,
                });
            }

            let value = match values.pop() {
                Some(value) if delivered == 1 => value,
                _ => None,
            };
            Ok(Delivery::new(delivered, value))
        };

        Self {
            inner: inner.boxed(),
        }
    }
}

impl Future for PublishFuture {
    type Output = Result<Delivery, PublishError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for PublishFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PublishFuture")
    }
}

/// Resolves keys, looks up subscriptions and schedules invocations.
pub(crate) struct Dispatcher {
    matcher: TypeMatcher,
    dead_events: DeadEventPolicy,
    max_depth: Option<usize>,
    logging: bool,
}

impl Dispatcher {
    pub(crate) fn new(dead_events: DeadEventPolicy, max_depth: Option<usize>, logging: bool) -> Self {
        Self {
            matcher: TypeMatcher::new(),
            dead_events,
            max_depth,
            logging,
        }
    }

    pub(crate) fn matcher(&self) -> &TypeMatcher {
        &self.matcher
    }

    pub(crate) fn dispatch(
        &self,
        event: Arc<DynEvent>,
        registry: &Registry,
        workers: &Handle,
    ) -> PublishFuture {
        let depth = current_depth();
        if let Some(limit) = self.max_depth
            && depth >= limit
        {
            warn!(event = ?event, depth, limit, "Publish depth limit reached");
            return PublishFuture::failed(PublishError::DepthExceeded { depth, limit });
        }

        let resolved = self.matcher.keys_for(&*event);
        let matched = registry.lookup(&resolved);

        if matched.is_empty() {
            return self.dead_event(event, registry, workers);
        }

        if self.logging {
            debug!(
                event = ?event,
                keys = resolved.len(),
                subscriptions = matched.len(),
                depth,
                "Publishing event"
            );
        }

        let invocations = matched
            .into_iter()
            .map(|(subscription, view)| {
                let invocation = subscription.invoke(Arc::clone(&event), view);
                workers.spawn(PUBLISH_DEPTH.scope(depth + 1, invocation))
            })
            .collect();

        PublishFuture::join(invocations)
    }

    fn dead_event(&self, event: Arc<DynEvent>, registry: &Registry, workers: &Handle) -> PublishFuture {
        match self.dead_events {
            DeadEventPolicy::Ignore => {}
            DeadEventPolicy::Log => {
                warn!(event = ?event, "No listeners registered for event");
            }
            DeadEventPolicy::Republish => {
                let event_ref: &dyn Any = &*event;
                if !event_ref.is::<DeadEvent>() {
                    let dead: Arc<DynEvent> = Arc::new(DeadEvent::new(event));
                    return self.dispatch(dead, registry, workers);
                }
            }
        }

        PublishFuture::ready(Delivery::new(0, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ListenerError;
    use crate::event::{Event, FnListener, Reply};
    use crate::subscription::{Binding, extract_concrete, extract_event};
    use crate::types::TypeKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Ping;

    impl Event for Ping {}

    fn register<F>(registry: &Registry, f: F)
    where
        F: Fn(&Ping) -> crate::ListenerResult + Send + Sync + 'static,
    {
        registry.register(
            TypeKey::of::<Ping>(),
            Binding::listener(Arc::new(FnListener::<Ping, _>::new(f)), extract_concrete::<Ping>),
        );
    }

    fn dispatcher(dead_events: DeadEventPolicy) -> Dispatcher {
        Dispatcher::new(dead_events, Some(4), true)
    }

    #[tokio::test]
    async fn test_dead_event_completes_successfully() {
        let registry = Registry::new();
        let delivery = dispatcher(DeadEventPolicy::Ignore)
            .dispatch(Arc::new(Ping), &registry, &Handle::current())
            .await
            .unwrap();

        assert!(delivery.is_dead());
        assert!(delivery.value().is_none());
    }

    #[tokio::test]
    async fn test_dead_event_republished_as_dead_event() {
        let registry = Registry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        registry.register(
            TypeKey::of::<DeadEvent>(),
            Binding::listener(
                Arc::new(FnListener::<DeadEvent, _>::new(move |dead| {
                    assert!((&**dead.event() as &dyn Any).is::<Ping>());
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Reply::Done)
                })),
                extract_concrete::<DeadEvent>,
            ),
        );

        let delivery = dispatcher(DeadEventPolicy::Republish)
            .dispatch(Arc::new(Ping), &registry, &Handle::current())
            .await
            .unwrap();

        assert_eq!(delivery.delivered(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unheard_dead_event_is_not_rewrapped() {
        let registry = Registry::new();
        let delivery = dispatcher(DeadEventPolicy::Republish)
            .dispatch(Arc::new(Ping), &registry, &Handle::current())
            .await
            .unwrap();

        assert!(delivery.is_dead());
    }

    #[tokio::test]
    async fn test_value_only_with_single_listener() {
        let registry = Registry::new();
        register(&registry, |_| Ok(Reply::value(1u8)));
        let dispatcher = dispatcher(DeadEventPolicy::Ignore);

        let delivery = dispatcher
            .dispatch(Arc::new(Ping), &registry, &Handle::current())
            .await
            .unwrap();
        assert_eq!(delivery.downcast::<u8>(), Some(1));

        register(&registry, |_| Ok(Reply::value(2u8)));
        let delivery = dispatcher
            .dispatch(Arc::new(Ping), &registry, &Handle::current())
            .await
            .unwrap();
        assert_eq!(delivery.delivered(), 2);
        assert!(delivery.value().is_none());
    }

    #[tokio::test]
    async fn test_failure_does_not_short_circuit_siblings() {
        let registry = Registry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        register(&registry, |_| Err(std::io::Error::other("boum").into()));
        register(&registry, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Reply::Done)
        });

        let err = dispatcher(DeadEventPolicy::Ignore)
            .dispatch(Arc::new(Ping), &registry, &Handle::current())
            .await
            .unwrap_err();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let failures = err.failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures.first().cause(), ListenerError::Failed(_)));
    }

    #[tokio::test]
    async fn test_depth_is_tracked_and_limited() {
        let registry = Registry::new();
        let observed = Arc::new(AtomicUsize::new(0));
        let depth = Arc::clone(&observed);
        registry.register(
            TypeKey::root(),
            Binding::listener(
                Arc::new(FnListener::<DynEvent, _>::new(move |_| {
                    depth.store(current_depth(), Ordering::SeqCst);
                    Ok(Reply::Done)
                })),
                extract_event,
            ),
        );

        let dispatcher = dispatcher(DeadEventPolicy::Ignore);
        dispatcher
            .dispatch(Arc::new(Ping), &registry, &Handle::current())
            .await
            .unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);

        let err = PUBLISH_DEPTH
            .scope(4, async {
                dispatcher
                    .dispatch(Arc::new(Ping), &registry, &Handle::current())
                    .await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::DepthExceeded { depth: 4, limit: 4 }));
    }

    #[test]
    fn test_current_depth_outside_publish() {
        assert_eq!(current_depth(), 0);
    }
}
