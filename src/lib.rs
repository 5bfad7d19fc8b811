// Fanout - an asynchronous, typed event bus
//
// Events are routed to every listener whose declared interest matches the
// event's type or one of its supertypes, run concurrently on the bus's own
// worker pool, and report back through a single composite future.

// Re-export core functionality
pub use fanout_events::*;

// Re-export the async runtime and trait macro listeners are written with
pub use async_trait::async_trait;
pub use tokio;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        // Bus
        DeadEventPolicy,
        Delivery,
        EventBus,
        EventBusBuilder,
        EventBusConfig,
        EventBusError,
        // Events and listeners
        DynEvent,
        Event,
        EventType,
        FnListener,
        Handlers,
        Listener,
        ListenerResult,
        PublishError,
        PublishFuture,
        Reply,
        Subscriber,
        SubscriptionHandle,
        TypeKey,
        WeakEventBus,
        async_trait,
    };
}
