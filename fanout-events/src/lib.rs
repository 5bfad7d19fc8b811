//! Typed, hierarchy-aware event bus
//!
//! This crate provides in-process event publishing where dispatch follows
//! the event's declared type hierarchy.
//!
//! ## Features
//!
//! - **Hierarchy matching** - Listeners on a supertype see every subtype
//! - **Concurrent fan-out** - Listeners run on the bus's own worker pool
//! - **Composite completion** - One future per publish, failures aggregated
//! - **Deferred replies** - Listeners may finish later, or republish
//! - **Reified keys** - `Wrapper<A>` and `Wrapper<B>` are told apart
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fanout_events::*;
//!
//! #[derive(Debug)]
//! struct UserCreated {
//!     email: String,
//! }
//!
//! impl Event for UserCreated {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::new()?;
//!
//!     bus.subscribe_fn::<UserCreated, _>(|event| {
//!         println!("Sending welcome email to {}", event.email);
//!         Ok(Reply::Done)
//!     })?;
//!
//!     bus.publish(UserCreated { email: "alice@example.com".to_string() }).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Supertypes
//!
//! An event lists the types it can be viewed as. Listeners on any of them,
//! and on `dyn Event`, receive it:
//!
//! ```rust,ignore
//! trait Audited: Event {
//!     fn actor(&self) -> &str;
//! }
//!
//! impl Event for UserCreated {
//!     fn event_type(&self) -> EventType {
//!         EventType::builder::<Self>()
//!             .extends::<dyn Audited>(EventType::interface::<dyn Audited>().build(), |e| e)
//!             .build()
//!     }
//! }
//!
//! bus.subscribe_as::<dyn Audited, _>(FnListener::<dyn Audited, _>::new(|event| {
//!     println!("{} acted", event.actor());
//!     Ok(Reply::Done)
//! }))?;
//! ```
//!
//! ## Error Handling
//!
//! Listener failures never reach the publisher synchronously. They are
//! logged and collected into the publish future:
//!
//! ```rust,ignore
//! match bus.publish(event).await {
//!     Ok(delivery) => println!("{} listener(s) succeeded", delivery.delivered()),
//!     Err(PublishError::ListenersFailed(failures)) => {
//!         for failure in failures.iter() {
//!             eprintln!("{}", failure);
//!         }
//!     }
//!     Err(e) => eprintln!("Publish error: {}", e),
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust,ignore
//! let bus = EventBusBuilder::new()
//!     .max_worker_threads(4)                      // Cap the worker pool
//!     .dead_events(DeadEventPolicy::Log)          // Warn on unheard events
//!     .max_publish_depth(Some(16))                // Bound recursive publishes
//!     .build()?;
//! ```

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod registry;
pub mod subscription;
pub mod types;

pub use bus::{EventBus, EventBusBuilder, WeakEventBus};
pub use config::{DeadEventPolicy, ENV_PREFIX, EventBusConfig};
pub use dispatch::{Delivery, PublishFuture, current_depth};
pub use error::{
    BoxError, ConfigError, EventBusError, Failures, ListenerError, ListenerFailure, PublishError,
    Result,
};
pub use event::{
    DeadEvent, DynEvent, Event, FnListener, Handlers, Listener, ListenerResult, Method, Reply,
    Subscriber, Value,
};
pub use lifecycle::{LifecycleResult, ManagedEventBus, OnDestroy, OnInit};
pub use registry::Registry;
pub use subscription::{Subscription, SubscriptionHandle, SubscriptionId};
pub use types::{EventType, EventTypeBuilder, ResolvedType, TypeKey, TypeMatcher, View};
