//! Lifecycle hooks for embedding the bus in an application
//!
//! The host application calls [`OnInit::on_init`] during startup and
//! [`OnDestroy::on_destroy`] during shutdown. [`ManagedEventBus`] implements
//! both: init starts a bus from its configuration, destroy closes it.
//!
//! ```rust,ignore
//! let managed = Arc::new(ManagedEventBus::new(EventBusConfig::from_env()?));
//! managed.on_init().await?;
//!
//! let bus = managed.bus().expect("initialized");
//! bus.publish(AppStarted).await?;
//!
//! managed.on_destroy().await?;
//! ```

use crate::bus::EventBus;
use crate::config::EventBusConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

/// Error type for lifecycle operations
pub type LifecycleResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Hook called once the host has constructed its components
#[async_trait]
pub trait OnInit: Send + Sync {
    async fn on_init(&self) -> LifecycleResult;
}

/// Hook called before the host tears its components down
#[async_trait]
pub trait OnDestroy: Send + Sync {
    async fn on_destroy(&self) -> LifecycleResult;
}

/// An [`EventBus`] whose lifetime follows the host's lifecycle.
pub struct ManagedEventBus {
    config: EventBusConfig,
    bus: RwLock<Option<EventBus>>,
}

impl ManagedEventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            bus: RwLock::new(None),
        }
    }

    /// The running bus; `None` before init and after destroy.
    pub fn bus(&self) -> Option<EventBus> {
        self.bus.read().clone()
    }
}

impl Default for ManagedEventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[async_trait]
impl OnInit for ManagedEventBus {
    async fn on_init(&self) -> LifecycleResult {
        let mut slot = self.bus.write();
        if slot.is_none() {
            let bus = EventBus::with_config(self.config.clone())?;
            debug!(bus = %bus.id(), "Managed event bus initialized");
            *slot = Some(bus);
        }
        Ok(())
    }
}

#[async_trait]
impl OnDestroy for ManagedEventBus {
    async fn on_destroy(&self) -> LifecycleResult {
        let bus = self.bus.write().take();
        if let Some(bus) = bus {
            bus.close();
            debug!(bus = %bus.id(), "Managed event bus destroyed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventBusError;
    use crate::event::{Event, Reply};

    #[derive(Debug)]
    struct Started;

    impl Event for Started {}

    fn managed() -> ManagedEventBus {
        ManagedEventBus::new(EventBusConfig {
            worker_threads: Some(1),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_init_starts_bus_once() {
        let managed = managed();
        assert!(managed.bus().is_none());

        managed.on_init().await.unwrap();
        let first = managed.bus().unwrap().id();
        managed.on_init().await.unwrap();

        assert_eq!(managed.bus().unwrap().id(), first);
    }

    #[tokio::test]
    async fn test_destroy_closes_bus() {
        let managed = managed();
        managed.on_init().await.unwrap();

        let bus = managed.bus().unwrap();
        bus.subscribe_fn::<Started, _>(|_| Ok(Reply::Done)).unwrap();
        bus.publish(Started).await.unwrap();

        managed.on_destroy().await.unwrap();
        assert!(managed.bus().is_none());
        assert!(bus.is_closed());
        assert!(matches!(
            bus.subscribe_fn::<Started, _>(|_| Ok(Reply::Done)),
            Err(EventBusError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_init_reports_invalid_config() {
        let managed = ManagedEventBus::new(EventBusConfig {
            thread_name: String::new(),
            ..Default::default()
        });
        assert!(managed.on_init().await.is_err());
    }
}
