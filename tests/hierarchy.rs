//! Integration tests for declared type hierarchies, parameterized keys and
//! handler tables.

use fanout::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

trait Audited: Event {
    fn actor(&self) -> &str;
}

fn audited() -> EventType {
    EventType::interface::<dyn Audited>().build()
}

#[derive(Debug)]
struct AccountEvent {
    actor: String,
}

impl Audited for AccountEvent {
    fn actor(&self) -> &str {
        &self.actor
    }
}

impl Event for AccountEvent {
    fn event_type(&self) -> EventType {
        EventType::builder::<Self>()
            .extends::<dyn Audited>(audited(), |e| e)
            .build()
    }
}

#[derive(Debug)]
struct PasswordChanged {
    account: AccountEvent,
}

impl Event for PasswordChanged {
    fn event_type(&self) -> EventType {
        EventType::builder::<Self>()
            .extends(self.account.event_type(), |e| &e.account)
            .build()
    }
}

fn password_changed(actor: &str) -> PasswordChanged {
    PasswordChanged {
        account: AccountEvent {
            actor: actor.to_string(),
        },
    }
}

fn bus() -> EventBus {
    assert_ok!(EventBus::builder().worker_threads(2).build())
}

#[tokio::test]
async fn test_interface_inherited_through_parent() {
    let bus = bus();
    let actors = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&actors);

    bus.subscribe_as::<dyn Audited, _>(FnListener::<dyn Audited, _>::new(move |event| {
        seen.lock().unwrap().push(event.actor().to_string());
        Ok(Reply::Done)
    }))
    .unwrap();

    assert_ok!(bus.publish(password_changed("alice")).await);
    assert_ok!(
        bus.publish(AccountEvent {
            actor: "bob".to_string()
        })
        .await
    );

    let mut actors = actors.lock().unwrap().clone();
    actors.sort();
    assert_eq!(actors, vec!["alice".to_string(), "bob".to_string()]);
}

#[tokio::test]
async fn test_dispatch_keys_most_specific_first() {
    let bus = bus();
    let keys = bus.dispatch_keys(&password_changed("alice"));

    assert_eq!(
        keys,
        vec![
            TypeKey::of::<PasswordChanged>(),
            TypeKey::of::<AccountEvent>(),
            TypeKey::of::<dyn Audited>(),
            TypeKey::root(),
        ]
    );
}

// =============================================================================
// Parameterized keys
// =============================================================================

#[derive(Debug)]
struct Envelope<T> {
    payload: T,
}

/// Raw key shared by every `Envelope<T>`.
struct EnvelopeKind;

impl<T: Event> Event for Envelope<T> {
    fn event_type(&self) -> EventType {
        EventType::builder::<Self>()
            .parameterized(TypeKey::of::<EnvelopeKind>(), self.payload.event_type())
            .build()
    }
}

#[derive(Debug)]
struct Heartbeat;

impl Event for Heartbeat {}

fn envelope_of<T: ?Sized + 'static>() -> TypeKey {
    TypeKey::parameterized(TypeKey::of::<EnvelopeKind>(), TypeKey::of::<T>())
}

fn counting(count: &Arc<AtomicUsize>) -> impl Listener<DynEvent> {
    let count = Arc::clone(count);
    FnListener::<DynEvent, _>::new(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(Reply::Done)
    })
}

#[tokio::test]
async fn test_parameterized_key_matches_argument_supertypes() {
    let bus = bus();
    let account = Arc::new(AtomicUsize::new(0));
    let audited = Arc::new(AtomicUsize::new(0));
    let heartbeat = Arc::new(AtomicUsize::new(0));
    let raw = Arc::new(AtomicUsize::new(0));

    bus.subscribe_key(envelope_of::<AccountEvent>(), counting(&account))
        .unwrap();
    bus.subscribe_key(envelope_of::<dyn Audited>(), counting(&audited))
        .unwrap();
    bus.subscribe_key(envelope_of::<Heartbeat>(), counting(&heartbeat))
        .unwrap();
    bus.subscribe_key(TypeKey::of::<EnvelopeKind>(), counting(&raw))
        .unwrap();

    assert_ok!(
        bus.publish(Envelope {
            payload: password_changed("alice"),
        })
        .await
    );
    assert_ok!(bus.publish(Envelope { payload: Heartbeat }).await);

    assert_eq!(account.load(Ordering::SeqCst), 1);
    assert_eq!(audited.load(Ordering::SeqCst), 1);
    assert_eq!(heartbeat.load(Ordering::SeqCst), 1);
    assert_eq!(raw.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_parameterized_key_distinct_from_concrete_wrapper() {
    let bus = bus();
    let concrete = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&concrete);
    bus.subscribe_fn::<Envelope<Heartbeat>, _>(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Reply::Done)
    })
    .unwrap();

    assert_ok!(
        bus.publish(Envelope {
            payload: AccountEvent {
                actor: "carol".to_string(),
            },
        })
        .await
    );
    assert_eq!(concrete.load(Ordering::SeqCst), 0);

    assert_ok!(bus.publish(Envelope { payload: Heartbeat }).await);
    assert_eq!(concrete.load(Ordering::SeqCst), 1);
}

/// A redelivered envelope still matches every envelope key.
#[derive(Debug)]
struct Redelivery {
    envelope: Envelope<Heartbeat>,
}

impl Event for Redelivery {
    fn event_type(&self) -> EventType {
        EventType::builder::<Self>()
            .extends(self.envelope.event_type(), |e| &e.envelope)
            .build()
    }
}

#[tokio::test]
async fn test_subtype_of_parameterized_event_matches_reified_keys() {
    let bus = bus();
    let heartbeat = Arc::new(AtomicUsize::new(0));
    let raw = Arc::new(AtomicUsize::new(0));
    let wrapper = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&wrapper);

    bus.subscribe_key(envelope_of::<Heartbeat>(), counting(&heartbeat))
        .unwrap();
    bus.subscribe_key(TypeKey::of::<EnvelopeKind>(), counting(&raw))
        .unwrap();
    bus.subscribe_fn::<Envelope<Heartbeat>, _>(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(Reply::Done)
    })
    .unwrap();

    let delivery = assert_ok!(
        bus.publish(Redelivery {
            envelope: Envelope { payload: Heartbeat },
        })
        .await
    );

    assert_eq!(delivery.delivered(), 3);
    assert_eq!(heartbeat.load(Ordering::SeqCst), 1);
    assert_eq!(raw.load(Ordering::SeqCst), 1);
    assert_eq!(wrapper.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Concrete types through supertype entry points
// =============================================================================

#[tokio::test]
async fn test_subscribe_as_concrete_type_with_default_declaration() {
    let bus = bus();
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);

    bus.subscribe_as::<Heartbeat, _>(FnListener::<Heartbeat, _>::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(Reply::Done)
    }))
    .unwrap();

    let delivery = assert_ok!(bus.publish(Heartbeat).await);
    assert_eq!(delivery.delivered(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct Monitor {
    beats: AtomicUsize,
}

impl Monitor {
    fn on_heartbeat(&self, _event: &Heartbeat) -> ListenerResult {
        self.beats.fetch_add(1, Ordering::SeqCst);
        Ok(Reply::Done)
    }
}

impl Subscriber for Monitor {
    fn handlers(handlers: &mut Handlers<Self>) {
        handlers.on_as::<Heartbeat>("on_heartbeat", Self::on_heartbeat);
    }
}

#[tokio::test]
async fn test_handler_table_on_as_concrete_type() {
    let bus = bus();
    let monitor = Arc::new(Monitor::default());
    bus.subscribe_target(Arc::clone(&monitor)).unwrap();

    assert_ok!(bus.publish(Heartbeat).await);
    assert_eq!(monitor.beats.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Handler tables
// =============================================================================

#[derive(Default)]
struct AuditLog {
    entries: Mutex<Vec<String>>,
}

impl AuditLog {
    fn on_account(&self, event: &AccountEvent) -> ListenerResult {
        self.record(format!("account:{}", event.actor));
        Ok(Reply::Done)
    }

    fn on_audited(&self, event: &(dyn Audited + 'static)) -> ListenerResult {
        self.record(format!("audited:{}", event.actor()));
        Ok(Reply::Done)
    }

    fn record(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap().clone();
        entries.sort();
        entries
    }
}

impl Subscriber for AuditLog {
    fn handlers(handlers: &mut Handlers<Self>) {
        handlers
            .on("on_account", Self::on_account)
            .on_as::<dyn Audited>("on_audited", Self::on_audited);
    }
}

struct Silent;

impl Subscriber for Silent {
    fn handlers(_handlers: &mut Handlers<Self>) {}
}

#[tokio::test]
async fn test_subscribe_target_registers_every_handler() {
    let bus = bus();
    let log = Arc::new(AuditLog::default());

    let handle = bus.subscribe_target(Arc::clone(&log)).unwrap();
    assert_eq!(handle.len(), 2);

    let delivery = assert_ok!(bus.publish(password_changed("dave")).await);
    assert_eq!(delivery.delivered(), 2);
    assert_eq!(
        log.entries(),
        vec!["account:dave".to_string(), "audited:dave".to_string()]
    );

    assert_ok!(bus.unsubscribe(&handle));
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test]
async fn test_subscribe_target_twice_does_not_duplicate() {
    let bus = bus();
    let log = Arc::new(AuditLog::default());

    bus.subscribe_target(Arc::clone(&log)).unwrap();
    bus.subscribe_target(Arc::clone(&log)).unwrap();
    assert_eq!(bus.subscription_count(), 2);

    assert_ok!(
        bus.publish(AccountEvent {
            actor: "erin".to_string()
        })
        .await
    );
    assert_eq!(log.entries().len(), 2);
}

#[tokio::test]
async fn test_subscribe_target_without_handlers_is_rejected() {
    let bus = bus();
    let err = assert_err!(bus.subscribe_target(Arc::new(Silent)));

    assert!(matches!(err, EventBusError::NoHandlers { target } if target.ends_with("Silent")));
    assert_eq!(bus.subscription_count(), 0);
}
