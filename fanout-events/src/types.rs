//! Type descriptors and hierarchy matching
//!
//! Rust has no runtime class hierarchy, so an event declares its own through
//! [`Event::event_type`]: the concrete type, the supertypes it can be viewed
//! as, and optionally a reified parameterization. [`TypeMatcher`] flattens a
//! declaration into the ordered list of dispatch keys and caches the result
//! per concrete type.
//!
//! ```rust,ignore
//! trait Audited: Event {}
//!
//! #[derive(Debug)]
//! struct UserCreated { base: AccountEvent, email: String }
//!
//! impl Audited for UserCreated {}
//!
//! impl Event for UserCreated {
//!     fn event_type(&self) -> EventType {
//!         EventType::builder::<Self>()
//!             .extends(self.base.event_type(), |e| &e.base)
//!             .extends::<dyn Audited>(EventType::interface::<dyn Audited>().build(), |e| e)
//!             .build()
//!     }
//! }
//! ```

use crate::event::{DynEvent, Event};
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Hashable descriptor of a dispatch key.
#[derive(Clone)]
pub enum TypeKey {
    /// A concrete type, or a trait-object type standing in for an interface.
    Type { id: TypeId, name: &'static str },

    /// A reified generic: the raw wrapper key plus its type argument.
    Parameterized {
        raw: Arc<TypeKey>,
        argument: Arc<TypeKey>,
    },
}

impl TypeKey {
    /// Key of `T`, which may be a trait object such as `dyn Event`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeKey::Type {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The universal root type every event matches.
    pub fn root() -> Self {
        Self::of::<DynEvent>()
    }

    /// Parameterized key `raw<argument>`.
    pub fn parameterized(raw: TypeKey, argument: TypeKey) -> Self {
        TypeKey::Parameterized {
            raw: Arc::new(raw),
            argument: Arc::new(argument),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, TypeKey::Type { id, .. } if *id == TypeId::of::<DynEvent>())
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypeKey::Type { id: a, .. }, TypeKey::Type { id: b, .. }) => a == b,
            (
                TypeKey::Parameterized { raw: r1, argument: a1 },
                TypeKey::Parameterized { raw: r2, argument: a2 },
            ) => r1 == r2 && a1 == a2,
            _ => false,
        }
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            TypeKey::Type { id, .. } => {
                0u8.hash(state);
                id.hash(state);
            }
            TypeKey::Parameterized { raw, argument } => {
                1u8.hash(state);
                raw.hash(state);
                argument.hash(state);
            }
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKey::Type { name, .. } => f.write_str(name),
            TypeKey::Parameterized { raw, argument } => write!(f, "{raw}<{argument}>"),
        }
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({self})")
    }
}

/// Views an event as a `T`.
pub(crate) type Caster<T> =
    Arc<dyn for<'a> Fn(&'a DynEvent) -> Option<&'a T> + Send + Sync>;

/// Type-erased [`Caster`].
#[derive(Clone)]
pub struct View(Arc<dyn Any + Send + Sync>);

impl View {
    fn new<T: ?Sized + 'static>(caster: Caster<T>) -> Self {
        Self(Arc::new(caster))
    }

    fn caster<T: ?Sized + 'static>(&self) -> Option<&Caster<T>> {
        self.0.downcast_ref::<Caster<T>>()
    }

    /// View `event` as a `T`; `None` if this view targets another type.
    pub(crate) fn cast<'a, T: ?Sized + 'static>(&self, event: &'a DynEvent) -> Option<&'a T> {
        self.caster::<T>().and_then(|caster| caster(event))
    }

    fn root() -> Self {
        Self::new::<DynEvent>(caster(|event| Some(event)))
    }
}

/// View of an event as its own concrete type `E`.
fn concrete_view<E: Any>() -> View {
    View::new::<E>(caster(|event| (event as &dyn Any).downcast_ref::<E>()))
}

/// Key and view of a value's own concrete type.
///
/// Blanket-implemented for every sized `'static` type. The matcher uses it for events
/// that keep the default [`Event::event_type`], which cannot name `Self` as a
/// sized type.
pub trait ConcreteType {
    fn concrete_type(&self) -> (TypeKey, View);
}

impl<T: Any> ConcreteType for T {
    fn concrete_type(&self) -> (TypeKey, View) {
        (TypeKey::of::<T>(), concrete_view::<T>())
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("View")
    }
}

// Pins the closure to the higher-ranked signature.
fn caster<T, F>(f: F) -> Caster<T>
where
    T: ?Sized + 'static,
    F: for<'a> Fn(&'a DynEvent) -> Option<&'a T> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Turns a view of a descriptor's own type into a view of one ancestor.
type Lift = Arc<dyn Fn(&View) -> Option<View> + Send + Sync>;

fn lift<F>(f: F) -> Lift
where
    F: Fn(&View) -> Option<View> + Send + Sync + 'static,
{
    Arc::new(f)
}

// Parameterized and raw keys are matched without a typed view.
fn unviewed() -> Lift {
    lift(|_| None)
}

#[derive(Clone)]
struct Ancestor {
    key: TypeKey,
    lift: Lift,
}

#[derive(Clone)]
struct Parameter {
    raw: TypeKey,
    argument: Box<EventType>,
}

/// Declared type of an event: its key, transitive supertypes and reified
/// parameterization.
#[derive(Clone)]
pub struct EventType {
    key: TypeKey,
    this: Option<View>,
    ancestors: Vec<Ancestor>,
    parameter: Option<Parameter>,
}

impl EventType {
    /// Start describing the concrete event type `E`.
    pub fn builder<E: Event>() -> EventTypeBuilder<E> {
        EventTypeBuilder::new(Some(concrete_view::<E>()))
    }

    /// Start describing a supertype that is never a runtime type itself,
    /// usually a trait object such as `dyn Audited`.
    pub fn interface<T: ?Sized + 'static>() -> EventTypeBuilder<T> {
        EventTypeBuilder::new(None)
    }

    /// Concrete event type with no declared supertypes.
    pub fn of<E: Event>() -> Self {
        Self::builder::<E>().build()
    }

    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Keys of this type in dispatch order, without views.
    pub fn keys(&self) -> Vec<TypeKey> {
        self.resolve().keys().cloned().collect()
    }

    // Declarations made through `interface::<Self>()` carry no view of their
    // own type.
    fn with_concrete_view(mut self, key: &TypeKey, view: View) -> Self {
        if self.this.is_none() && self.key == *key {
            self.this = Some(view);
        }
        self
    }

    fn resolve(&self) -> ResolvedType {
        let mut resolved = ResolvedType::default();
        resolved.push(self.key.clone(), self.this.clone());

        if let Some(parameter) = &self.parameter {
            for argument in parameter.argument.keys() {
                let key = TypeKey::parameterized(parameter.raw.clone(), argument);
                resolved.push(key, None);
            }
        }

        for ancestor in &self.ancestors {
            let view = self.this.as_ref().and_then(|this| (ancestor.lift)(this));
            resolved.push(ancestor.key.clone(), view);
        }

        if let Some(parameter) = &self.parameter {
            resolved.push(parameter.raw.clone(), None);
        }

        resolved.push(TypeKey::root(), Some(View::root()));
        resolved
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventType")
            .field("key", &self.key)
            .field(
                "ancestors",
                &self.ancestors.iter().map(|a| &a.key).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`EventType`]; `T` is the type being described.
pub struct EventTypeBuilder<T: ?Sized + 'static> {
    this: Option<View>,
    direct: Vec<Ancestor>,
    inherited: Vec<Ancestor>,
    parameter: Option<Parameter>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: ?Sized + 'static> EventTypeBuilder<T> {
    fn new(this: Option<View>) -> Self {
        Self {
            this,
            direct: Vec::new(),
            inherited: Vec::new(),
            parameter: None,
            _marker: PhantomData,
        }
    }

    /// Declare `parent` as a supertype, viewed through `cast`.
    ///
    /// The parent's own ancestors are inherited transitively, and so are its
    /// parameterized and raw keys when the parent is a reified generic. Name
    /// `P` with a turbofish when `cast` is an unsizing coercion such as
    /// `|e| e`.
    pub fn extends<P: ?Sized + 'static>(
        mut self,
        parent: EventType,
        cast: for<'a> fn(&'a T) -> &'a P,
    ) -> Self {
        debug_assert!(
            parent.key == TypeKey::of::<P>(),
            "cast target does not match parent key {}",
            parent.key
        );

        let to_parent = lift(move |view: &View| {
            let from = view.caster::<T>()?.clone();
            Some(View::new::<P>(caster(move |event| from(event).map(cast))))
        });

        if let Some(parameter) = &parent.parameter {
            for argument in parameter.argument.keys() {
                self.inherited.push(Ancestor {
                    key: TypeKey::parameterized(parameter.raw.clone(), argument),
                    lift: unviewed(),
                });
            }
        }
        for ancestor in parent.ancestors {
            let first = Arc::clone(&to_parent);
            let then = ancestor.lift;
            self.inherited.push(Ancestor {
                key: ancestor.key,
                lift: lift(move |view: &View| then(&first(view)?)),
            });
        }
        if let Some(parameter) = parent.parameter {
            self.inherited.push(Ancestor {
                key: parameter.raw,
                lift: unviewed(),
            });
        }
        self.direct.push(Ancestor {
            key: parent.key,
            lift: to_parent,
        });
        self
    }

    /// Declare this type as the reified form `raw<argument>`.
    pub fn parameterized(mut self, raw: TypeKey, argument: EventType) -> Self {
        self.parameter = Some(Parameter {
            raw,
            argument: Box::new(argument),
        });
        self
    }

    pub fn build(self) -> EventType {
        let key = TypeKey::of::<T>();
        let mut seen = HashSet::from([key.clone(), TypeKey::root()]);
        let ancestors = self
            .direct
            .into_iter()
            .chain(self.inherited)
            .filter(|ancestor| seen.insert(ancestor.key.clone()))
            .collect();

        EventType {
            key,
            this: self.this,
            ancestors,
            parameter: self.parameter,
        }
    }
}

/// Ordered, duplicate-free dispatch keys of one concrete type.
#[derive(Debug, Default)]
pub struct ResolvedType {
    entries: Vec<(TypeKey, Option<View>)>,
}

impl ResolvedType {
    fn push(&mut self, key: TypeKey, view: Option<View>) {
        if !self.entries.iter().any(|(existing, _)| *existing == key) {
            self.entries.push((key, view));
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &TypeKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub(crate) fn entries(&self) -> &[(TypeKey, Option<View>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves and caches dispatch keys per concrete event type.
#[derive(Default)]
pub struct TypeMatcher {
    cache: DashMap<TypeId, Arc<ResolvedType>>,
}

impl TypeMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch keys for the runtime type of `event`.
    pub fn keys_for(&self, event: &DynEvent) -> Arc<ResolvedType> {
        let type_id = Any::type_id(event as &dyn Any);
        if let Some(hit) = self.cache.get(&type_id) {
            return Arc::clone(hit.value());
        }

        let (key, view) = ConcreteType::concrete_type(event);
        let resolved = Arc::new(event.event_type().with_concrete_view(&key, view).resolve());
        Arc::clone(self.cache.entry(type_id).or_insert(resolved).value())
    }

    /// Number of cached concrete types.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
