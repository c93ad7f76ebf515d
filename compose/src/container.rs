//! The `Container` scope hierarchy: registration, resolution, child scopes
//! and disposal.

use crate::chain::{BuildStage, PlanStage, StagedStrategyChain};
use crate::config::ContainerConfig;
use crate::core::{downcast_instance, GenericKey, Instance, ResolutionGuard, ScopeId, TypeKey};
use crate::error::{BuildError, Cause, ConfigurationError, Frame, Result};
use crate::generic::close_registration;
use crate::lifetime::LifetimeContext;
use crate::member::{
  ConstructorSelector, DefaultConstructorSelector, DefaultMethodSelector, DefaultPropertySelector,
  DisposeHook, MethodSelector, PropertySelector,
};
use crate::pipeline::{
  BuildContext, BuildStrategy, CreationStrategy, InitializationStrategy, LifetimeStrategy,
  Resolution, ResolverOverride, TypeMappingStrategy,
};
use crate::plan::{ConstructorPlanStrategy, MethodPlanStrategy, PlanStrategy, PropertyPlanStrategy};
use crate::policy::PolicyList;
use crate::registration::{Binding, Registration};
use crate::types::Type;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace, trace_span, warn};

/// The build strategy chain of a scope.
pub type BuildChain = StagedStrategyChain<BuildStage, dyn BuildStrategy>;
/// The plan strategy chain of a scope.
pub type PlanChain = StagedStrategyChain<PlanStage, dyn PlanStrategy>;

/// Records which instances a scope tree has released, so each one is
/// released once even when two scopes or two managers track it.
#[derive(Default)]
struct DisposalLedger {
  // Keyed by address. The weak reference keeps the allocation, and so the
  // address, from being reused while the entry exists.
  released: Mutex<HashMap<usize, Weak<dyn Any + Send + Sync>>>,
}

impl DisposalLedger {
  fn claim(&self, instance: &Instance) -> bool {
    let address = Arc::as_ptr(instance) as *const () as usize;
    let mut released = self.released.lock();
    if released.contains_key(&address) {
      return false;
    }
    released.retain(|_, weak| weak.strong_count() > 0);
    released.insert(address, Arc::downgrade(instance));
    true
  }
}

/// A closed registration and the open registration it was specialized from.
/// An entry whose source is no longer the registered open generic is stale.
struct Specialized {
  source: Arc<Registration>,
  closed: Arc<Registration>,
}

struct Scope {
  id: ScopeId,
  parent: Option<Container>,
  config: Arc<ContainerConfig>,
  registrations: DashMap<TypeKey, Arc<Registration>>,
  generics: DashMap<GenericKey, Arc<Registration>>,
  // Closed registrations specialized from this scope's open generics.
  closed: DashMap<TypeKey, Specialized>,
  policies: Arc<PolicyList>,
  strategies: Arc<BuildChain>,
  plan_strategies: Arc<PlanChain>,
  children: Mutex<Vec<Weak<Scope>>>,
  tracked: Mutex<Vec<(Instance, DisposeHook)>>,
  scoped_values: DashMap<u64, Instance>,
  scoped_locks: DashMap<u64, Arc<ReentrantMutex<()>>>,
  disposed: AtomicBool,
  ledger: Arc<DisposalLedger>,
}

/// A dependency injection container scope.
///
/// `Container` is a cheap handle: clones refer to the same scope. Scopes
/// form a tree through [`create_child`](Container::create_child); a child
/// sees every registration, policy and strategy of its ancestors unless it
/// shadows them locally.
#[derive(Clone)]
pub struct Container {
  inner: Arc<Scope>,
}

impl Default for Container {
  fn default() -> Self {
    Self::new()
  }
}

impl Container {
  /// Creates a root container with the default configuration.
  pub fn new() -> Self {
    Self::with_config(ContainerConfig::default())
  }

  /// Creates a root container. Child scopes share its configuration.
  pub fn with_config(config: ContainerConfig) -> Self {
    let strategies = BuildChain::new();
    strategies.add_after(BuildStage::TypeMapping, Arc::new(TypeMappingStrategy));
    strategies.add_after(BuildStage::Lifetime, Arc::new(LifetimeStrategy));
    strategies.add_after(BuildStage::Creation, Arc::new(CreationStrategy));
    strategies.add_after(BuildStage::Initialization, Arc::new(InitializationStrategy));

    let plan_strategies = PlanChain::new();
    plan_strategies.add_after(PlanStage::Creation, Arc::new(ConstructorPlanStrategy));
    plan_strategies.add_after(PlanStage::Properties, Arc::new(PropertyPlanStrategy));
    plan_strategies.add_after(PlanStage::Methods, Arc::new(MethodPlanStrategy));

    let policies = PolicyList::new();
    policies.set_default(Arc::new(DefaultConstructorSelector) as Arc<dyn ConstructorSelector>);
    policies.set_default(Arc::new(DefaultPropertySelector) as Arc<dyn PropertySelector>);
    policies.set_default(Arc::new(DefaultMethodSelector) as Arc<dyn MethodSelector>);

    let container = Self::from_parts(
      None,
      Arc::new(config),
      Arc::new(policies),
      strategies,
      plan_strategies,
      Arc::new(DisposalLedger::default()),
    );
    debug!(scope = %container.id(), "created root container");
    container
  }

  fn from_parts(
    parent: Option<Container>,
    config: Arc<ContainerConfig>,
    policies: Arc<PolicyList>,
    strategies: Arc<BuildChain>,
    plan_strategies: Arc<PlanChain>,
    ledger: Arc<DisposalLedger>,
  ) -> Self {
    Self {
      inner: Arc::new(Scope {
        id: ScopeId::next(),
        parent,
        config,
        registrations: DashMap::new(),
        generics: DashMap::new(),
        closed: DashMap::new(),
        policies,
        strategies,
        plan_strategies,
        children: Mutex::new(Vec::new()),
        tracked: Mutex::new(Vec::new()),
        scoped_values: DashMap::new(),
        scoped_locks: DashMap::new(),
        disposed: AtomicBool::new(false),
        ledger,
      }),
    }
  }

  pub fn id(&self) -> ScopeId {
    self.inner.id
  }

  pub fn parent(&self) -> Option<&Container> {
    self.inner.parent.as_ref()
  }

  pub fn config(&self) -> &ContainerConfig {
    &self.inner.config
  }

  /// The policy store of this scope. Writes stay local to it.
  pub fn policies(&self) -> &PolicyList {
    &self.inner.policies
  }

  /// The build strategy chain of this scope.
  pub fn strategies(&self) -> &Arc<BuildChain> {
    &self.inner.strategies
  }

  /// The plan strategy chain of this scope.
  pub fn plan_strategies(&self) -> &Arc<PlanChain> {
    &self.inner.plan_strategies
  }

  /// Creates a child scope linked to this one's registry, policies and chains.
  pub fn create_child(&self) -> Result<Container, ConfigurationError> {
    self.ensure_live()?;
    let inner = &self.inner;
    let child = Self::from_parts(
      Some(self.clone()),
      Arc::clone(&inner.config),
      Arc::new(PolicyList::child_of(&inner.policies)),
      inner.strategies.child(),
      inner.plan_strategies.child(),
      Arc::clone(&inner.ledger),
    );
    let mut children = inner.children.lock();
    children.retain(|weak| weak.strong_count() > 0);
    children.push(Arc::downgrade(&child.inner));
    debug!(scope = %child.id(), parent = %self.id(), "created child scope");
    Ok(child)
  }

  // --- Registration ---

  /// Stores a registration at this scope, replacing any local one with the same key.
  ///
  /// Fails without touching the scope if the mapping is malformed or the
  /// lifetime manager is already attached elsewhere.
  pub fn register(&self, binding: Binding) -> Result<(), ConfigurationError> {
    self.ensure_live()?;
    let (registration, instance) = binding.into_parts();
    registration.validate()?;
    if registration.is_open() && instance.is_some() {
      return Err(ConfigurationError::InvalidMapping {
        key: registration.key().clone(),
        target: registration.target().clone(),
        reason: "an open generic type cannot be registered as an instance",
      });
    }
    registration.attach()?;

    let registration = Arc::new(registration);
    let key = registration.key().clone();
    debug!(
      scope = %self.id(),
      key = %key,
      mapped = %registration.target(),
      lifetime = registration.lifetime().kind(),
      "registered"
    );

    if registration.is_open() {
      if let Some(generic_key) = GenericKey::of(&key) {
        self.inner.closed.retain(|closed, _| !generic_key.matches(closed));
        self.inner.generics.insert(generic_key, registration);
      }
      return Ok(());
    }

    if let Some(instance) = instance {
      let resolution = Resolution::new(Vec::new());
      let ctx = LifetimeContext {
        owner: self,
        requester: self,
        resolution: &resolution,
        teardown: registration.teardown(),
      };
      registration.lifetime().set_value(instance, &ctx);
    }
    self.inner.registrations.insert(key, registration);
    Ok(())
  }

  /// Removes this scope's own registration for the key. Registrations of
  /// ancestor scopes become visible again.
  pub fn unregister(&self, ty: &Type, name: Option<&str>) -> Result<bool, ConfigurationError> {
    self.ensure_live()?;
    let key = TypeKey::new(ty.clone(), name);
    let removed = if ty.is_open() {
      match GenericKey::of(&key) {
        Some(generic_key) => {
          self.inner.closed.retain(|closed, _| !generic_key.matches(closed));
          self.inner.generics.remove(&generic_key).is_some()
        }
        None => false,
      }
    } else {
      self.inner.registrations.remove(&key).is_some()
    };
    if removed {
      debug!(scope = %self.id(), key = %key, "unregistered");
    }
    Ok(removed)
  }

  /// Whether the key resolves to a registration in this scope or an ancestor.
  pub fn is_registered(&self, ty: &Type, name: Option<&str>) -> bool {
    let key = TypeKey::new(ty.clone(), name);
    let mut scope = Some(self);
    while let Some(current) = scope {
      let inner = &current.inner;
      if inner.registrations.contains_key(&key) {
        return true;
      }
      if let Some(open) = current.open_registration(&key) {
        if open.key().ty().bind(key.ty()).is_some() {
          return true;
        }
      }
      scope = inner.parent.as_ref();
    }
    false
  }

  /// The registration serving `key`, specializing an open generic if needed.
  pub fn registration(&self, key: &TypeKey) -> Result<Option<Arc<Registration>>, ConfigurationError> {
    Ok(self.find(key)?.map(|(_, registration)| registration))
  }

  /// Every registration visible from this scope. A local registration hides
  /// an ancestor's registration with the same key.
  pub fn registrations(&self) -> Vec<Arc<Registration>> {
    let mut seen = HashSet::new();
    let mut visible = Vec::new();
    let mut scope = Some(self);
    while let Some(current) = scope {
      let inner = &current.inner;
      let local = inner
        .registrations
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .chain(inner.generics.iter().map(|entry| Arc::clone(entry.value())));
      for registration in local {
        if seen.insert(registration.key().clone()) {
          visible.push(registration);
        }
      }
      scope = inner.parent.as_ref();
    }
    visible
  }

  // --- Resolution ---

  /// Resolves an instance of `T`, optionally by name.
  ///
  /// `T` is keyed by [`Type::of`], which carries no type arguments, so this
  /// never reaches an open generic registration. Use
  /// [`resolve_type`](Container::resolve_type) with a [`Type::generic`]
  /// descriptor for those.
  pub fn resolve<T: Any + Send + Sync>(&self, name: Option<&str>) -> Result<Arc<T>> {
    self.resolve_with::<T>(name, Vec::<ResolverOverride>::new())
  }

  /// Resolves an instance of `T`, applying `overrides` to the whole call graph.
  pub fn resolve_with<T: Any + Send + Sync>(
    &self,
    name: Option<&str>,
    overrides: impl IntoIterator<Item = ResolverOverride>,
  ) -> Result<Arc<T>> {
    let key = TypeKey::new(Type::of::<T>(), name);
    let instance = self.resolve_root(&key, overrides.into_iter().collect(), None)?;
    downcast(instance, &key)
  }

  /// Resolves by runtime type.
  pub fn resolve_type(
    &self,
    ty: &Type,
    name: Option<&str>,
    overrides: impl IntoIterator<Item = ResolverOverride>,
  ) -> Result<Instance> {
    let key = TypeKey::new(ty.clone(), name);
    self.resolve_root(&key, overrides.into_iter().collect(), None)
  }

  /// Resolves every named registration of `T`, ordered by name.
  pub fn resolve_all<T: Any + Send + Sync>(&self) -> Result<Vec<Arc<T>>> {
    self.ensure_live()?;
    let ty = Type::of::<T>();
    self
      .registered_names(&ty)
      .into_iter()
      .map(|name| {
        let key = TypeKey::new(ty.clone(), Some(&name));
        downcast(self.resolve_root(&key, Vec::new(), None)?, &key)
      })
      .collect()
  }

  /// Resolves every named registration of `ty`, ordered by name. Unnamed
  /// registrations are not included.
  pub fn resolve_all_type(&self, ty: &Type) -> Result<Vec<Instance>> {
    self.ensure_live()?;
    self
      .registered_names(ty)
      .into_iter()
      .map(|name| self.resolve_root(&TypeKey::new(ty.clone(), Some(&name)), Vec::new(), None))
      .collect()
  }

  /// Runs the initialization stages of `T`'s registration against an
  /// existing instance. Construction never runs; an unregistered type is
  /// returned untouched.
  pub fn build_up<T: Any + Send + Sync>(&self, name: Option<&str>, instance: Arc<T>) -> Result<Arc<T>> {
    self.build_up_with(name, instance, Vec::<ResolverOverride>::new())
  }

  pub fn build_up_with<T: Any + Send + Sync>(
    &self,
    name: Option<&str>,
    instance: Arc<T>,
    overrides: impl IntoIterator<Item = ResolverOverride>,
  ) -> Result<Arc<T>> {
    let key = TypeKey::new(Type::of::<T>(), name);
    let built = self.resolve_root(&key, overrides.into_iter().collect(), Some(instance as Instance))?;
    downcast(built, &key)
  }

  pub fn build_up_type(
    &self,
    ty: &Type,
    name: Option<&str>,
    instance: Instance,
    overrides: impl IntoIterator<Item = ResolverOverride>,
  ) -> Result<Instance> {
    let key = TypeKey::new(ty.clone(), name);
    self.resolve_root(&key, overrides.into_iter().collect(), Some(instance))
  }

  fn resolve_root(
    &self,
    key: &TypeKey,
    overrides: Vec<ResolverOverride>,
    existing: Option<Instance>,
  ) -> Result<Instance> {
    self.ensure_live()?;
    let span = trace_span!("resolve", key = %key, scope = %self.id());
    let _entered = span.enter();
    let resolution = Resolution::new(overrides);
    self
      .resolve_nested(key, &resolution, 0, existing)
      .map_err(|error| error.into_error(key.clone()))
  }

  /// Resolves `key` as part of an ongoing resolution. Every failure carries
  /// a [`Frame::Resolving`] for `key`.
  pub(crate) fn resolve_nested(
    &self,
    key: &TypeKey,
    resolution: &Resolution,
    depth: usize,
    existing: Option<Instance>,
  ) -> Result<Instance, BuildError> {
    let frame = || Frame::Resolving { key: key.clone() };
    self
      .resolve_unframed(key, resolution, depth, existing)
      .map_err(|error| error.within(frame()))
  }

  fn resolve_unframed(
    &self,
    key: &TypeKey,
    resolution: &Resolution,
    depth: usize,
    existing: Option<Instance>,
  ) -> Result<Instance, BuildError> {
    self.ensure_live()?;
    let limit = self.inner.config.max_resolution_depth;
    if depth > limit {
      return Err(Cause::DepthExceeded { limit }.into());
    }
    if key.ty().is_open() {
      return Err(ConfigurationError::OpenGenericRequest { ty: key.ty().clone() }.into());
    }
    let Some((owner, registration)) = self.find(key)? else {
      return match existing {
        Some(instance) => Ok(instance),
        None => Err(Cause::NotRegistered { key: key.clone() }.into()),
      };
    };
    let _guard = if self.inner.config.detect_cycles {
      Some(ResolutionGuard::new(owner.id(), key)?)
    } else {
      None
    };
    trace!(key = %key, owner = %owner.id(), depth, "resolving");

    let mapped = registration.target() != key.ty();
    let result = registration.pipeline(&owner).and_then(|pipeline| {
      let mut ctx = BuildContext::new(
        key,
        &registration,
        pipeline.plan(),
        &owner,
        self,
        resolution,
        depth,
        existing,
      );
      pipeline.execute(&mut ctx)
    });
    result.map_err(|error| {
      if mapped {
        error.within(Frame::Mapping {
          from: key.ty().clone(),
          to: registration.target().clone(),
        })
      } else {
        error
      }
    })
  }

  /// Finds the registration for `key` and the scope that owns it.
  ///
  /// When nothing serves `key` but an open generic of the same family and
  /// name with a different arity is visible, the arity mismatch is reported.
  fn find(&self, key: &TypeKey) -> Result<Option<(Container, Arc<Registration>)>, ConfigurationError> {
    let mut scope = Some(self);
    while let Some(current) = scope {
      if let Some(registration) = current.find_local(key)? {
        return Ok(Some((current.clone(), registration)));
      }
      scope = current.inner.parent.as_ref();
    }

    let mut scope = Some(self);
    while let Some(current) = scope {
      if let Some(other) = current.open_of_other_arity(key) {
        close_registration(&other, key)?;
      }
      scope = current.inner.parent.as_ref();
    }
    Ok(None)
  }

  fn find_local(&self, key: &TypeKey) -> Result<Option<Arc<Registration>>, ConfigurationError> {
    let inner = &self.inner;
    if let Some(registration) = inner.registrations.get(key) {
      return Ok(Some(Arc::clone(registration.value())));
    }
    let Some(open) = self.open_registration(key) else {
      return Ok(None);
    };
    if let Some(entry) = inner.closed.get(key) {
      if Arc::ptr_eq(&entry.source, &open) {
        return Ok(Some(Arc::clone(&entry.closed)));
      }
    }

    let Some(closed) = close_registration(&open, key)? else {
      return Ok(None);
    };
    let closed = Arc::new(closed);
    // A concurrent specialization of the same open registration may have won;
    // the first one stored is kept. Entries from a replaced one are overwritten.
    let served = match inner.closed.entry(key.clone()) {
      Entry::Occupied(entry) if Arc::ptr_eq(&entry.get().source, &open) => Arc::clone(&entry.get().closed),
      Entry::Occupied(mut entry) => {
        entry.insert(Specialized {
          source: open,
          closed: Arc::clone(&closed),
        });
        closed
      }
      Entry::Vacant(entry) => {
        entry.insert(Specialized {
          source: open,
          closed: Arc::clone(&closed),
        });
        closed
      }
    };
    Ok(Some(served))
  }

  /// This scope's open registration with the same family, arity and name as `key`.
  fn open_registration(&self, key: &TypeKey) -> Option<Arc<Registration>> {
    if !key.ty().is_generic() {
      return None;
    }
    let generic_key = GenericKey::of(key)?;
    self.inner.generics.get(&generic_key).map(|entry| Arc::clone(entry.value()))
  }

  /// An open registration of the same family and name but a different arity.
  fn open_of_other_arity(&self, key: &TypeKey) -> Option<Arc<Registration>> {
    if !key.ty().is_generic() {
      return None;
    }
    let generic_key = GenericKey::of(key)?;
    self
      .inner
      .generics
      .iter()
      .find(|entry| *entry.key() != generic_key && entry.key().same_family(&generic_key))
      .map(|entry| Arc::clone(entry.value()))
  }

  fn registered_names(&self, ty: &Type) -> Vec<String> {
    let mut names = HashSet::new();
    let mut scope = Some(self);
    while let Some(current) = scope {
      let inner = &current.inner;
      for entry in inner.registrations.iter() {
        if entry.key().ty() == ty {
          if let Some(name) = entry.key().name() {
            names.insert(name.to_string());
          }
        }
      }
      if ty.is_generic() {
        for entry in inner.generics.iter() {
          let key = entry.value().key();
          if key.ty().bind(ty).is_some() {
            if let Some(name) = key.name() {
              names.insert(name.to_string());
            }
          }
        }
      }
      scope = inner.parent.as_ref();
    }
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort();
    names
  }

  // --- Scope-local lifetime state ---

  pub(crate) fn scoped_value(&self, id: u64) -> Option<Instance> {
    self.inner.scoped_values.get(&id).map(|entry| Arc::clone(entry.value()))
  }

  pub(crate) fn set_scoped_value(&self, id: u64, value: Instance) {
    self.inner.scoped_values.insert(id, value);
  }

  pub(crate) fn remove_scoped_value(&self, id: u64) {
    self.inner.scoped_values.remove(&id);
  }

  pub(crate) fn scoped_lock(&self, id: u64) -> Arc<ReentrantMutex<()>> {
    Arc::clone(
      self
        .inner
        .scoped_locks
        .entry(id)
        .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
        .value(),
    )
  }

  /// Hands an instance to this scope for release when it is disposed.
  pub fn track_disposable(&self, instance: Instance, hook: DisposeHook) {
    if !self.inner.config.track_disposables {
      return;
    }
    self.inner.tracked.lock().push((instance, hook));
  }

  // --- Disposal ---

  pub fn is_disposed(&self) -> bool {
    self.inner.disposed.load(Ordering::Acquire)
  }

  /// Disposes this scope: every live child scope first, newest first, then
  /// this scope's tracked instances in reverse order of creation. Each
  /// instance is released at most once across the whole scope tree.
  ///
  /// Calling it again is a no-op.
  pub fn dispose(&self) {
    let inner = &self.inner;
    if inner.disposed.swap(true, Ordering::AcqRel) {
      return;
    }

    let children: Vec<Container> = inner
      .children
      .lock()
      .drain(..)
      .filter_map(|weak| weak.upgrade())
      .map(|inner| Container { inner })
      .collect();
    for child in children.iter().rev() {
      child.dispose();
    }

    let tracked = std::mem::take(&mut *inner.tracked.lock());
    let mut released = 0usize;
    for (instance, hook) in tracked.into_iter().rev() {
      if !inner.ledger.claim(&instance) {
        continue;
      }
      released += 1;
      if catch_unwind(AssertUnwindSafe(|| hook(&instance))).is_err() {
        warn!(scope = %inner.id, "teardown hook panicked during disposal");
      }
    }

    inner.scoped_values.clear();
    inner.scoped_locks.clear();
    inner.closed.clear();
    inner.generics.clear();
    inner.registrations.clear();
    debug!(scope = %inner.id, released, "disposed scope");
  }

  fn ensure_live(&self) -> Result<(), ConfigurationError> {
    if self.is_disposed() {
      Err(ConfigurationError::Disposed)
    } else {
      Ok(())
    }
  }
}

fn downcast<T: Any + Send + Sync>(instance: Instance, key: &TypeKey) -> Result<Arc<T>> {
  downcast_instance::<T>(instance, key).map_err(|cause| BuildError::new(cause).into_error(key.clone()))
}

impl fmt::Debug for Container {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = &self.inner;
    f.debug_struct("Container")
      .field("id", &inner.id)
      .field("parent", &inner.parent.as_ref().map(Container::id))
      .field("registrations", &inner.registrations.len())
      .field("generics", &inner.generics.len())
      .field("disposed", &self.is_disposed())
      .finish()
  }
}
