//! Lifetime managers: who owns a built instance and for how long.

use crate::container::Container;
use crate::core::Instance;
use crate::member::DisposeHook;
use crate::pipeline::Resolution;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};

/// The caching state of a lifetime manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeState {
  Empty,
  Holding,
  /// Explicitly cleared. Behaves like `Empty`.
  Removed,
}

/// Everything a lifetime manager may consult while storing or fetching a value.
pub struct LifetimeContext<'a> {
  pub(crate) owner: &'a Container,
  pub(crate) requester: &'a Container,
  pub(crate) resolution: &'a Resolution,
  pub(crate) teardown: Option<&'a DisposeHook>,
}

impl<'a> LifetimeContext<'a> {
  /// The scope the registration lives in.
  pub fn owner(&self) -> &'a Container {
    self.owner
  }

  /// The scope the resolution was requested from.
  pub fn requester(&self) -> &'a Container {
    self.requester
  }

  pub fn teardown(&self) -> Option<&'a DisposeHook> {
    self.teardown
  }

  /// Hands `instance` to `scope` for release when the scope is disposed.
  pub fn track_in(&self, scope: &Container, instance: &Instance) {
    if let Some(hook) = self.teardown {
      scope.track_disposable(Arc::clone(instance), Arc::clone(hook));
    }
  }
}

/// Owns the caching policy and state for one registration's instances.
///
/// A manager is attached to exactly one registration. Managers that cache
/// serialize concurrent first creation through [`creation_lock`].
///
/// [`creation_lock`]: LifetimeManager::creation_lock
pub trait LifetimeManager: Send + Sync + 'static {
  fn get_value(&self, ctx: &LifetimeContext<'_>) -> Option<Instance>;

  fn set_value(&self, value: Instance, ctx: &LifetimeContext<'_>);

  fn remove_value(&self, ctx: &LifetimeContext<'_>);

  /// A lock held from the first cache miss until the new value is stored.
  /// It is reentrant: a cyclic graph re-enters it on the same thread and is
  /// stopped by cycle detection or the depth limit instead of deadlocking.
  fn creation_lock(&self, _ctx: &LifetimeContext<'_>) -> Option<Arc<ReentrantMutex<()>>> {
    None
  }

  /// A fresh, unattached manager of the same kind.
  fn create_lifetime(&self) -> Arc<dyn LifetimeManager>;

  /// Marks the manager as in use. Returns `false` if it already was.
  fn attach(&self) -> bool;

  fn in_use(&self) -> bool;

  /// Whether dependencies of the cached instance resolve from the owning
  /// scope rather than the requesting one.
  fn binds_to_owner(&self) -> bool {
    false
  }

  fn kind(&self) -> &'static str;
}

impl fmt::Debug for dyn LifetimeManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LifetimeManager")
      .field("kind", &self.kind())
      .field("in_use", &self.in_use())
      .finish()
  }
}

#[derive(Debug, Default)]
struct InUse(AtomicBool);

impl InUse {
  fn claim(&self) -> bool {
    self
      .0
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  fn get(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }
}

fn next_lifetime_id() -> u64 {
  static NEXT: AtomicU64 = AtomicU64::new(1);
  NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Never caches: every resolution builds a new instance.
#[derive(Debug, Default)]
pub struct TransientLifetimeManager {
  in_use: InUse,
}

impl TransientLifetimeManager {
  pub fn new() -> Self {
    Self::default()
  }
}

impl LifetimeManager for TransientLifetimeManager {
  fn get_value(&self, _ctx: &LifetimeContext<'_>) -> Option<Instance> {
    None
  }

  fn set_value(&self, _value: Instance, _ctx: &LifetimeContext<'_>) {}

  fn remove_value(&self, _ctx: &LifetimeContext<'_>) {}

  fn create_lifetime(&self) -> Arc<dyn LifetimeManager> {
    Arc::new(Self::new())
  }

  fn attach(&self) -> bool {
    self.in_use.claim()
  }

  fn in_use(&self) -> bool {
    self.in_use.get()
  }

  fn kind(&self) -> &'static str {
    "transient"
  }
}

enum Slot {
  Empty,
  Holding(Instance),
  Removed,
}

/// One instance per owning scope, released when that scope is disposed.
pub struct ContainerControlledLifetimeManager {
  slot: RwLock<Slot>,
  lock: Arc<ReentrantMutex<()>>,
  in_use: InUse,
}

impl ContainerControlledLifetimeManager {
  pub fn new() -> Self {
    Self {
      slot: RwLock::new(Slot::Empty),
      lock: Arc::new(ReentrantMutex::new(())),
      in_use: InUse::default(),
    }
  }

  pub fn state(&self) -> LifetimeState {
    match &*self.slot.read() {
      Slot::Empty => LifetimeState::Empty,
      Slot::Holding(_) => LifetimeState::Holding,
      Slot::Removed => LifetimeState::Removed,
    }
  }
}

impl Default for ContainerControlledLifetimeManager {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for ContainerControlledLifetimeManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ContainerControlledLifetimeManager")
      .field("state", &self.state())
      .field("in_use", &self.in_use.get())
      .finish()
  }
}

impl LifetimeManager for ContainerControlledLifetimeManager {
  fn get_value(&self, _ctx: &LifetimeContext<'_>) -> Option<Instance> {
    match &*self.slot.read() {
      Slot::Holding(value) => Some(Arc::clone(value)),
      _ => None,
    }
  }

  fn set_value(&self, value: Instance, ctx: &LifetimeContext<'_>) {
    ctx.track_in(ctx.owner, &value);
    *self.slot.write() = Slot::Holding(value);
  }

  fn remove_value(&self, _ctx: &LifetimeContext<'_>) {
    let mut slot = self.slot.write();
    if matches!(*slot, Slot::Holding(_)) {
      *slot = Slot::Removed;
    }
  }

  fn creation_lock(&self, _ctx: &LifetimeContext<'_>) -> Option<Arc<ReentrantMutex<()>>> {
    Some(Arc::clone(&self.lock))
  }

  fn create_lifetime(&self) -> Arc<dyn LifetimeManager> {
    Arc::new(Self::new())
  }

  fn attach(&self) -> bool {
    self.in_use.claim()
  }

  fn in_use(&self) -> bool {
    self.in_use.get()
  }

  fn binds_to_owner(&self) -> bool {
    true
  }

  fn kind(&self) -> &'static str {
    "container-controlled"
  }
}

/// One instance per requesting scope.
///
/// The value lives in the scope the resolution was requested from, so two
/// sibling scopes each get their own instance and disposing a scope drops
/// its instance.
#[derive(Debug)]
pub struct HierarchicalLifetimeManager {
  id: u64,
  in_use: InUse,
}

impl HierarchicalLifetimeManager {
  pub fn new() -> Self {
    Self {
      id: next_lifetime_id(),
      in_use: InUse::default(),
    }
  }
}

impl Default for HierarchicalLifetimeManager {
  fn default() -> Self {
    Self::new()
  }
}

impl LifetimeManager for HierarchicalLifetimeManager {
  fn get_value(&self, ctx: &LifetimeContext<'_>) -> Option<Instance> {
    ctx.requester.scoped_value(self.id)
  }

  fn set_value(&self, value: Instance, ctx: &LifetimeContext<'_>) {
    ctx.track_in(ctx.requester, &value);
    ctx.requester.set_scoped_value(self.id, value);
  }

  fn remove_value(&self, ctx: &LifetimeContext<'_>) {
    ctx.requester.remove_scoped_value(self.id);
  }

  fn creation_lock(&self, ctx: &LifetimeContext<'_>) -> Option<Arc<ReentrantMutex<()>>> {
    Some(ctx.requester.scoped_lock(self.id))
  }

  fn create_lifetime(&self) -> Arc<dyn LifetimeManager> {
    Arc::new(Self::new())
  }

  fn attach(&self) -> bool {
    self.in_use.claim()
  }

  fn in_use(&self) -> bool {
    self.in_use.get()
  }

  fn kind(&self) -> &'static str {
    "hierarchical"
  }
}

/// One instance per top-level resolution call, shared by every nested
/// resolution within it.
#[derive(Debug)]
pub struct PerResolveLifetimeManager {
  id: u64,
  in_use: InUse,
}

impl PerResolveLifetimeManager {
  pub fn new() -> Self {
    Self {
      id: next_lifetime_id(),
      in_use: InUse::default(),
    }
  }
}

impl Default for PerResolveLifetimeManager {
  fn default() -> Self {
    Self::new()
  }
}

impl LifetimeManager for PerResolveLifetimeManager {
  fn get_value(&self, ctx: &LifetimeContext<'_>) -> Option<Instance> {
    ctx.resolution.per_resolve_value(self.id)
  }

  fn set_value(&self, value: Instance, ctx: &LifetimeContext<'_>) {
    ctx.resolution.set_per_resolve_value(self.id, value);
  }

  fn remove_value(&self, ctx: &LifetimeContext<'_>) {
    ctx.resolution.remove_per_resolve_value(self.id);
  }

  fn create_lifetime(&self) -> Arc<dyn LifetimeManager> {
    Arc::new(Self::new())
  }

  fn attach(&self) -> bool {
    self.in_use.claim()
  }

  fn in_use(&self) -> bool {
    self.in_use.get()
  }

  fn kind(&self) -> &'static str {
    "per-resolve"
  }
}

/// Holds a non-owning reference. The instance stays cached only while
/// something else keeps it alive.
pub struct ExternallyControlledLifetimeManager {
  slot: RwLock<Option<Weak<dyn Any + Send + Sync>>>,
  removed: AtomicBool,
  lock: Arc<ReentrantMutex<()>>,
  in_use: InUse,
}

impl ExternallyControlledLifetimeManager {
  pub fn new() -> Self {
    Self {
      slot: RwLock::new(None),
      removed: AtomicBool::new(false),
      lock: Arc::new(ReentrantMutex::new(())),
      in_use: InUse::default(),
    }
  }

  pub fn state(&self) -> LifetimeState {
    let alive = self
      .slot
      .read()
      .as_ref()
      .is_some_and(|weak| weak.strong_count() > 0);
    if alive {
      LifetimeState::Holding
    } else if self.removed.load(Ordering::Acquire) {
      LifetimeState::Removed
    } else {
      LifetimeState::Empty
    }
  }
}

impl Default for ExternallyControlledLifetimeManager {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for ExternallyControlledLifetimeManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExternallyControlledLifetimeManager")
      .field("state", &self.state())
      .finish()
  }
}

impl LifetimeManager for ExternallyControlledLifetimeManager {
  fn get_value(&self, _ctx: &LifetimeContext<'_>) -> Option<Instance> {
    self.slot.read().as_ref().and_then(Weak::upgrade)
  }

  fn set_value(&self, value: Instance, _ctx: &LifetimeContext<'_>) {
    *self.slot.write() = Some(Arc::downgrade(&value));
    self.removed.store(false, Ordering::Release);
  }

  fn remove_value(&self, _ctx: &LifetimeContext<'_>) {
    if self.slot.write().take().is_some() {
      self.removed.store(true, Ordering::Release);
    }
  }

  fn creation_lock(&self, _ctx: &LifetimeContext<'_>) -> Option<Arc<ReentrantMutex<()>>> {
    Some(Arc::clone(&self.lock))
  }

  fn create_lifetime(&self) -> Arc<dyn LifetimeManager> {
    Arc::new(Self::new())
  }

  fn attach(&self) -> bool {
    self.in_use.claim()
  }

  fn in_use(&self) -> bool {
    self.in_use.get()
  }

  fn kind(&self) -> &'static str {
    "externally-controlled"
  }
}
