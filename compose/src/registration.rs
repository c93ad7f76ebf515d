//! Registrations: the stored binding of a key to a target, its injection
//! members and its lifetime manager.

use crate::container::Container;
use crate::core::{Instance, TypeKey};
use crate::error::{BuildError, ConfigurationError};
use crate::lifetime::{
  ContainerControlledLifetimeManager, LifetimeManager, TransientLifetimeManager,
};
use crate::member::{DisposeHook, InjectionMember};
use crate::pipeline::Pipeline;
use crate::plan::compile_plan;
use crate::types::Type;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

/// A registration request, built fluently and handed to [`Container::register`].
///
/// ```
/// use fibre_compose::{Binding, ConstructorSpec, ContainerControlledLifetimeManager};
/// use std::sync::Arc;
///
/// struct Clock;
///
/// let binding = Binding::of::<Clock>()
///   .named("wall")
///   .lifetime(Arc::new(ContainerControlledLifetimeManager::new()))
///   .member(ConstructorSpec::of(|_| Ok(Clock)));
/// assert_eq!(binding.key().name(), Some("wall"));
/// ```
pub struct Binding {
  key: TypeKey,
  target: Option<Type>,
  lifetime: Option<Arc<dyn LifetimeManager>>,
  members: Vec<InjectionMember>,
  instance: Option<Instance>,
}

impl Binding {
  pub fn new(ty: Type) -> Self {
    Self {
      key: TypeKey::new(ty, None),
      target: None,
      lifetime: None,
      members: Vec::new(),
      instance: None,
    }
  }

  pub fn of<T: ?Sized + Any>() -> Self {
    Self::new(Type::of::<T>())
  }

  pub fn named(mut self, name: &str) -> Self {
    self.key = TypeKey::new(self.key.ty().clone(), Some(name));
    self
  }

  /// Maps the registered type to the type actually built.
  pub fn to(mut self, target: Type) -> Self {
    self.target = Some(target);
    self
  }

  pub fn lifetime(mut self, lifetime: Arc<dyn LifetimeManager>) -> Self {
    self.lifetime = Some(lifetime);
    self
  }

  pub fn member(mut self, member: impl Into<InjectionMember>) -> Self {
    self.members.push(member.into());
    self
  }

  pub fn members(mut self, members: impl IntoIterator<Item = InjectionMember>) -> Self {
    self.members.extend(members);
    self
  }

  /// Registers an existing object. Unless another lifetime is given, the
  /// container holds it like a singleton.
  pub fn instance<V: Any + Send + Sync>(mut self, value: Arc<V>) -> Self {
    self.instance = Some(value);
    self
  }

  pub fn key(&self) -> &TypeKey {
    &self.key
  }

  pub(crate) fn into_parts(self) -> (Registration, Option<Instance>) {
    let Binding {
      key,
      target,
      lifetime,
      members,
      instance,
    } = self;
    let lifetime = lifetime.unwrap_or_else(|| -> Arc<dyn LifetimeManager> {
      if instance.is_some() {
        Arc::new(ContainerControlledLifetimeManager::new())
      } else {
        Arc::new(TransientLifetimeManager::new())
      }
    });
    let target = target.unwrap_or_else(|| key.ty().clone());
    (Registration::unattached(key, target, members, lifetime), instance)
  }
}

impl fmt::Debug for Binding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Binding")
      .field("key", &self.key)
      .field("target", &self.target)
      .field("members", &self.members)
      .field("instance", &self.instance.is_some())
      .finish()
  }
}

/// The stored binding of a key to a target type, injection members and a
/// lifetime manager. Its pipeline is compiled once, on first resolution.
pub struct Registration {
  key: TypeKey,
  target: Type,
  members: Vec<InjectionMember>,
  lifetime: Arc<dyn LifetimeManager>,
  build_required: bool,
  teardown: Option<DisposeHook>,
  pipeline: OnceCell<Arc<Pipeline>>,
  compile_lock: Mutex<()>,
}

impl Registration {
  fn unattached(
    key: TypeKey,
    target: Type,
    members: Vec<InjectionMember>,
    lifetime: Arc<dyn LifetimeManager>,
  ) -> Self {
    let build_required = members.iter().any(InjectionMember::build_required);
    let teardown = members.iter().find_map(|member| match member {
      InjectionMember::Teardown(hook) => Some(Arc::clone(hook)),
      _ => None,
    });
    Self {
      key,
      target,
      members,
      lifetime,
      build_required,
      teardown,
      pipeline: OnceCell::new(),
      compile_lock: Mutex::new(()),
    }
  }

  /// Creates a registration and attaches its lifetime manager.
  pub(crate) fn new(
    key: TypeKey,
    target: Type,
    members: Vec<InjectionMember>,
    lifetime: Arc<dyn LifetimeManager>,
  ) -> Result<Self, ConfigurationError> {
    let registration = Self::unattached(key, target, members, lifetime);
    registration.attach()?;
    Ok(registration)
  }

  /// Checks that the mapping is well formed before anything is claimed.
  pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
    let invalid = |reason| ConfigurationError::InvalidMapping {
      key: self.key.clone(),
      target: self.target.clone(),
      reason,
    };
    match (self.key.ty().is_open(), self.target.is_open()) {
      (true, false) => Err(invalid("an open generic type must map to an open generic type")),
      (false, true) => Err(invalid("a closed type cannot map to an open generic type")),
      (true, true) if !self.key.ty().has_contiguous_parameters() => Err(invalid(
        "the registered type must use its type parameters in order, starting at T0",
      )),
      (true, true) if self.target.parameter_count() > self.key.ty().parameter_count() => Err(invalid(
        "the mapped type uses more type parameters than the registered type declares",
      )),
      _ => Ok(()),
    }
  }

  pub(crate) fn attach(&self) -> Result<(), ConfigurationError> {
    if self.lifetime.attach() {
      Ok(())
    } else {
      Err(ConfigurationError::LifetimeManagerInUse {
        key: self.key.clone(),
        manager: self.lifetime.kind(),
      })
    }
  }

  pub fn key(&self) -> &TypeKey {
    &self.key
  }

  /// The type built for this registration.
  pub fn target(&self) -> &Type {
    &self.target
  }

  pub fn members(&self) -> &[InjectionMember] {
    &self.members
  }

  pub fn lifetime(&self) -> &Arc<dyn LifetimeManager> {
    &self.lifetime
  }

  /// True if a cached instance must still run its build-required members.
  pub fn build_required(&self) -> bool {
    self.build_required
  }

  pub fn teardown(&self) -> Option<&DisposeHook> {
    self.teardown.as_ref()
  }

  pub fn is_open(&self) -> bool {
    self.key.ty().is_open()
  }

  pub fn is_compiled(&self) -> bool {
    self.pipeline.get().is_some()
  }

  /// The compiled pipeline, compiling it against `owner`'s strategy chains
  /// on first use. Compilation runs at most once per registration.
  pub(crate) fn pipeline(&self, owner: &Container) -> Result<Arc<Pipeline>, BuildError> {
    if let Some(pipeline) = self.pipeline.get() {
      return Ok(Arc::clone(pipeline));
    }

    let _guard = self.compile_lock.lock();
    if let Some(pipeline) = self.pipeline.get() {
      return Ok(Arc::clone(pipeline));
    }

    let plan = compile_plan(
      &owner.plan_strategies().compile(),
      &self.key,
      &self.target,
      &self.members,
      owner.policies(),
    )?;
    debug!(key = %self.key, mapped = %self.target, steps = plan.len(), "compiled build pipeline");
    let pipeline = Arc::new(Pipeline::new(owner.strategies().compile(), plan));
    // Only this thread can set the cell while the lock is held.
    let _ = self.pipeline.set(Arc::clone(&pipeline));
    Ok(pipeline)
  }
}

impl fmt::Debug for Registration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Registration")
      .field("key", &self.key)
      .field("target", &self.target)
      .field("lifetime", &self.lifetime.kind())
      .field("members", &self.members)
      .field("compiled", &self.is_compiled())
      .finish()
  }
}
