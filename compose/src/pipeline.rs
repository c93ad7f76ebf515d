//! The per-resolution execution engine.
//!
//! A [`Pipeline`] pairs a snapshot of the build strategy chain with a
//! registration's compiled [`BuildPlan`]. Executing it walks the strategies
//! over a [`BuildContext`]: pre-steps in order until one completes the build,
//! then post-steps in reverse.

use crate::chain::CompiledChain;
use crate::container::Container;
use crate::core::{Instance, TypeKey};
use crate::error::{BuildError, Cause, Frame};
use crate::lifetime::LifetimeContext;
use crate::member::{Arguments, ConstructorSpec, FactoryContext, FactorySpec};
use crate::plan::{ArgSource, BuildPlan, BuildStep, ResolvedParameter};
use crate::registration::Registration;
use crate::types::Type;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// An ad hoc value supplied for a single resolve call.
///
/// Overrides apply to every build in the call graph of that call and never
/// touch registrations or cached instances.
#[derive(Clone)]
pub enum ResolverOverride {
  /// Replaces a constructor or method parameter with this name.
  Parameter {
    name: Arc<str>,
    value: Instance,
    on: Option<Type>,
  },
  /// Replaces the value injected into a property with this name.
  Property {
    name: Arc<str>,
    value: Instance,
    on: Option<Type>,
  },
  /// Replaces every dependency on this key.
  Dependency { key: TypeKey, value: Instance },
}

impl ResolverOverride {
  pub fn parameter(name: &str, value: Instance) -> Self {
    ResolverOverride::Parameter {
      name: Arc::from(name),
      value,
      on: None,
    }
  }

  pub fn property(name: &str, value: Instance) -> Self {
    ResolverOverride::Property {
      name: Arc::from(name),
      value,
      on: None,
    }
  }

  pub fn dependency(key: TypeKey, value: Instance) -> Self {
    ResolverOverride::Dependency { key, value }
  }

  /// Restricts a parameter or property override to builds of `ty`.
  pub fn on(self, ty: Type) -> Self {
    match self {
      ResolverOverride::Parameter { name, value, .. } => ResolverOverride::Parameter {
        name,
        value,
        on: Some(ty),
      },
      ResolverOverride::Property { name, value, .. } => ResolverOverride::Property {
        name,
        value,
        on: Some(ty),
      },
      other => other,
    }
  }
}

impl fmt::Debug for ResolverOverride {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResolverOverride::Parameter { name, on, .. } => {
        f.debug_struct("Parameter").field("name", name).field("on", on).finish()
      }
      ResolverOverride::Property { name, on, .. } => {
        f.debug_struct("Property").field("name", name).field("on", on).finish()
      }
      ResolverOverride::Dependency { key, .. } => {
        f.debug_struct("Dependency").field("key", key).finish()
      }
    }
  }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
  Parameter,
  Property,
}

/// State shared by every nested build of one top-level resolve call.
pub struct Resolution {
  overrides: Vec<ResolverOverride>,
  per_resolve: Mutex<HashMap<u64, Instance>>,
}

impl Resolution {
  pub(crate) fn new(overrides: Vec<ResolverOverride>) -> Self {
    Self {
      overrides,
      per_resolve: Mutex::new(HashMap::new()),
    }
  }

  pub fn overrides(&self) -> &[ResolverOverride] {
    &self.overrides
  }

  pub(crate) fn per_resolve_value(&self, id: u64) -> Option<Instance> {
    self.per_resolve.lock().get(&id).cloned()
  }

  pub(crate) fn set_per_resolve_value(&self, id: u64, value: Instance) {
    self.per_resolve.lock().insert(id, value);
  }

  pub(crate) fn remove_per_resolve_value(&self, id: u64) {
    self.per_resolve.lock().remove(&id);
  }

  // The last matching override wins.
  fn find_override(&self, slot: Slot, parameter: &ResolvedParameter, target: &Type) -> Option<Instance> {
    let applies_to = |on: &Option<Type>| on.as_ref().map_or(true, |ty| ty == target);
    self.overrides.iter().rev().find_map(|o| match o {
      ResolverOverride::Parameter { name, value, on }
        if slot == Slot::Parameter && name == parameter.name() && applies_to(on) =>
      {
        Some(Arc::clone(value))
      }
      ResolverOverride::Property { name, value, on }
        if slot == Slot::Property && name == parameter.name() && applies_to(on) =>
      {
        Some(Arc::clone(value))
      }
      ResolverOverride::Dependency { key, value } => match parameter.source() {
        ArgSource::Resolve { key: wanted, .. } if wanted == key => Some(Arc::clone(value)),
        _ => None,
      },
      _ => None,
    })
  }
}

impl fmt::Debug for Resolution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Resolution")
      .field("overrides", &self.overrides)
      .finish_non_exhaustive()
  }
}

/// The mutable state of one registration's build within a resolution.
pub struct BuildContext<'a> {
  key: &'a TypeKey,
  registration: &'a Registration,
  plan: &'a BuildPlan,
  owner: &'a Container,
  requester: &'a Container,
  resolution: &'a Resolution,
  depth: usize,
  target: Type,
  existing: Option<Instance>,
  build_complete: bool,
  build_up: bool,
  cached: bool,
  recovery: Vec<Box<dyn FnOnce() + Send>>,
  // The lifetime manager's creation lock, held from the cache miss in the
  // lifetime pre-step until the value is stored in its post-step.
  creation_guard: Option<Box<dyn Any>>,
}

impl<'a> BuildContext<'a> {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    key: &'a TypeKey,
    registration: &'a Registration,
    plan: &'a BuildPlan,
    owner: &'a Container,
    requester: &'a Container,
    resolution: &'a Resolution,
    depth: usize,
    existing: Option<Instance>,
  ) -> Self {
    let build_up = existing.is_some();
    Self {
      key,
      registration,
      plan,
      owner,
      requester,
      resolution,
      depth,
      target: key.ty().clone(),
      existing,
      build_complete: false,
      build_up,
      cached: false,
      recovery: Vec::new(),
      creation_guard: None,
    }
  }

  /// The requested key.
  pub fn key(&self) -> &'a TypeKey {
    self.key
  }

  pub fn registration(&self) -> &'a Registration {
    self.registration
  }

  pub fn plan(&self) -> &'a BuildPlan {
    self.plan
  }

  /// The scope that owns the registration being built.
  pub fn owner(&self) -> &'a Container {
    self.owner
  }

  /// The scope the resolution was requested from.
  pub fn requester(&self) -> &'a Container {
    self.requester
  }

  pub fn resolution(&self) -> &'a Resolution {
    self.resolution
  }

  pub fn depth(&self) -> usize {
    self.depth
  }

  /// The type currently being built.
  pub fn target(&self) -> &Type {
    &self.target
  }

  pub fn set_target(&mut self, target: Type) {
    self.target = target;
  }

  pub fn existing(&self) -> Option<&Instance> {
    self.existing.as_ref()
  }

  pub fn set_existing(&mut self, instance: Instance) {
    self.existing = Some(instance);
  }

  /// Stops the remaining pre-steps from running.
  pub fn complete(&mut self) {
    self.build_complete = true;
  }

  pub fn is_complete(&self) -> bool {
    self.build_complete
  }

  /// True when building up an existing instance: construction never runs.
  pub fn is_build_up(&self) -> bool {
    self.build_up
  }

  /// True when the instance came from the lifetime manager's cache.
  pub fn is_cached(&self) -> bool {
    self.cached
  }

  /// Registers an action to run if a later stage fails.
  pub fn add_recovery(&mut self, action: impl FnOnce() + Send + 'static) {
    self.recovery.push(Box::new(action));
  }

  pub fn lifetime_context(&self) -> LifetimeContext<'a> {
    LifetimeContext {
      owner: self.owner,
      requester: self.requester,
      resolution: self.resolution,
      teardown: self.registration.teardown(),
    }
  }

  /// The scope this build's dependencies are resolved from.
  pub fn dependency_scope(&self) -> &'a Container {
    if self.registration.lifetime().binds_to_owner() {
      self.owner
    } else {
      self.requester
    }
  }

  /// Resolves a dependency as a nested part of this resolution.
  pub fn resolve(&self, key: &TypeKey) -> Result<Instance, BuildError> {
    self
      .dependency_scope()
      .resolve_nested(key, self.resolution, self.depth + 1, None)
  }

  fn use_cached(&mut self, value: Instance) {
    self.existing = Some(value);
    self.cached = true;
    if !self.registration.build_required() {
      self.build_complete = true;
    }
  }

  fn resolve_parameter(
    &self,
    parameter: &ResolvedParameter,
    slot: Slot,
  ) -> Result<Option<Instance>, BuildError> {
    if let Some(value) = self.resolution.find_override(slot, parameter, &self.target) {
      return Ok(Some(value));
    }
    match parameter.source() {
      ArgSource::Value(value) => Ok(Some(Arc::clone(value))),
      ArgSource::Resolve { key, optional } => match self.resolve(key) {
        Ok(value) => Ok(Some(value)),
        Err(error) if *optional && error.is_not_registered(key) => Ok(None),
        Err(error) => Err(error),
      },
    }
  }

  fn recover(&mut self) {
    while let Some(action) = self.recovery.pop() {
      action();
    }
  }
}

/// One stage of the build chain.
pub trait BuildStrategy: Send + Sync {
  fn pre_build_up(&self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    Ok(())
  }

  fn post_build_up(&self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    Ok(())
  }
}

/// A compiled, reusable build pipeline for one registration.
pub struct Pipeline {
  strategies: Arc<CompiledChain<dyn BuildStrategy>>,
  plan: BuildPlan,
}

impl Pipeline {
  pub(crate) fn new(strategies: Arc<CompiledChain<dyn BuildStrategy>>, plan: BuildPlan) -> Self {
    Self { strategies, plan }
  }

  pub fn plan(&self) -> &BuildPlan {
    &self.plan
  }

  pub fn strategies(&self) -> &[Arc<dyn BuildStrategy>] {
    self.strategies.strategies()
  }

  /// Runs the pipeline. On failure every recovery action runs before the
  /// error is returned.
  pub(crate) fn execute(&self, ctx: &mut BuildContext<'_>) -> Result<Instance, BuildError> {
    if let Err(error) = self.run(ctx) {
      ctx.recover();
      ctx.creation_guard = None;
      return Err(error);
    }
    ctx.recovery.clear();
    ctx.creation_guard = None;
    ctx.existing.clone().ok_or_else(|| {
      BuildError::new(Cause::NoConstructor {
        target: ctx.target.clone(),
      })
    })
  }

  fn run(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    let strategies = self.strategies.strategies();
    let mut ran = 0;
    for strategy in strategies {
      strategy.pre_build_up(ctx)?;
      ran += 1;
      if ctx.build_complete {
        break;
      }
    }
    for strategy in strategies[..ran].iter().rev() {
      strategy.post_build_up(ctx)?;
    }
    Ok(())
  }
}

impl fmt::Debug for Pipeline {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pipeline")
      .field("strategies", &self.strategies.len())
      .field("plan", &self.plan)
      .finish()
  }
}

// --- Default strategies ---

/// Moves the build target from the requested type to the mapped type.
#[derive(Debug, Default)]
pub struct TypeMappingStrategy;

impl BuildStrategy for TypeMappingStrategy {
  fn pre_build_up(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    let target = ctx.registration.target();
    if *target != ctx.target {
      trace!(from = %ctx.target, to = %target, "mapped build target");
      ctx.target = target.clone();
    }
    Ok(())
  }
}

/// Consults the registration's lifetime manager before building and stores
/// the new instance afterwards.
#[derive(Debug, Default)]
pub struct LifetimeStrategy;

impl BuildStrategy for LifetimeStrategy {
  fn pre_build_up(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    if ctx.build_up {
      return Ok(());
    }
    let lifetime = ctx.registration.lifetime();
    let lifetime_ctx = ctx.lifetime_context();
    if let Some(value) = lifetime.get_value(&lifetime_ctx) {
      ctx.use_cached(value);
      return Ok(());
    }
    if let Some(lock) = lifetime.creation_lock(&lifetime_ctx) {
      let guard = lock.lock_arc();
      // Another thread may have stored the value while we waited.
      if let Some(value) = lifetime.get_value(&lifetime_ctx) {
        drop(guard);
        ctx.use_cached(value);
        return Ok(());
      }
      ctx.creation_guard = Some(Box::new(guard));
    }
    Ok(())
  }

  fn post_build_up(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    if !ctx.build_up && !ctx.cached {
      if let Some(value) = ctx.existing.clone() {
        let lifetime_ctx = ctx.lifetime_context();
        ctx.registration.lifetime().set_value(value, &lifetime_ctx);
      }
    }
    ctx.creation_guard = None;
    Ok(())
  }
}

/// Runs the plan's creation step unless an instance already exists.
#[derive(Debug, Default)]
pub struct CreationStrategy;

impl BuildStrategy for CreationStrategy {
  fn pre_build_up(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    if ctx.existing.is_some() {
      return Ok(());
    }
    let instance = match ctx.plan.creation() {
      Some(BuildStep::Construct {
        constructor,
        parameters,
      }) => construct(ctx, constructor, parameters)?,
      Some(BuildStep::Factory(factory)) => invoke_factory(ctx, factory)?,
      _ => {
        return Err(BuildError::new(Cause::NoConstructor {
          target: ctx.target.clone(),
        }))
      }
    };
    trace!(mapped = %ctx.target, "created instance");

    if let Some(hook) = ctx.registration.teardown() {
      let hook = Arc::clone(hook);
      let pending = Arc::clone(&instance);
      ctx.add_recovery(move || hook(&pending));
    }
    ctx.existing = Some(instance);
    Ok(())
  }
}

fn construct(
  ctx: &BuildContext<'_>,
  constructor: &ConstructorSpec,
  parameters: &[ResolvedParameter],
) -> Result<Instance, BuildError> {
  let frame = || Frame::Constructor {
    signature: constructor.signature(&ctx.target),
  };
  let mut values = Vec::with_capacity(parameters.len());
  for parameter in parameters {
    let value = ctx
      .resolve_parameter(parameter, Slot::Parameter)
      .map_err(|e| e.within(parameter_frame(parameter)).within(frame()))?;
    values.push(value);
  }
  (constructor.activator())(&Arguments::new(&ctx.target, &values))
    .map_err(|e| BuildError::activation(e).within(frame()))
}

fn invoke_factory(ctx: &BuildContext<'_>, factory: &FactorySpec) -> Result<Instance, BuildError> {
  let factory_ctx = FactoryContext {
    container: ctx.dependency_scope(),
    resolution: ctx.resolution,
    key: ctx.key,
    target: &ctx.target,
    depth: ctx.depth,
  };
  (factory.factory())(&factory_ctx).map_err(|e| {
    e.within(Frame::Factory {
      target: ctx.target.clone(),
    })
  })
}

fn parameter_frame(parameter: &ResolvedParameter) -> Frame {
  Frame::Parameter {
    name: Arc::clone(parameter.name()),
    ty: parameter.ty().clone(),
  }
}

/// Injects properties and calls initialization methods on the existing instance.
///
/// For a cached instance only the members flagged as build-required run.
#[derive(Debug, Default)]
pub struct InitializationStrategy;

impl BuildStrategy for InitializationStrategy {
  fn pre_build_up(&self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    let Some(instance) = ctx.existing.clone() else {
      return Ok(());
    };
    let ctx = &*ctx;
    for step in ctx.plan.initialization() {
      match step {
        BuildStep::SetProperty {
          property,
          parameter,
        } => {
          if ctx.cached && !property.build_required() {
            continue;
          }
          let frame = || Frame::Property {
            name: Arc::clone(property.name()),
            ty: parameter.ty().clone(),
          };
          let value = ctx
            .resolve_parameter(parameter, Slot::Property)
            .map_err(|e| e.within(frame()))?;
          if let Some(value) = value {
            (property.setter())(&instance, value)
              .map_err(|e| BuildError::activation(e).within(frame()))?;
          }
        }
        BuildStep::CallMethod { method, parameters } => {
          if ctx.cached && !method.build_required() {
            continue;
          }
          let frame = || Frame::Method {
            target: ctx.target.clone(),
            name: Arc::clone(method.name()),
          };
          let mut values = Vec::with_capacity(parameters.len());
          for parameter in parameters {
            let value = ctx
              .resolve_parameter(parameter, Slot::Parameter)
              .map_err(|e| e.within(parameter_frame(parameter)).within(frame()))?;
            values.push(value);
          }
          (method.invoker())(&instance, &Arguments::new(&ctx.target, &values))
            .map_err(|e| BuildError::activation(e).within(frame()))?;
        }
        _ => {}
      }
    }
    Ok(())
  }
}
