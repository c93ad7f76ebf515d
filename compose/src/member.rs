//! Injection members: the declarative description of how to build and
//! initialize a registration's target, and the policies that select among them.

use crate::container::Container;
use crate::core::{downcast_instance, Instance, TypeKey};
use crate::error::{BoxError, BuildError};
use crate::pipeline::Resolution;
use crate::types::Type;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Builds an instance from resolved constructor arguments.
pub type Activator = Arc<dyn Fn(&Arguments<'_>) -> Result<Instance, BoxError> + Send + Sync>;
/// Injects a resolved value into an existing instance.
pub type Setter = Arc<dyn Fn(&Instance, Instance) -> Result<(), BoxError> + Send + Sync>;
/// Calls an initialization method on an existing instance.
pub type Invoker = Arc<dyn Fn(&Instance, &Arguments<'_>) -> Result<(), BoxError> + Send + Sync>;
/// Builds an instance with full access to the ongoing resolution.
pub type Factory = Arc<dyn Fn(&FactoryContext<'_>) -> Result<Instance, BuildError> + Send + Sync>;
/// Releases an instance when its owner is disposed or its build fails.
pub type DisposeHook = Arc<dyn Fn(&Instance) + Send + Sync>;

/// Types that hold resources needing explicit release.
pub trait Dispose: Send + Sync {
  fn dispose(&self);
}

/// What to inject into one slot.
#[derive(Clone)]
pub struct Dependency {
  ty: Type,
  name: Option<Arc<str>>,
  optional: bool,
  value: Option<Instance>,
}

impl Dependency {
  pub fn on(ty: Type) -> Self {
    Self {
      ty,
      name: None,
      optional: false,
      value: None,
    }
  }

  pub fn of<T: ?Sized + Any>() -> Self {
    Self::on(Type::of::<T>())
  }

  /// A fixed value instead of a resolved one.
  pub fn value<T: Any + Send + Sync>(value: T) -> Self {
    Self {
      ty: Type::of::<T>(),
      name: None,
      optional: false,
      value: Some(Arc::new(value)),
    }
  }

  /// Resolves the named registration of the dependency type.
  pub fn named(mut self, name: &str) -> Self {
    self.name = Some(Arc::from(name));
    self
  }

  /// Injects nothing instead of failing when the dependency is not registered.
  pub fn optional(mut self) -> Self {
    self.optional = true;
    self
  }

  pub fn ty(&self) -> &Type {
    &self.ty
  }

  pub fn key(&self) -> TypeKey {
    TypeKey::new(self.ty.clone(), self.name.as_deref())
  }

  pub fn is_optional(&self) -> bool {
    self.optional
  }

  pub fn fixed_value(&self) -> Option<&Instance> {
    self.value.as_ref()
  }

  pub(crate) fn close(&self, args: &[Type]) -> Self {
    Self {
      ty: self.ty.substitute(args),
      ..self.clone()
    }
  }
}

impl fmt::Debug for Dependency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Dependency")
      .field("key", &self.key())
      .field("optional", &self.optional)
      .field("fixed", &self.value.is_some())
      .finish()
  }
}

/// A named slot of a constructor or method.
#[derive(Clone, Debug)]
pub struct Parameter {
  name: Arc<str>,
  dependency: Dependency,
}

impl Parameter {
  pub fn new(name: &str, dependency: Dependency) -> Self {
    Self {
      name: Arc::from(name),
      dependency,
    }
  }

  pub fn name(&self) -> &Arc<str> {
    &self.name
  }

  pub fn dependency(&self) -> &Dependency {
    &self.dependency
  }

  fn close(&self, args: &[Type]) -> Self {
    Self {
      name: self.name.clone(),
      dependency: self.dependency.close(args),
    }
  }
}

/// Resolved argument values, in parameter order.
pub struct Arguments<'a> {
  target: &'a Type,
  values: &'a [Option<Instance>],
}

impl<'a> Arguments<'a> {
  pub(crate) fn new(target: &'a Type, values: &'a [Option<Instance>]) -> Self {
    Self { target, values }
  }

  /// The closed type being built.
  pub fn target(&self) -> &'a Type {
    self.target
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn raw(&self, index: usize) -> Option<&'a Instance> {
    self.values.get(index).and_then(Option::as_ref)
  }

  pub fn get<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>, BoxError> {
    self
      .optional::<T>(index)?
      .ok_or_else(|| format!("argument {} of {} has no value", index, self.target).into())
  }

  pub fn optional<T: Any + Send + Sync>(&self, index: usize) -> Result<Option<Arc<T>>, BoxError> {
    match self.raw(index) {
      None => Ok(None),
      Some(value) => Arc::clone(value).downcast::<T>().map(Some).map_err(|_| {
        format!(
          "argument {} of {} is not a {}",
          index,
          self.target,
          std::any::type_name::<T>()
        )
        .into()
      }),
    }
  }
}

/// Access to the ongoing resolution from inside a [`FactorySpec`].
pub struct FactoryContext<'a> {
  pub(crate) container: &'a Container,
  pub(crate) resolution: &'a Resolution,
  pub(crate) key: &'a TypeKey,
  pub(crate) target: &'a Type,
  pub(crate) depth: usize,
}

impl<'a> FactoryContext<'a> {
  /// The scope dependencies are resolved from.
  pub fn container(&self) -> &'a Container {
    self.container
  }

  /// The requested key.
  pub fn key(&self) -> &'a TypeKey {
    self.key
  }

  /// The closed type being built.
  pub fn target(&self) -> &'a Type {
    self.target
  }

  /// Resolves a dependency as part of the current resolution.
  pub fn resolve<T: Any + Send + Sync>(&self, name: Option<&str>) -> Result<Arc<T>, BuildError> {
    let key = TypeKey::new(Type::of::<T>(), name);
    let instance = self.resolve_key(&key)?;
    Ok(downcast_instance::<T>(instance, &key)?)
  }

  pub fn resolve_type(&self, ty: &Type, name: Option<&str>) -> Result<Instance, BuildError> {
    self.resolve_key(&TypeKey::new(ty.clone(), name))
  }

  fn resolve_key(&self, key: &TypeKey) -> Result<Instance, BuildError> {
    self
      .container
      .resolve_nested(key, self.resolution, self.depth + 1, None)
  }
}

/// A constructor: ordered parameters and the activator that receives them.
#[derive(Clone)]
pub struct ConstructorSpec {
  parameters: Vec<Parameter>,
  activator: Activator,
}

impl ConstructorSpec {
  pub fn new(
    activator: impl Fn(&Arguments<'_>) -> Result<Instance, BoxError> + Send + Sync + 'static,
  ) -> Self {
    Self {
      parameters: Vec::new(),
      activator: Arc::new(activator),
    }
  }

  /// A constructor producing a concrete `T`.
  pub fn of<T: Any + Send + Sync>(
    activator: impl Fn(&Arguments<'_>) -> Result<T, BoxError> + Send + Sync + 'static,
  ) -> Self {
    Self::new(move |args| Ok(Arc::new(activator(args)?) as Instance))
  }

  pub fn param(mut self, name: &str, dependency: Dependency) -> Self {
    self.parameters.push(Parameter::new(name, dependency));
    self
  }

  pub fn parameters(&self) -> &[Parameter] {
    &self.parameters
  }

  pub fn activator(&self) -> &Activator {
    &self.activator
  }

  /// Renders the constructor as `Target(name: Type, ...)`.
  pub fn signature(&self, target: &Type) -> String {
    let params: Vec<String> = self
      .parameters
      .iter()
      .map(|p| format!("{}: {}", p.name, p.dependency.ty))
      .collect();
    format!("{}({})", target, params.join(", "))
  }

  fn close(&self, args: &[Type]) -> Self {
    Self {
      parameters: self.parameters.iter().map(|p| p.close(args)).collect(),
      activator: Arc::clone(&self.activator),
    }
  }
}

/// A property to inject after construction.
#[derive(Clone)]
pub struct PropertySpec {
  name: Arc<str>,
  dependency: Dependency,
  setter: Setter,
  build_required: bool,
}

impl PropertySpec {
  pub fn new(
    name: &str,
    dependency: Dependency,
    setter: impl Fn(&Instance, Instance) -> Result<(), BoxError> + Send + Sync + 'static,
  ) -> Self {
    Self {
      name: Arc::from(name),
      dependency,
      setter: Arc::new(setter),
      build_required: false,
    }
  }

  /// A property of `T` holding a `D`.
  pub fn typed<T: Any + Send + Sync, D: Any + Send + Sync>(
    name: &str,
    dependency: Dependency,
    setter: impl Fn(&T, Arc<D>) -> Result<(), BoxError> + Send + Sync + 'static,
  ) -> Self {
    let property: Arc<str> = Arc::from(name);
    let label = Arc::clone(&property);
    Self::new(name, dependency, move |target, value| {
      let target = target
        .downcast_ref::<T>()
        .ok_or_else(|| format!("property \"{}\" is not declared on this instance", label))?;
      let value = value
        .downcast::<D>()
        .map_err(|_| format!("value for property \"{}\" has the wrong type", label))?;
      setter(target, value)
    })
  }

  /// Re-inject this property even when the lifetime manager returns a cached instance.
  pub fn force_build(mut self) -> Self {
    self.build_required = true;
    self
  }

  pub fn name(&self) -> &Arc<str> {
    &self.name
  }

  pub fn dependency(&self) -> &Dependency {
    &self.dependency
  }

  pub fn setter(&self) -> &Setter {
    &self.setter
  }

  pub fn build_required(&self) -> bool {
    self.build_required
  }
}

/// An initialization method called after construction and property injection.
#[derive(Clone)]
pub struct MethodSpec {
  name: Arc<str>,
  parameters: Vec<Parameter>,
  invoker: Invoker,
  build_required: bool,
}

impl MethodSpec {
  pub fn new(
    name: &str,
    invoker: impl Fn(&Instance, &Arguments<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
  ) -> Self {
    Self {
      name: Arc::from(name),
      parameters: Vec::new(),
      invoker: Arc::new(invoker),
      build_required: false,
    }
  }

  /// A method on `T`.
  pub fn typed<T: Any + Send + Sync>(
    name: &str,
    invoker: impl Fn(&T, &Arguments<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
  ) -> Self {
    let label: Arc<str> = Arc::from(name);
    Self::new(name, move |target, args| {
      let target = target
        .downcast_ref::<T>()
        .ok_or_else(|| format!("method \"{}\" is not declared on this instance", label))?;
      invoker(target, args)
    })
  }

  pub fn param(mut self, name: &str, dependency: Dependency) -> Self {
    self.parameters.push(Parameter::new(name, dependency));
    self
  }

  pub fn force_build(mut self) -> Self {
    self.build_required = true;
    self
  }

  pub fn name(&self) -> &Arc<str> {
    &self.name
  }

  pub fn parameters(&self) -> &[Parameter] {
    &self.parameters
  }

  pub fn invoker(&self) -> &Invoker {
    &self.invoker
  }

  pub fn build_required(&self) -> bool {
    self.build_required
  }
}

/// Builds the instance with a user function instead of a constructor.
#[derive(Clone)]
pub struct FactorySpec {
  factory: Factory,
}

impl FactorySpec {
  pub fn new(
    factory: impl Fn(&FactoryContext<'_>) -> Result<Instance, BuildError> + Send + Sync + 'static,
  ) -> Self {
    Self {
      factory: Arc::new(factory),
    }
  }

  pub fn of<T: Any + Send + Sync>(
    factory: impl Fn(&FactoryContext<'_>) -> Result<T, BuildError> + Send + Sync + 'static,
  ) -> Self {
    Self::new(move |ctx| Ok(Arc::new(factory(ctx)?) as Instance))
  }

  pub fn factory(&self) -> &Factory {
    &self.factory
  }
}

/// One declared piece of a registration's build plan.
#[derive(Clone)]
pub enum InjectionMember {
  Constructor(ConstructorSpec),
  Property(PropertySpec),
  Method(MethodSpec),
  Factory(FactorySpec),
  Teardown(DisposeHook),
}

impl InjectionMember {
  /// Releases instances of `T` through its [`Dispose`] impl.
  pub fn disposable<T: Dispose + Any>() -> Self {
    InjectionMember::Teardown(Arc::new(|instance: &Instance| {
      if let Some(target) = instance.downcast_ref::<T>() {
        target.dispose();
      }
    }))
  }

  pub fn teardown(hook: impl Fn(&Instance) + Send + Sync + 'static) -> Self {
    InjectionMember::Teardown(Arc::new(hook))
  }

  /// Whether this member must run even when a cached instance exists.
  pub fn build_required(&self) -> bool {
    match self {
      InjectionMember::Property(property) => property.build_required,
      InjectionMember::Method(method) => method.build_required,
      _ => false,
    }
  }

  /// Specializes every dependency type for the given generic arguments.
  pub fn close(&self, args: &[Type]) -> Self {
    match self {
      InjectionMember::Constructor(ctor) => InjectionMember::Constructor(ctor.close(args)),
      InjectionMember::Property(property) => InjectionMember::Property(PropertySpec {
        dependency: property.dependency.close(args),
        ..property.clone()
      }),
      InjectionMember::Method(method) => InjectionMember::Method(MethodSpec {
        parameters: method.parameters.iter().map(|p| p.close(args)).collect(),
        ..method.clone()
      }),
      other => other.clone(),
    }
  }
}

impl fmt::Debug for InjectionMember {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InjectionMember::Constructor(ctor) => f
        .debug_tuple("Constructor")
        .field(&ctor.parameters)
        .finish(),
      InjectionMember::Property(property) => f.debug_tuple("Property").field(&property.name).finish(),
      InjectionMember::Method(method) => f.debug_tuple("Method").field(&method.name).finish(),
      InjectionMember::Factory(_) => f.write_str("Factory"),
      InjectionMember::Teardown(_) => f.write_str("Teardown"),
    }
  }
}

impl From<ConstructorSpec> for InjectionMember {
  fn from(spec: ConstructorSpec) -> Self {
    InjectionMember::Constructor(spec)
  }
}

impl From<PropertySpec> for InjectionMember {
  fn from(spec: PropertySpec) -> Self {
    InjectionMember::Property(spec)
  }
}

impl From<MethodSpec> for InjectionMember {
  fn from(spec: MethodSpec) -> Self {
    InjectionMember::Method(spec)
  }
}

impl From<FactorySpec> for InjectionMember {
  fn from(spec: FactorySpec) -> Self {
    InjectionMember::Factory(spec)
  }
}

// --- Selection policies ---

/// Chooses the constructor used to build a target.
pub trait ConstructorSelector: Send + Sync {
  fn select(&self, target: &Type, members: &[InjectionMember]) -> Option<ConstructorSpec>;
}

/// Chooses and orders the properties injected into a target.
pub trait PropertySelector: Send + Sync {
  fn select(&self, target: &Type, members: &[InjectionMember]) -> Vec<PropertySpec>;
}

/// Chooses and orders the initialization methods called on a target.
pub trait MethodSelector: Send + Sync {
  fn select(&self, target: &Type, members: &[InjectionMember]) -> Vec<MethodSpec>;
}

/// Picks the declared constructor with the most parameters; the first one
/// declared wins a tie.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConstructorSelector;

impl ConstructorSelector for DefaultConstructorSelector {
  fn select(&self, _target: &Type, members: &[InjectionMember]) -> Option<ConstructorSpec> {
    let mut best: Option<&ConstructorSpec> = None;
    for member in members {
      if let InjectionMember::Constructor(ctor) = member {
        if best.map_or(true, |b| ctor.parameters.len() > b.parameters.len()) {
          best = Some(ctor);
        }
      }
    }
    best.cloned()
  }
}

/// Every declared property, in declaration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPropertySelector;

impl PropertySelector for DefaultPropertySelector {
  fn select(&self, _target: &Type, members: &[InjectionMember]) -> Vec<PropertySpec> {
    members
      .iter()
      .filter_map(|member| match member {
        InjectionMember::Property(property) => Some(property.clone()),
        _ => None,
      })
      .collect()
  }
}

/// Every declared method, in declaration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMethodSelector;

impl MethodSelector for DefaultMethodSelector {
  fn select(&self, _target: &Type, members: &[InjectionMember]) -> Vec<MethodSpec> {
    members
      .iter()
      .filter_map(|member| match member {
        InjectionMember::Method(method) => Some(method.clone()),
        _ => None,
      })
      .collect()
  }
}
