//! Build plans: the compiled, reusable list of steps for one registration.

use crate::chain::CompiledChain;
use crate::core::{Instance, TypeKey};
use crate::error::BuildError;
use crate::member::{
  ConstructorSelector, ConstructorSpec, DefaultConstructorSelector, DefaultMethodSelector,
  DefaultPropertySelector, Dependency, FactorySpec, InjectionMember, MethodSelector, MethodSpec,
  Parameter, PropertySelector, PropertySpec,
};
use crate::policy::PolicyList;
use crate::types::Type;

use std::fmt;
use std::sync::Arc;

/// Where a parameter's value comes from at run time.
#[derive(Clone)]
pub enum ArgSource {
  Resolve { key: TypeKey, optional: bool },
  Value(Instance),
}

/// A parameter with its value source fixed at compile time.
#[derive(Clone)]
pub struct ResolvedParameter {
  name: Arc<str>,
  ty: Type,
  source: ArgSource,
}

impl ResolvedParameter {
  pub fn new(name: Arc<str>, dependency: &Dependency) -> Self {
    let source = match dependency.fixed_value() {
      Some(value) => ArgSource::Value(Arc::clone(value)),
      None => ArgSource::Resolve {
        key: dependency.key(),
        optional: dependency.is_optional(),
      },
    };
    Self {
      name,
      ty: dependency.ty().clone(),
      source,
    }
  }

  fn from_parameter(parameter: &Parameter) -> Self {
    Self::new(Arc::clone(parameter.name()), parameter.dependency())
  }

  pub fn name(&self) -> &Arc<str> {
    &self.name
  }

  pub fn ty(&self) -> &Type {
    &self.ty
  }

  pub fn source(&self) -> &ArgSource {
    &self.source
  }
}

impl fmt::Debug for ResolvedParameter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.source {
      ArgSource::Resolve { key, optional } => write!(
        f,
        "{}: resolve {}{}",
        self.name,
        key,
        if *optional { " (optional)" } else { "" }
      ),
      ArgSource::Value(_) => write!(f, "{}: value {}", self.name, self.ty),
    }
  }
}

/// One step of a build plan.
#[derive(Clone)]
pub enum BuildStep {
  Construct {
    constructor: ConstructorSpec,
    parameters: Vec<ResolvedParameter>,
  },
  Factory(FactorySpec),
  SetProperty {
    property: PropertySpec,
    parameter: ResolvedParameter,
  },
  CallMethod {
    method: MethodSpec,
    parameters: Vec<ResolvedParameter>,
  },
}

impl BuildStep {
  pub fn is_creation(&self) -> bool {
    matches!(self, BuildStep::Construct { .. } | BuildStep::Factory(_))
  }
}

impl fmt::Debug for BuildStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildStep::Construct { parameters, .. } => {
        f.debug_struct("Construct").field("parameters", parameters).finish()
      }
      BuildStep::Factory(_) => f.write_str("Factory"),
      BuildStep::SetProperty { property, parameter } => f
        .debug_struct("SetProperty")
        .field("name", property.name())
        .field("parameter", parameter)
        .finish(),
      BuildStep::CallMethod { method, parameters } => f
        .debug_struct("CallMethod")
        .field("name", method.name())
        .field("parameters", parameters)
        .finish(),
    }
  }
}

/// The ordered steps that build and initialize one registration's target.
#[derive(Clone, Default, Debug)]
pub struct BuildPlan {
  steps: Vec<BuildStep>,
}

impl BuildPlan {
  pub fn steps(&self) -> &[BuildStep] {
    &self.steps
  }

  /// The step that creates the instance, if the plan has one.
  pub fn creation(&self) -> Option<&BuildStep> {
    self.steps.iter().find(|step| step.is_creation())
  }

  /// Property and method steps, in plan order.
  pub fn initialization(&self) -> impl Iterator<Item = &BuildStep> {
    self.steps.iter().filter(|step| !step.is_creation())
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }
}

/// Mutable state threaded through the plan strategies while compiling.
pub struct PlanContext<'a> {
  key: &'a TypeKey,
  target: &'a Type,
  members: &'a [InjectionMember],
  policies: &'a PolicyList,
  steps: Vec<BuildStep>,
}

impl<'a> PlanContext<'a> {
  pub fn key(&self) -> &'a TypeKey {
    self.key
  }

  pub fn target(&self) -> &'a Type {
    self.target
  }

  pub fn members(&self) -> &'a [InjectionMember] {
    self.members
  }

  pub fn policies(&self) -> &'a PolicyList {
    self.policies
  }

  pub fn push(&mut self, step: BuildStep) {
    self.steps.push(step);
  }

  pub fn steps(&self) -> &[BuildStep] {
    &self.steps
  }
}

/// A stage of pipeline compilation.
pub trait PlanStrategy: Send + Sync {
  fn build_plan(&self, ctx: &mut PlanContext<'_>) -> Result<(), BuildError>;
}

/// Runs every plan strategy over a registration's members.
pub(crate) fn compile_plan(
  chain: &CompiledChain<dyn PlanStrategy>,
  key: &TypeKey,
  target: &Type,
  members: &[InjectionMember],
  policies: &PolicyList,
) -> Result<BuildPlan, BuildError> {
  let mut ctx = PlanContext {
    key,
    target,
    members,
    policies,
    steps: Vec::new(),
  };
  for strategy in chain.iter() {
    strategy.build_plan(&mut ctx)?;
  }
  Ok(BuildPlan { steps: ctx.steps })
}

/// Emits the creation step: a factory if one is declared, otherwise the
/// constructor chosen by the [`ConstructorSelector`] policy.
#[derive(Debug, Default)]
pub struct ConstructorPlanStrategy;

impl PlanStrategy for ConstructorPlanStrategy {
  fn build_plan(&self, ctx: &mut PlanContext<'_>) -> Result<(), BuildError> {
    let factory = ctx.members.iter().find_map(|member| match member {
      InjectionMember::Factory(factory) => Some(factory.clone()),
      _ => None,
    });
    if let Some(factory) = factory {
      ctx.push(BuildStep::Factory(factory));
      return Ok(());
    }

    let selector = ctx
      .policies
      .get::<Arc<dyn ConstructorSelector>>(ctx.key)
      .unwrap_or_else(|| Arc::new(DefaultConstructorSelector) as Arc<dyn ConstructorSelector>);
    if let Some(constructor) = selector.select(ctx.target, ctx.members) {
      let parameters = constructor
        .parameters()
        .iter()
        .map(ResolvedParameter::from_parameter)
        .collect();
      ctx.push(BuildStep::Construct {
        constructor,
        parameters,
      });
    }
    Ok(())
  }
}

/// Emits one step per property chosen by the [`PropertySelector`] policy.
#[derive(Debug, Default)]
pub struct PropertyPlanStrategy;

impl PlanStrategy for PropertyPlanStrategy {
  fn build_plan(&self, ctx: &mut PlanContext<'_>) -> Result<(), BuildError> {
    let selector = ctx
      .policies
      .get::<Arc<dyn PropertySelector>>(ctx.key)
      .unwrap_or_else(|| Arc::new(DefaultPropertySelector) as Arc<dyn PropertySelector>);
    for property in selector.select(ctx.target, ctx.members) {
      let parameter = ResolvedParameter::new(Arc::clone(property.name()), property.dependency());
      ctx.push(BuildStep::SetProperty {
        property,
        parameter,
      });
    }
    Ok(())
  }
}

/// Emits one step per method chosen by the [`MethodSelector`] policy.
#[derive(Debug, Default)]
pub struct MethodPlanStrategy;

impl PlanStrategy for MethodPlanStrategy {
  fn build_plan(&self, ctx: &mut PlanContext<'_>) -> Result<(), BuildError> {
    let selector = ctx
      .policies
      .get::<Arc<dyn MethodSelector>>(ctx.key)
      .unwrap_or_else(|| Arc::new(DefaultMethodSelector) as Arc<dyn MethodSelector>);
    for method in selector.select(ctx.target, ctx.members) {
      let parameters = method
        .parameters()
        .iter()
        .map(ResolvedParameter::from_parameter)
        .collect();
      ctx.push(BuildStep::CallMethod { method, parameters });
    }
    Ok(())
  }
}
