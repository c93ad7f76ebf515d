//! # Fibre Compose
//!
//! A thread-safe object-composition engine for Rust.
//!
//! Fibre Compose builds object graphs from declared registrations. Each
//! registration binds a key (a runtime [`Type`] plus an optional name) to the
//! type actually built, a set of injection members describing how to build
//! and initialize it, and a [`LifetimeManager`] deciding how long the result
//! is cached.
//!
//! ## Core Concepts
//!
//! - **Container**: a scope in a tree of scopes. Children see their ancestors'
//!   registrations, policies and strategies and may shadow them.
//! - **Pipelines**: the first resolution of a registration compiles a
//!   [`BuildPlan`] through the plan strategy chain; every resolution then runs
//!   that plan through the build strategy chain.
//! - **Lifetimes**: transient, container-controlled (singleton), hierarchical,
//!   per-resolve and externally controlled.
//! - **Open generics**: a registration for `Repository<T0>` serves
//!   `Repository<Order>` and `Repository<Customer>` with separate registrations
//!   and separate lifetime managers.
//!
//! ## Quick Start
//!
//! ```
//! use fibre_compose::{
//!   Binding, ConstructorSpec, Container, ContainerControlledLifetimeManager, Dependency,
//! };
//! use std::sync::Arc;
//!
//! struct Logger;
//!
//! struct Service {
//!   logger: Arc<Logger>,
//! }
//!
//! let container = Container::new();
//! container
//!   .register(Binding::of::<Logger>().member(ConstructorSpec::of(|_| Ok(Logger))))
//!   .unwrap();
//! container
//!   .register(
//!     Binding::of::<Service>()
//!       .lifetime(Arc::new(ContainerControlledLifetimeManager::new()))
//!       .member(
//!         ConstructorSpec::of(|args| Ok(Service { logger: args.get::<Logger>(0)? }))
//!           .param("logger", Dependency::of::<Logger>()),
//!       ),
//!   )
//!   .unwrap();
//!
//! let first = container.resolve::<Service>(None).unwrap();
//! let second = container.resolve::<Service>(None).unwrap();
//! assert!(Arc::ptr_eq(&first, &second));
//!
//! let logger = container.resolve::<Logger>(None).unwrap();
//! assert!(!Arc::ptr_eq(&logger, &first.logger));
//! ```

mod chain;
mod config;
mod container;
mod core;
mod error;
mod generic;
mod lifetime;
mod member;
mod pipeline;
mod plan;
mod policy;
mod registration;
mod types;

pub use chain::{BuildStage, CompiledChain, PlanStage, Stage, StagedStrategyChain};
pub use config::ContainerConfig;
pub use container::{BuildChain, Container, PlanChain};
pub use crate::core::{Instance, ScopeId, TypeKey};
pub use error::{
  describe_failure, BoxError, BuildError, Cause, ConfigError, ConfigurationError, Error, Frame,
  ResolutionFailure, Result,
};
pub use lifetime::{
  ContainerControlledLifetimeManager, ExternallyControlledLifetimeManager,
  HierarchicalLifetimeManager, LifetimeContext, LifetimeManager, LifetimeState,
  PerResolveLifetimeManager, TransientLifetimeManager,
};
pub use member::{
  Activator, Arguments, ConstructorSelector, ConstructorSpec, DefaultConstructorSelector,
  DefaultMethodSelector, DefaultPropertySelector, Dependency, Dispose, DisposeHook, Factory,
  FactoryContext, FactorySpec, InjectionMember, Invoker, MethodSelector, MethodSpec, Parameter,
  PropertySelector, PropertySpec, Setter,
};
pub use pipeline::{
  BuildContext, BuildStrategy, CreationStrategy, InitializationStrategy, LifetimeStrategy,
  Pipeline, Resolution, ResolverOverride, TypeMappingStrategy,
};
pub use plan::{
  ArgSource, BuildPlan, BuildStep, ConstructorPlanStrategy, MethodPlanStrategy, PlanContext,
  PlanStrategy, PropertyPlanStrategy, ResolvedParameter,
};
pub use policy::PolicyList;
pub use registration::{Binding, Registration};
pub use types::Type;
