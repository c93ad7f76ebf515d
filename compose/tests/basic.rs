use fibre_compose::{
  Binding, ConstructorSpec, Container, ContainerControlledLifetimeManager, Dependency, FactorySpec,
  MethodSpec, PropertySpec, ResolverOverride, TypeKey, Type,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// --- Test Fixtures ---

#[derive(Debug)]
struct Logger;

#[derive(Debug)]
struct Service {
  logger: Arc<Logger>,
}

#[derive(Debug)]
struct EnglishGreeter;

#[derive(Debug)]
struct Greeting {
  text: Arc<String>,
}

#[derive(Debug)]
struct Reporter {
  logger: Option<Arc<Logger>>,
}

#[derive(Debug, Default)]
struct Notifier {
  logger: Mutex<Option<Arc<Logger>>>,
  channel: Mutex<String>,
  started: AtomicUsize,
}

#[derive(Debug)]
struct Settings {
  port: u16,
}

fn singleton() -> Arc<ContainerControlledLifetimeManager> {
  Arc::new(ContainerControlledLifetimeManager::new())
}

fn register_logger(container: &Container) {
  container
    .register(Binding::of::<Logger>().member(ConstructorSpec::of(|_| Ok(Logger))))
    .unwrap();
}

fn notifier_binding() -> Binding {
  Binding::of::<Notifier>()
    .member(ConstructorSpec::of(|_| Ok(Notifier::default())))
    .member(PropertySpec::typed::<Notifier, Logger>(
      "logger",
      Dependency::of::<Logger>(),
      |notifier, logger| {
        *notifier.logger.lock().unwrap() = Some(logger);
        Ok(())
      },
    ))
}

fn start_method() -> MethodSpec {
  MethodSpec::typed::<Notifier>("start", |notifier, args| {
    let channel = args.get::<String>(0)?;
    *notifier.channel.lock().unwrap() = (*channel).clone();
    notifier.started.fetch_add(1, Ordering::SeqCst);
    Ok(())
  })
  .param("channel", Dependency::value(String::from("email")))
}

// --- Tests ---

#[test]
fn test_singleton_service_with_transient_logger() {
  // Arrange
  let container = Container::new();
  register_logger(&container);
  container
    .register(
      Binding::of::<Service>().lifetime(singleton()).member(
        ConstructorSpec::of(|args| {
          Ok(Service {
            logger: args.get::<Logger>(0)?,
          })
        })
        .param("logger", Dependency::of::<Logger>()),
      ),
    )
    .unwrap();

  // Act
  let first = container.resolve::<Service>(None).unwrap();
  let second = container.resolve::<Service>(None).unwrap();
  let logger = container.resolve::<Logger>(None).unwrap();

  // Assert
  assert!(Arc::ptr_eq(&first, &second));
  assert!(Arc::ptr_eq(&first.logger, &second.logger));
  assert!(!Arc::ptr_eq(&logger, &first.logger));
}

#[test]
fn test_mapped_type_is_built_for_requested_key() {
  // Arrange
  let container = Container::new();
  container
    .register(
      Binding::new(Type::named("Greeter"))
        .to(Type::of::<EnglishGreeter>())
        .member(ConstructorSpec::of(|_| Ok(EnglishGreeter))),
    )
    .unwrap();

  // Act
  let greeter = container
    .resolve_type(&Type::named("Greeter"), None, Vec::<ResolverOverride>::new())
    .unwrap();

  // Assert
  assert!(greeter.downcast_ref::<EnglishGreeter>().is_some());
}

#[test]
fn test_named_registrations_are_distinct() {
  // Arrange
  let container = Container::new();
  let built = Arc::new(AtomicUsize::new(0));
  for name in ["primary", "secondary"] {
    let built = Arc::clone(&built);
    container
      .register(
        Binding::of::<Logger>()
          .named(name)
          .lifetime(singleton())
          .member(ConstructorSpec::of(move |_| {
            built.fetch_add(1, Ordering::SeqCst);
            Ok(Logger)
          })),
      )
      .unwrap();
  }
  register_logger(&container);

  // Act
  let primary = container.resolve::<Logger>(Some("primary")).unwrap();
  let secondary = container.resolve::<Logger>(Some("secondary")).unwrap();
  let all = container.resolve_all::<Logger>().unwrap();

  // Assert
  assert!(!Arc::ptr_eq(&primary, &secondary));
  assert_eq!(all.len(), 2, "unnamed registrations are not part of resolve_all");
  assert!(Arc::ptr_eq(&all[0], &primary));
  assert!(Arc::ptr_eq(&all[1], &secondary));
  assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[test]
fn test_factory_resolves_dependencies_in_the_same_resolution() {
  // Arrange
  let container = Container::new();
  register_logger(&container);
  container
    .register(Binding::of::<Service>().member(FactorySpec::of(|ctx| {
      Ok(Service {
        logger: ctx.resolve::<Logger>(None)?,
      })
    })))
    .unwrap();

  // Act
  let service = container.resolve::<Service>(None);

  // Assert
  assert!(service.is_ok());
}

#[test]
fn test_properties_and_methods_run_after_construction() {
  // Arrange
  let container = Container::new();
  register_logger(&container);
  container.register(notifier_binding().member(start_method())).unwrap();

  // Act
  let notifier = container.resolve::<Notifier>(None).unwrap();

  // Assert
  assert!(notifier.logger.lock().unwrap().is_some());
  assert_eq!(*notifier.channel.lock().unwrap(), "email");
  assert_eq!(notifier.started.load(Ordering::SeqCst), 1);
}

#[test]
fn test_build_required_members_rerun_on_cached_instance() {
  // Arrange
  let container = Container::new();
  register_logger(&container);
  container
    .register(
      notifier_binding()
        .lifetime(singleton())
        .member(start_method().force_build()),
    )
    .unwrap();

  // Act
  let first = container.resolve::<Notifier>(None).unwrap();
  let logger_before = first.logger.lock().unwrap().clone().unwrap();
  let second = container.resolve::<Notifier>(None).unwrap();

  // Assert
  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(second.started.load(Ordering::SeqCst), 2);
  // The property is not build-required, so it keeps its first value.
  let logger_after = second.logger.lock().unwrap().clone().unwrap();
  assert!(Arc::ptr_eq(&logger_before, &logger_after));
}

#[test]
fn test_build_up_initializes_existing_instance() {
  // Arrange
  let container = Container::new();
  register_logger(&container);
  let constructed = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&constructed);
  container
    .register(
      Binding::of::<Notifier>()
        .member(ConstructorSpec::of(move |_| {
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(Notifier::default())
        }))
        .member(PropertySpec::typed::<Notifier, Logger>(
          "logger",
          Dependency::of::<Logger>(),
          |notifier, logger| {
            *notifier.logger.lock().unwrap() = Some(logger);
            Ok(())
          },
        )),
    )
    .unwrap();
  let existing = Arc::new(Notifier::default());

  // Act
  let built = container.build_up(None, Arc::clone(&existing)).unwrap();

  // Assert
  assert!(Arc::ptr_eq(&built, &existing));
  assert!(existing.logger.lock().unwrap().is_some());
  assert_eq!(constructed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_build_up_of_unregistered_type_returns_instance_untouched() {
  let container = Container::new();
  let existing = Arc::new(Notifier::default());

  let built = container.build_up(None, Arc::clone(&existing)).unwrap();

  assert!(Arc::ptr_eq(&built, &existing));
  assert!(existing.logger.lock().unwrap().is_none());
}

#[test]
fn test_registered_instance_is_returned() {
  // Arrange
  let container = Container::new();
  let settings = Arc::new(Settings { port: 8080 });
  container
    .register(Binding::of::<Settings>().instance(Arc::clone(&settings)))
    .unwrap();

  // Act
  let resolved = container.resolve::<Settings>(None).unwrap();

  // Assert
  assert!(Arc::ptr_eq(&resolved, &settings));
  assert_eq!(resolved.port, 8080);
}

#[test]
fn test_parameter_override_applies_to_one_call_only() {
  // Arrange
  let container = Container::new();
  container
    .register(
      Binding::of::<Greeting>().member(
        ConstructorSpec::of(|args| {
          Ok(Greeting {
            text: args.get::<String>(0)?,
          })
        })
        .param("text", Dependency::value(String::from("hello"))),
      ),
    )
    .unwrap();

  // Act
  let overridden = container
    .resolve_with::<Greeting>(
      None,
      [ResolverOverride::parameter("text", Arc::new(String::from("bonjour")))],
    )
    .unwrap();
  let plain = container.resolve::<Greeting>(None).unwrap();

  // Assert
  assert_eq!(*overridden.text, "bonjour");
  assert_eq!(*plain.text, "hello");
}

#[test]
fn test_dependency_override_reaches_nested_builds() {
  // Arrange
  let container = Container::new();
  register_logger(&container);
  container
    .register(
      Binding::of::<Service>().member(
        ConstructorSpec::of(|args| {
          Ok(Service {
            logger: args.get::<Logger>(0)?,
          })
        })
        .param("logger", Dependency::of::<Logger>()),
      ),
    )
    .unwrap();
  let special = Arc::new(Logger);

  // Act
  let service = container
    .resolve_with::<Service>(
      None,
      [ResolverOverride::dependency(TypeKey::of::<Logger>(), special.clone())],
    )
    .unwrap();

  // Assert
  assert!(Arc::ptr_eq(&service.logger, &special));
}

#[test]
fn test_optional_dependency_is_absent_when_unregistered() {
  // Arrange
  let container = Container::new();
  container
    .register(
      Binding::of::<Reporter>().member(
        ConstructorSpec::of(|args| {
          Ok(Reporter {
            logger: args.optional::<Logger>(0)?,
          })
        })
        .param("logger", Dependency::of::<Logger>().optional()),
      ),
    )
    .unwrap();

  // Act
  let without = container.resolve::<Reporter>(None).unwrap();
  register_logger(&container);
  let with = container.resolve::<Reporter>(None).unwrap();

  // Assert
  assert!(without.logger.is_none());
  assert!(with.logger.is_some());
}

#[test]
fn test_constructor_with_most_parameters_is_selected() {
  // Arrange
  let container = Container::new();
  register_logger(&container);
  container
    .register(
      Binding::of::<Reporter>()
        .member(ConstructorSpec::of(|_| Ok(Reporter { logger: None })))
        .member(
          ConstructorSpec::of(|args| {
            Ok(Reporter {
              logger: Some(args.get::<Logger>(0)?),
            })
          })
          .param("logger", Dependency::of::<Logger>()),
        ),
    )
    .unwrap();

  // Act
  let reporter = container.resolve::<Reporter>(None).unwrap();
  let registration = container
    .registration(&TypeKey::of::<Reporter>())
    .unwrap()
    .unwrap();

  // Assert
  assert!(reporter.logger.is_some());
  assert!(registration.is_compiled());
}
