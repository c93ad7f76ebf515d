use fibre_compose::{
  Binding, ConfigurationError, ConstructorSpec, Container, ContainerControlledLifetimeManager,
  Dependency, ExternallyControlledLifetimeManager, HierarchicalLifetimeManager, LifetimeState,
  PerResolveLifetimeManager, Type,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Connection {
  serial: usize,
}

#[derive(Debug)]
struct Pair {
  left: Arc<Connection>,
  right: Arc<Connection>,
}

fn connection_binding(counter: &Arc<AtomicUsize>) -> Binding {
  let counter = Arc::clone(counter);
  Binding::of::<Connection>().member(ConstructorSpec::of(move |_| {
    Ok(Connection {
      serial: counter.fetch_add(1, Ordering::SeqCst),
    })
  }))
}

fn pair_binding() -> Binding {
  Binding::of::<Pair>().member(
    ConstructorSpec::of(|args| {
      Ok(Pair {
        left: args.get::<Connection>(0)?,
        right: args.get::<Connection>(1)?,
      })
    })
    .param("left", Dependency::of::<Connection>())
    .param("right", Dependency::of::<Connection>()),
  )
}

#[test]
fn test_transient_builds_every_time() {
  let container = Container::new();
  let counter = Arc::new(AtomicUsize::new(0));
  container.register(connection_binding(&counter)).unwrap();

  let first = container.resolve::<Connection>(None).unwrap();
  let second = container.resolve::<Connection>(None).unwrap();

  assert!(!Arc::ptr_eq(&first, &second));
  assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_container_controlled_caches_one_instance() {
  // Arrange
  let container = Container::new();
  let counter = Arc::new(AtomicUsize::new(0));
  let manager = Arc::new(ContainerControlledLifetimeManager::new());
  container
    .register(connection_binding(&counter).lifetime(manager.clone()))
    .unwrap();
  assert_eq!(manager.state(), LifetimeState::Empty);

  // Act
  let first = container.resolve::<Connection>(None).unwrap();
  let second = container.resolve::<Connection>(None).unwrap();

  // Assert
  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(first.serial, 0);
  assert_eq!(manager.state(), LifetimeState::Holding);
}

#[test]
fn test_hierarchical_gives_one_instance_per_scope() {
  // Arrange
  let root = Container::new();
  let counter = Arc::new(AtomicUsize::new(0));
  root
    .register(connection_binding(&counter).lifetime(Arc::new(HierarchicalLifetimeManager::new())))
    .unwrap();
  let left = root.create_child().unwrap();
  let right = root.create_child().unwrap();

  // Act
  let left_first = left.resolve::<Connection>(None).unwrap();
  let left_second = left.resolve::<Connection>(None).unwrap();
  let right_first = right.resolve::<Connection>(None).unwrap();
  let right_second = right.resolve::<Connection>(None).unwrap();

  // Assert
  assert!(Arc::ptr_eq(&left_first, &left_second));
  assert!(Arc::ptr_eq(&right_first, &right_second));
  assert!(!Arc::ptr_eq(&left_first, &right_first));
}

#[test]
fn test_per_resolve_is_shared_within_one_call() {
  // Arrange
  let container = Container::new();
  let counter = Arc::new(AtomicUsize::new(0));
  container
    .register(connection_binding(&counter).lifetime(Arc::new(PerResolveLifetimeManager::new())))
    .unwrap();
  container.register(pair_binding()).unwrap();

  // Act
  let first = container.resolve::<Pair>(None).unwrap();
  let second = container.resolve::<Pair>(None).unwrap();

  // Assert
  assert!(Arc::ptr_eq(&first.left, &first.right));
  assert!(!Arc::ptr_eq(&first.left, &second.left));
  assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_externally_controlled_does_not_keep_instance_alive() {
  // Arrange
  let container = Container::new();
  let counter = Arc::new(AtomicUsize::new(0));
  let manager = Arc::new(ExternallyControlledLifetimeManager::new());
  container
    .register(connection_binding(&counter).lifetime(manager.clone()))
    .unwrap();

  // Act
  let held = container.resolve::<Connection>(None).unwrap();
  let again = container.resolve::<Connection>(None).unwrap();
  assert!(Arc::ptr_eq(&held, &again));
  assert_eq!(manager.state(), LifetimeState::Holding);
  drop(held);
  drop(again);
  assert_eq!(manager.state(), LifetimeState::Empty);
  let rebuilt = container.resolve::<Connection>(None).unwrap();

  // Assert
  assert_eq!(rebuilt.serial, 1);
  assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_lifetime_manager_cannot_be_attached_twice() {
  // Arrange
  let container = Container::new();
  let counter = Arc::new(AtomicUsize::new(0));
  let manager = Arc::new(ContainerControlledLifetimeManager::new());
  container
    .register(connection_binding(&counter).lifetime(manager.clone()))
    .unwrap();

  // Act
  let second = container.register(connection_binding(&counter).named("other").lifetime(manager));

  // Assert
  assert!(matches!(
    second,
    Err(ConfigurationError::LifetimeManagerInUse {
      manager: "container-controlled",
      ..
    })
  ));
  assert!(!container.is_registered(&Type::of::<Connection>(), Some("other")));
  assert_eq!(counter.load(Ordering::SeqCst), 0, "nothing is resolved on registration");
}

#[test]
fn test_rejected_registration_leaves_manager_unclaimed() {
  let container = Container::new();
  let manager = Arc::new(ContainerControlledLifetimeManager::new());

  let invalid = container.register(
    Binding::new(Type::open("Repository", 1))
      .to(Type::named("Concrete"))
      .lifetime(manager.clone()),
  );

  assert!(matches!(invalid, Err(ConfigurationError::InvalidMapping { .. })));
  assert!(!fibre_compose::LifetimeManager::in_use(&*manager));
}
