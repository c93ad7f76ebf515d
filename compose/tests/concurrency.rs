use fibre_compose::{
  Binding, BuildError, ConstructorSpec, Container, ContainerControlledLifetimeManager,
  HierarchicalLifetimeManager, Instance, PlanContext, PlanStage, PlanStrategy, ResolverOverride, Type,
  TypeKey,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const THREADS: usize = 8;

#[derive(Debug)]
struct Worker {
  serial: usize,
}

struct CountingPlanStrategy {
  compiles: Arc<AtomicUsize>,
}

impl PlanStrategy for CountingPlanStrategy {
  fn build_plan(&self, _ctx: &mut PlanContext<'_>) -> Result<(), BuildError> {
    self.compiles.fetch_add(1, Ordering::SeqCst);
    // Widen the window for a second compilation to slip in.
    thread::sleep(Duration::from_millis(5));
    Ok(())
  }
}

fn worker_binding(built: &Arc<AtomicUsize>) -> Binding {
  let built = Arc::clone(built);
  Binding::of::<Worker>().member(ConstructorSpec::of(move |_| {
    thread::sleep(Duration::from_millis(2));
    Ok(Worker {
      serial: built.fetch_add(1, Ordering::SeqCst),
    })
  }))
}

#[test]
fn test_pipeline_compiles_once_under_contention() {
  // Arrange
  let container = Container::new();
  let compiles = Arc::new(AtomicUsize::new(0));
  container.plan_strategies().add_after(
    PlanStage::Setup,
    Arc::new(CountingPlanStrategy {
      compiles: Arc::clone(&compiles),
    }),
  );
  let built = Arc::new(AtomicUsize::new(0));
  container.register(worker_binding(&built)).unwrap();
  let barrier = Barrier::new(THREADS);

  // Act
  let resolved: Vec<_> = thread::scope(|s| {
    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        s.spawn(|| {
          barrier.wait();
          container.resolve::<Worker>(None)
        })
      })
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  // Assert
  assert_eq!(compiles.load(Ordering::SeqCst), 1);
  assert_eq!(resolved.len(), THREADS);
  assert!(resolved.iter().all(Result::is_ok));
  assert_eq!(built.load(Ordering::SeqCst), THREADS, "transient builds once per call");
  let registration = container.registration(&TypeKey::of::<Worker>()).unwrap().unwrap();
  assert!(registration.is_compiled());
}

#[test]
fn test_singleton_is_created_once_under_contention() {
  // Arrange
  let container = Container::new();
  let built = Arc::new(AtomicUsize::new(0));
  container
    .register(worker_binding(&built).lifetime(Arc::new(ContainerControlledLifetimeManager::new())))
    .unwrap();
  let barrier = Barrier::new(THREADS);

  // Act
  let workers: Vec<Arc<Worker>> = thread::scope(|s| {
    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        s.spawn(|| {
          barrier.wait();
          container.resolve::<Worker>(None).unwrap()
        })
      })
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  // Assert
  assert_eq!(built.load(Ordering::SeqCst), 1);
  assert_eq!(workers[0].serial, 0);
  assert!(workers.iter().all(|worker| Arc::ptr_eq(worker, &workers[0])));
}

#[test]
fn test_hierarchical_is_created_once_per_scope_under_contention() {
  // Arrange
  let root = Container::new();
  let built = Arc::new(AtomicUsize::new(0));
  root
    .register(worker_binding(&built).lifetime(Arc::new(HierarchicalLifetimeManager::new())))
    .unwrap();
  let scopes = [root.create_child().unwrap(), root.create_child().unwrap()];
  let barrier = Barrier::new(THREADS);

  // Act
  let workers: Vec<(usize, Arc<Worker>)> = thread::scope(|s| {
    let handles: Vec<_> = (0..THREADS)
      .map(|i| {
        let scopes = &scopes;
        let barrier = &barrier;
        s.spawn(move || {
          barrier.wait();
          let index = i % 2;
          (index, scopes[index].resolve::<Worker>(None).unwrap())
        })
      })
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  // Assert
  assert_eq!(built.load(Ordering::SeqCst), 2);
  for (index, worker) in &workers {
    let first = workers.iter().find(|(other, _)| other == index).map(|(_, w)| w).unwrap();
    assert!(Arc::ptr_eq(worker, first));
  }
}

#[test]
fn test_concurrent_registration_and_resolution_in_child_scopes() {
  let root = Container::new();
  let built = Arc::new(AtomicUsize::new(0));
  root.register(worker_binding(&built)).unwrap();

  thread::scope(|s| {
    for _ in 0..THREADS {
      s.spawn(|| {
        let child = root.create_child().unwrap();
        child
          .register(worker_binding(&built).named("local"))
          .unwrap();
        assert!(child.resolve::<Worker>(Some("local")).is_ok());
        assert!(child.resolve::<Worker>(None).is_ok());
        child.dispose();
      });
    }
  });

  assert_eq!(built.load(Ordering::SeqCst), THREADS * 2);
  assert!(!root.is_disposed());
}

fn versioned_repository(version: &'static str) -> Binding {
  Binding::new(Type::open("Repository", 1))
    .lifetime(Arc::new(ContainerControlledLifetimeManager::new()))
    .member(ConstructorSpec::new(move |_| Ok(Arc::new(version) as Instance)))
}

#[test]
fn test_reregistered_open_generic_wins_over_racing_specializations() {
  // Arrange
  let container = Container::new();
  container.register(versioned_repository("v1")).unwrap();
  let orders = Type::generic("Repository", [Type::named("Order")]);
  let resolve = |container: &Container| {
    container
      .resolve_type(&orders, None, Vec::<ResolverOverride>::new())
      .unwrap()
      .downcast::<&'static str>()
      .unwrap()
  };
  let barrier = Barrier::new(THREADS + 1);

  // Act
  thread::scope(|s| {
    for _ in 0..THREADS {
      s.spawn(|| {
        barrier.wait();
        for _ in 0..200 {
          resolve(&container);
        }
      });
    }
    barrier.wait();
    container.register(versioned_repository("v2")).unwrap();
  });

  // Assert
  assert_eq!(*resolve(&container), "v2");
}
