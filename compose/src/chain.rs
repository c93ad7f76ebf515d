//! Staged strategy chains.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};

/// An ordered set of stages a chain is grouped by.
pub trait Stage: Copy + fmt::Debug + Send + Sync + 'static {
  const COUNT: usize;

  fn index(self) -> usize;
}

/// Stages of the main build chain, run on every resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStage {
  Setup,
  TypeMapping,
  Lifetime,
  PreCreation,
  Creation,
  Initialization,
  PostInitialization,
}

impl Stage for BuildStage {
  const COUNT: usize = 7;

  fn index(self) -> usize {
    self as usize
  }
}

/// Stages of the build-plan chain, run once per registration to compile its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanStage {
  Setup,
  Creation,
  Properties,
  Methods,
  PostInitialization,
}

impl Stage for PlanStage {
  const COUNT: usize = 5;

  fn index(self) -> usize {
    self as usize
  }
}

/// An immutable snapshot of a chain's effective strategy order.
pub struct CompiledChain<T: ?Sized> {
  generation: u64,
  by_stage: Vec<Vec<Arc<T>>>,
  strategies: Vec<Arc<T>>,
}

impl<T: ?Sized> CompiledChain<T> {
  pub fn strategies(&self) -> &[Arc<T>] {
    &self.strategies
  }
}

impl<T: ?Sized> Deref for CompiledChain<T> {
  type Target = [Arc<T>];

  fn deref(&self) -> &[Arc<T>] {
    &self.strategies
  }
}

impl<T: ?Sized> fmt::Debug for CompiledChain<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompiledChain")
      .field("generation", &self.generation)
      .field("len", &self.strategies.len())
      .finish()
  }
}

/// A list of strategies grouped by stage, optionally layered over a parent chain.
///
/// The effective order is stage-major: for each stage, the parent's entries
/// for that stage, then this chain's own, in insertion order. [`compile`]
/// caches that order until the chain or one of its ancestors is mutated;
/// mutations notify child chains through a list of weak subscribers.
///
/// [`compile`]: StagedStrategyChain::compile
pub struct StagedStrategyChain<S: Stage, T: ?Sized> {
  parent: Option<Arc<StagedStrategyChain<S, T>>>,
  stages: RwLock<Vec<Vec<Arc<T>>>>,
  generation: AtomicU64,
  compiled: ArcSwapOption<CompiledChain<T>>,
  children: Mutex<Vec<Weak<StagedStrategyChain<S, T>>>>,
  _stage: PhantomData<fn(S)>,
}

impl<S: Stage, T: ?Sized + Send + Sync> StagedStrategyChain<S, T> {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::with_parent(None))
  }

  /// A new chain whose effective order starts from this one's.
  pub fn child(self: &Arc<Self>) -> Arc<Self> {
    let child = Arc::new(Self::with_parent(Some(Arc::clone(self))));
    let mut children = self.children.lock();
    children.retain(|weak| weak.strong_count() > 0);
    children.push(Arc::downgrade(&child));
    child
  }

  fn with_parent(parent: Option<Arc<Self>>) -> Self {
    Self {
      parent,
      stages: RwLock::new((0..S::COUNT).map(|_| Vec::new()).collect()),
      generation: AtomicU64::new(0),
      compiled: ArcSwapOption::empty(),
      children: Mutex::new(Vec::new()),
      _stage: PhantomData,
    }
  }

  /// Appends a strategy to the end of `stage`.
  pub fn add_after(&self, stage: S, strategy: Arc<T>) {
    self.stages.write()[stage.index()].push(strategy);
    self.invalidate();
  }

  /// Inserts a strategy at the start of `stage`, ahead of this chain's other entries for it.
  pub fn add_before(&self, stage: S, strategy: Arc<T>) {
    self.stages.write()[stage.index()].insert(0, strategy);
    self.invalidate();
  }

  /// The number of strategies added to this chain itself.
  pub fn local_len(&self) -> usize {
    self.stages.read().iter().map(Vec::len).sum()
  }

  /// The effective strategy order, rebuilt only after a structural change.
  pub fn compile(&self) -> Arc<CompiledChain<T>> {
    let generation = self.generation.load(Ordering::Acquire);
    if let Some(compiled) = self.compiled.load_full() {
      if compiled.generation == generation {
        return compiled;
      }
    }

    let mut by_stage: Vec<Vec<Arc<T>>> = match &self.parent {
      Some(parent) => parent.compile().by_stage.clone(),
      None => (0..S::COUNT).map(|_| Vec::new()).collect(),
    };
    for (stage, local) in by_stage.iter_mut().zip(self.stages.read().iter()) {
      stage.extend(local.iter().cloned());
    }
    let strategies = by_stage.iter().flatten().cloned().collect();

    let compiled = Arc::new(CompiledChain {
      generation,
      by_stage,
      strategies,
    });
    // A concurrent mutation bumps the generation, so a stale store here is
    // simply recomputed by the next caller.
    self.compiled.store(Some(Arc::clone(&compiled)));
    compiled
  }

  fn invalidate(&self) {
    self.generation.fetch_add(1, Ordering::AcqRel);
    let children: Vec<_> = self.children.lock().iter().filter_map(Weak::upgrade).collect();
    for child in children {
      child.invalidate();
    }
  }
}

impl<S: Stage, T: ?Sized> fmt::Debug for StagedStrategyChain<S, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StagedStrategyChain")
      .field("generation", &self.generation.load(Ordering::Relaxed))
      .field("has_parent", &self.parent.is_some())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  trait Named: Send + Sync {
    fn name(&self) -> &'static str;
  }

  struct Step(&'static str);

  impl Named for Step {
    fn name(&self) -> &'static str {
      self.0
    }
  }

  fn names(chain: &StagedStrategyChain<BuildStage, dyn Named>) -> Vec<&'static str> {
    chain.compile().iter().map(|s| s.name()).collect()
  }

  #[test]
  fn orders_by_stage_then_insertion() {
    let chain: Arc<StagedStrategyChain<BuildStage, dyn Named>> = StagedStrategyChain::new();
    chain.add_after(BuildStage::Creation, Arc::new(Step("create")));
    chain.add_after(BuildStage::Setup, Arc::new(Step("setup")));
    chain.add_after(BuildStage::Creation, Arc::new(Step("create-2")));
    chain.add_before(BuildStage::Creation, Arc::new(Step("pre-create")));

    assert_eq!(names(&chain), vec!["setup", "pre-create", "create", "create-2"]);
  }

  #[test]
  fn compile_is_cached_until_mutation() {
    let chain: Arc<StagedStrategyChain<BuildStage, dyn Named>> = StagedStrategyChain::new();
    chain.add_after(BuildStage::Setup, Arc::new(Step("a")));

    let first = chain.compile();
    let second = chain.compile();
    assert!(Arc::ptr_eq(&first, &second));

    chain.add_after(BuildStage::Setup, Arc::new(Step("b")));
    let third = chain.compile();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(third.len(), 2);
    // Snapshots already handed out are never modified.
    assert_eq!(first.len(), 1);
  }

  #[test]
  fn parent_mutation_invalidates_children() {
    let parent: Arc<StagedStrategyChain<BuildStage, dyn Named>> = StagedStrategyChain::new();
    parent.add_after(BuildStage::Creation, Arc::new(Step("parent-create")));
    let child = parent.child();
    child.add_after(BuildStage::Setup, Arc::new(Step("child-setup")));

    assert_eq!(names(&child), vec!["child-setup", "parent-create"]);

    parent.add_after(BuildStage::Setup, Arc::new(Step("parent-setup")));
    assert_eq!(names(&child), vec!["parent-setup", "child-setup", "parent-create"]);
    assert_eq!(parent.local_len(), 2);
    assert_eq!(child.local_len(), 1);
  }
}
