//! Core identity types shared by every layer of the engine.

use crate::error::Cause;
use crate::types::Type;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A built object as the engine sees it.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Recovers the concrete type of an instance produced for `key`.
pub(crate) fn downcast_instance<T: Any + Send + Sync>(
  instance: Instance,
  key: &TypeKey,
) -> Result<Arc<T>, Cause> {
  instance.downcast::<T>().map_err(|_| Cause::TypeMismatch {
    key: key.clone(),
    expected: std::any::type_name::<T>(),
  })
}

thread_local! {
  // The registrations currently being built on this thread, by owning scope
  // and key. Re-entering one of them means the object graph is circular.
  static RESOLVING_STACK: RefCell<HashSet<(ScopeId, TypeKey)>> = RefCell::new(HashSet::new());
}

/// An RAII guard that detects circular dependencies.
///
/// Creating the guard pushes the owning scope and key onto the thread-local
/// resolution stack and fails if they are already there. Dropping it pops
/// them again. A registration that resolves the same key from an ancestor
/// scope is not a cycle.
pub(crate) struct ResolutionGuard {
  entry: (ScopeId, TypeKey),
}

impl ResolutionGuard {
  pub(crate) fn new(owner: ScopeId, key: &TypeKey) -> Result<Self, Cause> {
    let entry = (owner, key.clone());
    let inserted = RESOLVING_STACK.with(|stack| stack.borrow_mut().insert(entry.clone()));
    if !inserted {
      return Err(Cause::Circular { key: key.clone() });
    }
    Ok(Self { entry })
  }
}

impl Drop for ResolutionGuard {
  fn drop(&mut self) {
    RESOLVING_STACK.with(|stack| {
      stack.borrow_mut().remove(&self.entry);
    });
  }
}

/// The identity of a registration: a type and an optional name.
///
/// `None` and `Some("")` are different names.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TypeKey {
  ty: Type,
  name: Option<Arc<str>>,
}

impl TypeKey {
  pub fn new(ty: Type, name: Option<&str>) -> Self {
    Self {
      ty,
      name: name.map(Arc::from),
    }
  }

  pub fn of<T: ?Sized + Any>() -> Self {
    Self::new(Type::of::<T>(), None)
  }

  pub fn named<T: ?Sized + Any>(name: &str) -> Self {
    Self::new(Type::of::<T>(), Some(name))
  }

  pub fn ty(&self) -> &Type {
    &self.ty
  }

  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  /// Same name, different type.
  pub fn with_type(&self, ty: Type) -> Self {
    Self {
      ty,
      name: self.name.clone(),
    }
  }
}

impl fmt::Display for TypeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.name {
      Some(name) => write!(f, "{}[\"{}\"]", self.ty, name),
      None => write!(f, "{}", self.ty),
    }
  }
}

impl fmt::Debug for TypeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.name {
      Some(name) => write!(f, "Key({}, Name({}))", self.ty, name),
      None => write!(f, "Key({})", self.ty),
    }
  }
}

/// Lookup key for open generic registrations: the generic family name, the
/// number of type arguments and the registration name.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct GenericKey {
  family: Arc<str>,
  arity: usize,
  name: Option<Arc<str>>,
}

impl GenericKey {
  pub(crate) fn of(key: &TypeKey) -> Option<Self> {
    let family = key.ty.name()?;
    Some(Self {
      family: Arc::from(family),
      arity: key.ty.args().len(),
      name: key.name.clone(),
    })
  }

  /// Same family and name, any arity.
  pub(crate) fn same_family(&self, other: &GenericKey) -> bool {
    self.family == other.family && self.name == other.name
  }

  pub(crate) fn matches(&self, key: &TypeKey) -> bool {
    key.ty.name() == Some(&*self.family) && key.ty.args().len() == self.arity && key.name == self.name
  }
}

/// Identifies one container scope for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ScopeId(u64);

impl ScopeId {
  pub(crate) fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ScopeId(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for ScopeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "scope#{}", self.0)
  }
}
