//! The hierarchical policy store.

use crate::core::TypeKey;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Clone, PartialEq, Eq, Hash)]
struct PolicyKey {
  kind: TypeId,
  key: Option<TypeKey>,
}

/// A keyed store of policies with parent fallback.
///
/// A policy kind is the Rust type of the stored value, usually an
/// `Arc<dyn SomeTrait>`. Entries are keyed by kind plus an optional
/// [`TypeKey`]; `None` is the default for that kind.
///
/// Lookups go from the most specific local key to the least specific one
/// and then to the parent list. Writes only ever touch the local level.
pub struct PolicyList {
  parent: Option<Arc<PolicyList>>,
  entries: DashMap<PolicyKey, Box<dyn Any + Send + Sync>>,
}

impl PolicyList {
  pub fn new() -> Self {
    Self {
      parent: None,
      entries: DashMap::new(),
    }
  }

  /// An empty list that falls back to `parent`.
  pub fn child_of(parent: &Arc<PolicyList>) -> Self {
    Self {
      parent: Some(Arc::clone(parent)),
      entries: DashMap::new(),
    }
  }

  pub fn parent(&self) -> Option<&Arc<PolicyList>> {
    self.parent.as_ref()
  }

  /// Stores or overwrites a policy for `key` at this level.
  pub fn set<P: Any + Clone + Send + Sync>(&self, key: Option<&TypeKey>, policy: P) {
    self.entries.insert(Self::policy_key::<P>(key), Box::new(policy));
  }

  pub fn set_default<P: Any + Clone + Send + Sync>(&self, policy: P) {
    self.set(None, policy);
  }

  /// Finds the policy of kind `P` for `key`.
  ///
  /// Checks, at each level: the exact key, the unnamed key of the same type,
  /// the open generic definition (named, then unnamed), then the default.
  pub fn get<P: Any + Clone + Send + Sync>(&self, key: &TypeKey) -> Option<P> {
    let mut candidates = vec![key.clone()];
    if key.name().is_some() {
      candidates.push(TypeKey::new(key.ty().clone(), None));
    }
    if let Some(definition) = key.ty().definition() {
      candidates.push(key.with_type(definition.clone()));
      if key.name().is_some() {
        candidates.push(TypeKey::new(definition, None));
      }
    }

    let mut list = Some(self);
    while let Some(current) = list {
      for candidate in &candidates {
        if let Some(policy) = current.get_local::<P>(Some(candidate)) {
          return Some(policy);
        }
      }
      if let Some(policy) = current.get_local::<P>(None) {
        return Some(policy);
      }
      list = current.parent.as_deref();
    }
    None
  }

  /// The default policy of kind `P`, searching up the parent chain.
  pub fn get_default<P: Any + Clone + Send + Sync>(&self) -> Option<P> {
    self
      .get_local::<P>(None)
      .or_else(|| self.parent.as_ref().and_then(|parent| parent.get_default::<P>()))
  }

  /// Exact lookup at this level only.
  pub fn get_local<P: Any + Clone + Send + Sync>(&self, key: Option<&TypeKey>) -> Option<P> {
    self
      .entries
      .get(&Self::policy_key::<P>(key))
      .and_then(|entry| entry.value().downcast_ref::<P>().cloned())
  }

  pub fn remove<P: Any + Clone + Send + Sync>(&self, key: Option<&TypeKey>) -> bool {
    self.entries.remove(&Self::policy_key::<P>(key)).is_some()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn policy_key<P: Any>(key: Option<&TypeKey>) -> PolicyKey {
    PolicyKey {
      kind: TypeId::of::<P>(),
      key: key.cloned(),
    }
  }
}

impl Default for PolicyList {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for PolicyList {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PolicyList")
      .field("entries", &self.entries.len())
      .field("has_parent", &self.parent.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::Type;

  #[derive(Clone, Debug, PartialEq)]
  struct Marker(&'static str);

  fn key(name: &str) -> TypeKey {
    TypeKey::new(Type::named(name), None)
  }

  #[test]
  fn child_overrides_parent_by_key() {
    let parent = Arc::new(PolicyList::new());
    parent.set(Some(&key("A")), Marker("parent-a"));
    parent.set(Some(&key("B")), Marker("parent-b"));

    let child = PolicyList::child_of(&parent);
    child.set(Some(&key("A")), Marker("child-a"));

    assert_eq!(child.get::<Marker>(&key("A")), Some(Marker("child-a")));
    assert_eq!(child.get::<Marker>(&key("B")), Some(Marker("parent-b")));
    assert_eq!(parent.get::<Marker>(&key("A")), Some(Marker("parent-a")));
  }

  #[test]
  fn falls_back_from_specific_to_default() {
    let list = PolicyList::new();
    list.set_default(Marker("default"));
    list.set(Some(&TypeKey::new(Type::open("Repo", 1), None)), Marker("open"));

    let closed = TypeKey::new(Type::generic("Repo", [Type::named("Order")]), Some("primary"));
    assert_eq!(list.get::<Marker>(&closed), Some(Marker("open")));
    assert_eq!(list.get::<Marker>(&key("Other")), Some(Marker("default")));
  }

  #[test]
  fn kinds_do_not_collide_and_missing_is_none() {
    let list = PolicyList::new();
    list.set(Some(&key("A")), Marker("a"));

    assert_eq!(list.get::<u32>(&key("A")), None);
    assert!(list.remove::<Marker>(Some(&key("A"))));
    assert_eq!(list.get::<Marker>(&key("A")), None);
  }
}
