//! Runtime type descriptors.
//!
//! The engine never inspects Rust types directly. Everything it builds is
//! identified by a [`Type`]: a named type with an ordered list of type
//! arguments, or a generic parameter placeholder inside an open generic.

use std::fmt;
use std::sync::Arc;

/// A runtime description of a (possibly generic) type.
///
/// `Repository<Order>` is a closed generic, `Repository<T0>` is open: its
/// argument is the parameter placeholder `Param(0)`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Type {
  /// A named type and its type arguments (empty for non-generic types).
  Named { name: Arc<str>, args: Arc<[Type]> },
  /// The generic parameter at the given position.
  Param(usize),
}

impl Type {
  /// A non-generic type.
  pub fn named(name: &str) -> Self {
    Type::Named {
      name: Arc::from(name),
      args: Arc::from(Vec::new()),
    }
  }

  /// Describes a Rust type by its `type_name`.
  ///
  /// The result is always a non-generic descriptor: `Repository<Order>`
  /// becomes one opaque name with no type arguments, so it never matches an
  /// open `Repository<T0>` registration. Build closed generics with
  /// [`Type::generic`] to reach those.
  pub fn of<T: ?Sized + 'static>() -> Self {
    Self::named(std::any::type_name::<T>())
  }

  /// A generic type applied to the given arguments.
  pub fn generic(name: &str, args: impl IntoIterator<Item = Type>) -> Self {
    Type::Named {
      name: Arc::from(name),
      args: args.into_iter().collect::<Vec<_>>().into(),
    }
  }

  /// The open form of a generic type with `arity` parameters, e.g. `Repository<T0>`.
  pub fn open(name: &str, arity: usize) -> Self {
    Self::generic(name, (0..arity).map(Type::Param))
  }

  pub fn param(index: usize) -> Self {
    Type::Param(index)
  }

  /// The type name, without arguments. `None` for parameter placeholders.
  pub fn name(&self) -> Option<&str> {
    match self {
      Type::Named { name, .. } => Some(name),
      Type::Param(_) => None,
    }
  }

  pub fn args(&self) -> &[Type] {
    match self {
      Type::Named { args, .. } => args,
      Type::Param(_) => &[],
    }
  }

  pub fn is_generic(&self) -> bool {
    !self.args().is_empty()
  }

  /// True if any parameter placeholder appears anywhere in this type.
  pub fn is_open(&self) -> bool {
    match self {
      Type::Param(_) => true,
      Type::Named { args, .. } => args.iter().any(Type::is_open),
    }
  }

  /// The open generic definition of this type: same name, every argument
  /// replaced by its positional parameter. `None` for non-generic types.
  pub fn definition(&self) -> Option<Type> {
    match self {
      Type::Named { name, args } if !args.is_empty() => Some(Self::open(name, args.len())),
      _ => None,
    }
  }

  /// Number of generic parameters this type expects to be closed over.
  pub fn parameter_count(&self) -> usize {
    match self {
      Type::Param(index) => index + 1,
      Type::Named { args, .. } => args.iter().map(Type::parameter_count).max().unwrap_or(0),
    }
  }

  /// True if the parameters used in this type are exactly `T0..Tn`, with
  /// no gaps.
  pub fn has_contiguous_parameters(&self) -> bool {
    fn collect(ty: &Type, used: &mut Vec<bool>) {
      match ty {
        Type::Param(index) => used[*index] = true,
        Type::Named { args, .. } => args.iter().for_each(|arg| collect(arg, used)),
      }
    }
    let mut used = vec![false; self.parameter_count()];
    collect(self, &mut used);
    used.into_iter().all(|seen| seen)
  }

  /// Matches a closed type against this pattern and returns the type bound
  /// to each parameter, indexed by position.
  ///
  /// `Map<Order, T0>` binds `Map<Order, Id>` to `[Id]` and rejects
  /// `Map<Customer, Id>`. A parameter used twice must bind the same type both
  /// times.
  pub fn bind(&self, concrete: &Type) -> Option<Vec<Type>> {
    fn walk(pattern: &Type, concrete: &Type, bound: &mut [Option<Type>]) -> bool {
      match (pattern, concrete) {
        (Type::Param(index), _) => match &bound[*index] {
          Some(existing) => existing == concrete,
          None => {
            bound[*index] = Some(concrete.clone());
            true
          }
        },
        (Type::Named { name, args }, Type::Named { name: other, args: other_args }) => {
          name == other
            && args.len() == other_args.len()
            && args.iter().zip(other_args.iter()).all(|(p, c)| walk(p, c, bound))
        }
        (Type::Named { .. }, Type::Param(_)) => false,
      }
    }
    let mut bound = vec![None; self.parameter_count()];
    if !walk(self, concrete, &mut bound) {
      return None;
    }
    bound.into_iter().collect()
  }

  /// Replaces every `Param(i)` with `args[i]`. Parameters without a matching
  /// argument are left in place.
  pub fn substitute(&self, args: &[Type]) -> Type {
    match self {
      Type::Param(index) => args.get(*index).cloned().unwrap_or(Type::Param(*index)),
      Type::Named { name, args: own } if own.is_empty() => Type::Named {
        name: name.clone(),
        args: own.clone(),
      },
      Type::Named { name, args: own } => Type::Named {
        name: name.clone(),
        args: own.iter().map(|arg| arg.substitute(args)).collect::<Vec<_>>().into(),
      },
    }
  }
}

impl fmt::Display for Type {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Type::Param(index) => write!(f, "T{}", index),
      Type::Named { name, args } if args.is_empty() => f.write_str(name),
      Type::Named { name, args } => {
        write!(f, "{}<", name)?;
        for (i, arg) in args.iter().enumerate() {
          if i > 0 {
            f.write_str(", ")?;
          }
          write!(f, "{}", arg)?;
        }
        f.write_str(">")
      }
    }
  }
}

impl fmt::Debug for Type {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Type({})", self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn open_and_closed_generics() {
    let open = Type::open("Repository", 1);
    let closed = Type::generic("Repository", [Type::named("Order")]);

    assert!(open.is_open());
    assert!(!closed.is_open());
    assert!(closed.is_generic());
    assert_eq!(closed.definition(), Some(open.clone()));
    assert_eq!(open.parameter_count(), 1);
    assert_eq!(closed.parameter_count(), 0);
    assert_eq!(open.to_string(), "Repository<T0>");
    assert_eq!(closed.to_string(), "Repository<Order>");
  }

  #[test]
  fn substitute_reaches_nested_arguments() {
    let template = Type::generic("Pair", [Type::param(1), Type::generic("List", [Type::param(0)])]);
    let closed = template.substitute(&[Type::named("A"), Type::named("B")]);

    assert_eq!(closed.to_string(), "Pair<B, List<A>>");
    assert_eq!(template.parameter_count(), 2);
  }

  #[test]
  fn bind_matches_fixed_arguments_and_binds_parameters() {
    let pattern = Type::generic("Map", [Type::named("Order"), Type::param(0)]);

    let bound = pattern.bind(&Type::generic("Map", [Type::named("Order"), Type::named("Id")]));
    assert_eq!(bound, Some(vec![Type::named("Id")]));
    assert_eq!(pattern.bind(&Type::generic("Map", [Type::named("Customer"), Type::named("Id")])), None);
    assert_eq!(pattern.bind(&Type::generic("Map", [Type::named("Order")])), None);
  }

  #[test]
  fn bind_requires_repeated_parameters_to_agree() {
    let pattern = Type::generic("Pair", [Type::param(0), Type::param(0)]);

    assert_eq!(
      pattern.bind(&Type::generic("Pair", [Type::named("A"), Type::named("A")])),
      Some(vec![Type::named("A")])
    );
    assert_eq!(pattern.bind(&Type::generic("Pair", [Type::named("A"), Type::named("B")])), None);
  }

  #[test]
  fn parameter_gaps_are_detected() {
    assert!(Type::open("Map", 2).has_contiguous_parameters());
    assert!(Type::generic("Map", [Type::named("Order"), Type::param(0)]).has_contiguous_parameters());
    assert!(!Type::generic("Map", [Type::named("Order"), Type::param(1)]).has_contiguous_parameters());
  }

  #[test]
  fn non_generic_types_have_no_definition() {
    assert_eq!(Type::named("Logger").definition(), None);
    assert_eq!(Type::param(0).name(), None);
  }
}
