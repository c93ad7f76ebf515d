use crate::core::TypeKey;
use crate::types::Type;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by user code (activators, setters, factories).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for `fibre_compose` operations.
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Configuration(#[from] ConfigurationError),

  #[error(transparent)]
  Resolution(#[from] ResolutionFailure),
}

/// A specialized `Result` type for `fibre_compose` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A malformed registration or request. Never corrupts container state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
  #[error("The {manager} lifetime manager is already attached to a registration and cannot be attached to {key}")]
  LifetimeManagerInUse { key: TypeKey, manager: &'static str },

  #[error("Requested type {requested} supplies {supplied} type argument(s) but the mapped type {target} expects {expected}")]
  ArityMismatch {
    requested: Type,
    target: Type,
    supplied: usize,
    expected: usize,
  },

  #[error("Cannot resolve the open generic type {ty}; concrete type arguments are required")]
  OpenGenericRequest { ty: Type },

  #[error("Invalid mapping for {key} to {target}: {reason}")]
  InvalidMapping {
    key: TypeKey,
    target: Type,
    reason: &'static str,
  },

  #[error("The container has been disposed")]
  Disposed,
}

/// Errors raised while loading a [`ContainerConfig`](crate::ContainerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Failed to read configuration file: {0}")]
  Read(#[from] std::io::Error),

  #[error("Failed to parse configuration: {0}")]
  Parse(String),
}

/// What was being processed when a failure unwound through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
  Resolving { key: TypeKey },
  Mapping { from: Type, to: Type },
  Constructor { signature: String },
  Parameter { name: Arc<str>, ty: Type },
  Property { name: Arc<str>, ty: Type },
  Method { target: Type, name: Arc<str> },
  Factory { target: Type },
}

impl fmt::Display for Frame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Frame::Resolving { key } => write!(f, "resolving {}", key),
      Frame::Mapping { from, to } => write!(f, "mapping {} to {}", from, to),
      Frame::Constructor { signature } => write!(f, "calling constructor {}", signature),
      Frame::Parameter { name, ty } => {
        write!(f, "resolving parameter \"{}\" of type {}", name, ty)
      }
      Frame::Property { name, ty } => {
        write!(f, "resolving value for property \"{}\" of type {}", name, ty)
      }
      Frame::Method { target, name } => write!(f, "calling method {}.{}", target, name),
      Frame::Factory { target } => write!(f, "invoking factory for {}", target),
    }
  }
}

/// The root cause of a failed resolution.
#[derive(Debug, Error)]
pub enum Cause {
  #[error("No registration found for {key}")]
  NotRegistered { key: TypeKey },

  #[error("Circular dependency detected while resolving {key}")]
  Circular { key: TypeKey },

  #[error("Resolution depth limit of {limit} exceeded")]
  DepthExceeded { limit: usize },

  #[error("{target} has no injectable constructor or factory")]
  NoConstructor { target: Type },

  #[error("The value produced for {key} is not a {expected}")]
  TypeMismatch { key: TypeKey, expected: &'static str },

  #[error(transparent)]
  Configuration(#[from] ConfigurationError),

  #[error("{0}")]
  Activation(#[source] BoxError),
}

/// A failure unwinding through a build pipeline.
///
/// Every layer it passes through appends one [`Frame`]; the top-level
/// resolve call turns it into a single [`Error`].
#[derive(Debug)]
pub struct BuildError {
  cause: Cause,
  // Innermost first.
  trail: Vec<Frame>,
}

impl BuildError {
  pub fn new(cause: Cause) -> Self {
    Self {
      cause,
      trail: Vec::new(),
    }
  }

  /// Wraps an error raised by user code.
  pub fn activation(error: impl Into<BoxError>) -> Self {
    Self::new(Cause::Activation(error.into()))
  }

  /// Records the context this failure is unwinding through.
  pub fn within(mut self, frame: Frame) -> Self {
    self.trail.push(frame);
    self
  }

  pub fn cause(&self) -> &Cause {
    &self.cause
  }

  pub(crate) fn is_not_registered(&self, key: &TypeKey) -> bool {
    matches!(&self.cause, Cause::NotRegistered { key: missing } if missing == key)
  }

  /// Converts the failure of a top-level request for `key` into its public form.
  ///
  /// A configuration problem with the request itself stays a
  /// [`ConfigurationError`]; everything else becomes one [`ResolutionFailure`].
  pub(crate) fn into_error(self, key: TypeKey) -> Error {
    let BuildError { cause, mut trail } = self;
    match cause {
      Cause::Configuration(error) if trail.len() <= 1 => Error::Configuration(error),
      cause => {
        trail.reverse();
        Error::Resolution(ResolutionFailure { key, trail, cause })
      }
    }
  }
}

impl From<Cause> for BuildError {
  fn from(cause: Cause) -> Self {
    BuildError::new(cause)
  }
}

impl From<ConfigurationError> for BuildError {
  fn from(error: ConfigurationError) -> Self {
    BuildError::new(Cause::Configuration(error))
  }
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.cause)
  }
}

impl std::error::Error for BuildError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    Some(&self.cause)
  }
}

/// The single error reported for a failed top-level resolution.
#[derive(Debug)]
pub struct ResolutionFailure {
  key: TypeKey,
  trail: Vec<Frame>,
  cause: Cause,
}

impl ResolutionFailure {
  /// The outermost request.
  pub fn key(&self) -> &TypeKey {
    &self.key
  }

  /// The context active at the point of failure, outermost first.
  pub fn trail(&self) -> &[Frame] {
    &self.trail
  }

  pub fn cause(&self) -> &Cause {
    &self.cause
  }
}

impl fmt::Display for ResolutionFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&describe_failure(self))
  }
}

impl std::error::Error for ResolutionFailure {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    Some(&self.cause)
  }
}

/// Renders a failure as a multi-line diagnostic.
pub fn describe_failure(failure: &ResolutionFailure) -> String {
  let mut text = format!("Resolution of the dependency failed for {}.", failure.key);
  if !failure.trail.is_empty() {
    text.push_str("\nFailure occurred while:");
    for frame in &failure.trail {
      text.push_str("\n  ");
      text.push_str(&frame.to_string());
    }
  }
  text.push_str("\nCause: ");
  text.push_str(&failure.cause.to_string());
  text
}
