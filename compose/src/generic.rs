//! Specialization of open generic registrations for closed requests.

use crate::core::TypeKey;
use crate::error::ConfigurationError;
use crate::registration::Registration;

use tracing::debug;

/// Builds the closed registration serving `requested` from an open one.
///
/// The requested type is matched against the open key as a pattern: fixed
/// arguments must be equal and each parameter binds the argument at its
/// position. A request that does not fit the pattern yields `None`. The
/// closed registration inherits the open one's injection members, with every
/// bound parameter substituted, and gets its own lifetime manager from the
/// open manager's factory.
pub(crate) fn close_registration(
  open: &Registration,
  requested: &TypeKey,
) -> Result<Option<Registration>, ConfigurationError> {
  let pattern = open.key().ty();
  let supplied = requested.ty().args().len();
  let expected = pattern.args().len();
  let mismatch = |supplied, expected| ConfigurationError::ArityMismatch {
    requested: requested.ty().clone(),
    target: open.target().clone(),
    supplied,
    expected,
  };
  if supplied != expected {
    return Err(mismatch(supplied, expected));
  }
  let Some(bound) = pattern.bind(requested.ty()) else {
    return Ok(None);
  };
  if open.target().parameter_count() > bound.len() {
    return Err(mismatch(bound.len(), open.target().parameter_count()));
  }

  let target = open.target().substitute(&bound);
  let members = open.members().iter().map(|member| member.close(&bound)).collect();
  let lifetime = open.lifetime().create_lifetime();
  debug!(
    open = %open.key(),
    requested = %requested,
    mapped = %target,
    lifetime = lifetime.kind(),
    "specialized open generic registration"
  );
  Registration::new(requested.clone(), target, members, lifetime).map(Some)
}
