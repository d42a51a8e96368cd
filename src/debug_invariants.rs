//! Invariant checks shared by meshes and index maps.

use crate::mesh_error::MeshError;

/// A value with checkable structural invariants.
pub trait DebugInvariants {
    /// First violated invariant, if any.
    fn validate_invariants(&self) -> Result<(), MeshError>;

    /// Panic on a violated invariant in debug builds or with
    /// `strict-invariants`; no-op otherwise.
    fn debug_assert_invariants(&self) {
        #[cfg(any(debug_assertions, feature = "strict-invariants"))]
        if let Err(e) = self.validate_invariants() {
            panic!("[invariants] {}: {e}", std::any::type_name::<Self>());
        }
    }
}

/// Validate `value` after the edit named `step` when `enabled`.
pub fn validate_step<T>(value: &T, step: &str, enabled: bool) -> Result<(), MeshError>
where
    T: DebugInvariants + ?Sized,
{
    if !enabled {
        return Ok(());
    }
    value.validate_invariants().inspect_err(|e| {
        log::error!("invariant check after {step} failed: {e}");
    })
}
