//! Boundary patches: named, contiguous ranges of boundary faces.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the transient patch that collects faces exposed by subsetting.
pub const EXPOSED_PATCH_NAME: &str = "oldInternalFaces";

/// Closed set of patch kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchKind {
    /// Ordinary boundary (wall, inlet, ...).
    Physical,
    /// Periodic coupling to `neighbour_patch` on the same process; face `i`
    /// of this patch is coupled to face `i` of the partner.
    Cyclic { neighbour_patch: String },
    /// Inter-process coupling.
    Processor { my_rank: usize, neighbour_rank: usize },
    /// Inter-process coupling that originated from the cyclic patch
    /// `referred_patch`.
    ProcessorCyclic {
        my_rank: usize,
        neighbour_rank: usize,
        referred_patch: String,
    },
}

impl PatchKind {
    /// Processor and processor-cyclic patches; these must come last.
    #[inline]
    pub fn is_processor(&self) -> bool {
        matches!(
            self,
            PatchKind::Processor { .. } | PatchKind::ProcessorCyclic { .. }
        )
    }

    /// Every kind except physical couples faces to a counterpart.
    #[inline]
    pub fn is_coupled(&self) -> bool {
        !matches!(self, PatchKind::Physical)
    }

    pub fn neighbour_rank(&self) -> Option<usize> {
        match self {
            PatchKind::Processor { neighbour_rank, .. }
            | PatchKind::ProcessorCyclic { neighbour_rank, .. } => Some(*neighbour_rank),
            _ => None,
        }
    }

    pub fn referred_patch(&self) -> Option<&str> {
        match self {
            PatchKind::ProcessorCyclic { referred_patch, .. } => Some(referred_patch),
            _ => None,
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            PatchKind::Physical => 0,
            PatchKind::Cyclic { .. } => 1,
            PatchKind::Processor { .. } => 2,
            PatchKind::ProcessorCyclic { .. } => 3,
        }
    }
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchKind::Physical => write!(f, "physical"),
            PatchKind::Cyclic { neighbour_patch } => write!(f, "cyclic({neighbour_patch})"),
            PatchKind::Processor {
                my_rank,
                neighbour_rank,
            } => write!(f, "processor({my_rank}->{neighbour_rank})"),
            PatchKind::ProcessorCyclic {
                my_rank,
                neighbour_rank,
                referred_patch,
            } => write!(
                f,
                "processorCyclic({my_rank}->{neighbour_rank} via {referred_patch})"
            ),
        }
    }
}

/// A named range `[start, start + size)` of boundary faces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub name: String,
    pub kind: PatchKind,
    pub start: usize,
    pub size: usize,
}

impl Patch {
    pub fn physical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PatchKind::Physical,
            start: 0,
            size: 0,
        }
    }

    pub fn cyclic(name: impl Into<String>, neighbour_patch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PatchKind::Cyclic {
                neighbour_patch: neighbour_patch.into(),
            },
            start: 0,
            size: 0,
        }
    }

    /// Processor patch from `my_rank` to `neighbour_rank`.
    pub fn processor(my_rank: usize, neighbour_rank: usize) -> Self {
        Self {
            name: processor_patch_name(my_rank, neighbour_rank, None),
            kind: PatchKind::Processor {
                my_rank,
                neighbour_rank,
            },
            start: 0,
            size: 0,
        }
    }

    /// Processor-cyclic patch from `my_rank` to `neighbour_rank` through `referred`.
    pub fn processor_cyclic(my_rank: usize, neighbour_rank: usize, referred: &str) -> Self {
        Self {
            name: processor_patch_name(my_rank, neighbour_rank, Some(referred)),
            kind: PatchKind::ProcessorCyclic {
                my_rank,
                neighbour_rank,
                referred_patch: referred.to_owned(),
            },
            start: 0,
            size: 0,
        }
    }

    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.size
    }
}

/// `procBoundary0to1` / `procBoundary0to1throughperiodicA`.
pub fn processor_patch_name(
    my_rank: usize,
    neighbour_rank: usize,
    referred: Option<&str>,
) -> String {
    match referred {
        Some(r) => format!("procBoundary{my_rank}to{neighbour_rank}through{r}"),
        None => format!("procBoundary{my_rank}to{neighbour_rank}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_convention() {
        assert_eq!(Patch::processor(0, 3).name, "procBoundary0to3");
        assert_eq!(
            Patch::processor_cyclic(2, 1, "left").name,
            "procBoundary2to1throughleft"
        );
    }

    #[test]
    fn kind_classification() {
        assert!(!PatchKind::Physical.is_coupled());
        assert!(Patch::cyclic("a", "b").kind.is_coupled());
        assert!(!Patch::cyclic("a", "b").kind.is_processor());
        assert!(Patch::processor(0, 1).kind.is_processor());
        assert_eq!(Patch::processor_cyclic(0, 1, "a").kind.referred_patch(), Some("a"));
    }
}
