//! Old↔new index correspondence produced by every topology edit.
//!
//! Each edit (subset extraction, merge, patch re-filing, point merging)
//! returns a [`TopologyChangeMap`]. It is the only sanctioned way to carry
//! indices from one mesh generation to the next; maps of consecutive edits
//! are combined with [`TopologyChangeMap::compose`].

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshError;

/// Where a new entity came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Same entity as old index `0`, possibly renumbered.
    Preserved(usize),
    /// New entity without predecessor.
    Appended,
    /// Result of merging two or more old entities; `master` is one of them.
    Merged { master: usize },
}

/// What became of an old entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// Survives as new index `0` (for a merge master, the merged entity).
    Moved(usize),
    /// Absorbed into the merged entity `0`.
    MergedInto(usize),
    /// Dropped by the edit.
    Removed,
}

impl Target {
    /// New index this old entity resolves to, if any.
    #[inline]
    pub fn index(self) -> Option<usize> {
        match self {
            Target::Moved(n) | Target::MergedInto(n) => Some(n),
            Target::Removed => None,
        }
    }
}

/// Forward and reverse maps for one entity kind.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct EntityMap {
    forward: Vec<Origin>,
    reverse: Vec<Target>,
}

impl EntityMap {
    /// Map in which every one of `n` entities keeps its index.
    pub fn identity(n: usize) -> Self {
        Self {
            forward: (0..n).map(Origin::Preserved).collect(),
            reverse: (0..n).map(Target::Moved).collect(),
        }
    }

    /// Start building a map over `n_old` old entities.
    pub fn builder(n_old: usize) -> EntityMapBuilder {
        EntityMapBuilder {
            forward: Vec::new(),
            reverse: vec![Target::Removed; n_old],
        }
    }

    /// Map keeping exactly the listed old entities, in the listed order.
    ///
    /// `kept[new] == old`. Used for subsets and permutations.
    pub fn from_kept(n_old: usize, kept: &[usize]) -> Result<Self, MeshError> {
        let mut b = Self::builder(n_old);
        for &old in kept {
            b.preserve(old)?;
        }
        Ok(b.finish())
    }

    pub fn n_old(&self) -> usize {
        self.reverse.len()
    }

    pub fn n_new(&self) -> usize {
        self.forward.len()
    }

    pub fn origin(&self, new: usize) -> Origin {
        self.forward[new]
    }

    pub fn target(&self, old: usize) -> Target {
        self.reverse[old]
    }

    pub fn forward(&self) -> &[Origin] {
        &self.forward
    }

    pub fn reverse(&self) -> &[Target] {
        &self.reverse
    }

    /// New index for `old`, following merges to the surviving entity.
    #[inline]
    pub fn resolve(&self, old: usize) -> Option<usize> {
        self.reverse.get(old).and_then(|t| t.index())
    }

    /// Old index the new entity is traced back to (the master for merges).
    pub fn old_of(&self, new: usize) -> Option<usize> {
        match self.forward[new] {
            Origin::Preserved(o) | Origin::Merged { master: o } => Some(o),
            Origin::Appended => None,
        }
    }

    /// `true` when nothing moved, merged, appeared or vanished.
    pub fn is_identity(&self) -> bool {
        self.forward.len() == self.reverse.len()
            && self
                .forward
                .iter()
                .enumerate()
                .all(|(i, o)| *o == Origin::Preserved(i))
    }

    /// Number of new entities produced by merging.
    pub fn n_merged(&self) -> usize {
        self.forward
            .iter()
            .filter(|o| matches!(o, Origin::Merged { .. }))
            .count()
    }

    /// Translate a list of old indices, dropping removed ones.
    pub fn remap_indices(&self, old: &[usize]) -> Vec<usize> {
        old.iter().filter_map(|&o| self.resolve(o)).collect()
    }

    /// Compose `self` (old→mid) with `then` (mid→new) into old→new.
    ///
    /// `then` may know more old entities than `self` produced; those are
    /// entities appended between the two edits and show up as `Appended`.
    pub fn compose(&self, then: &EntityMap) -> Result<EntityMap, MeshError> {
        if then.n_old() < self.n_new() {
            return Err(MeshError::MapComposition(format!(
                "second map covers {} entities, first map produced {}",
                then.n_old(),
                self.n_new()
            )));
        }
        let mut reverse = Vec::with_capacity(self.n_old());
        for &t in &self.reverse {
            let composed = match t {
                Target::Removed => Target::Removed,
                Target::Moved(mid) => then.reverse[mid],
                Target::MergedInto(mid) => match then.reverse[mid].index() {
                    Some(n) => Target::MergedInto(n),
                    None => Target::Removed,
                },
            };
            reverse.push(composed);
        }

        // Derive the forward direction from the composed reverse.
        let mut moved: Vec<Option<usize>> = vec![None; then.n_new()];
        let mut absorbed: Vec<Option<usize>> = vec![None; then.n_new()];
        for old in 0..reverse.len() {
            match reverse[old] {
                Target::Moved(n) => {
                    if moved[n].is_some() {
                        // Two survivors ended up in one entity: the later is absorbed.
                        absorbed[n].get_or_insert(old);
                        reverse[old] = Target::MergedInto(n);
                    } else {
                        moved[n] = Some(old);
                    }
                }
                Target::MergedInto(n) => {
                    absorbed[n].get_or_insert(old);
                }
                Target::Removed => {}
            }
        }
        let mut forward = Vec::with_capacity(then.n_new());
        for n in 0..then.n_new() {
            let o = match (moved[n], absorbed[n]) {
                (Some(m), None) => {
                    if matches!(then.forward[n], Origin::Merged { .. }) {
                        Origin::Merged { master: m }
                    } else {
                        Origin::Preserved(m)
                    }
                }
                (Some(m), Some(_)) => Origin::Merged { master: m },
                (None, Some(a)) => {
                    // Promote the first absorbed entity to master.
                    reverse[a] = Target::Moved(n);
                    Origin::Merged { master: a }
                }
                (None, None) => Origin::Appended,
            };
            forward.push(o);
        }
        Ok(EntityMap { forward, reverse })
    }

    /// Verify `reverse(forward(n)) == n` and the converse.
    pub fn check_sound(&self) -> Result<(), MeshError> {
        for (n, o) in self.forward.iter().enumerate() {
            if let Origin::Preserved(old) | Origin::Merged { master: old } = *o {
                if self.reverse.get(old).and_then(|t| t.index()) != Some(n) {
                    return Err(MeshError::MapComposition(format!(
                        "new entity {n} traces to old {old}, which resolves elsewhere"
                    )));
                }
            }
        }
        for (old, t) in self.reverse.iter().enumerate() {
            if let Some(n) = t.index() {
                if n >= self.forward.len() {
                    return Err(MeshError::MapComposition(format!(
                        "old entity {old} maps past the end ({n})"
                    )));
                }
                if let Target::Moved(_) = t {
                    if self.old_of(n) != Some(old) {
                        return Err(MeshError::MapComposition(format!(
                            "old entity {old} moved to {n}, which does not trace back to it"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Incremental construction of an [`EntityMap`].
#[derive(Debug)]
pub struct EntityMapBuilder {
    forward: Vec<Origin>,
    reverse: Vec<Target>,
}

impl EntityMapBuilder {
    fn claim(&mut self, old: usize, target: Target) -> Result<(), MeshError> {
        match self.reverse.get(old) {
            Some(Target::Removed) => {
                self.reverse[old] = target;
                Ok(())
            }
            Some(_) => Err(MeshError::MapComposition(format!(
                "old entity {old} used twice"
            ))),
            None => Err(MeshError::MapComposition(format!(
                "old entity {old} out of range ({})",
                self.reverse.len()
            ))),
        }
    }

    /// Keep old entity `old` as the next new entity.
    pub fn preserve(&mut self, old: usize) -> Result<usize, MeshError> {
        let new = self.forward.len();
        self.claim(old, Target::Moved(new))?;
        self.forward.push(Origin::Preserved(old));
        Ok(new)
    }

    /// Add a new entity with no predecessor.
    pub fn append(&mut self) -> usize {
        self.forward.push(Origin::Appended);
        self.forward.len() - 1
    }

    /// Merge `master` and `others` into the next new entity.
    pub fn merge(&mut self, master: usize, others: &[usize]) -> Result<usize, MeshError> {
        let new = self.forward.len();
        self.claim(master, Target::Moved(new))?;
        for &o in others {
            self.claim(o, Target::MergedInto(new))?;
        }
        self.forward.push(if others.is_empty() {
            Origin::Preserved(master)
        } else {
            Origin::Merged { master }
        });
        Ok(new)
    }

    /// Fold `old` into an already created new entity.
    pub fn absorb(&mut self, old: usize, into: usize) -> Result<(), MeshError> {
        self.claim(old, Target::MergedInto(into))?;
        if let Some(Origin::Preserved(m)) = self.forward.get(into).copied() {
            self.forward[into] = Origin::Merged { master: m };
        }
        Ok(())
    }

    pub fn finish(self) -> EntityMap {
        EntityMap {
            forward: self.forward,
            reverse: self.reverse,
        }
    }
}

/// Index maps for points, faces and cells of one edit.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TopologyChangeMap {
    pub points: EntityMap,
    pub faces: EntityMap,
    pub cells: EntityMap,
}

impl TopologyChangeMap {
    pub fn identity(n_points: usize, n_faces: usize, n_cells: usize) -> Self {
        Self {
            points: EntityMap::identity(n_points),
            faces: EntityMap::identity(n_faces),
            cells: EntityMap::identity(n_cells),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.points.is_identity() && self.faces.is_identity() && self.cells.is_identity()
    }

    /// Compose with a later edit.
    pub fn compose(&self, then: &TopologyChangeMap) -> Result<TopologyChangeMap, MeshError> {
        Ok(TopologyChangeMap {
            points: self.points.compose(&then.points)?,
            faces: self.faces.compose(&then.faces)?,
            cells: self.cells.compose(&then.cells)?,
        })
    }

    pub fn check_sound(&self) -> Result<(), MeshError> {
        self.points.check_sound()?;
        self.faces.check_sound()?;
        self.cells.check_sound()
    }
}

impl DebugInvariants for TopologyChangeMap {
    fn validate_invariants(&self) -> Result<(), MeshError> {
        self.check_sound()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identity_is_identity() {
        let m = EntityMap::identity(4);
        assert!(m.is_identity());
        assert_eq!(m.resolve(3), Some(3));
        m.check_sound().unwrap();
    }

    #[test]
    fn subset_then_merge() {
        // old 0..5, keep 1,3,4 → mid 0,1,2
        let a = EntityMap::from_kept(5, &[1, 3, 4]).unwrap();
        // mid space extended by two appended entities (3,4); merge mid 0 with mid 3
        let mut b = EntityMap::builder(5);
        b.merge(0, &[3]).unwrap();
        b.preserve(1).unwrap();
        b.preserve(2).unwrap();
        b.preserve(4).unwrap();
        let b = b.finish();
        let c = a.compose(&b).unwrap();
        assert_eq!(c.n_old(), 5);
        assert_eq!(c.n_new(), 4);
        assert_eq!(c.target(0), Target::Removed);
        assert_eq!(c.target(1), Target::Moved(0));
        assert_eq!(c.origin(0), Origin::Merged { master: 1 });
        assert_eq!(c.origin(3), Origin::Appended);
        c.check_sound().unwrap();
    }

    #[test]
    fn absorbed_master_is_promoted() {
        let mut a = EntityMap::builder(2);
        a.merge(0, &[1]).unwrap();
        let a = a.finish();
        let b = EntityMap::identity(1);
        let c = a.compose(&b).unwrap();
        assert_eq!(c.resolve(0), Some(0));
        assert_eq!(c.resolve(1), Some(0));
        assert_eq!(c.target(1), Target::MergedInto(0));
        c.check_sound().unwrap();
    }

    #[test]
    fn compose_rejects_short_second_map() {
        let a = EntityMap::identity(3);
        let b = EntityMap::identity(2);
        assert!(matches!(a.compose(&b), Err(MeshError::MapComposition(_))));
    }

    #[test]
    fn double_use_is_rejected() {
        let mut b = EntityMap::builder(2);
        b.preserve(0).unwrap();
        assert!(b.preserve(0).is_err());
        assert!(b.preserve(7).is_err());
    }

    fn arb_map(n_old: usize) -> impl Strategy<Value = EntityMap> {
        // Each old entity is dropped, kept, or merged into an earlier survivor.
        prop::collection::vec(0u8..3, n_old).prop_map(move |choices| {
            let mut b = EntityMap::builder(n_old);
            let mut last = None;
            for (old, c) in choices.into_iter().enumerate() {
                match (c, last) {
                    (1, Some(n)) => b.absorb(old, n).unwrap(),
                    (0, _) => {}
                    _ => last = Some(b.preserve(old).unwrap()),
                }
            }
            b.append();
            b.finish()
        })
    }

    proptest! {
        #[test]
        fn composition_stays_sound(a in arb_map(12), extra in 0usize..3, seed in any::<u64>()) {
            let mid = a.n_new() + extra;
            let mut b = EntityMap::builder(mid);
            let mut order: Vec<usize> = (0..mid).collect();
            // deterministic shuffle from the seed
            let mut s = seed | 1;
            for i in (1..order.len()).rev() {
                s ^= s << 13; s ^= s >> 7; s ^= s << 17;
                order.swap(i, (s % (i as u64 + 1)) as usize);
            }
            for &o in &order {
                if o % 4 != 3 {
                    b.preserve(o).unwrap();
                }
            }
            let b = b.finish();
            let c = a.compose(&b).unwrap();
            c.check_sound().unwrap();
            for old in 0..a.n_old() {
                let expected = a.resolve(old).and_then(|m| b.resolve(m));
                prop_assert_eq!(c.resolve(old), expected);
            }
        }
    }
}
