//! Named, non-contiguous subsets of points, faces or cells.

use crate::topology::change_map::EntityMap;
use serde::{Deserialize, Serialize};

/// A named membership list. Indices are sorted and unique.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    members: Vec<usize>,
}

impl Zone {
    pub fn new(name: impl Into<String>, members: impl IntoIterator<Item = usize>) -> Self {
        let mut members: Vec<usize> = members.into_iter().collect();
        members.sort_unstable();
        members.dedup();
        Self {
            name: name.into(),
            members,
        }
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, i: usize) -> bool {
        self.members.binary_search(&i).is_ok()
    }

    /// Membership carried through an index map; removed entities drop out.
    pub fn remapped(&self, map: &EntityMap) -> Zone {
        Zone::new(self.name.clone(), map.remap_indices(&self.members))
    }

    fn extend(&mut self, more: impl IntoIterator<Item = usize>) {
        self.members.extend(more);
        self.members.sort_unstable();
        self.members.dedup();
    }
}

/// Ordered list of zones of one entity kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneList {
    zones: Vec<Zone>,
}

impl ZoneList {
    pub fn new(zones: Vec<Zone>) -> Self {
        Self { zones }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Zone> {
        self.zones.iter()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name == name)
    }

    pub fn push(&mut self, zone: Zone) {
        self.zones.push(zone);
    }

    pub fn remapped(&self, map: &EntityMap) -> ZoneList {
        ZoneList {
            zones: self.zones.iter().map(|z| z.remapped(map)).collect(),
        }
    }

    /// Add members to zone `name`, creating it at the end if missing.
    pub fn merge_into(&mut self, name: &str, members: impl IntoIterator<Item = usize>) {
        match self.zones.iter_mut().find(|z| z.name == name) {
            Some(z) => z.extend(members),
            None => self.zones.push(Zone::new(name, members)),
        }
    }
}

/// Point, face and cell zones of a mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zones {
    pub points: ZoneList,
    pub faces: ZoneList,
    pub cells: ZoneList,
}
