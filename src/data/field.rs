//! Field-transport collaborators.
//!
//! The redistribution engine does not know what a field means. Each field
//! family registers a [`FieldTransport`] under a type tag in a
//! [`FieldRegistry`]; the engine asks it to serialize subsets of values when
//! sub-meshes are extracted and hands it the received blocks afterwards.

use crate::algs::wire::Fnv1a;
use crate::mesh_error::MeshError;
use bytemuck::Pod;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Mesh entity a field is attached to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// One value per point.
    Point,
    /// One value per face.
    Face,
    /// One value per cell.
    Cell,
}

impl EntityKind {
    pub(crate) fn tag(self) -> u64 {
        match self {
            EntityKind::Point => 0,
            EntityKind::Face => 1,
            EntityKind::Cell => 2,
        }
    }

    pub(crate) fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(EntityKind::Point),
            1 => Some(EntityKind::Face),
            2 => Some(EntityKind::Cell),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Point => "point",
            EntityKind::Face => "face",
            EntityKind::Cell => "cell",
        };
        f.write_str(s)
    }
}

/// Where each entity of the final mesh takes its value from.
///
/// `chunks[c]` is the serialized field of the `c`-th merged sub-mesh;
/// `sources[new] == (c, i)` means entity `new` takes value `i` of chunk `c`.
#[derive(Debug, Clone, Copy)]
pub struct FieldAssembly<'a> {
    /// Serialized sub-fields in merge order.
    pub chunks: &'a [Bytes],
    /// Per final entity, `(chunk, index within chunk)`.
    pub sources: &'a [(usize, usize)],
}

/// Extract/receive pair for one family of fields.
pub trait FieldTransport: Send + Sync {
    /// Entity kind every field of this family is attached to.
    fn location(&self) -> EntityKind;

    /// Names of the field instances, in a process-independent order.
    fn field_names(&self) -> Vec<String>;

    /// Serialize field `name` restricted to `indices` (sub-mesh → parent).
    fn extract(&self, name: &str, indices: &[usize]) -> Result<Bytes, MeshError>;

    /// Replace field `name` by the values assembled from received chunks.
    fn receive(&mut self, name: &str, assembly: FieldAssembly<'_>) -> Result<(), MeshError>;
}

/// Field families keyed by type tag (e.g. `"volScalarField"`).
#[derive(Default)]
pub struct FieldRegistry {
    families: BTreeMap<String, Box<dyn FieldTransport>>,
}

impl fmt::Debug for FieldRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.families
                    .iter()
                    .map(|(tag, t)| (tag, (t.location(), t.field_names()))),
            )
            .finish()
    }
}

impl FieldRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the family under `tag`.
    pub fn register(&mut self, tag: impl Into<String>, transport: Box<dyn FieldTransport>) {
        self.families.insert(tag.into(), transport);
    }

    /// Look up a family by tag.
    pub fn get(&self, tag: &str) -> Option<&dyn FieldTransport> {
        self.families.get(tag).map(|b| b.as_ref())
    }

    /// Mutable lookup by tag.
    pub fn get_mut(&mut self, tag: &str) -> Option<&mut (dyn FieldTransport + 'static)> {
        self.families.get_mut(tag).map(|b| b.as_mut())
    }

    /// Families in tag order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn FieldTransport)> {
        self.families.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Mutable families in tag order.
    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (&str, &mut (dyn FieldTransport + 'static))> {
        self.families.iter_mut().map(|(k, v)| (k.as_str(), v.as_mut()))
    }

    /// Number of families.
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Canonical `(tag, location, names)` description.
    pub fn describe(&self) -> Vec<(String, EntityKind, Vec<String>)> {
        self.families
            .iter()
            .map(|(tag, t)| (tag.clone(), t.location(), t.field_names()))
            .collect()
    }

    /// Order-sensitive 64-bit FNV-1a digest of [`describe`](Self::describe).
    ///
    /// Identical on every process that registered the same families.
    pub fn fingerprint(&self) -> u64 {
        let mut h = Fnv1a::default();
        for (tag, loc, names) in self.describe() {
            h.eat(tag.as_bytes());
            h.eat(&loc.tag().to_le_bytes());
            for n in names {
                h.eat(n.as_bytes());
            }
        }
        h.finish()
    }
}

/// Ready-made transport for fields of plain-old-data values.
#[derive(Debug, Clone, PartialEq)]
pub struct PodFieldStore<T: Pod> {
    location: EntityKind,
    fields: BTreeMap<String, Vec<T>>,
}

impl<T: Pod + Send + Sync> PodFieldStore<T> {
    /// Empty store for fields on `location`.
    pub fn new(location: EntityKind) -> Self {
        Self {
            location,
            fields: BTreeMap::new(),
        }
    }

    /// Add or replace a field.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<T>) {
        self.fields.insert(name.into(), values);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, values: Vec<T>) -> Self {
        self.insert(name, values);
        self
    }

    /// Current values of field `name`.
    pub fn values(&self, name: &str) -> Option<&[T]> {
        self.fields.get(name).map(|v| v.as_slice())
    }

    fn decode(name: &str, chunk: &[u8]) -> Result<Vec<T>, MeshError> {
        let sz = std::mem::size_of::<T>();
        if sz == 0 || chunk.len() % sz != 0 {
            return Err(MeshError::Field {
                name: name.to_owned(),
                reason: format!("{} bytes is not a whole number of {sz}-byte values", chunk.len()),
            });
        }
        Ok(chunk.chunks_exact(sz).map(bytemuck::pod_read_unaligned).collect())
    }
}

impl<T: Pod + Send + Sync> FieldTransport for PodFieldStore<T> {
    fn location(&self) -> EntityKind {
        self.location
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    fn extract(&self, name: &str, indices: &[usize]) -> Result<Bytes, MeshError> {
        let values = self.fields.get(name).ok_or_else(|| MeshError::Field {
            name: name.to_owned(),
            reason: "not registered".into(),
        })?;
        let mut out = Vec::with_capacity(indices.len());
        for &i in indices {
            out.push(*values.get(i).ok_or_else(|| MeshError::Field {
                name: name.to_owned(),
                reason: format!("index {i} outside {} values", values.len()),
            })?);
        }
        Ok(Bytes::copy_from_slice(bytemuck::cast_slice(&out)))
    }

    fn receive(&mut self, name: &str, assembly: FieldAssembly<'_>) -> Result<(), MeshError> {
        let decoded: Vec<Vec<T>> = assembly
            .chunks
            .iter()
            .map(|c| Self::decode(name, c))
            .collect::<Result<_, _>>()?;
        let mut values = Vec::with_capacity(assembly.sources.len());
        for &(c, i) in assembly.sources {
            let v = decoded.get(c).and_then(|chunk| chunk.get(i)).ok_or_else(|| {
                MeshError::Field {
                    name: name.to_owned(),
                    reason: format!("value {i} of chunk {c} was not received"),
                }
            })?;
            values.push(*v);
        }
        self.fields.insert(name.to_owned(), values);
        Ok(())
    }
}
