//! Fixed, versioned, little-endian wire types for the redistribution exchanges.
//!
//! Fixed-size records (headers, counts, coupling pairs) are `Pod` structs cast
//! with `bytemuck`. Variable-length messages (sub-meshes, field blocks) are
//! written with [`WireWriter`] and read back with the checked [`WireReader`],
//! which never panics on short or corrupt input.

use crate::mesh_error::WireError;
use bytemuck::{Pod, Zeroable};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::const_assert_eq;
use std::mem::{align_of, size_of};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), WireError> {
    if actual == expected {
        Ok(())
    } else {
        Err(WireError::Length { expected, actual })
    }
}

/// 64-bit FNV-1a over a sequence of byte strings, used to compare
/// configuration across ranks in a single gathered word.
#[derive(Clone, Copy, Debug)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }
}

impl Fnv1a {
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    /// Hash one item, followed by a separator so ("ab","c") != ("a","bc").
    pub fn eat(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
        self.0 ^= 0xff;
        self.0 = self.0.wrapping_mul(Self::PRIME);
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Message kinds carried in [`WireHdr::kind`].
pub mod kind {
    pub const SUBMESH: u16 = 1;
    pub const COUPLING: u16 = 2;
    pub const SIDE_DATA: u16 = 3;
    pub const FIELD_REGISTRY: u16 = 4;
    pub const POINT_SYNC: u16 = 5;
}

/// All multi-byte integers in these structs are **little-endian** on the wire.
/// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }

    /// Reject foreign versions and unexpected kinds.
    pub fn check(&self, expected_kind: u16) -> Result<(), WireError> {
        if self.version() != WIRE_VERSION {
            return Err(WireError::Version {
                found: self.version(),
                expected: WIRE_VERSION,
            });
        }
        if self.kind() != expected_kind {
            return Err(WireError::Kind {
                found: self.kind(),
                expected: expected_kind,
            });
        }
        Ok(())
    }
}

/// Byte length of the payload that follows on the same channel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }

    /// Decode a count message received as raw bytes.
    pub fn decode(data: &[u8]) -> Result<usize, WireError> {
        expect_exact_len(data.len(), size_of::<WireCount>())?;
        let mut cnt = WireCount::zeroed();
        cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(data);
        Ok(cnt.get())
    }
}

/// One coupled face as seen by its current holder: the holder's face index
/// and the new process of the holder's cell.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCoupling {
    pub face_le: u64,
    pub dest_le: u64,
}
impl WireCoupling {
    pub fn new(face: usize, dest: usize) -> Self {
        Self {
            face_le: (face as u64).to_le(),
            dest_le: (dest as u64).to_le(),
        }
    }
    pub fn face(&self) -> usize {
        u64::from_le(self.face_le) as usize
    }
    pub fn dest(&self) -> usize {
        u64::from_le(self.dest_le) as usize
    }
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireHdr>(), 8);
const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WireCoupling>(), 16);
const_assert_eq!(align_of::<WireCoupling>(), 8);

/// Append-only encoder for variable-length messages.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    /// Start a message of the given kind.
    pub fn new(kind: u16) -> Self {
        let mut w = Self {
            buf: BytesMut::with_capacity(256),
        };
        w.put_pod(&WireHdr::new(kind));
        w
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_pod<T: Pod>(&mut self, v: &T) {
        self.buf.put_slice(bytemuck::bytes_of(v));
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_usize(&mut self, v: usize) {
        self.buf.put_u64_le(v as u64);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_usize(s.len());
        self.buf.put_slice(s.as_bytes());
    }

    /// Length-prefixed opaque bytes.
    pub fn put_bytes(&mut self, b: &[u8]) {
        self.put_usize(b.len());
        self.buf.put_slice(b);
    }

    pub fn put_usizes(&mut self, v: &[usize]) {
        self.put_usize(v.len());
        for &x in v {
            self.put_usize(x);
        }
    }

    pub fn put_i64s(&mut self, v: impl ExactSizeIterator<Item = i64>) {
        self.put_usize(v.len());
        for x in v {
            self.put_i64(x);
        }
    }

    pub fn put_f64s(&mut self, v: impl ExactSizeIterator<Item = f64>) {
        self.put_usize(v.len());
        for x in v {
            self.put_f64(x);
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Checked decoder; every read names what it was reading for error messages.
#[derive(Debug)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    /// Wrap a message and validate its header.
    pub fn new(data: impl Into<Bytes>, expected_kind: u16) -> Result<Self, WireError> {
        let mut r = Self { buf: data.into() };
        let hdr: WireHdr = r.get_pod("header")?;
        hdr.check(expected_kind)?;
        Ok(r)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, what: &'static str, n: usize) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            Err(WireError::Truncated {
                what,
                needed: n,
                available: self.buf.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn get_pod<T: Pod>(&mut self, what: &'static str) -> Result<T, WireError> {
        let n = size_of::<T>();
        self.need(what, n)?;
        let v = bytemuck::pod_read_unaligned(&self.buf[..n]);
        self.buf.advance(n);
        Ok(v)
    }

    pub fn get_u64(&mut self, what: &'static str) -> Result<u64, WireError> {
        self.need(what, 8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_usize(&mut self, what: &'static str) -> Result<usize, WireError> {
        let v = self.get_u64(what)?;
        usize::try_from(v).map_err(|_| WireError::InvalidValue {
            what,
            value: v as i64,
        })
    }

    pub fn get_i64(&mut self, what: &'static str) -> Result<i64, WireError> {
        self.need(what, 8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn get_f64(&mut self, what: &'static str) -> Result<f64, WireError> {
        self.need(what, 8)?;
        Ok(self.buf.get_f64_le())
    }

    /// Length prefix of a sequence of `elem`-byte items, checked against
    /// the remaining input before anything is allocated.
    fn get_len(&mut self, what: &'static str, elem: usize) -> Result<usize, WireError> {
        let n = self.get_usize(what)?;
        let bytes = n.checked_mul(elem).ok_or(WireError::InvalidValue {
            what,
            value: n as i64,
        })?;
        self.need(what, bytes)?;
        Ok(n)
    }

    pub fn get_str(&mut self, what: &'static str) -> Result<String, WireError> {
        let n = self.get_len(what, 1)?;
        let raw = self.buf.split_to(n);
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8(what))
    }

    pub fn get_bytes(&mut self, what: &'static str) -> Result<Bytes, WireError> {
        let n = self.get_len(what, 1)?;
        Ok(self.buf.split_to(n))
    }

    pub fn get_usizes(&mut self, what: &'static str) -> Result<Vec<usize>, WireError> {
        let n = self.get_len(what, 8)?;
        (0..n).map(|_| self.get_usize(what)).collect()
    }

    pub fn get_i64s(&mut self, what: &'static str) -> Result<Vec<i64>, WireError> {
        let n = self.get_len(what, 8)?;
        (0..n).map(|_| self.get_i64(what)).collect()
    }

    pub fn get_f64s(&mut self, what: &'static str) -> Result<Vec<f64>, WireError> {
        let n = self.get_len(what, 8)?;
        (0..n).map(|_| self.get_f64(what)).collect()
    }

    /// Ensure the whole message was consumed.
    pub fn finish(self) -> Result<(), WireError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(WireError::Trailing(n)),
        }
    }
}

/// `None` as −1, the convention of the environment arrays.
#[inline]
pub fn opt_to_i64(v: Option<usize>) -> i64 {
    v.map_or(-1, |x| x as i64)
}

/// Inverse of [`opt_to_i64`]; values below −1 are rejected.
#[inline]
pub fn i64_to_opt(what: &'static str, v: i64) -> Result<Option<usize>, WireError> {
    match v {
        -1 => Ok(None),
        x if x >= 0 => Ok(Some(x as usize)),
        value => Err(WireError::InvalidValue { what, value }),
    }
}
