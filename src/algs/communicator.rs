//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking: callers post every send
//! before they `.wait()` on any receive, which keeps the exchange patterns
//! in this crate deadlock-free on every backend.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Message tag namespace for one communication phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Tag `n` slots after this one.
    #[inline]
    pub const fn offset(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }
}

/// Tags of every phase of one redistribution round.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RedistributeTags {
    pub counts: CommTag,
    pub fields_check: CommTag,
    pub coupling: CommTag,
    pub mesh_sizes: CommTag,
    pub mesh_data: CommTag,
    pub shared_point_sizes: CommTag,
    pub shared_points: CommTag,
    pub reduce: CommTag,
    pub side_data_sizes: CommTag,
    pub side_data: CommTag,
}

impl RedistributeTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            counts: base,
            fields_check: base.offset(1),
            coupling: base.offset(2),
            mesh_sizes: base.offset(3),
            mesh_data: base.offset(4),
            shared_point_sizes: base.offset(5),
            shared_points: base.offset(6),
            reduce: base.offset(7),
            side_data_sizes: base.offset(8),
            side_data: base.offset(9),
        }
    }
}

/// Non-blocking point-to-point communication.
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of this process.
    fn rank(&self) -> usize;
    /// Number of processes.
    fn size(&self) -> usize;

    /// Post a send; the buffer is copied or kept alive by the handle.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of a message of `buf.len()` bytes; `wait` yields the
    /// message, which callers length-check.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Tear down the collective operation on every rank.
    fn abort(&self, _code: i32) {}
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Compile-time no-op comm for single-rank runs.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Mailbox shared by the ranks of one in-process world.
#[derive(Default)]
struct Mailbox {
    queues: DashMap<Key, VecDeque<Bytes>>,
    aborted: AtomicBool,
    signal: Mutex<u64>,
    arrived: Condvar,
}

impl Mailbox {
    fn post(&self, key: Key, data: Bytes) {
        self.queues.entry(key).or_default().push_back(data);
        let mut generation = self.signal.lock();
        *generation = generation.wrapping_add(1);
        self.arrived.notify_all();
    }

    fn take(&self, key: &Key) -> Option<Bytes> {
        self.queues.get_mut(key).and_then(|mut q| q.pop_front())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let _generation = self.signal.lock();
        self.arrived.notify_all();
    }
}

/// Receive handle of [`RayonComm`]; blocks in `wait` until the message arrives.
pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            let mut generation = self.mailbox.signal.lock();
            if let Some(bytes) = self.mailbox.take(&self.key) {
                return Some(bytes.to_vec());
            }
            if self.mailbox.aborted.load(Ordering::SeqCst) {
                return None;
            }
            self.mailbox
                .arrived
                .wait_for(&mut generation, Duration::from_millis(50));
        }
    }
}

/// In-process communicator: every rank is a thread sharing one mailbox.
///
/// Messages between a `(src, dst, tag)` triple are delivered in FIFO order.
#[derive(Clone)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for RayonComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl RayonComm {
    /// Communicators for ranks `0..size` of one fresh world.
    pub fn world(size: usize) -> Vec<RayonComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| RayonComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }

    /// `true` once any rank of this world has aborted.
    pub fn is_aborted(&self) -> bool {
        self.mailbox.aborted.load(Ordering::SeqCst)
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        self.mailbox.post(key, Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
        }
    }

    fn abort(&self, code: i32) {
        log::error!("rank {} aborting world (code {code})", self.rank);
        self.mailbox.abort();
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::request::StaticScope;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI communicator over `MPI_COMM_WORLD`.
    ///
    /// Receive handles share `world`: a duplicated communicator has its own
    /// context and never matches the sends posted on `world`.
    pub struct MpiComm {
        pub world: Arc<SimpleCommunicator>,
        pub rank: usize,
        size: usize,
        _universe: Option<mpi::environment::Universe>,
    }

    // SAFETY: the engine drives MPI from the single thread that owns the
    // communicator; handles never cross threads.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        /// Initialize MPI and wrap the world communicator.
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            Some(Self::from_world(world, Some(universe)))
        }

        /// Wrap an existing communicator (MPI already initialized).
        pub fn from_world(
            world: SimpleCommunicator,
            universe: Option<mpi::environment::Universe>,
        ) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                world: Arc::new(world),
                rank,
                size,
                _universe: universe,
            }
        }
    }

    /// Send request owning its buffer until completion.
    pub struct MpiSendHandle {
        request: Option<mpi::request::Request<'static, [u8], StaticScope>>,
        buf: *mut [u8],
    }

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.request.take() {
                req.wait();
            }
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(req) = self.request.take() {
                req.wait();
            }
            // SAFETY: `buf` came from `Box::into_raw` in `isend` and the
            // request referencing it has completed.
            unsafe { drop(Box::from_raw(self.buf)) };
        }
    }

    /// Receive posted lazily: the matching blocking receive runs in `wait`,
    /// after every send of the phase has been posted.
    pub struct MpiRecvHandle {
        world: Arc<SimpleCommunicator>,
        peer: i32,
        tag: i32,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let (data, _status) = self
                .world
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(self.tag);
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let raw: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the boxed buffer outlives the request; it is released in
            // `Drop` only after the request completed.
            let data: &'static [u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, tag as i32);
            MpiSendHandle {
                request: Some(req),
                buf: raw,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> MpiRecvHandle {
            MpiRecvHandle {
                world: Arc::clone(&self.world),
                peer: peer as i32,
                tag: tag as i32,
            }
        }

        fn abort(&self, code: i32) {
            log::error!("rank {} calling MPI_Abort({code})", self.rank);
            self.world.abort(code);
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
