// Transport — The process-group contract for multi-node communication
//
// A ProcessGroup is the narrow set of message-passing primitives the
// training layer needs from an MPI-like runtime: rank and world size, a
// barrier, broadcast, point-to-point send/recv and all-reduce. Every
// failure is returned as an Error value; nothing panics or exits.
//
// Buffers are typed: the element kind travels with the slice, so a receive
// into a buffer of the wrong kind or length is an error rather than a
// reinterpretation of bytes.
//
// LocalProcessGroup is the single-process implementation: rank 0 of a world
// of 1. Sends to itself are queued and returned by a later recv; all-reduce
// over one rank is the identity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vole_core::{Error, Result};

/// Source rank accepted by `recv` to match a message from any rank.
pub const RECV_ANY_SOURCE: usize = usize::MAX - 1;

/// Reduction applied by `all_reduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllReduceOp {
    Sum,
    Max,
    Min,
}

/// A read-only typed message buffer.
#[derive(Debug, Clone, Copy)]
pub enum Buf<'a> {
    F32(&'a [f32]),
    U64(&'a [u64]),
}

/// A writable typed message buffer.
#[derive(Debug)]
pub enum BufMut<'a> {
    F32(&'a mut [f32]),
    U64(&'a mut [u64]),
}

impl Buf<'_> {
    pub fn len(&self) -> usize {
        match self {
            Buf::F32(b) => b.len(),
            Buf::U64(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Buf::F32(_) => "f32",
            Buf::U64(_) => "u64",
        }
    }
}

impl BufMut<'_> {
    pub fn len(&self) -> usize {
        match self {
            BufMut::F32(b) => b.len(),
            BufMut::U64(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BufMut::F32(_) => "f32",
            BufMut::U64(_) => "u64",
        }
    }
}

/// Element types that can travel through a process group.
pub trait Element: Copy + Default + Send + 'static {
    fn buf(v: &[Self]) -> Buf<'_>;
    fn buf_mut(v: &mut [Self]) -> BufMut<'_>;
}

impl Element for f32 {
    fn buf(v: &[Self]) -> Buf<'_> {
        Buf::F32(v)
    }

    fn buf_mut(v: &mut [Self]) -> BufMut<'_> {
        BufMut::F32(v)
    }
}

impl Element for u64 {
    fn buf(v: &[Self]) -> Buf<'_> {
        Buf::U64(v)
    }

    fn buf_mut(v: &mut [Self]) -> BufMut<'_> {
        BufMut::U64(v)
    }
}

/// Message-passing primitives of a group of cooperating processes.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process within the group.
    fn my_rank(&self) -> usize;

    /// Number of processes in the group.
    fn world_size(&self) -> usize;

    /// Block until every process has reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// Overwrite `buf` on every rank with its contents on `root`.
    fn broadcast(&self, buf: BufMut<'_>, root: usize) -> Result<()>;

    /// Synchronous send of `buf` to rank `dest`.
    fn send(&self, buf: Buf<'_>, dest: usize, tag: i32) -> Result<()>;

    /// Receive into `buf` from `source` (or [`RECV_ANY_SOURCE`]); returns the
    /// rank the message came from.
    fn recv(&self, buf: BufMut<'_>, source: usize, tag: i32) -> Result<usize>;

    /// Element-wise reduction of `send` across all ranks into `recv`.
    fn all_reduce(&self, send: Buf<'_>, recv: BufMut<'_>, op: AllReduceOp) -> Result<()>;

    /// Shut the group down; later calls fail.
    fn finalize(&self) -> Result<()>;
}

impl dyn ProcessGroup {
    /// Broadcast a vector of any length: the length goes first, then every
    /// rank resizes and receives the payload.
    pub fn broadcast_vec<T: Element>(&self, v: &mut Vec<T>, root: usize) -> Result<()> {
        let mut len = [v.len() as u64];
        self.broadcast(BufMut::U64(&mut len), root)?;
        v.resize(len[0] as usize, T::default());
        self.broadcast(T::buf_mut(v), root)
    }
}

#[derive(Debug)]
enum Payload {
    F32(Vec<f32>),
    U64(Vec<u64>),
}

#[derive(Debug)]
struct Message {
    tag: i32,
    payload: Payload,
}

/// Single-process group: rank 0 of 1, with a loopback message queue.
#[derive(Debug, Default)]
pub struct LocalProcessGroup {
    queue: Mutex<VecDeque<Message>>,
    finalized: AtomicBool,
}

impl LocalProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn alive(&self) -> Result<()> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(Error::Transport("process group already finalized".into()));
        }
        Ok(())
    }

    fn rank_ok(&self, rank: usize, what: &str) -> Result<()> {
        if rank != 0 {
            return Err(Error::Transport(format!(
                "{what} rank {rank} outside a world of size 1"
            )));
        }
        Ok(())
    }
}

fn mismatch(op: &str, got: (&str, usize), want: (&str, usize)) -> Error {
    Error::Transport(format!(
        "{op}: buffer of {} {} elements does not match {} {} elements",
        got.1, got.0, want.1, want.0
    ))
}

impl ProcessGroup for LocalProcessGroup {
    fn my_rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        self.alive()
    }

    fn broadcast(&self, _buf: BufMut<'_>, root: usize) -> Result<()> {
        self.alive()?;
        self.rank_ok(root, "broadcast root")
    }

    fn send(&self, buf: Buf<'_>, dest: usize, tag: i32) -> Result<()> {
        self.alive()?;
        self.rank_ok(dest, "send destination")?;
        let payload = match buf {
            Buf::F32(b) => Payload::F32(b.to_vec()),
            Buf::U64(b) => Payload::U64(b.to_vec()),
        };
        let mut queue = self.queue.lock().map_err(|_| Error::LockPoisoned)?;
        queue.push_back(Message { tag, payload });
        Ok(())
    }

    fn recv(&self, buf: BufMut<'_>, source: usize, tag: i32) -> Result<usize> {
        self.alive()?;
        if source != RECV_ANY_SOURCE {
            self.rank_ok(source, "recv source")?;
        }
        let mut queue = self.queue.lock().map_err(|_| Error::LockPoisoned)?;
        let pos = queue.iter().position(|m| m.tag == tag).ok_or_else(|| {
            Error::Transport(format!("recv: no pending message with tag {tag}"))
        })?;
        let (kind, len) = (buf.kind(), buf.len());
        match (buf, &queue[pos].payload) {
            (BufMut::F32(dst), Payload::F32(src)) if dst.len() == src.len() => {
                dst.copy_from_slice(src)
            }
            (BufMut::U64(dst), Payload::U64(src)) if dst.len() == src.len() => {
                dst.copy_from_slice(src)
            }
            (_, Payload::F32(src)) => return Err(mismatch("recv", (kind, len), ("f32", src.len()))),
            (_, Payload::U64(src)) => return Err(mismatch("recv", (kind, len), ("u64", src.len()))),
        }
        queue.remove(pos);
        Ok(0)
    }

    fn all_reduce(&self, send: Buf<'_>, recv: BufMut<'_>, _op: AllReduceOp) -> Result<()> {
        self.alive()?;
        let (kind, len) = (recv.kind(), recv.len());
        match (send, recv) {
            (Buf::F32(src), BufMut::F32(dst)) if src.len() == dst.len() => {
                dst.copy_from_slice(src)
            }
            (Buf::U64(src), BufMut::U64(dst)) if src.len() == dst.len() => {
                dst.copy_from_slice(src)
            }
            (src, _) => return Err(mismatch("all_reduce", (kind, len), (src.kind(), src.len()))),
        }
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        self.alive()?;
        self.finalized.store(true, Ordering::SeqCst);
        log::debug!("local process group finalized");
        Ok(())
    }
}

/// Start a process group for this process.
///
/// Only the single-process group is available; `multi_threaded` is accepted
/// for callers that will later run collectives from several threads, which
/// the local group always supports.
pub fn init_process_group(multi_threaded: bool) -> Result<Arc<dyn ProcessGroup>> {
    log::debug!("starting local process group (multi_threaded={multi_threaded})");
    Ok(Arc::new(LocalProcessGroup::new()))
}

/// Finalize and release a process group.
pub fn finalize_process_group(group: Arc<dyn ProcessGroup>) -> Result<()> {
    group.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_send_recv() {
        let pg = LocalProcessGroup::new();
        pg.send(Buf::F32(&[1.0, 2.0]), 0, 7).unwrap();
        pg.send(Buf::U64(&[9]), 0, 3).unwrap();

        let mut ids = [0u64];
        assert_eq!(pg.recv(BufMut::U64(&mut ids), RECV_ANY_SOURCE, 3).unwrap(), 0);
        assert_eq!(ids, [9]);

        let mut wrong = [0.0f32; 3];
        assert!(pg.recv(BufMut::F32(&mut wrong), 0, 7).is_err());
        let mut vals = [0.0f32; 2];
        pg.recv(BufMut::F32(&mut vals), 0, 7).unwrap();
        assert_eq!(vals, [1.0, 2.0]);

        assert!(pg.recv(BufMut::F32(&mut vals), 0, 7).is_err());
    }

    #[test]
    fn test_bad_ranks() {
        let pg = LocalProcessGroup::new();
        assert_eq!((pg.my_rank(), pg.world_size()), (0, 1));
        assert!(pg.send(Buf::F32(&[1.0]), 1, 0).is_err());
        let mut v = [0.0f32];
        assert!(pg.broadcast(BufMut::F32(&mut v), 2).is_err());
    }

    #[test]
    fn test_all_reduce_identity() {
        let pg = LocalProcessGroup::new();
        let mut out = [0.0f32; 3];
        pg.all_reduce(Buf::F32(&[1.0, 2.0, 3.0]), BufMut::F32(&mut out), AllReduceOp::Sum)
            .unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);
        let mut short = [0u64; 1];
        assert!(pg
            .all_reduce(Buf::U64(&[1, 2]), BufMut::U64(&mut short), AllReduceOp::Max)
            .is_err());
    }

    #[test]
    fn test_finalize_then_fail() {
        let pg = init_process_group(false).unwrap();
        let mut v = vec![1.0f32, 2.0];
        pg.broadcast_vec(&mut v, 0).unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
        finalize_process_group(pg.clone()).unwrap();
        assert!(pg.barrier().is_err());
        assert!(pg.finalize().is_err());
    }
}
