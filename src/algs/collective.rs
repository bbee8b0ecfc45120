//! Lockstep collectives over a [`Communicator`].
//!
//! Every rank must issue the same sequence of collectives with the same
//! [`SyncPoint`]s. Each message is preceded by a [`WireCount`] header, and
//! every public collective appends its sync point to a trace so that tests
//! can check that all ranks walked the same path. Reductions are evaluated on
//! the root in ascending rank order, which keeps floating-point sums
//! reproducible for a fixed number of ranks.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut, expect_exact_len};
use crate::pit_error::PitError;
use bytemuck::Pod;
use parking_lot::Mutex;
use serde::Serialize;
use std::mem::size_of;

/// Named synchronisation points of one fill/deposit step, in issue order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[repr(u16)]
pub enum SyncPoint {
    GhostPlan = 0,
    AreaExchange,
    FillFingerprint,
    DepressionTotal,
    LabelCounts,
    WatershedExchange,
    EdgeCounts,
    SpillEdges,
    LabelTable,
    SolvedGraph,
    SpillOwners,
    PitVolumes,
    FillExchange,
    DepositFingerprint,
    SedimentVolumes,
    Conservation,
    ElevationExchange,
}

impl SyncPoint {
    /// Message tag reserved for this sync point.
    pub const fn tag(self) -> CommTag {
        CommTag::new(0x5100).offset(self as u16)
    }
}

/// Collective operations bound to one communicator.
pub struct Collective<'a, C> {
    comm: &'a C,
    trace: Mutex<Vec<SyncPoint>>,
}

impl<'a, C: Communicator> Collective<'a, C> {
    pub fn new(comm: &'a C) -> Self {
        Self {
            comm,
            trace: Mutex::new(Vec::new()),
        }
    }

    pub fn comm(&self) -> &'a C {
        self.comm
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size().max(1)
    }

    /// Sync points issued so far, in order.
    pub fn trace(&self) -> Vec<SyncPoint> {
        self.trace.lock().clone()
    }

    pub(crate) fn record(&self, point: SyncPoint) {
        self.trace.lock().push(point);
    }

    // --- point-to-point framing ---------------------------------------------

    pub(crate) fn send_records<T: Pod>(&self, peer: usize, tag: CommTag, data: &[T]) {
        let count = WireCount::new(data.len());
        let _ = self
            .comm
            .isend(peer, tag.as_u16(), cast_slice(std::slice::from_ref(&count)))
            .wait();
        if !data.is_empty() {
            let _ = self.comm.isend(peer, tag.as_u16(), cast_slice(data)).wait();
        }
    }

    pub(crate) fn recv_records<T: Pod>(
        &self,
        peer: usize,
        tag: CommTag,
    ) -> Result<Vec<T>, PitError> {
        let mut count = WireCount::new(0);
        let raw = self
            .comm
            .irecv(
                peer,
                tag.as_u16(),
                cast_slice_mut(std::slice::from_mut(&mut count)),
            )
            .wait()
            .ok_or_else(|| PitError::CommError {
                neighbor: peer,
                source: format!("no size header from rank {peer}").into(),
            })?;
        expect_exact_len(raw.len(), size_of::<WireCount>()).map_err(|e| PitError::CommError {
            neighbor: peer,
            source: e.into(),
        })?;
        cast_slice_mut(std::slice::from_mut(&mut count)).copy_from_slice(&raw);

        let mut out = vec![T::zeroed(); count.get()];
        if out.is_empty() {
            return Ok(out);
        }
        let expected = out.len() * size_of::<T>();
        let raw = self
            .comm
            .irecv(peer, tag.as_u16(), cast_slice_mut(&mut out))
            .wait()
            .ok_or_else(|| PitError::CommError {
                neighbor: peer,
                source: format!("no payload from rank {peer}").into(),
            })?;
        if raw.len() != expected {
            return Err(PitError::BufferSizeMismatch {
                neighbor: peer,
                expected,
                got: raw.len(),
            });
        }
        cast_slice_mut(&mut out).copy_from_slice(&raw);
        Ok(out)
    }

    /// Pairwise exchange with one peer: the lower rank sends first.
    pub(crate) fn swap<T: Pod>(
        &self,
        peer: usize,
        tag: CommTag,
        data: &[T],
    ) -> Result<Vec<T>, PitError> {
        if self.rank() < peer {
            self.send_records(peer, tag, data);
            self.recv_records(peer, tag)
        } else {
            // receive first, but always answer so the peer never stalls
            let got = self.recv_records(peer, tag);
            self.send_records(peer, tag, data);
            got
        }
    }

    // --- untraced building blocks -------------------------------------------

    fn gather_inner<T: Pod>(
        &self,
        tag: CommTag,
        root: usize,
        local: &[T],
    ) -> Result<Option<Vec<Vec<T>>>, PitError> {
        if self.rank() != root {
            self.send_records(root, tag, local);
            return Ok(None);
        }
        let mut parts = Vec::with_capacity(self.size());
        let mut maybe_err = None;
        for r in 0..self.size() {
            if r == root {
                parts.push(local.to_vec());
                continue;
            }
            // drain every rank even after a failure
            match self.recv_records(r, tag) {
                Ok(part) => parts.push(part),
                Err(e) => {
                    maybe_err.get_or_insert(e);
                    parts.push(Vec::new());
                }
            }
        }
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(Some(parts)),
        }
    }

    fn broadcast_inner<T: Pod>(
        &self,
        tag: CommTag,
        root: usize,
        data: &[T],
    ) -> Result<Vec<T>, PitError> {
        if self.rank() == root {
            for r in (0..self.size()).filter(|&r| r != root) {
                self.send_records(r, tag, data);
            }
            Ok(data.to_vec())
        } else {
            self.recv_records(root, tag)
        }
    }

    fn reduce_inner<T, F>(
        &self,
        tag: CommTag,
        root: usize,
        local: &[T],
        op: F,
    ) -> Result<Option<Vec<T>>, PitError>
    where
        T: Pod,
        F: Fn(&mut T, &T),
    {
        let Some(parts) = self.gather_inner(tag, root, local)? else {
            return Ok(None);
        };
        let mut acc = local.to_vec();
        for (r, part) in parts.iter().enumerate() {
            if r == root {
                continue;
            }
            if part.len() != acc.len() {
                return Err(PitError::BufferSizeMismatch {
                    neighbor: r,
                    expected: acc.len() * size_of::<T>(),
                    got: part.len() * size_of::<T>(),
                });
            }
            for (a, b) in acc.iter_mut().zip(part) {
                op(a, b);
            }
        }
        Ok(Some(acc))
    }

    // --- public collectives -------------------------------------------------

    /// Broadcast `data` from `root`; the argument is ignored on other ranks.
    pub fn broadcast<T: Pod>(
        &self,
        point: SyncPoint,
        root: usize,
        data: &[T],
    ) -> Result<Vec<T>, PitError> {
        self.record(point);
        self.broadcast_inner(point.tag(), root, data)
    }

    /// Element-wise reduction onto `root`. All ranks must pass equal lengths.
    pub fn reduce<T, F>(
        &self,
        point: SyncPoint,
        root: usize,
        local: &[T],
        op: F,
    ) -> Result<Option<Vec<T>>, PitError>
    where
        T: Pod,
        F: Fn(&mut T, &T),
    {
        self.record(point);
        self.reduce_inner(point.tag(), root, local, op)
    }

    /// Element-wise reduction whose result is returned on every rank.
    pub fn allreduce<T, F>(&self, point: SyncPoint, local: &[T], op: F) -> Result<Vec<T>, PitError>
    where
        T: Pod,
        F: Fn(&mut T, &T),
    {
        self.record(point);
        let tag = point.tag();
        let total = match self.reduce_inner(tag, 0, local, op) {
            Ok(Some(total)) => self.broadcast_inner(tag, 0, &total)?,
            Ok(None) => self.broadcast_inner(tag, 0, &[])?,
            Err(e) => {
                // release the waiting ranks before failing
                self.broadcast_inner::<T>(tag, 0, &[])?;
                return Err(e);
            }
        };
        if total.len() != local.len() {
            return Err(PitError::BufferSizeMismatch {
                neighbor: 0,
                expected: local.len() * size_of::<T>(),
                got: total.len() * size_of::<T>(),
            });
        }
        Ok(total)
    }

    /// Every rank receives every rank's slice, indexed by rank.
    pub fn allgather<T: Pod>(
        &self,
        point: SyncPoint,
        local: &[T],
    ) -> Result<Vec<Vec<T>>, PitError> {
        self.record(point);
        let tag = point.tag();
        let gathered = self.gather_inner(tag, 0, local);
        let (counts, flat) = match &gathered {
            Ok(Some(parts)) => (
                parts.iter().map(|p| p.len() as u64).collect::<Vec<_>>(),
                parts.iter().flatten().copied().collect::<Vec<_>>(),
            ),
            _ => (Vec::new(), Vec::new()),
        };
        let counts = self.broadcast_inner(tag, 0, &counts)?;
        let flat = self.broadcast_inner(tag, 0, &flat)?;
        gathered?;
        if counts.len() != self.size() {
            return Err(PitError::BufferSizeMismatch {
                neighbor: 0,
                expected: self.size() * size_of::<u64>(),
                got: counts.len() * size_of::<u64>(),
            });
        }
        let mut out = Vec::with_capacity(counts.len());
        let mut at = 0usize;
        for &n in &counts {
            let end = at + n as usize;
            let part = flat.get(at..end).ok_or(PitError::BufferSizeMismatch {
                neighbor: 0,
                expected: end * size_of::<T>(),
                got: flat.len() * size_of::<T>(),
            })?;
            out.push(part.to_vec());
            at = end;
        }
        Ok(out)
    }

    pub fn allreduce_sum_f64(&self, point: SyncPoint, local: &[f64]) -> Result<Vec<f64>, PitError> {
        self.allreduce(point, local, |a, b| *a += *b)
    }

    pub fn allreduce_sum_u64(&self, point: SyncPoint, local: &[u64]) -> Result<Vec<u64>, PitError> {
        self.allreduce(point, local, |a, b| *a += *b)
    }

    pub fn allreduce_max_i64(&self, point: SyncPoint, local: &[i64]) -> Result<Vec<i64>, PitError> {
        self.allreduce(point, local, |a, b| *a = (*a).max(*b))
    }

    /// Agree on a step fingerprint and on the health of every rank's input.
    ///
    /// All ranks return an error if any rank's `status` is an error or if
    /// the fingerprints differ, so a bad input never leaves a rank stranded
    /// in a later collective.
    pub fn fingerprint(
        &self,
        point: SyncPoint,
        value: u64,
        status: Result<(), PitError>,
    ) -> Result<(), PitError> {
        let row = [value, u64::from(status.is_ok())];
        let all = self.allgather(point, &[row])?;
        status?;
        for (rank, rows) in all.iter().enumerate() {
            let [fp, ok] = rows.first().copied().unwrap_or([u64::MAX, 0]);
            if ok == 0 {
                return Err(PitError::PeerFailed { rank, point });
            }
            if fp != value {
                return Err(PitError::FingerprintMismatch {
                    point,
                    rank,
                    expected: value,
                    got: fp,
                });
            }
        }
        Ok(())
    }
}
