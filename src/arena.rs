// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The arena and its segments.
//!
//! The arena is the single owner of every segment and trace; pools own
//! only their segments' per-class payloads, keeping per-class data in enum
//! arms rather than subclassing. Everything here is reached through one
//! `parking_lot::Mutex<ArenaInner>`, serializing collector state under a
//! single region lock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use log::{debug, info, trace as log_trace};
use parking_lot::Mutex;

use crate::ap::ApRecord;
use crate::bittable::BitTable;
use crate::config::{ArenaConfig, DebugFlags};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::pool::{PoolClass, PoolRecord};
use crate::root::RootRecord;
use crate::shield::{desired_protection, Shield, ShieldState};
use crate::slab::{Slab, SlabId};
use crate::thread::{ThreadId, ThreadRegistration, ThreadRoots};
use crate::trace::{Trace, TraceState, MAX_TRACES};
use crate::types::{Addr, RankSet};
use crate::vm::{HeapVm, Protection, VmArena};

pub type PoolId = SlabId;
pub type RootId = SlabId;
pub type SegId = SlabId;
pub type ApId = SlabId;
pub type TraceId = usize;

/// Per-class segment payload: an enum whose arms hold class-specific
/// fields.
pub enum SegmentPayload {
    Ams(AmsSegment),
    Snc(SncSegment),
}

/// The three per-grain bit tables AMS/AWL use to derive colour: `alloc`,
/// `mark`, `scanned`.
pub struct AmsSegment {
    pub alloc: BitTable,
    pub mark: BitTable,
    pub scanned: BitTable,
    pub grains: usize,
    /// Bump index used while the segment is "fresh" (alloc table not yet
    /// needed because every grain below `first_free` is known allocated).
    pub first_free: usize,
    /// AWL's per-segment single-access budget, consumed by barrier-hit
    /// single-reference scans. Unused by plain AMS.
    pub single_access_used: usize,
}

impl AmsSegment {
    pub fn new(grains: usize) -> Self {
        AmsSegment {
            alloc: BitTable::new(grains),
            mark: BitTable::new(grains),
            scanned: BitTable::new(grains),
            grains,
            first_free: 0,
            single_access_used: 0,
        }
    }
}

/// SNC carries no per-object colour; segments are simply live (attached to
/// some buffer's chain) or free (on the pool's free list).
pub struct SncSegment {
    pub in_use: bool,
}

/// A contiguous, grain-aligned region of arena address space owned by
/// exactly one pool.
pub struct Segment {
    pub pool: PoolId,
    pub base: Addr,
    pub limit: Addr,
    pub rank_set: RankSet,
    /// Conservative bounding box of reference destinations written from
    /// this segment, standing in for a full remembered set.
    pub summary: Option<(Addr, Addr)>,
    /// At most one trace may condemn (whiten) a segment at a time
    /// (the single-white invariant).
    pub white: Option<TraceId>,
    /// A segment may be grey for any number of traces simultaneously; one
    /// bit per trace slot, `MAX_TRACES` being small and fixed.
    pub grey_mask: u8,
    pub shield: ShieldState,
    pub payload: SegmentPayload,
    /// Range currently covered by an attached allocation buffer; exempt
    /// from whiten and always treated as black/unscannable.
    pub buffered: Option<(Addr, Addr)>,
    pub generation: usize,
    pub seq: usize,
}

impl Segment {
    pub fn grains(&self) -> usize {
        match &self.payload {
            SegmentPayload::Ams(ams) => ams.grains,
            SegmentPayload::Snc(_) => 0,
        }
    }

    pub fn is_grey_for(&self, trace: TraceId) -> bool {
        self.grey_mask & (1 << trace) != 0
    }

    pub fn set_grey_for(&mut self, trace: TraceId, grey: bool) {
        if grey {
            self.grey_mask |= 1 << trace;
        } else {
            self.grey_mask &= !(1 << trace);
        }
    }

    pub fn is_white_for(&self, trace: TraceId) -> bool {
        self.white == Some(trace)
    }

    pub fn grey_for_any_flipped(&self, flipped: u8) -> bool {
        self.grey_mask & flipped != 0
    }
}

pub struct ArenaInner {
    pub grain_size: usize,
    pub vm: Box<dyn VmArena>,
    pub segments: Slab<Segment>,
    /// Segment base address -> id, enabling an O(log n) point query.
    pub by_base: BTreeMap<Addr, SegId>,
    pub pools: Slab<PoolRecord>,
    pub roots: Slab<RootRecord>,
    pub aps: Slab<ApRecord>,
    pub traces: [Option<Trace>; MAX_TRACES],
    /// Bitmask of trace slots currently in the FLIPPED state.
    pub flipped: u8,
    /// Incremented once per [`crate::trace::flip`]; an allocation point
    /// snapshots this at `reserve` and checks it again at `commit` to
    /// detect an intervening flip.
    pub flip_epoch: u64,
    pub messages: VecDeque<Message>,
    pub threads: Slab<ThreadRegistration>,
    pub parked: bool,
    pub shield: Shield,
    pub next_seq: usize,
    pub debug: DebugFlags,
}

impl ArenaInner {
    /// Rounds `size` up to a multiple of the arena's grain size.
    pub fn round_up_to_grain(&self, size: usize) -> usize {
        let g = self.grain_size;
        (size + g - 1) / g * g
    }

    /// O(log n) point query: the segment owning `addr`, if any.
    pub fn segment_containing(&self, addr: Addr) -> Option<SegId> {
        let (_, &id) = self.by_base.range(..=addr).next_back()?;
        let seg = self.segments.get(id)?;
        if addr >= seg.base && addr < seg.limit {
            Some(id)
        } else {
            None
        }
    }

    pub fn has_addr(&self, addr: Addr) -> bool {
        if addr == 0 {
            return false;
        }
        self.segment_containing(addr).is_some()
    }

    /// Allocates a fresh segment of at least `size` bytes for `pool`,
    /// rounded up to the grain size. Returns `Error::Memory` if the
    /// reservation is exhausted.
    pub fn allocate_segment(
        &mut self,
        pool: PoolId,
        size: usize,
        rank_set: RankSet,
        class: PoolClass,
    ) -> Result<SegId> {
        let size = self.round_up_to_grain(size.max(self.grain_size));
        let base = self.find_free_region(size).ok_or(Error::Memory)?;
        let grains = size / self.grain_size;
        let payload = match class {
            PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl => {
                SegmentPayload::Ams(AmsSegment::new(grains))
            }
            PoolClass::Snc => SegmentPayload::Snc(SncSegment { in_use: true }),
            PoolClass::Amc | PoolClass::Amcz => return Err(Error::Unimplemented),
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        let seg = Segment {
            pool,
            base,
            limit: base + size,
            rank_set,
            summary: None,
            white: None,
            grey_mask: 0,
            shield: ShieldState::default(),
            payload,
            buffered: None,
            generation: 0,
            seq,
        };
        let id = self.segments.insert(seg);
        self.by_base.insert(base, id);
        log_trace!("arena: allocated segment {:?} [{:#x}, {:#x})", id, base, base + size);
        Ok(id)
    }

    /// Finds a gap of `size` bytes not currently occupied by any segment.
    /// Linear in the number of segments; acceptable since segment counts
    /// are small relative to grain counts (the hot point-query path is the
    /// `by_base` B-tree above).
    fn find_free_region(&self, size: usize) -> Option<Addr> {
        let vm_base = self.vm.base();
        let vm_limit = self.vm.limit();
        let mut occupied: Vec<(Addr, Addr)> = self
            .segments
            .iter()
            .map(|(_, s)| (s.base, s.limit))
            .collect();
        occupied.sort_unstable();
        let mut cursor = vm_base;
        for (base, limit) in occupied {
            if base.saturating_sub(cursor) >= size {
                return Some(cursor);
            }
            cursor = cursor.max(limit);
        }
        if vm_limit.saturating_sub(cursor) >= size {
            Some(cursor)
        } else {
            None
        }
    }

    /// Frees a segment's address range back to the arena. The caller must
    /// have already ensured the segment holds no live objects (reclaim) or
    /// is otherwise safe to discard (SNC frame pop).
    pub fn free_segment(&mut self, id: SegId) -> Result<()> {
        let seg = self.segments.remove(id).ok_or(Error::Param)?;
        self.by_base.remove(&seg.base);
        debug!("arena: freed segment {:?} [{:#x}, {:#x})", id, seg.base, seg.limit);
        Ok(())
    }

    pub fn segment(&self, id: SegId) -> Result<&Segment> {
        self.segments.get(id).ok_or(Error::Param)
    }

    pub fn segment_mut(&mut self, id: SegId) -> Result<&mut Segment> {
        self.segments.get_mut(id).ok_or(Error::Param)
    }

    pub fn ap(&self, id: ApId) -> Result<&ApRecord> {
        self.aps.get(id).ok_or(Error::Param)
    }

    pub fn ap_mut(&mut self, id: ApId) -> Result<&mut ApRecord> {
        self.aps.get_mut(id).ok_or(Error::Param)
    }

    /// Segments in ascending address order.
    pub fn segments_in_address_order(&self) -> Vec<SegId> {
        self.by_base.values().copied().collect()
    }

    pub fn segments_of_pool(&self, pool: PoolId) -> Vec<SegId> {
        self.segments
            .iter()
            .filter(|(_, s)| s.pool == pool)
            .map(|(id, _)| id)
            .collect()
    }

    /// Recomputes and (logically) realizes the desired protection of
    /// `seg`, queuing through the shield rather than applying immediately.
    pub fn update_shield(&mut self, id: SegId) {
        let flipped = self.flipped;
        let (idx, has_rank, grey, white, buffered) = {
            let seg = match self.segments.get(id) {
                Some(s) => s,
                None => return,
            };
            (
                id.0,
                seg.rank_set != RankSet::empty(),
                seg.grey_for_any_flipped(flipped),
                seg.white.is_some(),
                seg.buffered.is_some(),
            )
        };
        if buffered {
            // The tail above an allocation point's `init` is uninitialized;
            // the shield must never read-protect it regardless of colour.
            let full = self.shield.queue(idx, Protection::ReadWrite);
            if full {
                self.flush_shield();
            }
            return;
        }
        let desired = desired_protection(has_rank, grey, white);
        let full = self.shield.queue(idx, desired);
        if !full {
            return;
        }
        self.flush_shield();
    }

    /// Realizes every queued protection change. Called when the shield's
    /// bounded cache fills, and on arena entry/exit.
    pub fn flush_shield(&mut self) {
        for (idx, prot) in self.shield.drain() {
            if let Some(seg) = self.segments.get_mut(SlabId(idx)) {
                if seg.shield.expose_depth == 0 {
                    seg.shield.effective = Some(prot);
                }
            }
        }
    }

    /// Lifts all protection on `seg` while the returned guard is alive.
    /// Nestable; the desired protection is only re-queued once the
    /// outermost guard drops.
    pub fn expose(&mut self, id: SegId) -> Result<()> {
        let seg = self.segment_mut(id)?;
        seg.shield.expose_depth += 1;
        seg.shield.effective = Some(Protection::ReadWrite);
        Ok(())
    }

    pub fn cover(&mut self, id: SegId) -> Result<()> {
        {
            let seg = self.segment_mut(id)?;
            seg.shield.expose_depth = seg.shield.expose_depth.saturating_sub(1);
        }
        if self.segment(id)?.shield.expose_depth == 0 {
            self.update_shield(id);
        }
        Ok(())
    }

    /// Scoped form of `expose`/`cover`, with guaranteed release on all
    /// exit paths: the returned guard's `Drop` calls `cover` no matter how
    /// the caller's scope ends, so a `?` early return from the scanning or
    /// fixing done through `inner_mut()` can never leave a segment
    /// exposed.
    pub fn expose_scoped(&mut self, id: SegId) -> Result<ExposeGuard<'_>> {
        self.expose(id)?;
        Ok(ExposeGuard { inner: self, seg: id })
    }

    pub fn push_message(&mut self, msg: Message) {
        info!("arena: message {:?}", msg);
        self.messages.push_back(msg);
    }
}

/// The arena: a reserved virtual address space split into grains, the set
/// of pools and roots living in it, and the traces currently in progress.
pub struct Arena {
    inner: Mutex<ArenaInner>,
}

impl Arena {
    /// Creates a new arena per `config`.
    pub fn create(config: ArenaConfig) -> Result<Arc<Arena>> {
        if config.arena_grain_size == 0 || !config.arena_grain_size.is_power_of_two() {
            return Err(Error::Param);
        }
        if config.arena_size == 0 {
            return Err(Error::Param);
        }
        let vm = HeapVm::reserve(config.arena_size)?;
        let inner = ArenaInner {
            grain_size: config.arena_grain_size,
            vm: Box::new(vm),
            segments: Slab::new(),
            by_base: BTreeMap::new(),
            pools: Slab::new(),
            roots: Slab::new(),
            aps: Slab::new(),
            traces: core::array::from_fn(|_| None),
            flipped: 0,
            flip_epoch: 0,
            messages: VecDeque::new(),
            threads: Slab::new(),
            parked: true,
            shield: Shield::new(64),
            next_seq: 0,
            debug: config.debug,
        };
        info!(
            "arena: created, size={} grain_size={}",
            config.arena_size, config.arena_grain_size
        );
        Ok(Arc::new(Arena {
            inner: Mutex::new(inner),
        }))
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, ArenaInner> {
        self.inner.lock()
    }

    /// `arenaPark`: blocks (synchronously, in this single-threaded core)
    /// until no trace is in progress, finishing any in-flight trace's
    /// current step so callers of `formattedObjectsWalk`/`rootsWalk` see a
    /// quiescent arena.
    pub fn park(self: &Arc<Self>) -> Result<()> {
        loop {
            let busy = {
                let inner = self.lock();
                inner.traces.iter().any(|t| t.is_some())
            };
            if !busy {
                break;
            }
            self.step(usize::MAX)?;
        }
        self.lock().parked = true;
        Ok(())
    }

    /// `arenaRelease`: the inverse of `park`, permitting mutator activity
    /// (including new traces) again.
    pub fn release(self: &Arc<Self>) {
        self.lock().parked = false;
    }

    /// Advances every busy trace by one state transition (or one scanning
    /// quantum of `budget` bytes each), retiring any that finish. Returns
    /// `true` once no trace remains busy; driven one quantum per call so
    /// the mutator's pause is bounded.
    pub fn step(self: &Arc<Self>, budget: usize) -> Result<bool> {
        let mut inner = self.lock();
        let slots: Vec<TraceId> = (0..MAX_TRACES)
            .filter(|&t| inner.traces[t].is_some())
            .collect();
        let mut all_done = true;
        for id in slots {
            if !crate::trace::advance(&mut inner, id, budget)? {
                all_done = false;
            }
        }
        Ok(all_done)
    }

    /// Begins a trace condemning every currently registered pool without
    /// driving it to completion: the caller advances it with repeated
    /// `step` calls, with arbitrary mutator activity -- including an AWL
    /// pool's `barrier_hit` -- in between. `collect` is this plus driving
    /// to completion in one call.
    pub fn collect_begin(self: &Arc<Self>, reason: &str) -> Result<()> {
        let mut inner = self.lock();
        let pools: Vec<PoolId> = inner.pools.iter().map(|(id, _)| id).collect();
        crate::trace::begin(&mut inner, reason.to_string(), pools)?;
        Ok(())
    }

    /// `arenaCollect`: begins a trace condemning every pool and drives it
    /// to completion, blocking the caller.
    pub fn collect(self: &Arc<Self>, reason: &str) -> Result<()> {
        self.collect_begin(reason)?;
        loop {
            if self.step(usize::MAX)? {
                return Ok(());
            }
        }
    }

    pub fn is_parked(self: &Arc<Self>) -> bool {
        self.lock().parked
    }

    pub fn committed(self: &Arc<Self>) -> usize {
        let inner = self.lock();
        inner.segments.iter().map(|(_, s)| s.limit - s.base).sum()
    }

    pub fn has_addr(self: &Arc<Self>, addr: Addr) -> bool {
        self.lock().has_addr(addr)
    }

    pub fn message_count(self: &Arc<Self>) -> usize {
        self.lock().messages.len()
    }

    /// `threadReg`: registers a mutator thread's ambiguous roots, scanned
    /// by every trace's `flip` from then on until [`Arena::thread_dereg`].
    pub fn thread_reg(self: &Arc<Self>, roots: Box<dyn ThreadRoots>) -> ThreadId {
        self.lock().threads.insert(ThreadRegistration { roots })
    }

    /// `threadDereg`: the inverse of `thread_reg`.
    pub fn thread_dereg(self: &Arc<Self>, id: ThreadId) -> Result<()> {
        self.lock().threads.remove(id).map(|_| ()).ok_or(Error::Param)
    }
}

/// Guard returned by [`ArenaInner::expose_scoped`]; see that method.
pub struct ExposeGuard<'a> {
    inner: &'a mut ArenaInner,
    seg: SegId,
}

impl<'a> ExposeGuard<'a> {
    pub fn inner_mut(&mut self) -> &mut ArenaInner {
        self.inner
    }
}

impl<'a> Drop for ExposeGuard<'a> {
    fn drop(&mut self) {
        let _ = self.inner.cover(self.seg);
    }
}

static_assertions::const_assert!(MAX_TRACES <= 8);
