// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The trace (collection cycle) state machine.
//!
//! A trace moves through `INIT -> UNFLIPPED -> FLIPPED -> FINISHED`;
//! [`crate::arena::Arena::step`] drives one
//! trace one state transition (or one scanning quantum) per call, so the
//! whole machine is resumable and the mutator is never blocked longer than
//! one quantum.

use std::collections::VecDeque;

use log::{debug, info};

use crate::arena::{ArenaInner, PoolId, SegId};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::pool::{self, PoolClass, PoolRecord};
use crate::root::ScanState;
use crate::types::Rank;

pub type TraceId = usize;

/// At most this many traces may be busy at once. A segment's grey-for-
/// trace mask and the arena's flipped mask are both a `u8`, so this is a
/// hard upper bound, not just a tuning knob.
pub const MAX_TRACES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Init,
    Unflipped,
    Flipped,
    Finished,
}

/// A collection cycle in progress.
pub struct Trace {
    pub state: TraceState,
    pub reason: String,
    pub clock: u64,
    pub condemned_size: usize,
    pub reclaimed_size: usize,
    /// Count of objects preserved in place by [`pool::blacken`], not a
    /// byte count.
    pub preserved_in_place: usize,
    pub ambiguous_fixes: bool,
    /// Set when mid-trace allocation has failed; pool `fix` methods must
    /// switch to their non-allocating emergency path.
    pub emergency: bool,
    /// AWL's `totalSALimit` counter: barrier-provoked single-reference
    /// scans across every segment, this trace.
    pub single_access_used: usize,
    pub condemned: Vec<(PoolId, SegId)>,
    pub pools: Vec<PoolId>,
    /// A cheap bounding box over every condemned segment's address range,
    /// used as the fix protocol's stage-1 "white-zone mask" test before
    /// the more expensive segment lookup.
    white_zone: Option<(usize, usize)>,
    grey_queue: VecDeque<(PoolId, SegId)>,
}

impl Trace {
    fn new(reason: String, clock: u64, pools: Vec<PoolId>) -> Self {
        Trace {
            state: TraceState::Init,
            reason,
            clock,
            condemned_size: 0,
            reclaimed_size: 0,
            preserved_in_place: 0,
            ambiguous_fixes: false,
            emergency: false,
            single_access_used: 0,
            condemned: Vec::new(),
            pools,
            white_zone: None,
            grey_queue: VecDeque::new(),
        }
    }

    /// Enqueues `(pool, seg)` for scanning: either the segment is
    /// transitioning from not-grey to grey for this trace, or a scan pass
    /// left it still grey and it needs revisiting. A segment already
    /// queued may be queued again; `scan_step` drops stale entries whose
    /// segment turned out not to be grey by the time they are dequeued.
    pub fn enqueue_grey(&mut self, pool: PoolId, seg: SegId) {
        self.grey_queue.push_back((pool, seg));
    }

    fn dequeue_grey(&mut self) -> Option<(PoolId, SegId)> {
        self.grey_queue.pop_front()
    }

    pub fn has_grey(&self) -> bool {
        !self.grey_queue.is_empty()
    }

    fn extend_white_zone(&mut self, base: usize, limit: usize) {
        self.white_zone = Some(match self.white_zone {
            Some((lo, hi)) => (lo.min(base), hi.max(limit)),
            None => (base, limit),
        });
    }

    /// Stage 1 of the fix protocol: a cheap reject
    /// of any candidate reference that cannot possibly land in this
    /// trace's condemned set.
    pub fn in_white_zone(&self, addr: usize) -> bool {
        match self.white_zone {
            Some((lo, hi)) => addr >= lo && addr < hi,
            None => false,
        }
    }
}

/// Which generations of a pool are due for condemning: a
/// generation is due once its freshly allocated size meets its configured
/// capacity, provided its configured mortality is nonzero (zero mortality
/// is the client's way of saying "never worth condemning this generation
/// on its own" -- so no default mortality threshold is invented beyond
/// what the client configures).
fn due_generations(pool: &PoolRecord) -> Vec<usize> {
    pool.generations
        .iter()
        .enumerate()
        .filter(|(_, g)| g.mortality > 0.0 && g.new_size >= g.capacity)
        .map(|(i, _)| i)
        .collect()
}

/// INIT: claims a trace slot, or fails with `Error::Limit` if the busy
/// set of at most [`MAX_TRACES`] is full.
pub fn begin(inner: &mut ArenaInner, reason: String, pools: Vec<PoolId>) -> Result<TraceId> {
    let slot = inner
        .traces
        .iter()
        .position(|t| t.is_none())
        .ok_or(Error::Limit)?;
    let clock = inner.next_seq as u64;
    inner.next_seq += 1;
    info!("trace {}: begin ({})", slot, reason);
    inner.push_message(Message::GcStart {
        reason: reason.clone(),
        clock,
    });
    inner.traces[slot] = Some(Trace::new(reason, clock, pools));
    Ok(slot)
}

/// UNFLIPPED: chooses the condemn set leaves-first, whitens it, and greys
/// every root-adjacent (non-condemned) segment of a participating pool so
/// its live objects act as extra roots into the condemned set.
pub fn condemn(inner: &mut ArenaInner, id: TraceId) -> Result<()> {
    let pools = inner
        .traces
        .get(id)
        .and_then(|t| t.as_ref())
        .ok_or(Error::Param)?
        .pools
        .clone();
    let mut condemned_segs: Vec<(PoolId, SegId)> = Vec::new();

    for pool_id in &pools {
        let class = match inner.pools.get(*pool_id) {
            Some(r) => r.class,
            None => continue,
        };
        if !matches!(class, PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl) {
            continue; // SNC never condemns; unimplemented classes are skipped.
        }
        let (due_segs, due_gens): (Vec<SegId>, Vec<usize>) = {
            let rec = inner.pools.get(*pool_id).unwrap();
            if rec.generations.is_empty() {
                // No configured chain: the whole pool is one generation.
                (rec.segments.clone(), Vec::new())
            } else {
                let due_gens = due_generations(rec);
                let segs = due_gens
                    .iter()
                    .flat_map(|&g| rec.generations[g].segments.clone())
                    .collect();
                (segs, due_gens)
            }
        };
        for seg in &due_segs {
            condemned_segs.push((*pool_id, *seg));
        }
        if let Some(rec) = inner.pools.get_mut(*pool_id) {
            for g in due_gens {
                rec.generations[g].new_size = 0;
            }
        }
    }

    if condemned_segs.is_empty() {
        debug!("trace {}: condemn set empty", id);
    }

    if inner.debug.whiten_phase {
        for (pool_id, seg) in &condemned_segs {
            pool::whiten(inner, *pool_id, *seg, id)?;
            let (base, limit) = {
                let s = inner.segment(*seg)?;
                (s.base, s.limit)
            };
            if let Some(t) = inner.traces[id].as_mut() {
                t.extend_white_zone(base, limit);
            }
        }
    } else {
        debug!("trace {}: whiten phase disabled, condemned set left unwhitened", id);
    }

    let condemned_ids: std::collections::HashSet<SegId> =
        condemned_segs.iter().map(|(_, s)| *s).collect();
    for pool_id in &pools {
        let class = match inner.pools.get(*pool_id) {
            Some(r) => r.class,
            None => continue,
        };
        if !matches!(class, PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl) {
            continue;
        }
        for seg in inner.segments_of_pool(*pool_id) {
            if !condemned_ids.contains(&seg) {
                pool::grey(inner, *pool_id, seg, id)?;
            }
        }
    }

    if let Some(t) = inner.traces[id].as_mut() {
        t.condemned = condemned_segs;
        t.state = TraceState::Unflipped;
    }
    Ok(())
}

/// FLIPPED: updates arena-wide shield protections and scans every
/// registered root once, seeding the grey work-queue with whatever they
/// reference in the condemned set.
pub fn flip(inner: &mut ArenaInner, id: TraceId) -> Result<()> {
    inner.flipped |= 1 << id;
    inner.flip_epoch += 1;

    let root_ids: Vec<_> = inner.roots.iter().map(|(rid, _)| rid).collect();
    for rid in root_ids {
        let (rank, words) = {
            let rec = inner.roots.get(rid).ok_or(Error::Param)?;
            (rec.rank, rec.candidate_words())
        };
        let mut ss = ScanState::new_normal(inner, id, rank);
        for w in words {
            ss.fix_value(w)?;
        }
    }

    let thread_words: Vec<Vec<usize>> = inner
        .threads
        .iter()
        .map(|(_, t)| t.roots.ambiguous_words())
        .collect();
    for words in thread_words {
        let mut ss = ScanState::new_normal(inner, id, Rank::Ambiguous);
        for w in words {
            ss.fix_value(w)?;
        }
    }

    for seg in inner.segments_in_address_order() {
        inner.update_shield(seg);
    }

    if let Some(t) = inner.traces[id].as_mut() {
        t.state = TraceState::Flipped;
    }
    info!("trace {}: flipped", id);
    Ok(())
}

fn expose_scan_cover(inner: &mut ArenaInner, pool_id: PoolId, seg: SegId, id: TraceId) -> Result<()> {
    let mut guard = inner.expose_scoped(seg)?;
    pool::scan(guard.inner_mut(), pool_id, seg, id)
}

/// One incremental scanning quantum, chunked by the trace's incremental
/// budget. Drains the grey work-queue until
/// either `budget` bytes have been scanned or the queue runs dry. Returns
/// `true` at fixed point: no grey remains for this trace.
pub fn scan_step(inner: &mut ArenaInner, id: TraceId, budget: usize) -> Result<bool> {
    if !inner.debug.scan_phase {
        debug!("trace {}: scan phase disabled, grey queue left undrained", id);
        return Ok(true);
    }
    let mut remaining = budget;
    loop {
        let next = match inner.traces[id].as_mut() {
            Some(t) => t.dequeue_grey(),
            None => return Err(Error::Param),
        };
        let (pool_id, seg) = match next {
            Some(x) => x,
            None => return Ok(true),
        };
        let still_grey = inner.segment(seg).map(|s| s.is_grey_for(id)).unwrap_or(false);
        if !still_grey {
            // Already fully scanned via some other path (e.g. emergency
            // blacken); drop this stale queue entry.
            continue;
        }
        let size = inner.segment(seg).map(|s| s.limit - s.base).unwrap_or(0);
        expose_scan_cover(inner, pool_id, seg, id)?;
        remaining = remaining.saturating_sub(size.max(1));
        if remaining == 0 {
            let more = inner.traces[id].as_ref().map_or(false, |t| t.has_grey());
            return Ok(!more);
        }
    }
}

/// FINISHED: reclaims every condemned segment, reports the `gc` message
/// with the condemned/not-condemned/live byte accounting, and retires the
/// trace.
pub fn finish(inner: &mut ArenaInner, id: TraceId) -> Result<()> {
    let (condemned, clock, condemned_size, trace_pools) = match inner.traces[id].as_ref() {
        Some(t) => (t.condemned.clone(), t.clock, t.condemned_size, t.pools.clone()),
        None => return Err(Error::Param),
    };

    let mut reclaimed = 0usize;
    let mut preserved = 0usize;
    if inner.debug.reclaim_phase {
        for (pool_id, seg) in &condemned {
            let (r, p) = pool::reclaim(inner, *pool_id, *seg, id)?;
            reclaimed += r;
            preserved += p;
        }
    } else {
        debug!("trace {}: reclaim phase disabled, condemned set left unreclaimed", id);
    }

    let not_condemned: usize = trace_pools
        .iter()
        .map(|pid| pool::total_size(inner, *pid))
        .sum::<usize>()
        .saturating_sub(condemned_size);

    inner.flipped &= !(1 << id);
    for (_, seg) in &condemned {
        inner.update_shield(*seg);
    }

    if let Some(t) = inner.traces[id].as_mut() {
        t.reclaimed_size = reclaimed;
        t.state = TraceState::Finished;
    }
    inner.push_message(Message::Gc {
        live: preserved,
        condemned: condemned_size,
        not_condemned,
        clock,
    });
    info!(
        "trace {}: finished, reclaimed={} preserved={}",
        id, reclaimed, preserved
    );
    inner.traces[id] = None;
    Ok(())
}

/// Forces (or clears) emergency mode on a trace: pool `fix` methods check
/// this flag to switch to a non-allocating path.
/// Exposed so callers (and tests) can simulate a mid-trace allocation
/// failure, since this crate's own bookkeeping allocations do not
/// realistically fail.
pub fn set_emergency(inner: &mut ArenaInner, id: TraceId, emergency: bool) -> Result<()> {
    inner
        .traces
        .get_mut(id)
        .and_then(|t| t.as_mut())
        .ok_or(Error::Param)?
        .emergency = emergency;
    Ok(())
}

/// Advances one trace's state machine by a single step, honoring `budget`
/// only for the FLIPPED scanning phase. Returns `true` once
/// the trace has finished and been retired.
pub fn advance(inner: &mut ArenaInner, id: TraceId, budget: usize) -> Result<bool> {
    let state = match inner.traces[id].as_ref() {
        Some(t) => t.state,
        None => return Ok(true),
    };
    match state {
        TraceState::Init => {
            condemn(inner, id)?;
            Ok(false)
        }
        TraceState::Unflipped => {
            flip(inner, id)?;
            Ok(false)
        }
        TraceState::Flipped => {
            let fixed = scan_step(inner, id, budget)?;
            if fixed {
                finish(inner, id)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        TraceState::Finished => Ok(true),
    }
}
