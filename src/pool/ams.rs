// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! AMS: automatic mark-and-sweep.
//!
//! Colour is derived from the `(alloc, mark, scanned)` bit triple, stored
//! per grain but only ever meaningfully set at an object's *base* grain --
//! exactly as the real Memory Pool System's AMS does. A multi-grain
//! object's interior grains simply never have their bits set; walking by
//! object (via [`Format::skip`]) rather than by grain is what makes this
//! correct and is why `scan`/`reclaim`/`walk` below all drive themselves
//! from a skip-chain instead of a bit-table search.

use crate::arena::{ArenaInner, PoolId, SegId, SegmentPayload, TraceId};
use crate::error::{Error, Result};
use crate::pool::FixOutcome;
use crate::root::ScanState;
use crate::types::{Addr, Rank};

pub(crate) fn grain_of(base: Addr, grain_size: usize, addr: Addr) -> usize {
    (addr - base) / grain_size
}

pub fn whiten(arena: &mut ArenaInner, seg: SegId, trace: TraceId) -> Result<()> {
    let buffered = arena.segment(seg)?.buffered;
    let grain_size = arena.grain_size;
    let grains = {
        let s = arena.segment_mut(seg)?;
        debug_assert!(
            s.white.is_none(),
            "single-white invariant violated: segment already condemned"
        );
        s.white = Some(trace);
        let ams = match &mut s.payload {
            SegmentPayload::Ams(a) => a,
            _ => return Err(Error::Param),
        };
        ams.mark.reset_range(0, ams.grains);
        ams.scanned.reset_range(0, ams.grains);
        ams.grains
    };
    // The buffered tail (if any) is exempt from whiten: its objects are
    // still being written by the mutator and must stay black.
    if let Some((b_base, b_limit)) = buffered {
        let s = arena.segment(seg)?;
        let g_lo = grain_of(s.base, grain_size, b_base);
        let g_hi = grain_of(s.base, grain_size, b_limit.min(s.limit));
        let s = arena.segment_mut(seg)?;
        if let SegmentPayload::Ams(ams) = &mut s.payload {
            ams.mark.set_range(g_lo, g_hi);
            ams.scanned.set_range(g_lo, g_hi);
        }
    }
    let size = grains * grain_size;
    if let Some(t) = arena.traces[trace].as_mut() {
        t.condemned_size += size;
    }
    arena.update_shield(seg);
    Ok(())
}

pub fn blacken(arena: &mut ArenaInner, seg: SegId, trace: TraceId) -> Result<usize> {
    let grain_size = arena.grain_size;
    let preserved = {
        let s = arena.segment_mut(seg)?;
        s.set_grey_for(trace, false);
        let ams = match &mut s.payload {
            SegmentPayload::Ams(a) => a,
            _ => return Err(Error::Param),
        };
        let mut preserved = 0usize;
        for g in 0..ams.grains {
            if ams.alloc.get(g) && !ams.mark.get(g) {
                ams.mark.set(g);
                ams.scanned.set(g);
                preserved += 1;
            }
        }
        preserved
    };
    arena.update_shield(seg);
    if let Some(t) = arena.traces[trace].as_mut() {
        t.preserved_in_place += preserved;
    }
    Ok(preserved * grain_size)
}

/// Stage 3 of the fix protocol for AMS.
pub fn fix(
    arena: &mut ArenaInner,
    pool: PoolId,
    seg: SegId,
    trace: TraceId,
    rank: Rank,
    value: Addr,
) -> Result<FixOutcome> {
    let grain_size = arena.grain_size;
    let base = arena.segment(seg)?.base;
    if (value - base) % grain_size != 0 {
        // An ambiguous value landing off a grain boundary can never be a
        // genuine reference; a non-ambiguous reference off-boundary is a
        // client format bug, but we decline rather than panic.
        return Ok(FixOutcome::Unchanged);
    }
    let grain = grain_of(base, grain_size, value);
    let (is_alloc, is_marked) = {
        let s = arena.segment(seg)?;
        match &s.payload {
            SegmentPayload::Ams(ams) => {
                if grain >= ams.grains {
                    return Ok(FixOutcome::Unchanged);
                }
                (ams.alloc.get(grain), ams.mark.get(grain))
            }
            _ => return Err(Error::Param),
        }
    };
    if !is_alloc {
        // Ambiguous ref into a header, padding object, or one-past-end:
        // not a genuine object base.
        return Ok(FixOutcome::Unchanged);
    }
    if is_marked {
        // Already grey or black for this trace.
        return Ok(FixOutcome::Unchanged);
    }
    // The grain is white: alloc && !mark.
    if rank == Rank::Weak {
        return Ok(FixOutcome::Splat);
    }
    let emergency = arena.traces[trace].as_ref().map_or(false, |t| t.emergency);
    if emergency {
        blacken(arena, seg, trace)?;
        return Ok(FixOutcome::Unchanged);
    }
    let was_grey = arena.segment(seg)?.is_grey_for(trace);
    {
        let s = arena.segment_mut(seg)?;
        if let SegmentPayload::Ams(ams) = &mut s.payload {
            ams.mark.set(grain);
        }
        s.set_grey_for(trace, true);
    }
    arena.update_shield(seg);
    if let Some(t) = arena.traces[trace].as_mut() {
        if rank == Rank::Ambiguous {
            t.ambiguous_fixes = true;
        }
        if !was_grey {
            t.enqueue_grey(pool, seg);
        }
    }
    Ok(FixOutcome::Unchanged)
}

/// Scans every grey object of `seg`, fixing its references via the pool's
/// format, then marks it scanned. Drives itself with [`Format::skip`]
/// rather than a grey-bit-pattern search, which is correct regardless of
/// `ambiguous_fixes` since it always re-derives
/// object boundaries rather than caching them.
pub fn scan(arena: &mut ArenaInner, pool: PoolId, seg: SegId, trace: TraceId) -> Result<()> {
    let format = arena
        .pools
        .get(pool)
        .ok_or(Error::Param)?
        .format
        .clone()
        .ok_or(Error::Param)?;
    let rank = arena
        .segment(seg)?
        .rank_set
        .single()
        .unwrap_or(Rank::Exact);
    let grain_size = arena.grain_size;
    let (base, top) = {
        let s = arena.segment(seg)?;
        let top_grain = match &s.payload {
            SegmentPayload::Ams(ams) => ams.first_free,
            _ => return Err(Error::Param),
        };
        (s.base, s.base + top_grain * grain_size)
    };

    let mut addr = base;
    while addr < top {
        let grain = grain_of(base, grain_size, addr);
        let (is_alloc, is_marked, is_scanned) = {
            let s = arena.segment(seg)?;
            match &s.payload {
                SegmentPayload::Ams(ams) => (ams.alloc.get(grain), ams.mark.get(grain), ams.scanned.get(grain)),
                _ => return Err(Error::Param),
            }
        };
        if !is_alloc {
            addr += grain_size;
            continue;
        }
        let obj_limit = format.skip(addr);
        if is_marked && !is_scanned {
            let mut ss = ScanState::new_normal(arena, trace, rank);
            format.scan(&mut ss, addr, obj_limit)?;
            let ambiguous_fixes = ss.ambiguous_fixes;
            if ambiguous_fixes {
                if let Some(t) = arena.traces[trace].as_mut() {
                    t.ambiguous_fixes = true;
                }
            }
            let s = arena.segment_mut(seg)?;
            if let SegmentPayload::Ams(ams) = &mut s.payload {
                ams.scanned.set(grain);
            }
        }
        addr = obj_limit;
    }

    // Recompute whether the segment still has grey (marked, unscanned)
    // objects; if not, it drops out of the grey set for this trace.
    let still_grey = {
        let s = arena.segment(seg)?;
        match &s.payload {
            SegmentPayload::Ams(ams) => (0..ams.grains)
                .any(|g| ams.alloc.get(g) && ams.mark.get(g) && !ams.scanned.get(g)),
            _ => false,
        }
    };
    if !still_grey {
        let s = arena.segment_mut(seg)?;
        s.set_grey_for(trace, false);
        arena.update_shield(seg);
    } else {
        // A grain below the scan cursor was marked after its own object
        // had already been passed over (a fix from a later object in the
        // same pass); the segment is still grey but was already dequeued
        // by the caller, so it must be requeued to be revisited.
        if let Some(t) = arena.traces[trace].as_mut() {
            t.enqueue_grey(pool, seg);
        }
    }
    Ok(())
}

/// Frees every dead (`alloc && !mark`) object's grains, preserving the
/// rest. Returns `(reclaimed_bytes, preserved_bytes)`.
pub fn reclaim(arena: &mut ArenaInner, pool: PoolId, seg: SegId, trace: TraceId) -> Result<(usize, usize)> {
    let format = arena
        .pools
        .get(pool)
        .ok_or(Error::Param)?
        .format
        .clone()
        .ok_or(Error::Param)?;
    let grain_size = arena.grain_size;
    let (base, top) = {
        let s = arena.segment(seg)?;
        let top_grain = match &s.payload {
            SegmentPayload::Ams(ams) => ams.first_free,
            _ => return Err(Error::Param),
        };
        (s.base, s.base + top_grain * grain_size)
    };
    let mut reclaimed = 0usize;
    let mut preserved = 0usize;
    let mut addr = base;
    while addr < top {
        let grain = grain_of(base, grain_size, addr);
        let (is_alloc, is_marked) = {
            let s = arena.segment(seg)?;
            match &s.payload {
                SegmentPayload::Ams(ams) => (ams.alloc.get(grain), ams.mark.get(grain)),
                _ => return Err(Error::Param),
            }
        };
        if !is_alloc {
            addr += grain_size;
            continue;
        }
        let obj_limit = format.skip(addr);
        let size = obj_limit - addr;
        if is_marked {
            preserved += size;
        } else {
            reclaimed += size;
            format.pad(addr, size);
            let s = arena.segment_mut(seg)?;
            if let SegmentPayload::Ams(ams) = &mut s.payload {
                let g_hi = grain_of(base, grain_size, obj_limit);
                ams.alloc.reset_range(grain, g_hi);
            }
        }
        addr = obj_limit;
    }
    let s = arena.segment_mut(seg)?;
    s.white = None;
    arena.update_shield(seg);
    Ok((reclaimed, preserved))
}

/// `bufferFill`: hands the AP a fresh region. AMS always backs this with a
/// brand-new segment sized to the request.
pub fn buffer_fill(
    arena: &mut ArenaInner,
    pool: PoolId,
    rank: Rank,
    min_size: usize,
) -> Result<(SegId, Addr, Addr)> {
    use crate::types::RankSet;

    let rank_set = RankSet::of(rank);
    let class = arena.pools.get(pool).ok_or(Error::Param)?.class;
    let seg = arena.allocate_segment(pool, min_size, rank_set, class)?;
    let (base, limit) = {
        let s = arena.segment(seg)?;
        (s.base, s.limit)
    };
    if let Some(rec) = arena.pools.get_mut(pool) {
        rec.segments.push(seg);
        if let Some(gen_idx) = rec.config.gen {
            if let Some(g) = rec.generations.get_mut(gen_idx) {
                g.segments.push(seg);
                // Drives `trace::due_generations`'s capacity trigger: a
                // generation becomes due once its freshly allocated size
                // reaches its configured capacity.
                g.new_size += limit - base;
            }
        }
    }
    Ok((seg, base, limit))
}

/// `bufferEmpty`: pads the unused suffix `[used_limit, seg_limit)` so the
/// walker can step over it, and records the allocated extent.
pub fn buffer_empty(
    arena: &mut ArenaInner,
    pool: PoolId,
    seg: SegId,
    used_limit: Addr,
) -> Result<()> {
    let grain_size = arena.grain_size;
    let (base, seg_limit) = {
        let s = arena.segment(seg)?;
        (s.base, s.limit)
    };
    if used_limit < seg_limit {
        if let Some(format) = arena.pools.get(pool).and_then(|p| p.format.clone()) {
            format.pad(used_limit, seg_limit - used_limit);
        }
    }
    let used_grains = (used_limit - base) / grain_size;
    let s = arena.segment_mut(seg)?;
    if let SegmentPayload::Ams(ams) = &mut s.payload {
        ams.first_free = ams.first_free.max(used_grains);
    }
    s.buffered = None;
    Ok(())
}

/// Marks `[base, base+size)` as one freshly committed, black object:
/// allocations are born black and excluded from whiten.
pub fn commit_black(arena: &mut ArenaInner, seg: SegId, base: Addr, size: usize) -> Result<()> {
    let grain_size = arena.grain_size;
    let s = arena.segment_mut(seg)?;
    let seg_base = s.base;
    let g_lo = grain_of(seg_base, grain_size, base);
    let g_hi = grain_of(seg_base, grain_size, base + size);
    if let SegmentPayload::Ams(ams) = &mut s.payload {
        ams.alloc.set(g_lo);
        ams.mark.set_range(g_lo, g_hi);
        ams.scanned.set_range(g_lo, g_hi);
        ams.first_free = ams.first_free.max(g_hi);
    }
    Ok(())
}

pub fn walk(
    arena: &ArenaInner,
    pool: PoolId,
    seg: SegId,
    cb: &mut dyn FnMut(Addr, usize),
) -> Result<()> {
    let format = arena
        .pools
        .get(pool)
        .ok_or(Error::Param)?
        .format
        .clone()
        .ok_or(Error::Param)?;
    let grain_size = arena.grain_size;
    let (base, top) = {
        let s = arena.segment(seg)?;
        let top_grain = match &s.payload {
            SegmentPayload::Ams(ams) => ams.first_free,
            _ => return Err(Error::Param),
        };
        (s.base, s.base + top_grain * grain_size)
    };
    let mut addr = base;
    while addr < top {
        let grain = grain_of(base, grain_size, addr);
        let is_alloc = match &arena.segment(seg)?.payload {
            SegmentPayload::Ams(ams) => ams.alloc.get(grain),
            _ => false,
        };
        let next = format.skip(addr);
        if is_alloc {
            cb(addr, next - addr);
        }
        addr = next;
    }
    Ok(())
}

pub fn free_size(arena: &ArenaInner, pool: PoolId) -> usize {
    let grain_size = arena.grain_size;
    arena
        .segments_of_pool(pool)
        .into_iter()
        .filter_map(|id| arena.segment(id).ok())
        .map(|s| match &s.payload {
            SegmentPayload::Ams(ams) => (ams.grains - ams.first_free) * grain_size,
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::config::{ArenaConfig, PoolConfig};
    use crate::format::tests::WordFormat;
    use crate::pool::{Pool, PoolClass};
    use std::sync::Arc;

    fn make_pool(grain: usize) -> (Arc<Arena>, Pool) {
        let arena = Arena::create(ArenaConfig::new(1 << 20, grain)).unwrap();
        let format = Arc::new(WordFormat { grain });
        let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
        (arena, pool)
    }

    #[test]
    fn whiten_clears_mark_and_scanned() {
        let (arena, pool) = make_pool(16);
        let mut inner = arena.lock();
        let (seg, base, _limit) = buffer_fill(&mut inner, pool.id(), Rank::Exact, 16).unwrap();
        commit_black(&mut inner, seg, base, 16).unwrap();
        whiten(&mut inner, seg, 0).unwrap();
        let s = inner.segment(seg).unwrap();
        match &s.payload {
            SegmentPayload::Ams(ams) => {
                assert!(ams.alloc.get(0));
                assert!(!ams.mark.get(0));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn reclaim_frees_unmarked_objects() {
        let (arena, pool) = make_pool(16);
        let mut inner = arena.lock();
        let (seg, base, _limit) = buffer_fill(&mut inner, pool.id(), Rank::Exact, 32).unwrap();
        commit_black(&mut inner, seg, base, 16).unwrap();
        commit_black(&mut inner, seg, base + 16, 16).unwrap();
        whiten(&mut inner, seg, 0).unwrap();
        // Mark only the first object alive.
        if let SegmentPayload::Ams(ams) = &mut inner.segment_mut(seg).unwrap().payload {
            ams.mark.set(0);
            ams.scanned.set(0);
        }
        let (reclaimed, preserved) = reclaim(&mut inner, pool.id(), seg, 0).unwrap();
        assert_eq!(reclaimed, 16);
        assert_eq!(preserved, 16);
    }
}
