// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! SNC: the stack-nursery pool class.
//!
//! SNC objects carry no colour and are never condemned -- `whiten`,
//! `grey`, `blacken`, `scan`, `fix`, and `reclaim` are all no-ops for this
//! class, dispatched directly in `pool::mod`. What is interesting here is
//! purely the allocation-stack discipline: `bufferFill` grows a buffer's
//! segment chain (first-fit against the pool's free list, else a fresh
//! segment), and `framePop` unwinds it, padding and returning freed
//! segments to that same free list rather than releasing them to the
//! arena.

use crate::arena::{ArenaInner, PoolId, SegId, SegmentPayload};
use crate::error::{Error, Result};
use crate::types::{Addr, RankSet};

/// `bufferFill`: first-fit pop from the pool's free list, or a fresh
/// segment, pushed onto the buffer's chain.
pub fn buffer_fill(
    inner: &mut ArenaInner,
    pool: PoolId,
    min_size: usize,
    chain: &mut Vec<SegId>,
) -> Result<(SegId, Addr, Addr)> {
    let free_idx = {
        let rec = inner.pools.get(pool).ok_or(Error::Param)?;
        rec.free_segments.iter().position(|&seg| {
            inner
                .segment(seg)
                .map(|s| s.limit - s.base >= min_size)
                .unwrap_or(false)
        })
    };
    let seg = if let Some(idx) = free_idx {
        let seg = {
            let rec = inner.pools.get_mut(pool).ok_or(Error::Param)?;
            rec.free_segments.remove(idx)
        };
        if let Ok(s) = inner.segment_mut(seg) {
            s.rank_set = RankSet::empty();
            if let SegmentPayload::Snc(snc) = &mut s.payload {
                snc.in_use = true;
            }
        }
        seg
    } else {
        let class = inner.pools.get(pool).ok_or(Error::Param)?.class;
        let new_seg = inner.allocate_segment(pool, min_size, RankSet::empty(), class)?;
        if let Some(rec) = inner.pools.get_mut(pool) {
            rec.segments.push(new_seg);
        }
        new_seg
    };
    chain.push(seg);
    let (base, limit) = {
        let s = inner.segment(seg)?;
        (s.base, s.limit)
    };
    Ok((seg, base, limit))
}

/// `bufferEmpty`: pads the unused suffix (if a format is registered --
/// SNC pools are permitted none) and detaches.
pub fn buffer_empty(inner: &mut ArenaInner, pool: PoolId, seg: SegId, used_limit: Addr) -> Result<()> {
    let seg_limit = inner.segment(seg)?.limit;
    if used_limit < seg_limit {
        if let Some(format) = inner.pools.get(pool).and_then(|p| p.format.clone()) {
            format.pad(used_limit, seg_limit - used_limit);
        }
    }
    if let Ok(s) = inner.segment_mut(seg) {
        s.buffered = None;
    }
    Ok(())
}

/// Pads a whole segment, marks it rank-set-empty so the collector skips
/// it, and returns it to the pool's free list.
fn free_segment_to_pool(inner: &mut ArenaInner, pool: PoolId, seg: SegId) -> Result<()> {
    let (base, limit) = {
        let s = inner.segment(seg)?;
        (s.base, s.limit)
    };
    if let Some(format) = inner.pools.get(pool).and_then(|p| p.format.clone()) {
        format.pad(base, limit - base);
    }
    if let Ok(s) = inner.segment_mut(seg) {
        s.rank_set = RankSet::empty();
        s.buffered = None;
        if let SegmentPayload::Snc(snc) = &mut s.payload {
            snc.in_use = false;
        }
    }
    if let Some(rec) = inner.pools.get_mut(pool) {
        rec.free_segments.push(seg);
    }
    Ok(())
}

/// `framePop(ap, marker)`: `None` pops to the bottom of the stack,
/// freeing every segment in the chain; `Some(addr)` frees every segment
/// above the one containing `addr` and truncates that segment's buffer
/// back to `addr`.
pub fn frame_pop(
    inner: &mut ArenaInner,
    pool: PoolId,
    chain: &mut Vec<SegId>,
    _current_seg: Option<SegId>,
    marker: Option<Addr>,
) -> Result<(Option<SegId>, Addr)> {
    match marker {
        None => {
            for seg in chain.drain(..) {
                free_segment_to_pool(inner, pool, seg)?;
            }
            Ok((None, 0))
        }
        Some(addr) => {
            let pos = chain
                .iter()
                .rposition(|&seg| {
                    inner
                        .segment(seg)
                        .map(|s| addr >= s.base && addr <= s.limit)
                        .unwrap_or(false)
                })
                .ok_or(Error::Param)?;
            while chain.len() > pos + 1 {
                let seg = chain.pop().unwrap();
                free_segment_to_pool(inner, pool, seg)?;
            }
            let target = chain[pos];
            let seg_limit = inner.segment(target)?.limit;
            if addr < seg_limit {
                if let Some(format) = inner.pools.get(pool).and_then(|p| p.format.clone()) {
                    format.pad(addr, seg_limit - addr);
                }
            }
            Ok((Some(target), addr))
        }
    }
}

/// `poolWalk`/`arenaFormattedObjectsWalk` support: a freed (padded)
/// segment contributes nothing; a live one is walked up to its buffer's
/// committed boundary (the uncommitted tail, if any, is not yet a valid
/// object).
pub fn walk(
    arena: &ArenaInner,
    pool: PoolId,
    seg: SegId,
    cb: &mut dyn FnMut(Addr, usize),
) -> Result<()> {
    let seg_ref = arena.segment(seg)?;
    let in_use = match &seg_ref.payload {
        SegmentPayload::Snc(s) => s.in_use,
        _ => return Err(Error::Param),
    };
    if !in_use {
        return Ok(());
    }
    let format = match arena.pools.get(pool).ok_or(Error::Param)?.format.clone() {
        Some(f) => f,
        None => return Ok(()),
    };
    let base = seg_ref.base;
    let top = match seg_ref.buffered {
        Some((committed, _)) => committed,
        None => seg_ref.limit,
    };
    let mut addr = base;
    while addr < top {
        let next = format.skip(addr);
        cb(addr, next - addr);
        addr = next;
    }
    Ok(())
}

pub fn free_size(arena: &ArenaInner, pool: PoolId) -> usize {
    let rec = match arena.pools.get(pool) {
        Some(r) => r,
        None => return 0,
    };
    rec.free_segments
        .iter()
        .filter_map(|&seg| arena.segment(seg).ok())
        .map(|s| s.limit - s.base)
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
        let pool = Pool::create(&arena, PoolClass::Snc, Some(format), PoolConfig::new()).unwrap();
        (arena, pool)
    }

    #[test]
    fn buffer_fill_allocates_then_reuses_freed_segment() {
        let (arena, pool) = make_pool(16);
        let mut inner = arena.lock();
        let mut chain = Vec::new();
        let (seg1, base1, limit1) = buffer_fill(&mut inner, pool.id(), 64, &mut chain).unwrap();
        assert_eq!(limit1 - base1, 64);
        frame_pop(&mut inner, pool.id(), &mut chain, Some(seg1), None).unwrap();
        assert_eq!(inner.pools.get(pool.id()).unwrap().free_segments.len(), 1);
        let mut chain2 = Vec::new();
        let (seg2, _, _) = buffer_fill(&mut inner, pool.id(), 32, &mut chain2).unwrap();
        assert_eq!(seg2, seg1, "first-fit should reuse the freed segment");
    }

    #[test]
    fn frame_pop_to_marker_truncates_without_freeing_target_segment() {
        let (arena, pool) = make_pool(16);
        let mut inner = arena.lock();
        let mut chain = Vec::new();
        let (seg, base, _limit) = buffer_fill(&mut inner, pool.id(), 64, &mut chain).unwrap();
        frame_pop(&mut inner, pool.id(), &mut chain, Some(seg), Some(base + 16)).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(inner.pools.get(pool.id()).unwrap().free_segments.is_empty());
    }
}
