// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! AWL: AMS with a weak rank and the single-access barrier path.
//! AWL reuses AMS's segment payload and colouring wholesale -- its
//! only differences are that every segment it creates is forced to
//! `RankSet::WEAK` (so `ams::fix`'s existing weak-splat branch applies to
//! every outgoing reference) and the barrier-hit handler below.

use crate::arena::{ArenaInner, PoolId, SegId, SegmentPayload, TraceId};
use crate::error::{Error, Result};
use crate::pool::{self, ams, FixOutcome};
use crate::root::ScanState;
use crate::types::{Addr, Rank, RankSet};

pub fn whiten(arena: &mut ArenaInner, seg: SegId, trace: TraceId) -> Result<()> {
    ams::whiten(arena, seg, trace)
}

pub fn fix(
    arena: &mut ArenaInner,
    pool: PoolId,
    seg: SegId,
    trace: TraceId,
    rank: Rank,
    value: Addr,
) -> Result<FixOutcome> {
    ams::fix(arena, pool, seg, trace, rank, value)
}

pub fn scan(arena: &mut ArenaInner, pool: PoolId, seg: SegId, trace: TraceId) -> Result<()> {
    ams::scan(arena, pool, seg, trace)
}

/// `bufferFill`: identical to AMS except the new segment is always
/// weak-ranked.
pub fn buffer_fill(
    arena: &mut ArenaInner,
    pool: PoolId,
    _rank: Rank,
    min_size: usize,
) -> Result<(SegId, Addr, Addr)> {
    let (seg, base, limit) = ams::buffer_fill(arena, pool, Rank::Weak, min_size)?;
    if let Ok(s) = arena.segment_mut(seg) {
        s.rank_set = RankSet::WEAK;
    }
    Ok((seg, base, limit))
}

/// The barrier-hit handler: called by the host's
/// protection-fault handler (itself out of scope -- an external
/// collaborator) with the faulting address.
pub fn barrier_hit(arena: &mut ArenaInner, pool_id: PoolId, seg: SegId, fault_addr: Addr) -> Result<()> {
    let flipped = arena.flipped;
    let is_weak = arena.segment(seg)?.rank_set == RankSet::WEAK;
    let grey_trace = (0..8usize).find(|&t| flipped & (1 << t) != 0 && arena.segment(seg).map_or(false, |s| s.is_grey_for(t)));

    let trace = match (is_weak, grey_trace) {
        (true, Some(t)) => t,
        _ => {
            // Non-weak segment, or no flipped trace has it grey: fall
            // through to a normal whole-segment scan.
            if let Some(t) = grey_trace {
                return pool::scan(arena, pool_id, seg, t);
            }
            return Ok(());
        }
    };

    let (seg_limit_reached, total_limit_reached) = {
        let rec = arena.pools.get(pool_id).ok_or(Error::Param)?;
        let seg_limit = rec.config.seg_sa_limit;
        let total_limit = rec.config.total_sa_limit;
        let seg_used = match &arena.segment(seg)?.payload {
            SegmentPayload::Ams(a) => a.single_access_used,
            _ => return Err(Error::Param),
        };
        let total_used = arena.traces[trace].as_ref().map_or(0, |t| t.single_access_used);
        (seg_used >= seg_limit, total_used >= total_limit)
    };

    if seg_limit_reached || total_limit_reached {
        // Budget exhausted: fall back to scanning the whole segment,
        // which turns it black.
        return pool::scan(arena, pool_id, seg, trace);
    }

    // Single-reference scan: expose just long enough to fix the one word
    // at `fault_addr`. The guard covers again on drop even if `fix_area`
    // errors, so a failed fix can never leave the segment exposed.
    {
        let mut guard = arena.expose_scoped(seg)?;
        let mut ss = ScanState::new_normal(guard.inner_mut(), trace, Rank::Weak);
        ss.fix_area(fault_addr)?;
    }

    if let SegmentPayload::Ams(a) = &mut arena.segment_mut(seg)?.payload {
        a.single_access_used += 1;
    }
    if let Some(t) = arena.traces[trace].as_mut() {
        t.single_access_used += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::config::{ArenaConfig, PoolConfig};
    use crate::format::tests::WordFormat;
    use crate::pool::{Pool, PoolClass};
    use std::sync::Arc;

    #[test]
    fn buffer_fill_forces_weak_rank() {
        let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
        let format = Arc::new(WordFormat { grain: 16 });
        let pool = Pool::create(&arena, PoolClass::Awl, Some(format), PoolConfig::new()).unwrap();
        let mut inner = arena.lock();
        let (seg, _base, _limit) = buffer_fill(&mut inner, pool.id(), Rank::Exact, 16).unwrap();
        assert_eq!(inner.segment(seg).unwrap().rank_set, RankSet::WEAK);
    }
}
