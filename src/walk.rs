// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Arena-wide walkers. Both require a parked arena and
//! must not mutate collector state -- `arena_roots_walk` gets this for
//! free from [`crate::root::ScanState`]'s walk mode, which only ever
//! reads.

use std::sync::Arc;

use crate::arena::{Arena, PoolId};
use crate::error::{Error, Result};
use crate::pool;
use crate::root::ScanState;
use crate::types::{Addr, Rank};

/// `arenaFormattedObjectsWalk`: every live object in every pool, in pool
/// then address order, reported as `(pool, object_base, size)`.
pub fn arena_formatted_objects_walk(
    arena: &Arc<Arena>,
    cb: &mut dyn FnMut(PoolId, Addr, usize),
) -> Result<()> {
    let inner = arena.lock();
    if !inner.parked {
        return Err(Error::Param);
    }
    let pool_ids: Vec<PoolId> = inner.pools.iter().map(|(id, _)| id).collect();
    for pool_id in pool_ids {
        for seg in inner.segments_of_pool(pool_id) {
            pool::walk_segment(&inner, pool_id, seg, &mut |addr, size| cb(pool_id, addr, size))?;
        }
    }
    Ok(())
}

/// `arenaRootsWalk`: every candidate reference currently reachable from a
/// registered root, in ascending rank order, that lands inside some
/// segment. Never mutates segment or trace state --
/// it runs the fix protocol in [`ScanState`]'s walk mode, which reports
/// through `cb` instead of marking.
pub fn arena_roots_walk(arena: &Arc<Arena>, cb: &mut dyn FnMut(Addr)) -> Result<()> {
    let mut inner = arena.lock();
    if !inner.parked {
        return Err(Error::Param);
    }
    let mut by_rank: Vec<(Rank, Vec<crate::types::Word>)> = Vec::new();
    for (_, rec) in inner.roots.iter() {
        by_rank.push((rec.rank, rec.candidate_words()));
    }
    let thread_words: Vec<Addr> = inner
        .threads
        .iter()
        .flat_map(|(_, t)| t.roots.ambiguous_words())
        .collect();
    if !thread_words.is_empty() {
        by_rank.push((Rank::Ambiguous, thread_words));
    }
    by_rank.sort_by_key(|(rank, _)| *rank as u8);
    for (rank, words) in by_rank {
        let mut ss = ScanState::new_walk(&mut inner, rank, cb);
        for w in words {
            ss.fix_value(w)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ap::AllocPoint;
    use crate::config::{ArenaConfig, PoolConfig};
    use crate::format::tests::WordFormat;
    use crate::pool::{Pool, PoolClass};
    use crate::root::{Root, VecTable};
    use std::sync::Arc;

    #[test]
    fn formatted_objects_walk_requires_parked_arena() {
        let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
        arena.release();
        let mut seen = Vec::new();
        let err = arena_formatted_objects_walk(&arena, &mut |p, a, s| seen.push((p, a, s)));
        assert_eq!(err.unwrap_err(), Error::Param);
    }

    #[test]
    fn roots_walk_reports_only_in_arena_addresses() {
        let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
        let format = Arc::new(WordFormat { grain: 16 });
        let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
        let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();
        let base = ap.reserve(16).unwrap();
        ap.commit(base, 16).unwrap();

        let table = VecTable::new(vec![base, 0, 0xdead_beef]);
        let _root = Root::create_table(&arena, Rank::Exact, table).unwrap();

        arena.park().unwrap();
        let mut seen = Vec::new();
        arena_roots_walk(&arena, &mut |a| seen.push(a)).unwrap();
        assert_eq!(seen, vec![base]);
    }
}
