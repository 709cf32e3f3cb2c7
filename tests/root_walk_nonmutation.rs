// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::Arc;

use common::{set_ref, OneWordFormat};
use mnemosyne_gc::{
    arena_roots_walk, AllocPoint, Arena, ArenaConfig, Pool, PoolClass, PoolConfig, Rank, Root,
    VecTable,
};

/// `arenaRootsWalk` reports every candidate reference a registered root
/// describes without marking, scanning, or otherwise touching segment
/// colour -- it must be safe to call between traces with
/// no side effect on a subsequent collection's behaviour.
#[test]
fn roots_walk_reports_candidates_without_mutating_segment_state() {
    let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
    let format = Arc::new(OneWordFormat { grain: 16 });
    let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();

    let mut segs = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..20 {
        let base = ap.reserve(16).unwrap();
        set_ref(base, 0);
        ap.commit(base, 16).unwrap();
        segs.push(ap.segment().unwrap());
        addrs.push(base);
    }
    ap.detach().unwrap();

    let exact_table = VecTable::new(addrs.iter().step_by(2).copied().collect());
    let _root_exact = Root::create_table(&arena, Rank::Exact, exact_table).unwrap();

    let tagged_out = addrs[1] | 1;
    let untagged_in = addrs[3] & !1usize;
    let masked_table = VecTable::new(vec![tagged_out, untagged_in, 0]);
    let _root_masked = Root::create_table_masked(&arena, Rank::Ambiguous, masked_table, 1).unwrap();

    arena.park().unwrap();
    let before: Vec<(bool, bool)> = segs.iter().map(|&s| pool.segment_state(s).unwrap()).collect();

    let mut seen = Vec::new();
    arena_roots_walk(&arena, &mut |a| seen.push(a)).unwrap();

    let after: Vec<(bool, bool)> = segs.iter().map(|&s| pool.segment_state(s).unwrap()).collect();
    assert_eq!(before, after, "walking the roots must not mutate segment colour state");

    let mut expected: Vec<usize> = addrs.iter().step_by(2).copied().collect();
    expected.push(untagged_in);
    expected.sort_unstable();
    seen.sort_unstable();
    assert_eq!(seen, expected, "the walk must see exactly the unmasked candidate references");
}
