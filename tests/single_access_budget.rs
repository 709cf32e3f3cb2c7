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
use mnemosyne_gc::{AllocPoint, Arena, ArenaConfig, Pool, PoolClass, PoolConfig, Rank, Root, VecTable};

/// A host's VM trap handler calls `Pool::barrier_hit` on a protection
/// fault. An AWL pool with a small per-segment single-access budget
/// must scan only the faulting reference for the first few hits, and
/// fall back to a whole-segment scan (turning the segment black) once
/// the budget is exceeded.
#[test]
fn barrier_hits_stay_within_budget_then_fall_back_to_full_scan() {
    let arena = Arena::create(ArenaConfig::new(1 << 16, 64)).unwrap();
    let format = Arc::new(OneWordFormat { grain: 64 });
    let pool = Pool::create(
        &arena,
        PoolClass::Awl,
        Some(format),
        PoolConfig::new().seg_sa_limit(4).total_sa_limit(100),
    )
    .unwrap();

    let mut ap = AllocPoint::create(&pool, Rank::Weak).unwrap();
    let obj = ap.reserve(64).unwrap();
    for i in 0..8 {
        set_ref(obj + i * 8, 0);
    }
    ap.commit(obj, 64).unwrap();
    let seg = ap.segment().unwrap();
    ap.detach().unwrap();

    let table = VecTable::new(vec![obj]);
    let _root = Root::create_table(&arena, Rank::Exact, table).unwrap();

    arena.collect_begin("single access budget test").unwrap();
    assert!(!arena.step(0).unwrap(), "condemn leaves the trace unfinished");
    assert!(!arena.step(0).unwrap(), "flip leaves the trace unfinished");

    let (white, grey) = pool.segment_state(seg).unwrap();
    assert!(white && grey, "the root scan during flip should have greyed the segment");

    for i in 0..4 {
        pool.barrier_hit(seg, obj + i * 8).unwrap();
        let (_, grey) = pool.segment_state(seg).unwrap();
        assert!(grey, "segment must stay grey within the single-access budget");
    }

    pool.barrier_hit(seg, obj + 4 * 8).unwrap();
    let (_, grey) = pool.segment_state(seg).unwrap();
    assert!(!grey, "segment must turn black once the single-access budget is exceeded");

    loop {
        if arena.step(usize::MAX).unwrap() {
            break;
        }
    }
}
