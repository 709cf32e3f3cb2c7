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
    AllocPoint, Arena, ArenaConfig, Message, MessageQueue, Pool, PoolClass, PoolConfig, Rank,
    Root, VecTable,
};
use proptest::prelude::*;

const SEG: usize = 4096;

fn push_pop_round_trip(n_objects: usize, obj_size: usize) {
    let arena = Arena::create(ArenaConfig::new(1 << 20, SEG)).unwrap();
    let pool = Pool::create(&arena, PoolClass::Snc, None, PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();

    let marker = ap.frame_push();
    assert_eq!(marker, None, "pushing before any allocation is the bottom-of-stack marker");

    for _ in 0..n_objects {
        let base = ap.reserve(obj_size).unwrap();
        ap.commit(base, obj_size).unwrap();
    }

    ap.frame_pop(marker).unwrap();

    assert_eq!(ap.init(), 0);
    assert_eq!(ap.segment(), None);
    assert_eq!(
        pool.free_size(),
        pool.total_size(),
        "popping to the bottom of the stack frees every segment the allocations touched"
    );
}

proptest! {
    #[test]
    fn snc_frame_round_trip_frees_every_segment(n_objects in 1usize..40, obj_size in 64usize..1024) {
        push_pop_round_trip(n_objects, obj_size);
    }
}

fn retained_every_nth_survives(total: usize, n: usize) {
    let arena = Arena::create(ArenaConfig::new(1 << 20, 16)).unwrap();
    let format = Arc::new(OneWordFormat { grain: 16 });
    let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();

    let mut addrs = Vec::with_capacity(total);
    for _ in 0..total {
        let base = ap.reserve(16).unwrap();
        set_ref(base, 0);
        ap.commit(base, 16).unwrap();
        addrs.push(base);
    }
    ap.detach().unwrap();

    let retained: Vec<usize> = addrs.iter().enumerate().filter(|(i, _)| i % n == 0).map(|(_, a)| *a).collect();
    let table = VecTable::new(retained.clone());
    let _root = Root::create_table(&arena, Rank::Exact, table).unwrap();

    let mq = MessageQueue::new(Arc::clone(&arena));
    arena.collect("property: retention").unwrap();

    let mut live = None;
    while let Some(msg) = mq.get() {
        if let Message::Gc { live: l, .. } = msg {
            live = Some(l);
        }
    }
    assert_eq!(live, Some(retained.len() * 16));
}

proptest! {
    #[test]
    fn ams_retains_exactly_the_rooted_objects(total in 1usize..500, n in 1usize..20) {
        retained_every_nth_survives(total, n);
    }
}
