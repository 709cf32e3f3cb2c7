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
    arena_formatted_objects_walk, AllocPoint, Arena, ArenaConfig, Message, MessageQueue, Pool,
    PoolClass, PoolConfig, Rank, Root, VecTable,
};

#[test]
fn retains_every_tenth_object_and_walker_matches() {
    let arena = Arena::create(ArenaConfig::new(1 << 20, 16)).unwrap();
    let format = Arc::new(OneWordFormat { grain: 16 });
    let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();

    let mut addrs = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let base = ap.reserve(16).unwrap();
        set_ref(base, 0);
        ap.commit(base, 16).unwrap();
        addrs.push(base);
    }
    ap.detach().unwrap();

    let retained: Vec<usize> = addrs
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 10 == 0)
        .map(|(_, a)| *a)
        .collect();
    let table = VecTable::new(retained.clone());
    let _root = Root::create_table(&arena, Rank::Exact, table).unwrap();

    let mq = MessageQueue::new(Arc::clone(&arena));
    arena.collect("mark sweep retention test").unwrap();

    let mut live = None;
    while let Some(msg) = mq.get() {
        if let Message::Gc { live: l, .. } = msg {
            live = Some(l);
        }
    }
    assert_eq!(live, Some(retained.len() * 16));

    arena.park().unwrap();
    let mut visited = Vec::new();
    arena_formatted_objects_walk(&arena, &mut |_pool, addr, _size| visited.push(addr)).unwrap();
    visited.sort_unstable();
    let mut expected = retained.clone();
    expected.sort_unstable();
    assert_eq!(visited, expected);

    // The reclaimed 900 objects' space does not block further allocation.
    let mut ap2 = AllocPoint::create(&pool, Rank::Exact).unwrap();
    let fresh = ap2.reserve(16).unwrap();
    set_ref(fresh, 0);
    ap2.commit(fresh, 16).unwrap();
}
