// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::{Arc, Mutex};

use common::{set_ref, OneWordFormat};
use mnemosyne_gc::{
    arena_roots_walk, AllocPoint, Arena, ArenaConfig, Message, MessageQueue, Pool, PoolClass,
    PoolConfig, Rank, ThreadRoots,
};

/// A stand-in for a client's spilled-register/stack capture: just a fixed
/// word list, mutable so a test can simulate the stack shrinking between
/// collections.
struct FakeStack(Mutex<Vec<usize>>);

impl ThreadRoots for FakeStack {
    fn ambiguous_words(&self) -> Vec<usize> {
        self.0.lock().unwrap().clone()
    }
}

#[test]
fn registered_thread_ambiguous_roots_retain_objects() {
    let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
    let format = Arc::new(OneWordFormat { grain: 16 });
    let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();

    let mut addrs = Vec::with_capacity(10);
    for _ in 0..10 {
        let base = ap.reserve(16).unwrap();
        set_ref(base, 0);
        ap.commit(base, 16).unwrap();
        addrs.push(base);
    }
    ap.detach().unwrap();

    let tid = arena.thread_reg(Box::new(FakeStack(Mutex::new(vec![addrs[3], addrs[7]]))));

    let mq = MessageQueue::new(Arc::clone(&arena));
    arena.collect("thread registration test").unwrap();

    let mut live = None;
    while let Some(msg) = mq.get() {
        if let Message::Gc { live: l, .. } = msg {
            live = Some(l);
        }
    }
    assert_eq!(live, Some(2 * 16), "only the two referenced-from-thread objects survive");

    arena.thread_dereg(tid).unwrap();

    arena.collect("after dereg, nothing left rooted").unwrap();
    let mut live_after_dereg = None;
    while let Some(msg) = mq.get() {
        if let Message::Gc { live: l, .. } = msg {
            live_after_dereg = Some(l);
        }
    }
    assert_eq!(live_after_dereg, Some(0), "a deregistered thread's roots no longer retain anything");
}

#[test]
fn roots_walk_includes_registered_thread_words() {
    let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
    let format = Arc::new(OneWordFormat { grain: 16 });
    let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();

    let base = ap.reserve(16).unwrap();
    set_ref(base, 0);
    ap.commit(base, 16).unwrap();
    ap.detach().unwrap();

    let _tid = arena.thread_reg(Box::new(FakeStack(Mutex::new(vec![base]))));

    arena.park().unwrap();
    let mut seen = Vec::new();
    arena_roots_walk(&arena, &mut |a| seen.push(a)).unwrap();
    assert_eq!(seen, vec![base]);
}
