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
    AllocPoint, Arena, ArenaConfig, Error, Pool, PoolClass, PoolConfig, Rank, Root, VecTable,
};

#[test]
fn reserve_of_zero_size_is_rejected() {
    let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
    let format = Arc::new(OneWordFormat { grain: 16 });
    let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();
    assert_eq!(ap.reserve(0).unwrap_err(), Error::Param);
}

/// A flip happening between `reserve` and `commit` (e.g. a concurrent
/// mutator thread triggering a collection) forces the client back to
/// re-initialize and re-reserve, rather than silently committing into a
/// segment the collector may already be scanning.
#[test]
fn commit_after_an_intervening_flip_fails() {
    let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
    let format = Arc::new(OneWordFormat { grain: 16 });
    let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();

    let base = ap.reserve(16).unwrap();

    arena.collect_begin("intervening flip").unwrap();
    assert!(!arena.step(0).unwrap()); // condemn
    assert!(!arena.step(0).unwrap()); // flip: bumps flip_epoch

    set_ref(base, 0);
    assert_eq!(ap.commit(base, 16).unwrap_err(), Error::Fail);

    loop {
        if arena.step(usize::MAX).unwrap() {
            break;
        }
    }
}

/// An ambiguous reference must land exactly on an object's grain-aligned
/// base to retain it; one byte into the object's body does not count.
#[test]
fn ambiguous_reference_off_grain_boundary_is_ignored() {
    let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
    let format = Arc::new(OneWordFormat { grain: 16 });
    let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();
    let base = ap.reserve(16).unwrap();
    set_ref(base, 0);
    ap.commit(base, 16).unwrap();
    ap.detach().unwrap();

    let table = VecTable::new(vec![base + 1]);
    let _root = Root::create_table(&arena, Rank::Ambiguous, table).unwrap();

    arena.collect("unaligned ambiguous reference").unwrap();

    arena.park().unwrap();
    let mut seen = Vec::new();
    pool.walk(&mut |addr, _size| seen.push(addr)).unwrap();
    assert!(seen.is_empty(), "an off-grain ambiguous reference must not retain the object");
}
