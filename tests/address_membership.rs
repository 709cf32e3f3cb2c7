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

use common::OneWordFormat;
use mnemosyne_gc::{AllocPoint, Arena, ArenaConfig, Pool, PoolClass, PoolConfig, Rank};

/// `Arena::has_addr` answers whether an address could possibly be a
/// reference into this arena's managed memory -- true for any address
/// within some segment's `[base, limit)`, false otherwise, and always
/// false for the null address regardless of arena state.
#[test]
fn has_addr_matches_segment_membership_and_rejects_null() {
    let arena = Arena::create(ArenaConfig::new(1 << 16, 16)).unwrap();
    assert!(!arena.has_addr(0), "the null address is never a member");

    let format = Arc::new(OneWordFormat { grain: 16 });
    let pool = Pool::create(&arena, PoolClass::Ams, Some(format), PoolConfig::new()).unwrap();
    let mut ap = AllocPoint::create(&pool, Rank::Exact).unwrap();
    let base = ap.reserve(16).unwrap();
    ap.commit(base, 16).unwrap();

    assert!(arena.has_addr(base));
    assert!(arena.has_addr(base + 15));
    assert!(!arena.has_addr(base + 16), "one past the segment limit is not a member");
    assert!(!arena.has_addr(base - 1), "one before the segment base is not a member");
}
