// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared scalar types: machine words, arena addresses, reference ranks,
//! and the derived tri-colour marks.

use bitflags::bitflags;

/// A machine-word-sized value, read from or written into client memory.
pub type Word = usize;

/// An address within the arena's reserved region. Not a raw pointer: the
/// backing store may be any [`crate::vm::VmArena`] implementation, so an
/// `Addr` is only meaningful relative to the arena that produced it.
pub type Addr = usize;

/// Classifies a reference for the fix protocol.
///
/// - `Ambiguous`: value may or may not be a reference; conservative.
/// - `Exact`: value is definitely a reference, or null.
/// - `Final`: like `Exact`, but the referent gets a finalization message
///   instead of being kept alive indefinitely (not independently
///   implemented here beyond the rank; AMS/AWL treat `Final` like `Exact`
///   for marking purposes).
/// - `Weak`: reference is not followed; if its target dies this trace, the
///   stored word is splatted to zero (the weak-splat rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rank {
    Ambiguous,
    Exact,
    Final,
    Weak,
}

pub const RANK_COUNT: usize = 4;

impl Rank {
    pub fn index(self) -> usize {
        match self {
            Rank::Ambiguous => 0,
            Rank::Exact => 1,
            Rank::Final => 2,
            Rank::Weak => 3,
        }
    }

    pub fn all() -> [Rank; RANK_COUNT] {
        [Rank::Ambiguous, Rank::Exact, Rank::Final, Rank::Weak]
    }
}

bitflags! {
    /// A subset of [`Rank`]. Segments carry a singleton or empty `RankSet`;
    /// roots carry a singleton.
    pub struct RankSet: u8 {
        const AMBIGUOUS = 0b0001;
        const EXACT     = 0b0010;
        const FINAL     = 0b0100;
        const WEAK      = 0b1000;
    }
}

impl RankSet {
    pub fn of(rank: Rank) -> RankSet {
        match rank {
            Rank::Ambiguous => RankSet::AMBIGUOUS,
            Rank::Exact => RankSet::EXACT,
            Rank::Final => RankSet::FINAL,
            Rank::Weak => RankSet::WEAK,
        }
    }

    /// Returns the single rank in this set, or `None` if empty or mixed.
    pub fn single(self) -> Option<Rank> {
        for rank in Rank::all() {
            if self == RankSet::of(rank) {
                return Some(rank);
            }
        }
        None
    }
}

/// The tri-colour mark of an object with respect to one trace. Derived,
/// never stored directly: AMS/AWL compute it from the `(alloc, mark,
/// scanned)` bit triple; it is meaningless for SNC, whose
/// objects never participate in a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Grey,
    Black,
}

static_assertions::const_assert!(std::mem::size_of::<Word>() >= 4);
