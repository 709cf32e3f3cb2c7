// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Configuration surface for the recognized configuration options, built
//! as typed structs rather than a generic key/value option list, with a
//! `DebugFlags`-style builder for the trace engine's debug toggles.

use crate::types::{Rank, RankSet};

/// `ARENA_SIZE` / `ARENA_GRAIN_SIZE`.
#[derive(Debug, Clone, Copy)]
pub struct ArenaConfig {
    pub arena_size: usize,
    pub arena_grain_size: usize,
    pub debug: DebugFlags,
}

impl ArenaConfig {
    pub fn new(arena_size: usize, arena_grain_size: usize) -> Self {
        ArenaConfig {
            arena_size,
            arena_grain_size,
            debug: DebugFlags::new(),
        }
    }

    pub fn debug_flags(mut self, flags: DebugFlags) -> Self {
        self.debug = flags;
        self
    }
}

/// One entry of a pool's `CHAIN`: a generation's capacity (bytes of new
/// allocation that trigger condemning it) and its configured mortality
/// (the fraction of objects expected to die; used only to decide whether
/// condemning is "worth it" once capacity is exceeded).
#[derive(Debug, Clone, Copy)]
pub struct GenParams {
    pub capacity: usize,
    pub mortality: f64,
}

impl GenParams {
    pub fn new(capacity: usize, mortality: f64) -> Self {
        GenParams { capacity, mortality }
    }
}

/// `CHAIN`: an ordered list of generations, leaves (nursery) first.
#[derive(Debug, Clone, Default)]
pub struct Chain(pub Vec<GenParams>);

impl Chain {
    pub fn new(gens: Vec<GenParams>) -> Self {
        Chain(gens)
    }
}

/// `POOL_DEBUG_OPTIONS`: the splat pattern written over freed grains and
/// whether to double-check grains are actually free before reuse.
#[derive(Debug, Clone, Copy)]
pub struct PoolDebugOptions {
    pub splat_pattern: u8,
    pub free_check: bool,
}

impl Default for PoolDebugOptions {
    fn default() -> Self {
        PoolDebugOptions {
            splat_pattern: 0,
            free_check: false,
        }
    }
}

/// `AWL_FIND_DEPENDENT`: the client-supplied callback an AWL pool uses to
/// locate an object's dependent (single-reference target), for the
/// single-access barrier path.
pub type FindDependent = std::sync::Arc<dyn Fn(usize) -> Option<usize> + Send + Sync>;

/// Per-pool configuration: `CHAIN`, `GEN`, `RANK_SET`,
/// `POOL_DEBUG_OPTIONS`, `AMS_SUPPORT_AMBIGUOUS`, `AWL_FIND_DEPENDENT`.
#[derive(Clone, Default)]
pub struct PoolConfig {
    pub chain: Option<Chain>,
    pub gen: Option<usize>,
    pub rank_set: Option<RankSet>,
    pub debug_options: Option<PoolDebugOptions>,
    pub support_ambiguous: bool,
    pub find_dependent: Option<FindDependent>,
    /// `segSALimit`: AWL's per-segment single-access budget.
    pub seg_sa_limit: usize,
    /// `totalSALimit`: AWL's per-trace total single-access budget.
    pub total_sa_limit: usize,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("chain", &self.chain)
            .field("gen", &self.gen)
            .field("rank_set", &self.rank_set)
            .field("debug_options", &self.debug_options)
            .field("support_ambiguous", &self.support_ambiguous)
            .field("find_dependent", &self.find_dependent.is_some())
            .field("seg_sa_limit", &self.seg_sa_limit)
            .field("total_sa_limit", &self.total_sa_limit)
            .finish()
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        PoolConfig {
            seg_sa_limit: usize::MAX,
            total_sa_limit: usize::MAX,
            ..Default::default()
        }
    }

    pub fn chain(mut self, chain: Chain) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn gen(mut self, gen: usize) -> Self {
        self.gen = Some(gen);
        self
    }

    pub fn rank(mut self, rank: Rank) -> Self {
        self.rank_set = Some(RankSet::of(rank));
        self
    }

    pub fn rank_set(mut self, rank_set: RankSet) -> Self {
        self.rank_set = Some(rank_set);
        self
    }

    pub fn debug_options(mut self, opts: PoolDebugOptions) -> Self {
        self.debug_options = Some(opts);
        self
    }

    pub fn support_ambiguous(mut self, yes: bool) -> Self {
        self.support_ambiguous = yes;
        self
    }

    pub fn find_dependent(mut self, cb: FindDependent) -> Self {
        self.find_dependent = Some(cb);
        self
    }

    pub fn seg_sa_limit(mut self, limit: usize) -> Self {
        self.seg_sa_limit = limit;
        self
    }

    pub fn total_sa_limit(mut self, limit: usize) -> Self {
        self.total_sa_limit = limit;
        self
    }
}

/// Debug toggles for the trace engine: individually disabling phases to
/// test that each one in isolation has the effect its invariant predicts.
#[derive(Debug, Clone, Copy)]
pub struct DebugFlags {
    pub whiten_phase: bool,
    pub scan_phase: bool,
    pub reclaim_phase: bool,
}

impl DebugFlags {
    pub fn new() -> Self {
        DebugFlags {
            whiten_phase: true,
            scan_phase: true,
            reclaim_phase: true,
        }
    }

    pub fn whiten_phase(mut self, val: bool) -> Self {
        self.whiten_phase = val;
        self
    }

    pub fn scan_phase(mut self, val: bool) -> Self {
        self.scan_phase = val;
        self
    }

    pub fn reclaim_phase(mut self, val: bool) -> Self {
        self.reclaim_phase = val;
        self
    }
}

impl Default for DebugFlags {
    fn default() -> Self {
        DebugFlags::new()
    }
}
