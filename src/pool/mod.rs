// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The pool class framework.
//!
//! Pool classes are a closed set, dispatched by enum+match rather than a
//! trait object: every class needs mutable access to segments the arena
//! owns, and a trait-object `&mut self` would fight the borrow checker for
//! no benefit (no class carries any state of its own -- it is all in
//! [`crate::arena::Segment`] payloads and [`PoolRecord`]). `Amc`/`Amcz` are
//! kept as recognized identifiers that return [`Error::Unimplemented`],
//! since only AMS/AWL and SNC are implemented here.

pub mod ams;
pub mod awl;
pub mod snc;

use std::sync::Arc;

use log::debug;

use crate::arena::{ArenaInner, PoolId, SegId, TraceId};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::format::Format;
use crate::types::{Addr, Rank};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolClass {
    Ams,
    AmsDebug,
    Awl,
    Snc,
    Amc,
    Amcz,
}

/// One generation in a pool's `CHAIN`: its configured capacity/mortality
/// plus the bookkeeping needed to decide when it is due for condemning.
#[derive(Debug, Clone, Default)]
pub struct GenerationRecord {
    pub capacity: usize,
    pub mortality: f64,
    pub new_size: usize,
    pub segments: Vec<SegId>,
}

pub struct PoolRecord {
    pub class: PoolClass,
    pub format: Option<Arc<dyn Format>>,
    pub config: PoolConfig,
    pub generations: Vec<GenerationRecord>,
    pub segments: Vec<SegId>,
    pub free_segments: Vec<SegId>,
}

impl PoolRecord {
    pub fn new(class: PoolClass, format: Option<Arc<dyn Format>>, config: PoolConfig) -> Self {
        let generations = config
            .chain
            .as_ref()
            .map(|chain| {
                chain
                    .0
                    .iter()
                    .map(|g| GenerationRecord {
                        capacity: g.capacity,
                        mortality: g.mortality,
                        new_size: 0,
                        segments: Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        PoolRecord {
            class,
            format,
            config,
            generations,
            segments: Vec::new(),
            free_segments: Vec::new(),
        }
    }
}

/// The outcome of fixing one candidate reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixOutcome {
    /// Nothing to do, or the object was greyed in place; the stored word
    /// is unchanged.
    Unchanged,
    /// The reference's target was white and the rank is `Weak`: the
    /// caller must zero the stored word.
    Splat,
}

/// Stage 3 of the fix protocol: dispatch to the owning pool's `fix`.
/// Stages 1-2 (white-zone mask, segment white-for-trace check) are
/// performed by the caller ([`crate::root::ScanState::fix_value`]) before
/// this is reached.
pub fn fix(
    arena: &mut ArenaInner,
    pool: PoolId,
    seg: SegId,
    trace: TraceId,
    rank: Rank,
    value: Addr,
) -> Result<FixOutcome> {
    let class = arena.pools.get(pool).ok_or(Error::Param)?.class;
    match class {
        PoolClass::Ams | PoolClass::AmsDebug => ams::fix(arena, pool, seg, trace, rank, value),
        PoolClass::Awl => awl::fix(arena, pool, seg, trace, rank, value),
        PoolClass::Snc => Ok(FixOutcome::Unchanged),
        PoolClass::Amc | PoolClass::Amcz => Err(Error::Unimplemented),
    }
}

pub fn whiten(arena: &mut ArenaInner, pool: PoolId, seg: SegId, trace: TraceId) -> Result<()> {
    let class = arena.pools.get(pool).ok_or(Error::Param)?.class;
    debug!("pool {:?}: whiten segment {:?} for trace {}", pool, seg, trace);
    match class {
        PoolClass::Ams | PoolClass::AmsDebug => ams::whiten(arena, seg, trace),
        PoolClass::Awl => awl::whiten(arena, seg, trace),
        PoolClass::Snc => Ok(()), // SNC segments are never condemned.
        PoolClass::Amc | PoolClass::Amcz => Err(Error::Unimplemented),
    }
}

pub fn grey(arena: &mut ArenaInner, pool: PoolId, seg: SegId, trace: TraceId) -> Result<()> {
    let class = arena.pools.get(pool).ok_or(Error::Param)?.class;
    match class {
        PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl => {
            let seg_mut = arena.segment_mut(seg)?;
            if !seg_mut.is_grey_for(trace) {
                seg_mut.set_grey_for(trace, true);
                arena.update_shield(seg);
                if let Some(t) = arena.traces[trace].as_mut() {
                    t.enqueue_grey(pool, seg);
                }
            }
            Ok(())
        }
        PoolClass::Snc => Ok(()),
        PoolClass::Amc | PoolClass::Amcz => Err(Error::Unimplemented),
    }
}

/// Marks every live object in `seg` black without scanning its outgoing
/// references -- the non-allocating "conservative path" emergency mode
/// falls back to, and an ordinary way to opt a segment
/// out of incremental scanning. Anything preserved this way is accounted
/// in `Trace::preserved_in_place`.
pub fn blacken(arena: &mut ArenaInner, pool: PoolId, seg: SegId, trace: TraceId) -> Result<usize> {
    let class = arena.pools.get(pool).ok_or(Error::Param)?.class;
    match class {
        PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl => ams::blacken(arena, seg, trace),
        PoolClass::Snc => Ok(0),
        PoolClass::Amc | PoolClass::Amcz => Err(Error::Unimplemented),
    }
}

/// Scans `seg`'s grey objects for `trace`, returning whether any
/// ambiguous fix forced a whole-segment re-walk.
pub fn scan(arena: &mut ArenaInner, pool: PoolId, seg: SegId, trace: TraceId) -> Result<()> {
    let class = arena.pools.get(pool).ok_or(Error::Param)?.class;
    match class {
        PoolClass::Ams | PoolClass::AmsDebug => ams::scan(arena, pool, seg, trace),
        PoolClass::Awl => awl::scan(arena, pool, seg, trace),
        PoolClass::Snc => Ok(()),
        PoolClass::Amc | PoolClass::Amcz => Err(Error::Unimplemented),
    }
}

pub fn reclaim(arena: &mut ArenaInner, pool: PoolId, seg: SegId, trace: TraceId) -> Result<(usize, usize)> {
    let class = arena.pools.get(pool).ok_or(Error::Param)?.class;
    match class {
        PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl => ams::reclaim(arena, pool, seg, trace),
        PoolClass::Snc => Ok((0, 0)),
        PoolClass::Amc | PoolClass::Amcz => Err(Error::Unimplemented),
    }
}

/// Iterates every live object in `seg`, calling `cb(object_base, size)`.
/// Used by both [`crate::walk::formatted_objects_walk`] and
/// [`crate::walk::pool_walk`].
pub fn walk_segment(
    arena: &ArenaInner,
    pool: PoolId,
    seg: SegId,
    cb: &mut dyn FnMut(Addr, usize),
) -> Result<()> {
    let class = arena.pools.get(pool).ok_or(Error::Param)?.class;
    match class {
        PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl => ams::walk(arena, pool, seg, cb),
        PoolClass::Snc => snc::walk(arena, pool, seg, cb),
        PoolClass::Amc | PoolClass::Amcz => Err(Error::Unimplemented),
    }
}

pub fn total_size(arena: &ArenaInner, pool: PoolId) -> usize {
    arena
        .segments_of_pool(pool)
        .into_iter()
        .filter_map(|id| arena.segment(id).ok())
        .map(|s| s.limit - s.base)
        .sum()
}

pub fn free_size(arena: &ArenaInner, pool: PoolId) -> usize {
    let class = match arena.pools.get(pool) {
        Some(p) => p.class,
        None => return 0,
    };
    match class {
        PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl => ams::free_size(arena, pool),
        PoolClass::Snc => snc::free_size(arena, pool),
        PoolClass::Amc | PoolClass::Amcz => 0,
    }
}

pub fn describe(arena: &ArenaInner, pool: PoolId) -> String {
    let rec = match arena.pools.get(pool) {
        Some(r) => r,
        None => return String::from("<destroyed pool>"),
    };
    format!(
        "pool {:?}: class={:?} segments={} total={} free={}",
        pool,
        rec.class,
        rec.segments.len(),
        total_size(arena, pool),
        free_size(arena, pool)
    )
}

mod handle {
    use std::sync::Arc;

    use crate::arena::{Arena, PoolId, SegId};
    use crate::config::PoolConfig;
    use crate::error::{Error, Result};
    use crate::format::Format;
    use crate::types::Addr;

    use super::{awl, describe, free_size, total_size, walk_segment, PoolClass, PoolRecord};

    /// Client handle to a pool.
    pub struct Pool {
        arena: Arc<Arena>,
        id: PoolId,
    }

    impl Pool {
        pub fn create(
            arena: &Arc<Arena>,
            class: PoolClass,
            format: Option<Arc<dyn Format>>,
            config: PoolConfig,
        ) -> Result<Pool> {
            if matches!(class, PoolClass::Amc | PoolClass::Amcz) {
                return Err(Error::Unimplemented);
            }
            if !matches!(class, PoolClass::Snc) && format.is_none() {
                return Err(Error::Param);
            }
            let mut inner = arena.lock();
            let id = inner.pools.insert(PoolRecord::new(class, format, config));
            Ok(Pool {
                arena: Arc::clone(arena),
                id,
            })
        }

        pub fn id(&self) -> PoolId {
            self.id
        }

        pub fn arena(&self) -> &Arc<Arena> {
            &self.arena
        }

        /// `poolWalk`: iterates every live object via an area-scan style
        /// callback that never fixes. Requires a parked arena.
        pub fn walk(&self, cb: &mut dyn FnMut(Addr, usize)) -> Result<()> {
            let inner = self.arena.lock();
            if !inner.parked {
                return Err(Error::Param);
            }
            let segs = inner.segments_of_pool(self.id);
            for seg in segs {
                walk_segment(&inner, self.id, seg, cb)?;
            }
            Ok(())
        }

        pub fn total_size(&self) -> usize {
            total_size(&self.arena.lock(), self.id)
        }

        pub fn free_size(&self) -> usize {
            free_size(&self.arena.lock(), self.id)
        }

        pub fn describe(&self) -> String {
            describe(&self.arena.lock(), self.id)
        }

        /// Host-invoked protection-fault handler: a real embedding calls
        /// this from its VM trap handler when the mutator touches a
        /// read-protected segment. Only AWL pools make use of the
        /// single-access budget path; every other class declines.
        pub fn barrier_hit(&self, seg: SegId, fault_addr: Addr) -> Result<()> {
            let mut inner = self.arena.lock();
            let class = inner.pools.get(self.id).ok_or(Error::Param)?.class;
            match class {
                PoolClass::Awl => awl::barrier_hit(&mut inner, self.id, seg, fault_addr),
                _ => Err(Error::Unimplemented),
            }
        }

        /// Diagnostic introspection of a segment's colour state: whether
        /// `seg` is currently white for some trace, and grey for some
        /// currently flipped trace.
        pub fn segment_state(&self, seg: SegId) -> Result<(bool, bool)> {
            let inner = self.arena.lock();
            let flipped = inner.flipped;
            let s = inner.segment(seg)?;
            Ok((s.white.is_some(), s.grey_for_any_flipped(flipped)))
        }
    }

    impl Drop for Pool {
        fn drop(&mut self) {
            let mut inner = self.arena.lock();
            if let Some(rec) = inner.pools.get(self.id) {
                let segs = rec.segments.clone();
                for seg in segs {
                    let _ = inner.free_segment(seg);
                }
            }
            inner.pools.remove(self.id);
        }
    }
}

pub use handle::Pool;
