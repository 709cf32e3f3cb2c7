// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The allocation buffer / allocation point.
//!
//! `AllocPoint` is the client's fast-path bump allocator: `reserve`
//! returns a candidate base address, the client initializes the object,
//! then `commit` finalizes it -- unless a flip happened in between, in
//! which case the client must re-initialize and re-reserve.
//! `frame_push`/`frame_pop` are SNC-only lightweight
//! stack frames. The arena owns every `ApRecord` in its `aps` slab;
//! `AllocPoint` is just a stable id plus the `Arc<Arena>` needed to reach
//! it, the same ownership shape as [`crate::root::Root`].

use std::sync::Arc;

use crate::arena::{Arena, ApId, ArenaInner, PoolId, SegId};
use crate::error::{Error, Result};
use crate::pool::{ams, awl, snc, Pool, PoolClass};
use crate::types::{Addr, Rank};

pub struct ApRecord {
    pub pool: PoolId,
    pub class: PoolClass,
    pub rank: Rank,
    pub seg: Option<SegId>,
    /// Boundary of already-committed content in the current segment
    /// (`init` in `segBase <= base <= init <= alloc <= limit <=
    /// segLimit`).
    pub init: Addr,
    pub limit: Addr,
    /// The in-flight `(base, size)` of a `reserve` not yet `commit`ted.
    pending: Option<(Addr, usize)>,
    /// The arena's `flip_epoch` as of the most recent `reserve`, used to
    /// detect an intervening flip at `commit` time.
    reserved_epoch: u64,
    ramp_depth: u32,
    /// SNC only: the chain of segments this buffer has pushed, top
    /// (current) last.
    pub snc_chain: Vec<SegId>,
}

/// Client handle to an allocation point.
pub struct AllocPoint {
    arena: Arc<Arena>,
    pool: PoolId,
    id: ApId,
}

fn detach_current(inner: &mut ArenaInner, id: ApId) -> Result<()> {
    let (pool, class, seg, init) = {
        let rec = inner.ap(id)?;
        (rec.pool, rec.class, rec.seg, rec.init)
    };
    if let Some(seg) = seg {
        match class {
            PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl => {
                ams::buffer_empty(inner, pool, seg, init)?
            }
            PoolClass::Snc => snc::buffer_empty(inner, pool, seg, init)?,
            _ => return Err(Error::Unimplemented),
        }
        inner.ap_mut(id)?.seg = None;
    }
    Ok(())
}

fn ensure_room(inner: &mut ArenaInner, id: ApId, size: usize) -> Result<()> {
    let (has_room, class, rank) = {
        let rec = inner.ap(id)?;
        (
            rec.seg.is_some() && rec.limit.saturating_sub(rec.init) >= size,
            rec.class,
            rec.rank,
        )
    };
    if has_room {
        return Ok(());
    }
    detach_current(inner, id)?;
    let min_size = size.max(inner.grain_size);
    let (seg, base, limit) = match class {
        PoolClass::Ams | PoolClass::AmsDebug => {
            let pool = inner.ap(id)?.pool;
            ams::buffer_fill(inner, pool, rank, min_size)?
        }
        PoolClass::Awl => {
            let pool = inner.ap(id)?.pool;
            awl::buffer_fill(inner, pool, rank, min_size)?
        }
        PoolClass::Snc => {
            let pool = inner.ap(id)?.pool;
            let mut chain = std::mem::take(&mut inner.ap_mut(id)?.snc_chain);
            let result = snc::buffer_fill(inner, pool, min_size, &mut chain);
            inner.ap_mut(id)?.snc_chain = chain;
            result?
        }
        _ => return Err(Error::Unimplemented),
    };
    if let Ok(s) = inner.segment_mut(seg) {
        s.buffered = Some((base, limit));
    }
    let rec = inner.ap_mut(id)?;
    rec.seg = Some(seg);
    rec.init = base;
    rec.limit = limit;
    Ok(())
}

impl AllocPoint {
    pub fn create(pool: &Pool, rank: Rank) -> Result<AllocPoint> {
        let mut inner = pool.arena().lock();
        let class = inner
            .pools
            .get(pool.id())
            .ok_or(Error::Param)?
            .class;
        let id = inner.aps.insert(ApRecord {
            pool: pool.id(),
            class,
            rank,
            seg: None,
            init: 0,
            limit: 0,
            pending: None,
            reserved_epoch: 0,
            ramp_depth: 0,
            snc_chain: Vec::new(),
        });
        drop(inner);
        Ok(AllocPoint {
            arena: Arc::clone(pool.arena()),
            pool: pool.id(),
            id,
        })
    }

    /// `reserve(ap, size)`: returns a candidate base address for an
    /// object of `size` bytes, calling the pool's `bufferFill` for a
    /// fresh region if the current one has no room.
    pub fn reserve(&mut self, size: usize) -> Result<Addr> {
        if size == 0 {
            return Err(Error::Param);
        }
        let mut inner = self.arena.lock();
        ensure_room(&mut inner, self.id, size)?;
        let epoch = inner.flip_epoch;
        let rec = inner.ap_mut(self.id)?;
        let base = rec.init;
        rec.pending = Some((base, size));
        rec.reserved_epoch = epoch;
        Ok(base)
    }

    /// `commit(ap, base, size)`: finalizes a previously reserved object.
    /// Fails with `Error::Fail` if a flip intervened since `reserve`; the
    /// client must re-initialize the object and `reserve` again.
    pub fn commit(&mut self, base: Addr, size: usize) -> Result<()> {
        let mut inner = self.arena.lock();
        let (class, seg, reserved_epoch) = {
            let rec = inner.ap_mut(self.id)?;
            match rec.pending {
                Some((b, s)) if b == base && s == size => {}
                _ => return Err(Error::Param),
            }
            (rec.class, rec.seg, rec.reserved_epoch)
        };
        if inner.flip_epoch != reserved_epoch {
            inner.ap_mut(self.id)?.pending = None;
            return Err(Error::Fail);
        }
        let seg = seg.ok_or(Error::Param)?;
        match class {
            PoolClass::Ams | PoolClass::AmsDebug | PoolClass::Awl => {
                ams::commit_black(&mut inner, seg, base, size)?;
            }
            PoolClass::Snc => {} // SNC objects carry no colour.
            _ => return Err(Error::Unimplemented),
        }
        let rec = inner.ap_mut(self.id)?;
        rec.init = base + size;
        rec.pending = None;
        let new_init = rec.init;
        let limit = rec.limit;
        if let Ok(s) = inner.segment_mut(seg) {
            s.buffered = Some((new_init, limit));
        }
        inner.update_shield(seg);
        Ok(())
    }

    /// `detach(ap)`: pads the unused region and returns the AP to an
    /// unattached state.
    pub fn detach(&mut self) -> Result<()> {
        let mut inner = self.arena.lock();
        detach_current(&mut inner, self.id)?;
        let rec = inner.ap_mut(self.id)?;
        rec.init = 0;
        rec.limit = 0;
        Ok(())
    }

    /// `allocPatternBegin(ramp)`: marks the following allocations as part
    /// of a ramp (a burst expected to mostly die quickly); nestable.
    /// Carried as a pure counter here since no pool class in this core
    /// changes its allocation strategy in response.
    pub fn alloc_pattern_begin(&mut self) {
        let mut inner = self.arena.lock();
        if let Ok(rec) = inner.ap_mut(self.id) {
            rec.ramp_depth += 1;
        }
    }

    pub fn alloc_pattern_end(&mut self) {
        let mut inner = self.arena.lock();
        if let Ok(rec) = inner.ap_mut(self.id) {
            rec.ramp_depth = rec.ramp_depth.saturating_sub(1);
        }
    }

    pub fn in_ramp(&self) -> bool {
        let inner = self.arena.lock();
        inner.ap(self.id).map_or(false, |r| r.ramp_depth > 0)
    }

    /// `framePush(ap)`: returns an opaque marker at the current `init`,
    /// or `None` at the bottom of the stack.
    pub fn frame_push(&mut self) -> Option<Addr> {
        let inner = self.arena.lock();
        let rec = inner.ap(self.id).ok()?;
        if !matches!(rec.class, PoolClass::Snc) || rec.seg.is_none() {
            None
        } else {
            Some(rec.init)
        }
    }

    /// `framePop(ap, marker)`: discards every object allocated above
    /// `marker`, freeing any now-empty segments back to the pool's free
    /// list. `None` pops to the bottom of the stack.
    pub fn frame_pop(&mut self, marker: Option<Addr>) -> Result<()> {
        let mut inner = self.arena.lock();
        let (class, seg) = {
            let rec = inner.ap(self.id)?;
            (rec.class, rec.seg)
        };
        if !matches!(class, PoolClass::Snc) {
            return Err(Error::Unimplemented);
        }
        let mut chain = std::mem::take(&mut inner.ap_mut(self.id)?.snc_chain);
        let result = snc::frame_pop(&mut inner, self.pool, &mut chain, seg, marker);
        inner.ap_mut(self.id)?.snc_chain = chain;
        let (new_top_seg, new_init) = result?;
        let limit = match new_top_seg {
            Some(seg) => inner.segment(seg)?.limit,
            None => 0,
        };
        let rec = inner.ap_mut(self.id)?;
        rec.seg = new_top_seg;
        rec.init = new_init;
        rec.limit = limit;
        if let Some(seg) = new_top_seg {
            if let Ok(s) = inner.segment_mut(seg) {
                s.buffered = Some((new_init, limit));
            }
        }
        Ok(())
    }

    pub fn init(&self) -> Addr {
        self.arena.lock().ap(self.id).map_or(0, |r| r.init)
    }

    pub fn limit(&self) -> Addr {
        self.arena.lock().ap(self.id).map_or(0, |r| r.limit)
    }

    pub fn segment(&self) -> Option<SegId> {
        self.arena.lock().ap(self.id).ok().and_then(|r| r.seg)
    }
}

impl Drop for AllocPoint {
    fn drop(&mut self) {
        let mut inner = self.arena.lock();
        let _ = detach_current(&mut inner, self.id);
        inner.aps.remove(self.id);
    }
}
