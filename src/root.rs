// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Root registration and the ephemeral scan state.
//!
//! A root describes a location set the mutator treats as live: a table of
//! words (optionally mask-filtered), a thread's registers-and-stack, or a
//! client callback. [`ScanState`] is the per-scan-pass record the fix
//! protocol runs through, shared by ordinary trace scanning
//! ([`crate::pool::ams::scan`], the AWL barrier path) and root walking
//! ([`crate::walk::arena_roots_walk`]).

use std::sync::{Arc, Mutex};

use crate::arena::{Arena, ArenaInner, PoolId, RootId, SegId};
use crate::error::{Error, Result};
use crate::pool::{self, FixOutcome};
use crate::thread::ThreadRoots;
use crate::trace::TraceId;
use crate::types::{Addr, Rank, Word};

/// A source of candidate reference words for a table root. [`VecTable`]
/// is the concrete implementation used by `Root::create_table`/
/// `create_table_masked`; clients needing a live view onto their own
/// storage may implement this directly instead.
pub trait TableSource: Send + Sync {
    fn words(&self) -> Vec<Word>;
}

/// A simple owned snapshot table, mutable via [`VecTable::set`] so a
/// client can update its root set between collections without destroying
/// and recreating the root.
pub struct VecTable(Mutex<Vec<Word>>);

impl VecTable {
    pub fn new(words: Vec<Word>) -> Arc<Self> {
        Arc::new(VecTable(Mutex::new(words)))
    }

    pub fn set(&self, words: Vec<Word>) {
        *self.0.lock().unwrap() = words;
    }
}

impl TableSource for VecTable {
    fn words(&self) -> Vec<Word> {
        self.0.lock().unwrap().clone()
    }
}

/// The kind of location set a root describes.
pub enum RootKind {
    /// `rootCreateTable`: every word in the table is a candidate
    /// reference.
    Table(Arc<dyn TableSource>),
    /// `rootCreateTableMasked`: words where `word & mask != 0` are
    /// ignored (e.g. a tagged-value discriminant bit).
    TableMasked(Arc<dyn TableSource>, Word),
    /// `rootCreateStack`/`rootCreateReg`: a registered thread's spilled
    /// registers and live stack range, supplied by the client.
    RegistersAndStack(Arc<dyn ThreadRoots>),
    /// A client callback that reports each candidate reference to a sink
    /// function.
    ScanCallback(Arc<dyn Fn(&mut dyn FnMut(Addr)) + Send + Sync>),
}

pub struct RootRecord {
    pub rank: Rank,
    pub kind: RootKind,
}

impl RootRecord {
    /// Every candidate reference word this root currently describes, with
    /// `TableMasked` filtering already applied.
    pub fn candidate_words(&self) -> Vec<Word> {
        match &self.kind {
            RootKind::Table(t) => t.words(),
            RootKind::TableMasked(t, mask) => {
                t.words().into_iter().filter(|w| w & mask == 0).collect()
            }
            RootKind::RegistersAndStack(tr) => tr.ambiguous_words(),
            RootKind::ScanCallback(cb) => {
                let mut out = Vec::new();
                cb(&mut |a| out.push(a));
                out
            }
        }
    }
}

/// Client handle to a registered root.
pub struct Root {
    arena: Arc<Arena>,
    id: RootId,
}

impl Root {
    pub fn create_table(arena: &Arc<Arena>, rank: Rank, table: Arc<dyn TableSource>) -> Result<Root> {
        Self::create(arena, rank, RootKind::Table(table))
    }

    pub fn create_table_masked(
        arena: &Arc<Arena>,
        rank: Rank,
        table: Arc<dyn TableSource>,
        mask: Word,
    ) -> Result<Root> {
        Self::create(arena, rank, RootKind::TableMasked(table, mask))
    }

    pub fn create_stack(arena: &Arc<Arena>, rank: Rank, roots: Arc<dyn ThreadRoots>) -> Result<Root> {
        Self::create(arena, rank, RootKind::RegistersAndStack(roots))
    }

    pub fn create_reg(arena: &Arc<Arena>, rank: Rank, roots: Arc<dyn ThreadRoots>) -> Result<Root> {
        Self::create(arena, rank, RootKind::RegistersAndStack(roots))
    }

    pub fn create_callback(
        arena: &Arc<Arena>,
        rank: Rank,
        cb: Arc<dyn Fn(&mut dyn FnMut(Addr)) + Send + Sync>,
    ) -> Result<Root> {
        Self::create(arena, rank, RootKind::ScanCallback(cb))
    }

    fn create(arena: &Arc<Arena>, rank: Rank, kind: RootKind) -> Result<Root> {
        let mut inner = arena.lock();
        let id = inner.roots.insert(RootRecord { rank, kind });
        Ok(Root {
            arena: Arc::clone(arena),
            id,
        })
    }

    pub fn id(&self) -> RootId {
        self.id
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        self.arena.lock().roots.remove(self.id);
    }
}

/// The ephemeral scan-state record: which trace
/// it serves (or, in walk mode, the closure it reports to), the current
/// rank, and a running summary of references seen.
enum Mode<'a> {
    Normal(TraceId),
    Walk(&'a mut dyn FnMut(Addr)),
}

pub struct ScanState<'a> {
    arena: &'a mut ArenaInner,
    mode: Mode<'a>,
    pub rank: Rank,
    pub summary: Option<(Addr, Addr)>,
    pub ambiguous_fixes: bool,
}

impl<'a> ScanState<'a> {
    pub fn new_normal(arena: &'a mut ArenaInner, trace: TraceId, rank: Rank) -> Self {
        ScanState {
            arena,
            mode: Mode::Normal(trace),
            rank,
            summary: None,
            ambiguous_fixes: false,
        }
    }

    /// Root-walk mode: `fix` invokes `cb` instead of marking, and never
    /// mutates segment state, giving the root-walk non-mutation property
    /// for free.
    pub fn new_walk(arena: &'a mut ArenaInner, rank: Rank, cb: &'a mut dyn FnMut(Addr)) -> Self {
        ScanState {
            arena,
            mode: Mode::Walk(cb),
            rank,
            summary: None,
            ambiguous_fixes: false,
        }
    }

    fn extend_summary(&mut self, addr: Addr) {
        self.summary = Some(match self.summary {
            Some((lo, hi)) => (lo.min(addr), hi.max(addr + 1)),
            None => (addr, addr + 1),
        });
    }

    /// Reads one candidate reference word from client memory at `addr`
    /// and runs it through the fix protocol; if the result is a weak
    /// splat, zeroes the word at `addr` in place (the weak-splat law).
    pub fn fix_area(&mut self, addr: Addr) -> Result<()> {
        let word_size = std::mem::size_of::<Word>();
        let bytes = self.arena.vm.read(addr, word_size).to_vec();
        let mut buf = [0u8; std::mem::size_of::<Word>()];
        buf.copy_from_slice(&bytes);
        let value = Word::from_ne_bytes(buf);
        let outcome = self.fix_value(value)?;
        if outcome == FixOutcome::Splat {
            self.arena.vm.write(addr, &0usize.to_ne_bytes());
        }
        Ok(())
    }

    /// Runs one candidate reference value through the fix protocol
    /// directly, with no client-memory storage location to write a splat
    /// back to (used for root-table entries, which are not expected to
    /// carry weak references in practice).
    pub fn fix_value(&mut self, value: Addr) -> Result<FixOutcome> {
        if value == 0 {
            return Ok(FixOutcome::Unchanged);
        }
        match &mut self.mode {
            Mode::Walk(cb) => {
                if self.arena.has_addr(value) {
                    cb(value);
                }
                Ok(FixOutcome::Unchanged)
            }
            Mode::Normal(trace) => {
                let trace = *trace;
                let in_zone = self
                    .arena
                    .traces
                    .get(trace)
                    .and_then(|t| t.as_ref())
                    .map_or(false, |t| t.in_white_zone(value));
                if !in_zone {
                    return Ok(FixOutcome::Unchanged); // stage 1: white-zone mask miss.
                }
                let seg: SegId = match self.arena.segment_containing(value) {
                    Some(s) => s,
                    None => return Ok(FixOutcome::Unchanged),
                };
                let (is_white_for_trace, seg_base, pool_id) = {
                    let s = self.arena.segment(seg)?;
                    (s.white == Some(trace), s.base, s.pool)
                };
                if !is_white_for_trace {
                    return Ok(FixOutcome::Unchanged); // stage 2: not condemned by this trace.
                }
                if self.rank == Rank::Ambiguous {
                    let grain_size = self.arena.grain_size;
                    if (value - seg_base) % grain_size != 0 {
                        return Ok(FixOutcome::Unchanged);
                    }
                }
                self.extend_summary(value);
                if self.rank == Rank::Ambiguous {
                    self.ambiguous_fixes = true;
                }
                pool::fix(self.arena, pool_id, seg, trace, self.rank, value)
            }
        }
    }
}

static_assertions::assert_impl_all!(RootId: Copy);
static_assertions::assert_impl_all!(PoolId: Copy);
