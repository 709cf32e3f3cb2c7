// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The collector's exhaustive status-code taxonomy.
//!
//! Every public operation returns [`Result<T>`]. Internal consistency
//! violations (broken invariants in checked builds) are never represented
//! here: they are `assert!`/`debug_assert!` panics, because reporting them
//! as an `Err` would imply the arena is still usable afterwards.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable failure of a public operation.
///
/// `Memory`, `Resource`, `Limit`, and `Fail` are recoverable: the arena
/// remains in a consistent state and the client may retry or give up.
/// `Unimplemented`, `Io`, and `Param` indicate a programming mistake by the
/// client rather than a transient condition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Allocation exhaustion: the arena or a control-pool allocation could
    /// not be satisfied.
    #[error("out of memory")]
    Memory,

    /// The virtual-memory provider declined to commit or protect memory.
    #[error("out of operating system resource")]
    Resource,

    /// A configured limit (e.g. the busy-trace set, a generation capacity)
    /// was reached.
    #[error("configured limit reached")]
    Limit,

    /// The pool class does not implement this operation.
    #[error("operation not supported by this pool class")]
    Unimplemented,

    /// The operation was semantically declined (e.g. `singleAccess` could
    /// not handle the fault and the caller must fall back).
    #[error("operation declined")]
    Fail,

    /// An I/O error from an external collaborator.
    #[error("i/o error")]
    Io,

    /// An invalid argument was supplied.
    #[error("invalid argument")]
    Param,
}

impl Error {
    /// `Memory`, `Resource`, `Limit`, and `Fail` are recoverable;
    /// the rest indicate a client programming error.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Error::Memory | Error::Resource | Error::Limit | Error::Fail
        )
    }
}
