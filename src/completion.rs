// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The completion engine: one drain routine over any completion queue, in
//! blocking and polling modes. Provider error entries are mapped into the
//! crate error taxonomy here and nowhere else.

use std::thread;

use log::*;
use nix::errno::Errno;

use crate::fabric::{CompletionQueue, CqError, CqPoll};
use crate::{Error, Result};

/// Outcome of one polling drain.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Drained {
    One,
    Empty,
}

/// Spin on `cq` until one completion is drained or an error entry surfaces.
pub(crate) fn wait_for_completion(cq: &dyn CompletionQueue) -> Result<()> {
    loop {
        match cq.read() {
            CqPoll::Completed => return Ok(()),
            CqPoll::WouldBlock => thread::yield_now(),
            CqPoll::Failed(err) => return Err(map_cq_error(err)),
        }
    }
}

/// Drain at most one completion from `cq` without blocking.
pub(crate) fn poll_completion(cq: &dyn CompletionQueue) -> Result<Drained> {
    match cq.read() {
        CqPoll::Completed => Ok(Drained::One),
        CqPoll::WouldBlock => Ok(Drained::Empty),
        CqPoll::Failed(err) => Err(map_cq_error(err)),
    }
}

fn map_cq_error(err: CqError) -> Error {
    let errno = Errno::from_raw(err.errno);
    warn!("completion error entry: {} ({})", errno.desc(), err.detail);

    match errno {
        Errno::EACCES => Error::PermissionDenied(err.detail),
        _ => Error::Completion {
            errno: err.errno,
            detail: err.detail,
        },
    }
}
