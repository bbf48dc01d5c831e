//! The poll dispatcher (spec §4.D): multiplexes reads across a
//! server fd and a contiguous range of client fds, invoking a
//! caller-supplied callback per framed message and retiring fds whose
//! peer has hung up.
//!
//! Grounded on the same `nix`-level polling primitives `conmon-rs`
//! reaches for elsewhere in its server (`oom_watcher.rs`, `terminal.rs`);
//! the "sticky set that retires dead fds" shape mirrors the bookkeeping
//! style of `child_reaper.rs`'s `HashMap` of live grandchildren, just
//! keyed by fd instead of pid.

use crate::error::Result;
use crate::frame::{read_frame, ReadFrame, DEFAULT_CMSG_BUFFER};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// A dispatch timeout in milliseconds; `None` blocks indefinitely.
/// Kept as a plain type here rather than threading `nix`'s own
/// `PollTimeout` through the public API, so callers of this module
/// don't need to depend on `nix` themselves.
fn to_poll_timeout(timeout_ms: Option<i32>) -> PollTimeout {
    match timeout_ms {
        None => PollTimeout::NONE,
        Some(ms) => PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX),
    }
}

/// One fd this dispatcher watches, and whether its peer has hung up.
struct Entry {
    fd: OwnedFd,
    retired: bool,
}

/// Multiplexes a server fd and a client fd range for a single
/// interpreter process. The set of watched fds is fixed at
/// construction and only ever shrinks (entries retire, they are never
/// added back), matching the "sticky across calls" behavior spec §4.D
/// requires so that a hung-up fd stays skipped on later `dispatch`
/// calls.
pub struct Dispatcher {
    entries: Vec<Entry>,
    cmsg_buffer: usize,
}

/// Outcome of a single [`Dispatcher::dispatch`] call.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// At least one fd was ready; `fd` is the last one processed in
    /// ascending scan order, per spec §4.D's "ordering" rule.
    Processed(RawFd),
    /// `poll` timed out with no fd ready.
    Timeout,
    /// The underlying `poll` syscall itself failed.
    PollFailed,
}

impl Dispatcher {
    /// Builds a dispatcher over `srv_fd` (if this process has a
    /// server) plus every fd in `cli_fds`. The set is built once, up
    /// front — equivalent to the source's "lazily allocated on first
    /// use" vector, since callers construct a `Dispatcher` immediately
    /// before their first `dispatch` call.
    pub fn new(srv_fd: Option<OwnedFd>, cli_fds: Vec<OwnedFd>) -> Self {
        Self::with_cmsg_buffer(srv_fd, cli_fds, DEFAULT_CMSG_BUFFER)
    }

    /// As [`Dispatcher::new`], with a caller-chosen ancillary-data
    /// buffer size (spec §9's "make this configurable" design note).
    pub fn with_cmsg_buffer(
        srv_fd: Option<OwnedFd>,
        cli_fds: Vec<OwnedFd>,
        cmsg_buffer: usize,
    ) -> Self {
        let mut entries = Vec::with_capacity(cli_fds.len() + 1);
        if let Some(fd) = srv_fd {
            entries.push(Entry { fd, retired: false });
        }
        for fd in cli_fds {
            entries.push(Entry { fd, retired: false });
        }
        Self {
            entries,
            cmsg_buffer,
        }
    }

    /// True once every watched fd has retired — the caller's cue that
    /// there is nothing left to dispatch.
    pub fn is_exhausted(&self) -> bool {
        self.entries.iter().all(|e| e.retired)
    }

    /// Waits for readability on every live fd, reads one frame from
    /// each fd that became ready, and invokes `callback(fd, opcode,
    /// payload, ancillary, context)` per frame. A zero-byte read or an
    /// `err`/`hup`/`nval` poll condition retires that fd instead of
    /// invoking the callback. Fds are scanned in ascending order; at
    /// most one frame is read per ready fd in a single call.
    pub fn dispatch<F, C>(
        &mut self,
        mut callback: F,
        context: &mut C,
        timeout_ms: Option<i32>,
    ) -> Result<DispatchOutcome>
    where
        F: FnMut(RawFd, i32, Vec<u8>, Vec<OwnedFd>, &mut C) -> Result<()>,
    {
        let timeout = to_poll_timeout(timeout_ms);
        let live: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.retired)
            .map(|(i, _)| i)
            .collect();

        if live.is_empty() {
            return Ok(DispatchOutcome::Timeout);
        }

        // `revents_by_slot` is collected into owned data and `pollfds`/
        // `borrowed` are dropped before the dispatch loop below, so that
        // loop is free to mutate `self.entries` (retiring fds) without
        // fighting the borrow checker over still-live poll borrows.
        let revents_by_slot: Vec<Option<PollFlags>> = {
            let borrowed: Vec<BorrowedFd<'_>> =
                live.iter().map(|&i| self.entries[i].fd.as_fd()).collect();
            let mut pollfds: Vec<PollFd<'_>> = borrowed
                .iter()
                .map(|fd| PollFd::new(fd.as_fd(), PollFlags::POLLIN))
                .collect();

            match poll(&mut pollfds, timeout) {
                Ok(0) => return Ok(DispatchOutcome::Timeout),
                Ok(_) => {}
                Err(_) => return Ok(DispatchOutcome::PollFailed),
            }

            pollfds.iter().map(|p| p.revents()).collect()
        };

        let mut last_processed: Option<RawFd> = None;
        for (slot, &entry_idx) in live.iter().enumerate() {
            let revents = match revents_by_slot[slot] {
                Some(r) if !r.is_empty() => r,
                _ => continue,
            };

            let raw = self.entries[entry_idx].fd.as_fd().as_raw_fd();

            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
                && !revents.contains(PollFlags::POLLIN)
            {
                self.entries[entry_idx].retired = true;
                last_processed = Some(raw);
                continue;
            }

            let fd = self.entries[entry_idx].fd.as_fd();
            match read_frame(fd, self.cmsg_buffer)? {
                ReadFrame::Eof => {
                    self.entries[entry_idx].retired = true;
                }
                ReadFrame::Frame(frame) => {
                    callback(raw, frame.opcode, frame.payload, frame.fds, context)?;
                }
            }
            last_processed = Some(raw);
        }

        Ok(last_processed.map_or(DispatchOutcome::Timeout, DispatchOutcome::Processed))
    }
}
