//! File descriptor mapping for child process spawning (spec §4.E).
//!
//! Adapted from `conmon-rs`'s own `fd_mapping.rs`, generalized from "a
//! handful of individually named fds" to the contiguous `CLI_BEGIN..`
//! range this interpreter needs. The dup2/fcntl dance is unchanged:
//! every fd this crate creates for IPC is opened `SOCK_CLOEXEC`, so a
//! plain `execve` already closes everything we didn't explicitly wire
//! up — the mappings below only need to place the *intended* fds at
//! their final numbers and clear `FD_CLOEXEC` on those.

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::dup2;
use std::cmp::max;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Command;

/// A mapping from a file descriptor in the parent to a file
/// descriptor the child must see at a fixed number.
#[derive(Debug)]
pub struct FdMapping {
    pub parent_fd: OwnedFd,
    pub child_fd: RawFd,
}

/// Extension trait adding file descriptor mappings to a [`Command`].
pub trait CommandFdExt {
    fn fd_mappings(&mut self, mappings: Vec<FdMapping>) -> Result<&mut Self, FdMappingCollision>;
}

/// Error when two or more mappings target the same child fd.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FdMappingCollision;

impl fmt::Display for FdMappingCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "two or more mappings target the same child fd")
    }
}

impl std::error::Error for FdMappingCollision {}

impl CommandFdExt for Command {
    fn fd_mappings(
        &mut self,
        mut mappings: Vec<FdMapping>,
    ) -> Result<&mut Self, FdMappingCollision> {
        let child_fds = validate_child_fds(&mappings)?;

        // Safety: `map_fds` only calls async-signal-safe functions
        // (dup2, fcntl) and performs no allocation, so it is sound to
        // run between fork and exec.
        unsafe {
            self.pre_exec(move || map_fds(&mut mappings, &child_fds));
        }

        Ok(self)
    }
}

fn validate_child_fds(mappings: &[FdMapping]) -> Result<Vec<RawFd>, FdMappingCollision> {
    let mut child_fds: Vec<RawFd> = mappings.iter().map(|m| m.child_fd).collect();
    child_fds.sort_unstable();
    child_fds.dedup();
    if child_fds.len() != mappings.len() {
        return Err(FdMappingCollision);
    }
    Ok(child_fds)
}

/// Applies `mappings` directly in the calling process: dup2/fcntl each
/// parent fd onto its target child fd number. Used outside the
/// `Command`/`pre_exec` path by `parser`'s block-head fork, where the
/// child must run further Rust-level logic (recurse into the block
/// body) before its own `execvp`, so the mapping can't be deferred to
/// a `pre_exec` closure the way [`CommandFdExt::fd_mappings`] does it.
pub fn apply_fd_mappings(mut mappings: Vec<FdMapping>) -> std::io::Result<()> {
    let child_fds = validate_child_fds(&mappings)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    map_fds(&mut mappings, &child_fds)
}

// Must not allocate: runs in the child between fork and exec.
fn map_fds(mappings: &mut [FdMapping], child_fds: &[RawFd]) -> std::io::Result<()> {
    if mappings.is_empty() {
        return Ok(());
    }

    // Move any parent_fd that collides with a *target* child_fd out
    // of the way first, so later dup2 calls don't clobber an
    // not-yet-placed source.
    let first_safe_fd = mappings
        .iter()
        .map(|m| max(m.parent_fd.as_raw_fd(), m.child_fd))
        .max()
        .expect("mappings is non-empty")
        + 1;

    for mapping in mappings.iter_mut() {
        if child_fds.contains(&mapping.parent_fd.as_raw_fd())
            && mapping.parent_fd.as_raw_fd() != mapping.child_fd
        {
            let moved = fcntl(&mapping.parent_fd, FcntlArg::F_DUPFD_CLOEXEC(first_safe_fd))
                .map_err(std::io::Error::from)?;
            // Safety: `moved` is a fresh fd owned by this process.
            mapping.parent_fd = unsafe { OwnedFd::from_raw_fd(moved) };
        }
    }

    for mapping in mappings.iter() {
        if mapping.child_fd == mapping.parent_fd.as_raw_fd() {
            fcntl(&mapping.parent_fd, FcntlArg::F_SETFD(FdFlag::empty()))
                .map_err(std::io::Error::from)?;
        } else {
            dup2(mapping.parent_fd.as_raw_fd(), mapping.child_fd).map_err(std::io::Error::from)?;
        }
    }

    Ok(())
}

use std::os::fd::FromRawFd;
use std::os::unix::process::CommandExt;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::io::Write;

    #[test]
    fn collision_is_rejected() {
        let (a, _b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let (c, _d) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let mappings = vec![
            FdMapping {
                parent_fd: a,
                child_fd: 10,
            },
            FdMapping {
                parent_fd: c,
                child_fd: 10,
            },
        ];
        let mut cmd = Command::new("/bin/true");
        assert!(cmd.fd_mappings(mappings).is_err());
    }

    #[test]
    fn spawned_child_sees_mapped_fd() {
        use std::io::Read;
        use std::os::unix::net::UnixStream;

        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let mut reader: UnixStream = b.into();

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("printf hi >&4");
        cmd.fd_mappings(vec![FdMapping {
            parent_fd: a,
            child_fd: 4,
        }])
        .unwrap();
        let mut child = cmd.spawn().unwrap();
        child.wait().unwrap();

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }
}
