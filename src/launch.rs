//! The child launcher (spec §4.E): spawns a command with a specified
//! server fd at `SRV_FILENO` and a contiguous range of client fds
//! starting at `CLI_BEGIN`.

use crate::error::{Result, SrvshError};
use crate::fd_mapping::{CommandFdExt, FdMapping};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::Command;

/// Server socket fd every spawned command sees, if it has a server.
pub const SRV_FILENO: i32 = 3;
/// First client socket fd; clients occupy `CLI_BEGIN..CLI_BEGIN+N`.
pub const CLI_BEGIN: i32 = 4;
/// Env var a server process reads to discover its client fd count.
pub const CLIENTS_END_VAR: &str = "SRVSH_CLIENTS_END";

/// A freshly spawned command and, if it was launched as a client, the
/// parent's end of its server socket.
pub struct Launched {
    pub pid: i32,
    pub parent_socket: Option<UnixStream>,
}

fn new_socketpair() -> Result<(OwnedFd, OwnedFd)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    Ok((a, b))
}

/// Spawns `argv` as a standalone client: creates a fresh socket pair,
/// gives the child end to the new process at `SRV_FILENO`, and keeps
/// the other end in the parent.
pub fn launch_client(argv: &[Vec<u8>]) -> Result<Launched> {
    let (parent_end, child_end) = new_socketpair()?;
    let mut cmd = build_command(argv)?;
    cmd.fd_mappings(vec![FdMapping {
        parent_fd: child_end,
        child_fd: SRV_FILENO,
    }])
    .map_err(SrvshError::resource)?;

    let child = cmd.spawn()?;
    Ok(Launched {
        pid: child.id() as i32,
        parent_socket: Some(parent_end.into()),
    })
}

/// Spawns `argv` with a caller-chosen server fd and client fd range
/// already decided (used when forking the server command for a
/// block: its server fd is the parent-kept end of the block's own
/// socket pair, and its client fds are the sockets collected from the
/// block's enclosed commands).
pub fn launch_with_preopened(
    argv: &[Vec<u8>],
    srv_fd: Option<OwnedFd>,
    cli_fds: Vec<OwnedFd>,
) -> Result<i32> {
    let n_clients = cli_fds.len() as i32;
    let mut mappings = Vec::with_capacity(cli_fds.len() + 1);
    if let Some(srv_fd) = srv_fd {
        mappings.push(FdMapping {
            parent_fd: srv_fd,
            child_fd: SRV_FILENO,
        });
    }
    for (i, fd) in cli_fds.into_iter().enumerate() {
        mappings.push(FdMapping {
            parent_fd: fd,
            child_fd: CLI_BEGIN + i as i32,
        });
    }

    let mut cmd = build_command(argv)?;
    cmd.env(CLIENTS_END_VAR, (CLI_BEGIN + n_clients).to_string());
    cmd.fd_mappings(mappings).map_err(SrvshError::resource)?;

    let child = cmd.spawn()?;
    Ok(child.id() as i32)
}

/// Creates a fresh server/client socket pair for a block: the
/// `server_side` stays with the caller (to become the block-heading
/// command's `SRV_FILENO` via [`launch_with_preopened`] or be passed
/// onward as an outer client fd); the `client_side` is handed to
/// whichever inner command needs a server fd.
pub fn new_server_endpoint() -> Result<(OwnedFd, OwnedFd)> {
    new_socketpair()
}

fn build_command(argv: &[Vec<u8>]) -> Result<Command> {
    use std::os::unix::ffi::OsStrExt;

    let (prog, rest) = argv
        .split_first()
        .ok_or_else(|| SrvshError::parse("empty command"))?;
    let mut cmd = Command::new(std::ffi::OsStr::from_bytes(prog));
    for arg in rest {
        cmd.arg(std::ffi::OsStr::from_bytes(arg));
    }
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<Vec<u8>> {
        words.iter().map(|w| w.as_bytes().to_vec()).collect()
    }

    #[test]
    fn launch_client_gives_parent_a_socket() {
        let launched = launch_client(&argv(&["/bin/true"])).unwrap();
        assert!(launched.parent_socket.is_some());
        assert!(launched.pid > 0);
        nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(launched.pid), None).unwrap();
    }

    #[test]
    fn launch_with_preopened_sets_clients_end() {
        let (_srv_parent, srv_child) = new_server_endpoint().unwrap();
        let (_cli_parent, cli_child) = new_server_endpoint().unwrap();
        let pid = launch_with_preopened(
            &argv(&["/bin/sh", "-c", "[ \"$SRVSH_CLIENTS_END\" = 5 ]"]),
            Some(srv_child),
            vec![cli_child],
        )
        .unwrap();
        let status = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None).unwrap();
        assert!(matches!(
            status,
            nix::sys::wait::WaitStatus::Exited(_, 0)
        ));
    }
}
