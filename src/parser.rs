//! The parser/executor (spec §4.F) — the core of the interpreter. A
//! tokenizer-driven state machine that is simultaneously an execution
//! engine: it spawns processes as it walks the token stream instead of
//! building an AST.
//!
//! Grounded operationally on `examples/original_source/src/parse.c`'s
//! `parse_statement_impl`/`parse_script_impl`/`skip_context` recursion,
//! reworked per the redesign note into an explicit per-statement state
//! machine over an owned `Vec<Vec<u8>>` word accumulator instead of a
//! recursive linked word-list, with a plain `Result` replacing sentinel
//! token values for error propagation.

use crate::error::{Result, SrvshError};
use crate::fd_mapping::{apply_fd_mappings, FdMapping};
use crate::launch::{launch_client, new_server_endpoint, CLIENTS_END_VAR, CLI_BEGIN, SRV_FILENO};
use crate::lexer::{Lexer, TokenKind};
use nix::unistd::{execvp, fork, ForkResult};
use std::ffi::CString;
use std::os::fd::OwnedFd;
use tracing::debug_span;

/// How a single `parse_script` invocation's token run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    /// Hit a `curly_close` that belongs to this invocation.
    ClosedBrace,
    /// Hit `end` — only expected from the top-level entrypoint.
    Eof,
}

/// What one `parse_script` invocation produced: for each command it
/// directly spawned (via a leaf client launch or a block-head fork),
/// the parent-kept end of its server socket — destined either to
/// become this process's own `CLI_BEGIN..` range (if this invocation
/// is a block body about to self-exec as the server) or to be
/// discarded (if this invocation is the top-level script, which has no
/// server role of its own).
///
/// Spawned pids themselves are *not* carried here: they are
/// accumulated into an out-param threaded through the whole recursion
/// instead (see `parse_script`'s `pids` argument), so that a pid is
/// never lost to an error-path `?` the way it would be if it only
/// lived inside a struct returned on the `Ok` path.
struct ScriptResult {
    cli_fds: Vec<OwnedFd>,
    terminator: Terminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Collecting,
}

/// Per-statement state machine of spec §4.F's table. Consumes tokens
/// from `lex` until it sees the `curly_close` that closes this
/// invocation's own block (if any) or `end` (top level only).
///
/// `pids` accumulates every pid this invocation (and anything it
/// recurses into) directly spawns, regardless of whether this call
/// ultimately returns `Ok` or `Err` — a mutable out-param rather than
/// part of `ScriptResult`, precisely so that an error raised by a
/// later sibling or nested block doesn't erase the record of
/// processes already spawned by earlier ones.
fn parse_script(lex: &mut Lexer<'_>, depth: u32, pids: &mut Vec<i32>) -> Result<ScriptResult> {
    let _span = debug_span!("block", depth).entered();

    let mut state = State::Idle;
    let mut words: Vec<Vec<u8>> = Vec::new();
    let mut cli_fds: Vec<OwnedFd> = Vec::new();

    loop {
        let tok = lex.next();
        match (state, tok.kind) {
            (State::Idle, TokenKind::WordSeparator | TokenKind::StatementSeparator) => {}

            (State::Idle, TokenKind::Word) => {
                words.push(lex.normalize(tok));
                state = State::Collecting;
            }

            (State::Idle, TokenKind::CurlyOpen) => {
                // Bare braces (rule 3): the body is evaluated in place,
                // at this same depth's server context, with no head
                // command — the braces group but don't designate a
                // server.
                let inner = parse_script(lex, depth + 1, pids)?;
                if inner.terminator != Terminator::ClosedBrace {
                    return Err(SrvshError::parse("unterminated bare block"));
                }
                cli_fds.extend(inner.cli_fds);
            }

            (State::Idle, TokenKind::CurlyClose) => {
                return Ok(ScriptResult {
                    cli_fds,
                    terminator: Terminator::ClosedBrace,
                });
            }

            (State::Idle, TokenKind::End) => {
                return Ok(ScriptResult {
                    cli_fds,
                    terminator: Terminator::Eof,
                });
            }

            (State::Idle, _) => {
                return Err(SrvshError::parse("unexpected token"));
            }

            (State::Collecting, TokenKind::WordSeparator) => {}

            (State::Collecting, TokenKind::Word) => {
                words.push(lex.normalize(tok));
            }

            (State::Collecting, TokenKind::StatementSeparator) => {
                let launched = launch_client(&words)?;
                pids.push(launched.pid);
                if let Some(sock) = launched.parent_socket {
                    cli_fds.push(OwnedFd::from(sock));
                }
                words = Vec::new();
                state = State::Idle;
            }

            (State::Collecting, TokenKind::CurlyOpen) => {
                let head_argv = std::mem::take(&mut words);
                spawn_block_head(lex, head_argv, depth, pids, &mut cli_fds)?;
                state = State::Idle;
            }

            // curly_close / end / unexpected / square_* while mid-statement:
            // the table's "fail / terminate" cell.
            (State::Collecting, _) => {
                return Err(SrvshError::parse("unterminated statement"));
            }
        }
    }
}

/// Implements interpretation rule 2: the just-collected `head_argv`
/// heads a block. Creates the block's `ServerEndpoint`, forks, and:
/// in the parent, keeps `server_side` (to surface as one of our own
/// client fds, if we ourselves are mid-build for a self-exec) and
/// skips the block's tokens without executing them; in the child,
/// hands control to [`run_block_head`], which recurses into the
/// block's body before finally `exec`ing `head_argv`.
fn spawn_block_head(
    lex: &mut Lexer<'_>,
    head_argv: Vec<Vec<u8>>,
    depth: u32,
    pids: &mut Vec<i32>,
    cli_fds: &mut Vec<OwnedFd>,
) -> Result<()> {
    let (server_side, client_side) = new_server_endpoint()?;

    // Safety: the interpreter is single-threaded for the whole of a
    // parse (it spawns no Rust threads of its own), so this fork
    // carries none of the multi-threaded-fork hazards `fork` is
    // otherwise unsafe for.
    match unsafe { fork() }? {
        ForkResult::Parent { child, .. } => {
            drop(client_side);
            pids.push(child.as_raw());
            cli_fds.push(server_side);
            skip_block(lex)?;
            Ok(())
        }
        ForkResult::Child => {
            drop(server_side);
            // `run_block_head` only returns on failure — success
            // replaces this process image via `execvp`.
            let outcome = run_block_head(lex, head_argv, client_side, depth);
            exit_after_failure(outcome)
        }
    }
}

/// Runs in the forked block-head process, before it becomes the block
/// head's own executable: recurses into the block's body (spawning
/// each enclosed command as our client), wires the collected client
/// fds onto `CLI_BEGIN..` plus `srv_fd` onto `SRV_FILENO`, and execs.
fn run_block_head(
    lex: &mut Lexer<'_>,
    head_argv: Vec<Vec<u8>>,
    srv_fd: OwnedFd,
    depth: u32,
) -> Result<()> {
    // This process is about to exec and become the block's head
    // command; it never reaps its own children itself (spec §4.G only
    // has the *root* interpreter reap its *direct* children), so the
    // pids its body spawns are collected only to satisfy
    // `parse_script`'s signature and are intentionally dropped here.
    let mut body_pids = Vec::new();
    let body = parse_script(lex, depth + 1, &mut body_pids)?;
    if body.terminator != Terminator::ClosedBrace {
        return Err(SrvshError::parse("unterminated block"));
    }

    let n_clients = body.cli_fds.len() as i32;
    let mut mappings = Vec::with_capacity(body.cli_fds.len() + 1);
    mappings.push(FdMapping {
        parent_fd: srv_fd,
        child_fd: SRV_FILENO,
    });
    for (i, fd) in body.cli_fds.into_iter().enumerate() {
        mappings.push(FdMapping {
            parent_fd: fd,
            child_fd: CLI_BEGIN + i as i32,
        });
    }
    apply_fd_mappings(mappings).map_err(SrvshError::Io)?;

    // Safety: this process is still single-threaded and about to
    // exec, so no other thread can observe a torn environment.
    unsafe {
        std::env::set_var(CLIENTS_END_VAR, (CLI_BEGIN + n_clients).to_string());
    }

    exec_argv(&head_argv)
}

/// Replaces the current process image with `argv[0]`, PATH-searched.
/// Only returns on failure — a successful `execvp` never returns.
fn exec_argv(argv: &[Vec<u8>]) -> Result<()> {
    let (prog, _) = argv
        .split_first()
        .ok_or_else(|| SrvshError::parse("empty command"))?;
    let prog_c = CString::new(prog.clone()).map_err(SrvshError::resource)?;
    let args_c = argv
        .iter()
        .map(|a| CString::new(a.clone()).map_err(SrvshError::resource))
        .collect::<Result<Vec<_>>>()?;

    match execvp(&prog_c, &args_c) {
        Ok(_) => unreachable!("execvp does not return on success"),
        Err(e) => Err(SrvshError::from(e)),
    }
}

fn exit_after_failure(outcome: Result<()>) -> ! {
    if let Err(e) = outcome {
        eprintln!("srvsh: {e}");
    }
    std::process::exit(1);
}

/// Advances `lex` past a block's tokens without interpreting them
/// (spec §4.F "Skipping executed regions"): a balanced-brace count
/// over `curly_open`/`curly_close` only — every other token is
/// skipped textually.
fn skip_block(lex: &mut Lexer<'_>) -> Result<()> {
    let mut depth = 1i32;
    loop {
        match lex.next().kind {
            TokenKind::CurlyOpen => depth += 1,
            TokenKind::CurlyClose => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            TokenKind::End => return Err(SrvshError::parse("unbalanced braces")),
            _ => {}
        }
    }
}

/// Parses and executes `src` as a complete top-level script: the
/// entrypoint's call into `F` (spec §2). Always returns the pids the
/// root process directly spawned — even when the parse itself fails
/// partway through — alongside the parse outcome, so the caller can
/// reap (`G`) every process that was actually forked instead of
/// leaking whatever ran before the failure.
pub fn interpret(src: &[u8]) -> (Result<()>, Vec<i32>) {
    let mut lex = Lexer::new(src);
    let mut pids = Vec::new();
    let outcome = parse_script(&mut lex, 0, &mut pids).and_then(|result| {
        // No server is active above the root: any cli_fds collected
        // here belong to nobody and are simply closed.
        drop(result.cli_fds);
        if result.terminator != Terminator::Eof {
            return Err(SrvshError::parse("unmatched '}'"));
        }
        Ok(())
    });
    (outcome, pids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::reap_all;

    #[test]
    fn single_command_runs_and_exits_zero() {
        let (outcome, pids) = interpret(b"true;");
        outcome.unwrap();
        assert_eq!(pids.len(), 1);
        assert_eq!(reap_all(&pids).unwrap(), 0);
    }

    #[test]
    fn two_siblings_both_run() {
        let (outcome, pids) = interpret(b"true; false;");
        outcome.unwrap();
        assert_eq!(pids.len(), 2);
        assert_eq!(reap_all(&pids).unwrap(), 1);
    }

    #[test]
    fn bare_braces_are_transparent() {
        let (outcome, pids) = interpret(b"{ true; }");
        outcome.unwrap();
        assert_eq!(reap_all(&pids).unwrap(), 0);
    }

    #[test]
    fn unterminated_statement_is_a_parse_error() {
        let (outcome, _pids) = interpret(b"echo }");
        assert!(outcome.is_err());
    }

    #[test]
    fn unbalanced_brace_is_a_parse_error() {
        let (outcome, _pids) = interpret(b"server { a;");
        assert!(outcome.is_err());
    }

    #[test]
    fn block_with_server_sets_clients_end() {
        let script = br#"
            sh -c 'test "$SRVSH_CLIENTS_END" = 6' {
                true;
                true;
            }
        "#;
        let (outcome, pids) = interpret(script);
        outcome.unwrap();
        assert_eq!(pids.len(), 1);
        assert_eq!(reap_all(&pids).unwrap(), 0);
    }

    /// The bug this shape guards against: a sibling spawned before a
    /// later parse failure must still come back out of `interpret` so
    /// it can be reaped, instead of being dropped along with the `Err`
    /// path's discarded `ScriptResult`.
    #[test]
    fn pids_spawned_before_a_later_parse_error_are_still_returned() {
        let (outcome, pids) = interpret(b"true; }");
        assert!(outcome.is_err());
        assert_eq!(pids.len(), 1);
        assert_eq!(reap_all(&pids).unwrap(), 0);
    }
}
